//! Activation parameter matching.
//!
//! A navigation may only consume a prepared session when every parameter
//! that influences security or cache semantics equals what the session was
//! loaded with. Fields are compared in a fixed order, transport-level first,
//! and only the first difference is reported.

use serde::{Deserialize, Serialize};

use crate::attributes::TriggerType;
use crate::metrics::SpeculationMetrics;
use crate::navigation::NavigationParams;

/// Group a mismatching field belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchGroup {
    Transport,
    Semantic,
}

/// First parameter that differs between the initial and candidate
/// navigation. Declaration order is comparison order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationMismatch {
    // transport
    /// Different initiating frame.
    InitiatorFrameToken,
    /// Request headers differ once `Purpose` and `Sec-Purpose` are removed.
    Headers,
    /// Cache-affecting load flags differ. Other flags are ignored.
    LoadFlags,
    SkipServiceWorker,
    /// Mixed-content checking context.
    MixedContentContext,
    IsFormSubmission,
    /// URL of a searchable form that started the navigation.
    SearchableFormUrl,
    /// Character encoding of that searchable form.
    SearchableFormEncoding,
    TrustTokenParams,
    /// Request context types in different classes. Link clicks, location
    /// changes and unspecified navigations count as one class.
    RequestContextType,
    /// Only one side carries an attribution impression.
    Impression,
    RequestDestination,
    // semantic
    /// Origin that initiated the navigation, or its absence.
    InitiatorOrigin,
    /// Page transition, qualifiers included.
    Transition,
    NavigationType,
    /// Base URL used to resolve a `data:` URL.
    BaseUrlForDataUrl,
    /// HTTP method. The fallback parameters' empty method never matches.
    Method,
    PostBody,
    StartedFromContextMenu,
    /// Enabled origin trial feature set.
    OriginTrialFeatures,
    /// `hreftranslate` attribute of the initiating link.
    HrefTranslate,
    IsHistoryNavigationInNewChildFrame,
}

impl ActivationMismatch {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InitiatorFrameToken => "initiator_frame_token",
            Self::Headers => "headers",
            Self::LoadFlags => "load_flags",
            Self::SkipServiceWorker => "skip_service_worker",
            Self::MixedContentContext => "mixed_content_context",
            Self::IsFormSubmission => "is_form_submission",
            Self::SearchableFormUrl => "searchable_form_url",
            Self::SearchableFormEncoding => "searchable_form_encoding",
            Self::TrustTokenParams => "trust_token_params",
            Self::RequestContextType => "request_context_type",
            Self::Impression => "impression",
            Self::RequestDestination => "request_destination",
            Self::InitiatorOrigin => "initiator_origin",
            Self::Transition => "transition",
            Self::NavigationType => "navigation_type",
            Self::BaseUrlForDataUrl => "base_url_for_data_url",
            Self::Method => "method",
            Self::PostBody => "post_body",
            Self::StartedFromContextMenu => "started_from_context_menu",
            Self::OriginTrialFeatures => "origin_trial_features",
            Self::HrefTranslate => "href_translate",
            Self::IsHistoryNavigationInNewChildFrame => "is_history_navigation_in_new_child_frame",
        }
    }

    #[must_use]
    pub const fn group(self) -> MismatchGroup {
        match self {
            Self::InitiatorFrameToken
            | Self::Headers
            | Self::LoadFlags
            | Self::SkipServiceWorker
            | Self::MixedContentContext
            | Self::IsFormSubmission
            | Self::SearchableFormUrl
            | Self::SearchableFormEncoding
            | Self::TrustTokenParams
            | Self::RequestContextType
            | Self::Impression
            | Self::RequestDestination => MismatchGroup::Transport,
            _ => MismatchGroup::Semantic,
        }
    }
}

impl std::fmt::Display for ActivationMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "activation parameter mismatch: {}", self.as_str())
    }
}

impl std::error::Error for ActivationMismatch {}

fn same<T: PartialEq + ?Sized>(
    initial: &T,
    candidate: &T,
    reason: ActivationMismatch,
) -> Result<(), ActivationMismatch> {
    if initial == candidate {
        Ok(())
    } else {
        Err(reason)
    }
}

/// Stateless comparison of navigation parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActivationMatcher;

impl ActivationMatcher {
    /// Compare `candidate` against the parameters the session was loaded
    /// with.
    pub fn check(
        initial: &NavigationParams,
        candidate: &NavigationParams,
    ) -> Result<(), ActivationMismatch> {
        Self::check_transport(initial, candidate)?;
        Self::check_semantic(initial, candidate)
    }

    fn check_transport(
        initial: &NavigationParams,
        candidate: &NavigationParams,
    ) -> Result<(), ActivationMismatch> {
        use ActivationMismatch as M;

        same(&initial.initiator_frame, &candidate.initiator_frame, M::InitiatorFrameToken)?;
        same(
            &initial.headers.without_transport_markers(),
            &candidate.headers.without_transport_markers(),
            M::Headers,
        )?;
        same(
            &initial.load_flags.cache_flags(),
            &candidate.load_flags.cache_flags(),
            M::LoadFlags,
        )?;
        same(&initial.skip_service_worker, &candidate.skip_service_worker, M::SkipServiceWorker)?;
        same(
            &initial.mixed_content_context,
            &candidate.mixed_content_context,
            M::MixedContentContext,
        )?;
        same(&initial.is_form_submission, &candidate.is_form_submission, M::IsFormSubmission)?;
        same(&initial.searchable_form_url, &candidate.searchable_form_url, M::SearchableFormUrl)?;
        same(
            &initial.searchable_form_encoding,
            &candidate.searchable_form_encoding,
            M::SearchableFormEncoding,
        )?;
        same(&initial.trust_token_params, &candidate.trust_token_params, M::TrustTokenParams)?;
        same(
            &initial.request_context_type.coarse(),
            &candidate.request_context_type.coarse(),
            M::RequestContextType,
        )?;
        same(&initial.impression.is_some(), &candidate.impression.is_some(), M::Impression)?;
        same(&initial.request_destination, &candidate.request_destination, M::RequestDestination)
    }

    fn check_semantic(
        initial: &NavigationParams,
        candidate: &NavigationParams,
    ) -> Result<(), ActivationMismatch> {
        use ActivationMismatch as M;

        same(&initial.initiator_origin, &candidate.initiator_origin, M::InitiatorOrigin)?;
        same(&initial.transition, &candidate.transition, M::Transition)?;
        same(&initial.navigation_type, &candidate.navigation_type, M::NavigationType)?;
        same(
            &initial.base_url_for_data_url,
            &candidate.base_url_for_data_url,
            M::BaseUrlForDataUrl,
        )?;
        same(initial.method.as_str(), candidate.method.as_str(), M::Method)?;
        same(&initial.post_body, &candidate.post_body, M::PostBody)?;
        same(
            &initial.started_from_context_menu,
            &candidate.started_from_context_menu,
            M::StartedFromContextMenu,
        )?;
        same(
            &initial.origin_trial_features,
            &candidate.origin_trial_features,
            M::OriginTrialFeatures,
        )?;
        same(&initial.href_translate, &candidate.href_translate, M::HrefTranslate)?;
        same(
            &initial.is_history_navigation_in_new_child_frame,
            &candidate.is_history_navigation_in_new_child_frame,
            M::IsHistoryNavigationInNewChildFrame,
        )
    }

    /// [`check`](Self::check), reporting the result (success included).
    pub fn evaluate(
        trigger: TriggerType,
        histogram_suffix: &str,
        initial: &NavigationParams,
        candidate: &NavigationParams,
        metrics: &dyn SpeculationMetrics,
    ) -> Result<(), ActivationMismatch> {
        let result = Self::check(initial, candidate);
        metrics.record_activation_match(trigger, histogram_suffix, result);
        result
    }
}
