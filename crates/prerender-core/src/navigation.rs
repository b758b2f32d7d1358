//! Navigation-side value types: requests, parameters, callbacks and errors.
//!
//! These model what the loading pipeline tells the engine about a
//! navigation. The engine never performs a fetch itself.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::attributes::{Origin, PageTransition, Referrer, SpeculationAttributes, TriggerType, Url};
use crate::status::FinalStatus;

// =============================================================================
// Identifiers
// =============================================================================

/// Identity of one navigation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NavigationId(pub u64);

impl fmt::Display for NavigationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nav-{}", self.0)
    }
}

/// Identity of a document frame that initiated a navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FrameToken(pub u64);

// =============================================================================
// Headers
// =============================================================================

/// Request header set with case-insensitive names.
///
/// Names are stored lowercased; repeated names are folded into one
/// comma-separated value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: BTreeMap<String, String>,
}

impl Headers {
    /// Marks a request as speculative; never compared during activation.
    pub const PURPOSE: &'static str = "purpose";
    /// Standardized form of [`Self::PURPOSE`].
    pub const SEC_PURPOSE: &'static str = "sec-purpose";
    /// Sec-Purpose value sent on speculative document requests.
    pub const SPECULATIVE_PURPOSE: &'static str = "prefetch;prerender";

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `Name: value` lines separated by `\n` or `\r\n`. Lines without
    /// a colon are skipped.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let mut headers = Self::new();
        for line in raw.lines() {
            if let Some((name, value)) = line.split_once(':') {
                if !name.trim().is_empty() {
                    headers.append(name, value);
                }
            }
        }
        headers
    }

    /// Set a header, replacing any previous value.
    pub fn insert(&mut self, name: &str, value: &str) {
        self.entries
            .insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    /// Add a value, folding into an existing header of the same name.
    pub fn append(&mut self, name: &str, value: &str) {
        let value = value.trim();
        self.entries
            .entry(name.trim().to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    #[must_use]
    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.insert(name, value);
        self
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.entries.remove(&name.to_ascii_lowercase())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy without `Purpose` / `Sec-Purpose`.
    #[must_use]
    pub fn without_transport_markers(&self) -> Self {
        let mut copy = self.clone();
        copy.entries.remove(Self::PURPOSE);
        copy.entries.remove(Self::SEC_PURPOSE);
        copy
    }
}

// =============================================================================
// Flag sets
// =============================================================================

bitflags::bitflags! {
    /// Network load flags attached to a request.
    #[derive(Default)]
    pub struct LoadFlags: u32 {
        const VALIDATE_CACHE = 1 << 0;
        const BYPASS_CACHE = 1 << 1;
        const SKIP_CACHE_VALIDATION = 1 << 2;
        const ONLY_FROM_CACHE = 1 << 3;
        const DISABLE_CACHE = 1 << 4;
        const PREFETCH = 1 << 5;
        const DISABLE_CERT_NETWORK_FETCHES = 1 << 6;
    }
}

impl LoadFlags {
    /// Flags that change cache semantics and therefore must match on
    /// activation.
    pub const CACHE_MASK: Self = Self::from_bits_truncate(
        Self::VALIDATE_CACHE.bits()
            | Self::BYPASS_CACHE.bits()
            | Self::SKIP_CACHE_VALIDATION.bits()
            | Self::ONLY_FROM_CACHE.bits()
            | Self::DISABLE_CACHE.bits(),
    );

    #[must_use]
    pub fn cache_flags(self) -> Self {
        self & Self::CACHE_MASK
    }
}

bitflags::bitflags! {
    /// Sandbox restrictions applied to a frame.
    #[derive(Default)]
    pub struct SandboxFlags: u32 {
        const NAVIGATION = 1 << 0;
        const PLUGINS = 1 << 1;
        const ORIGIN = 1 << 2;
        const FORMS = 1 << 3;
        const SCRIPTS = 1 << 4;
        const TOP_NAVIGATION = 1 << 5;
        const POPUPS = 1 << 6;
        const AUTOMATIC_FEATURES = 1 << 7;
        const POINTER_LOCK = 1 << 8;
        const DOCUMENT_DOMAIN = 1 << 9;
        const MODALS = 1 << 10;
        const PRESENTATION = 1 << 11;
        const DOWNLOADS = 1 << 12;
    }
}

/// Committed sandbox flags of a root frame plus any update that has been
/// requested but not yet committed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SandboxPolicy {
    pub committed: SandboxFlags,
    pub pending: Option<SandboxFlags>,
}

impl SandboxPolicy {
    #[must_use]
    pub const fn committed(flags: SandboxFlags) -> Self {
        Self {
            committed: flags,
            pending: None,
        }
    }

    /// Exact equality with no pending update on either side.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        self.pending.is_none() && other.pending.is_none() && self.committed == other.committed
    }
}

// =============================================================================
// Request classification
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MixedContentContext {
    #[default]
    Blockable,
    OptionallyBlockable,
    ShouldBeBlockable,
    NotMixedContent,
}

/// Fine-grained request context reported by the loader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestContextType {
    #[default]
    Unspecified,
    Hyperlink,
    Location,
    Form,
    Frame,
    Iframe,
    Internal,
    Fetch,
    Script,
}

/// Coarse class a [`RequestContextType`] collapses to for activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestContextClass {
    Navigation,
    Form,
    Subframe,
    Other,
}

impl RequestContextType {
    /// Link clicks, location changes and unspecified top-level navigations
    /// are interchangeable.
    #[must_use]
    pub const fn coarse(self) -> RequestContextClass {
        match self {
            Self::Unspecified | Self::Hyperlink | Self::Location | Self::Internal => {
                RequestContextClass::Navigation
            }
            Self::Form => RequestContextClass::Form,
            Self::Frame | Self::Iframe => RequestContextClass::Subframe,
            Self::Fetch | Self::Script => RequestContextClass::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestDestination {
    #[default]
    Document,
    Iframe,
    Frame,
    FencedFrame,
    Empty,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavigationType {
    #[default]
    DifferentDocument,
    Reload,
    ReloadOriginalRequestUrl,
    Restore,
    HistoryDifferentDocument,
    SameDocument,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrustTokenParams {
    pub operation: String,
    pub issuers: Vec<String>,
}

/// Attribution impression attached to a navigation. Only presence matters
/// for activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Impression {
    pub attribution_src_token: u64,
}

// =============================================================================
// Navigation parameters
// =============================================================================

/// Parameters of one navigation, compared field by field on activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationParams {
    pub initiator_frame: Option<FrameToken>,
    pub headers: Headers,
    pub load_flags: LoadFlags,
    pub skip_service_worker: bool,
    pub mixed_content_context: MixedContentContext,
    pub is_form_submission: bool,
    pub searchable_form_url: Option<Url>,
    pub searchable_form_encoding: Option<String>,
    pub trust_token_params: Option<TrustTokenParams>,
    pub request_context_type: RequestContextType,
    pub impression: Option<Impression>,
    pub request_destination: RequestDestination,
    pub initiator_origin: Option<Origin>,
    pub transition: PageTransition,
    pub navigation_type: NavigationType,
    pub base_url_for_data_url: Option<Url>,
    pub method: String,
    pub post_body: Option<Vec<u8>>,
    pub started_from_context_menu: bool,
    pub origin_trial_features: Vec<u32>,
    pub href_translate: Option<String>,
    pub is_history_navigation_in_new_child_frame: bool,
}

impl Default for NavigationParams {
    fn default() -> Self {
        Self {
            initiator_frame: None,
            headers: Headers::new(),
            load_flags: LoadFlags::empty(),
            skip_service_worker: false,
            mixed_content_context: MixedContentContext::default(),
            is_form_submission: false,
            searchable_form_url: None,
            searchable_form_encoding: None,
            trust_token_params: None,
            request_context_type: RequestContextType::default(),
            impression: None,
            request_destination: RequestDestination::default(),
            initiator_origin: None,
            transition: PageTransition::LINK,
            navigation_type: NavigationType::default(),
            base_url_for_data_url: None,
            method: "GET".to_string(),
            post_body: None,
            started_from_context_menu: false,
            origin_trial_features: Vec::new(),
            href_translate: None,
            is_history_navigation_in_new_child_frame: false,
        }
    }
}

impl NavigationParams {
    /// Parameters recorded when the initial navigation died before the gate
    /// saw it. The empty method guarantees they never match a real
    /// navigation.
    #[must_use]
    pub fn fallback() -> Self {
        Self {
            method: String::new(),
            request_destination: RequestDestination::Empty,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_fallback(&self) -> bool {
        self.method.is_empty()
    }
}

/// Request the host hands to the loader for the initial navigation.
#[derive(Debug, Clone)]
pub struct NavigationRequest {
    pub url: Url,
    pub initiator_origin: Option<Origin>,
    pub initiator_frame: Option<FrameToken>,
    pub referrer: Referrer,
    pub transition: PageTransition,
    pub headers: Headers,
    pub load_flags: LoadFlags,
    pub request_context_type: RequestContextType,
}

impl NavigationRequest {
    #[must_use]
    pub fn for_speculation(attrs: &SpeculationAttributes) -> Self {
        let request_context_type = match attrs.trigger_type {
            TriggerType::SpeculationRule => RequestContextType::Hyperlink,
            TriggerType::Embedder => RequestContextType::Location,
        };
        Self {
            url: attrs.url.clone(),
            initiator_origin: attrs.initiator_origin.clone(),
            initiator_frame: attrs.initiator_frame,
            referrer: attrs.referrer.clone(),
            transition: attrs.transition,
            headers: Headers::new().with(Headers::SEC_PURPOSE, Headers::SPECULATIVE_PURPOSE),
            load_flags: LoadFlags::empty(),
            request_context_type,
        }
    }

    /// Parameters a loader would report for this request as issued.
    #[must_use]
    pub fn params(&self) -> NavigationParams {
        NavigationParams {
            initiator_frame: self.initiator_frame,
            headers: self.headers.clone(),
            load_flags: self.load_flags,
            request_context_type: self.request_context_type,
            initiator_origin: self.initiator_origin.clone(),
            transition: self.transition,
            ..NavigationParams::default()
        }
    }
}

// =============================================================================
// Loader callbacks
// =============================================================================

/// Result of asking the loader to begin a navigation.
#[derive(Debug, Clone)]
pub enum NavigationStart {
    /// A navigation object exists; its parameters are final.
    Started {
        navigation: NavigationId,
        params: NavigationParams,
    },
    /// The navigation was created but died in a pre-flight check.
    FailedBeforeStart(NetError),
    /// No navigation could begin.
    NotStarted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectInfo {
    pub url: Url,
    pub status: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseInfo {
    pub status: u16,
    pub headers: Headers,
    pub is_download: bool,
}

impl ResponseInfo {
    pub const SUPPORTS_LOADING_MODE: &'static str = "supports-loading-mode";
    pub const CREDENTIALED_PRERENDER: &'static str = "credentialed-prerender";

    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: 200,
            headers: Headers::new(),
            is_download: false,
        }
    }

    /// Whether the response opts in to same-site cross-origin speculation.
    #[must_use]
    pub fn opts_in_to_credentialed_prerender(&self) -> bool {
        self.headers
            .get(Self::SUPPORTS_LOADING_MODE)
            .is_some_and(|v| {
                v.split(|c: char| c == ',' || c.is_ascii_whitespace())
                    .any(|token| token.eq_ignore_ascii_case(Self::CREDENTIALED_PRERENDER))
            })
    }

    /// 2xx except "no content" responses.
    #[must_use]
    pub const fn has_activatable_status(&self) -> bool {
        matches!(self.status, 200..=299) && !matches!(self.status, 204 | 205)
    }
}

/// Network-level failure of a navigation or resource load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetError {
    Aborted,
    BlockedByCsp,
    BlockedByClient,
    CertificateError,
    ClientCertificateNeeded,
    AuthRequired,
    ConnectionFailed,
    NameNotResolved,
    Other(i32),
}

impl NetError {
    /// Terminal status for a root-document failure with this error.
    #[must_use]
    pub const fn final_status(self) -> FinalStatus {
        match self {
            Self::BlockedByCsp => FinalStatus::NavigationRequestBlockedByCsp,
            Self::BlockedByClient => FinalStatus::BlockedByClient,
            Self::Aborted => FinalStatus::Stop,
            Self::CertificateError => FinalStatus::SslCertificateError,
            Self::ClientCertificateNeeded => FinalStatus::ClientCertRequested,
            Self::AuthRequired => FinalStatus::LoginAuthRequested,
            Self::ConnectionFailed | Self::NameNotResolved | Self::Other(_) => {
                FinalStatus::NavigationRequestNetworkError
            }
        }
    }
}

/// How the root navigation finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationOutcome {
    Committed,
    Failed(NetError),
    NotCommitted,
}

/// A real navigation looking for a session to activate.
#[derive(Debug, Clone)]
pub struct ActivationNavigation {
    pub url: Url,
    pub params: NavigationParams,
    pub is_primary_main_frame: bool,
    /// True when the navigation itself runs inside a speculative tree.
    pub is_speculative: bool,
    /// Other live top-level contexts in the same browsing-context group.
    pub auxiliary_contexts: usize,
    pub destination_sandbox: SandboxPolicy,
}

impl ActivationNavigation {
    /// Primary main-frame navigation with no auxiliary contexts.
    #[must_use]
    pub fn primary(url: Url, params: NavigationParams) -> Self {
        Self {
            url,
            params,
            is_primary_main_frame: true,
            is_speculative: false,
            auxiliary_contexts: 0,
            destination_sandbox: SandboxPolicy::default(),
        }
    }
}
