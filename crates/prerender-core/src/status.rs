//! Terminal statuses, admission rejections and preloading-attempt outcomes.
//!
//! Two closed enumerations describe why a speculation did not end up serving
//! a navigation:
//!
//! - [`RejectReason`]: returned synchronously by admission control. No host
//!   is created, so no lifecycle transition happens.
//! - [`FinalStatus`]: the write-once terminal status of a host that did
//!   exist. Exactly one variant, [`FinalStatus::Activated`], means success.

use serde::{Deserialize, Serialize};

// =============================================================================
// Final status
// =============================================================================

/// Terminal status of a speculation host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    /// The session was swapped into a real navigation.
    Activated,
    /// The host was dropped without any more specific reason.
    Destroyed,
    /// The initial navigation could not be started at all.
    StartFailed,
    /// The trigger that requested the speculation went away.
    TriggerDestroyed,
    /// The owner became hidden and background keep-alive is disabled.
    TriggerBackgrounded,
    /// The owner stayed hidden longer than the background budget.
    TimeoutBackgrounded,
    /// A second navigation was attempted in the speculative root.
    MainFrameNavigation,
    /// The initial navigation used a scheme other than http/https.
    InvalidSchemeNavigation,
    /// A redirect led to a scheme other than http/https.
    InvalidSchemeRedirect,
    /// Renderer-initiated navigation started cross-site.
    CrossOriginNavigation,
    /// Renderer-initiated navigation redirected across origins or sites.
    CrossOriginRedirect,
    /// Same-site cross-origin navigation without a loading-mode opt-in.
    SameSiteCrossOriginNavigationNotOptIn,
    /// Same-site cross-origin redirect without a loading-mode opt-in.
    SameSiteCrossOriginRedirectNotOptIn,
    /// Browser-initiated session redirected to another origin.
    EmbedderTriggeredAndCrossOriginRedirected,
    /// The response turned out to be a download.
    Download,
    /// The response status is not one a page can be activated with.
    NavigationBadHttpStatus,
    /// Content security policy blocked the navigation.
    NavigationRequestBlockedByCsp,
    /// A client (extension, blocker) blocked a request in the tree.
    BlockedByClient,
    /// The root navigation failed with a network error.
    NavigationRequestNetworkError,
    /// The root navigation finished without committing.
    NavigationNotCommitted,
    /// The document failed to load after commit.
    DidFailLoad,
    /// Loading was stopped.
    Stop,
    /// A TLS certificate error was encountered.
    SslCertificateError,
    /// The server asked for a client certificate.
    ClientCertRequested,
    /// The server asked for HTTP authentication.
    LoginAuthRequested,
    /// Mixed content was loaded in the speculative tree.
    MixedContent,
    /// User agent override changed and requires a reload.
    UaChangeRequiresReload,
    /// The page asked for an audio output device.
    AudioOutputDeviceRequested,
    /// The renderer hosting the speculative tree crashed.
    RendererProcessCrashed,
    /// The renderer hosting the speculative tree was killed.
    RendererProcessKilled,
    /// The renderer of the primary page crashed.
    PrimaryMainFrameRendererProcessCrashed,
    /// Process memory exceeded the configured budget.
    MemoryLimitExceeded,
    /// The memory sampler could not report usage.
    FailToGetMemoryUsage,
    /// The activating navigation's parameters differ from the initial ones.
    ActivationNavigationParameterMismatch,
    /// Sandbox policies of the speculative and destination roots differ.
    ActivationFramePolicyNotCompatible,
    /// The activating navigation went away after reserving the host.
    ActivationNavigationDestroyedBeforeSuccess,
    /// Activation was requested while the owner was in the background.
    ActivatedInBackground,
    /// The page used a capability that inactive pages may not use.
    InactivePageRestriction,
    /// The owning tab was closed by a user gesture.
    TabClosedByUserGesture,
    /// The owning tab was closed without a user gesture.
    TabClosedWithoutUserGesture,
    /// All hosts were canceled at once (owner teardown).
    CancelAllHosts,
    /// The embedder refused to host the speculation.
    EmbedderHostDisallowed,
    /// The URL has an effective URL that differs from the real one.
    HasEffectiveUrl,
}

impl FinalStatus {
    /// Every status, in declaration order.
    pub const ALL: [FinalStatus; 43] = [
        Self::Activated,
        Self::Destroyed,
        Self::StartFailed,
        Self::TriggerDestroyed,
        Self::TriggerBackgrounded,
        Self::TimeoutBackgrounded,
        Self::MainFrameNavigation,
        Self::InvalidSchemeNavigation,
        Self::InvalidSchemeRedirect,
        Self::CrossOriginNavigation,
        Self::CrossOriginRedirect,
        Self::SameSiteCrossOriginNavigationNotOptIn,
        Self::SameSiteCrossOriginRedirectNotOptIn,
        Self::EmbedderTriggeredAndCrossOriginRedirected,
        Self::Download,
        Self::NavigationBadHttpStatus,
        Self::NavigationRequestBlockedByCsp,
        Self::BlockedByClient,
        Self::NavigationRequestNetworkError,
        Self::NavigationNotCommitted,
        Self::DidFailLoad,
        Self::Stop,
        Self::SslCertificateError,
        Self::ClientCertRequested,
        Self::LoginAuthRequested,
        Self::MixedContent,
        Self::UaChangeRequiresReload,
        Self::AudioOutputDeviceRequested,
        Self::RendererProcessCrashed,
        Self::RendererProcessKilled,
        Self::PrimaryMainFrameRendererProcessCrashed,
        Self::MemoryLimitExceeded,
        Self::FailToGetMemoryUsage,
        Self::ActivationNavigationParameterMismatch,
        Self::ActivationFramePolicyNotCompatible,
        Self::ActivationNavigationDestroyedBeforeSuccess,
        Self::ActivatedInBackground,
        Self::InactivePageRestriction,
        Self::TabClosedByUserGesture,
        Self::TabClosedWithoutUserGesture,
        Self::CancelAllHosts,
        Self::EmbedderHostDisallowed,
        Self::HasEffectiveUrl,
    ];

    /// Whether this status means the session served a navigation.
    #[must_use]
    pub const fn is_activation(self) -> bool {
        matches!(self, Self::Activated)
    }

    /// Stable snake_case name, matching the serde representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Activated => "activated",
            Self::Destroyed => "destroyed",
            Self::StartFailed => "start_failed",
            Self::TriggerDestroyed => "trigger_destroyed",
            Self::TriggerBackgrounded => "trigger_backgrounded",
            Self::TimeoutBackgrounded => "timeout_backgrounded",
            Self::MainFrameNavigation => "main_frame_navigation",
            Self::InvalidSchemeNavigation => "invalid_scheme_navigation",
            Self::InvalidSchemeRedirect => "invalid_scheme_redirect",
            Self::CrossOriginNavigation => "cross_origin_navigation",
            Self::CrossOriginRedirect => "cross_origin_redirect",
            Self::SameSiteCrossOriginNavigationNotOptIn => {
                "same_site_cross_origin_navigation_not_opt_in"
            }
            Self::SameSiteCrossOriginRedirectNotOptIn => "same_site_cross_origin_redirect_not_opt_in",
            Self::EmbedderTriggeredAndCrossOriginRedirected => {
                "embedder_triggered_and_cross_origin_redirected"
            }
            Self::Download => "download",
            Self::NavigationBadHttpStatus => "navigation_bad_http_status",
            Self::NavigationRequestBlockedByCsp => "navigation_request_blocked_by_csp",
            Self::BlockedByClient => "blocked_by_client",
            Self::NavigationRequestNetworkError => "navigation_request_network_error",
            Self::NavigationNotCommitted => "navigation_not_committed",
            Self::DidFailLoad => "did_fail_load",
            Self::Stop => "stop",
            Self::SslCertificateError => "ssl_certificate_error",
            Self::ClientCertRequested => "client_cert_requested",
            Self::LoginAuthRequested => "login_auth_requested",
            Self::MixedContent => "mixed_content",
            Self::UaChangeRequiresReload => "ua_change_requires_reload",
            Self::AudioOutputDeviceRequested => "audio_output_device_requested",
            Self::RendererProcessCrashed => "renderer_process_crashed",
            Self::RendererProcessKilled => "renderer_process_killed",
            Self::PrimaryMainFrameRendererProcessCrashed => {
                "primary_main_frame_renderer_process_crashed"
            }
            Self::MemoryLimitExceeded => "memory_limit_exceeded",
            Self::FailToGetMemoryUsage => "fail_to_get_memory_usage",
            Self::ActivationNavigationParameterMismatch => {
                "activation_navigation_parameter_mismatch"
            }
            Self::ActivationFramePolicyNotCompatible => "activation_frame_policy_not_compatible",
            Self::ActivationNavigationDestroyedBeforeSuccess => {
                "activation_navigation_destroyed_before_success"
            }
            Self::ActivatedInBackground => "activated_in_background",
            Self::InactivePageRestriction => "inactive_page_restriction",
            Self::TabClosedByUserGesture => "tab_closed_by_user_gesture",
            Self::TabClosedWithoutUserGesture => "tab_closed_without_user_gesture",
            Self::CancelAllHosts => "cancel_all_hosts",
            Self::EmbedderHostDisallowed => "embedder_host_disallowed",
            Self::HasEffectiveUrl => "has_effective_url",
        }
    }
}

impl std::fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Write-once status cell
// =============================================================================

/// Lifecycle status of a host: pending until finalized exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Pending,
    Terminal(FinalStatus),
}

impl Status {
    /// Set the terminal status.
    ///
    /// # Panics
    ///
    /// Panics if the status was already finalized.
    pub fn finalize(&mut self, status: FinalStatus) {
        if let Self::Terminal(previous) = self {
            panic!("final status already set to {previous}, refusing {status}");
        }
        *self = Self::Terminal(status);
    }

    /// Set the terminal status unless one is already set.
    ///
    /// Returns `true` when this call performed the transition.
    pub fn try_finalize(&mut self, status: FinalStatus) -> bool {
        match self {
            Self::Pending => {
                *self = Self::Terminal(status);
                true
            }
            Self::Terminal(_) => false,
        }
    }

    #[must_use]
    pub const fn terminal(self) -> Option<FinalStatus> {
        match self {
            Self::Pending => None,
            Self::Terminal(status) => Some(status),
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminal(_))
    }
}

// =============================================================================
// Admission rejections
// =============================================================================

/// Why admission control refused to create a speculation host.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error,
)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    #[error("speculative rendering is disabled for this context")]
    PreloadingDisabled,
    #[error("the owning context is hidden")]
    Hidden,
    #[error("device memory is below the configured floor")]
    LowEndDevice,
    #[error("data saver is enabled")]
    DataSaverEnabled,
    #[error("renderer-initiated speculation targets another origin")]
    CrossOrigin,
    #[error("speculation is held back by experiment configuration")]
    Holdback,
    #[error("a speculation for this URL is already running")]
    Duplicate,
    #[error("too many speculations are running for this trigger type")]
    QuotaExceeded,
    #[error("the initial navigation could not be started")]
    StartFailed,
}

impl RejectReason {
    /// Whether the request passed the eligibility checks before being refused.
    #[must_use]
    pub const fn was_eligible(self) -> bool {
        matches!(
            self,
            Self::Holdback | Self::Duplicate | Self::QuotaExceeded | Self::StartFailed
        )
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PreloadingDisabled => "preloading_disabled",
            Self::Hidden => "hidden",
            Self::LowEndDevice => "low_end_device",
            Self::DataSaverEnabled => "data_saver_enabled",
            Self::CrossOrigin => "cross_origin",
            Self::Holdback => "holdback",
            Self::Duplicate => "duplicate",
            Self::QuotaExceeded => "quota_exceeded",
            Self::StartFailed => "start_failed",
        }
    }
}

// =============================================================================
// Preloading attempt outcomes
// =============================================================================

/// Eligibility verdict reported to a preloading attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "reason")]
pub enum Eligibility {
    Eligible,
    Ineligible(RejectReason),
}

/// Whether an eligible attempt was held back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldbackStatus {
    Allowed,
    Holdback,
}

/// Progress of a triggered attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeringOutcome {
    Running,
    Ready,
    Success,
    Failure,
    Duplicate,
}

/// Failure detail reported to a preloading attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "reason")]
pub enum FailureReason {
    Rejected(RejectReason),
    Cancelled(FinalStatus),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn all_statuses_have_unique_names() {
        let names: HashSet<_> = FinalStatus::ALL.iter().map(|s| s.as_str()).collect();
        assert_eq!(names.len(), FinalStatus::ALL.len());
    }

    #[test]
    fn display_matches_serde() {
        for status in FinalStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
        }
    }

    #[test]
    fn only_activated_is_activation() {
        let activations: Vec<_> = FinalStatus::ALL
            .iter()
            .filter(|s| s.is_activation())
            .collect();
        assert_eq!(activations, vec![&FinalStatus::Activated]);
    }

    #[test]
    fn status_starts_pending() {
        let status = Status::default();
        assert!(!status.is_terminal());
        assert_eq!(status.terminal(), None);
    }

    #[test]
    fn try_finalize_is_write_once() {
        let mut status = Status::Pending;
        assert!(status.try_finalize(FinalStatus::Download));
        assert!(!status.try_finalize(FinalStatus::Stop));
        assert_eq!(status.terminal(), Some(FinalStatus::Download));
    }

    #[test]
    #[should_panic(expected = "final status already set")]
    fn finalize_twice_panics() {
        let mut status = Status::Pending;
        status.finalize(FinalStatus::Activated);
        status.finalize(FinalStatus::Destroyed);
    }

    #[test]
    fn eligibility_split() {
        assert!(!RejectReason::Hidden.was_eligible());
        assert!(!RejectReason::CrossOrigin.was_eligible());
        assert!(RejectReason::Holdback.was_eligible());
        assert!(RejectReason::QuotaExceeded.was_eligible());
    }

    #[test]
    fn reject_reason_display() {
        assert_eq!(
            RejectReason::Duplicate.to_string(),
            "a speculation for this URL is already running"
        );
        assert_eq!(RejectReason::LowEndDevice.as_str(), "low_end_device");
    }
}
