//! Per-URL speculation state machine.
//!
//! A [`SpeculationHost`] composes one [`SpeculativeSession`], its
//! [`NavigationGate`] and the write-once [`Status`]. Navigation callbacks
//! return a cancellation request instead of acting on it: only the registry
//! moves a host between its maps, so a host never removes itself.
//!
//! ```text
//!   Starting ──► Active ──► ReadyForActivation ──► Reserved ──► Activated
//!       │          │                 │
//!       └──────────┴─────────────────┴──► Cancelled
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::attempt::PreloadingAttempt;
use crate::attributes::{SpeculationAttributes, TriggerType, Url};
use crate::config::SpeculationConfig;
use crate::context::Visibility;
use crate::gate::NavigationGate;
use crate::matcher::ActivationMatcher;
use crate::metrics::SpeculationMetrics;
use crate::navigation::{
    ActivationNavigation, NavigationId, NavigationOutcome, NavigationParams, NavigationRequest,
    NavigationStart, NetError, RedirectInfo, ResponseInfo,
};
use crate::observer::{HostEvent, HostObserver, ObserverList, Subscription};
use crate::registry::CandidateError;
use crate::session::{NavigationLoader, PrimaryContents, SessionId, SpeculativeSession};
use crate::status::{FailureReason, FinalStatus, Status, TriggeringOutcome};
use crate::tree::TransferredTree;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StartError {
    #[error("no navigation could be started for the speculative root")]
    NotStarted,
}

/// Observable lifecycle phase, derived from the host's flags and status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostPhase {
    Starting,
    Active,
    ReadyForActivation,
    Reserved,
    Activated,
    Cancelled,
}

pub struct SpeculationHost {
    id: SessionId,
    attributes: SpeculationAttributes,
    session: SpeculativeSession,
    gate: NavigationGate,
    status: Status,
    started: bool,
    ready: bool,
    reserved: bool,
    keep_alive_in_background: bool,
    background_timeout: Duration,
    background_deadline: Option<Instant>,
    observers: ObserverList,
    attempt: Option<Box<dyn PreloadingAttempt>>,
}

impl std::fmt::Debug for SpeculationHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeculationHost")
            .field("id", &self.id)
            .field("url", &self.attributes.url.as_str())
            .field("trigger", &self.attributes.trigger_type)
            .field("phase", &self.phase())
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl SpeculationHost {
    #[must_use]
    pub fn new(
        session: SpeculativeSession,
        attributes: SpeculationAttributes,
        config: &SpeculationConfig,
        attempt: Option<Box<dyn PreloadingAttempt>>,
    ) -> Self {
        let gate = NavigationGate::new(&attributes, config.same_site_cross_origin);
        Self {
            id: session.id(),
            attributes,
            session,
            gate,
            status: Status::Pending,
            started: false,
            ready: false,
            reserved: false,
            keep_alive_in_background: config.keep_alive_in_background,
            background_timeout: config.background_timeout(),
            background_deadline: None,
            observers: ObserverList::new(),
            attempt,
        }
    }

    // ---- accessors ----

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn attributes(&self) -> &SpeculationAttributes {
        &self.attributes
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.attributes.url
    }

    #[must_use]
    pub fn trigger_type(&self) -> TriggerType {
        self.attributes.trigger_type
    }

    #[must_use]
    pub fn status(&self) -> Status {
        self.status
    }

    #[must_use]
    pub fn final_status(&self) -> Option<FinalStatus> {
        self.status.terminal()
    }

    #[must_use]
    pub fn is_ready_for_activation(&self) -> bool {
        self.ready
    }

    #[must_use]
    pub fn is_reserved(&self) -> bool {
        self.reserved
    }

    #[must_use]
    pub fn phase(&self) -> HostPhase {
        match self.status.terminal() {
            Some(FinalStatus::Activated) => HostPhase::Activated,
            Some(_) => HostPhase::Cancelled,
            None if self.reserved => HostPhase::Reserved,
            None if self.ready => HostPhase::ReadyForActivation,
            None if self.started => HostPhase::Active,
            None => HostPhase::Starting,
        }
    }

    #[must_use]
    pub fn session(&self) -> &SpeculativeSession {
        &self.session
    }

    /// Mutable session access for the loading pipeline (frames, sandbox,
    /// client hints).
    pub fn session_mut(&mut self) -> &mut SpeculativeSession {
        &mut self.session
    }

    #[must_use]
    pub fn gate(&self) -> &NavigationGate {
        &self.gate
    }

    #[must_use]
    pub fn initial_params(&self) -> Option<&NavigationParams> {
        self.gate.initial_params()
    }

    #[must_use]
    pub fn background_deadline(&self) -> Option<Instant> {
        self.background_deadline
    }

    #[must_use]
    pub fn observers(&self) -> &ObserverList {
        &self.observers
    }

    pub fn subscribe<O: HostObserver + 'static>(&self, observer: &Arc<O>) -> Subscription {
        self.observers.subscribe(observer)
    }

    fn report_outcome(&mut self, outcome: TriggeringOutcome) {
        if let Some(attempt) = self.attempt.as_mut() {
            attempt.set_triggering_outcome(outcome);
        }
    }

    // ---- start ----

    /// Begin the initial navigation.
    ///
    /// `Ok(Some(status))` means the navigation began but must be canceled
    /// right away (pre-flight failure or gate violation).
    pub fn start(
        &mut self,
        loader: &mut dyn NavigationLoader,
    ) -> Result<Option<FinalStatus>, StartError> {
        assert!(!self.started, "session {} started twice", self.id);
        self.started = true;

        let request = NavigationRequest::for_speculation(&self.attributes);
        match self.session.begin_initial_navigation(loader, &request) {
            NavigationStart::Started { navigation, params } => {
                self.report_outcome(TriggeringOutcome::Running);
                Ok(self.gate.on_start(navigation, &request.url, &params).err())
            }
            NavigationStart::FailedBeforeStart(error) => {
                self.gate.capture_fallback_params();
                self.report_outcome(TriggeringOutcome::Running);
                tracing::debug!(
                    session_id = %self.id,
                    error = ?error,
                    "Initial navigation failed before start"
                );
                Ok(Some(error.final_status()))
            }
            NavigationStart::NotStarted => Err(StartError::NotStarted),
        }
    }

    // ---- navigation callbacks ----

    fn is_other_navigation(&self, navigation: NavigationId) -> bool {
        self.gate
            .initial_navigation()
            .is_some_and(|initial| initial != navigation)
    }

    /// A navigation started in the speculative root.
    pub fn on_navigation_started(
        &mut self,
        navigation: NavigationId,
        url: &Url,
        params: &NavigationParams,
    ) -> Option<FinalStatus> {
        if self.status.is_terminal() {
            return None;
        }
        self.gate.on_start(navigation, url, params).err()
    }

    pub fn on_redirect(
        &mut self,
        navigation: NavigationId,
        redirect: &RedirectInfo,
    ) -> Option<FinalStatus> {
        if self.status.is_terminal() {
            return None;
        }
        if !self.is_other_navigation(navigation) {
            self.session.record_redirect(&redirect.url);
        }
        self.gate.on_redirect(navigation, redirect).err()
    }

    pub fn on_response(
        &mut self,
        navigation: NavigationId,
        response: &ResponseInfo,
    ) -> Option<FinalStatus> {
        if self.status.is_terminal() {
            return None;
        }
        if self.is_other_navigation(navigation) {
            return Some(FinalStatus::MainFrameNavigation);
        }
        self.gate.on_response(response).err()
    }

    /// The root navigation finished.
    ///
    /// # Panics
    ///
    /// Panics if a committed finish arrives for a host that is already ready.
    pub fn on_navigation_finished(
        &mut self,
        navigation: NavigationId,
        outcome: NavigationOutcome,
    ) -> Option<FinalStatus> {
        if self.status.is_terminal() || self.is_other_navigation(navigation) {
            return None;
        }
        match outcome {
            NavigationOutcome::Committed => {
                assert!(!self.ready, "session {} is already ready", self.id);
                if let Err(status) = self.gate.on_commit() {
                    tracing::debug!(
                        session_id = %self.id,
                        final_status = %status,
                        "Commit without an accepted response"
                    );
                    return Some(status);
                }
                let committed = self.gate.current_url().clone();
                self.session.record_commit(&committed);
                self.session.mark_load_complete();
                self.ready = true;
                self.report_outcome(TriggeringOutcome::Ready);
                tracing::debug!(
                    session_id = %self.id,
                    url = %committed,
                    "Speculation ready for activation"
                );
                None
            }
            NavigationOutcome::Failed(error) => Some(error.final_status()),
            NavigationOutcome::NotCommitted => Some(FinalStatus::NavigationNotCommitted),
        }
    }

    /// A resource load anywhere in the speculative tree failed.
    pub fn on_resource_load_failed(&mut self, error: NetError) -> Option<FinalStatus> {
        if self.status.is_terminal() {
            return None;
        }
        (error == NetError::BlockedByClient).then_some(FinalStatus::BlockedByClient)
    }

    /// The owning context changed visibility.
    pub fn on_visibility_changed(
        &mut self,
        visibility: Visibility,
        now: Instant,
    ) -> Option<FinalStatus> {
        if self.status.is_terminal() {
            return None;
        }
        if !visibility.is_hidden() {
            self.background_deadline = None;
            return None;
        }
        if !self.keep_alive_in_background {
            return Some(FinalStatus::TriggerBackgrounded);
        }
        if self.background_deadline.is_none() {
            self.background_deadline = Some(now + self.background_timeout);
        }
        None
    }

    /// Fire the background timer if it expired.
    pub fn on_timer(&mut self, now: Instant) -> Option<FinalStatus> {
        if self.status.is_terminal() {
            return None;
        }
        let deadline = self.background_deadline?;
        if now < deadline {
            return None;
        }
        self.background_deadline = None;
        Some(FinalStatus::TimeoutBackgrounded)
    }

    // ---- activation ----

    /// Whether `navigation` may consume this session. Matching results are
    /// reported to `metrics`.
    pub fn check_activation(
        &self,
        navigation: &ActivationNavigation,
        metrics: &dyn SpeculationMetrics,
    ) -> Result<(), CandidateError> {
        if !self.ready || self.status.is_terminal() {
            return Err(CandidateError::NotReady);
        }
        let fallback;
        let initial = match self.gate.initial_params() {
            Some(params) => params,
            None => {
                fallback = NavigationParams::fallback();
                &fallback
            }
        };
        ActivationMatcher::evaluate(
            self.attributes.trigger_type,
            &self.attributes.histogram_suffix,
            initial,
            &navigation.params,
            metrics,
        )
        .map_err(|mismatch| CandidateError::ParameterMismatch { mismatch })?;

        if !self
            .session
            .root_sandbox()
            .is_compatible_with(&navigation.destination_sandbox)
        {
            return Err(CandidateError::FramePolicyMismatch);
        }
        Ok(())
    }

    pub(crate) fn set_reserved(&mut self, reserved: bool) {
        self.reserved = reserved;
    }

    /// Swap the speculative tree into `target`.
    ///
    /// # Panics
    ///
    /// Panics if the host is not ready for activation.
    pub fn activate(
        &mut self,
        navigation: &ActivationNavigation,
        target: &mut PrimaryContents,
    ) -> TransferredTree {
        assert!(
            self.ready,
            "session {} activated while not ready for activation",
            self.id
        );
        self.ready = false;
        self.background_deadline = None;

        target.client_hints.merge(self.session.client_hints());
        let transferred = self.session.transfer_into(&mut target.tree);
        self.status.finalize(FinalStatus::Activated);
        self.report_outcome(TriggeringOutcome::Success);

        tracing::info!(
            session_id = %self.id,
            trigger = %self.attributes.trigger_type,
            url = %navigation.url,
            nodes = transferred.nodes.len(),
            final_status = %FinalStatus::Activated,
            "Speculation activated"
        );
        self.observers.notify(self.id, HostEvent::Activated);
        transferred
    }

    // ---- cancellation ----

    /// Record a terminal status. Returns false if one was already set.
    ///
    /// # Panics
    ///
    /// Panics if the host is reserved.
    pub fn cancel(&mut self, status: FinalStatus) -> bool {
        assert!(
            !self.reserved,
            "session {} canceled while reserved for activation",
            self.id
        );
        if !self.status.try_finalize(status) {
            return false;
        }
        self.ready = false;
        self.background_deadline = None;
        if let Some(attempt) = self.attempt.as_mut() {
            attempt.set_triggering_outcome(TriggeringOutcome::Failure);
            attempt.set_failure_reason(FailureReason::Cancelled(status));
        }
        true
    }
}

impl Drop for SpeculationHost {
    fn drop(&mut self) {
        let status = self.status.terminal().unwrap_or(FinalStatus::Destroyed);
        self.observers.notify(self.id, HostEvent::Destroyed(status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempt::SharedAttempt;
    use crate::attributes::parse_origin;
    use crate::metrics::NoopMetrics;
    use crate::navigation::{Headers, SandboxFlags, SandboxPolicy};
    use crate::tree::{NodeId, NodeIdSource};
    use std::sync::{LazyLock, Mutex};

    struct ParamsLoader(Option<NavigationStart>);

    impl NavigationLoader for ParamsLoader {
        fn begin_navigation(&mut self, _root: NodeId, request: &NavigationRequest) -> NavigationStart {
            self.0.take().unwrap_or_else(|| NavigationStart::Started {
                navigation: NavigationId(1),
                params: request.params(),
            })
        }
    }

    fn attrs() -> SpeculationAttributes {
        SpeculationAttributes::rule_based(
            Url::parse("https://a.example/target").unwrap(),
            parse_origin("https://a.example/").unwrap(),
        )
    }

    static IDS: LazyLock<NodeIdSource> = LazyLock::new(NodeIdSource::new);

    fn host_with(config: &SpeculationConfig, attempt: Option<Box<dyn PreloadingAttempt>>) -> SpeculationHost {
        SpeculationHost::new(SpeculativeSession::new(&IDS), attrs(), config, attempt)
    }

    fn started_host() -> SpeculationHost {
        let mut host = host_with(&SpeculationConfig::default(), None);
        assert_eq!(host.start(&mut ParamsLoader(None)), Ok(None));
        host
    }

    fn ready_host() -> SpeculationHost {
        let mut host = started_host();
        assert_eq!(
            host.on_response(NavigationId(1), &ResponseInfo::ok()),
            None
        );
        assert_eq!(
            host.on_navigation_finished(NavigationId(1), NavigationOutcome::Committed),
            None
        );
        host
    }

    fn matching_navigation(host: &SpeculationHost) -> ActivationNavigation {
        ActivationNavigation::primary(host.url().clone(), host.initial_params().unwrap().clone())
    }

    // ---- lifecycle ----

    #[test]
    fn phases_progress() {
        let mut host = host_with(&SpeculationConfig::default(), None);
        assert_eq!(host.phase(), HostPhase::Starting);
        host.start(&mut ParamsLoader(None)).unwrap();
        assert_eq!(host.phase(), HostPhase::Active);
        assert_eq!(host.on_response(NavigationId(1), &ResponseInfo::ok()), None);
        host.on_navigation_finished(NavigationId(1), NavigationOutcome::Committed);
        assert_eq!(host.phase(), HostPhase::ReadyForActivation);
        host.set_reserved(true);
        assert_eq!(host.phase(), HostPhase::Reserved);
    }

    #[test]
    fn not_started_is_error() {
        let mut host = host_with(&SpeculationConfig::default(), None);
        let result = host.start(&mut ParamsLoader(Some(NavigationStart::NotStarted)));
        assert_eq!(result, Err(StartError::NotStarted));
    }

    #[test]
    fn preflight_failure_captures_fallback() {
        let mut host = host_with(&SpeculationConfig::default(), None);
        let result = host.start(&mut ParamsLoader(Some(NavigationStart::FailedBeforeStart(
            NetError::BlockedByCsp,
        ))));
        assert_eq!(result, Ok(Some(FinalStatus::NavigationRequestBlockedByCsp)));
        assert!(host.initial_params().unwrap().is_fallback());
    }

    #[test]
    #[should_panic(expected = "started twice")]
    fn start_twice_panics() {
        let mut host = started_host();
        let _ = host.start(&mut ParamsLoader(None));
    }

    #[test]
    fn failure_outcomes_classified() {
        let mut host = started_host();
        assert_eq!(
            host.on_navigation_finished(
                NavigationId(1),
                NavigationOutcome::Failed(NetError::ConnectionFailed)
            ),
            Some(FinalStatus::NavigationRequestNetworkError)
        );
        let mut host = started_host();
        assert_eq!(
            host.on_navigation_finished(NavigationId(1), NavigationOutcome::NotCommitted),
            Some(FinalStatus::NavigationNotCommitted)
        );
    }

    #[test]
    fn other_navigation_in_root() {
        let mut host = started_host();
        assert_eq!(
            host.on_navigation_started(
                NavigationId(2),
                &Url::parse("https://a.example/other").unwrap(),
                &NavigationParams::default()
            ),
            Some(FinalStatus::MainFrameNavigation)
        );
        assert_eq!(
            host.on_response(NavigationId(2), &ResponseInfo::ok()),
            Some(FinalStatus::MainFrameNavigation)
        );
    }

    #[test]
    fn callbacks_after_terminal_are_ignored() {
        let mut host = started_host();
        assert!(host.cancel(FinalStatus::Stop));
        assert!(!host.cancel(FinalStatus::Download));
        assert_eq!(host.final_status(), Some(FinalStatus::Stop));
        assert_eq!(host.on_resource_load_failed(NetError::BlockedByClient), None);
        assert_eq!(
            host.on_navigation_finished(NavigationId(1), NavigationOutcome::Committed),
            None
        );
        assert!(!host.is_ready_for_activation());
        assert_eq!(host.phase(), HostPhase::Cancelled);
    }

    #[test]
    fn blocked_by_client_resource_cancels() {
        let mut host = started_host();
        assert_eq!(host.on_resource_load_failed(NetError::ConnectionFailed), None);
        assert_eq!(
            host.on_resource_load_failed(NetError::BlockedByClient),
            Some(FinalStatus::BlockedByClient)
        );
    }

    #[test]
    #[should_panic(expected = "already ready")]
    fn committing_twice_panics() {
        let mut host = ready_host();
        host.on_navigation_finished(NavigationId(1), NavigationOutcome::Committed);
    }

    // ---- visibility ----

    #[test]
    fn hidden_without_keep_alive_cancels() {
        let mut host = started_host();
        assert_eq!(
            host.on_visibility_changed(Visibility::Hidden, Instant::now()),
            Some(FinalStatus::TriggerBackgrounded)
        );
    }

    #[test]
    fn background_timer_arms_and_disarms() {
        let config = SpeculationConfig {
            keep_alive_in_background: true,
            background_timeout_ms: 1_000,
            ..SpeculationConfig::default()
        };
        let mut host = host_with(&config, None);
        host.start(&mut ParamsLoader(None)).unwrap();
        let t0 = Instant::now();

        assert_eq!(host.on_visibility_changed(Visibility::Hidden, t0), None);
        assert_eq!(host.background_deadline(), Some(t0 + Duration::from_secs(1)));
        assert_eq!(host.on_timer(t0 + Duration::from_millis(999)), None);
        assert_eq!(host.on_visibility_changed(Visibility::Visible, t0), None);
        assert_eq!(host.on_timer(t0 + Duration::from_secs(5)), None);

        host.on_visibility_changed(Visibility::Hidden, t0 + Duration::from_secs(10));
        assert_eq!(
            host.on_timer(t0 + Duration::from_secs(11)),
            Some(FinalStatus::TimeoutBackgrounded)
        );
    }

    // ---- activation ----

    #[test]
    fn not_ready_cannot_activate() {
        let host = started_host();
        let nav = matching_navigation(&host);
        assert_eq!(
            host.check_activation(&nav, &NoopMetrics),
            Err(CandidateError::NotReady)
        );
    }

    #[test]
    fn parameter_and_sandbox_mismatch() {
        let host = ready_host();
        let mut nav = matching_navigation(&host);
        assert_eq!(host.check_activation(&nav, &NoopMetrics), Ok(()));

        nav.params.headers = Headers::new().with("Cache-Control", "no-cache");
        assert!(matches!(
            host.check_activation(&nav, &NoopMetrics),
            Err(CandidateError::ParameterMismatch { .. })
        ));

        let mut nav = matching_navigation(&host);
        nav.destination_sandbox = SandboxPolicy::committed(SandboxFlags::SCRIPTS);
        assert_eq!(
            host.check_activation(&nav, &NoopMetrics),
            Err(CandidateError::FramePolicyMismatch)
        );
    }

    #[derive(Default)]
    struct Events(Mutex<Vec<HostEvent>>);

    impl HostObserver for Events {
        fn on_host_event(&self, _session: SessionId, event: HostEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[test]
    fn activate_transfers_and_notifies() {
        let attempt = SharedAttempt::new();
        let mut host = host_with(&SpeculationConfig::default(), Some(attempt.boxed()));
        host.start(&mut ParamsLoader(None)).unwrap();
        assert_eq!(host.on_response(NavigationId(1), &ResponseInfo::ok()), None);
        host.on_navigation_finished(NavigationId(1), NavigationOutcome::Committed);
        let origin = parse_origin("https://a.example/").unwrap();
        host.session_mut().client_hints_mut().grant(&origin, ["sec-ch-ua-model"]);

        let events = Arc::new(Events::default());
        let _sub = host.subscribe(&events);
        let mut primary = PrimaryContents::new(&IDS);
        let nav = matching_navigation(&host);
        let transferred = host.activate(&nav, &mut primary);

        assert_eq!(transferred.root, host.id().root());
        assert_eq!(primary.tree.root(), host.id().root());
        assert_eq!(primary.client_hints.hints_for(&origin), vec!["sec-ch-ua-model"]);
        assert_eq!(host.final_status(), Some(FinalStatus::Activated));
        assert!(!host.is_ready_for_activation());

        let log = attempt.snapshot();
        assert_eq!(log.outcome(), Some(TriggeringOutcome::Success));
        assert!(log.failure.is_none());

        drop(host);
        assert_eq!(
            *events.0.lock().unwrap(),
            vec![
                HostEvent::Activated,
                HostEvent::Destroyed(FinalStatus::Activated)
            ]
        );
    }

    #[test]
    #[should_panic(expected = "not ready for activation")]
    fn activate_not_ready_panics() {
        let mut host = started_host();
        let mut primary = PrimaryContents::new(&IDS);
        let nav = matching_navigation(&host);
        host.activate(&nav, &mut primary);
    }

    #[test]
    #[should_panic(expected = "canceled while reserved")]
    fn cancel_reserved_panics() {
        let mut host = ready_host();
        host.set_reserved(true);
        host.cancel(FinalStatus::Stop);
    }

    #[test]
    fn cancel_reports_failure_to_attempt() {
        let attempt = SharedAttempt::new();
        let mut host = host_with(&SpeculationConfig::default(), Some(attempt.boxed()));
        host.start(&mut ParamsLoader(None)).unwrap();
        host.cancel(FinalStatus::Download);
        let log = attempt.snapshot();
        assert_eq!(
            log.outcomes,
            vec![TriggeringOutcome::Running, TriggeringOutcome::Failure]
        );
        assert_eq!(log.failure, Some(FailureReason::Cancelled(FinalStatus::Download)));
    }

    #[test]
    fn dropping_pending_host_reports_destroyed() {
        let host = started_host();
        let events = Arc::new(Events::default());
        host.subscribe(&events).detach();
        drop(host);
        assert_eq!(
            *events.0.lock().unwrap(),
            vec![HostEvent::Destroyed(FinalStatus::Destroyed)]
        );
    }
}
