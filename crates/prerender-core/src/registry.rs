//! Speculation registry: admission control, ownership of every host, and
//! activation reservation.
//!
//! The registry keeps three disjoint sets of hosts:
//!
//! - `active`: admitted and not terminal, keyed by session id
//! - `reserved`: claimed by one activation navigation, at most once per id
//! - `pending_deletion`: terminal hosts waiting for the next [`tick`]
//!
//! Cancellation is synchronous (the status is final on return) but
//! destruction is deferred, so a host is never destroyed from inside one of
//! its own callbacks. Observers see `Destroyed` when the host is dropped.
//!
//! [`tick`]: SpeculationRegistry::tick

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::attempt::PreloadingAttempt;
use crate::attributes::{SpeculationAttributes, TriggerType, Url};
use crate::config::{MemoryGovernorConfig, SpeculationConfig};
use crate::context::{OwnerContext, Visibility};
use crate::host::{SpeculationHost, StartError};
use crate::matcher::ActivationMismatch;
use crate::memory::{MemoryGovernor, SampleResult};
use crate::metrics::{NoopMetrics, SpeculationMetrics, TracingMetrics};
use crate::navigation::{
    ActivationNavigation, NavigationId, NavigationOutcome, NavigationParams, NetError,
    RedirectInfo, ResponseInfo,
};
use crate::session::{NavigationLoader, PrimaryContents, SessionId, SpeculativeSession};
use crate::status::{
    Eligibility, FailureReason, FinalStatus, HoldbackStatus, RejectReason, TriggeringOutcome,
};
use crate::tree::{NodeIdSource, TransferredTree};

/// Concurrent embedder-triggered sessions allowed per registry.
pub const EMBEDDER_SESSION_LIMIT: usize = 2;

/// Why an activation navigation found no usable session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CandidateError {
    #[error("navigation is not a primary main-frame navigation")]
    NotPrimary,
    #[error("browsing-context group has {count} other live contexts")]
    AuxiliaryContexts { count: usize },
    #[error("no speculation matches the navigation URL")]
    NoMatch,
    #[error("matching speculation is not ready for activation")]
    NotReady,
    #[error("expected session {expected}, found session {found}")]
    UnexpectedSession {
        expected: SessionId,
        found: SessionId,
    },
    #[error("{mismatch}")]
    ParameterMismatch { mismatch: ActivationMismatch },
    #[error("sandbox policy of the speculative root differs from the destination")]
    FramePolicyMismatch,
}

pub struct SpeculationRegistry {
    config: SpeculationConfig,
    memory_budget_percent: f64,
    ids: NodeIdSource,
    loader: Box<dyn NavigationLoader>,
    metrics: Arc<dyn SpeculationMetrics>,
    governor: Option<MemoryGovernor>,
    active: BTreeMap<SessionId, SpeculationHost>,
    reserved: BTreeMap<SessionId, SpeculationHost>,
    pending_deletion: Vec<SpeculationHost>,
    finished: VecDeque<(SessionId, FinalStatus)>,
}

impl std::fmt::Debug for SpeculationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeculationRegistry")
            .field("active", &self.active.len())
            .field("reserved", &self.reserved.len())
            .field("pending_deletion", &self.pending_deletion.len())
            .field("governor", &self.governor)
            .finish_non_exhaustive()
    }
}

impl SpeculationRegistry {
    /// Registry starting sessions through `loader`. Metrics go to `tracing`
    /// and no memory governor is attached.
    #[must_use]
    pub fn new(config: SpeculationConfig, loader: Box<dyn NavigationLoader>) -> Self {
        Self {
            config,
            memory_budget_percent: MemoryGovernorConfig::default().budget_percent,
            ids: NodeIdSource::new(),
            loader,
            metrics: Arc::new(TracingMetrics),
            governor: None,
            active: BTreeMap::new(),
            reserved: BTreeMap::new(),
            pending_deletion: Vec::new(),
            finished: VecDeque::new(),
        }
    }

    /// Report admissions, terminal statuses and activation matches to
    /// `metrics` instead of `tracing`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn SpeculationMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Sample memory after each rule-based start and enforce the governor's
    /// budget.
    #[must_use]
    pub fn with_memory_governor(mut self, governor: MemoryGovernor) -> Self {
        self.memory_budget_percent = governor.budget_percent();
        self.governor = Some(governor);
        self
    }

    /// Budget applied to samples delivered through [`Self::on_memory_sample`].
    #[must_use]
    pub fn with_memory_budget(mut self, budget_percent: f64) -> Self {
        self.memory_budget_percent = budget_percent;
        self
    }

    /// Share node ids with primary trees so transferred ids never collide.
    #[must_use]
    pub fn with_node_ids(mut self, ids: NodeIdSource) -> Self {
        self.ids = ids;
        self
    }

    /// Source to build [`PrimaryContents`] from before activating into it.
    #[must_use]
    pub fn node_ids(&self) -> &NodeIdSource {
        &self.ids
    }

    #[must_use]
    pub fn config(&self) -> &SpeculationConfig {
        &self.config
    }

    /// Replace the configuration. Live hosts keep the settings they were
    /// created with.
    pub fn set_config(&mut self, config: SpeculationConfig) {
        self.config = config;
        while self.finished.len() > self.config.finished_history {
            self.finished.pop_front();
        }
    }

    #[must_use]
    pub fn memory_budget_percent(&self) -> f64 {
        self.memory_budget_percent
    }

    // =========================================================================
    // Admission
    // =========================================================================

    fn check_eligibility(
        &self,
        attrs: &SpeculationAttributes,
        owner: &dyn OwnerContext,
    ) -> Result<(), RejectReason> {
        if !self.config.enabled || owner.preloading_disabled() {
            return Err(RejectReason::PreloadingDisabled);
        }
        if owner.visibility().is_hidden() {
            return Err(RejectReason::Hidden);
        }
        if owner.physical_memory_mb() < self.config.low_end_memory_floor_mb {
            return Err(RejectReason::LowEndDevice);
        }
        if owner.data_saver_enabled() {
            return Err(RejectReason::DataSaverEnabled);
        }
        if attrs.is_cross_origin()
            && !(self.config.same_site_cross_origin && !attrs.is_cross_site())
        {
            return Err(RejectReason::CrossOrigin);
        }
        Ok(())
    }

    fn session_limit(&self, trigger: TriggerType) -> usize {
        match trigger {
            TriggerType::SpeculationRule => self.config.max_rule_based_sessions.max(1),
            TriggerType::Embedder => EMBEDDER_SESSION_LIMIT,
        }
    }

    fn is_duplicate(&self, url: &Url) -> bool {
        self.active.values().any(|host| host.url() == url)
    }

    fn at_quota(&self, trigger: TriggerType) -> bool {
        let running = self
            .active
            .values()
            .filter(|host| host.trigger_type() == trigger)
            .count();
        running >= self.session_limit(trigger)
    }

    /// Run admission in order, reporting each stage to `attempt`.
    fn admit(
        &self,
        attrs: &SpeculationAttributes,
        owner: &dyn OwnerContext,
        attempt: &mut Option<Box<dyn PreloadingAttempt>>,
    ) -> Result<(), RejectReason> {
        let mut report = |f: &dyn Fn(&mut Box<dyn PreloadingAttempt>)| {
            if let Some(attempt) = attempt.as_mut() {
                f(attempt);
            }
        };

        if let Err(reason) = self.check_eligibility(attrs, owner) {
            report(&|a| a.set_eligibility(Eligibility::Ineligible(reason)));
            return Err(reason);
        }
        report(&|a| a.set_eligibility(Eligibility::Eligible));

        if self.config.holdback {
            report(&|a| a.set_holdback_status(HoldbackStatus::Holdback));
            return Err(RejectReason::Holdback);
        }
        report(&|a| a.set_holdback_status(HoldbackStatus::Allowed));

        if self.is_duplicate(&attrs.url) {
            report(&|a| a.set_triggering_outcome(TriggeringOutcome::Duplicate));
            return Err(RejectReason::Duplicate);
        }
        if self.at_quota(attrs.trigger_type) {
            report(&|a| {
                a.set_triggering_outcome(TriggeringOutcome::Failure);
                a.set_failure_reason(FailureReason::Rejected(RejectReason::QuotaExceeded));
            });
            return Err(RejectReason::QuotaExceeded);
        }
        Ok(())
    }

    /// Admit, create and start a speculation host.
    ///
    /// A host whose initial navigation fails pre-flight or violates the gate
    /// is still admitted: the id is returned and the host is already
    /// canceled with the matching status.
    pub fn create_and_start(
        &mut self,
        attrs: SpeculationAttributes,
        owner: &dyn OwnerContext,
        attempt: Option<Box<dyn PreloadingAttempt>>,
    ) -> Result<SessionId, RejectReason> {
        let trigger = attrs.trigger_type;
        let suffix = attrs.histogram_suffix.clone();
        let mut attempt = attempt;

        if let Err(reason) = self.admit(&attrs, owner, &mut attempt) {
            self.metrics.record_admission(trigger, &suffix, Err(reason));
            tracing::debug!(
                trigger = %trigger,
                url = %attrs.url,
                reason = reason.as_str(),
                "Speculation rejected"
            );
            return Err(reason);
        }

        let session = SpeculativeSession::new(&self.ids);
        let id = session.id();
        let url = attrs.url.clone();
        let host = SpeculationHost::new(session, attrs, &self.config, attempt);
        let host = self.active.entry(id).or_insert(host);

        match host.start(self.loader.as_mut()) {
            Err(StartError::NotStarted) => {
                self.cancel_host(id, FinalStatus::StartFailed);
                self.metrics
                    .record_admission(trigger, &suffix, Err(RejectReason::StartFailed));
                tracing::warn!(
                    session_id = %id,
                    trigger = %trigger,
                    url = %url,
                    "Speculation failed to start"
                );
                Err(RejectReason::StartFailed)
            }
            Ok(cancel) => {
                self.metrics.record_admission(trigger, &suffix, Ok(()));
                tracing::info!(
                    session_id = %id,
                    trigger = %trigger,
                    url = %url,
                    "Speculation started"
                );
                if let Some(status) = cancel {
                    self.cancel_host(id, status);
                } else if trigger == TriggerType::SpeculationRule {
                    if let Some(governor) = self.governor.as_mut() {
                        governor.request_sample(id);
                    }
                }
                Ok(id)
            }
        }
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Finalize an active host with `reason` and queue it for deletion.
    ///
    /// Returns false when `id` is not active.
    ///
    /// # Panics
    ///
    /// Panics if `id` is reserved for activation.
    pub fn cancel_host(&mut self, id: SessionId, reason: FinalStatus) -> bool {
        assert!(
            !self.reserved.contains_key(&id),
            "session {id} is reserved for activation and cannot be canceled"
        );
        let Some(mut host) = self.active.remove(&id) else {
            return false;
        };
        let cancelled = host.cancel(reason);
        if cancelled {
            self.metrics
                .record_final_status(host.trigger_type(), &host.attributes().histogram_suffix, reason);
            tracing::info!(
                session_id = %id,
                trigger = %host.trigger_type(),
                url = %host.url(),
                final_status = %reason,
                "Speculation canceled"
            );
        }
        self.pending_deletion.push(host);
        cancelled
    }

    /// The context that triggered `id` went away.
    ///
    /// A reserved session is left to finish its activation.
    pub fn notify_owner_destroyed(&mut self, id: SessionId) -> bool {
        if self.reserved.contains_key(&id) {
            tracing::debug!(session_id = %id, "Owner destroyed during activation");
            return false;
        }
        self.cancel_host(id, FinalStatus::TriggerDestroyed)
    }

    /// Cancel every active host. Reserved hosts are untouched.
    pub fn cancel_all(&mut self, reason: FinalStatus) -> usize {
        let ids: Vec<SessionId> = self.active.keys().copied().collect();
        ids.into_iter()
            .filter(|id| self.cancel_host(*id, reason))
            .count()
    }

    // =========================================================================
    // Activation
    // =========================================================================

    /// First active host whose URL predicate accepts the navigation URL.
    fn match_host(&self, navigation: &ActivationNavigation) -> Result<SessionId, CandidateError> {
        if !navigation.is_primary_main_frame || navigation.is_speculative {
            return Err(CandidateError::NotPrimary);
        }
        if navigation.auxiliary_contexts > 0 {
            return Err(CandidateError::AuxiliaryContexts {
                count: navigation.auxiliary_contexts,
            });
        }
        self.active
            .iter()
            .find(|(_, host)| host.attributes().accepts(&navigation.url))
            .map(|(id, _)| *id)
            .ok_or(CandidateError::NoMatch)
    }

    /// Session `navigation` could activate, without side effects.
    #[must_use]
    pub fn find_candidate(&self, navigation: &ActivationNavigation) -> Option<SessionId> {
        let id = self.match_host(navigation).ok()?;
        let host = self.active.get(&id)?;
        host.check_activation(navigation, &NoopMetrics).ok()?;
        Some(id)
    }

    /// Reserve the session matching `navigation` for activation.
    ///
    /// A parameter or sandbox mismatch cancels the matched host. Match
    /// results are reported to metrics.
    pub fn try_reserve(
        &mut self,
        navigation: &ActivationNavigation,
        expected: SessionId,
    ) -> Result<SessionId, CandidateError> {
        let id = self.match_host(navigation)?;
        let checked = match self.active.get(&id) {
            Some(host) => host.check_activation(navigation, self.metrics.as_ref()),
            None => Err(CandidateError::NoMatch),
        };
        match checked {
            Ok(()) => {}
            Err(error @ CandidateError::ParameterMismatch { mismatch }) => {
                tracing::info!(
                    session_id = %id,
                    mismatch = mismatch.as_str(),
                    "Activation parameters differ"
                );
                self.cancel_host(id, FinalStatus::ActivationNavigationParameterMismatch);
                return Err(error);
            }
            Err(error @ CandidateError::FramePolicyMismatch) => {
                self.cancel_host(id, FinalStatus::ActivationFramePolicyNotCompatible);
                return Err(error);
            }
            Err(error) => return Err(error),
        }
        if id != expected {
            return Err(CandidateError::UnexpectedSession {
                expected,
                found: id,
            });
        }

        let Some(mut host) = self.active.remove(&id) else {
            return Err(CandidateError::NoMatch);
        };
        host.set_reserved(true);
        self.reserved.insert(id, host);
        tracing::debug!(session_id = %id, url = %navigation.url, "Speculation reserved");
        Ok(id)
    }

    /// [`Self::try_reserve`] without the reason for a miss.
    pub fn reserve(
        &mut self,
        navigation: &ActivationNavigation,
        expected: SessionId,
    ) -> Option<SessionId> {
        self.try_reserve(navigation, expected).ok()
    }

    /// Swap the reserved session's tree into `target`.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not reserved.
    pub fn activate_reserved(
        &mut self,
        id: SessionId,
        navigation: &ActivationNavigation,
        target: &mut PrimaryContents,
    ) -> TransferredTree {
        let Some(host) = self.reserved.get_mut(&id) else {
            panic!("session {id} is not reserved for activation");
        };
        let transferred = host.activate(navigation, target);
        self.metrics.record_final_status(
            host.trigger_type(),
            &host.attributes().histogram_suffix,
            FinalStatus::Activated,
        );
        transferred
    }

    /// The activation navigation finished; the reserved host is destroyed
    /// immediately. Returns `false` if `id` is not reserved.
    ///
    /// A reservation whose activation never ran must go through
    /// [`Self::abandon_reservation`] instead.
    ///
    /// # Panics
    ///
    /// Panics if `id` is reserved but was never activated.
    pub fn on_activation_finished(&mut self, id: SessionId) -> bool {
        let Some(host) = self.reserved.remove(&id) else {
            return false;
        };
        assert!(
            host.final_status() == Some(FinalStatus::Activated),
            "session {id} finished activation without being activated"
        );
        self.remember(id, FinalStatus::Activated);
        drop(host);
        true
    }

    /// The activation navigation died before committing. A host that was
    /// not yet activated is canceled with `reason`.
    pub fn abandon_reservation(&mut self, id: SessionId, reason: FinalStatus) -> bool {
        let Some(mut host) = self.reserved.remove(&id) else {
            return false;
        };
        host.set_reserved(false);
        if host.cancel(reason) {
            self.metrics
                .record_final_status(host.trigger_type(), &host.attributes().histogram_suffix, reason);
            tracing::info!(
                session_id = %id,
                final_status = %reason,
                "Reservation abandoned"
            );
        }
        self.pending_deletion.push(host);
        true
    }

    // =========================================================================
    // Memory
    // =========================================================================

    /// Apply a memory sample for `id`. Samples for sessions that are gone,
    /// terminal or reserved are dropped.
    pub fn on_memory_sample(&mut self, id: SessionId, result: SampleResult) -> Option<FinalStatus> {
        if self.reserved.contains_key(&id) || !self.active.contains_key(&id) {
            tracing::debug!(session_id = %id, "Memory sample for inactive session dropped");
            return None;
        }
        let status = match result {
            Ok(usage) if usage.exceeds(self.memory_budget_percent) => {
                tracing::warn!(
                    session_id = %id,
                    percent = usage.percent(),
                    budget_percent = self.memory_budget_percent,
                    "Memory budget exceeded"
                );
                FinalStatus::MemoryLimitExceeded
            }
            Ok(usage) => {
                tracing::trace!(session_id = %id, percent = usage.percent(), "Memory within budget");
                return None;
            }
            Err(error) => {
                tracing::warn!(session_id = %id, error = %error, "Memory sample failed");
                FinalStatus::FailToGetMemoryUsage
            }
        };
        self.cancel_host(id, status);
        Some(status)
    }

    /// Wait for the governor's next report and apply it. Returns false when
    /// nothing is in flight.
    pub async fn process_next_memory_sample(&mut self) -> bool {
        let Some(governor) = self.governor.as_mut() else {
            return false;
        };
        let Some(report) = governor.recv().await else {
            return false;
        };
        self.on_memory_sample(report.session, report.result);
        true
    }

    // =========================================================================
    // Navigation events
    // =========================================================================
    //
    // Each event is forwarded to the active host `id`. When the host rejects
    // it, the host is canceled with the returned status. Events for reserved
    // or unknown sessions are ignored and return `None`.

    fn route(
        &mut self,
        id: SessionId,
        f: impl FnOnce(&mut SpeculationHost) -> Option<FinalStatus>,
    ) -> Option<FinalStatus> {
        let host = self.active.get_mut(&id)?;
        let status = f(host)?;
        self.cancel_host(id, status);
        Some(status)
    }

    /// A navigation started in the speculative root. Only the initial
    /// navigation is allowed.
    pub fn on_navigation_started(
        &mut self,
        id: SessionId,
        navigation: NavigationId,
        url: &Url,
        params: &NavigationParams,
    ) -> Option<FinalStatus> {
        self.route(id, |host| host.on_navigation_started(navigation, url, params))
    }

    /// The initial navigation redirected. Cross-origin redirects of
    /// embedder-triggered sessions also record their classification.
    pub fn on_redirect(
        &mut self,
        id: SessionId,
        navigation: NavigationId,
        redirect: &RedirectInfo,
    ) -> Option<FinalStatus> {
        let metrics = Arc::clone(&self.metrics);
        self.route(id, |host| {
            let status = host.on_redirect(navigation, redirect)?;
            if let Some(classification) = host.gate().redirect_classification() {
                metrics.record_cross_origin_redirect(
                    host.trigger_type(),
                    &host.attributes().histogram_suffix,
                    classification,
                );
                tracing::info!(
                    session_id = %host.id(),
                    target = %redirect.url,
                    classification = ?classification.names(),
                    "Embedder speculation redirected cross-origin"
                );
            }
            Some(status)
        })
    }

    /// Final response headers arrived; checks opt-in, downloads and the
    /// HTTP status.
    pub fn on_response(
        &mut self,
        id: SessionId,
        navigation: NavigationId,
        response: &ResponseInfo,
    ) -> Option<FinalStatus> {
        self.route(id, |host| host.on_response(navigation, response))
    }

    /// The initial navigation committed or failed. A commit only makes the
    /// session ready after [`Self::on_response`] accepted a response.
    pub fn on_navigation_finished(
        &mut self,
        id: SessionId,
        navigation: NavigationId,
        outcome: NavigationOutcome,
    ) -> Option<FinalStatus> {
        self.route(id, |host| host.on_navigation_finished(navigation, outcome))
    }

    /// A subresource or subframe load failed. Only
    /// [`NetError::BlockedByClient`] cancels.
    pub fn on_resource_load_failed(&mut self, id: SessionId, error: NetError) -> Option<FinalStatus> {
        self.route(id, |host| host.on_resource_load_failed(error))
    }

    /// The owning context changed visibility; applies to every active host.
    pub fn on_visibility_changed(
        &mut self,
        visibility: Visibility,
        now: Instant,
    ) -> Vec<(SessionId, FinalStatus)> {
        let cancels: Vec<(SessionId, FinalStatus)> = self
            .active
            .iter_mut()
            .filter_map(|(id, host)| host.on_visibility_changed(visibility, now).map(|s| (*id, s)))
            .collect();
        for (id, status) in &cancels {
            self.cancel_host(*id, *status);
        }
        cancels
    }

    // =========================================================================
    // Housekeeping
    // =========================================================================

    /// Fire expired background timers, apply finished memory samples, then
    /// destroy every host queued for deletion. Returns the number destroyed.
    pub fn tick(&mut self, now: Instant) -> usize {
        let expired: Vec<(SessionId, FinalStatus)> = self
            .active
            .iter_mut()
            .filter_map(|(id, host)| host.on_timer(now).map(|s| (*id, s)))
            .collect();
        for (id, status) in expired {
            self.cancel_host(id, status);
        }

        while let Some(report) = self.governor.as_mut().and_then(MemoryGovernor::try_recv) {
            self.on_memory_sample(report.session, report.result);
        }

        let doomed = std::mem::take(&mut self.pending_deletion);
        let count = doomed.len();
        for host in doomed {
            self.remember(host.id(), host.final_status().unwrap_or(FinalStatus::Destroyed));
            drop(host);
        }
        if count > 0 {
            tracing::debug!(destroyed = count, "Deferred deletion drained");
        }
        count
    }

    fn remember(&mut self, id: SessionId, status: FinalStatus) {
        if self.config.finished_history == 0 {
            return;
        }
        while self.finished.len() >= self.config.finished_history {
            self.finished.pop_front();
        }
        self.finished.push_back((id, status));
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// `id` is loading or ready, but not reserved.
    #[must_use]
    pub fn is_active(&self, id: SessionId) -> bool {
        self.active.contains_key(&id)
    }

    #[must_use]
    pub fn is_reserved(&self, id: SessionId) -> bool {
        self.reserved.contains_key(&id)
    }

    #[must_use]
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    #[must_use]
    pub fn reserved_len(&self) -> usize {
        self.reserved.len()
    }

    /// Canceled hosts waiting for the next [`Self::tick`].
    #[must_use]
    pub fn pending_deletion_len(&self) -> usize {
        self.pending_deletion.len()
    }

    #[must_use]
    pub fn active_ids(&self) -> Vec<SessionId> {
        self.active.keys().copied().collect()
    }

    /// Live host (active or reserved).
    #[must_use]
    pub fn host(&self, id: SessionId) -> Option<&SpeculationHost> {
        self.active.get(&id).or_else(|| self.reserved.get(&id))
    }

    /// Mutable access to a live host. Cancel through the registry, not the
    /// host, so deletion is queued.
    pub fn host_mut(&mut self, id: SessionId) -> Option<&mut SpeculationHost> {
        match self.active.get_mut(&id) {
            Some(host) => Some(host),
            None => self.reserved.get_mut(&id),
        }
    }

    /// Terminal status of `id`, if known: live and pending hosts first, then
    /// the bounded history of destroyed ones.
    #[must_use]
    pub fn final_status(&self, id: SessionId) -> Option<FinalStatus> {
        if let Some(host) = self.host(id) {
            return host.final_status();
        }
        if let Some(host) = self.pending_deletion.iter().find(|host| host.id() == id) {
            return host.final_status();
        }
        self.finished
            .iter()
            .rev()
            .find(|(finished, _)| *finished == id)
            .map(|(_, status)| *status)
    }

    /// Structural invariants that must hold between calls. Empty when
    /// consistent.
    #[must_use]
    pub fn invariant_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        for (id, host) in &self.active {
            if self.reserved.contains_key(id) {
                violations.push(format!("session {id} is both active and reserved"));
            }
            if host.final_status().is_some() {
                violations.push(format!("active session {id} is terminal"));
            }
            if host.is_reserved() {
                violations.push(format!("active session {id} carries the reserved flag"));
            }
            if host.id() != *id {
                violations.push(format!("session {id} stored under the wrong key"));
            }
        }
        for (id, host) in &self.reserved {
            if !host.is_reserved() {
                violations.push(format!("reserved session {id} lacks the reserved flag"));
            }
            match host.final_status() {
                None if !host.is_ready_for_activation() => {
                    violations.push(format!("reserved session {id} is not ready"));
                }
                Some(status) if status != FinalStatus::Activated => {
                    violations.push(format!("reserved session {id} finished with {status}"));
                }
                _ => {}
            }
        }
        for host in &self.pending_deletion {
            if host.final_status().is_none() {
                violations.push(format!("pending session {} has no final status", host.id()));
            }
        }
        for trigger in [TriggerType::SpeculationRule, TriggerType::Embedder] {
            let running = self
                .active
                .values()
                .filter(|host| host.trigger_type() == trigger)
                .count();
            if running > self.session_limit(trigger) {
                violations.push(format!("{running} active {trigger} sessions exceed the limit"));
            }
        }
        if self.finished.len() > self.config.finished_history {
            violations.push("finished history exceeds its bound".to_string());
        }
        violations
    }
}
