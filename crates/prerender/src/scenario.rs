//! Scripted scenarios for `prerender simulate`.
//!
//! A scenario is a TOML document describing the owning context and a list of
//! steps. Each step drives the in-process registry the way a trigger, the
//! loading pipeline or an activation navigation would, and produces one
//! [`StepReport`].

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};

use prerender_core::attempt::SharedAttempt;
use prerender_core::attributes::{PageTransition, SpeculationAttributes, TriggerType, Url, parse_origin};
use prerender_core::config::Config;
use prerender_core::context::{StaticOwnerContext, Visibility};
use prerender_core::host::HostPhase;
use prerender_core::memory::{MemoryGovernor, MemoryProbe, MemoryUsage, SystemMemoryProbe};
use prerender_core::metrics::{MetricsSummary, RecordingMetrics, SpeculationMetrics};
use prerender_core::navigation::{
    ActivationNavigation, Headers, NavigationId, NavigationOutcome, NavigationParams,
    NavigationRequest, NavigationStart, NetError, RedirectInfo, RequestContextType, ResponseInfo,
};
use prerender_core::session::{NavigationLoader, PrimaryContents, SessionId};
use prerender_core::status::{FinalStatus, RejectReason, TriggeringOutcome};
use prerender_core::tree::NodeId;
use prerender_core::{CandidateError, SpeculationRegistry};

// =============================================================================
// Scenario file
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub owner: StaticOwnerContext,
    #[serde(default, rename = "step")]
    pub steps: Vec<Step>,
}

/// How the loader answers the next initial navigation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartMode {
    #[default]
    Start,
    NotStarted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishOutcome {
    #[default]
    Committed,
    Failed,
    NotCommitted,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum Step {
    Create {
        label: String,
        url: String,
        #[serde(default = "default_trigger")]
        trigger: TriggerType,
        initiator: Option<String>,
        #[serde(default)]
        suffix: String,
        #[serde(default)]
        start: StartMode,
        preflight_error: Option<NetError>,
    },
    StartNavigation {
        session: String,
        url: String,
    },
    Redirect {
        session: String,
        url: String,
        #[serde(default = "default_redirect_status")]
        status: u16,
    },
    Response {
        session: String,
        #[serde(default = "default_response_status")]
        status: u16,
        #[serde(default)]
        download: bool,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    Finish {
        session: String,
        #[serde(default)]
        outcome: FinishOutcome,
        error: Option<NetError>,
    },
    ResourceBlocked {
        session: String,
    },
    Visibility {
        state: Visibility,
    },
    MemorySample {
        session: String,
        process_bytes: Option<u64>,
        total_bytes: Option<u64>,
    },
    Navigate {
        url: String,
        session: Option<String>,
        initiator: Option<String>,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        auxiliary_contexts: usize,
    },
    OwnerDestroyed {
        session: String,
    },
    CancelAll,
    Tick {
        #[serde(default)]
        advance_ms: u64,
    },
}

fn default_trigger() -> TriggerType {
    TriggerType::SpeculationRule
}

const fn default_redirect_status() -> u16 {
    302
}

const fn default_response_status() -> u16 {
    200
}

impl Step {
    fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::StartNavigation { .. } => "start_navigation",
            Self::Redirect { .. } => "redirect",
            Self::Response { .. } => "response",
            Self::Finish { .. } => "finish",
            Self::ResourceBlocked { .. } => "resource_blocked",
            Self::Visibility { .. } => "visibility",
            Self::MemorySample { .. } => "memory_sample",
            Self::Navigate { .. } => "navigate",
            Self::OwnerDestroyed { .. } => "owner_destroyed",
            Self::CancelAll => "cancel_all",
            Self::Tick { .. } => "tick",
        }
    }
}

impl Scenario {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid scenario")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("in {}", path.display()))
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Outcome of one step, printed as one JSON line.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepReport {
    pub step: usize,
    pub op: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected: Option<RejectReason>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cancelled: Vec<Cancellation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<HostPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate_error: Option<CandidateError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activated_nodes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destroyed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_percent: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Cancellation {
    pub session: SessionId,
    pub status: FinalStatus,
}

/// Final state of one labelled session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub session: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_status: Option<FinalStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<HostPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TriggeringOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScenarioSummary {
    pub scenario: String,
    pub steps: usize,
    pub sessions: BTreeMap<String, SessionSummary>,
    pub metrics: MetricsSummary,
}

// =============================================================================
// Loader
// =============================================================================

#[derive(Debug, Default)]
struct LoaderState {
    next_navigation: u64,
    queued: VecDeque<NavigationStart>,
}

impl LoaderState {
    fn allocate(&mut self) -> NavigationId {
        self.next_navigation += 1;
        NavigationId(self.next_navigation)
    }
}

/// Loader answering each initial navigation from a queue, starting it
/// normally when the queue is empty.
#[derive(Debug, Clone, Default)]
struct ScriptedLoader {
    state: Arc<Mutex<LoaderState>>,
}

impl ScriptedLoader {
    fn with_state<T>(&self, f: impl FnOnce(&mut LoaderState) -> T) -> T {
        f(&mut self.state.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn queue(&self, start: NavigationStart) {
        self.with_state(|state| state.queued.push_back(start));
    }

    fn allocate(&self) -> NavigationId {
        self.with_state(LoaderState::allocate)
    }
}

impl NavigationLoader for ScriptedLoader {
    fn begin_navigation(&mut self, root: NodeId, request: &NavigationRequest) -> NavigationStart {
        self.with_state(|state| match state.queued.pop_front() {
            Some(start) => start,
            None => {
                let navigation = state.allocate();
                tracing::debug!(root = %root, navigation = %navigation, url = %request.url, "Loader started navigation");
                NavigationStart::Started {
                    navigation,
                    params: request.params(),
                }
            }
        })
    }
}

// =============================================================================
// Runner
// =============================================================================

pub struct Runner {
    registry: SpeculationRegistry,
    loader: ScriptedLoader,
    metrics: Arc<RecordingMetrics>,
    owner: StaticOwnerContext,
    primary: PrimaryContents,
    labels: BTreeMap<String, SessionId>,
    attempts: BTreeMap<String, SharedAttempt>,
    probe: SystemMemoryProbe,
    clock: Instant,
    elapsed: Duration,
}

impl Runner {
    /// Runner for `scenario` under `config`. Must be called inside a tokio
    /// runtime when the memory governor is enabled.
    pub fn new(config: &Config, scenario: &Scenario) -> Self {
        let loader = ScriptedLoader::default();
        let metrics = Arc::new(RecordingMetrics::new());
        let mut registry =
            SpeculationRegistry::new(config.speculation.clone(), Box::new(loader.clone()))
                .with_metrics(Arc::clone(&metrics) as Arc<dyn SpeculationMetrics>)
                .with_memory_budget(config.memory.budget_percent);
        if config.memory.enabled {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                registry = registry
                    .with_memory_governor(MemoryGovernor::with_system_probe(handle, &config.memory));
            }
        }
        let primary = PrimaryContents::new(registry.node_ids());
        Self {
            registry,
            loader,
            metrics,
            owner: scenario.owner.clone(),
            primary,
            labels: BTreeMap::new(),
            attempts: BTreeMap::new(),
            probe: SystemMemoryProbe::new(),
            clock: Instant::now(),
            elapsed: Duration::ZERO,
        }
    }

    fn now(&self) -> Instant {
        self.clock + self.elapsed
    }

    fn session(&self, label: &str) -> Result<SessionId> {
        self.labels
            .get(label)
            .copied()
            .ok_or_else(|| anyhow!("unknown session label {label:?}"))
    }

    fn initial_navigation(&self, id: SessionId) -> NavigationId {
        self.registry
            .host(id)
            .and_then(|host| host.gate().initial_navigation())
            .unwrap_or(NavigationId(0))
    }

    fn phase(&self, id: SessionId) -> Option<HostPhase> {
        self.registry.host(id).map(|host| host.phase())
    }

    fn cancellation(id: SessionId, status: Option<FinalStatus>) -> Vec<Cancellation> {
        status
            .map(|status| Cancellation { session: id, status })
            .into_iter()
            .collect()
    }

    /// Apply one step.
    pub async fn apply(&mut self, index: usize, step: &Step) -> Result<StepReport> {
        let mut report = StepReport {
            step: index,
            op: step.name(),
            ..StepReport::default()
        };
        match step {
            Step::Create {
                label,
                url,
                trigger,
                initiator,
                suffix,
                start,
                preflight_error,
            } => {
                if self.labels.contains_key(label) {
                    bail!("duplicate session label {label:?}");
                }
                let url = Url::parse(url).with_context(|| format!("invalid url {url:?}"))?;
                let attrs = match trigger {
                    TriggerType::SpeculationRule => {
                        let initiator = initiator
                            .as_deref()
                            .ok_or_else(|| anyhow!("rule-based create needs an initiator"))?;
                        SpeculationAttributes::rule_based(url, parse_origin(initiator)?)
                    }
                    TriggerType::Embedder => SpeculationAttributes::embedder(url, suffix.clone()),
                };
                if let Some(error) = preflight_error {
                    self.loader.queue(NavigationStart::FailedBeforeStart(*error));
                } else if *start == StartMode::NotStarted {
                    self.loader.queue(NavigationStart::NotStarted);
                }
                let attempt = SharedAttempt::new();
                report.label = Some(label.clone());
                match self
                    .registry
                    .create_and_start(attrs, &self.owner, Some(attempt.boxed()))
                {
                    Ok(id) => {
                        self.labels.insert(label.clone(), id);
                        report.session = Some(id);
                        report.phase = self.phase(id);
                        report.cancelled = match self.phase(id) {
                            Some(_) => Vec::new(),
                            None => Self::cancellation(id, self.registry.final_status(id)),
                        };
                    }
                    Err(reason) => report.rejected = Some(reason),
                }
                self.attempts.insert(label.clone(), attempt);
            }
            Step::StartNavigation { session, url } => {
                let id = self.session(session)?;
                let url = Url::parse(url)?;
                let navigation = self.loader.allocate();
                let cancelled = self.registry.on_navigation_started(
                    id,
                    navigation,
                    &url,
                    &NavigationParams::default(),
                );
                report.session = Some(id);
                report.cancelled = Self::cancellation(id, cancelled);
            }
            Step::Redirect {
                session,
                url,
                status,
            } => {
                let id = self.session(session)?;
                let redirect = RedirectInfo {
                    url: Url::parse(url)?,
                    status: *status,
                };
                let navigation = self.initial_navigation(id);
                let cancelled = self.registry.on_redirect(id, navigation, &redirect);
                report.session = Some(id);
                report.cancelled = Self::cancellation(id, cancelled);
            }
            Step::Response {
                session,
                status,
                download,
                headers,
            } => {
                let id = self.session(session)?;
                let response = ResponseInfo {
                    status: *status,
                    headers: to_headers(headers),
                    is_download: *download,
                };
                let navigation = self.initial_navigation(id);
                let cancelled = self.registry.on_response(id, navigation, &response);
                report.session = Some(id);
                report.cancelled = Self::cancellation(id, cancelled);
            }
            Step::Finish {
                session,
                outcome,
                error,
            } => {
                let id = self.session(session)?;
                let ready = self
                    .registry
                    .host(id)
                    .is_some_and(|host| host.is_ready_for_activation());
                if ready && *outcome == FinishOutcome::Committed {
                    bail!("session {session:?} already committed");
                }
                let outcome = match outcome {
                    FinishOutcome::Committed => NavigationOutcome::Committed,
                    FinishOutcome::Failed => {
                        NavigationOutcome::Failed(error.unwrap_or(NetError::ConnectionFailed))
                    }
                    FinishOutcome::NotCommitted => NavigationOutcome::NotCommitted,
                };
                let navigation = self.initial_navigation(id);
                let cancelled = self.registry.on_navigation_finished(id, navigation, outcome);
                report.session = Some(id);
                report.cancelled = Self::cancellation(id, cancelled);
                report.phase = self.phase(id);
            }
            Step::ResourceBlocked { session } => {
                let id = self.session(session)?;
                let cancelled = self
                    .registry
                    .on_resource_load_failed(id, NetError::BlockedByClient);
                report.session = Some(id);
                report.cancelled = Self::cancellation(id, cancelled);
            }
            Step::Visibility { state } => {
                self.owner.visibility = *state;
                let now = self.now();
                report.cancelled = self
                    .registry
                    .on_visibility_changed(*state, now)
                    .into_iter()
                    .map(|(session, status)| Cancellation { session, status })
                    .collect();
            }
            Step::MemorySample {
                session,
                process_bytes,
                total_bytes,
            } => {
                let id = self.session(session)?;
                let sample = match (process_bytes, total_bytes) {
                    (Some(process), Some(total)) => Ok(MemoryUsage {
                        process_bytes: *process,
                        total_system_bytes: *total,
                    }),
                    (None, None) => self.probe.sample().await,
                    _ => bail!("memory_sample needs both process_bytes and total_bytes, or neither"),
                };
                report.memory_percent = sample.as_ref().ok().map(MemoryUsage::percent);
                let cancelled = self.registry.on_memory_sample(id, sample);
                report.session = Some(id);
                report.cancelled = Self::cancellation(id, cancelled);
            }
            Step::Navigate {
                url,
                session,
                initiator,
                headers,
                auxiliary_contexts,
            } => {
                let url = Url::parse(url)?;
                let initiator = initiator.as_deref().map(parse_origin).transpose()?;
                let mut navigation =
                    ActivationNavigation::primary(url, activation_params(initiator, headers));
                navigation.auxiliary_contexts = *auxiliary_contexts;

                let candidate = self.registry.find_candidate(&navigation);
                report.candidate = candidate;
                let expected = match session {
                    Some(label) => self.session(label)?,
                    None => candidate.unwrap_or(SessionId(0)),
                };
                report.session = Some(expected);
                let was_active = self.registry.is_active(expected);
                match self.registry.try_reserve(&navigation, expected) {
                    Ok(id) => {
                        let transferred =
                            self.registry
                                .activate_reserved(id, &navigation, &mut self.primary);
                        self.registry.on_activation_finished(id);
                        report.activated_nodes = Some(transferred.nodes.len());
                    }
                    Err(error) => {
                        report.candidate_error = Some(error);
                        if was_active && !self.registry.is_active(expected) {
                            report.cancelled =
                                Self::cancellation(expected, self.registry.final_status(expected));
                        }
                    }
                }
            }
            Step::OwnerDestroyed { session } => {
                let id = self.session(session)?;
                if self.registry.notify_owner_destroyed(id) {
                    report.cancelled = Self::cancellation(id, self.registry.final_status(id));
                }
                report.session = Some(id);
            }
            Step::CancelAll => {
                let active = self.registry.active_ids();
                self.registry.cancel_all(FinalStatus::CancelAllHosts);
                report.cancelled = active
                    .into_iter()
                    .map(|session| Cancellation {
                        session,
                        status: FinalStatus::CancelAllHosts,
                    })
                    .collect();
            }
            Step::Tick { advance_ms } => {
                self.elapsed += Duration::from_millis(*advance_ms);
                let before = self.registry.active_ids();
                let now = self.now();
                report.destroyed = Some(self.registry.tick(now));
                report.cancelled = before
                    .into_iter()
                    .filter(|id| !self.registry.is_active(*id))
                    .filter_map(|id| {
                        self.registry
                            .final_status(id)
                            .map(|status| Cancellation { session: id, status })
                    })
                    .collect();
            }
        }
        tracing::debug!(step = index, op = report.op, "Scenario step applied");
        Ok(report)
    }

    pub fn summary(&self, name: &str, steps: usize) -> ScenarioSummary {
        let sessions = self
            .labels
            .iter()
            .map(|(label, id)| {
                let summary = SessionSummary {
                    session: *id,
                    final_status: self.registry.final_status(*id),
                    phase: self.phase(*id),
                    outcome: self
                        .attempts
                        .get(label)
                        .and_then(|attempt| attempt.snapshot().outcome()),
                };
                (label.clone(), summary)
            })
            .collect();
        ScenarioSummary {
            scenario: name.to_string(),
            steps,
            sessions,
            metrics: self.metrics.summary(),
        }
    }
}

fn to_headers(map: &BTreeMap<String, String>) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in map {
        headers.append(name, value);
    }
    headers
}

/// Parameters of an ordinary navigation: a link click when there is an
/// initiator, otherwise an address-bar navigation.
fn activation_params(
    initiator: Option<prerender_core::attributes::Origin>,
    headers: &BTreeMap<String, String>,
) -> NavigationParams {
    let (request_context_type, transition) = if initiator.is_some() {
        (RequestContextType::Hyperlink, PageTransition::LINK)
    } else {
        (
            RequestContextType::Location,
            PageTransition::TYPED.with_qualifier(PageTransition::FROM_ADDRESS_BAR),
        )
    };
    NavigationParams {
        initiator_origin: initiator,
        headers: to_headers(headers),
        request_context_type,
        transition,
        ..NavigationParams::default()
    }
}

/// Run every step of `scenario`, handing each report to `emit`.
pub async fn run(
    config: &Config,
    scenario: &Scenario,
    mut emit: impl FnMut(&StepReport) -> Result<()>,
) -> Result<ScenarioSummary> {
    let mut runner = Runner::new(config, scenario);
    for (index, step) in scenario.steps.iter().enumerate() {
        let report = runner
            .apply(index, step)
            .await
            .with_context(|| format!("step {index} ({})", step.name()))?;
        emit(&report)?;
    }
    Ok(runner.summary(&scenario.name, scenario.steps.len()))
}
