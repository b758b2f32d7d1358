//! End-to-end registry scenarios.
//!
//! These drive the registry the way a browser would: a trigger admits a
//! speculation, the loading pipeline reports navigation progress, and an
//! activation navigation reserves, activates and finishes.
//!
//! A. Reserve and activate a ready session
//! B. Header mismatch discards the session
//! C. Cross-site redirect cancels a renderer-initiated session
//! D. Memory budget cancels only the sampled session
//! E. Observers and deferred deletion

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use prerender_core::attempt::SharedAttempt;
use prerender_core::attributes::{PageTransition, SpeculationAttributes, Url, parse_origin};
use prerender_core::config::{MemoryGovernorConfig, SpeculationConfig};
use prerender_core::context::{StaticOwnerContext, Visibility};
use prerender_core::matcher::ActivationMismatch;
use prerender_core::memory::{MemoryGovernor, MemoryProbe, MemoryUsage, SampleResult};
use prerender_core::metrics::{RecordingMetrics, SpeculationMetrics};
use prerender_core::navigation::{
    ActivationNavigation, NavigationId, NavigationOutcome, NavigationRequest, NavigationStart,
    RedirectInfo, ResponseInfo,
};
use prerender_core::observer::{HostEvent, HostObserver};
use prerender_core::session::{NavigationLoader, PrimaryContents, SessionId};
use prerender_core::status::{FinalStatus, RejectReason, TriggeringOutcome};
use prerender_core::tree::NodeId;
use prerender_core::{CandidateError, SpeculationRegistry};
use tokio::runtime::Handle;

// =============================================================================
// Fixtures
// =============================================================================

/// Starts every navigation and hands out sequential navigation ids.
#[derive(Default)]
struct SequentialLoader {
    next: u64,
}

impl NavigationLoader for SequentialLoader {
    fn begin_navigation(&mut self, _root: NodeId, request: &NavigationRequest) -> NavigationStart {
        self.next += 1;
        NavigationStart::Started {
            navigation: NavigationId(self.next),
            params: request.params(),
        }
    }
}

fn registry(config: SpeculationConfig) -> (SpeculationRegistry, Arc<RecordingMetrics>) {
    let metrics = Arc::new(RecordingMetrics::new());
    let registry = SpeculationRegistry::new(config, Box::new(SequentialLoader::default()))
        .with_metrics(Arc::clone(&metrics) as Arc<dyn SpeculationMetrics>);
    (registry, metrics)
}

fn rule_based(url: &str) -> SpeculationAttributes {
    SpeculationAttributes::rule_based(
        Url::parse(url).unwrap(),
        parse_origin("https://a.example/").unwrap(),
    )
}

fn initial_navigation(registry: &SpeculationRegistry, id: SessionId) -> NavigationId {
    registry
        .host(id)
        .unwrap()
        .gate()
        .initial_navigation()
        .unwrap()
}

fn commit(registry: &mut SpeculationRegistry, id: SessionId) {
    let nav = initial_navigation(registry, id);
    assert_eq!(registry.on_response(id, nav, &ResponseInfo::ok()), None);
    assert_eq!(
        registry.on_navigation_finished(id, nav, NavigationOutcome::Committed),
        None
    );
}

fn identical_navigation(registry: &SpeculationRegistry, id: SessionId) -> ActivationNavigation {
    let host = registry.host(id).unwrap();
    ActivationNavigation::primary(host.url().clone(), host.initial_params().unwrap().clone())
}

#[derive(Default)]
struct EventLog(Mutex<Vec<(SessionId, HostEvent)>>);

impl HostObserver for EventLog {
    fn on_host_event(&self, session: SessionId, event: HostEvent) {
        self.0.lock().unwrap().push((session, event));
    }
}

// =============================================================================
// A. Reserve and activate
// =============================================================================

#[test]
fn ready_session_activates_for_identical_navigation() {
    let (mut registry, metrics) = registry(SpeculationConfig::default());
    let attempt = SharedAttempt::new();
    let id = registry
        .create_and_start(
            rule_based("https://a.example/target"),
            &StaticOwnerContext::default(),
            Some(attempt.boxed()),
        )
        .unwrap();
    commit(&mut registry, id);
    assert!(registry.host(id).unwrap().is_ready_for_activation());

    let nav = identical_navigation(&registry, id);
    assert_eq!(registry.find_candidate(&nav), Some(id));
    assert_eq!(registry.reserve(&nav, id), Some(id));

    let mut primary = PrimaryContents::new(registry.node_ids());
    let transferred = registry.activate_reserved(id, &nav, &mut primary);
    assert_eq!(transferred.root, id.root());
    assert_eq!(primary.tree.root(), id.root());
    assert_eq!(
        primary.tree.root_node().url.as_ref().map(Url::as_str),
        Some("https://a.example/target")
    );
    assert!(!primary.tree.root_node().speculative);

    assert!(registry.on_activation_finished(id));
    assert!(!registry.is_active(id));
    assert!(!registry.is_reserved(id));
    assert_eq!(registry.final_status(id), Some(FinalStatus::Activated));

    let log = attempt.snapshot();
    assert_eq!(
        log.outcomes,
        vec![
            TriggeringOutcome::Running,
            TriggeringOutcome::Ready,
            TriggeringOutcome::Success
        ]
    );
    assert!(log.failure.is_none());
    assert_eq!(metrics.summary().activation_matches, 1);
}

#[test]
fn activated_tree_keeps_subframes_and_proxies() {
    let (mut registry, _) = registry(SpeculationConfig::default());
    let id = registry
        .create_and_start(
            rule_based("https://a.example/target"),
            &StaticOwnerContext::default(),
            None,
        )
        .unwrap();
    let (child, proxy) = {
        let tree = registry
            .host_mut(id)
            .unwrap()
            .session_mut()
            .tree_mut()
            .unwrap();
        let child = tree
            .append_child(id.root(), Some(Url::parse("https://a.example/frame").unwrap()))
            .unwrap();
        let proxy = tree.add_proxy(child).unwrap();
        (child, proxy)
    };
    commit(&mut registry, id);

    let nav = identical_navigation(&registry, id);
    registry.reserve(&nav, id).unwrap();
    let mut primary = PrimaryContents::new(registry.node_ids());
    let transferred = registry.activate_reserved(id, &nav, &mut primary);

    assert_eq!(transferred.nodes, vec![id.root(), child]);
    assert_eq!(transferred.proxies, vec![proxy]);
    assert_eq!(primary.tree.node(child).unwrap().parent, Some(id.root()));
    assert_eq!(primary.tree.proxy(proxy).unwrap().owner, child);
}

// =============================================================================
// B. Parameter mismatch
// =============================================================================

#[test]
fn no_cache_candidate_does_not_reserve() {
    let (mut registry, metrics) = registry(SpeculationConfig::default());
    let id = registry
        .create_and_start(
            rule_based("https://a.example/target"),
            &StaticOwnerContext::default(),
            None,
        )
        .unwrap();
    commit(&mut registry, id);

    let mut nav = identical_navigation(&registry, id);
    nav.params.headers.insert("Cache-Control", "no-cache");
    assert_eq!(registry.reserve(&nav, id), None);
    assert_eq!(
        metrics.summary().activation_mismatches.get("headers"),
        Some(&1)
    );
    assert_eq!(
        registry.final_status(id),
        Some(FinalStatus::ActivationNavigationParameterMismatch)
    );
}

#[test]
fn mismatch_reports_first_group_difference() {
    let (mut registry, _) = registry(SpeculationConfig::default());
    let id = registry
        .create_and_start(
            rule_based("https://a.example/target"),
            &StaticOwnerContext::default(),
            None,
        )
        .unwrap();
    commit(&mut registry, id);

    let mut nav = identical_navigation(&registry, id);
    nav.params.initiator_origin = Some(parse_origin("https://other.example/").unwrap());
    nav.params.transition = PageTransition::TYPED;
    assert_eq!(
        registry.try_reserve(&nav, id),
        Err(CandidateError::ParameterMismatch {
            mismatch: ActivationMismatch::InitiatorOrigin
        })
    );
}

#[test]
fn not_ready_session_is_left_alone() {
    let (mut registry, _) = registry(SpeculationConfig::default());
    let id = registry
        .create_and_start(
            rule_based("https://a.example/target"),
            &StaticOwnerContext::default(),
            None,
        )
        .unwrap();
    let nav = identical_navigation(&registry, id);
    assert_eq!(registry.try_reserve(&nav, id), Err(CandidateError::NotReady));
    assert!(registry.is_active(id));
}

// =============================================================================
// C. Redirects
// =============================================================================

#[test]
fn cross_site_redirect_cancels_renderer_initiated() {
    let config = SpeculationConfig {
        same_site_cross_origin: true,
        ..SpeculationConfig::default()
    };
    let (mut registry, _) = registry(config);
    let id = registry
        .create_and_start(
            rule_based("https://a.example/x"),
            &StaticOwnerContext::default(),
            None,
        )
        .unwrap();
    let nav = initial_navigation(&registry, id);
    let redirect = RedirectInfo {
        url: Url::parse("https://b.evil/y").unwrap(),
        status: 302,
    };
    assert_eq!(
        registry.on_redirect(id, nav, &redirect),
        Some(FinalStatus::CrossOriginRedirect)
    );

    for url in ["https://a.example/x", "https://b.evil/y"] {
        let candidate = ActivationNavigation::primary(Url::parse(url).unwrap(), Default::default());
        assert_eq!(registry.find_candidate(&candidate), None);
    }
}

#[test]
fn same_site_redirect_requires_opt_in() {
    let config = SpeculationConfig {
        same_site_cross_origin: true,
        ..SpeculationConfig::default()
    };
    let (mut registry, _) = registry(config);
    let owner = StaticOwnerContext::default();

    let id = registry
        .create_and_start(rule_based("https://a.example/x"), &owner, None)
        .unwrap();
    let nav = initial_navigation(&registry, id);
    let redirect = RedirectInfo {
        url: Url::parse("https://sub.a.example/y").unwrap(),
        status: 302,
    };
    assert_eq!(registry.on_redirect(id, nav, &redirect), None);
    assert_eq!(
        registry.on_response(id, nav, &ResponseInfo::ok()),
        Some(FinalStatus::SameSiteCrossOriginRedirectNotOptIn)
    );
    registry.tick(Instant::now());

    let id = registry
        .create_and_start(rule_based("https://a.example/z"), &owner, None)
        .unwrap();
    let nav = initial_navigation(&registry, id);
    assert_eq!(registry.on_redirect(id, nav, &redirect), None);
    let mut response = ResponseInfo::ok();
    response.headers.insert(
        ResponseInfo::SUPPORTS_LOADING_MODE,
        ResponseInfo::CREDENTIALED_PRERENDER,
    );
    assert_eq!(registry.on_response(id, nav, &response), None);
    assert_eq!(
        registry.on_navigation_finished(id, nav, NavigationOutcome::Committed),
        None
    );
    assert!(registry.host(id).unwrap().is_ready_for_activation());
}

#[test]
fn same_site_commit_without_response_is_not_ready() {
    let config = SpeculationConfig {
        same_site_cross_origin: true,
        ..SpeculationConfig::default()
    };
    let (mut registry, _) = registry(config);
    let id = registry
        .create_and_start(
            rule_based("https://sub.a.example/page"),
            &StaticOwnerContext::default(),
            None,
        )
        .unwrap();
    let nav = initial_navigation(&registry, id);
    assert_eq!(
        registry.on_navigation_finished(id, nav, NavigationOutcome::Committed),
        Some(FinalStatus::SameSiteCrossOriginNavigationNotOptIn)
    );
    let candidate = ActivationNavigation::primary(
        Url::parse("https://sub.a.example/page").unwrap(),
        Default::default(),
    );
    assert_eq!(registry.find_candidate(&candidate), None);

    registry.tick(Instant::now());
    assert_eq!(
        registry.final_status(id),
        Some(FinalStatus::SameSiteCrossOriginNavigationNotOptIn)
    );
}

#[test]
fn same_origin_commit_without_response_is_not_ready() {
    let (mut registry, _) = registry(SpeculationConfig::default());
    let id = registry
        .create_and_start(
            rule_based("https://a.example/page"),
            &StaticOwnerContext::default(),
            None,
        )
        .unwrap();
    let nav = initial_navigation(&registry, id);
    assert_eq!(
        registry.on_navigation_finished(id, nav, NavigationOutcome::Committed),
        Some(FinalStatus::NavigationNotCommitted)
    );
    assert!(registry.host(id).is_none());
}

#[test]
fn download_and_bad_status_cancel() {
    let config = SpeculationConfig {
        max_rule_based_sessions: 2,
        ..SpeculationConfig::default()
    };
    let (mut registry, metrics) = registry(config);
    let owner = StaticOwnerContext::default();
    let a = registry
        .create_and_start(rule_based("https://a.example/a"), &owner, None)
        .unwrap();
    let b = registry
        .create_and_start(rule_based("https://a.example/b"), &owner, None)
        .unwrap();

    let mut download = ResponseInfo::ok();
    download.is_download = true;
    let nav = initial_navigation(&registry, a);
    assert_eq!(
        registry.on_response(a, nav, &download),
        Some(FinalStatus::Download)
    );

    let not_found = ResponseInfo {
        status: 404,
        ..ResponseInfo::ok()
    };
    let nav = initial_navigation(&registry, b);
    assert_eq!(
        registry.on_response(b, nav, &not_found),
        Some(FinalStatus::NavigationBadHttpStatus)
    );
    assert_eq!(
        metrics.final_statuses(),
        vec![FinalStatus::Download, FinalStatus::NavigationBadHttpStatus]
    );
}

// =============================================================================
// D. Memory budget
// =============================================================================

struct ScriptedProbe(Mutex<VecDeque<SampleResult>>);

#[async_trait]
impl MemoryProbe for ScriptedProbe {
    async fn sample(&self) -> SampleResult {
        self.0
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(MemoryUsage {
                process_bytes: 0,
                total_system_bytes: 100,
            }))
    }
}

#[tokio::test]
async fn memory_budget_cancels_only_sampled_session() {
    let samples = VecDeque::from([
        Ok(MemoryUsage {
            process_bytes: 25,
            total_system_bytes: 100,
        }),
        Ok(MemoryUsage {
            process_bytes: 10,
            total_system_bytes: 100,
        }),
    ]);
    let probe = Arc::new(ScriptedProbe(Mutex::new(samples)));
    let governor = MemoryGovernor::new(probe, Handle::current(), &MemoryGovernorConfig::default());
    let config = SpeculationConfig {
        max_rule_based_sessions: 2,
        ..SpeculationConfig::default()
    };
    let (registry, _) = registry(config);
    let mut registry = registry.with_memory_governor(governor);
    let owner = StaticOwnerContext::default();

    let first = registry
        .create_and_start(rule_based("https://a.example/one"), &owner, None)
        .unwrap();
    assert!(registry.process_next_memory_sample().await);
    assert_eq!(
        registry.final_status(first),
        Some(FinalStatus::MemoryLimitExceeded)
    );

    let second = registry
        .create_and_start(rule_based("https://a.example/two"), &owner, None)
        .unwrap();
    assert!(registry.process_next_memory_sample().await);
    assert!(registry.is_active(second));
    assert!(!registry.process_next_memory_sample().await);
}

#[tokio::test]
async fn embedder_sessions_are_not_sampled() {
    let probe = Arc::new(ScriptedProbe(Mutex::new(VecDeque::new())));
    let governor = MemoryGovernor::new(probe, Handle::current(), &MemoryGovernorConfig::default());
    let (registry, _) = registry(SpeculationConfig::default());
    let mut registry = registry.with_memory_governor(governor);
    registry
        .create_and_start(
            SpeculationAttributes::embedder(Url::parse("https://a.example/").unwrap(), "Omnibox"),
            &StaticOwnerContext::default(),
            None,
        )
        .unwrap();
    assert!(!registry.process_next_memory_sample().await);
}

// =============================================================================
// E. Observers and deferred deletion
// =============================================================================

#[test]
fn observers_see_destroyed_after_tick() {
    let (mut registry, _) = registry(SpeculationConfig::default());
    let id = registry
        .create_and_start(
            rule_based("https://a.example/target"),
            &StaticOwnerContext::default(),
            None,
        )
        .unwrap();
    let log = Arc::new(EventLog::default());
    let _sub = registry.host(id).unwrap().subscribe(&log);

    assert!(registry.cancel_host(id, FinalStatus::Stop));
    assert!(!registry.cancel_host(id, FinalStatus::Download));
    assert!(log.0.lock().unwrap().is_empty());

    registry.tick(Instant::now());
    assert_eq!(
        *log.0.lock().unwrap(),
        vec![(id, HostEvent::Destroyed(FinalStatus::Stop))]
    );
}

#[test]
fn duplicate_leaves_first_session_intact() {
    let (mut registry, metrics) = registry(SpeculationConfig::default());
    let owner = StaticOwnerContext::default();
    let id = registry
        .create_and_start(rule_based("https://a.example/target"), &owner, None)
        .unwrap();
    assert_eq!(
        registry.create_and_start(rule_based("https://a.example/target"), &owner, None),
        Err(RejectReason::Duplicate)
    );
    assert!(registry.is_active(id));
    assert_eq!(registry.final_status(id), None);
    assert_eq!(metrics.summary().rejected.get("duplicate"), Some(&1));
}

#[test]
fn background_keep_alive_times_out() {
    let config = SpeculationConfig {
        keep_alive_in_background: true,
        background_timeout_ms: 60_000,
        ..SpeculationConfig::default()
    };
    let (mut registry, _) = registry(config);
    let id = registry
        .create_and_start(
            rule_based("https://a.example/target"),
            &StaticOwnerContext::default(),
            None,
        )
        .unwrap();
    let t0 = Instant::now();
    registry.on_visibility_changed(Visibility::Hidden, t0);
    registry.tick(t0 + Duration::from_secs(30));
    assert!(registry.is_active(id));
    registry.on_visibility_changed(Visibility::Visible, t0 + Duration::from_secs(31));
    registry.tick(t0 + Duration::from_secs(120));
    assert!(registry.is_active(id));

    registry.on_visibility_changed(Visibility::Hidden, t0 + Duration::from_secs(200));
    registry.tick(t0 + Duration::from_secs(261));
    assert_eq!(
        registry.final_status(id),
        Some(FinalStatus::TimeoutBackgrounded)
    );
    assert!(registry.invariant_violations().is_empty());
}
