#![no_main]

use std::collections::HashMap;
use std::time::{Duration, Instant};

use libfuzzer_sys::fuzz_target;
use prerender_core::SpeculationRegistry;
use prerender_core::attributes::{PageTransition, SpeculationAttributes, Url, parse_origin};
use prerender_core::config::SpeculationConfig;
use prerender_core::context::{StaticOwnerContext, Visibility};
use prerender_core::memory::MemoryUsage;
use prerender_core::navigation::{
    ActivationNavigation, Headers, NavigationId, NavigationOutcome, NavigationParams,
    NavigationRequest, NavigationStart, NetError, RedirectInfo, RequestContextType, ResponseInfo,
};
use prerender_core::session::{NavigationLoader, PrimaryContents, SessionId};
use prerender_core::status::FinalStatus;
use prerender_core::tree::NodeId;

const PAGES: [&str; 6] = [
    "https://a.example/",
    "https://a.example/next",
    "https://sub.a.example/",
    "https://b.example/",
    "http://a.example/insecure",
    "https://a.example/download",
];

const REDIRECTS: [&str; 4] = [
    "https://a.example/moved",
    "https://sub.a.example/moved",
    "https://c.example/",
    "data:text/plain,x",
];

#[derive(Default)]
struct FuzzLoader {
    next: u64,
    script: Vec<u8>,
}

impl NavigationLoader for FuzzLoader {
    fn begin_navigation(&mut self, _root: NodeId, request: &NavigationRequest) -> NavigationStart {
        self.next += 1;
        match self.script.pop().map(|b| b % 8) {
            Some(0) => NavigationStart::NotStarted,
            Some(1) => NavigationStart::FailedBeforeStart(NetError::BlockedByCsp),
            _ => NavigationStart::Started {
                navigation: NavigationId(self.next),
                params: request.params(),
            },
        }
    }
}

fn url(table: &[&str], raw: u8) -> Url {
    let text = table[usize::from(raw) % table.len()];
    Url::parse(text).unwrap_or_else(|_| panic!("fixture url {text} must parse"))
}

fn pick(ids: &[SessionId], raw: u8) -> SessionId {
    if ids.is_empty() {
        return SessionId(u64::from(raw));
    }
    ids[usize::from(raw) % ids.len()]
}

fn activation(raw_url: u8, flags: u8) -> ActivationNavigation {
    let mut params = NavigationParams {
        initiator_origin: parse_origin("https://a.example/").ok(),
        request_context_type: RequestContextType::Hyperlink,
        transition: PageTransition::LINK,
        ..NavigationParams::default()
    };
    if flags & 1 != 0 {
        params.headers = Headers::new().with("cache-control", "no-cache");
    }
    if flags & 2 != 0 {
        params.method = "POST".to_string();
    }
    let mut navigation = ActivationNavigation::primary(url(&PAGES, raw_url), params);
    navigation.auxiliary_contexts = usize::from(flags >> 6);
    navigation
}

fuzz_target!(|data: &[u8]| {
    if data.len() > 16_384 {
        return;
    }

    let loader = FuzzLoader {
        next: 0,
        script: data.iter().rev().step_by(7).copied().collect(),
    };
    let config = SpeculationConfig {
        max_rule_based_sessions: 2,
        keep_alive_in_background: data.first().is_some_and(|b| b & 1 == 1),
        ..SpeculationConfig::default()
    };
    let mut registry = SpeculationRegistry::new(config, Box::new(loader));
    let mut primary = PrimaryContents::new(registry.node_ids());
    let mut owner = StaticOwnerContext::default();
    let mut seen: HashMap<SessionId, FinalStatus> = HashMap::new();
    let mut created: Vec<SessionId> = Vec::new();
    let base = Instant::now();
    let mut elapsed = Duration::ZERO;

    for chunk in data.chunks(4) {
        let [op, a, b, c] = match chunk {
            [op, a, b, c] => [*op, *a, *b, *c],
            _ => break,
        };
        let target = pick(&created, a);
        let navigation = registry
            .host(target)
            .and_then(|host| host.gate().initial_navigation())
            .unwrap_or(NavigationId(u64::from(b)));

        match op % 11 {
            0 | 1 => {
                let attrs = if b & 1 == 0 {
                    match parse_origin("https://a.example/") {
                        Ok(origin) => SpeculationAttributes::rule_based(url(&PAGES, c), origin),
                        Err(_) => continue,
                    }
                } else {
                    SpeculationAttributes::embedder(url(&PAGES, c), "Fuzz")
                };
                if let Ok(id) = registry.create_and_start(attrs, &owner, None) {
                    created.push(id);
                }
            }
            2 => {
                let redirect = RedirectInfo {
                    url: url(&REDIRECTS, b),
                    status: 302,
                };
                let _ = registry.on_redirect(target, navigation, &redirect);
            }
            3 => {
                let mut response = ResponseInfo::ok();
                response.status = [200, 204, 404, 500][usize::from(b % 4)];
                response.is_download = c % 5 == 0;
                if c & 2 != 0 {
                    response.headers.insert(
                        ResponseInfo::SUPPORTS_LOADING_MODE,
                        ResponseInfo::CREDENTIALED_PRERENDER,
                    );
                }
                let _ = registry.on_response(target, navigation, &response);
            }
            4 => {
                let ready = registry
                    .host(target)
                    .is_some_and(|host| host.is_ready_for_activation());
                let outcome = match b % 3 {
                    0 if ready => continue,
                    0 => NavigationOutcome::Committed,
                    1 => NavigationOutcome::Failed(NetError::ConnectionFailed),
                    _ => NavigationOutcome::NotCommitted,
                };
                let _ = registry.on_navigation_finished(target, navigation, outcome);
            }
            5 => {
                owner.visibility = match b % 3 {
                    0 => Visibility::Visible,
                    1 => Visibility::Hidden,
                    _ => Visibility::Occluded,
                };
                let _ = registry.on_visibility_changed(owner.visibility, base + elapsed);
            }
            6 => {
                let nav = activation(b, c);
                if let Ok(id) = registry.try_reserve(&nav, pick(&created, a)) {
                    if c & 4 == 0 {
                        let transferred = registry.activate_reserved(id, &nav, &mut primary);
                        assert_eq!(primary.tree.root(), transferred.root);
                        registry.on_activation_finished(id);
                    } else {
                        registry.abandon_reservation(
                            id,
                            FinalStatus::ActivationNavigationDestroyedBeforeSuccess,
                        );
                    }
                }
            }
            7 => {
                registry.notify_owner_destroyed(target);
            }
            8 => {
                let usage = MemoryUsage {
                    process_bytes: u64::from(b) * 1024,
                    total_system_bytes: u64::from(c) * 1024,
                };
                let _ = registry.on_memory_sample(target, Ok(usage));
            }
            9 => {
                elapsed += Duration::from_millis(u64::from(b) * 2_000);
                registry.tick(base + elapsed);
            }
            _ => {
                if b % 16 == 0 {
                    registry.cancel_all(FinalStatus::CancelAllHosts);
                } else {
                    let _ = registry.on_resource_load_failed(target, NetError::BlockedByClient);
                }
            }
        }

        let violations = registry.invariant_violations();
        assert!(
            violations.is_empty(),
            "registry invariant violation under fuzz input: {violations:?}"
        );
        for id in &created {
            if let Some(status) = registry.final_status(*id) {
                let first = *seen.entry(*id).or_insert(status);
                assert_eq!(first, status, "final status of {id} changed");
            }
        }
    }

    registry.tick(base + elapsed + Duration::from_secs(3_600));
    assert_eq!(registry.pending_deletion_len(), 0);
    assert_eq!(registry.reserved_len(), 0);
});
