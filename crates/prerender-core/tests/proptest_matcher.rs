//! Property-based tests for the activation matcher.
//!
//! - identical parameters always match
//! - Purpose / Sec-Purpose and header-name case never cause a mismatch
//! - with several fields changed, the earliest one in comparison order is
//!   reported
//! - fallback parameters never match a real navigation

use proptest::prelude::*;

use prerender_core::attributes::{PageTransition, parse_origin};
use prerender_core::matcher::{ActivationMatcher, ActivationMismatch, MismatchGroup};
use prerender_core::navigation::{
    FrameToken, Headers, LoadFlags, NavigationParams, RequestContextType, RequestDestination,
};

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

fn arb_header_name() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["Accept", "Accept-Language", "X-Client", "Cache-Control", "DNT"])
        .prop_map(str::to_string)
}

fn arb_headers() -> impl Strategy<Value = Headers> {
    prop::collection::vec((arb_header_name(), "[a-z0-9/]{1,8}"), 0..4).prop_map(|pairs| {
        let mut headers = Headers::new();
        for (name, value) in pairs {
            headers.insert(&name, &value);
        }
        headers
    })
}

fn arb_params() -> impl Strategy<Value = NavigationParams> {
    (
        prop::option::of(0u64..4),
        arb_headers(),
        any::<bool>(),
        prop::sample::select(vec![
            RequestContextType::Hyperlink,
            RequestContextType::Location,
            RequestContextType::Form,
        ]),
        prop::sample::select(vec![PageTransition::LINK, PageTransition::TYPED]),
        prop::option::of(prop::sample::select(vec![
            "https://a.example/",
            "https://b.example/",
        ])),
    )
        .prop_map(|(frame, headers, skip_sw, context, transition, origin)| NavigationParams {
            initiator_frame: frame.map(FrameToken),
            headers,
            skip_service_worker: skip_sw,
            request_context_type: context,
            transition,
            initiator_origin: origin.map(|o| parse_origin(o).unwrap()),
            ..NavigationParams::default()
        })
}

fn edit_frame(p: &mut NavigationParams) {
    p.initiator_frame = Some(FrameToken(p.initiator_frame.map_or(100, |t| t.0 + 100)));
}

fn edit_headers(p: &mut NavigationParams) {
    p.headers.insert("X-Injected", "1");
}

fn edit_load_flags(p: &mut NavigationParams) {
    p.load_flags.toggle(LoadFlags::BYPASS_CACHE);
}

fn edit_skip_service_worker(p: &mut NavigationParams) {
    p.skip_service_worker = !p.skip_service_worker;
}

fn edit_destination(p: &mut NavigationParams) {
    p.request_destination = RequestDestination::Iframe;
}

fn edit_origin(p: &mut NavigationParams) {
    p.initiator_origin = Some(parse_origin("https://changed.example/").unwrap());
}

fn edit_transition(p: &mut NavigationParams) {
    p.transition = PageTransition::RELOAD;
}

fn edit_method(p: &mut NavigationParams) {
    p.method = "POST".to_string();
}

fn edit_href_translate(p: &mut NavigationParams) {
    p.href_translate = Some("fr".to_string());
}

type Edit = fn(&mut NavigationParams);

/// Field edits paired with the mismatch each one produces, in comparison
/// order.
const EDITS: [(ActivationMismatch, Edit); 9] = [
    (ActivationMismatch::InitiatorFrameToken, edit_frame),
    (ActivationMismatch::Headers, edit_headers),
    (ActivationMismatch::LoadFlags, edit_load_flags),
    (ActivationMismatch::SkipServiceWorker, edit_skip_service_worker),
    (ActivationMismatch::RequestDestination, edit_destination),
    (ActivationMismatch::InitiatorOrigin, edit_origin),
    (ActivationMismatch::Transition, edit_transition),
    (ActivationMismatch::Method, edit_method),
    (ActivationMismatch::HrefTranslate, edit_href_translate),
];

// ────────────────────────────────────────────────────────────────────
// Properties
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Identical parameters always match.
    #[test]
    fn prop_identical_matches(params in arb_params()) {
        prop_assert_eq!(ActivationMatcher::check(&params, &params.clone()), Ok(()));
    }

    /// Transport markers and header-name case are ignored.
    #[test]
    fn prop_markers_and_case_ignored(params in arb_params(), upper in any::<bool>()) {
        let mut candidate = params.clone();
        candidate.headers = Headers::new();
        for (name, value) in params.headers.iter() {
            let name = if upper { name.to_uppercase() } else { name.to_string() };
            candidate.headers.insert(&name, value);
        }
        candidate.headers.insert(Headers::PURPOSE, "prefetch");
        candidate.headers.insert(Headers::SEC_PURPOSE, Headers::SPECULATIVE_PURPOSE);
        prop_assert_eq!(ActivationMatcher::check(&params, &candidate), Ok(()));
    }

    /// With any subset of edits applied, the first one in order is reported.
    #[test]
    fn prop_first_mismatch_reported(
        params in arb_params(),
        mask in 1u32..(1 << EDITS.len()),
    ) {
        let mut candidate = params.clone();
        let mut expected = None;
        for (bit, (mismatch, edit)) in EDITS.iter().enumerate() {
            if mask & (1 << bit) != 0 {
                edit(&mut candidate);
                expected.get_or_insert(*mismatch);
            }
        }
        let expected = expected.unwrap();
        prop_assert_eq!(ActivationMatcher::check(&params, &candidate), Err(expected));
    }

    /// Transport mismatches always win over semantic ones.
    #[test]
    fn prop_transport_before_semantic(params in arb_params()) {
        let mut candidate = params.clone();
        candidate.method = "PUT".to_string();
        candidate.skip_service_worker = !candidate.skip_service_worker;
        let mismatch = ActivationMatcher::check(&params, &candidate).unwrap_err();
        prop_assert_eq!(mismatch.group(), MismatchGroup::Transport);
    }

    /// Fallback parameters never match a navigation that really started.
    #[test]
    fn prop_fallback_never_matches(params in arb_params()) {
        let fallback = NavigationParams::fallback();
        prop_assert!(ActivationMatcher::check(&fallback, &params).is_err());
    }
}
