//! Immutable description of one speculation request, plus origin/site helpers.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
pub use url::{Origin, Url};

use crate::navigation::FrameToken;

// =============================================================================
// Trigger type
// =============================================================================

/// Who asked for the speculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// A page's speculation rules (renderer-initiated).
    SpeculationRule,
    /// The embedding application, e.g. address-bar prediction (browser-initiated).
    Embedder,
}

impl TriggerType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SpeculationRule => "speculation_rule",
            Self::Embedder => "embedder",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Origins and sites
// =============================================================================

/// Multi-label public suffixes recognized when computing a site.
///
/// Not a public suffix list; covers the common second-level registries so
/// `a.example.co.uk` and `b.example.co.uk` are same-site.
const MULTI_LABEL_SUFFIXES: &[&str] = &[
    "co.uk", "org.uk", "ac.uk", "gov.uk", "co.jp", "ne.jp", "or.jp", "com.au", "net.au",
    "org.au", "co.nz", "com.br", "com.cn", "co.in", "co.kr",
];

/// Registrable part of a host name: the last two labels, or three when the
/// last two are a known multi-label suffix.
#[must_use]
pub fn registrable_domain(host: &str) -> &str {
    let host = host.trim_end_matches('.');
    let dots: Vec<usize> = host.match_indices('.').map(|(i, _)| i).collect();
    if dots.len() < 2 {
        return host;
    }
    let last_two = &host[dots[dots.len() - 2] + 1..];
    let keep = if MULTI_LABEL_SUFFIXES.contains(&last_two) { 3 } else { 2 };
    if dots.len() < keep {
        return host;
    }
    &host[dots[dots.len() - keep] + 1..]
}

/// Whether two origins belong to the same site (scheme plus registrable
/// domain). IP hosts only match exactly; opaque origins never match.
#[must_use]
pub fn is_same_site(a: &Origin, b: &Origin) -> bool {
    match (a, b) {
        (Origin::Tuple(scheme_a, host_a, _), Origin::Tuple(scheme_b, host_b, _)) => {
            if scheme_a != scheme_b {
                return false;
            }
            match (host_a, host_b) {
                (url::Host::Domain(a), url::Host::Domain(b)) => {
                    registrable_domain(a).eq_ignore_ascii_case(registrable_domain(b))
                }
                (a, b) => a == b,
            }
        }
        _ => false,
    }
}

/// Parse an origin from a URL string (`https://a.example/` or
/// `https://a.example`).
pub fn parse_origin(text: &str) -> Result<Origin, url::ParseError> {
    Ok(Url::parse(text)?.origin())
}

// =============================================================================
// URL equivalence
// =============================================================================

/// Predicate deciding whether a navigation URL can be served by a session.
#[derive(Clone, Default)]
pub enum UrlMatch {
    /// The navigation URL must equal the speculated URL.
    #[default]
    Exact,
    /// Custom equivalence (e.g. ignore a query parameter).
    Predicate(Arc<dyn Fn(&Url) -> bool + Send + Sync>),
}

impl UrlMatch {
    pub fn predicate(f: impl Fn(&Url) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(f))
    }

    #[must_use]
    pub fn matches(&self, speculated: &Url, candidate: &Url) -> bool {
        match self {
            Self::Exact => speculated == candidate,
            Self::Predicate(f) => f(candidate),
        }
    }
}

impl fmt::Debug for UrlMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact => f.write_str("Exact"),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

// =============================================================================
// Referrer and transition
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReferrerPolicy {
    NoReferrer,
    NoReferrerWhenDowngrade,
    Origin,
    OriginWhenCrossOrigin,
    SameOrigin,
    StrictOrigin,
    #[default]
    StrictOriginWhenCrossOrigin,
    UnsafeUrl,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Referrer {
    pub url: Option<Url>,
    pub policy: ReferrerPolicy,
}

/// Page transition: a core type in the low byte plus qualifier bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageTransition(pub u32);

impl PageTransition {
    pub const LINK: Self = Self(0);
    pub const TYPED: Self = Self(1);
    pub const AUTO_BOOKMARK: Self = Self(2);
    pub const GENERATED: Self = Self(5);
    pub const FORM_SUBMIT: Self = Self(7);
    pub const RELOAD: Self = Self(8);

    pub const FROM_ADDRESS_BAR: u32 = 0x0200_0000;
    pub const CORE_MASK: u32 = 0xFF;

    #[must_use]
    pub const fn core(self) -> u32 {
        self.0 & Self::CORE_MASK
    }

    #[must_use]
    pub const fn with_qualifier(self, qualifier: u32) -> Self {
        Self(self.0 | qualifier)
    }
}

// =============================================================================
// Attributes
// =============================================================================

/// What to speculate on and who asked. Owned by exactly one host.
#[derive(Debug, Clone)]
pub struct SpeculationAttributes {
    pub url: Url,
    pub trigger_type: TriggerType,
    /// Absent for browser-initiated speculation.
    pub initiator_origin: Option<Origin>,
    pub initiator_frame: Option<FrameToken>,
    pub url_match: UrlMatch,
    pub referrer: Referrer,
    pub transition: PageTransition,
    /// Tag appended to metric names (e.g. `"DirectURLInput"`).
    pub histogram_suffix: String,
}

impl SpeculationAttributes {
    /// Renderer-initiated speculation requested by a page's rules.
    #[must_use]
    pub fn rule_based(url: Url, initiator: Origin) -> Self {
        Self {
            url,
            trigger_type: TriggerType::SpeculationRule,
            initiator_origin: Some(initiator),
            initiator_frame: None,
            url_match: UrlMatch::Exact,
            referrer: Referrer::default(),
            transition: PageTransition::LINK,
            histogram_suffix: String::new(),
        }
    }

    /// Browser-initiated speculation requested by the embedder.
    #[must_use]
    pub fn embedder(url: Url, histogram_suffix: impl Into<String>) -> Self {
        Self {
            url,
            trigger_type: TriggerType::Embedder,
            initiator_origin: None,
            initiator_frame: None,
            url_match: UrlMatch::Exact,
            referrer: Referrer::default(),
            transition: PageTransition::TYPED.with_qualifier(PageTransition::FROM_ADDRESS_BAR),
            histogram_suffix: histogram_suffix.into(),
        }
    }

    #[must_use]
    pub fn with_initiator_frame(mut self, frame: FrameToken) -> Self {
        self.initiator_frame = Some(frame);
        self
    }

    #[must_use]
    pub fn with_url_match(mut self, url_match: UrlMatch) -> Self {
        self.url_match = url_match;
        self
    }

    #[must_use]
    pub fn with_referrer(mut self, referrer: Referrer) -> Self {
        self.referrer = referrer;
        self
    }

    #[must_use]
    pub fn with_transition(mut self, transition: PageTransition) -> Self {
        self.transition = transition;
        self
    }

    #[must_use]
    pub fn is_browser_initiated(&self) -> bool {
        self.initiator_origin.is_none()
    }

    /// Whether a renderer-initiated request targets another origin.
    #[must_use]
    pub fn is_cross_origin(&self) -> bool {
        self.initiator_origin
            .as_ref()
            .is_some_and(|initiator| *initiator != self.url.origin())
    }

    /// Whether a renderer-initiated request targets another site.
    #[must_use]
    pub fn is_cross_site(&self) -> bool {
        self.initiator_origin
            .as_ref()
            .is_some_and(|initiator| !is_same_site(initiator, &self.url.origin()))
    }

    /// Whether this session can serve a navigation to `candidate`.
    #[must_use]
    pub fn accepts(&self, candidate: &Url) -> bool {
        self.url_match.matches(&self.url, candidate)
    }
}
