//! Navigation gate for the root document of a speculative tree.
//!
//! Every navigation that starts or redirects in the root is checked here.
//! A violation is returned as the [`FinalStatus`] the host must be canceled
//! with; the gate itself never cancels anything.

use crate::attributes::{Origin, SpeculationAttributes, Url, is_same_site, registrable_domain};
use crate::navigation::{NavigationId, NavigationParams, RedirectInfo, ResponseInfo};
use crate::status::FinalStatus;

bitflags::bitflags! {
    /// What changed across a cross-origin redirect of a browser-initiated
    /// session.
    #[derive(Default)]
    pub struct RedirectClassification: u32 {
        const SCHEME = 1 << 0;
        const HOST = 1 << 1;
        const PORT = 1 << 2;
        /// The new host is a subdomain of the old one.
        const SUBDOMAIN = 1 << 3;
        /// The new host is a parent domain of the old one.
        const PARENT_DOMAIN = 1 << 4;
        /// Old and new host share a registrable domain.
        const SAME_SITE = 1 << 5;
    }
}

impl RedirectClassification {
    /// Compare the origins of two URLs.
    #[must_use]
    pub fn classify(from: &Url, to: &Url) -> Self {
        let mut classification = Self::empty();
        if from.scheme() != to.scheme() {
            classification |= Self::SCHEME;
        }
        if from.port_or_known_default() != to.port_or_known_default() {
            classification |= Self::PORT;
        }
        let from_host = from.host_str().unwrap_or_default();
        let to_host = to.host_str().unwrap_or_default();
        if !from_host.eq_ignore_ascii_case(to_host) {
            classification |= Self::HOST;
            if to_host.ends_with(&format!(".{from_host}")) {
                classification |= Self::SUBDOMAIN;
            } else if from_host.ends_with(&format!(".{to_host}")) {
                classification |= Self::PARENT_DOMAIN;
            }
            if !from_host.is_empty()
                && registrable_domain(from_host).eq_ignore_ascii_case(registrable_domain(to_host))
            {
                classification |= Self::SAME_SITE;
            }
        }
        classification
    }

    /// Names of the set bits, in bit order.
    #[must_use]
    pub fn names(self) -> Vec<&'static str> {
        [
            (Self::SCHEME, "scheme"),
            (Self::HOST, "host"),
            (Self::PORT, "port"),
            (Self::SUBDOMAIN, "subdomain"),
            (Self::PARENT_DOMAIN, "parent_domain"),
            (Self::SAME_SITE, "same_site"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
        .collect()
    }
}

fn is_http_family(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}

/// Per-host navigation policy and the initial parameter capture.
#[derive(Debug, Clone)]
pub struct NavigationGate {
    initiator_origin: Option<Origin>,
    same_site_cross_origin: bool,
    initial_navigation: Option<NavigationId>,
    initial_params: Option<NavigationParams>,
    /// Status to cancel with at response time unless the response opts in.
    opt_in_required: Option<FinalStatus>,
    /// An accepted final response arrived for the current URL.
    response_accepted: bool,
    current_url: Url,
    redirect_classification: Option<RedirectClassification>,
}

impl NavigationGate {
    #[must_use]
    pub fn new(attrs: &SpeculationAttributes, same_site_cross_origin: bool) -> Self {
        Self {
            initiator_origin: attrs.initiator_origin.clone(),
            same_site_cross_origin,
            initial_navigation: None,
            initial_params: None,
            opt_in_required: None,
            response_accepted: false,
            current_url: attrs.url.clone(),
            redirect_classification: None,
        }
    }

    #[must_use]
    pub fn is_browser_initiated(&self) -> bool {
        self.initiator_origin.is_none()
    }

    #[must_use]
    pub fn initial_navigation(&self) -> Option<NavigationId> {
        self.initial_navigation
    }

    /// Parameters of the navigation that created the session.
    #[must_use]
    pub fn initial_params(&self) -> Option<&NavigationParams> {
        self.initial_params.as_ref()
    }

    #[must_use]
    pub fn current_url(&self) -> &Url {
        &self.current_url
    }

    /// Classification of the redirect that canceled a browser-initiated
    /// session, if any.
    #[must_use]
    pub fn redirect_classification(&self) -> Option<RedirectClassification> {
        self.redirect_classification
    }

    /// Record empty parameters when the initial navigation died before it
    /// could be observed. No-op once parameters exist.
    pub fn capture_fallback_params(&mut self) {
        if self.initial_params.is_none() {
            self.initial_params = Some(NavigationParams::fallback());
        }
    }

    fn check_navigation(&self, navigation: NavigationId) -> Result<(), FinalStatus> {
        match self.initial_navigation {
            Some(initial) if initial != navigation => Err(FinalStatus::MainFrameNavigation),
            _ => Ok(()),
        }
    }

    /// A navigation is starting in the root document.
    pub fn on_start(
        &mut self,
        navigation: NavigationId,
        url: &Url,
        params: &NavigationParams,
    ) -> Result<(), FinalStatus> {
        self.check_navigation(navigation)?;
        if self.initial_navigation.is_none() {
            self.initial_navigation = Some(navigation);
        }
        if self.initial_params.is_none() {
            self.initial_params = Some(params.clone());
        }
        self.current_url = url.clone();

        if !is_http_family(url) {
            return Err(FinalStatus::InvalidSchemeNavigation);
        }

        let Some(initiator) = &self.initiator_origin else {
            return Ok(());
        };
        let target = url.origin();
        if *initiator == target {
            return Ok(());
        }
        if self.same_site_cross_origin && is_same_site(initiator, &target) {
            self.opt_in_required
                .get_or_insert(FinalStatus::SameSiteCrossOriginNavigationNotOptIn);
            return Ok(());
        }
        Err(FinalStatus::CrossOriginNavigation)
    }

    /// The root navigation is being redirected.
    pub fn on_redirect(
        &mut self,
        navigation: NavigationId,
        redirect: &RedirectInfo,
    ) -> Result<(), FinalStatus> {
        self.check_navigation(navigation)?;
        self.response_accepted = false;
        let previous = std::mem::replace(&mut self.current_url, redirect.url.clone());

        if !is_http_family(&redirect.url) {
            return Err(FinalStatus::InvalidSchemeRedirect);
        }

        let target = redirect.url.origin();
        match &self.initiator_origin {
            None => {
                if previous.origin() != target {
                    let classification = RedirectClassification::classify(&previous, &redirect.url);
                    self.redirect_classification = Some(classification);
                    return Err(FinalStatus::EmbedderTriggeredAndCrossOriginRedirected);
                }
                Ok(())
            }
            Some(initiator) => {
                if *initiator == target {
                    return Ok(());
                }
                if self.same_site_cross_origin && is_same_site(initiator, &target) {
                    self.opt_in_required
                        .get_or_insert(FinalStatus::SameSiteCrossOriginRedirectNotOptIn);
                    return Ok(());
                }
                Err(FinalStatus::CrossOriginRedirect)
            }
        }
    }

    /// The final response for the root navigation arrived.
    pub fn on_response(&mut self, response: &ResponseInfo) -> Result<(), FinalStatus> {
        if let Some(status) = self.opt_in_required {
            if !response.opts_in_to_credentialed_prerender() {
                return Err(status);
            }
        }
        if response.is_download {
            return Err(FinalStatus::Download);
        }
        if !response.has_activatable_status() {
            return Err(FinalStatus::NavigationBadHttpStatus);
        }
        self.response_accepted = true;
        Ok(())
    }

    /// The root navigation committed. A commit is only acceptable after
    /// [`Self::on_response`] accepted the final response; otherwise the
    /// pending opt-in status (or `NavigationNotCommitted`) is returned.
    pub fn on_commit(&self) -> Result<(), FinalStatus> {
        if self.response_accepted {
            return Ok(());
        }
        Err(self
            .opt_in_required
            .unwrap_or(FinalStatus::NavigationNotCommitted))
    }
}
