//! Preloading-attempt reporting.
//!
//! A trigger may attach an attempt to a request; the registry and host
//! report eligibility, holdback, progress and failure to it as they happen.

use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::status::{Eligibility, FailureReason, HoldbackStatus, TriggeringOutcome};

pub trait PreloadingAttempt {
    fn set_eligibility(&mut self, eligibility: Eligibility);
    fn set_holdback_status(&mut self, status: HoldbackStatus);
    fn set_triggering_outcome(&mut self, outcome: TriggeringOutcome);
    fn set_failure_reason(&mut self, reason: FailureReason);
}

/// Everything reported to one attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AttemptLog {
    pub eligibility: Option<Eligibility>,
    pub holdback: Option<HoldbackStatus>,
    /// Every outcome in order; the last one is current.
    pub outcomes: Vec<TriggeringOutcome>,
    pub failure: Option<FailureReason>,
}

impl AttemptLog {
    #[must_use]
    pub fn outcome(&self) -> Option<TriggeringOutcome> {
        self.outcomes.last().copied()
    }
}

/// [`PreloadingAttempt`] whose log stays readable after the attempt has been
/// handed to the registry.
#[derive(Debug, Clone, Default)]
pub struct SharedAttempt {
    log: Arc<Mutex<AttemptLog>>,
}

impl SharedAttempt {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Boxed clone sharing this log.
    #[must_use]
    pub fn boxed(&self) -> Box<dyn PreloadingAttempt> {
        Box::new(self.clone())
    }

    #[must_use]
    pub fn snapshot(&self) -> AttemptLog {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn with_log(&self, f: impl FnOnce(&mut AttemptLog)) {
        f(&mut self.log.lock().unwrap_or_else(|e| e.into_inner()));
    }
}

impl PreloadingAttempt for SharedAttempt {
    fn set_eligibility(&mut self, eligibility: Eligibility) {
        self.with_log(|log| log.eligibility = Some(eligibility));
    }

    fn set_holdback_status(&mut self, status: HoldbackStatus) {
        self.with_log(|log| log.holdback = Some(status));
    }

    fn set_triggering_outcome(&mut self, outcome: TriggeringOutcome) {
        self.with_log(|log| log.outcomes.push(outcome));
    }

    fn set_failure_reason(&mut self, reason: FailureReason) {
        self.with_log(|log| log.failure = Some(reason));
    }
}
