//! Metrics collaborator.
//!
//! The engine reports admission outcomes, terminal statuses, activation
//! matching results and cross-origin redirect classifications through
//! [`SpeculationMetrics`]. Recording is advisory; no control-flow decision
//! depends on it.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Serialize;

use crate::attributes::TriggerType;
use crate::gate::RedirectClassification;
use crate::matcher::ActivationMismatch;
use crate::status::{FinalStatus, RejectReason};

/// Sink for speculation metrics. Every method defaults to a no-op.
pub trait SpeculationMetrics: Send + Sync {
    /// One admission decision; `Err` carries the first failing check.
    fn record_admission(
        &self,
        _trigger: TriggerType,
        _histogram_suffix: &str,
        _outcome: Result<(), RejectReason>,
    ) {
    }

    /// A host reached its terminal status. Called once per host.
    fn record_final_status(
        &self,
        _trigger: TriggerType,
        _histogram_suffix: &str,
        _status: FinalStatus,
    ) {
    }

    /// Result of comparing a candidate navigation with the initial one.
    fn record_activation_match(
        &self,
        _trigger: TriggerType,
        _histogram_suffix: &str,
        _result: Result<(), ActivationMismatch>,
    ) {
    }

    /// How an embedder-triggered navigation's cross-origin redirect
    /// differs from the previous URL.
    fn record_cross_origin_redirect(
        &self,
        _trigger: TriggerType,
        _histogram_suffix: &str,
        _classification: RedirectClassification,
    ) {
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl SpeculationMetrics for NoopMetrics {}

/// Emits one `tracing` event per metric under the `prerender::metrics`
/// target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetrics;

impl SpeculationMetrics for TracingMetrics {
    fn record_admission(
        &self,
        trigger: TriggerType,
        histogram_suffix: &str,
        outcome: Result<(), RejectReason>,
    ) {
        match outcome {
            Ok(()) => tracing::debug!(
                target: "prerender::metrics",
                trigger = %trigger,
                suffix = histogram_suffix,
                "admission accepted"
            ),
            Err(reason) => tracing::debug!(
                target: "prerender::metrics",
                trigger = %trigger,
                suffix = histogram_suffix,
                reason = reason.as_str(),
                "admission rejected"
            ),
        }
    }

    fn record_final_status(&self, trigger: TriggerType, histogram_suffix: &str, status: FinalStatus) {
        tracing::debug!(
            target: "prerender::metrics",
            trigger = %trigger,
            suffix = histogram_suffix,
            final_status = %status,
            "final status"
        );
    }

    fn record_activation_match(
        &self,
        trigger: TriggerType,
        histogram_suffix: &str,
        result: Result<(), ActivationMismatch>,
    ) {
        tracing::debug!(
            target: "prerender::metrics",
            trigger = %trigger,
            suffix = histogram_suffix,
            mismatch = result.err().map(ActivationMismatch::as_str),
            "activation match"
        );
    }

    fn record_cross_origin_redirect(
        &self,
        trigger: TriggerType,
        histogram_suffix: &str,
        classification: RedirectClassification,
    ) {
        tracing::debug!(
            target: "prerender::metrics",
            trigger = %trigger,
            suffix = histogram_suffix,
            classification = ?classification.names(),
            "cross-origin redirect"
        );
    }
}

// =============================================================================
// In-memory recorder
// =============================================================================

/// One recorded metric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "metric", rename_all = "snake_case")]
pub enum MetricEvent {
    Admission {
        trigger: TriggerType,
        suffix: String,
        rejected: Option<RejectReason>,
    },
    FinalStatus {
        trigger: TriggerType,
        suffix: String,
        status: FinalStatus,
    },
    ActivationMatch {
        trigger: TriggerType,
        suffix: String,
        mismatch: Option<ActivationMismatch>,
    },
    CrossOriginRedirect {
        trigger: TriggerType,
        suffix: String,
        classification: Vec<&'static str>,
    },
}

/// Per-name counts over a [`RecordingMetrics`] log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSummary {
    pub admitted: u64,
    pub rejected: BTreeMap<&'static str, u64>,
    pub final_statuses: BTreeMap<&'static str, u64>,
    pub activation_matches: u64,
    pub activation_mismatches: BTreeMap<&'static str, u64>,
    pub cross_origin_redirects: u64,
}

/// Keeps every event in memory. Used by tests and the CLI summary.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    events: Mutex<Vec<MetricEvent>>,
}

impl RecordingMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: MetricEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }

    #[must_use]
    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Terminal statuses recorded so far, in order.
    #[must_use]
    pub fn final_statuses(&self) -> Vec<FinalStatus> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                MetricEvent::FinalStatus { status, .. } => Some(status),
                _ => None,
            })
            .collect()
    }

    /// Fold the log into per-name counts.
    #[must_use]
    pub fn summary(&self) -> MetricsSummary {
        let mut summary = MetricsSummary::default();
        for event in self.events() {
            match event {
                MetricEvent::Admission { rejected: None, .. } => summary.admitted += 1,
                MetricEvent::Admission {
                    rejected: Some(reason),
                    ..
                } => *summary.rejected.entry(reason.as_str()).or_default() += 1,
                MetricEvent::FinalStatus { status, .. } => {
                    *summary.final_statuses.entry(status.as_str()).or_default() += 1;
                }
                MetricEvent::ActivationMatch { mismatch: None, .. } => {
                    summary.activation_matches += 1;
                }
                MetricEvent::ActivationMatch {
                    mismatch: Some(mismatch),
                    ..
                } => {
                    *summary
                        .activation_mismatches
                        .entry(mismatch.as_str())
                        .or_default() += 1;
                }
                MetricEvent::CrossOriginRedirect { .. } => summary.cross_origin_redirects += 1,
            }
        }
        summary
    }
}

impl SpeculationMetrics for RecordingMetrics {
    fn record_admission(
        &self,
        trigger: TriggerType,
        histogram_suffix: &str,
        outcome: Result<(), RejectReason>,
    ) {
        self.push(MetricEvent::Admission {
            trigger,
            suffix: histogram_suffix.to_string(),
            rejected: outcome.err(),
        });
    }

    fn record_final_status(&self, trigger: TriggerType, histogram_suffix: &str, status: FinalStatus) {
        self.push(MetricEvent::FinalStatus {
            trigger,
            suffix: histogram_suffix.to_string(),
            status,
        });
    }

    fn record_activation_match(
        &self,
        trigger: TriggerType,
        histogram_suffix: &str,
        result: Result<(), ActivationMismatch>,
    ) {
        self.push(MetricEvent::ActivationMatch {
            trigger,
            suffix: histogram_suffix.to_string(),
            mismatch: result.err(),
        });
    }

    fn record_cross_origin_redirect(
        &self,
        trigger: TriggerType,
        histogram_suffix: &str,
        classification: RedirectClassification,
    ) {
        self.push(MetricEvent::CrossOriginRedirect {
            trigger,
            suffix: histogram_suffix.to_string(),
            classification: classification.names(),
        });
    }
}
