//! Memory governor: asynchronous process-memory sampling for speculation
//! sessions.
//!
//! After a rule-based session starts, the registry asks the governor for a
//! sample. The probe runs on a tokio runtime; its report comes back over a
//! bounded channel that the registry drains on its own thread, re-checking
//! the session before acting on it.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

pub use crate::config::MemoryGovernorConfig;
use crate::session::SessionId;

// =============================================================================
// Samples
// =============================================================================

/// Memory used by this process relative to the whole system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryUsage {
    pub process_bytes: u64,
    pub total_system_bytes: u64,
}

impl MemoryUsage {
    /// Process share of system memory in percent (0 when the total is
    /// unknown).
    #[must_use]
    pub fn percent(&self) -> f64 {
        if self.total_system_bytes == 0 {
            return 0.0;
        }
        self.process_bytes as f64 * 100.0 / self.total_system_bytes as f64
    }

    /// Whether usage is strictly above `budget_percent` of system memory.
    #[must_use]
    pub fn exceeds(&self, budget_percent: f64) -> bool {
        self.process_bytes as f64 > self.total_system_bytes as f64 * budget_percent / 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SampleError {
    #[error("current process id unavailable")]
    CurrentPidUnavailable,
    #[error("process {0} not found")]
    ProcessNotFound(u32),
    #[error("total system memory unavailable")]
    TotalUnavailable,
    #[error("sampling task failed: {0}")]
    TaskFailed(String),
    #[error("memory probe failed: {0}")]
    Probe(String),
}

pub type SampleResult = Result<MemoryUsage, SampleError>;

/// Source of memory samples.
#[async_trait]
pub trait MemoryProbe: Send + Sync {
    async fn sample(&self) -> SampleResult;
}

/// [`MemoryProbe`] backed by `sysinfo`, sampling the current process.
#[derive(Debug, Clone)]
pub struct SystemMemoryProbe {
    system: Arc<Mutex<System>>,
    pid: Option<Pid>,
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMemoryProbe {
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    fn sample_sync(system: &Mutex<System>, pid: Option<Pid>) -> SampleResult {
        let pid = pid.ok_or(SampleError::CurrentPidUnavailable)?;
        let mut system = system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_memory();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let total = system.total_memory();
        if total == 0 {
            return Err(SampleError::TotalUnavailable);
        }
        let process = system
            .process(pid)
            .ok_or(SampleError::ProcessNotFound(pid.as_u32()))?;
        Ok(MemoryUsage {
            process_bytes: process.memory(),
            total_system_bytes: total,
        })
    }
}

#[async_trait]
impl MemoryProbe for SystemMemoryProbe {
    async fn sample(&self) -> SampleResult {
        let system = Arc::clone(&self.system);
        let pid = self.pid;
        tokio::task::spawn_blocking(move || Self::sample_sync(&system, pid))
            .await
            .unwrap_or_else(|e| Err(SampleError::TaskFailed(e.to_string())))
    }
}

// =============================================================================
// Governor
// =============================================================================

/// A finished sample for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySampleReport {
    pub session: SessionId,
    pub result: SampleResult,
}

pub struct MemoryGovernor {
    probe: Arc<dyn MemoryProbe>,
    handle: Handle,
    budget_percent: f64,
    tx: mpsc::Sender<MemorySampleReport>,
    rx: mpsc::Receiver<MemorySampleReport>,
    in_flight: usize,
}

impl std::fmt::Debug for MemoryGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGovernor")
            .field("budget_percent", &self.budget_percent)
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

impl MemoryGovernor {
    /// Governor spawning `probe` on `handle`.
    #[must_use]
    pub fn new(probe: Arc<dyn MemoryProbe>, handle: Handle, config: &MemoryGovernorConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        Self {
            probe,
            handle,
            budget_percent: config.budget_percent,
            tx,
            rx,
            in_flight: 0,
        }
    }

    /// Governor sampling this process through `sysinfo`.
    #[must_use]
    pub fn with_system_probe(handle: Handle, config: &MemoryGovernorConfig) -> Self {
        Self::new(Arc::new(SystemMemoryProbe::new()), handle, config)
    }

    #[must_use]
    pub fn budget_percent(&self) -> f64 {
        self.budget_percent
    }

    /// Samples requested but not yet drained.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Start sampling for `session`. The report arrives on the channel.
    pub fn request_sample(&mut self, session: SessionId) {
        let probe = Arc::clone(&self.probe);
        let tx = self.tx.clone();
        self.in_flight += 1;
        self.handle.spawn(async move {
            let result = probe.sample().await;
            if tx
                .send(MemorySampleReport { session, result })
                .await
                .is_err()
            {
                tracing::debug!(session_id = %session, "Memory sample dropped: governor gone");
            }
        });
        tracing::trace!(session_id = %session, "Memory sample requested");
    }

    /// A completed report, if one is waiting.
    pub fn try_recv(&mut self) -> Option<MemorySampleReport> {
        let report = self.rx.try_recv().ok()?;
        self.in_flight = self.in_flight.saturating_sub(1);
        Some(report)
    }

    /// Wait for the next report. Returns `None` when nothing is in flight.
    pub async fn recv(&mut self) -> Option<MemorySampleReport> {
        if self.in_flight == 0 {
            return None;
        }
        let report = self.rx.recv().await?;
        self.in_flight -= 1;
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe(SampleResult);

    #[async_trait]
    impl MemoryProbe for FixedProbe {
        async fn sample(&self) -> SampleResult {
            self.0.clone()
        }
    }

    fn usage(process: u64, total: u64) -> MemoryUsage {
        MemoryUsage {
            process_bytes: process,
            total_system_bytes: total,
        }
    }

    #[test]
    fn exceeds_is_strict() {
        assert!(usage(25, 100).exceeds(20.0));
        assert!(!usage(20, 100).exceeds(20.0));
        assert!(!usage(5, 100).exceeds(20.0));
        assert!((usage(25, 100).percent() - 25.0).abs() < f64::EPSILON);
        assert!(usage(0, 0).percent().abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn governor_delivers_report() {
        let probe = Arc::new(FixedProbe(Ok(usage(25, 100))));
        let mut governor =
            MemoryGovernor::new(probe, Handle::current(), &MemoryGovernorConfig::default());
        assert!(governor.recv().await.is_none());

        governor.request_sample(SessionId(7));
        assert_eq!(governor.in_flight(), 1);
        let report = governor.recv().await.unwrap();
        assert_eq!(report.session, SessionId(7));
        assert_eq!(report.result, Ok(usage(25, 100)));
        assert_eq!(governor.in_flight(), 0);
        assert!(governor.try_recv().is_none());
    }

    #[tokio::test]
    async fn governor_forwards_probe_errors() {
        let probe = Arc::new(FixedProbe(Err(SampleError::TotalUnavailable)));
        let mut governor =
            MemoryGovernor::new(probe, Handle::current(), &MemoryGovernorConfig::default());
        governor.request_sample(SessionId(1));
        let report = governor.recv().await.unwrap();
        assert_eq!(report.result, Err(SampleError::TotalUnavailable));
    }

    #[tokio::test]
    async fn system_probe_reports_this_process() {
        let probe = SystemMemoryProbe::new();
        let sample = probe.sample().await.unwrap();
        assert!(sample.total_system_bytes > 0);
        assert!(sample.process_bytes <= sample.total_system_bytes);
    }
}
