//! prerender-core: admission, lifecycle and activation matching for
//! speculative page renders.
//!
//! A speculation renders a page in a hidden context before the user
//! navigates to it. When the real navigation arrives and its parameters
//! match the ones the speculation loaded with, the hidden tree is swapped in
//! instead of loading again.
//!
//! # Architecture
//!
//! ```text
//! trigger ──► SpeculationRegistry ──admit──► SpeculationHost ──► SpeculativeSession
//!                   │   ▲                        │                  (FrameTree)
//!                   │   └── cancel requests ─────┤
//!                   │                            └─► NavigationGate
//!                   ├─► MemoryGovernor (tokio) ──► samples over mpsc
//!                   └─► ActivationMatcher ◄── activation navigation
//! ```
//!
//! # Modules
//!
//! - `registry`: admission control, host ownership, reservation, deferred deletion
//! - `host`: per-URL state machine and write-once final status
//! - `session`: hidden frame tree, loader seam, client-hint store
//! - `gate`: scheme, origin and response checks on the initial navigation
//! - `matcher`: ordered comparison of navigation parameters
//! - `memory`: asynchronous memory sampling and budget
//! - `tree`: arena frame tree with subtree transfer
//! - `status`: final statuses, reject reasons and attempt outcomes
//! - `metrics`: metrics collaborator (tracing and in-memory sinks)
//! - `observer`: weak host lifecycle observers
//! - `config`, `logging`, `error`: ambient configuration, tracing setup and errors
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod attempt;
pub mod attributes;
pub mod config;
pub mod context;
pub mod error;
pub mod gate;
pub mod host;
pub mod logging;
pub mod matcher;
pub mod memory;
pub mod metrics;
pub mod navigation;
pub mod observer;
pub mod registry;
pub mod session;
pub mod status;
pub mod tree;

pub use error::{Error, Result};
pub use registry::{CandidateError, SpeculationRegistry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
