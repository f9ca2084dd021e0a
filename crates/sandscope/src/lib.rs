//! Sandscope: path-scoped file access policy for sandboxed build tools
//!
//! A build engine hands each tool it launches a manifest of path-scoped
//! rules. An interceptor inside the tool's process asks this crate, for every
//! file-system access, whether the access may proceed and whether it must be
//! reported back, while keeping per-process I/O counters for the job.
//!
//! The pieces:
//!
//! - [`policy`]: the manifest builder and the immutable scope tree that
//!   resolves a path to its effective permission bits.
//! - [`AccessArbiter`]: the per-access decision procedure, fail-closed.
//! - [`ReentrancyGuard`]: filters out the nested calls an access triggers.
//! - [`ProcessAccounting`]: lock-free per-process I/O counters.
//! - [`ffi`]: the C ABI for native interceptors.

mod access;
mod accounting;
mod arbiter;
mod config;
mod guard;
mod report;

pub mod ffi;
pub mod policy;

pub use access::{
    AccessDecision, AccessRequest, DecisionReason, Operation, ReportLevel, ResultAction,
    UnknownOperation,
};
pub use accounting::{CodecError, IoClass, IoCounters, IoTypeCounters, ProcessAccounting, ProcessId};
pub use arbiter::{AccessArbiter, ArbiterStats, ArbitrationFault};
pub use config::{ArbiterConfig, EnforcementMode, ManifestConfig, ManifestLoadError};
pub use guard::{ReentrancyGuard, current_depth};
pub use report::{AccessReport, MemorySink, ReportSink, TracingSink};
