//! Access reports and the sinks that receive them.

use std::borrow::Cow;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::access::{AccessDecision, Operation, ReportLevel, ResultAction};
use crate::accounting::ProcessId;
use crate::policy::PolicyBits;

/// A reported access, as forwarded to the host.
///
/// The path is borrowed from the intercepted request; sinks that keep a
/// report past the call take it with [`into_owned`](Self::into_owned).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessReport<'a> {
    /// Pip the access belongs to.
    pub pip_id: u64,
    /// Requesting process.
    pub process_id: ProcessId,
    /// Parent of the requesting process, if known.
    pub parent_process_id: Option<ProcessId>,
    /// Attempted operation.
    pub operation: Operation,
    /// Path as received from the interceptor.
    pub path: Cow<'a, str>,
    /// The decision returned to the interceptor.
    pub decision: AccessDecision,
    /// Effective policy at the path (empty if resolution failed).
    pub policy: PolicyBits,
    /// Why this access was reported.
    pub level: ReportLevel,
    /// What happened to the access.
    pub action: ResultAction,
}

impl AccessReport<'_> {
    /// Detach the report from the request it was built from.
    pub fn into_owned(self) -> AccessReport<'static> {
        AccessReport {
            pip_id: self.pip_id,
            process_id: self.process_id,
            parent_process_id: self.parent_process_id,
            operation: self.operation,
            path: Cow::Owned(self.path.into_owned()),
            decision: self.decision,
            policy: self.policy,
            level: self.level,
            action: self.action,
        }
    }
}

/// Receiver for access reports.
///
/// Implementations are called synchronously on the intercepted thread while
/// it is still inside the reentrancy guard, so any file I/O they do is not
/// arbitrated again.
pub trait ReportSink: Send + Sync {
    /// Deliver one report.
    fn report(&self, report: AccessReport<'_>);

    /// Push out anything buffered. Best-effort.
    fn flush(&self) {}
}

// Implement ReportSink for Arc<dyn ReportSink> to allow dynamic dispatch
impl ReportSink for Arc<dyn ReportSink> {
    fn report(&self, report: AccessReport<'_>) {
        (**self).report(report)
    }

    fn flush(&self) {
        (**self).flush()
    }
}

/// Emits each report as a `tracing` event.
///
/// Denied accesses are logged at `warn`, everything else at `info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ReportSink for TracingSink {
    fn report(&self, report: AccessReport<'_>) {
        let AccessReport {
            pip_id,
            process_id,
            operation,
            path,
            decision,
            policy,
            level,
            action,
            ..
        } = report;
        if action == ResultAction::Deny {
            tracing::warn!(
                pip_id,
                process_id,
                %operation,
                path = %path,
                reason = %decision.reason,
                ?policy,
                ?level,
                "access denied"
            );
        } else {
            tracing::info!(
                pip_id,
                process_id,
                %operation,
                path = %path,
                ?action,
                ?policy,
                ?level,
                "access reported"
            );
        }
    }
}

/// Collects reports in memory; used by tests and the CLI.
#[derive(Debug, Default)]
pub struct MemorySink {
    reports: Mutex<Vec<AccessReport<'static>>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return every collected report.
    pub fn take(&self) -> Vec<AccessReport<'static>> {
        std::mem::take(&mut *self.lock())
    }

    /// Number of reports collected so far.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no report has been collected.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<AccessReport<'static>>> {
        self.reports.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ReportSink for MemorySink {
    fn report(&self, report: AccessReport<'_>) {
        self.lock().push(report.into_owned());
    }
}
