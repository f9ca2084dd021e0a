//! Per-access arbitration.
//!
//! [`AccessArbiter`] is the piece the interceptor calls for every file-system
//! access: it filters out nested calls, resolves the effective policy,
//! decides, accounts the admitted operation and reports what needs reporting.
//! It never blocks on the tree and always returns a decision.

use std::any::Any;
use std::borrow::Cow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::access::{AccessDecision, AccessRequest, DecisionReason, Operation, ReportLevel};
use crate::accounting::{IoCounters, ProcessAccounting, ProcessId};
use crate::config::{ArbiterConfig, EnforcementMode};
use crate::guard::ReentrancyGuard;
use crate::policy::{PathError, PathScopeTree, PolicyBits};
use crate::report::{AccessReport, ReportSink, TracingSink};

/// Failure inside arbitration. Always turned into a denied, reported access.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArbitrationFault {
    /// The request path could not be split into components.
    #[error("malformed request path: {0}")]
    Path(#[from] PathError),
    /// Policy resolution panicked.
    #[error("arbitration panicked: {0}")]
    Panicked(String),
}

/// Snapshot of arbiter activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbiterStats {
    /// Outermost calls that went through arbitration.
    pub arbitrated: u64,
    /// Nested calls passed through.
    pub suppressed: u64,
    /// Accesses denied.
    pub denied: u64,
    /// Accesses reported.
    pub reported: u64,
    /// Arbitrations that failed closed.
    pub faults: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    arbitrated: AtomicU64,
    suppressed: AtomicU64,
    denied: AtomicU64,
    reported: AtomicU64,
    faults: AtomicU64,
}

impl StatCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ArbiterStats {
        ArbiterStats {
            arbitrated: self.arbitrated.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            reported: self.reported.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
        }
    }
}

/// Policy decision plus the context needed to report it.
struct Verdict {
    decision: AccessDecision,
    policy: PolicyBits,
    level: ReportLevel,
}

impl Verdict {
    fn fail_closed(reason: DecisionReason) -> Self {
        Self {
            decision: AccessDecision::fail_closed(reason),
            policy: PolicyBits::empty(),
            level: ReportLevel::Report,
        }
    }
}

/// Arbitrates the file accesses of one sandboxed job.
///
/// # Example
///
/// ```rust
/// use sandscope::{AccessArbiter, AccessRequest, ArbiterConfig, Operation};
/// use sandscope::policy::{ManifestBuilder, PathCase, PolicyBits};
///
/// let tree = ManifestBuilder::with_case(PathCase::Sensitive)
///     .add_scope("/", PolicyBits::MASK_NONE, PolicyBits::empty())
///     .add_scope("/src", PolicyBits::MASK_NONE, PolicyBits::ALLOW_READ)
///     .build()
///     .unwrap();
/// let arbiter = AccessArbiter::new(tree, ArbiterConfig::default());
///
/// let decision = arbiter.arbitrate(&AccessRequest::new("/src/main.rs", Operation::Read, 10));
/// assert!(decision.allowed);
///
/// let decision = arbiter.arbitrate(&AccessRequest::new("/etc/passwd", Operation::Read, 10));
/// assert!(!decision.allowed);
/// assert!(decision.reported);
/// ```
pub struct AccessArbiter {
    tree: Arc<PathScopeTree>,
    config: ArbiterConfig,
    accounting: Arc<ProcessAccounting>,
    sink: Arc<dyn ReportSink>,
    tearing_down: AtomicBool,
    stats: StatCounters,
}

impl std::fmt::Debug for AccessArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessArbiter")
            .field("nodes", &self.tree.node_count())
            .field("config", &self.config)
            .field("tearing_down", &self.is_tearing_down())
            .finish_non_exhaustive()
    }
}

impl AccessArbiter {
    /// Create an arbiter reporting through [`TracingSink`] with a fresh
    /// accounting table.
    pub fn new(tree: impl Into<Arc<PathScopeTree>>, config: ArbiterConfig) -> Self {
        Self {
            tree: tree.into(),
            config,
            accounting: Arc::new(ProcessAccounting::new()),
            sink: Arc::new(TracingSink),
            tearing_down: AtomicBool::new(false),
            stats: StatCounters::default(),
        }
    }

    /// Deliver reports to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Share an existing accounting table.
    pub fn with_accounting(mut self, accounting: Arc<ProcessAccounting>) -> Self {
        self.accounting = accounting;
        self
    }

    /// The scope tree in use.
    pub fn tree(&self) -> &PathScopeTree {
        &self.tree
    }

    /// Arbiter settings.
    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    /// The accounting table.
    pub fn accounting(&self) -> &ProcessAccounting {
        &self.accounting
    }

    /// Arbitrate one intercepted access.
    ///
    /// Enters the calling thread's reentrancy guard for the duration of the
    /// call, so accesses made by the report sink are passed through.
    pub fn arbitrate(&self, request: &AccessRequest<'_>) -> AccessDecision {
        let guard = ReentrancyGuard::enter();
        self.arbitrate_in_scope(&guard, request)
    }

    /// Arbitrate an access for an interceptor that already holds a guard.
    ///
    /// Unless `guard` is the only level on the thread the call is a nested
    /// one: it is allowed without consulting the tree and is not reported.
    pub fn arbitrate_in_scope(
        &self,
        guard: &ReentrancyGuard,
        request: &AccessRequest<'_>,
    ) -> AccessDecision {
        if !guard.is_outermost() {
            StatCounters::bump(&self.stats.suppressed);
            return AccessDecision::passthrough();
        }
        StatCounters::bump(&self.stats.arbitrated);

        let verdict = if self.is_tearing_down() {
            Verdict::fail_closed(DecisionReason::TearingDown)
        } else {
            match panic::catch_unwind(AssertUnwindSafe(|| self.decide(request))) {
                Ok(Ok(verdict)) => verdict,
                Ok(Err(fault)) => self.fault(request, &fault),
                Err(payload) => self.fault(request, &ArbitrationFault::Panicked(panic_message(&*payload))),
            }
        };
        let decision = verdict.decision;

        if decision.allowed {
            self.accounting.record(
                request.process_id,
                request.parent_process_id,
                request.operation.io_class(),
                request.bytes,
            );
        } else {
            StatCounters::bump(&self.stats.denied);
            tracing::debug!(
                path = request.path,
                operation = %request.operation,
                pid = request.process_id,
                reason = %decision.reason,
                "access denied"
            );
        }

        if decision.reported {
            StatCounters::bump(&self.stats.reported);
            self.deliver(request, verdict);
        }
        decision
    }

    fn decide(&self, request: &AccessRequest<'_>) -> Result<Verdict, ArbitrationFault> {
        let resolution = self.tree.resolve(request.path)?;
        let policy = resolution.policy;
        let covered = request.is_covered_by(policy);
        let unexpected = !covered;

        let allowed = match self.config.mode {
            EnforcementMode::Strict => covered,
            EnforcementMode::Permissive => true,
        };

        let explicit = policy.contains(PolicyBits::REPORT_ACCESS)
            || (request.operation == Operation::EnumerateDirectory
                && policy.contains(PolicyBits::REPORT_DIRECTORY_ENUMERATION));
        let level = if explicit {
            ReportLevel::ReportExplicit
        } else if unexpected || self.config.report_all_accesses {
            ReportLevel::Report
        } else {
            ReportLevel::Ignore
        };

        let reason = if covered {
            DecisionReason::Granted
        } else if policy.contains(PolicyBits::DENY) {
            DecisionReason::ExplicitDeny
        } else {
            DecisionReason::NoCoveringGrant
        };

        Ok(Verdict {
            decision: AccessDecision {
                allowed,
                reported: level != ReportLevel::Ignore,
                unexpected,
                matched_depth: resolution.matched_depth,
                reason,
            },
            policy,
            level,
        })
    }

    fn fault(&self, request: &AccessRequest<'_>, fault: &ArbitrationFault) -> Verdict {
        StatCounters::bump(&self.stats.faults);
        tracing::warn!(
            path = request.path,
            operation = %request.operation,
            pid = request.process_id,
            error = %fault,
            "arbitration failed, denying access"
        );
        Verdict::fail_closed(DecisionReason::InternalFault)
    }

    fn deliver(&self, request: &AccessRequest<'_>, verdict: Verdict) {
        let report = AccessReport {
            pip_id: self.config.pip_id,
            process_id: request.process_id,
            parent_process_id: request.parent_process_id,
            operation: request.operation,
            path: Cow::Borrowed(request.path),
            decision: verdict.decision,
            policy: verdict.policy,
            level: verdict.level,
            action: verdict.decision.action(),
        };
        // A panicking sink must not unwind into the interceptor.
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.sink.report(report))) {
            tracing::warn!(
                path = request.path,
                error = %panic_message(&*payload),
                "report sink panicked, report lost"
            );
        }
    }

    /// Record a process and its parent, as observed by the lifecycle
    /// collaborator.
    pub fn register_process(&self, pid: ProcessId, parent: Option<ProcessId>) {
        self.accounting.register_process(pid, parent);
    }

    /// I/O counters summed over `root` and its known descendants.
    pub fn aggregate_counters(&self, root: ProcessId) -> IoCounters {
        self.accounting.aggregate(root)
    }

    /// Aggregate and forget a finished process tree.
    pub fn retire_tree(&self, root: ProcessId) -> IoCounters {
        self.accounting.retire_tree(root)
    }

    /// Stop admitting accesses and flush the report sink.
    ///
    /// Calls already past the teardown check complete normally; later ones
    /// are denied and reported.
    pub fn begin_teardown(&self) {
        if self.tearing_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let stats = self.stats();
        tracing::info!(
            pip_id = self.config.pip_id,
            arbitrated = stats.arbitrated,
            denied = stats.denied,
            reported = stats.reported,
            "access arbiter tearing down"
        );
        self.sink.flush();
    }

    /// Whether [`begin_teardown`](Self::begin_teardown) has been called.
    pub fn is_tearing_down(&self) -> bool {
        self.tearing_down.load(Ordering::Acquire)
    }

    /// Activity counters so far.
    pub fn stats(&self) -> ArbiterStats {
        self.stats.snapshot()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
