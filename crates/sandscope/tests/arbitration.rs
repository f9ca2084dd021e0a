//! End-to-end tests for manifest loading, arbitration and accounting.
//!
//! These tests drive the public API the way a host and an interceptor would:
//! - Load a manifest document and build the arbiter
//! - Arbitrate accesses from several processes of one job
//! - Collect reports and aggregate counters at teardown

use std::sync::{Arc, Mutex, OnceLock};

use sandscope::policy::PolicyBits;
use sandscope::{
    AccessArbiter, AccessDecision, AccessReport, AccessRequest, DecisionReason, EnforcementMode,
    IoClass, ManifestConfig, MemorySink, Operation, ReportLevel, ReportSink, ResultAction,
};

const MANIFEST: &str = r#"{
    "pip_id": 1234,
    "mode": "strict",
    "case": "sensitive",
    "directives": [
        { "path": "/" },
        { "path": "/repo", "policy": "ALLOW_READ | ALLOW_ENUMERATE" },
        { "path": "/repo/.git", "mask": "MASK_ALL", "policy": "DENY | REPORT_ACCESS" },
        { "path": "/repo/tools/cc", "mask": "MASK_ALL", "policy": "ALLOW_READ", "kind": "exact" },
        { "path": "/out", "policy": "ALLOW_READ | ALLOW_WRITE | ALLOW_CREATE_DIRECTORY" },
        { "path": "/out/logs", "mask": "ALLOW_READ", "policy": "REPORT_ACCESS" }
    ]
}"#;

fn load(mode: EnforcementMode) -> (AccessArbiter, Arc<MemorySink>) {
    let mut config = ManifestConfig::from_json(MANIFEST).expect("parse manifest");
    config.mode = mode;
    let (tree, config) = config.into_parts().expect("build manifest");
    let sink = Arc::new(MemorySink::new());
    let arbiter = AccessArbiter::new(tree, config).with_sink(sink.clone());
    (arbiter, sink)
}

// =============================================================================
// Policy Resolution Tests
// =============================================================================

mod resolution {
    use super::*;

    #[test]
    fn test_scope_inheritance_and_veto() {
        let (arbiter, _) = load(EnforcementMode::Strict);
        let tree = arbiter.tree();

        let repo = tree.resolve("/repo/src/main.rs").expect("resolve");
        assert_eq!(repo.policy, PolicyBits::ALLOW_READ | PolicyBits::ALLOW_ENUMERATE);
        assert_eq!(repo.matched_depth, 1);

        let git = tree.resolve("/repo/.git/HEAD").expect("resolve");
        assert_eq!(git.policy, PolicyBits::DENY | PolicyBits::REPORT_ACCESS);
        assert_eq!(git.matched_depth, 2);

        let logs = tree.resolve("/out/logs/build.log").expect("resolve");
        assert_eq!(logs.policy, PolicyBits::ALLOW_READ | PolicyBits::REPORT_ACCESS);
    }

    #[test]
    fn test_exact_rule_does_not_reach_siblings() {
        let (arbiter, _) = load(EnforcementMode::Strict);
        let tree = arbiter.tree();

        let tool = tree.resolve("/repo/tools/cc").expect("resolve");
        assert_eq!(tool.policy, PolicyBits::ALLOW_READ);
        assert_eq!(tool.cone, PolicyBits::ALLOW_READ | PolicyBits::ALLOW_ENUMERATE);
        assert_eq!(tool.matched_depth, 3);

        let sibling = tree.resolve("/repo/tools/ld").expect("resolve");
        assert_eq!(sibling.policy, PolicyBits::ALLOW_READ | PolicyBits::ALLOW_ENUMERATE);
        assert_eq!(sibling.matched_depth, 1);
    }
}

// =============================================================================
// Arbitration Tests
// =============================================================================

mod arbitration {
    use super::*;

    #[test]
    fn test_strict_job() {
        let (arbiter, sink) = load(EnforcementMode::Strict);

        let read = arbiter.arbitrate(&AccessRequest::new("/repo/src/main.rs", Operation::Read, 100));
        assert!(read.allowed && !read.reported);

        let write = arbiter.arbitrate(&AccessRequest::new("/repo/src/main.rs", Operation::Write, 100));
        assert!(!write.allowed && write.reported);

        let git = arbiter.arbitrate(&AccessRequest::new("/repo/.git/config", Operation::Read, 100));
        assert!(!git.allowed);
        assert_eq!(git.reason, DecisionReason::ExplicitDeny);

        let mkdir = arbiter.arbitrate(&AccessRequest::new("/out/obj", Operation::CreateDirectory, 100));
        assert!(mkdir.allowed && !mkdir.reported);

        let log = arbiter.arbitrate(&AccessRequest::new("/out/logs/a.log", Operation::Write, 100));
        assert!(!log.allowed);

        let reports = sink.take();
        let paths: Vec<_> = reports.iter().map(|r| &*r.path).collect();
        assert_eq!(paths, ["/repo/src/main.rs", "/repo/.git/config", "/out/logs/a.log"]);
        assert!(reports.iter().all(|r| r.pip_id == 1234));
        assert_eq!(reports[1].level, ReportLevel::ReportExplicit);
        assert_eq!(reports[2].level, ReportLevel::ReportExplicit);
        assert!(reports.iter().all(|r| r.action == ResultAction::Deny));
    }

    #[test]
    fn test_permissive_job() {
        let (arbiter, sink) = load(EnforcementMode::Permissive);

        let write = arbiter.arbitrate(&AccessRequest::new("/repo/src/main.rs", Operation::Write, 100));
        assert!(write.allowed && write.reported && write.unexpected);
        assert_eq!(write.action(), ResultAction::Warn);

        let reports = sink.take();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].action, ResultAction::Warn);
    }

    #[test]
    fn test_decision_frames_survive_the_wire() {
        let (arbiter, _) = load(EnforcementMode::Strict);
        for (path, op) in [
            ("/repo/a", Operation::Read),
            ("/repo/.git/index", Operation::Write),
            ("relative", Operation::Probe),
        ] {
            let decision = arbiter.arbitrate(&AccessRequest::new(path, op, 1));
            let frame = decision.encode();
            assert_eq!(AccessDecision::decode(&frame).expect("decode"), decision);
        }
    }
}

// =============================================================================
// Reentrancy Tests
// =============================================================================

mod reentrancy {
    use super::*;

    /// Sink that performs an intercepted access of its own while reporting.
    #[derive(Default)]
    struct ReentrantSink {
        arbiter: OnceLock<Arc<AccessArbiter>>,
        nested: Mutex<Vec<AccessDecision>>,
    }

    impl ReportSink for ReentrantSink {
        fn report(&self, report: AccessReport<'_>) {
            if let Some(arbiter) = self.arbiter.get() {
                let pid = report.process_id;
                for nested in [
                    AccessRequest::new("/var/log/report", Operation::Write, pid),
                    AccessRequest::new("relative/report.log", Operation::Write, pid),
                    AccessRequest::new("/repo/.git/config", Operation::Read, pid),
                ] {
                    let decision = arbiter.arbitrate(&nested);
                    self.nested.lock().expect("lock").push(decision);
                }
            }
        }
    }

    #[test]
    fn test_sink_io_is_not_arbitrated() {
        let (tree, config) = ManifestConfig::from_json(MANIFEST)
            .expect("parse")
            .into_parts()
            .expect("build");
        let sink = Arc::new(ReentrantSink::default());
        let arbiter = Arc::new(AccessArbiter::new(tree, config).with_sink(sink.clone()));
        assert!(sink.arbiter.set(Arc::clone(&arbiter)).is_ok());

        let decision = arbiter.arbitrate(&AccessRequest::new("/etc/passwd", Operation::Read, 5));
        assert!(!decision.allowed);

        let nested = sink.nested.lock().expect("lock").clone();
        assert_eq!(nested, vec![AccessDecision::passthrough(); 3]);

        let stats = arbiter.stats();
        assert_eq!(stats.arbitrated, 1);
        assert_eq!(stats.suppressed, 3);
        assert_eq!(stats.reported, 1);
        assert_eq!(stats.faults, 0);
        assert_eq!(stats.denied, 1);
    }
}

// =============================================================================
// Accounting Tests
// =============================================================================

mod accounting {
    use super::*;

    #[test]
    fn test_job_counters_at_teardown() {
        let (arbiter, sink) = load(EnforcementMode::Strict);

        // shell (10) -> compiler (11) -> assembler (12)
        arbiter.register_process(10, None);
        arbiter.register_process(11, Some(10));
        arbiter.register_process(12, Some(11));

        arbiter.arbitrate(&AccessRequest::new("/repo/a.c", Operation::Read, 11).with_bytes(1000));
        arbiter.arbitrate(&AccessRequest::new("/out/a.s", Operation::Write, 11).with_bytes(400));
        arbiter.arbitrate(&AccessRequest::new("/out/a.s", Operation::Read, 12).with_bytes(400));
        arbiter.arbitrate(&AccessRequest::new("/out/a.o", Operation::Write, 12).with_bytes(200));
        arbiter.arbitrate(&AccessRequest::new("/repo", Operation::EnumerateDirectory, 10));
        // Denied accesses are not accounted.
        arbiter.arbitrate(&AccessRequest::new("/repo/a.c", Operation::Write, 12).with_bytes(5));

        let compiler = arbiter.aggregate_counters(11);
        assert_eq!(compiler.get(IoClass::Read).transfer_count, 1400);
        assert_eq!(compiler.get(IoClass::Write).transfer_count, 600);
        assert_eq!(compiler.get(IoClass::Other).operation_count, 0);

        let job = arbiter.aggregate_counters(10);
        assert_eq!(job.aggregate().operation_count, 5);
        assert_eq!(job.get(IoClass::Other).operation_count, 1);

        arbiter.begin_teardown();
        let late = arbiter.arbitrate(&AccessRequest::new("/repo/a.c", Operation::Read, 12));
        assert!(!late.allowed);
        assert_eq!(late.reason, DecisionReason::TearingDown);

        let retired = arbiter.retire_tree(10);
        assert_eq!(retired, job);
        assert_eq!(arbiter.accounting().process_count(), 0);

        let reasons: Vec<_> = sink.take().into_iter().map(|r| r.decision.reason).collect();
        assert_eq!(reasons, [DecisionReason::NoCoveringGrant, DecisionReason::TearingDown]);
    }
}
