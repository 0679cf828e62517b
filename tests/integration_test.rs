//! Integration tests for Muster
//!
//! These tests exercise full workflows across the store, session registry,
//! review queue, refinement loop, conflict queue, scheduler, and monitor.

use chrono::{Duration as ChronoDuration, Utc};
use muster::config::MusterConfig;
use muster::conflict::{ClaimLedger, ConflictQueue};
use muster::monitor::LoopHealthMonitor;
use muster::refinement::{RefinementLoop, RejectionOutcome, ReviewFeedback};
use muster::review::{ReviewQueue, ReviewStatus};
use muster::scheduler::CategoryScheduler;
use muster::session::{AgentStatus, SessionRegistry, SessionUpdate};
use muster::store::{Namespace, StateStore};
use tempfile::TempDir;

struct Fleet {
    _temp: TempDir,
    store: StateStore,
    config: MusterConfig,
    registry: SessionRegistry,
    reviews: ReviewQueue,
    refinement: RefinementLoop,
    conflicts: ConflictQueue,
    claims: ClaimLedger,
    monitor: LoopHealthMonitor,
}

/// Wire up every component over one temp state directory
fn fleet() -> Fleet {
    let temp = TempDir::new().unwrap();
    let config = MusterConfig::new(temp.path());
    let store = StateStore::open(&config.state_dir).unwrap();
    let registry = SessionRegistry::new(store.clone());
    let reviews = ReviewQueue::new(store.clone(), &config);
    let refinement = RefinementLoop::new(store.clone(), reviews.clone(), &config);
    let conflicts = ConflictQueue::new(store.clone());
    let claims = ClaimLedger::new(store.clone());
    let scheduler = CategoryScheduler::new(store.clone(), &config);
    let monitor = LoopHealthMonitor::new(
        store.clone(),
        registry.clone(),
        reviews.clone(),
        claims.clone(),
        scheduler,
        config.clone(),
    );
    let registry = registry.with_transition_hook(monitor.transition_hook());
    Fleet {
        _temp: temp,
        store,
        config,
        registry,
        reviews,
        refinement,
        conflicts,
        claims,
        monitor,
    }
}

fn reject(f: &Fleet, review_id: &str) -> RejectionOutcome {
    f.reviews.claim(review_id).unwrap().unwrap();
    f.reviews
        .update_status(review_id, ReviewStatus::Rejected, None)
        .unwrap();
    f.refinement
        .handle_rejection(
            review_id,
            &ReviewFeedback {
                unmet_criteria: vec!["criterion not met".to_string()],
                quality_issues: vec![],
                requested_changes: vec!["rework the approach".to_string()],
            },
        )
        .unwrap()
}

mod refinement_workflow_tests {
    use super::*;

    /// An agent works an issue, gets rejected three times, and the issue
    /// escalates with the full history intact.
    #[test]
    fn test_three_rejections_escalate_with_history() {
        let f = fleet();

        f.registry.create("a1").unwrap();
        f.registry
            .update(
                "a1",
                SessionUpdate::status(AgentStatus::Working)
                    .with_project(7)
                    .with_branch("agent/a1/issue-99"),
            )
            .unwrap();

        // First rejection: re-queued with feedback
        let item = f.reviews.enqueue(7, 99, "agent/a1/issue-99", "a1").unwrap();
        let outcome = reject(&f, &item.review_id);
        let RejectionOutcome::Requeued { message } = outcome else {
            panic!("first rejection should re-queue");
        };
        assert!(message.contains("cycle 1/3"));

        // Second rejection after a fresh enqueue
        let item = f.reviews.enqueue(7, 99, "agent/a1/issue-99", "a1").unwrap();
        assert!(matches!(
            reject(&f, &item.review_id),
            RejectionOutcome::Requeued { .. }
        ));

        // Third rejection: escalation
        let item = f.reviews.enqueue(7, 99, "agent/a1/issue-99", "a1").unwrap();
        let RejectionOutcome::Escalated { summary } = reject(&f, &item.review_id) else {
            panic!("third rejection should escalate");
        };
        assert!(summary.contains("issue 99"));

        let history = f.refinement.history(99).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].cycle, 1);
        assert_eq!(history[2].cycle, 3);

        // The escalation is durable and visible to operators
        let escalations = f.refinement.list_escalations().unwrap();
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].issue, 99);

        // No further automated attempts: the count stays clamped
        let item = f.reviews.enqueue(7, 99, "agent/a1/issue-99", "a1").unwrap();
        assert!(matches!(
            reject(&f, &item.review_id),
            RejectionOutcome::Escalated { .. }
        ));
        assert_eq!(f.refinement.cycle_count(99).unwrap(), 3);
    }

    /// Approval leaves no refinement state behind
    #[test]
    fn test_approval_does_not_touch_cycle_count() {
        let f = fleet();
        let item = f.reviews.enqueue(1, 5, "branch", "a1").unwrap();
        f.reviews.claim(&item.review_id).unwrap().unwrap();
        f.reviews
            .update_status(&item.review_id, ReviewStatus::Approved, None)
            .unwrap();

        assert_eq!(f.refinement.cycle_count(5).unwrap(), 0);
        assert!(f.refinement.list_escalations().unwrap().is_empty());
    }
}

mod conflict_workflow_tests {
    use super::*;

    /// An agent hits a merge conflict on a claimed issue; aborting returns
    /// the issue to the backlog and clears the conflict.
    #[test]
    fn test_abort_returns_issue_to_backlog() {
        let f = fleet();

        f.claims.claim(1, 42, "a1").unwrap();
        assert!(!f.claims.available(1, 42).unwrap());

        let conflict = f
            .conflicts
            .add(
                1,
                42,
                "agent/a1/issue-42",
                vec!["src/lib.rs".to_string(), "src/parser.rs".to_string()],
                "a1",
            )
            .unwrap();
        assert_eq!(f.conflicts.list().unwrap().len(), 1);

        f.conflicts.abort(&conflict.conflict_id, &f.claims).unwrap();

        assert!(f.conflicts.list().unwrap().is_empty());
        // Any agent can pick the issue up again
        assert!(f.claims.available(1, 42).unwrap());
        f.claims.claim(1, 42, "a2").unwrap();
    }

    /// Resolution keeps the claim so the original agent proceeds
    #[test]
    fn test_resolve_keeps_issue_claimed() {
        let f = fleet();
        f.claims.claim(1, 42, "a1").unwrap();
        let conflict = f.conflicts.add(1, 42, "branch", vec![], "a1").unwrap();

        f.conflicts.resolve(&conflict.conflict_id).unwrap();
        assert_eq!(f.claims.holder(1, 42).unwrap().as_deref(), Some("a1"));
    }
}

mod monitor_workflow_tests {
    use super::*;

    /// An agent silent for 35 minutes shows up stuck and unhealthy
    #[test]
    fn test_silent_agent_is_detected_stuck() {
        let f = fleet();
        f.registry.create("a1").unwrap();

        let mut session = f.registry.get("a1").unwrap();
        session.last_heartbeat = Utc::now() - ChronoDuration::minutes(35);
        f.store.put(Namespace::Sessions, "a1", &session).unwrap();

        let stuck = f.monitor.detect_stuck_agents().unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].agent_id, "a1");

        let report = f.monitor.validate_health().unwrap();
        assert!(!report.healthy);
    }

    /// Queue depth 2 asks for more ideation; depth 12 asks for a pause
    #[test]
    fn test_queue_depth_throttling_signals() {
        let f = fleet();

        f.claims.claim(1, 1, "a1").unwrap();
        f.claims.claim(1, 2, "a2").unwrap();
        assert!(f.monitor.should_prioritize_ideation().unwrap());
        assert!(!f.monitor.should_pause_ideation().unwrap());

        for issue in 3..=12 {
            f.claims.claim(1, issue, "a1").unwrap();
        }
        assert!(!f.monitor.should_prioritize_ideation().unwrap());
        assert!(f.monitor.should_pause_ideation().unwrap());
    }

    /// Registry status changes flow into the transition log via the hook
    #[test]
    fn test_transitions_recorded_through_hook() {
        let f = fleet();
        f.registry.create("a1").unwrap();

        f.registry
            .update("a1", SessionUpdate::status(AgentStatus::Working).with_project(3))
            .unwrap();
        f.registry
            .update("a1", SessionUpdate::status(AgentStatus::Idle))
            .unwrap();
        f.registry
            .update("a1", SessionUpdate::status(AgentStatus::Working))
            .unwrap();

        let transitions = f.monitor.transitions("a1").unwrap();
        assert_eq!(transitions.len(), 3);
        assert_eq!(transitions[0].project, Some(3));

        // Two entries into working = one completed cycle
        let cycle = f.monitor.cycle_time("a1").unwrap();
        assert_eq!(cycle.cycles_completed, 1);
    }
}

mod durability_tests {
    use super::*;

    /// Everything written before a restart is visible after reopening the
    /// store from the same directory.
    #[test]
    fn test_state_survives_restart() {
        let temp = TempDir::new().unwrap();
        let config = MusterConfig::new(temp.path());

        {
            let store = StateStore::open(&config.state_dir).unwrap();
            let registry = SessionRegistry::new(store.clone());
            let reviews = ReviewQueue::new(store.clone(), &config);
            let claims = ClaimLedger::new(store.clone());

            registry.create("a1").unwrap();
            registry
                .update("a1", SessionUpdate::status(AgentStatus::Working).with_project(9))
                .unwrap();
            reviews.enqueue(9, 1, "branch", "a1").unwrap();
            claims.claim(9, 1, "a1").unwrap();
        }

        // "Restart": fresh handles over the same directory
        let store = StateStore::open(&config.state_dir).unwrap();
        let registry = SessionRegistry::new(store.clone());
        let reviews = ReviewQueue::new(store.clone(), &config);
        let claims = ClaimLedger::new(store);

        let session = registry.get("a1").unwrap();
        assert_eq!(session.status, AgentStatus::Working);
        assert_eq!(session.current_project, Some(9));
        assert_eq!(reviews.list().unwrap().len(), 1);
        assert_eq!(claims.holder(9, 1).unwrap().as_deref(), Some("a1"));
    }

    /// A corrupt session record heals to a default instead of wedging reads
    #[test]
    fn test_corrupt_session_heals() {
        let f = fleet();
        f.registry.create("a1").unwrap();

        let path = f
            .config
            .state_dir
            .join("sessions")
            .join("a1.json");
        std::fs::write(&path, "{ not json").unwrap();

        // The unreadable record is dropped rather than propagated
        assert!(f.registry.read("a1").unwrap().is_none());
        // And the agent can be re-registered cleanly
        let session = f.registry.create("a1").unwrap();
        assert_eq!(session.status, AgentStatus::Idle);
    }
}
