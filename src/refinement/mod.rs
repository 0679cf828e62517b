//! Iterative refinement loop
//!
//! Bounds the execute -> review -> reject cycle. Each rejection increments
//! the issue's cycle count and renders deterministic feedback for the next
//! execution attempt; once the bound is reached the issue is escalated to a
//! human with a durable record, and no further auto re-enqueue occurs.

use crate::config::MusterConfig;
use crate::review::ReviewQueue;
use crate::store::{Namespace, StateStore};
use crate::{MusterError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Review verdict recorded in cycle history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleVerdict {
    Approved,
    Rejected,
}

/// One review cycle's outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewHistoryEntry {
    /// 1-based cycle number
    pub cycle: u32,
    /// Review that produced this verdict
    pub review_id: String,
    /// When the verdict landed
    pub reviewed_at: DateTime<Utc>,
    /// The verdict
    pub status: CycleVerdict,
    /// Rendered feedback (rejections)
    pub feedback: Option<String>,
}

/// Per-issue refinement tracking
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewCycleState {
    pub issue: u64,
    pub project: u64,
    /// Rejections processed so far; never exceeds the configured maximum
    pub cycle_count: u32,
    pub history: Vec<ReviewHistoryEntry>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Structured reviewer feedback, rendered into the feedback message
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewFeedback {
    /// Acceptance criteria the work does not meet
    pub unmet_criteria: Vec<String>,
    /// Code/product quality problems
    pub quality_issues: Vec<String>,
    /// Concrete changes the reviewer wants
    pub requested_changes: Vec<String>,
}

/// What happens to an issue after a rejection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionOutcome {
    /// Another attempt is allowed; the message carries the feedback for the
    /// next execution run
    Requeued { message: String },
    /// The bound is reached; a human owns this issue now
    Escalated { summary: String },
}

/// Durable escalation record, queryable after the live alert is gone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub issue: u64,
    pub project: u64,
    pub escalated_at: DateTime<Utc>,
    /// Human-readable summary spanning every cycle's feedback
    pub summary: String,
    pub acknowledged: bool,
}

/// Bounded rejection handling with escalation
#[derive(Clone)]
pub struct RefinementLoop {
    store: StateStore,
    reviews: ReviewQueue,
    max_cycles: u32,
}

impl RefinementLoop {
    pub fn new(store: StateStore, reviews: ReviewQueue, config: &MusterConfig) -> Self {
        Self {
            store,
            reviews,
            max_cycles: config.max_review_cycles,
        }
    }

    /// Rejections processed for an issue (0 if it was never rejected)
    pub fn cycle_count(&self, issue: u64) -> Result<u32> {
        Ok(self
            .store
            .get::<ReviewCycleState>(Namespace::Cycles, &issue.to_string())?
            .map_or(0, |s| s.cycle_count))
    }

    /// Full review history for an issue
    pub fn history(&self, issue: u64) -> Result<Vec<ReviewHistoryEntry>> {
        Ok(self
            .store
            .get::<ReviewCycleState>(Namespace::Cycles, &issue.to_string())?
            .map_or_else(Vec::new, |s| s.history))
    }

    /// Whether automated retry is exhausted for an issue
    pub fn should_escalate(&self, issue: u64) -> Result<bool> {
        Ok(self.cycle_count(issue)? >= self.max_cycles)
    }

    /// The most recent rejection's feedback, for injecting into the next
    /// execution attempt
    pub fn latest_feedback(&self, issue: u64) -> Result<Option<String>> {
        Ok(self
            .history(issue)?
            .into_iter()
            .rev()
            .find(|e| e.status == CycleVerdict::Rejected)
            .and_then(|e| e.feedback))
    }

    /// Process a review rejection
    ///
    /// Increments the issue's cycle count, appends history, and renders the
    /// feedback message. Returns `Requeued` while attempts remain, otherwise
    /// escalates. Calling this again after escalation is a no-op escalation:
    /// the count stays clamped and no new history entry is added.
    pub fn handle_rejection(
        &self,
        review_id: &str,
        feedback: &ReviewFeedback,
    ) -> Result<RejectionOutcome> {
        let review = self
            .reviews
            .get(review_id)?
            .ok_or_else(|| MusterError::NotFound(format!("review '{}'", review_id)))?;
        let issue = review.issue;
        let project = review.project;
        let max_cycles = self.max_cycles;

        let (cycle_count, message) = self.store.update(
            Namespace::Cycles,
            &issue.to_string(),
            |state: &mut ReviewCycleState| {
                state.issue = issue;
                state.project = project;

                if state.cycle_count >= max_cycles {
                    // Already escalated; keep the invariant cycle_count == history.len()
                    return Ok((state.cycle_count, None));
                }

                state.cycle_count += 1;
                let message = render_feedback(state.cycle_count, max_cycles, feedback);
                state.history.push(ReviewHistoryEntry {
                    cycle: state.cycle_count,
                    review_id: review_id.to_string(),
                    reviewed_at: Utc::now(),
                    status: CycleVerdict::Rejected,
                    feedback: Some(message.clone()),
                });
                state.last_updated = Some(Utc::now());
                Ok((state.cycle_count, Some(message)))
            },
        )?;

        if cycle_count >= self.max_cycles {
            let summary = self.escalate(issue)?;
            Ok(RejectionOutcome::Escalated { summary })
        } else {
            info!(
                issue,
                cycle = cycle_count,
                max = self.max_cycles,
                "Rejection processed, re-queueing for another attempt"
            );
            Ok(RejectionOutcome::Requeued {
                message: message.unwrap_or_default(),
            })
        }
    }

    /// Escalate an issue to a human operator
    ///
    /// Builds a summary spanning every cycle's feedback, persists it as a
    /// durable record, and raises a log alert. Idempotent: re-escalating
    /// refreshes the summary but keeps one record per issue.
    pub fn escalate(&self, issue: u64) -> Result<String> {
        let state = self
            .store
            .get::<ReviewCycleState>(Namespace::Cycles, &issue.to_string())?
            .ok_or_else(|| MusterError::NotFound(format!("cycle state for issue {}", issue)))?;

        let summary = render_escalation_summary(&state);
        let escalation = Escalation {
            issue,
            project: state.project,
            escalated_at: Utc::now(),
            summary: summary.clone(),
            acknowledged: false,
        };
        self.store
            .put(Namespace::Escalations, &issue.to_string(), &escalation)?;
        crate::monitor::metrics::record_escalation("max_cycles");

        warn!(
            issue,
            project = state.project,
            cycles = state.cycle_count,
            "Issue escalated to human operator"
        );
        Ok(summary)
    }

    /// All durable escalation records, newest first
    pub fn list_escalations(&self) -> Result<Vec<Escalation>> {
        let mut escalations = Vec::new();
        for key in self.store.list_keys(Namespace::Escalations)? {
            if let Some(e) = self.store.get::<Escalation>(Namespace::Escalations, &key)? {
                escalations.push(e);
            }
        }
        escalations.sort_by_key(|e| std::cmp::Reverse(e.escalated_at));
        Ok(escalations)
    }

    /// Mark an escalation as seen by an operator
    pub fn acknowledge(&self, issue: u64) -> Result<()> {
        let key = issue.to_string();
        let mut escalation = self
            .store
            .get::<Escalation>(Namespace::Escalations, &key)?
            .ok_or_else(|| MusterError::NotFound(format!("escalation for issue {}", issue)))?;
        escalation.acknowledged = true;
        self.store.put(Namespace::Escalations, &key, &escalation)
    }

    /// Reset cycle tracking after manual resolution
    pub fn clear(&self, issue: u64) -> Result<()> {
        self.store.delete(Namespace::Cycles, &issue.to_string())?;
        info!(issue, "Cycle tracking cleared");
        Ok(())
    }
}

/// Render the deterministic feedback message for one rejection
///
/// Sections in fixed order; the closing differs between a normal retry and
/// the final cycle.
fn render_feedback(cycle: u32, max_cycles: u32, feedback: &ReviewFeedback) -> String {
    let mut out = String::new();
    out.push_str(&format!("## Review Feedback (cycle {}/{})\n", cycle, max_cycles));

    if !feedback.unmet_criteria.is_empty() {
        out.push_str("\n### Unmet acceptance criteria\n");
        for item in &feedback.unmet_criteria {
            out.push_str(&format!("- {}\n", item));
        }
    }
    if !feedback.quality_issues.is_empty() {
        out.push_str("\n### Quality issues\n");
        for item in &feedback.quality_issues {
            out.push_str(&format!("- {}\n", item));
        }
    }
    if !feedback.requested_changes.is_empty() {
        out.push_str("\n### Requested changes\n");
        for item in &feedback.requested_changes {
            out.push_str(&format!("- {}\n", item));
        }
    }

    out.push('\n');
    if cycle >= max_cycles {
        out.push_str(
            "Maximum review cycles reached. This issue is escalated to a human operator; \
             no further automated attempts will be made.\n",
        );
    } else {
        out.push_str("Please address the feedback above and re-submit for review.\n");
    }
    out
}

/// Render the multi-cycle escalation summary
fn render_escalation_summary(state: &ReviewCycleState) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "# Escalation: issue {} (project {})\n\n\
         Automated refinement exhausted after {} review cycle(s). \
         A human needs to take this over.\n",
        state.issue, state.project, state.cycle_count
    ));

    for entry in &state.history {
        out.push_str(&format!(
            "\n## Cycle {} — {} ({})\n",
            entry.cycle,
            match entry.status {
                CycleVerdict::Approved => "approved",
                CycleVerdict::Rejected => "rejected",
            },
            entry.reviewed_at.to_rfc3339()
        ));
        if let Some(feedback) = &entry.feedback {
            out.push_str(feedback);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::ReviewStatus;
    use tempfile::TempDir;

    fn test_loop() -> (TempDir, ReviewQueue, RefinementLoop) {
        let temp = TempDir::new().unwrap();
        let store = StateStore::open(temp.path()).unwrap();
        let config = MusterConfig::new(temp.path());
        let reviews = ReviewQueue::new(store.clone(), &config);
        let refinement = RefinementLoop::new(store, reviews.clone(), &config);
        (temp, reviews, refinement)
    }

    fn reject_once(reviews: &ReviewQueue, refinement: &RefinementLoop, issue: u64) -> RejectionOutcome {
        let item = reviews.enqueue(1, issue, "branch", "a1").unwrap();
        reviews.claim(&item.review_id).unwrap().unwrap();
        reviews
            .update_status(&item.review_id, ReviewStatus::Rejected, Some("nope".to_string()))
            .unwrap();
        refinement
            .handle_rejection(
                &item.review_id,
                &ReviewFeedback {
                    unmet_criteria: vec!["criterion A".to_string()],
                    quality_issues: vec![],
                    requested_changes: vec!["add tests".to_string()],
                },
            )
            .unwrap()
    }

    #[test]
    fn test_cycle_count_starts_at_zero() {
        let (_temp, _reviews, refinement) = test_loop();
        assert_eq!(refinement.cycle_count(42).unwrap(), 0);
        assert!(!refinement.should_escalate(42).unwrap());
    }

    #[test]
    fn test_rejection_increments_and_requeues() {
        let (_temp, reviews, refinement) = test_loop();

        let outcome = reject_once(&reviews, &refinement, 42);
        let RejectionOutcome::Requeued { message } = outcome else {
            panic!("expected requeue on first rejection");
        };
        assert!(message.contains("cycle 1/3"));
        assert!(message.contains("criterion A"));
        assert!(message.contains("re-submit"));
        assert_eq!(refinement.cycle_count(42).unwrap(), 1);
    }

    #[test]
    fn test_third_rejection_escalates() {
        let (_temp, reviews, refinement) = test_loop();

        assert!(matches!(
            reject_once(&reviews, &refinement, 42),
            RejectionOutcome::Requeued { .. }
        ));
        assert!(matches!(
            reject_once(&reviews, &refinement, 42),
            RejectionOutcome::Requeued { .. }
        ));
        let third = reject_once(&reviews, &refinement, 42);
        let RejectionOutcome::Escalated { summary } = third else {
            panic!("expected escalation on third rejection");
        };

        assert!(refinement.should_escalate(42).unwrap());
        assert!(summary.contains("issue 42"));
        assert!(summary.contains("Cycle 3"));

        let history = refinement.history(42).unwrap();
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|e| e.status == CycleVerdict::Rejected));
    }

    #[test]
    fn test_cycle_count_never_exceeds_max() {
        let (_temp, reviews, refinement) = test_loop();

        for _ in 0..5 {
            reject_once(&reviews, &refinement, 42);
        }
        assert_eq!(refinement.cycle_count(42).unwrap(), 3);
        assert_eq!(refinement.history(42).unwrap().len(), 3);
    }

    #[test]
    fn test_escalation_record_is_durable() {
        let (_temp, reviews, refinement) = test_loop();
        for _ in 0..3 {
            reject_once(&reviews, &refinement, 42);
        }

        let escalations = refinement.list_escalations().unwrap();
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].issue, 42);
        assert!(!escalations[0].acknowledged);

        refinement.acknowledge(42).unwrap();
        let escalations = refinement.list_escalations().unwrap();
        assert!(escalations[0].acknowledged);
    }

    #[test]
    fn test_latest_feedback_tracks_most_recent_rejection() {
        let (_temp, reviews, refinement) = test_loop();

        reject_once(&reviews, &refinement, 42);
        let first = refinement.latest_feedback(42).unwrap().unwrap();
        assert!(first.contains("cycle 1/3"));

        reject_once(&reviews, &refinement, 42);
        let second = refinement.latest_feedback(42).unwrap().unwrap();
        assert!(second.contains("cycle 2/3"));
    }

    #[test]
    fn test_clear_resets_tracking() {
        let (_temp, reviews, refinement) = test_loop();
        reject_once(&reviews, &refinement, 42);
        assert_eq!(refinement.cycle_count(42).unwrap(), 1);

        refinement.clear(42).unwrap();
        assert_eq!(refinement.cycle_count(42).unwrap(), 0);
        assert!(refinement.latest_feedback(42).unwrap().is_none());
    }

    #[test]
    fn test_handle_rejection_unknown_review() {
        let (_temp, _reviews, refinement) = test_loop();
        let result = refinement.handle_rejection("rev-404", &ReviewFeedback::default());
        assert!(matches!(result, Err(MusterError::NotFound(_))));
    }

    #[test]
    fn test_final_cycle_message_mentions_escalation() {
        let rendered = render_feedback(3, 3, &ReviewFeedback::default());
        assert!(rendered.contains("Maximum review cycles reached"));

        let rendered = render_feedback(1, 3, &ReviewFeedback::default());
        assert!(rendered.contains("re-submit"));
    }
}
