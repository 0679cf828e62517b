//! Claim-based review queue
//!
//! Completed work waits here until a reviewer claims it. Claims are
//! exclusive and time-bounded: the pending -> in-review transition happens
//! inside a locked read-modify-write on the queue document, so two
//! concurrent claimers cannot both win, and a claim older than the timeout
//! is treated as abandoned and eligible for reclaim.

use crate::config::MusterConfig;
use crate::store::{Namespace, StateStore};
use crate::{MusterError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Key of the single queue document within the reviews namespace
const QUEUE_KEY: &str = "queue";

/// Review item status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    /// Waiting for a reviewer
    Pending,
    /// Claimed by a reviewer
    InReview,
    /// Review passed
    Approved,
    /// Review failed; feedback goes to the refinement loop
    Rejected,
}

impl ReviewStatus {
    /// Terminal statuses that stamp `completed_at`
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected)
    }
}

/// One unit of completed work awaiting review
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewItem {
    /// Unique review identifier
    pub review_id: String,

    /// Project the work belongs to
    pub project: u64,

    /// Issue the work closes
    pub issue: u64,

    /// Branch carrying the completed work
    pub branch_name: String,

    /// Agent that completed the work
    pub completed_by: String,

    /// Current status
    pub status: ReviewStatus,

    /// When the item entered the queue
    pub enqueued_at: DateTime<Utc>,

    /// When the current claim was taken
    pub claimed_at: Option<DateTime<Utc>>,

    /// When a terminal status was set
    pub completed_at: Option<DateTime<Utc>>,

    /// Reviewer feedback (rejections)
    pub feedback: Option<String>,
}

impl ReviewItem {
    /// Whether the item still blocks a new enqueue for its (project, issue)
    ///
    /// Pending items and unexpired in-review claims are active; an expired
    /// claim no longer counts, so a fresh enqueue may supersede it.
    pub fn is_active(&self, claim_timeout: Duration) -> bool {
        match self.status {
            ReviewStatus::Pending => true,
            ReviewStatus::InReview => !self.claim_expired(claim_timeout),
            _ => false,
        }
    }

    /// Whether an in-review claim has outlived the timeout
    pub fn claim_expired(&self, claim_timeout: Duration) -> bool {
        match (self.status, self.claimed_at) {
            (ReviewStatus::InReview, Some(claimed_at)) => {
                Utc::now() - claimed_at
                    > ChronoDuration::from_std(claim_timeout).unwrap_or(ChronoDuration::MAX)
            }
            _ => false,
        }
    }
}

/// The durable queue document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueueDoc {
    items: Vec<ReviewItem>,
    next_id: u64,
}

/// Durable FIFO-ish review queue with atomic claims
#[derive(Clone)]
pub struct ReviewQueue {
    store: StateStore,
    claim_timeout: Duration,
    retention: Duration,
}

impl ReviewQueue {
    /// Create a queue over the given store
    pub fn new(store: StateStore, config: &MusterConfig) -> Self {
        Self {
            store,
            claim_timeout: config.claim_timeout(),
            retention: config.review_retention(),
        }
    }

    fn load(&self) -> Result<QueueDoc> {
        Ok(self
            .store
            .get::<QueueDoc>(Namespace::Reviews, QUEUE_KEY)?
            .unwrap_or_default())
    }

    /// Enqueue completed work for review
    ///
    /// Idempotent: if an active item already exists for the same
    /// (project, issue), that item is returned instead of a duplicate.
    pub fn enqueue(
        &self,
        project: u64,
        issue: u64,
        branch_name: &str,
        completed_by: &str,
    ) -> Result<ReviewItem> {
        let claim_timeout = self.claim_timeout;
        self.store
            .update(Namespace::Reviews, QUEUE_KEY, |doc: &mut QueueDoc| {
                if let Some(existing) = doc
                    .items
                    .iter()
                    .find(|i| i.project == project && i.issue == issue && i.is_active(claim_timeout))
                {
                    debug!(
                        review_id = %existing.review_id,
                        project,
                        issue,
                        "Active review already queued, returning it"
                    );
                    return Ok(existing.clone());
                }

                doc.next_id += 1;
                let item = ReviewItem {
                    review_id: format!("rev-{}", doc.next_id),
                    project,
                    issue,
                    branch_name: branch_name.to_string(),
                    completed_by: completed_by.to_string(),
                    status: ReviewStatus::Pending,
                    enqueued_at: Utc::now(),
                    claimed_at: None,
                    completed_at: None,
                    feedback: None,
                };
                info!(review_id = %item.review_id, project, issue, "Review enqueued");
                doc.items.push(item.clone());
                Ok(item)
            })
    }

    /// All items, oldest first so reviewers serve the longest-waiting work
    pub fn list(&self) -> Result<Vec<ReviewItem>> {
        let mut items = self.load()?.items;
        items.sort_by_key(|i| i.enqueued_at);
        Ok(items)
    }

    /// Look up one item
    pub fn get(&self, review_id: &str) -> Result<Option<ReviewItem>> {
        Ok(self
            .load()?
            .items
            .into_iter()
            .find(|i| i.review_id == review_id))
    }

    /// Atomically claim an item for review
    ///
    /// Transitions pending -> in-review (or reclaims an expired claim) and
    /// stamps `claimed_at`. Returns `None` when the item is missing, already
    /// actively claimed, already completed, or when its expired claim has
    /// been superseded by a fresh enqueue for the same `(project, issue)`.
    /// At most one concurrent caller gets `Some` for a given item, and at
    /// most one active item per `(project, issue)` ever results.
    pub fn claim(&self, review_id: &str) -> Result<Option<ReviewItem>> {
        let claim_timeout = self.claim_timeout;
        self.store
            .update(Namespace::Reviews, QUEUE_KEY, |doc: &mut QueueDoc| {
                let Some(pos) = doc.items.iter().position(|i| i.review_id == review_id) else {
                    return Ok(None);
                };

                let (project, issue) = (doc.items[pos].project, doc.items[pos].issue);
                let reclaim = doc.items[pos].claim_expired(claim_timeout);
                if reclaim {
                    // An expired claim may already have been superseded by a
                    // fresh enqueue; reviving it would put two active items
                    // in flight for the same issue.
                    let superseded = doc.items.iter().enumerate().any(|(other, i)| {
                        other != pos
                            && i.project == project
                            && i.issue == issue
                            && i.is_active(claim_timeout)
                    });
                    if superseded {
                        debug!(review_id, "Expired claim superseded, refusing reclaim");
                        return Ok(None);
                    }
                    warn!(review_id, "Reclaiming expired review claim");
                }

                let item = &mut doc.items[pos];
                if item.status == ReviewStatus::Pending || reclaim {
                    item.status = ReviewStatus::InReview;
                    item.claimed_at = Some(Utc::now());
                    info!(review_id, "Review claimed");
                    Ok(Some(item.clone()))
                } else {
                    debug!(review_id, status = ?item.status, "Claim lost");
                    Ok(None)
                }
            })
    }

    /// Set a terminal status on a claimed item
    pub fn update_status(
        &self,
        review_id: &str,
        status: ReviewStatus,
        feedback: Option<String>,
    ) -> Result<ReviewItem> {
        if !status.is_terminal() {
            return Err(MusterError::Other(format!(
                "update_status only accepts terminal statuses, got {:?}",
                status
            )));
        }
        self.store
            .update(Namespace::Reviews, QUEUE_KEY, |doc: &mut QueueDoc| {
                let item = doc
                    .items
                    .iter_mut()
                    .find(|i| i.review_id == review_id)
                    .ok_or_else(|| MusterError::NotFound(format!("review '{}'", review_id)))?;

                item.status = status;
                item.completed_at = Some(Utc::now());
                item.feedback = feedback.clone();
                info!(review_id, ?status, "Review completed");
                Ok(item.clone())
            })
    }

    /// In-review items whose claim has outlived the timeout
    ///
    /// These are stale claims: abandoned by their reviewer and eligible for
    /// reclaim or escalation.
    pub fn list_timed_out(&self) -> Result<Vec<ReviewItem>> {
        Ok(self
            .load()?
            .items
            .into_iter()
            .filter(|i| i.claim_expired(self.claim_timeout))
            .collect())
    }

    /// Purge completed items older than the retention window
    pub fn cleanup_old(&self) -> Result<usize> {
        let retention =
            ChronoDuration::from_std(self.retention).unwrap_or(ChronoDuration::MAX);
        self.store
            .update(Namespace::Reviews, QUEUE_KEY, |doc: &mut QueueDoc| {
                let before = doc.items.len();
                let cutoff = Utc::now() - retention;
                doc.items.retain(|i| match (i.status.is_terminal(), i.completed_at) {
                    (true, Some(completed_at)) => completed_at > cutoff,
                    _ => true,
                });
                let purged = before - doc.items.len();
                if purged > 0 {
                    info!(purged, "Old review items purged");
                }
                Ok(purged)
            })
    }

    /// Number of pending plus in-review items (the review backlog)
    pub fn backlog_len(&self) -> Result<usize> {
        Ok(self
            .load()?
            .items
            .iter()
            .filter(|i| matches!(i.status, ReviewStatus::Pending | ReviewStatus::InReview))
            .count())
    }

    /// Number of unexpired in-review claims
    pub fn claimed_len(&self) -> Result<usize> {
        Ok(self
            .load()?
            .items
            .iter()
            .filter(|i| i.status == ReviewStatus::InReview && !i.claim_expired(self.claim_timeout))
            .count())
    }
}
