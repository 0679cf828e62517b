//! Conflict queue and the issue claim ledger
//!
//! Merge conflicts an agent cannot resolve go here for a human. Resolution
//! removes the item; abort removes it *and* releases the agent's claim on
//! the underlying issue so the work returns to the backlog. Release happens
//! before removal: if the process dies between the two steps, the operator
//! still sees the conflict rather than an invisibly claimed issue.

use crate::store::{Namespace, StateStore};
use crate::{MusterError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

/// Conflict item status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    /// Waiting for an operator
    Pending,
    /// An operator is on it
    Resolving,
    /// Fixed; removal is imminent
    Resolved,
}

/// One detected merge conflict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictItem {
    pub conflict_id: String,
    pub project: u64,
    pub issue: u64,
    pub branch_name: String,
    pub conflicting_files: Vec<String>,
    pub status: ConflictStatus,
    pub created_at: DateTime<Utc>,
    /// Agent that hit the conflict
    pub agent_id: String,
}

/// The durable conflict queue document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ConflictDoc {
    items: Vec<ConflictItem>,
    next_id: u64,
}

/// Seam to whatever component owns issue claims
///
/// `abort` is a compensating action across the conflict queue and the claim
/// owner; this trait is the boundary between them.
pub trait ClaimRelease {
    /// Return the issue to the backlog so any agent can pick it up again
    fn release(&self, project: u64, issue: u64) -> Result<()>;
}

/// Manual-intervention queue for merge conflicts
#[derive(Clone)]
pub struct ConflictQueue {
    store: StateStore,
}

const QUEUE_KEY: &str = "queue";

impl ConflictQueue {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    fn load(&self) -> Result<ConflictDoc> {
        Ok(self
            .store
            .get::<ConflictDoc>(Namespace::Conflicts, QUEUE_KEY)?
            .unwrap_or_default())
    }

    /// Record a detected conflict
    ///
    /// The write is synchronous and durable, so the item is visible to
    /// operators as soon as this returns.
    pub fn add(
        &self,
        project: u64,
        issue: u64,
        branch_name: &str,
        conflicting_files: Vec<String>,
        agent_id: &str,
    ) -> Result<ConflictItem> {
        self.store
            .update(Namespace::Conflicts, QUEUE_KEY, |doc: &mut ConflictDoc| {
                doc.next_id += 1;
                let item = ConflictItem {
                    conflict_id: format!("conflict-{}", doc.next_id),
                    project,
                    issue,
                    branch_name: branch_name.to_string(),
                    conflicting_files,
                    status: ConflictStatus::Pending,
                    created_at: Utc::now(),
                    agent_id: agent_id.to_string(),
                };
                warn!(
                    conflict_id = %item.conflict_id,
                    project,
                    issue,
                    agent_id,
                    files = item.conflicting_files.len(),
                    "Merge conflict queued for manual intervention"
                );
                doc.items.push(item.clone());
                Ok(item)
            })
    }

    /// All conflicts, oldest first
    pub fn list(&self) -> Result<Vec<ConflictItem>> {
        let mut items = self.load()?.items;
        items.sort_by_key(|i| i.created_at);
        Ok(items)
    }

    /// Look up one conflict
    pub fn get(&self, conflict_id: &str) -> Result<Option<ConflictItem>> {
        Ok(self
            .load()?
            .items
            .into_iter()
            .find(|i| i.conflict_id == conflict_id))
    }

    /// Update a conflict's status (operator action)
    pub fn set_status(&self, conflict_id: &str, status: ConflictStatus) -> Result<ConflictItem> {
        self.store
            .update(Namespace::Conflicts, QUEUE_KEY, |doc: &mut ConflictDoc| {
                let item = doc
                    .items
                    .iter_mut()
                    .find(|i| i.conflict_id == conflict_id)
                    .ok_or_else(|| {
                        MusterError::NotFound(format!("conflict '{}'", conflict_id))
                    })?;
                item.status = status;
                info!(conflict_id, ?status, "Conflict status updated");
                Ok(item.clone())
            })
    }

    /// Remove a resolved conflict; the agent proceeds with its claim intact
    pub fn resolve(&self, conflict_id: &str) -> Result<ConflictItem> {
        let removed = self.remove(conflict_id)?;
        info!(conflict_id, issue = removed.issue, "Conflict resolved");
        Ok(removed)
    }

    /// Abort the conflicted work
    ///
    /// Releases the underlying issue claim first, then removes the conflict
    /// record. If the release fails, the conflict stays queued so the
    /// inconsistency remains visible.
    pub fn abort(&self, conflict_id: &str, claims: &dyn ClaimRelease) -> Result<ConflictItem> {
        let item = self
            .get(conflict_id)?
            .ok_or_else(|| MusterError::NotFound(format!("conflict '{}'", conflict_id)))?;

        claims.release(item.project, item.issue)?;
        let removed = self.remove(conflict_id)?;
        info!(
            conflict_id,
            issue = removed.issue,
            "Conflict aborted, issue returned to backlog"
        );
        Ok(removed)
    }

    fn remove(&self, conflict_id: &str) -> Result<ConflictItem> {
        self.store
            .update(Namespace::Conflicts, QUEUE_KEY, |doc: &mut ConflictDoc| {
                let pos = doc
                    .items
                    .iter()
                    .position(|i| i.conflict_id == conflict_id)
                    .ok_or_else(|| {
                        MusterError::NotFound(format!("conflict '{}'", conflict_id))
                    })?;
                Ok(doc.items.remove(pos))
            })
    }
}

/// Durable map of issue claims
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ClaimDoc {
    /// "project/issue" -> claiming agent
    claims: HashMap<String, String>,
}

/// Store-backed owner of issue claims
///
/// The work dispatcher consults this to decide what is available; the
/// conflict queue releases through it on abort.
#[derive(Clone)]
pub struct ClaimLedger {
    store: StateStore,
}

const LEDGER_KEY: &str = "ledger";

fn claim_key(project: u64, issue: u64) -> String {
    format!("{}/{}", project, issue)
}

impl ClaimLedger {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Claim an issue for an agent
    ///
    /// Fails with `AlreadyClaimed` if another agent holds it; re-claiming
    /// by the same agent is a no-op.
    pub fn claim(&self, project: u64, issue: u64, agent_id: &str) -> Result<()> {
        self.store
            .update(Namespace::Claims, LEDGER_KEY, |doc: &mut ClaimDoc| {
                let key = claim_key(project, issue);
                match doc.claims.get(&key) {
                    Some(holder) if holder != agent_id => Err(MusterError::AlreadyClaimed {
                        id: key.clone(),
                        claimed_by: holder.clone(),
                    }),
                    _ => {
                        doc.claims.insert(key, agent_id.to_string());
                        Ok(())
                    }
                }
            })
    }

    /// Whether an issue is currently claimed
    pub fn holder(&self, project: u64, issue: u64) -> Result<Option<String>> {
        let doc = self
            .store
            .get::<ClaimDoc>(Namespace::Claims, LEDGER_KEY)?
            .unwrap_or_default();
        Ok(doc.claims.get(&claim_key(project, issue)).cloned())
    }

    /// Whether an issue is available for dispatch
    pub fn available(&self, project: u64, issue: u64) -> Result<bool> {
        Ok(self.holder(project, issue)?.is_none())
    }

    /// Number of issues currently claimed (project work in flight)
    pub fn claimed_count(&self) -> Result<usize> {
        let doc = self
            .store
            .get::<ClaimDoc>(Namespace::Claims, LEDGER_KEY)?
            .unwrap_or_default();
        Ok(doc.claims.len())
    }
}

impl ClaimRelease for ClaimLedger {
    fn release(&self, project: u64, issue: u64) -> Result<()> {
        self.store
            .update(Namespace::Claims, LEDGER_KEY, |doc: &mut ClaimDoc| {
                doc.claims.remove(&claim_key(project, issue));
                Ok(())
            })?;
        info!(project, issue, "Issue claim released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_queue() -> (TempDir, ConflictQueue, ClaimLedger) {
        let temp = TempDir::new().unwrap();
        let store = StateStore::open(temp.path()).unwrap();
        (
            temp,
            ConflictQueue::new(store.clone()),
            ClaimLedger::new(store),
        )
    }

    #[test]
    fn test_add_is_immediately_listed() {
        let (_temp, queue, _claims) = test_queue();

        let item = queue
            .add(
                1,
                42,
                "agent/a1/issue-42",
                vec!["src/lib.rs".to_string(), "src/main.rs".to_string()],
                "a1",
            )
            .unwrap();

        let listed = queue.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].conflict_id, item.conflict_id);
        assert_eq!(listed[0].conflicting_files.len(), 2);
        assert_eq!(listed[0].status, ConflictStatus::Pending);
    }

    #[test]
    fn test_set_status() {
        let (_temp, queue, _claims) = test_queue();
        let item = queue.add(1, 42, "branch", vec![], "a1").unwrap();

        let updated = queue
            .set_status(&item.conflict_id, ConflictStatus::Resolving)
            .unwrap();
        assert_eq!(updated.status, ConflictStatus::Resolving);

        let missing = queue.set_status("conflict-404", ConflictStatus::Resolved);
        assert!(matches!(missing, Err(MusterError::NotFound(_))));
    }

    #[test]
    fn test_resolve_keeps_claim() {
        let (_temp, queue, claims) = test_queue();
        claims.claim(1, 42, "a1").unwrap();
        let item = queue.add(1, 42, "branch", vec![], "a1").unwrap();

        queue.resolve(&item.conflict_id).unwrap();
        assert!(queue.list().unwrap().is_empty());
        // The agent still owns the issue and proceeds
        assert_eq!(claims.holder(1, 42).unwrap().as_deref(), Some("a1"));
    }

    #[test]
    fn test_abort_releases_claim_and_removes() {
        let (_temp, queue, claims) = test_queue();
        claims.claim(1, 42, "a1").unwrap();
        let item = queue
            .add(
                1,
                42,
                "branch",
                vec!["a.rs".to_string(), "b.rs".to_string()],
                "a1",
            )
            .unwrap();

        queue.abort(&item.conflict_id, &claims).unwrap();
        assert!(queue.list().unwrap().is_empty());
        assert!(claims.available(1, 42).unwrap());
    }

    #[test]
    fn test_abort_failure_leaves_conflict_visible() {
        struct FailingRelease;
        impl ClaimRelease for FailingRelease {
            fn release(&self, _project: u64, _issue: u64) -> Result<()> {
                Err(MusterError::Storage("release failed".to_string()))
            }
        }

        let (_temp, queue, _claims) = test_queue();
        let item = queue.add(1, 42, "branch", vec![], "a1").unwrap();

        let result = queue.abort(&item.conflict_id, &FailingRelease);
        assert!(result.is_err());
        // The conflict record survives, so the inconsistency stays visible
        assert_eq!(queue.list().unwrap().len(), 1);
    }

    #[test]
    fn test_claim_ledger_exclusivity() {
        let (_temp, _queue, claims) = test_queue();

        claims.claim(1, 42, "a1").unwrap();
        // Same agent re-claiming is fine
        claims.claim(1, 42, "a1").unwrap();

        let other = claims.claim(1, 42, "a2");
        assert!(matches!(other, Err(MusterError::AlreadyClaimed { .. })));

        assert_eq!(claims.claimed_count().unwrap(), 1);
    }
}
