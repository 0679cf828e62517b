//! Agent session records and the session registry
//!
//! One durable record per agent holds its status, current assignment,
//! heartbeat, and error counters. Status changes go through a state machine;
//! anything else is rejected as an invalid transition.

use crate::retry::{with_retry, RetryConfig};
use crate::store::{Namespace, StateStore};
use crate::{MusterError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Agent status indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Resting and healthy, ready for an assignment
    #[default]
    Idle,

    /// Executing an assignment
    Working,

    /// Reviewing another agent's completed work
    Reviewing,

    /// Generating new work from a category
    Ideating,

    /// Parked by an operator
    Paused,

    /// Resting because something went wrong (crash, spawn failure)
    Failed,
}

impl AgentStatus {
    /// Check whether the state machine allows `self -> to`
    pub fn can_transition_to(&self, to: AgentStatus) -> bool {
        use AgentStatus::*;
        if *self == to {
            // Re-asserting the current status is a heartbeat, not a transition
            return true;
        }
        match (*self, to) {
            // Failure can strike anywhere: spawn errors while idle, crashes
            // while working or paused.
            (_, Failed) => true,
            (Idle, Working) => true,
            (Working, Reviewing) | (Working, Ideating) | (Working, Idle) => true,
            (Reviewing, Idle) | (Ideating, Idle) => true,
            // Operator pause from any non-failed state; resume back to idle
            (Idle, Paused) | (Working, Paused) | (Reviewing, Paused) | (Ideating, Paused) => true,
            (Paused, Idle) => true,
            // Failed agents are reset by an operator or re-dispatched directly
            (Failed, Idle) | (Failed, Working) => true,
            _ => false,
        }
    }

    /// Check if the agent counts toward in-flight work
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Working | Self::Reviewing | Self::Ideating)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Working => "working",
            Self::Reviewing => "reviewing",
            Self::Ideating => "ideating",
            Self::Paused => "paused",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Durable state record for one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSession {
    /// Unique agent identifier
    pub agent_id: String,

    /// Current status
    pub status: AgentStatus,

    /// Project the agent is currently assigned to
    pub current_project: Option<u64>,

    /// Phase within the current assignment (execute, review, ideate)
    pub current_phase: Option<String>,

    /// Working branch for the current assignment
    pub branch_name: Option<String>,

    /// Last time this record was written
    pub last_heartbeat: DateTime<Utc>,

    /// Assignments completed over the session's lifetime
    pub tasks_completed: u64,

    /// Human-readable description of the current task
    pub current_task: Option<String>,

    /// Errors observed over the session's lifetime
    pub error_count: u32,

    /// Most recent error description
    pub last_error: Option<String>,
}

impl AgentSession {
    /// Create a fresh idle session
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            status: AgentStatus::Idle,
            current_project: None,
            current_phase: None,
            branch_name: None,
            last_heartbeat: Utc::now(),
            tasks_completed: 0,
            current_task: None,
            error_count: 0,
            last_error: None,
        }
    }

    /// Age of the last heartbeat
    pub fn heartbeat_age(&self) -> chrono::Duration {
        Utc::now() - self.last_heartbeat
    }
}

impl Default for AgentSession {
    fn default() -> Self {
        Self::new("")
    }
}

/// Partial update merged into an existing session
///
/// `None` fields are left untouched; `Some` fields replace the stored value.
/// Clearing an optional field goes through the dedicated `clear_*` flags so
/// the common case stays terse.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub status: Option<AgentStatus>,
    pub current_project: Option<u64>,
    pub current_phase: Option<String>,
    pub branch_name: Option<String>,
    pub current_task: Option<String>,
    pub tasks_completed_delta: u64,
    pub error: Option<String>,
    pub clear_assignment: bool,
}

impl SessionUpdate {
    pub fn status(status: AgentStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_project(mut self, project: u64) -> Self {
        self.current_project = Some(project);
        self
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.current_phase = Some(phase.into());
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch_name = Some(branch.into());
        self
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.current_task = Some(task.into());
        self
    }

    /// Record an error: bumps `error_count` and sets `last_error`
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn completed_task(mut self) -> Self {
        self.tasks_completed_delta += 1;
        self
    }

    /// Drop the current assignment fields (project, phase, branch, task)
    pub fn clearing_assignment(mut self) -> Self {
        self.clear_assignment = true;
        self
    }
}

/// Hook invoked after every accepted status transition
pub type TransitionHook =
    Arc<dyn Fn(&str, AgentStatus, AgentStatus, Option<u64>) + Send + Sync>;

/// CRUD over agent session records
///
/// Mutating operations retry with exponential backoff (1s, 2s, 4s) because
/// the underlying store may transiently fail under concurrent access from
/// another agent process.
#[derive(Clone)]
pub struct SessionRegistry {
    store: StateStore,
    retry: RetryConfig,
    transition_hook: Option<TransitionHook>,
}

impl SessionRegistry {
    /// Create a registry over the given store
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            retry: RetryConfig::default(),
            transition_hook: None,
        }
    }

    /// Override the retry policy (tests use millisecond backoffs)
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Install a hook observing accepted status transitions
    pub fn with_transition_hook(mut self, hook: TransitionHook) -> Self {
        self.transition_hook = Some(hook);
        self
    }

    /// Create a session (idempotent: an existing session is returned as-is)
    pub fn create(&self, agent_id: &str) -> Result<AgentSession> {
        if let Some(existing) = self.read(agent_id)? {
            debug!(agent_id, "Session already exists");
            return Ok(existing);
        }
        let session = AgentSession::new(agent_id);
        with_retry(&self.retry, "session.create", || {
            self.store.put(Namespace::Sessions, agent_id, &session)
        })?;
        info!(agent_id, "Session created");
        Ok(session)
    }

    /// Read a session; `None` if the agent has never been created
    pub fn read(&self, agent_id: &str) -> Result<Option<AgentSession>> {
        self.store.get(Namespace::Sessions, agent_id)
    }

    /// Read a session, failing with `NotFound` if absent
    pub fn get(&self, agent_id: &str) -> Result<AgentSession> {
        self.read(agent_id)?
            .ok_or_else(|| MusterError::NotFound(format!("session '{}'", agent_id)))
    }

    /// Merge a partial update into an existing session
    ///
    /// Always refreshes `last_heartbeat`. Status changes are validated
    /// against the state machine and reported through the transition hook.
    pub fn update(&self, agent_id: &str, update: SessionUpdate) -> Result<AgentSession> {
        let mut session = self.get(agent_id)?;
        let from = session.status;

        if let Some(to) = update.status {
            if !from.can_transition_to(to) {
                return Err(MusterError::InvalidTransition {
                    agent_id: agent_id.to_string(),
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
            session.status = to;
        }

        if let Some(project) = update.current_project {
            session.current_project = Some(project);
        }
        if let Some(phase) = update.current_phase {
            session.current_phase = Some(phase);
        }
        if let Some(branch) = update.branch_name {
            session.branch_name = Some(branch);
        }
        if let Some(task) = update.current_task {
            session.current_task = Some(task);
        }
        if update.clear_assignment {
            session.current_project = None;
            session.current_phase = None;
            session.branch_name = None;
            session.current_task = None;
        }
        session.tasks_completed += update.tasks_completed_delta;
        if let Some(error) = update.error {
            session.error_count += 1;
            session.last_error = Some(error);
        }
        session.last_heartbeat = Utc::now();

        with_retry(&self.retry, "session.update", || {
            self.store.put(Namespace::Sessions, agent_id, &session)
        })?;

        if let Some(to) = update.status {
            if from != to {
                debug!(agent_id, %from, %to, "Session status changed");
                if let Some(hook) = &self.transition_hook {
                    hook(agent_id, from, to, session.current_project);
                }
            }
        }

        Ok(session)
    }

    /// Delete a session record
    pub fn delete(&self, agent_id: &str) -> Result<()> {
        with_retry(&self.retry, "session.delete", || {
            self.store.delete(Namespace::Sessions, agent_id)
        })
    }

    /// List all sessions, sorted by agent id
    pub fn list(&self) -> Result<Vec<AgentSession>> {
        let mut sessions = Vec::new();
        for key in self.store.list_keys(Namespace::Sessions)? {
            if let Some(session) = self.read(&key)? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }
}
