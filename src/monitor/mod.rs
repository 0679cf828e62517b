//! Loop health monitor
//!
//! Cross-cutting observer over sessions, queues, and category usage.
//! Records agent state transitions, reconstructs cycle times, flags stuck
//! agents (with a durable report), derives queue-depth throttling signals,
//! and rolls everything into one health snapshot.

pub mod metrics;

use crate::config::MusterConfig;
use crate::conflict::ClaimLedger;
use crate::review::ReviewQueue;
use crate::scheduler::CategoryScheduler;
use crate::session::{AgentStatus, SessionRegistry, TransitionHook};
use crate::store::{Namespace, StateStore};
use crate::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// One recorded status transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub agent_id: String,
    pub from: AgentStatus,
    pub to: AgentStatus,
    pub at: DateTime<Utc>,
    pub project: Option<u64>,
}

/// Per-agent transition log document (ring-buffer trimmed on write)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TransitionDoc {
    entries: Vec<StateTransition>,
}

/// Cycle-time metrics for one agent
///
/// A cycle is the span between consecutive entries into `working`. Paused
/// dwell time inside that span counts: the log is wall-clock ordered and
/// the metric should agree with what an operator observes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleTimeReport {
    pub last_cycle: Option<ChronoDuration>,
    pub average_cycle: Option<ChronoDuration>,
    pub cycles_completed: usize,
}

/// One stuck agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StuckAgent {
    pub agent_id: String,
    pub status: AgentStatus,
    /// How long since the last heartbeat
    pub stuck_for_secs: i64,
    pub last_heartbeat: DateTime<Utc>,
}

/// Durable snapshot of the last stuck-agent detection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StuckReport {
    pub detected_at: Option<DateTime<Utc>>,
    pub agents: Vec<StuckAgent>,
}

/// Queue depth snapshot
#[derive(Debug, Clone, Serialize)]
pub struct QueueDepth {
    /// Issues claimed by agents (project work in flight)
    pub in_flight: usize,
    /// Pending plus in-review items in the review queue
    pub review_backlog: usize,
}

/// Category coverage over the rolling window
#[derive(Debug, Clone, Serialize)]
pub struct CategoryCoverage {
    pub used: Vec<String>,
    pub unused: Vec<String>,
    pub coverage_percent: f64,
}

/// Combined health snapshot
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub checked_at: DateTime<Utc>,
    pub stuck_agents: Vec<StuckAgent>,
    pub queue: QueueDepth,
    pub average_cycle_secs: Option<i64>,
    pub coverage: CategoryCoverage,
    pub recommendations: Vec<String>,
}

const STUCK_REPORT_KEY: &str = "stuck";

/// Cross-cutting health observer
#[derive(Clone)]
pub struct LoopHealthMonitor {
    store: StateStore,
    registry: SessionRegistry,
    reviews: ReviewQueue,
    claims: ClaimLedger,
    scheduler: CategoryScheduler,
    config: MusterConfig,
}

impl LoopHealthMonitor {
    pub fn new(
        store: StateStore,
        registry: SessionRegistry,
        reviews: ReviewQueue,
        claims: ClaimLedger,
        scheduler: CategoryScheduler,
        config: MusterConfig,
    ) -> Self {
        Self {
            store,
            registry,
            reviews,
            claims,
            scheduler,
            config,
        }
    }

    /// Append a transition to the agent's log, trimming to the cap
    pub fn log_transition(
        &self,
        agent_id: &str,
        from: AgentStatus,
        to: AgentStatus,
        project: Option<u64>,
    ) -> Result<()> {
        let cap = self.config.transition_log_cap;
        let entry = StateTransition {
            agent_id: agent_id.to_string(),
            from,
            to,
            at: Utc::now(),
            project,
        };
        self.store
            .update(Namespace::Transitions, agent_id, |doc: &mut TransitionDoc| {
                doc.entries.push(entry.clone());
                if doc.entries.len() > cap {
                    let excess = doc.entries.len() - cap;
                    doc.entries.drain(..excess);
                }
                Ok(())
            })?;
        debug!(agent_id, %from, %to, "Transition logged");
        Ok(())
    }

    /// A hook suitable for [`SessionRegistry::with_transition_hook`]
    ///
    /// Transition logging is best-effort from the registry's point of view:
    /// a log write failure must not fail the session update.
    pub fn transition_hook(&self) -> TransitionHook {
        let monitor = self.clone();
        Arc::new(move |agent_id, from, to, project| {
            if let Err(e) = monitor.log_transition(agent_id, from, to, project) {
                warn!(agent_id, error = %e, "Failed to record transition");
            }
        })
    }

    /// The transition log for one agent, oldest first
    pub fn transitions(&self, agent_id: &str) -> Result<Vec<StateTransition>> {
        let doc: TransitionDoc = self.store.get_or_heal(Namespace::Transitions, agent_id)?;
        Ok(doc.entries)
    }

    /// Reconstruct cycle times from the transition log
    pub fn cycle_time(&self, agent_id: &str) -> Result<CycleTimeReport> {
        let entries = self.transitions(agent_id)?;

        let work_starts: Vec<DateTime<Utc>> = entries
            .iter()
            .filter(|t| t.to == AgentStatus::Working)
            .map(|t| t.at)
            .collect();

        let cycles: Vec<ChronoDuration> = work_starts
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .collect();

        if cycles.is_empty() {
            return Ok(CycleTimeReport::default());
        }

        let total: ChronoDuration = cycles
            .iter()
            .fold(ChronoDuration::zero(), |acc, d| acc + *d);
        Ok(CycleTimeReport {
            last_cycle: cycles.last().copied(),
            average_cycle: Some(total / cycles.len() as i32),
            cycles_completed: cycles.len(),
        })
    }

    /// Agents whose heartbeat is older than the stuck threshold
    ///
    /// Always persists a durable report so an operator who missed the live
    /// alert can still discover the condition later.
    pub fn detect_stuck_agents(&self) -> Result<Vec<StuckAgent>> {
        let threshold = ChronoDuration::from_std(self.config.stuck_threshold())
            .unwrap_or(ChronoDuration::MAX);
        let now = Utc::now();

        let stuck: Vec<StuckAgent> = self
            .registry
            .list()?
            .into_iter()
            .filter(|s| now - s.last_heartbeat > threshold)
            .map(|s| StuckAgent {
                agent_id: s.agent_id.clone(),
                status: s.status,
                stuck_for_secs: (now - s.last_heartbeat).num_seconds(),
                last_heartbeat: s.last_heartbeat,
            })
            .collect();

        let report = StuckReport {
            detected_at: Some(now),
            agents: stuck.clone(),
        };
        self.store
            .put(Namespace::Health, STUCK_REPORT_KEY, &report)?;

        if !stuck.is_empty() {
            warn!(count = stuck.len(), "Stuck agents detected");
        }
        metrics::set_stuck_agents(stuck.len() as i64);
        Ok(stuck)
    }

    /// The last persisted stuck-agent report
    pub fn last_stuck_report(&self) -> Result<StuckReport> {
        self.store.get_or_heal(Namespace::Health, STUCK_REPORT_KEY)
    }

    /// Current queue depth
    pub fn queue_depth(&self) -> Result<QueueDepth> {
        let depth = QueueDepth {
            in_flight: self.claims.claimed_count()?,
            review_backlog: self.reviews.backlog_len()?,
        };
        metrics::set_in_flight(depth.in_flight as i64);
        metrics::set_review_backlog(depth.review_backlog as i64);
        Ok(depth)
    }

    /// True when the project queue is running dry and ideation should be
    /// triggered
    pub fn should_prioritize_ideation(&self) -> Result<bool> {
        Ok(self.queue_depth()?.in_flight < self.config.queue_low_watermark)
    }

    /// True when enough work is in flight that ideation should pause
    pub fn should_pause_ideation(&self) -> Result<bool> {
        Ok(self.queue_depth()?.in_flight > self.config.queue_high_watermark)
    }

    /// Which categories were used within the rolling coverage window
    pub fn category_coverage(&self) -> Result<CategoryCoverage> {
        let window = ChronoDuration::from_std(self.config.coverage_window())
            .unwrap_or(ChronoDuration::MAX);
        let used = self.scheduler.used_since(Utc::now() - window)?;
        let enabled = self.scheduler.enabled();

        let unused: Vec<String> = enabled
            .iter()
            .filter(|c| !used.contains(c))
            .cloned()
            .collect();
        let coverage_percent = if enabled.is_empty() {
            100.0
        } else {
            used.len() as f64 / enabled.len() as f64 * 100.0
        };

        Ok(CategoryCoverage {
            used,
            unused,
            coverage_percent,
        })
    }

    /// Combine every signal into one health snapshot
    pub fn validate_health(&self) -> Result<HealthReport> {
        let stuck_agents = self.detect_stuck_agents()?;
        let queue = self.queue_depth()?;
        let coverage = self.category_coverage()?;

        // Fleet-wide average cycle time across agents with completed cycles
        let mut cycle_secs = Vec::new();
        for session in self.registry.list()? {
            if let Some(avg) = self.cycle_time(&session.agent_id)?.average_cycle {
                cycle_secs.push(avg.num_seconds());
            }
        }
        let average_cycle_secs = if cycle_secs.is_empty() {
            None
        } else {
            Some(cycle_secs.iter().sum::<i64>() / cycle_secs.len() as i64)
        };

        let mut recommendations = Vec::new();
        if !stuck_agents.is_empty() {
            recommendations.push(format!(
                "{} agent(s) stuck without a heartbeat; investigate or restart them",
                stuck_agents.len()
            ));
        }
        if queue.in_flight < self.config.queue_low_watermark {
            recommendations.push(format!(
                "project queue depth is low ({}); prioritize ideation",
                queue.in_flight
            ));
        }
        if queue.in_flight > self.config.queue_high_watermark {
            recommendations.push(format!(
                "project queue depth is high ({}); pause ideation",
                queue.in_flight
            ));
        }
        let cycle_target = self.config.cycle_time_target().as_secs() as i64;
        let cycle_ok = average_cycle_secs.map_or(true, |avg| avg <= cycle_target);
        if !cycle_ok {
            recommendations.push(format!(
                "average cycle time {}s exceeds the {}s target",
                average_cycle_secs.unwrap_or(0),
                cycle_target
            ));
        }
        if coverage.coverage_percent < 80.0 {
            recommendations.push(format!(
                "category coverage {:.0}% is below 80%; {} categories untouched this window",
                coverage.coverage_percent,
                coverage.unused.len()
            ));
        }

        // Both watermarks gate health: a starved queue is as unhealthy as a
        // flooded one, it just asks for the opposite intervention.
        let depth_ok = queue.in_flight >= self.config.queue_low_watermark
            && queue.in_flight <= self.config.queue_high_watermark;
        let healthy = stuck_agents.is_empty() && depth_ok && cycle_ok;
        metrics::set_health_status(healthy);

        Ok(HealthReport {
            healthy,
            checked_at: Utc::now(),
            stuck_agents,
            queue,
            average_cycle_secs,
            coverage,
            recommendations,
        })
    }
}
