//! Muster - Coordination Layer for Autonomous Agent Fleets
//!
//! Muster is the orchestration core for a fleet of worker agents sharing one
//! host. It keeps every agent's state in a durable file-backed store so the
//! fleet survives restarts, routes completed work through a claim-based
//! review queue, bounds the rework loop with escalation to a human, and
//! watches the whole loop's health.
//!
//! # Architecture
//!
//! - **store**: Durable file-per-record state store (atomic writes, corruption healing)
//! - **config**: Thresholds, watermarks, and categories (~/.config/muster/config.toml)
//! - **session**: Agent session records and the status state machine
//! - **lifecycle**: Worker process control (start/pause/resume/stop/reap)
//! - **review**: Claim-based review queue with stale-claim reclaim
//! - **refinement**: Bounded execute->review->reject loop with escalation
//! - **conflict**: Manual-intervention queue for merge conflicts, claim ledger
//! - **scheduler**: LRU ideation category selection with exhaustion tracking
//! - **monitor**: Transition logs, stuck detection, queue-depth signals, health

// Core modules
pub mod config;
pub mod error;
pub mod logging;
pub mod retry;
pub mod store;

// Components
pub mod conflict;
pub mod lifecycle;
pub mod monitor;
pub mod refinement;
pub mod review;
pub mod scheduler;
pub mod session;

// Re-exports
pub use error::{MusterError, Result};
