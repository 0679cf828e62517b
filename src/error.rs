//! Error types for Muster
//!
//! Defines a comprehensive error enum covering all failure modes across the system.
//! Uses thiserror for ergonomic error handling.

use crate::retry::{RetryDecision, RetryableError};
use thiserror::Error;

/// Result type alias for Muster operations
pub type Result<T> = std::result::Result<T, MusterError>;

/// Comprehensive error type for Muster operations
#[derive(Error, Debug)]
pub enum MusterError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage errors (the durable state store)
    #[error("Storage error: {0}")]
    Storage(String),

    /// A record exists on disk but could not be parsed and its namespace
    /// does not allow self-healing
    #[error("Corrupt state for '{key}' in namespace '{namespace}': {detail}")]
    CorruptState {
        namespace: String,
        key: String,
        detail: String,
    },

    /// Entity not found (session, review, conflict, category)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Claim race lost: the item was already claimed and the claim has not expired
    #[error("Already claimed: {id} by {claimed_by}")]
    AlreadyClaimed { id: String, claimed_by: String },

    /// A session status change that the state machine does not allow
    #[error("Invalid status transition for '{agent_id}': {from} -> {to}")]
    InvalidTransition {
        agent_id: String,
        from: String,
        to: String,
    },

    /// Failed to start a worker process
    #[error("Spawn error for '{agent_id}': {detail}")]
    Spawn { agent_id: String, detail: String },

    /// An operation or claim exceeded its staleness bound
    #[error("Timeout: {0}")]
    Timeout(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing errors (config files)
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl RetryableError for MusterError {
    fn retry_decision(&self) -> RetryDecision {
        match self {
            // The store may transiently fail under concurrent access from
            // another agent process; these are worth retrying.
            MusterError::Storage(_) => RetryDecision::Retry,
            MusterError::Io(_) => RetryDecision::Retry,

            // Logical errors: the caller decides, never auto-retry.
            MusterError::NotFound(_) => RetryDecision::NoRetry,
            MusterError::AlreadyClaimed { .. } => RetryDecision::NoRetry,
            MusterError::InvalidTransition { .. } => RetryDecision::NoRetry,
            MusterError::CorruptState { .. } => RetryDecision::NoRetry,
            MusterError::Spawn { .. } => RetryDecision::NoRetry,
            MusterError::Timeout(_) => RetryDecision::NoRetry,
            MusterError::Config(_) => RetryDecision::NoRetry,
            MusterError::Json(_) => RetryDecision::NoRetry,
            MusterError::Toml(_) => RetryDecision::NoRetry,
            MusterError::Other(_) => RetryDecision::NoRetry,
        }
    }
}
