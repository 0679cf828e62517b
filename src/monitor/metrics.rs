//! Prometheus metrics for the coordination loop
//!
//! Provides observability metrics for monitoring the agent fleet in production.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, CounterVec, Encoder, Gauge, TextEncoder,
};

lazy_static! {
    /// Gauge: pending plus in-review items in the review queue
    pub static ref REVIEW_BACKLOG: Gauge = register_gauge!(
        "muster_review_backlog",
        "Pending plus in-review items in the review queue"
    )
    .expect("Failed to create review_backlog metric");

    /// Gauge: issues currently claimed by agents
    pub static ref IN_FLIGHT: Gauge = register_gauge!(
        "muster_in_flight_issues",
        "Issues currently claimed by agents"
    )
    .expect("Failed to create in_flight_issues metric");

    /// Gauge: agents whose heartbeat exceeded the stuck threshold
    pub static ref STUCK_AGENTS: Gauge = register_gauge!(
        "muster_stuck_agents",
        "Agents without a heartbeat past the stuck threshold"
    )
    .expect("Failed to create stuck_agents metric");

    /// Gauge: loop health status (1 = healthy, 0 = unhealthy)
    pub static ref HEALTH_STATUS: Gauge = register_gauge!(
        "muster_health_status",
        "Loop health status (1 = healthy, 0 = unhealthy)"
    )
    .expect("Failed to create health_status metric");

    /// Counter: review escalations by outcome
    pub static ref ESCALATIONS: CounterVec = register_counter_vec!(
        "muster_escalations_total",
        "Work items escalated to a human by reason",
        &["reason"]
    )
    .expect("Failed to create escalations metric");

    /// Counter: worker crashes observed by the reaper
    pub static ref WORKER_CRASHES: CounterVec = register_counter_vec!(
        "muster_worker_crashes_total",
        "Worker processes that exited unexpectedly",
        &["agent_id"]
    )
    .expect("Failed to create worker_crashes metric");
}

/// Set the review backlog depth
pub fn set_review_backlog(depth: i64) {
    REVIEW_BACKLOG.set(depth as f64);
}

/// Set the in-flight issue count
pub fn set_in_flight(count: i64) {
    IN_FLIGHT.set(count as f64);
}

/// Set the stuck agent count
pub fn set_stuck_agents(count: i64) {
    STUCK_AGENTS.set(count as f64);
}

/// Set health status
pub fn set_health_status(healthy: bool) {
    HEALTH_STATUS.set(if healthy { 1.0 } else { 0.0 });
}

/// Record an escalation
pub fn record_escalation(reason: &str) {
    ESCALATIONS.with_label_values(&[reason]).inc();
}

/// Record a worker crash
pub fn record_worker_crash(agent_id: &str) {
    WORKER_CRASHES.with_label_values(&[agent_id]).inc();
}

/// Encode all metrics as Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
