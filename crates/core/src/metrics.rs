// crates/core/src/metrics.rs
//! Metric names and recording helpers. Recording is a no-op until a
//! recorder is installed (the server installs the Prometheus one).

use metrics::{counter, describe_counter, describe_gauge, gauge};

use crate::job::JobStatus;
use crate::manager::ManagerStats;

pub const JOBS_SUBMITTED_TOTAL: &str = "mediaq_jobs_submitted_total";
pub const JOBS_FINISHED_TOTAL: &str = "mediaq_jobs_finished_total";
pub const JOBS_RUNNING: &str = "mediaq_jobs_running";
pub const JOBS_WAITING: &str = "mediaq_jobs_waiting";
pub const HUB_EVENTS_TOTAL: &str = "mediaq_hub_events_total";

/// Register descriptions for every core metric.
pub fn describe_metrics() {
    describe_counter!(JOBS_SUBMITTED_TOTAL, "Jobs accepted for scheduling");
    describe_counter!(
        JOBS_FINISHED_TOTAL,
        "Jobs that reached a terminal status, labeled by status"
    );
    describe_gauge!(JOBS_RUNNING, "Jobs currently running");
    describe_gauge!(JOBS_WAITING, "Jobs waiting in the queue");
    describe_counter!(HUB_EVENTS_TOTAL, "Events pushed through the broadcast hub");
}

pub fn record_submitted() {
    counter!(JOBS_SUBMITTED_TOTAL).increment(1);
}

pub fn record_finished(status: JobStatus) {
    counter!(JOBS_FINISHED_TOTAL, "status" => status.as_str()).increment(1);
}

pub fn record_queue(stats: ManagerStats) {
    gauge!(JOBS_RUNNING).set(stats.running as f64);
    gauge!(JOBS_WAITING).set(stats.waiting as f64);
}
