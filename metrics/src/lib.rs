use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_int_gauge_vec, CounterVec, Encoder, IntGaugeVec, TextEncoder,
};

/// Metric category for everything the task queue emits.
const CATEGORY_TASKS: &str = "tasks";

lazy_static! {
    // Task lifecycle metrics
    pub static ref TASKS_COMPLETED: CounterVec = register_counter_vec!(
        "mojo_tasks_completed",
        "the number of tasks that finished successfully",
        &["category", "channel"]
    )
    .unwrap();

    pub static ref TASKS_FAILED: CounterVec = register_counter_vec!(
        "mojo_tasks_failed",
        "the number of tasks that ended in the error queue",
        &["category", "channel"]
    )
    .unwrap();

    pub static ref TASKS_IN_FLIGHT: IntGaugeVec = register_int_gauge_vec!(
        "mojo_tasks_in_flight",
        "the number of tasks currently executing on this runner",
        &["channel"]
    )
    .unwrap();
}

pub fn inc_tasks_completed(channel: &str) {
    TASKS_COMPLETED
        .with_label_values(&[CATEGORY_TASKS, channel])
        .inc();
}

pub fn inc_tasks_failed(channel: &str) {
    TASKS_FAILED
        .with_label_values(&[CATEGORY_TASKS, channel])
        .inc();
}

pub fn inc_tasks_in_flight(channel: &str) {
    TASKS_IN_FLIGHT.with_label_values(&[channel]).inc();
}

pub fn dec_tasks_in_flight(channel: &str) {
    TASKS_IN_FLIGHT.with_label_values(&[channel]).dec();
}

pub fn tasks_completed_count(channel: &str) -> f64 {
    TASKS_COMPLETED
        .with_label_values(&[CATEGORY_TASKS, channel])
        .get()
}

pub fn tasks_failed_count(channel: &str) -> f64 {
    TASKS_FAILED
        .with_label_values(&[CATEGORY_TASKS, channel])
        .get()
}

/// Render the default registry in the Prometheus text exposition format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    if encoder
        .encode(&prometheus::gather(), &mut buffer)
        .is_err()
    {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
