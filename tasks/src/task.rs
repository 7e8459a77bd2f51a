use crate::impl_display_using_json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Current wall-clock time in Unix seconds. Every persisted timestamp in the
/// system uses this resolution.
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Error,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses never transition again; the record is immutable
    /// once it carries one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Error => write!(f, "error"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// The single serialized unit describing a task and its lifecycle state,
/// stored under `{prefix}:t:{id}`.
///
/// The record is created by a publisher, mutated only by the runner that
/// owns it, and immutable once in a terminal queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Opaque unique identifier. Immutable.
    pub id: String,
    /// Dotted name of the callable, resolved at the runner.
    pub function: String,
    /// Structured payload. By convention a mapping with `args` and `kwargs`,
    /// otherwise opaque JSON preserved verbatim.
    #[serde(default)]
    pub data: Value,
    pub channel: String,
    pub status: TaskStatus,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    /// Unix seconds after which runners must refuse to start the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Hostname of the runner that last owned the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner: Option<String>,
}

impl Task {
    pub fn new(function: impl Into<String>, data: Value, channel: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            function: function.into(),
            data,
            channel: channel.into(),
            status: TaskStatus::Pending,
            created_at: unix_now(),
            started_at: None,
            completed_at: None,
            expires: None,
            error: None,
            runner: None,
        }
    }

    /// Positional arguments from the conventional payload shape; empty when
    /// the payload has none.
    pub fn args(&self) -> Vec<Value> {
        self.data
            .get("args")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }

    /// Keyed arguments from the conventional payload shape; empty when the
    /// payload has none.
    pub fn kwargs(&self) -> Map<String, Value> {
        self.data
            .get("kwargs")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires.is_some_and(|expires| expires < now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Active,
    Draining,
    /// Assigned by observers when the last ping is older than the liveness
    /// threshold; a runner never writes this about itself.
    Timeout,
}

impl std::fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerStatus::Active => write!(f, "active"),
            RunnerStatus::Draining => write!(f, "draining"),
            RunnerStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// Identity and load of one runner, kept as a field of the `runners` hash
/// and refreshed by its heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerDescriptor {
    pub hostname: String,
    pub status: RunnerStatus,
    pub started_at: i64,
    pub last_ping: i64,
    pub max_workers: usize,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub uptime: i64,
    #[serde(default)]
    pub active_threads: usize,
    /// Seconds since `last_ping`, computed by the reader; never persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_age: Option<u64>,
}

impl_display_using_json!(Task);
impl_display_using_json!(RunnerDescriptor);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_round_trip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Error,
            TaskStatus::Cancelled,
        ] {
            let encoded = serde_json::to_string(&status).unwrap();
            assert_eq!(encoded, format!("\"{status}\""));
            let decoded: TaskStatus = serde_json::from_str(&encoded).unwrap();
            assert_eq!(decoded, status);
        }
    }

    #[test]
    fn test_args_kwargs_defaults() {
        let task = Task::new("jobs.reindex", json!({"payload": 42}), "default");
        assert!(task.args().is_empty());
        assert!(task.kwargs().is_empty());

        let task = Task::new(
            "jobs.reindex",
            json!({"args": [1, "two"], "kwargs": {"depth": 3}}),
            "default",
        );
        assert_eq!(task.args(), vec![json!(1), json!("two")]);
        assert_eq!(task.kwargs().get("depth"), Some(&json!(3)));
    }

    #[test]
    fn test_expiry_check() {
        let mut task = Task::new("jobs.reindex", Value::Null, "default");
        assert!(!task.is_expired(unix_now()));
        task.expires = Some(unix_now() - 10);
        assert!(task.is_expired(unix_now()));
    }
}
