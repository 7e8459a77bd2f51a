use crate::impl_display_using_json;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Queue depths of a single channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub errors: usize,
}

/// Fleet-wide aggregate over every known channel (or the local subset),
/// intended for an operator status endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub errors: usize,
    /// Runners with a fresh heartbeat.
    pub runners: usize,
    /// Per-channel breakdown; omitted in simple mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<BTreeMap<String, ChannelStatus>>,
}

impl QueueStatus {
    pub fn accumulate(&mut self, status: &ChannelStatus) {
        self.pending += status.pending;
        self.running += status.running;
        self.completed += status.completed;
        self.errors += status.errors;
    }
}

impl_display_using_json!(ChannelStatus);
impl_display_using_json!(QueueStatus);
