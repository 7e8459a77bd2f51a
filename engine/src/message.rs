use mojo_tasks::RunnerDescriptor;
use serde::{Deserialize, Serialize};

/// Control messages exchanged between runners over the per-runner and
/// broadcast topics. Anything on a task topic that does not parse as one of
/// these is treated as a raw task id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Ping {
        from: String,
        timestamp: i64,
    },
    PingResponse {
        from: String,
        to: String,
        timestamp: i64,
        status: RunnerDescriptor,
    },
}

impl ControlMessage {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        serde_json::from_slice(payload).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_id_is_not_a_control_message() {
        assert_eq!(
            ControlMessage::parse(b"8c5f9a2e-0a67-4c1d-9be4-000000000000"),
            None
        );
        assert_eq!(ControlMessage::parse(b"{\"type\": \"unknown\"}"), None);
    }

    #[test]
    fn test_ping_round_trip() {
        let ping = ControlMessage::Ping {
            from: "host-a".into(),
            timestamp: 1700000000,
        };
        let encoded = serde_json::to_vec(&ping).unwrap();
        assert!(String::from_utf8_lossy(&encoded).contains("\"type\":\"ping\""));
        assert_eq!(ControlMessage::parse(&encoded), Some(ping));
    }
}
