//! Supervisor ↔ worker wire protocol.
//!
//! Newline-delimited JSON over the worker's stdio: reports travel up on
//! stdout, commands travel down on stdin. Worker logs go to stderr so
//! they never corrupt the protocol stream.

use serde::{Deserialize, Serialize};

/// Worker → supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WorkerReport {
    /// The listener is live and the worker is serving.
    Ready { pid: u32 },
    /// Startup failed; the worker is about to exit non-zero.
    Error { error: String },
}

/// Supervisor → worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum SupervisorCommand {
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_report_wire_shapes() {
        assert_eq!(
            serde_json::to_value(WorkerReport::Ready { pid: 42 }).unwrap(),
            json!({"status": "ready", "pid": 42})
        );
        assert_eq!(
            serde_json::to_value(WorkerReport::Error {
                error: "bind failed".into()
            })
            .unwrap(),
            json!({"status": "error", "error": "bind failed"})
        );
        assert_eq!(
            serde_json::to_value(SupervisorCommand::Shutdown).unwrap(),
            json!({"command": "shutdown"})
        );
    }

    #[test]
    fn test_command_round_trip() {
        let parsed: SupervisorCommand =
            serde_json::from_str(r#"{"command":"shutdown"}"#).unwrap();
        assert_eq!(parsed, SupervisorCommand::Shutdown);
    }
}
