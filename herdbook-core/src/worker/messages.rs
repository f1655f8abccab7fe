//! Messages exchanged between the application and the worker.

use serde::{Deserialize, Serialize};

use super::queue::SyncSummary;

/// Application to worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerCommand {
    /// Fetch and cache these URLs in the background
    CacheDynamicRoutes { urls: Vec<String> },
    /// Activate an installed worker without waiting
    SkipWaiting,
}

/// Worker to every connected application instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    SyncStarted { pending: usize },
    SyncComplete(SyncSummary),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_wire_format() {
        let cmd: WorkerCommand = serde_json::from_value(json!({
            "type": "CACHE_DYNAMIC_ROUTES",
            "urls": ["/animals/1", "/animals/2"]
        }))
        .unwrap();
        assert_eq!(
            cmd,
            WorkerCommand::CacheDynamicRoutes {
                urls: vec!["/animals/1".into(), "/animals/2".into()]
            }
        );

        let cmd: WorkerCommand = serde_json::from_str(r#"{"type":"SKIP_WAITING"}"#).unwrap();
        assert_eq!(cmd, WorkerCommand::SkipWaiting);
    }

    #[test]
    fn test_client_message_wire_format() {
        let started = serde_json::to_value(ClientMessage::SyncStarted { pending: 3 }).unwrap();
        assert_eq!(started, json!({"type": "SYNC_STARTED", "data": {"pending": 3}}));

        let complete = serde_json::to_value(ClientMessage::SyncComplete(SyncSummary {
            synced: 2,
            failed: 1,
            remaining: 1,
        }))
        .unwrap();
        assert_eq!(
            complete,
            json!({"type": "SYNC_COMPLETE", "data": {"synced": 2, "failed": 1, "remaining": 1}})
        );
    }
}
