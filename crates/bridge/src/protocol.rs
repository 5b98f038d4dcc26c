//! Bridge wire protocol: JSON-framed application messages exchanged with
//! the policy server over the persistent duplex socket.
//!
//! Parsing is strict JSON. Unknown message kinds are surfaced as
//! [`ServerMessage::Unknown`] so the transport can log and drop them
//! without breaking the stream.

use serde::Serialize;
use serde_json::Value;
use tabpilot_core::{Action, Error, Observation, Result};

/// Controller → server messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    StartSession {
        goal: String,
        model: String,
    },
    StopSession {
        session_id: String,
    },
    Observation {
        session_id: String,
        step_number: u32,
        #[serde(flatten)]
        observation: Box<Observation>,
    },
    Ping,
}

impl ClientMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Server → controller messages.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    /// Session status update; assigns the session id on first receipt.
    Status {
        session_id: String,
        status: String,
        message: String,
    },
    /// One policy step, fields flat alongside `type`.
    Action(Action),
    Error {
        error: String,
    },
    Pong,
    /// Server-initiated session (e.g. CLI-triggered on the server side).
    StartAutomation {
        goal: String,
        session_id: String,
        max_steps: Option<u32>,
    },
    /// Host-reload request.
    ReloadExtension,
    /// Anything we do not recognize; log and ignore.
    Unknown(String),
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::Transport(format!("malformed bridge frame: {}", e)))?;
        let kind = value
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Transport("bridge frame without type".to_string()))?;

        let get_str = |key: &str| -> String {
            value
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };

        Ok(match kind {
            "status" => Self::Status {
                session_id: get_str("session_id"),
                status: get_str("status"),
                message: get_str("message"),
            },
            "action" => Self::Action(Action::from_value(&value)),
            "error" => Self::Error {
                error: get_str("error"),
            },
            "pong" => Self::Pong,
            "start_automation" => Self::StartAutomation {
                goal: get_str("goal"),
                session_id: get_str("session_id"),
                max_steps: value
                    .get("max_steps")
                    .and_then(|v| v.as_u64())
                    .map(|v| v as u32),
            },
            "reload_extension" => Self::ReloadExtension,
            other => Self::Unknown(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_wire_shape() {
        let msg = ClientMessage::StartSession {
            goal: "find the docs".to_string(),
            model: "test-model".to_string(),
        };
        let v: Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(v["type"], "start_session");
        assert_eq!(v["goal"], "find the docs");

        let v: Value = serde_json::from_str(&ClientMessage::Ping.to_json()).unwrap();
        assert_eq!(v["type"], "ping");
    }

    #[test]
    fn test_observation_fields_flatten() {
        let msg = ClientMessage::Observation {
            session_id: "s1".to_string(),
            step_number: 3,
            observation: Box::new(Observation {
                task: "goal".to_string(),
                url: "https://example.test/".to_string(),
                title: "Example".to_string(),
                screenshot: String::new(),
                elements: vec![],
                console_logs: vec![],
                action_history: vec![],
                progress_notes: String::new(),
                original_goal: "goal".to_string(),
                last_action_error: String::new(),
            }),
        };
        let v: Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(v["type"], "observation");
        assert_eq!(v["step_number"], 3);
        // Flattened, not nested.
        assert_eq!(v["url"], "https://example.test/");
        assert!(v.get("observation").is_none());
    }

    #[test]
    fn test_parse_action() {
        let msg =
            ServerMessage::parse(r##"{"type":"action","action":"click","selector":"#go","thought":"pressing go"}"##)
                .unwrap();
        match msg {
            ServerMessage::Action(action) => {
                assert_eq!(action.kind, "click");
                assert_eq!(action.selector.as_deref(), Some("#go"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_status_and_start_automation() {
        let msg = ServerMessage::parse(
            r#"{"type":"status","session_id":"abc","status":"running","message":"ok"}"#,
        )
        .unwrap();
        assert!(matches!(msg, ServerMessage::Status { ref session_id, .. } if session_id == "abc"));

        let msg = ServerMessage::parse(
            r#"{"type":"start_automation","goal":"buy milk","session_id":"xyz","max_steps":30}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::StartAutomation {
                goal, max_steps, ..
            } => {
                assert_eq!(goal, "buy milk");
                assert_eq!(max_steps, Some(30));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_unknown_kind() {
        let msg = ServerMessage::parse(r#"{"type":"telemetry","data":1}"#).unwrap();
        assert!(matches!(msg, ServerMessage::Unknown(ref k) if k == "telemetry"));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(ServerMessage::parse("not json").is_err());
        assert!(ServerMessage::parse(r#"{"no_type":1}"#).is_err());
    }
}
