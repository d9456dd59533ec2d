// ABOUTME: JSON envelope exchanged with real-time clients
// ABOUTME: Message types for logs, terminal I/O, sandbox status, subscriptions and keepalive

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::demux::LogEntry;
use crate::storage::SandboxStatus;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Log,
    LogSubscribe,
    LogUnsubscribe,
    TerminalInput,
    TerminalOutput,
    TerminalResize,
    SandboxStatus,
    SandboxSubscribe,
    SandboxUnsubscribe,
    Ping,
    Pong,
    Error,
}

/// `{type, payload, timestamp}` envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub payload: JsonValue,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxTarget {
    pub sandbox_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TerminalInput {
    pub session_id: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TerminalResize {
    pub session_id: String,
    pub cols: u16,
    pub rows: u16,
}

impl Envelope {
    pub fn new(message_type: MessageType, payload: JsonValue) -> Self {
        Self {
            message_type,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn log(sandbox_id: &str, entry: &LogEntry) -> Self {
        Self::new(
            MessageType::Log,
            json!({
                "sandboxId": sandbox_id,
                "stream": entry.stream,
                "message": entry.message,
                "timestamp": entry.timestamp,
            }),
        )
    }

    pub fn sandbox_status(
        sandbox_id: &str,
        status: SandboxStatus,
        error_message: Option<&str>,
    ) -> Self {
        Self::new(
            MessageType::SandboxStatus,
            json!({
                "sandboxId": sandbox_id,
                "status": status,
                "errorMessage": error_message,
            }),
        )
    }

    pub fn terminal_output(session_id: &str, data: &str) -> Self {
        Self::new(
            MessageType::TerminalOutput,
            json!({ "sessionId": session_id, "data": data }),
        )
    }

    pub fn pong() -> Self {
        Self::new(MessageType::Pong, JsonValue::Null)
    }

    pub fn ping() -> Self {
        Self::new(MessageType::Ping, JsonValue::Null)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(MessageType::Error, json!({ "message": message.into() }))
    }

    /// Decode the payload into a typed message body
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::LogStream;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_type_names_are_kebab_case() {
        let json = Envelope::new(MessageType::SandboxSubscribe, JsonValue::Null)
            .to_json()
            .unwrap();
        assert!(json.contains(r#""type":"sandbox-subscribe""#), "{}", json);

        let parsed = Envelope::from_json(
            r#"{"type":"terminal-resize","payload":{"sessionId":"s1","cols":120,"rows":40}}"#,
        )
        .unwrap();
        assert_eq!(parsed.message_type, MessageType::TerminalResize);
        assert_eq!(
            parsed.payload_as::<TerminalResize>().unwrap(),
            TerminalResize {
                session_id: "s1".to_string(),
                cols: 120,
                rows: 40
            }
        );
    }

    #[test]
    fn test_log_envelope_payload() {
        let entry = LogEntry {
            timestamp: Utc::now(),
            stream: LogStream::Stderr,
            message: "boom".to_string(),
        };
        let envelope = Envelope::log("sbx_1", &entry);

        assert_eq!(envelope.payload["stream"], "stderr");
        assert_eq!(envelope.payload["message"], "boom");
        assert_eq!(envelope.payload["sandboxId"], "sbx_1");
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(Envelope::from_json(r#"{"type":"teleport"}"#).is_err());
    }
}
