//! Relay WebSocket protocol types (heartbeat, commands, status and device data).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame sent to the client: `{ "type": "status" | "deviceData" | "pong" | "error", ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Status {
        connected: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    DeviceData {
        data: String,
    },
    /// Echo of the client's heartbeat timestamp, unchanged. Omitted when the ping had none.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<Value>,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Frame received from the client.
///
/// A `cmd` key marks a control message; `type: "ping"` marks a heartbeat. Both fields
/// are kept as raw JSON so validation can report non-string letters and non-numeric
/// intensities instead of failing deserialization.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Ping { timestamp: Option<Value> },
    Command { cmd: Value, intensity: Value },
    /// Valid JSON that is neither a heartbeat nor a command.
    Other(Value),
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        if value.get("type").and_then(Value::as_str) == Some("ping") {
            let timestamp = value.get("timestamp").filter(|t| !t.is_null()).cloned();
            return Ok(ClientMessage::Ping { timestamp });
        }
        match value.get("cmd") {
            Some(cmd) if !cmd.is_null() => {
                // Older clients send `speed` instead of `intensity`.
                let intensity = value
                    .get("intensity")
                    .or_else(|| value.get("speed"))
                    .cloned()
                    .unwrap_or(Value::Null);
                Ok(ClientMessage::Command {
                    cmd: cmd.clone(),
                    intensity,
                })
            }
            _ => Ok(ClientMessage::Other(value)),
        }
    }
}

/// Session query parameters: `/?ip=10.0.0.5&port=5006`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectQuery {
    pub ip: Option<String>,
    pub port: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_messages_use_wire_names() {
        let status = ServerMessage::Status {
            connected: false,
            error: None,
        };
        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            json!({"type": "status", "connected": false})
        );
        let data = ServerMessage::DeviceData {
            data: "ok".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&data).unwrap(),
            json!({"type": "deviceData", "data": "ok"})
        );
        assert_eq!(
            serde_json::to_value(ServerMessage::error("device not connected")).unwrap(),
            json!({"type": "error", "message": "device not connected"})
        );
    }

    #[test]
    fn status_error_is_included_when_present() {
        let status = ServerMessage::Status {
            connected: false,
            error: Some("connection refused".to_string()),
        };
        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            json!({"type": "status", "connected": false, "error": "connection refused"})
        );
    }

    #[test]
    fn parses_heartbeat_before_command() {
        let msg = ClientMessage::parse(r#"{"type":"ping","timestamp":1718000000123}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Ping {
                timestamp: Some(json!(1718000000123u64))
            }
        );
    }

    #[test]
    fn ping_without_timestamp_gets_bare_pong() {
        let msg = ClientMessage::parse(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping { timestamp: None });
        assert_eq!(
            serde_json::to_value(ServerMessage::Pong { timestamp: None }).unwrap(),
            json!({"type": "pong"})
        );
    }

    #[test]
    fn parses_command_with_speed_alias() {
        let msg = ClientMessage::parse(r#"{"cmd":"F","speed":80}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Command {
                cmd: json!("F"),
                intensity: json!(80)
            }
        );
    }

    #[test]
    fn intensity_wins_over_speed() {
        let msg = ClientMessage::parse(r#"{"cmd":"B","intensity":10,"speed":90}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Command {
                cmd: json!("B"),
                intensity: json!(10)
            }
        );
    }

    #[test]
    fn objects_without_cmd_are_other() {
        let msg = ClientMessage::parse(r#"{"hello":"world"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Other(_)));
        assert!(ClientMessage::parse("not json").is_err());
    }
}
