//! Message Protocol
//!
//! Defines the message shapes exchanged between the agent and the backend.
//! Inbound messages come in two shapes: the typed envelope
//! `{type, request_id, payload}` and the legacy command `{action, params}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::agent::state::ConnectionState;
use crate::error::{AgentError, Result};
use crate::metrics::snapshot::{MonitorData, SystemInfo};

/// Typed envelope type that triggers a self-upgrade
pub const AGENT_UPGRADE: &str = "agent_upgrade";
/// Status push type for upgrades
pub const AGENT_UPGRADE_STATUS: &str = "agent_upgrade_status";
/// Push type for terminal session output
pub const TERMINAL_OUTPUT: &str = "terminal_output";
/// Push type sent once when a shell exits on its own
pub const TERMINAL_EXIT: &str = "terminal_exit";

/// Telemetry messages sent from the agent to the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum AgentMessage {
    Heartbeat(HeartbeatPayload),
    MonitorData(MonitorData),
    SystemInfo(SystemInfo),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub server_id: u64,
    pub agent_version: String,
    pub uptime_secs: u64,
    pub state: String,
    pub timestamp: DateTime<Utc>,
}

impl AgentMessage {
    pub fn heartbeat(server_id: u64, uptime_secs: u64, state: ConnectionState) -> Self {
        AgentMessage::Heartbeat(HeartbeatPayload {
            server_id,
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs,
            state: state.to_string(),
            timestamp: Utc::now(),
        })
    }

    /// Serialize the message to JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Typed envelope, used for request-scoped traffic in both directions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: &str, request_id: &str, payload: Value) -> Self {
        Self {
            kind: kind.to_string(),
            request_id: request_id.to_string(),
            payload,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Requested self-upgrade. Fields are optional on the wire and validated by
/// the upgrade flow so that a bad request still gets a status reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpgradeRequest {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub force: bool,
}

/// Inbound typed messages
#[derive(Debug, Clone, PartialEq)]
pub enum TypedMessage {
    AgentUpgrade {
        request_id: String,
        request: UpgradeRequest,
    },
    /// A known type whose payload did not decode; keeps the id so the reply
    /// stays correlated
    Malformed {
        kind: String,
        request_id: String,
        error: String,
    },
    /// Forward-compatible fallback; payload is kept untouched
    Unknown {
        kind: String,
        request_id: String,
        payload: Value,
    },
}

/// Inbound legacy command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyCommand {
    #[serde(default)]
    pub action: String,
    #[serde(default = "empty_params")]
    pub params: Value,
}

fn empty_params() -> Value {
    Value::Object(Map::new())
}

/// Any message the dispatcher may receive
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Typed(TypedMessage),
    Legacy(LegacyCommand),
}

impl InboundMessage {
    /// Interpret a text frame. Typed envelopes win when `type` is non-empty.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(mut object) = value else {
            return Err(AgentError::InvalidParams("message is not a JSON object".to_string()));
        };

        let kind = match object.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            _ => String::new(),
        };

        if !kind.is_empty() {
            let request_id = match object.remove("request_id") {
                Some(Value::String(id)) => id,
                _ => String::new(),
            };
            let payload = object.remove("payload").unwrap_or(Value::Null);

            let typed = match kind.as_str() {
                AGENT_UPGRADE => {
                    let request = if payload.is_null() {
                        Ok(UpgradeRequest::default())
                    } else {
                        serde_json::from_value::<UpgradeRequest>(payload)
                    };
                    match request {
                        Ok(request) => TypedMessage::AgentUpgrade {
                            request_id,
                            request,
                        },
                        Err(e) => TypedMessage::Malformed {
                            kind,
                            request_id,
                            error: e.to_string(),
                        },
                    }
                }
                _ => TypedMessage::Unknown {
                    kind,
                    request_id,
                    payload,
                },
            };
            return Ok(InboundMessage::Typed(typed));
        }

        let command: LegacyCommand = serde_json::from_value(Value::Object(object))?;
        Ok(InboundMessage::Legacy(command))
    }
}

/// Handler family a legacy action belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandCategory {
    File,
    Process,
    Docker,
    Nginx,
    Terminal,
    Ping,
    Unknown,
}

impl CommandCategory {
    pub fn classify(action: &str) -> Self {
        if action == "ping" {
            return CommandCategory::Ping;
        }

        const PREFIXES: [(&str, CommandCategory); 5] = [
            ("file_", CommandCategory::File),
            ("process_", CommandCategory::Process),
            ("docker_", CommandCategory::Docker),
            ("nginx_", CommandCategory::Nginx),
            ("terminal_", CommandCategory::Terminal),
        ];

        PREFIXES
            .iter()
            .find(|(prefix, _)| action.starts_with(prefix) && action.len() > prefix.len())
            .map(|(_, category)| *category)
            .unwrap_or(CommandCategory::Unknown)
    }
}

impl std::fmt::Display for CommandCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CommandCategory::File => "file",
            CommandCategory::Process => "process",
            CommandCategory::Docker => "docker",
            CommandCategory::Nginx => "nginx",
            CommandCategory::Terminal => "terminal",
            CommandCategory::Ping => "ping",
            CommandCategory::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// Fixed reply to `ping`
pub fn pong() -> Value {
    json!({ "status": "pong" })
}

/// Error reply, optionally correlated to a typed request
pub fn error_response(message: &str, request_id: Option<&str>) -> Value {
    let mut response = json!({ "status": "error", "error": message });
    if let Some(id) = request_id.filter(|id| !id.is_empty()) {
        response["request_id"] = Value::String(id.to_string());
    }
    response
}
