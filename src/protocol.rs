use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::EnvelopeError;

pub const MESSAGE_RESPONSE_TYPE: &str = "messageResponse";
pub const FS_EVENT_TYPE: &str = "fsEvent";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionRole {
    App,
    Agent,
    Tui,
}

impl ConnectionRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionRole::App => "app",
            ConnectionRole::Agent => "agent",
            ConnectionRole::Tui => "tui",
        }
    }

    /// Parse a `clientType`/`connectionType` hint. Unknown hints yield `None`.
    pub fn from_hint(hint: &str) -> Option<Self> {
        match hint.trim().to_ascii_lowercase().as_str() {
            "app" => Some(ConnectionRole::App),
            "agent" => Some(ConnectionRole::Agent),
            "tui" => Some(ConnectionRole::Tui),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub project_type: Option<String>,
}

/// A re-binding request sent by a peer after the socket was accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualRegistration {
    pub role: ConnectionRole,
    pub id: Option<String>,
    pub parent_id: Option<String>,
    pub instance_id: Option<String>,
}

/// What the gateway needs to know about a message, decided once at decode time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    ReadFile { file_path: String },
    WriteFile { file_path: String, content: String },
    /// `messageResponse`: the user's initial prompt, destined for an agent.
    InitialPrompt,
    Register(ManualRegistration),
    UpdateProject(ProjectInfo),
    /// Anything else is opaque and only routed by its addressing fields.
    Other,
}

/// Wire envelope. The full frame is kept verbatim in `raw` so that forwarding
/// never loses fields the gateway does not understand.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub msg_type: String,
    pub request_id: Option<String>,
    pub agent_id: Option<String>,
    pub kind: MessageKind,
    raw: Map<String, Value>,
}

impl Envelope {
    pub fn decode(text: &str) -> Result<Self, EnvelopeError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        let Value::Object(raw) = value else {
            return Err(EnvelopeError::Malformed("expected a JSON object".into()));
        };
        let msg_type = match raw.get("type").and_then(Value::as_str) {
            Some(t) if !t.trim().is_empty() => t.to_string(),
            _ => return Err(EnvelopeError::MissingType),
        };
        let field = |key: &str| -> Option<String> {
            raw.get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(ToOwned::to_owned)
        };
        let action = field("action");
        let kind = classify(&msg_type, action.as_deref(), &raw);

        Ok(Self {
            request_id: field("requestId"),
            agent_id: field("agentId"),
            msg_type,
            kind,
            raw,
        })
    }

    /// The `message` (or legacy `data`) body.
    pub fn payload(&self) -> Option<&Value> {
        self.raw.get("message").or_else(|| self.raw.get("data"))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.raw.get(key)
    }

    /// Set a top-level field on the outgoing frame.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.raw.insert(key.to_string(), value.into());
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.raw.clone())
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.raw)
    }
}

fn classify(msg_type: &str, action: Option<&str>, raw: &Map<String, Value>) -> MessageKind {
    let body = raw.get("message").or_else(|| raw.get("data"));
    let body_str = |key: &str| {
        body.and_then(|b| b.get(key))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    match (msg_type, action) {
        (FS_EVENT_TYPE, Some("readFile")) => MessageKind::ReadFile {
            file_path: body_str("filePath"),
        },
        (FS_EVENT_TYPE, Some("writeFile" | "writeToFile")) => MessageKind::WriteFile {
            file_path: body_str("filePath"),
            content: body_str("content"),
        },
        (MESSAGE_RESPONSE_TYPE, _) => MessageKind::InitialPrompt,
        ("register", _) => {
            let text = |key: &str| {
                raw.get(key)
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(ToOwned::to_owned)
            };
            let role = text("connectionType")
                .as_deref()
                .and_then(ConnectionRole::from_hint)
                .unwrap_or(ConnectionRole::App);
            let id = match role {
                ConnectionRole::Agent => text("agentId"),
                ConnectionRole::App => text("appId"),
                ConnectionRole::Tui => text("tuiId"),
            };
            MessageKind::Register(ManualRegistration {
                role,
                id,
                parent_id: text("parentId"),
                instance_id: text("instanceId"),
            })
        }
        ("updateProject", _) => match raw
            .get("project")
            .cloned()
            .map(serde_json::from_value::<ProjectInfo>)
        {
            Some(Ok(project)) => MessageKind::UpdateProject(project),
            _ => MessageKind::Other,
        },
        _ => MessageKind::Other,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationType {
    Auto,
    Manual,
}

/// Server → peer confirmation sent once a socket is classified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredConfirmation {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub connection_id: String,
    pub connection_type: ConnectionRole,
    pub message: String,
    pub registration_type: RegistrationType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tui_instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

impl RegisteredConfirmation {
    pub fn new(
        connection_id: &str,
        role: ConnectionRole,
        registration_type: RegistrationType,
        instance_id: Option<String>,
    ) -> Self {
        let (agent_instance_id, app_instance_id, tui_instance_id) = match role {
            ConnectionRole::Agent => (instance_id, None, None),
            ConnectionRole::App => (None, instance_id, None),
            ConnectionRole::Tui => (None, None, instance_id),
        };
        Self {
            msg_type: "registered",
            connection_id: connection_id.to_string(),
            connection_type: role,
            message: format!("Registered {role} connection {connection_id}"),
            registration_type,
            parent_id: None,
            agent_instance_id,
            app_instance_id,
            tui_instance_id,
            thread_id: None,
        }
    }
}

pub fn error_envelope(id: &str, error: impl fmt::Display) -> Value {
    json!({
        "type": "error",
        "id": id,
        "error": error.to_string(),
    })
}

pub fn disconnect_notice(connection_id: &str, role: ConnectionRole) -> Value {
    json!({
        "type": "connectionClosed",
        "connectionId": connection_id,
        "connectionType": role,
        "timestamp": Utc::now().timestamp_millis(),
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionCounts {
    pub apps: usize,
    pub agents: usize,
    pub tuis: usize,
    pub total: usize,
}

// ---------------------------------------------------------------------------
// Tunnel relay protocol
// ---------------------------------------------------------------------------

/// Frames the gateway sends to the remote relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum TunnelOutbound {
    RegisterGateway {
        server_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        app_token: Option<String>,
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
    },
    ForwardFromAgent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        app_token: Option<String>,
        payload: Value,
    },
    ForwardFromApp {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        app_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        app_token: Option<String>,
        payload: Value,
    },
    ForwardFromTui {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        app_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        app_token: Option<String>,
        payload: Value,
    },
    ConnectionsSnapshot {
        data: Value,
    },
}

/// Frames the remote relay sends to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum TunnelInbound {
    Ping {
        #[serde(default)]
        timestamp: Option<i64>,
    },
    ForwardToAgent {
        #[serde(default)]
        agent_id: Option<String>,
        #[serde(default)]
        application_id: Option<String>,
        #[serde(default)]
        app_token: Option<String>,
        payload: Value,
    },
    ForwardToApp {
        #[serde(default)]
        app_id: Option<String>,
        #[serde(default)]
        app_token: Option<String>,
        payload: Value,
    },
    BroadcastToApps {
        payload: Value,
    },
    RequestConnections {},
}

/// Where a relay-originated message should be delivered locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteTarget {
    Agent {
        agent_id: Option<String>,
        parent_id: Option<String>,
    },
    App {
        app_id: Option<String>,
    },
    AllApps,
}

impl RemoteTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteTarget::Agent { .. } => "agent",
            RemoteTarget::App { .. } => "app",
            RemoteTarget::AllApps => "apps",
        }
    }
}

/// A relay frame re-injected into local routing.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteMessage {
    pub target: RemoteTarget,
    pub payload: Value,
}

impl RemoteMessage {
    /// The payload as a local frame, tagged with the `target` discriminator.
    pub fn into_local_frame(self) -> Value {
        let mut payload = self.payload;
        if let Value::Object(map) = &mut payload {
            map.insert("target".into(), Value::from(self.target.as_str()));
        }
        payload
    }
}
