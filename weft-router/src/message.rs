//! Router message and event model.
//!
//! [`RouterMessage`] is the tagged envelope exchanged on the long-lived p2p
//! stream; [`RouterEvent`] is what topology subscribers receive. Both are
//! plain serde types carried by the JSON codec.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A JSON object, used for free-form payloads and client metadata.
pub type JsonMap = serde_json::Map<String, Value>;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// Discriminant of a [`RouterMessage`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Register,
    RegisterResponse,
    Unicast,
    Multicast,
    Broadcast,
    Request,
    Response,
    Error,
    Ping,
    Pong,
    Heartbeat,
}

/// The unit routed between peers.
///
/// On a p2p stream the first inbound message must carry `sender_id` equal to
/// the registered client id; the router stamps `sender_id` on every message
/// it forwards so recipients can reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouterMessage {
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl RouterMessage {
    pub fn new(kind: MessageKind) -> Self {
        RouterMessage {
            kind,
            sender_id: None,
            target_id: None,
            group_name: None,
            payload: None,
            timestamp_ms: now_ms(),
            success: None,
            error_message: None,
        }
    }

    pub fn unicast(sender_id: impl Into<String>, target_id: impl Into<String>, payload: Value) -> Self {
        let mut message = RouterMessage::new(MessageKind::Unicast);
        message.sender_id = Some(sender_id.into());
        message.target_id = Some(target_id.into());
        message.payload = Some(payload);
        message
    }

    pub fn multicast(sender_id: impl Into<String>, group_name: impl Into<String>, payload: Value) -> Self {
        let mut message = RouterMessage::new(MessageKind::Multicast);
        message.sender_id = Some(sender_id.into());
        message.group_name = Some(group_name.into());
        message.payload = Some(payload);
        message
    }

    pub fn broadcast(sender_id: impl Into<String>, payload: Value) -> Self {
        let mut message = RouterMessage::new(MessageKind::Broadcast);
        message.sender_id = Some(sender_id.into());
        message.payload = Some(payload);
        message
    }

    pub fn request(sender_id: impl Into<String>, target_id: impl Into<String>, payload: Value) -> Self {
        let mut message = RouterMessage::new(MessageKind::Request);
        message.sender_id = Some(sender_id.into());
        message.target_id = Some(target_id.into());
        message.payload = Some(payload);
        message
    }

    pub fn response(sender_id: impl Into<String>, target_id: impl Into<String>, payload: Value) -> Self {
        let mut message = RouterMessage::new(MessageKind::Response);
        message.sender_id = Some(sender_id.into());
        message.target_id = Some(target_id.into());
        message.payload = Some(payload);
        message
    }

    /// An error notice delivered back to a misbehaving or unlucky sender.
    pub fn error(error_message: impl Into<String>) -> Self {
        let mut message = RouterMessage::new(MessageKind::Error);
        message.success = Some(false);
        message.error_message = Some(error_message.into());
        message
    }

    /// A liveness beat; `sender_id` identifies the beating client.
    pub fn heartbeat(sender_id: Option<String>) -> Self {
        let mut message = RouterMessage::new(MessageKind::Heartbeat);
        message.sender_id = sender_id;
        message
    }

    /// The router's p2p attach acknowledgement.
    pub fn heartbeat_ack() -> Self {
        let mut message = RouterMessage::new(MessageKind::Heartbeat);
        message.success = Some(true);
        message.payload = Some(serde_json::json!({ "connected": true }));
        message
    }

    pub fn ping(sender_id: impl Into<String>) -> Self {
        let mut message = RouterMessage::new(MessageKind::Ping);
        message.sender_id = Some(sender_id.into());
        message
    }

    pub fn pong(target_id: impl Into<String>) -> Self {
        let mut message = RouterMessage::new(MessageKind::Pong);
        message.target_id = Some(target_id.into());
        message
    }

    /// The correlation id carried inside a request or response payload.
    pub fn request_id(&self) -> Option<&str> {
        self.payload
            .as_ref()?
            .as_object()?
            .get("request_id")?
            .as_str()
    }
}

/// Discriminant of a [`RouterEvent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ClientConnected,
    ClientDisconnected,
    ClientCapabilitiesUpdated,
    TopologyChanged,
    RouterStats,
    HealthWarning,
}

/// A topology or health notification, emitted only on change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouterEvent {
    pub kind: EventKind,
    #[serde(default)]
    pub data: JsonMap,
    pub timestamp_ms: u64,
}

impl RouterEvent {
    pub fn new(kind: EventKind, data: JsonMap) -> Self {
        RouterEvent {
            kind,
            data,
            timestamp_ms: now_ms(),
        }
    }
}

/// A registered client's liveness, as the monitor last saw it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Online,
    Idle,
    Offline,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub metadata: JsonMap,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub client_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientTimestamp {
    pub client_ts: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PongResponse {
    pub client_ts: u64,
    pub server_ts: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetOnlineClientsRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonMap>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientsList {
    pub clients: Vec<ClientInfo>,
}

/// A snapshot of one registered client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    pub groups: Vec<String>,
    pub status: ClientStatus,
    pub connected_at_ms: u64,
    pub last_activity_ms: u64,
    #[serde(default)]
    pub metadata: JsonMap,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateMetadataRequest {
    pub client_id: String,
    #[serde(default)]
    pub metadata: JsonMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<String>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// The empty request of the `events` subscription.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Empty {}
