//! Value types exchanged between a node and the rest of the grid.
//!
//! All of these are immutable snapshots. Field names on the wire are fixed
//! by explicit serde attributes and must not drift:
//!
//! | Type | Wire fields |
//! |------|-------------|
//! | `Session` | `sessionId, capabilities, stereotype, start, uri` |
//! | `Slot` | `id, stereotype, session, lastStarted` |
//! | `NodeStatus` | `nodeId, externalUri, maxSessions, slots, availability, heartbeatPeriod, version, osInfo` |
//! | `SessionRequest` | `requestId, enqueued, dialects, capabilities, metadata, traceHeaders` |
//! | `NewSessionResponse` | `requestId, session, downstreamEncodedResponse` |
//! | `NewSessionErrorResponse` | `requestId, message` |

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use url::Url;
use uuid::Uuid;

use crate::capabilities::Capabilities;
use crate::matcher::matches;

// ── Identifiers ───────────────────────────────────────────────────

/// Identity of a node. Created once at startup, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Identity of one capacity unit: the owning node plus a per-slot UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId {
    #[serde(rename = "hostId")]
    pub node_id: NodeId,
    pub id: Uuid,
}

impl SlotId {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            id: Uuid::new_v4(),
        }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node_id, self.id)
    }
}

/// Identity of a running browser session, as issued by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identity of a queued new-session request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

// ── Dialects ──────────────────────────────────────────────────────

/// Wire protocol variant spoken by a client or a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Dialect {
    #[serde(rename = "W3C")]
    W3c,
    #[serde(rename = "OSS")]
    Oss,
}

impl Dialect {
    /// Encode a new-session payload the way a client of this dialect
    /// expects to receive it.
    pub fn encode_new_session(self, session_id: &SessionId, capabilities: &Capabilities) -> Vec<u8> {
        let payload = match self {
            Dialect::W3c => json!({
                "value": {
                    "sessionId": session_id,
                    "capabilities": capabilities,
                }
            }),
            Dialect::Oss => json!({
                "status": 0,
                "sessionId": session_id,
                "value": capabilities,
            }),
        };
        payload.to_string().into_bytes()
    }
}

// ── Sessions and slots ────────────────────────────────────────────

/// A running browser session bound to exactly one slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "sessionId")]
    pub id: SessionId,
    pub uri: Url,
    pub stereotype: Capabilities,
    pub capabilities: Capabilities,
    #[serde(rename = "start")]
    pub start_time: DateTime<Utc>,
}

/// Read-only projection of one slot, rebuilt on every status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    pub id: SlotId,
    pub stereotype: Capabilities,
    pub session: Option<Session>,
    pub last_started: DateTime<Utc>,
}

impl Slot {
    pub fn is_free(&self) -> bool {
        self.session.is_none()
    }
}

// ── Requests and responses ────────────────────────────────────────

/// A client's pending ask for a new session, as queued upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    pub request_id: RequestId,
    pub enqueued: DateTime<Utc>,
    #[serde(rename = "dialects")]
    pub downstream_dialects: BTreeSet<Dialect>,
    #[serde(rename = "capabilities")]
    pub desired_capabilities: Vec<Capabilities>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub trace_headers: BTreeMap<String, String>,
}

impl SessionRequest {
    pub fn new(
        downstream_dialects: BTreeSet<Dialect>,
        desired_capabilities: Vec<Capabilities>,
    ) -> Self {
        Self {
            request_id: RequestId::new(),
            enqueued: Utc::now(),
            downstream_dialects,
            desired_capabilities,
            metadata: Map::new(),
            trace_headers: BTreeMap::new(),
        }
    }

    /// The subset forwarded to a node once one capability set was chosen.
    pub fn to_create_request(&self, capabilities: Capabilities) -> CreateSessionRequest {
        CreateSessionRequest {
            downstream_dialects: self.downstream_dialects.clone(),
            desired_capabilities: capabilities,
            metadata: self.metadata.clone(),
        }
    }
}

/// What a node receives when asked to start a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(rename = "dialects")]
    pub downstream_dialects: BTreeSet<Dialect>,
    #[serde(rename = "capabilities")]
    pub desired_capabilities: Capabilities,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl CreateSessionRequest {
    pub fn new(capabilities: Capabilities) -> Self {
        Self {
            downstream_dialects: BTreeSet::from([Dialect::W3c]),
            desired_capabilities: capabilities,
            metadata: Map::new(),
        }
    }

    pub fn with_capabilities(&self, capabilities: Capabilities) -> Self {
        Self {
            downstream_dialects: self.downstream_dialects.clone(),
            desired_capabilities: capabilities,
            metadata: self.metadata.clone(),
        }
    }
}

/// Successful terminal outcome of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionResponse {
    pub request_id: RequestId,
    pub session: Session,
    #[serde(with = "base64_bytes")]
    pub downstream_encoded_response: Vec<u8>,
}

/// Failed terminal outcome of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionErrorResponse {
    pub request_id: RequestId,
    pub message: String,
}

// ── Status ────────────────────────────────────────────────────────

/// Node-wide availability. `Down` outranks `Draining`, which outranks `Up`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Availability {
    Up,
    Draining,
    Down,
}

/// Host operating system, reported for inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsInfo {
    pub arch: String,
    pub name: String,
    pub version: String,
}

impl OsInfo {
    pub fn current() -> Self {
        Self {
            arch: std::env::consts::ARCH.to_string(),
            name: std::env::consts::OS.to_string(),
            version: os_version().to_string(),
        }
    }
}

/// Kernel release, read once. `"unknown"` where the host does not expose it.
fn os_version() -> &'static str {
    static VERSION: OnceLock<String> = OnceLock::new();
    VERSION.get_or_init(|| {
        std::fs::read_to_string("/proc/sys/kernel/osrelease")
            .ok()
            .map(|release| release.trim().to_string())
            .filter(|release| !release.is_empty())
            .unwrap_or_else(|| "unknown".to_string())
    })
}

/// Full capacity and health snapshot of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub external_uri: Url,
    #[serde(rename = "maxSessions")]
    pub max_session_count: usize,
    pub slots: Vec<Slot>,
    pub availability: Availability,
    #[serde(with = "duration_millis")]
    pub heartbeat_period: Duration,
    pub version: String,
    pub os_info: OsInfo,
}

impl NodeStatus {
    /// Number of slots currently running a session.
    pub fn session_count(&self) -> usize {
        self.slots.iter().filter(|s| s.session.is_some()).count()
    }

    /// Whether this node would currently accept `capabilities`.
    pub fn has_capacity(&self, capabilities: &Capabilities) -> bool {
        self.availability == Availability::Up
            && self.session_count() < self.max_session_count
            && self
                .slots
                .iter()
                .any(|slot| slot.is_free() && matches(&slot.stereotype, capabilities))
    }

    /// Fraction of `max_session_count` in use, in `0.0..=1.0`.
    pub fn load(&self) -> f64 {
        if self.max_session_count == 0 {
            return 1.0;
        }
        self.session_count() as f64 / self.max_session_count as f64
    }
}

// ── Downstream commands ───────────────────────────────────────────

/// HTTP verb of a forwarded WebDriver command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Delete,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Delete => "DELETE",
        })
    }
}

/// A WebDriver command addressed to a session on this node.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub method: HttpMethod,
    pub path: String,
    pub body: Vec<u8>,
}

impl Command {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// `DELETE /session/{id}` for the given session.
    pub fn delete_session(id: &SessionId) -> Self {
        Self::new(HttpMethod::Delete, format!("/session/{id}"))
    }

    /// The session id in a `/session/{id}/...` path.
    pub fn session_id(&self) -> Option<SessionId> {
        let mut parts = self.path.trim_start_matches('/').split('/');
        match (parts.next(), parts.next()) {
            (Some("session"), Some(id)) if !id.is_empty() => Some(SessionId::new(id)),
            _ => None,
        }
    }

    /// Whether this command ends its session (`DELETE /session/{id}`).
    pub fn is_delete_session(&self) -> bool {
        if self.method != HttpMethod::Delete {
            return false;
        }
        let parts: Vec<&str> = self
            .path
            .trim_matches('/')
            .split('/')
            .filter(|p| !p.is_empty())
            .collect();
        parts.len() == 2 && parts[0] == "session"
    }
}

/// The downstream answer to a [`Command`].
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl CommandResponse {
    pub fn ok(body: Vec<u8>) -> Self {
        Self { status: 200, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

// ── serde helpers ─────────────────────────────────────────────────

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session(id: &str) -> Session {
        Session {
            id: SessionId::new(id),
            uri: Url::parse("http://10.0.0.1:5555").unwrap(),
            stereotype: Capabilities::new().with("browserName", "chrome"),
            capabilities: Capabilities::new().with("browserName", "chrome"),
            start_time: Utc::now(),
        }
    }

    fn test_status(slots: Vec<Slot>) -> NodeStatus {
        NodeStatus {
            node_id: NodeId::new(),
            external_uri: Url::parse("http://10.0.0.1:5555").unwrap(),
            max_session_count: 1,
            slots,
            availability: Availability::Up,
            heartbeat_period: Duration::from_secs(60),
            version: "0.1.0".to_string(),
            os_info: OsInfo::current(),
        }
    }

    fn free_slot(node_id: NodeId) -> Slot {
        Slot {
            id: SlotId::new(node_id),
            stereotype: Capabilities::new().with("browserName", "chrome"),
            session: None,
            last_started: Utc::now(),
        }
    }

    #[test]
    fn os_info_reports_a_version_not_a_family() {
        let info = OsInfo::current();
        assert_eq!(info.name, std::env::consts::OS);
        assert!(!info.version.is_empty());
        assert_ne!(info.version, std::env::consts::FAMILY);
        if cfg!(target_os = "linux") {
            assert_ne!(info.version, "unknown");
        }
    }

    #[test]
    fn session_wire_field_names() {
        let json = serde_json::to_value(test_session("abc")).unwrap();
        let obj = json.as_object().unwrap();
        let mut keys: Vec<&str> = obj.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, ["capabilities", "sessionId", "start", "stereotype", "uri"]);
        assert_eq!(obj["sessionId"], "abc");
    }

    #[test]
    fn slot_id_uses_host_id() {
        let id = SlotId::new(NodeId::new());
        let json = serde_json::to_value(id).unwrap();
        assert_eq!(json["hostId"], id.node_id.to_string());
        assert_eq!(json["id"], id.id.to_string());
    }

    #[test]
    fn free_slot_serializes_null_session() {
        let slot = free_slot(NodeId::new());
        let json = serde_json::to_value(&slot).unwrap();
        assert!(json["session"].is_null());
        assert!(json.get("lastStarted").is_some());
    }

    #[test]
    fn node_status_wire_shape() {
        let status = test_status(vec![]);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["availability"], "UP");
        assert_eq!(json["maxSessions"], 1);
        assert_eq!(json["heartbeatPeriod"], 60_000);
        assert!(json.get("osInfo").is_some());

        let back: NodeStatus = serde_json::from_value(json).unwrap();
        assert_eq!(back, status);
    }

    #[test]
    fn new_session_response_base64_payload() {
        let response = NewSessionResponse {
            request_id: RequestId::new(),
            session: test_session("abc"),
            downstream_encoded_response: b"{\"value\":{}}".to_vec(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["downstreamEncodedResponse"], "eyJ2YWx1ZSI6e319");

        let back: NewSessionResponse = serde_json::from_value(json).unwrap();
        assert_eq!(back.downstream_encoded_response, b"{\"value\":{}}");
    }

    #[test]
    fn session_request_wire_names() {
        let request = SessionRequest::new(
            BTreeSet::from([Dialect::W3c]),
            vec![Capabilities::new().with("browserName", "firefox")],
        );
        let json = serde_json::to_value(&request).unwrap();
        for key in ["requestId", "enqueued", "dialects", "capabilities", "metadata", "traceHeaders"] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert_eq!(json["dialects"], json!(["W3C"]));

        let create = request.to_create_request(request.desired_capabilities[0].clone());
        assert_eq!(create.desired_capabilities.browser_name(), Some("firefox"));
    }

    #[test]
    fn w3c_and_oss_encodings_differ() {
        let id = SessionId::new("s1");
        let caps = Capabilities::new().with("browserName", "chrome");

        let w3c: Value = serde_json::from_slice(&Dialect::W3c.encode_new_session(&id, &caps)).unwrap();
        assert_eq!(w3c["value"]["sessionId"], "s1");

        let oss: Value = serde_json::from_slice(&Dialect::Oss.encode_new_session(&id, &caps)).unwrap();
        assert_eq!(oss["status"], 0);
        assert_eq!(oss["value"]["browserName"], "chrome");
    }

    #[test]
    fn has_capacity_respects_free_matching_slots() {
        let node_id = NodeId::new();
        let mut status = test_status(vec![free_slot(node_id)]);
        let chrome = Capabilities::new().with("browserName", "chrome");
        let firefox = Capabilities::new().with("browserName", "firefox");

        assert!(status.has_capacity(&chrome));
        assert!(!status.has_capacity(&firefox));

        status.slots[0].session = Some(test_session("busy"));
        assert!(!status.has_capacity(&chrome));
        assert_eq!(status.load(), 1.0);

        status.slots[0].session = None;
        status.availability = Availability::Draining;
        assert!(!status.has_capacity(&chrome));
    }

    #[test]
    fn command_session_id_and_delete_detection() {
        let cmd = Command::new(HttpMethod::Post, "/session/abc/url");
        assert_eq!(cmd.session_id(), Some(SessionId::new("abc")));
        assert!(!cmd.is_delete_session());

        let delete = Command::delete_session(&SessionId::new("abc"));
        assert!(delete.is_delete_session());

        let delete_window = Command::new(HttpMethod::Delete, "/session/abc/window");
        assert!(!delete_window.is_delete_session());

        assert_eq!(Command::new(HttpMethod::Get, "/status").session_id(), None);
    }
}
