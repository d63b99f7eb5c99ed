//! Wire protocol: the message envelope, the closed per-role message sets,
//! and the shape validators that stand between untrusted payloads and the
//! relay handlers.
//!
//! Validation here covers type and required-field presence only. Whether a
//! referenced session or device actually exists is the consuming handler's
//! problem.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Number, Value};

pub mod types {
    pub const AGENT_REGISTER: &str = "agent:register";
    pub const AGENT_REGISTER_ACK: &str = "agent:register:ack";
    pub const AGENT_HEARTBEAT: &str = "agent:heartbeat";
    pub const AGENT_HEARTBEAT_ACK: &str = "agent:heartbeat:ack";
    pub const DEVICES_LIST_REQUEST: &str = "devices:list:request";
    pub const DEVICES_LIST_RESPONSE: &str = "devices:list:response";
    pub const SSH_SESSION_REQUEST: &str = "ssh:session:request";
    pub const SSH_SESSION_RESPONSE: &str = "ssh:session:response";
    pub const RDP_SESSION_REQUEST: &str = "rdp:session:request";
    pub const RDP_SESSION_RESPONSE: &str = "rdp:session:response";
    pub const SSH_DATA: &str = "ssh:data";
    pub const RDP_DATA: &str = "rdp:data";
    pub const SSH_RESIZE: &str = "ssh:resize";
    pub const SSH_CLOSE: &str = "ssh:close";
    pub const RDP_CLOSE: &str = "rdp:close";
    pub const ERROR: &str = "error";
}

/// The one envelope every message uses: `{type, timestamp, payload?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: Number,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    pub fn new(kind: &str, payload: Value) -> Self {
        Self {
            kind: kind.to_string(),
            timestamp: Number::from(Utc::now().timestamp_millis()),
            payload: Some(payload),
        }
    }

    pub fn bare(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            timestamp: Number::from(Utc::now().timestamp_millis()),
            payload: None,
        }
    }
}

/// The two relayed stream flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Terminal,
    RemoteDesktop,
}

impl SessionKind {
    pub const fn request_type(self) -> &'static str {
        match self {
            SessionKind::Terminal => types::SSH_SESSION_REQUEST,
            SessionKind::RemoteDesktop => types::RDP_SESSION_REQUEST,
        }
    }

    pub const fn response_type(self) -> &'static str {
        match self {
            SessionKind::Terminal => types::SSH_SESSION_RESPONSE,
            SessionKind::RemoteDesktop => types::RDP_SESSION_RESPONSE,
        }
    }

    pub const fn data_type(self) -> &'static str {
        match self {
            SessionKind::Terminal => types::SSH_DATA,
            SessionKind::RemoteDesktop => types::RDP_DATA,
        }
    }

    pub const fn close_type(self) -> &'static str {
        match self {
            SessionKind::Terminal => types::SSH_CLOSE,
            SessionKind::RemoteDesktop => types::RDP_CLOSE,
        }
    }
}

/// Session kinds an agent is able to serve, as advertised at registration.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capabilities {
    #[serde(default)]
    pub ssh: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub rdp: bool,
}

impl Capabilities {
    pub fn supports(self, kind: SessionKind) -> bool {
        match kind {
            SessionKind::Terminal => self.ssh,
            SessionKind::RemoteDesktop => self.rdp,
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub device_id: String,
    pub device_name: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub device_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequestPayload {
    #[serde(default)]
    pub session_id: Option<String>,
    pub device_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponsePayload {
    pub session_id: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPayload {
    pub session_id: String,
    /// Opaque blob; the relay never interprets its encoding.
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizePayload {
    pub session_id: String,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosePayload {
    pub session_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Everything an agent connection is allowed to say.
#[derive(Debug, Clone)]
pub enum AgentMessage {
    Register(RegisterPayload),
    Heartbeat(HeartbeatPayload),
    SessionResponse(SessionKind, SessionResponsePayload),
    Data(SessionKind, DataPayload),
    Close(SessionKind, ClosePayload),
}

/// Everything a browser connection is allowed to say.
#[derive(Debug, Clone)]
pub enum BrowserMessage {
    DevicesListRequest,
    SessionRequest(SessionKind, SessionRequestPayload),
    Data(SessionKind, DataPayload),
    Resize(ResizePayload),
    Close(SessionKind, ClosePayload),
}

/// Outcome of shape validation. `Unknown` is the forward-compatibility
/// path: a well-formed envelope whose type this relay does not know is
/// silently ignored, never an error.
#[derive(Debug)]
pub enum Decoded<T> {
    Known(T),
    Unknown,
    Invalid(String),
}

pub fn parse_envelope(text: &str) -> Result<Envelope, String> {
    let envelope: Envelope =
        serde_json::from_str(text).map_err(|err| format!("invalid message envelope: {err}"))?;
    if envelope.kind.is_empty() {
        return Err("invalid message envelope: type must be a non-empty string".to_string());
    }
    Ok(envelope)
}

fn shaped<T: DeserializeOwned>(envelope: &Envelope) -> Result<T, String> {
    let payload = envelope.payload.clone().unwrap_or(Value::Null);
    serde_json::from_value(payload)
        .map_err(|err| format!("invalid {} payload: {err}", envelope.kind))
}

fn non_empty(value: &str, field: &str, kind: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("invalid {kind} payload: {field} must be non-empty"));
    }
    Ok(())
}

pub fn decode_agent(envelope: &Envelope) -> Decoded<AgentMessage> {
    use types::*;
    let result = match envelope.kind.as_str() {
        AGENT_REGISTER => shaped::<RegisterPayload>(envelope).and_then(|payload| {
            non_empty(&payload.device_id, "deviceId", &envelope.kind)?;
            non_empty(&payload.device_name, "deviceName", &envelope.kind)?;
            Ok(AgentMessage::Register(payload))
        }),
        AGENT_HEARTBEAT => shaped::<HeartbeatPayload>(envelope).and_then(|payload| {
            non_empty(&payload.device_id, "deviceId", &envelope.kind)?;
            Ok(AgentMessage::Heartbeat(payload))
        }),
        SSH_SESSION_RESPONSE => {
            shaped(envelope).map(|p| AgentMessage::SessionResponse(SessionKind::Terminal, p))
        }
        RDP_SESSION_RESPONSE => {
            shaped(envelope).map(|p| AgentMessage::SessionResponse(SessionKind::RemoteDesktop, p))
        }
        SSH_DATA => shaped(envelope).map(|p| AgentMessage::Data(SessionKind::Terminal, p)),
        RDP_DATA => shaped(envelope).map(|p| AgentMessage::Data(SessionKind::RemoteDesktop, p)),
        SSH_CLOSE => shaped(envelope).map(|p| AgentMessage::Close(SessionKind::Terminal, p)),
        RDP_CLOSE => shaped(envelope).map(|p| AgentMessage::Close(SessionKind::RemoteDesktop, p)),
        _ => return Decoded::Unknown,
    };
    match result {
        Ok(message) => Decoded::Known(message),
        Err(err) => Decoded::Invalid(err),
    }
}

pub fn decode_browser(envelope: &Envelope) -> Decoded<BrowserMessage> {
    use types::*;
    let result = match envelope.kind.as_str() {
        DEVICES_LIST_REQUEST => Ok(BrowserMessage::DevicesListRequest),
        SSH_SESSION_REQUEST => shaped::<SessionRequestPayload>(envelope).and_then(|payload| {
            non_empty(&payload.device_id, "deviceId", &envelope.kind)?;
            Ok(BrowserMessage::SessionRequest(SessionKind::Terminal, payload))
        }),
        RDP_SESSION_REQUEST => shaped::<SessionRequestPayload>(envelope).and_then(|payload| {
            non_empty(&payload.device_id, "deviceId", &envelope.kind)?;
            Ok(BrowserMessage::SessionRequest(
                SessionKind::RemoteDesktop,
                payload,
            ))
        }),
        SSH_DATA => shaped(envelope).map(|p| BrowserMessage::Data(SessionKind::Terminal, p)),
        RDP_DATA => shaped(envelope).map(|p| BrowserMessage::Data(SessionKind::RemoteDesktop, p)),
        SSH_RESIZE => shaped(envelope).map(BrowserMessage::Resize),
        SSH_CLOSE => shaped(envelope).map(|p| BrowserMessage::Close(SessionKind::Terminal, p)),
        RDP_CLOSE => shaped(envelope).map(|p| BrowserMessage::Close(SessionKind::RemoteDesktop, p)),
        _ => return Decoded::Unknown,
    };
    match result {
        Ok(message) => Decoded::Known(message),
        Err(err) => Decoded::Invalid(err),
    }
}

// Outbound builders.

pub fn register_ack(device_id: &str) -> Envelope {
    Envelope::new(types::AGENT_REGISTER_ACK, json!({ "deviceId": device_id }))
}

pub fn heartbeat_ack(device_id: &str) -> Envelope {
    Envelope::new(types::AGENT_HEARTBEAT_ACK, json!({ "deviceId": device_id }))
}

pub fn devices_list_request() -> Envelope {
    Envelope::bare(types::DEVICES_LIST_REQUEST)
}

pub fn devices_list_response<T: Serialize>(devices: &[T]) -> Envelope {
    Envelope::new(types::DEVICES_LIST_RESPONSE, json!({ "devices": devices }))
}

pub fn error_message(message: &str) -> Envelope {
    Envelope::new(types::ERROR, json!({ "message": message }))
}

pub fn session_failure(kind: SessionKind, session_id: Option<&str>, error: &str) -> Envelope {
    let mut payload = json!({ "success": false, "error": error });
    if let (Some(id), Value::Object(map)) = (session_id, &mut payload) {
        map.insert("sessionId".to_string(), Value::String(id.to_string()));
    }
    Envelope::new(kind.response_type(), payload)
}

pub fn close_notice(kind: SessionKind, session_id: &str, reason: &str) -> Envelope {
    Envelope::new(
        kind.close_type(),
        json!({ "sessionId": session_id, "reason": reason }),
    )
}

pub fn data_message(kind: SessionKind, session_id: &str, data: &str) -> Envelope {
    Envelope::new(
        kind.data_type(),
        json!({ "sessionId": session_id, "data": data }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(kind: &str, payload: Value) -> Envelope {
        Envelope::new(kind, payload)
    }

    #[test]
    fn rejects_unparsable_input() {
        assert!(parse_envelope("not json").is_err());
        assert!(parse_envelope("{\"timestamp\": 1}").is_err());
        assert!(parse_envelope("{\"type\": \"x\"}").is_err());
        assert!(parse_envelope("{\"type\": \"\", \"timestamp\": 1}").is_err());
    }

    #[test]
    fn accepts_fractional_timestamps() {
        let envelope = parse_envelope("{\"type\": \"agent:heartbeat\", \"timestamp\": 1.5e12}");
        assert!(envelope.is_ok());
    }

    #[test]
    fn unknown_types_are_not_errors() {
        let env = envelope("future:thing", json!({}));
        assert!(matches!(decode_agent(&env), Decoded::Unknown));
        assert!(matches!(decode_browser(&env), Decoded::Unknown));
    }

    #[test]
    fn role_sets_are_disjoint_where_it_matters() {
        // A browser-only type arriving on an agent connection is ignored,
        // not an error.
        let env = envelope(types::SSH_RESIZE, json!({"sessionId": "s", "cols": 1, "rows": 1}));
        assert!(matches!(decode_agent(&env), Decoded::Unknown));
    }

    #[test]
    fn register_requires_device_fields() {
        let env = envelope(types::AGENT_REGISTER, json!({ "deviceName": "pi" }));
        let Decoded::Invalid(message) = decode_agent(&env) else {
            panic!("expected invalid");
        };
        assert!(message.contains("deviceId"));

        let env = envelope(
            types::AGENT_REGISTER,
            json!({ "deviceId": " ", "deviceName": "pi" }),
        );
        assert!(matches!(decode_agent(&env), Decoded::Invalid(_)));
    }

    #[test]
    fn register_decodes_capabilities() {
        let env = envelope(
            types::AGENT_REGISTER,
            json!({
                "deviceId": "pi-1",
                "deviceName": "pi",
                "capabilities": { "ssh": true, "rdp": true }
            }),
        );
        let Decoded::Known(AgentMessage::Register(payload)) = decode_agent(&env) else {
            panic!("expected register");
        };
        assert!(payload.capabilities.supports(SessionKind::Terminal));
        assert!(payload.capabilities.supports(SessionKind::RemoteDesktop));
    }

    #[test]
    fn capabilities_omit_rdp_when_absent() {
        let caps = Capabilities { ssh: true, rdp: false };
        assert_eq!(serde_json::to_value(caps).unwrap(), json!({ "ssh": true }));
    }

    #[test]
    fn session_request_keeps_caller_session_id_optional() {
        let env = envelope(types::SSH_SESSION_REQUEST, json!({ "deviceId": "pi-1" }));
        let Decoded::Known(BrowserMessage::SessionRequest(kind, payload)) = decode_browser(&env)
        else {
            panic!("expected session request");
        };
        assert_eq!(kind, SessionKind::Terminal);
        assert!(payload.session_id.is_none());
    }

    #[test]
    fn resize_requires_numeric_dimensions() {
        let env = envelope(
            types::SSH_RESIZE,
            json!({ "sessionId": "s1", "cols": "eighty", "rows": 24 }),
        );
        assert!(matches!(decode_browser(&env), Decoded::Invalid(_)));
    }

    #[test]
    fn data_payload_is_opaque() {
        let env = envelope(
            types::RDP_DATA,
            json!({ "sessionId": "s1", "data": "4.sync;" }),
        );
        let Decoded::Known(BrowserMessage::Data(kind, payload)) = decode_browser(&env) else {
            panic!("expected data");
        };
        assert_eq!(kind, SessionKind::RemoteDesktop);
        assert_eq!(payload.data, "4.sync;");
    }

    #[test]
    fn close_reason_defaults_at_the_dispatch_layer_not_here() {
        let env = envelope(types::SSH_CLOSE, json!({ "sessionId": "s1" }));
        let Decoded::Known(BrowserMessage::Close(_, payload)) = decode_browser(&env) else {
            panic!("expected close");
        };
        assert!(payload.reason.is_none());
    }
}
