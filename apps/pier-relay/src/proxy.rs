//! Per-session-kind dispatch: routes validated messages between the two
//! endpoints of a session and performs cascading close on disconnect.
//!
//! Both dispatcher instances (terminal, remote-desktop) share this shape;
//! only the remote-desktop one carries tunnel state for the instruction
//! framer. Referential misses (a session id no index knows) are logged and
//! dropped; they are races with a concurrent close, not protocol errors.

use std::collections::HashMap;

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, warn};

use guac_wire::{Tunnel, TunnelEvent};

use crate::protocol::{
    self, ClosePayload, DataPayload, Envelope, ResizePayload, SessionKind, SessionRequestPayload,
    SessionResponsePayload,
};
use crate::registry::Outbound;
use crate::session::{Session, SessionStatus, TerminalSize};
use crate::websocket::RelayState;

pub const DEFAULT_CLOSE_REASON: &str = "Session closed";
pub const BROWSER_GONE_REASON: &str = "Browser disconnected";
pub const AGENT_GONE_REASON: &str = "Agent disconnected";

/// Which side of a session a message came from (or should be notified).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Agent,
    Browser,
}

impl Endpoint {
    fn opposite(self) -> Self {
        match self {
            Endpoint::Agent => Endpoint::Browser,
            Endpoint::Browser => Endpoint::Agent,
        }
    }
}

pub struct ProxyDispatch {
    kind: SessionKind,
    /// Connection parameters stashed between session request and response;
    /// remote-desktop only.
    pending: DashMap<String, HashMap<String, String>>,
    /// One tunnel per active remote-desktop session.
    tunnels: DashMap<String, Tunnel>,
}

impl ProxyDispatch {
    pub fn new(kind: SessionKind) -> Self {
        Self {
            kind,
            pending: DashMap::new(),
            tunnels: DashMap::new(),
        }
    }

    /// Browser asked for a session against a device. Any failure is answered
    /// with a typed error to the requesting browser and nothing else; on
    /// success the request is forwarded to the agent, or the just-created
    /// session is torn down again if the agent transport is already gone.
    pub async fn handle_session_request(
        &self,
        state: &RelayState,
        browser_id: &str,
        request: SessionRequestPayload,
        raw: &Envelope,
    ) {
        let Some(browser) = state.registry.browser(browser_id) else {
            // The requester raced its own disconnect; nobody left to answer.
            debug!(browser = %browser_id, "session request from unknown browser");
            return;
        };

        let session = match state
            .sessions
            .create(
                &state.registry,
                self.kind,
                &request.device_id,
                browser_id,
                request.session_id.clone(),
            )
            .await
        {
            Ok(session) => session,
            Err(err) => {
                warn!(device = %request.device_id, %err, "session request rejected");
                let reply =
                    protocol::session_failure(self.kind, request.session_id.as_deref(), &err.to_string());
                let _ = browser.tx.send(Outbound::Frame(reply));
                return;
            }
        };

        let forward = Envelope {
            kind: raw.kind.clone(),
            timestamp: raw.timestamp.clone(),
            payload: Some(with_session_id(raw.payload.clone(), &session.id)),
        };
        if session.agent_tx.send(Outbound::Frame(forward)).is_err() {
            // Agent transport dropped between the registry check and now.
            state.sessions.close(&session.id, "Agent unavailable").await;
            let reply =
                protocol::session_failure(self.kind, Some(&session.id), "Agent unavailable");
            let _ = browser.tx.send(Outbound::Frame(reply));
            return;
        }

        if self.kind == SessionKind::RemoteDesktop {
            self.pending
                .insert(session.id.clone(), connection_settings(raw.payload.as_ref()));
        }
        debug!(session = %session.id, device = %session.device_id, "session requested");
    }

    /// Agent answered a session request. Success activates the session and
    /// forwards the response; failure closes it and relays the decline
    /// reason verbatim.
    pub async fn handle_session_response(
        &self,
        state: &RelayState,
        device_id: &str,
        response: SessionResponsePayload,
        raw: &Envelope,
    ) {
        let Some(session) = state.sessions.get(&response.session_id).await else {
            debug!(session = %response.session_id, "response for unknown session");
            return;
        };
        if session.device_id != device_id {
            debug!(session = %response.session_id, device = %device_id, "response from wrong device");
            return;
        }

        if response.success {
            state
                .sessions
                .set_status(&response.session_id, SessionStatus::Active)
                .await;
            let _ = session.browser_tx.send(Outbound::Frame(raw.clone()));
            if self.kind == SessionKind::RemoteDesktop {
                self.start_tunnel(&session);
            }
        } else {
            state
                .sessions
                .close(&response.session_id, response.error.as_deref().unwrap_or("rejected"))
                .await;
            self.forget_session(&response.session_id);
            let _ = session.browser_tx.send(Outbound::Frame(raw.clone()));
        }
    }

    /// Open the instruction tunnel for a freshly activated remote-desktop
    /// session: the select instruction goes to the agent as ordinary session
    /// data, and the handshake runs inside the tunnel from here on.
    fn start_tunnel(&self, session: &Session) {
        let mut settings = self
            .pending
            .remove(&session.id)
            .map(|(_, settings)| settings)
            .unwrap_or_default();
        let protocol_name = settings
            .remove("protocol")
            .unwrap_or_else(|| "rdp".to_string());
        let (tunnel, select) = Tunnel::new(&protocol_name, settings);
        self.tunnels.insert(session.id.clone(), tunnel);
        let _ = session.agent_tx.send(Outbound::Frame(protocol::data_message(
            self.kind,
            &session.id,
            &select,
        )));
    }

    /// Data from the browser side, forwarded verbatim to the agent.
    pub async fn handle_browser_data(
        &self,
        state: &RelayState,
        browser_id: &str,
        data: DataPayload,
        raw: &Envelope,
    ) {
        let Some(session) = state.sessions.get(&data.session_id).await else {
            debug!(session = %data.session_id, "data for unknown session");
            return;
        };
        if session.browser_id != browser_id {
            debug!(session = %data.session_id, "data from wrong browser");
            return;
        }
        let _ = session.agent_tx.send(Outbound::Frame(raw.clone()));
    }

    /// Data from the agent side. Terminal output is forwarded verbatim;
    /// remote-desktop output is re-segmented into whole instructions by the
    /// session's tunnel, which also consumes the connect handshake.
    pub async fn handle_agent_data(
        &self,
        state: &RelayState,
        device_id: &str,
        data: DataPayload,
        raw: &Envelope,
    ) {
        let Some(session) = state.sessions.get(&data.session_id).await else {
            debug!(session = %data.session_id, "data for unknown session");
            return;
        };
        if session.device_id != device_id {
            debug!(session = %data.session_id, "data from wrong device");
            return;
        }

        let Some(mut tunnel) = self.tunnels.get_mut(&data.session_id) else {
            let _ = session.browser_tx.send(Outbound::Frame(raw.clone()));
            return;
        };
        match tunnel.feed(&data.data) {
            Ok(events) => {
                for event in events {
                    match event {
                        TunnelEvent::Send(text) => {
                            let _ = session.agent_tx.send(Outbound::Frame(
                                protocol::data_message(self.kind, &session.id, &text),
                            ));
                        }
                        TunnelEvent::Deliver(instruction) => {
                            let _ = session.browser_tx.send(Outbound::Frame(
                                protocol::data_message(
                                    self.kind,
                                    &session.id,
                                    &instruction.encode(),
                                ),
                            ));
                        }
                    }
                }
            }
            Err(err) => {
                drop(tunnel);
                warn!(session = %session.id, %err, "malformed remote-desktop stream");
                self.teardown(state, &session, "Malformed remote-desktop stream", Endpoint::Browser)
                    .await;
                let _ = session.agent_tx.send(Outbound::Frame(protocol::close_notice(
                    self.kind,
                    &session.id,
                    "Malformed remote-desktop stream",
                )));
            }
        }
    }

    /// Terminal-only: record the new size and forward to the agent.
    pub async fn handle_resize(
        &self,
        state: &RelayState,
        browser_id: &str,
        resize: ResizePayload,
        raw: &Envelope,
    ) {
        let Some(session) = state.sessions.get(&resize.session_id).await else {
            debug!(session = %resize.session_id, "resize for unknown session");
            return;
        };
        if session.browser_id != browser_id {
            debug!(session = %resize.session_id, "resize from wrong browser");
            return;
        }
        state
            .sessions
            .set_terminal_size(
                &resize.session_id,
                TerminalSize {
                    cols: resize.cols,
                    rows: resize.rows,
                },
            )
            .await;
        let _ = session.agent_tx.send(Outbound::Frame(raw.clone()));
    }

    /// Explicit close from either side: close the session and notify the
    /// other endpoint with the carried reason (or the default).
    pub async fn handle_close(
        &self,
        state: &RelayState,
        from: Endpoint,
        owner_id: &str,
        close: ClosePayload,
    ) {
        let Some(session) = state.sessions.get(&close.session_id).await else {
            debug!(session = %close.session_id, "close for unknown session");
            return;
        };
        let owned = match from {
            Endpoint::Browser => session.browser_id == owner_id,
            Endpoint::Agent => session.device_id == owner_id,
        };
        if !owned {
            debug!(session = %close.session_id, "close from non-owner");
            return;
        }
        let reason = close.reason.as_deref().unwrap_or(DEFAULT_CLOSE_REASON);
        self.teardown(state, &session, reason, from.opposite()).await;
    }

    /// Close one session and notify the surviving endpoint. Safe to race:
    /// whoever wins the index removal sends the single notification.
    pub async fn teardown(
        &self,
        state: &RelayState,
        session: &Session,
        reason: &str,
        notify: Endpoint,
    ) {
        if state.sessions.close(&session.id, reason).await.is_none() {
            return;
        }
        self.forget_session(&session.id);
        let notice = protocol::close_notice(self.kind, &session.id, reason);
        let tx = match notify {
            Endpoint::Agent => &session.agent_tx,
            Endpoint::Browser => &session.browser_tx,
        };
        let _ = tx.send(Outbound::Frame(notice));
    }

    fn forget_session(&self, session_id: &str) {
        self.pending.remove(session_id);
        self.tunnels.remove(session_id);
    }
}

/// Browser transport went away: close everything it owned and tell the
/// agents on the far side.
pub async fn handle_browser_disconnect(state: &RelayState, browser_id: &str) {
    for session in state.sessions.by_browser(browser_id).await {
        state
            .dispatcher(session.kind)
            .teardown(state, &session, BROWSER_GONE_REASON, Endpoint::Agent)
            .await;
    }
}

/// Agent transport went away (voluntarily or evicted as stale): close every
/// session against its device and tell the browsers.
pub async fn handle_agent_disconnect(state: &RelayState, device_id: &str) {
    for session in state.sessions.by_device(device_id).await {
        state
            .dispatcher(session.kind)
            .teardown(state, &session, AGENT_GONE_REASON, Endpoint::Browser)
            .await;
    }
}

/// Forward payload with the (possibly generated) session id filled in;
/// everything else, credentials included, passes through untouched.
fn with_session_id(payload: Option<Value>, session_id: &str) -> Value {
    let mut payload = payload.unwrap_or_else(|| Value::Object(Default::default()));
    if let Value::Object(map) = &mut payload {
        map.insert(
            "sessionId".to_string(),
            Value::String(session_id.to_string()),
        );
    }
    payload
}

/// Scalar payload fields become handshake connection parameters; ids are
/// routing concerns, not parameters.
fn connection_settings(payload: Option<&Value>) -> HashMap<String, String> {
    let mut settings = HashMap::new();
    if let Some(Value::Object(fields)) = payload {
        for (key, value) in fields {
            if key == "sessionId" || key == "deviceId" {
                continue;
            }
            match value {
                Value::String(text) => {
                    settings.insert(key.clone(), text.clone());
                }
                Value::Number(number) => {
                    settings.insert(key.clone(), number.to_string());
                }
                Value::Bool(flag) => {
                    settings.insert(key.clone(), flag.to_string());
                }
                _ => {}
            }
        }
    }
    settings
}
