//! WebSocket transport: connection classification, the per-socket writer
//! task, the receive loop, keep-alive pings, and disconnect cleanup.
//!
//! Messages from one connection are handled strictly in order by its
//! receive loop; connections interleave freely against each other.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::presence;
use crate::protocol::{self, AgentMessage, BrowserMessage, Decoded, Envelope, SessionKind};
use crate::proxy::{self, Endpoint, ProxyDispatch};
use crate::registry::{AgentConnection, Outbound, OutboundTx, Registry};
use crate::session::SessionManager;

/// Everything the relay owns, explicitly constructed and passed around; no
/// ambient singletons.
pub struct RelayState {
    pub config: Config,
    pub registry: Registry,
    pub sessions: SessionManager,
    pub terminal: ProxyDispatch,
    pub remote_desktop: ProxyDispatch,
    pub started_at: Instant,
}

impl RelayState {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: Registry::new(),
            sessions: SessionManager::new(),
            terminal: ProxyDispatch::new(SessionKind::Terminal),
            remote_desktop: ProxyDispatch::new(SessionKind::RemoteDesktop),
            started_at: Instant::now(),
        })
    }

    pub fn dispatcher(&self, kind: SessionKind) -> &ProxyDispatch {
        match kind {
            SessionKind::Terminal => &self.terminal,
            SessionKind::RemoteDesktop => &self.remote_desktop,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Agent,
    Browser,
}

impl Role {
    /// Classify a connection from its `role` query parameter. Anything but
    /// an explicit, recognized value falls back to browser.
    pub fn classify(raw: Option<&str>) -> Self {
        match raw {
            Some("agent") => Role::Agent,
            Some("browser") => Role::Browser,
            Some(other) => {
                warn!(role = %other, "unrecognized role, defaulting to browser");
                Role::Browser
            }
            None => {
                warn!("connection without role parameter, defaulting to browser");
                Role::Browser
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    role: Option<String>,
}

/// Per-socket identity, fixed at upgrade for browsers and established by a
/// registration message for agents.
enum ConnIdentity {
    Browser { id: String },
    Agent { device_id: Option<String> },
}

pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<RelayState>>,
) -> Response {
    let role = Role::classify(query.role.as_deref());
    ws.on_upgrade(move |socket| handle_socket(socket, role, state, remote_addr))
}

async fn handle_socket(
    socket: WebSocket,
    role: Role,
    state: Arc<RelayState>,
    remote_addr: SocketAddr,
) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    // Writer task: the only place that touches the sink. Sends never block
    // the relay; a dead socket just ends the task.
    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Frame(envelope) => {
                    let Ok(json) = serde_json::to_string(&envelope) else {
                        continue;
                    };
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Outbound::Ping => {
                    if sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { reason } => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // Keep-alive probing runs on its own timer per transport, decoupled
    // from device and session liveness.
    let ping_tx = tx.clone();
    let ping_interval = state.config.ping_interval;
    let pinger = tokio::spawn(async move {
        let mut interval = tokio::time::interval(ping_interval);
        interval.tick().await;
        loop {
            interval.tick().await;
            if ping_tx.send(Outbound::Ping).is_err() {
                break;
            }
        }
    });

    let mut identity = match role {
        Role::Browser => {
            let id = state.registry.register_browser(tx.clone());
            info!(browser = %id, addr = %remote_addr, "browser connected");
            ConnIdentity::Browser { id }
        }
        Role::Agent => ConnIdentity::Agent { device_id: None },
    };

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(addr = %remote_addr, "websocket error: {err}");
                break;
            }
        };
        match frame {
            Message::Text(text) => {
                handle_text(&state, &mut identity, &tx, &text, remote_addr).await;
            }
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => handle_text(&state, &mut identity, &tx, &text, remote_addr).await,
                Err(_) => debug!(addr = %remote_addr, "ignoring non-utf8 binary frame"),
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    pinger.abort();
    match identity {
        ConnIdentity::Browser { id } => {
            state.registry.remove_browser(&id);
            proxy::handle_browser_disconnect(&state, &id).await;
            info!(browser = %id, "browser disconnected");
        }
        ConnIdentity::Agent {
            device_id: Some(device_id),
        } => {
            // Only the currently registered transport cleans up; a socket
            // that was replaced must not tear down its successor.
            let current = state
                .registry
                .agent(&device_id)
                .map(|agent| agent.tx.same_channel(&tx))
                .unwrap_or(false);
            if current {
                state.registry.remove_agent(&device_id);
                proxy::handle_agent_disconnect(&state, &device_id).await;
                presence::broadcast_device_list(&state);
                info!(device = %device_id, "agent disconnected");
            } else {
                debug!(device = %device_id, "replaced agent socket closed");
            }
        }
        ConnIdentity::Agent { device_id: None } => {
            debug!(addr = %remote_addr, "unregistered agent socket closed");
        }
    }
    drop(tx);
    // Sender clones may survive inside sessions that outlived this socket;
    // the sink is gone, so the writer has nothing left to do.
    writer.abort();
}

async fn handle_text(
    state: &RelayState,
    identity: &mut ConnIdentity,
    tx: &OutboundTx,
    text: &str,
    remote_addr: SocketAddr,
) {
    let envelope = match protocol::parse_envelope(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            debug!(addr = %remote_addr, "dropping malformed message: {err}");
            let _ = tx.send(Outbound::Frame(protocol::error_message(&err)));
            return;
        }
    };
    match identity {
        ConnIdentity::Browser { id } => {
            let browser_id = id.clone();
            handle_browser_message(state, &browser_id, tx, &envelope).await;
        }
        ConnIdentity::Agent { device_id } => {
            handle_agent_message(state, device_id, tx, &envelope, remote_addr).await;
        }
    }
}

async fn handle_agent_message(
    state: &RelayState,
    device_id: &mut Option<String>,
    tx: &OutboundTx,
    envelope: &Envelope,
    remote_addr: SocketAddr,
) {
    let message = match protocol::decode_agent(envelope) {
        Decoded::Known(message) => message,
        Decoded::Unknown => {
            debug!(kind = %envelope.kind, "ignoring unrecognized agent message");
            return;
        }
        Decoded::Invalid(err) => {
            warn!(kind = %envelope.kind, "invalid agent message: {err}");
            let _ = tx.send(Outbound::Frame(protocol::error_message(&err)));
            return;
        }
    };

    match message {
        AgentMessage::Register(register) => {
            let connection = AgentConnection {
                device_id: register.device_id.clone(),
                device_name: register.device_name,
                ip_address: register
                    .ip_address
                    .unwrap_or_else(|| remote_addr.ip().to_string()),
                capabilities: register.capabilities,
                tx: tx.clone(),
                connected_at: Utc::now(),
                last_heartbeat: Instant::now(),
            };
            state.registry.register_agent(connection);
            *device_id = Some(register.device_id.clone());
            let _ = tx.send(Outbound::Frame(protocol::register_ack(&register.device_id)));
            info!(device = %register.device_id, addr = %remote_addr, "agent registered");
            presence::broadcast_device_list(state);
        }
        AgentMessage::Heartbeat(heartbeat) => {
            if state.registry.touch_agent(&heartbeat.device_id) {
                let _ = tx.send(Outbound::Frame(protocol::heartbeat_ack(
                    &heartbeat.device_id,
                )));
            } else {
                debug!(device = %heartbeat.device_id, "heartbeat for unknown device");
            }
        }
        relayed => {
            let Some(device_id) = device_id.as_deref() else {
                debug!(addr = %remote_addr, kind = %envelope.kind, "dropping message from unregistered agent socket");
                return;
            };
            match relayed {
                AgentMessage::SessionResponse(kind, response) => {
                    state
                        .dispatcher(kind)
                        .handle_session_response(state, device_id, response, envelope)
                        .await;
                }
                AgentMessage::Data(kind, data) => {
                    state
                        .dispatcher(kind)
                        .handle_agent_data(state, device_id, data, envelope)
                        .await;
                }
                AgentMessage::Close(kind, close) => {
                    state
                        .dispatcher(kind)
                        .handle_close(state, Endpoint::Agent, device_id, close)
                        .await;
                }
                AgentMessage::Register(_) | AgentMessage::Heartbeat(_) => {}
            }
        }
    }
}

async fn handle_browser_message(
    state: &RelayState,
    browser_id: &str,
    tx: &OutboundTx,
    envelope: &Envelope,
) {
    let message = match protocol::decode_browser(envelope) {
        Decoded::Known(message) => message,
        Decoded::Unknown => {
            debug!(kind = %envelope.kind, "ignoring unrecognized browser message");
            return;
        }
        Decoded::Invalid(err) => {
            warn!(kind = %envelope.kind, "invalid browser message: {err}");
            let _ = tx.send(Outbound::Frame(protocol::error_message(&err)));
            return;
        }
    };

    match message {
        BrowserMessage::DevicesListRequest => {
            let devices = presence::device_list(state);
            let _ = tx.send(Outbound::Frame(protocol::devices_list_response(&devices)));
        }
        BrowserMessage::SessionRequest(kind, request) => {
            state
                .dispatcher(kind)
                .handle_session_request(state, browser_id, request, envelope)
                .await;
        }
        BrowserMessage::Data(kind, data) => {
            state
                .dispatcher(kind)
                .handle_browser_data(state, browser_id, data, envelope)
                .await;
        }
        BrowserMessage::Resize(resize) => {
            state
                .terminal
                .handle_resize(state, browser_id, resize, envelope)
                .await;
        }
        BrowserMessage::Close(kind, close) => {
            state
                .dispatcher(kind)
                .handle_close(state, Endpoint::Browser, browser_id, close)
                .await;
        }
    }
}
