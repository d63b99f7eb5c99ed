//! Device presence: online/offline status derived from heartbeat age, the
//! periodic staleness sweep, and device-list broadcasts to browsers.
//!
//! Status is computed at the moment of each call, never cached; the sweep
//! only exists to evict agents whose transport silently died.

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::protocol::{self, Capabilities};
use crate::proxy;
use crate::registry::Outbound;
use crate::websocket::RelayState;

pub const STALE_REASON: &str = "Stale heartbeat";

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
}

/// Read-only device view, computed on demand from the registry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub name: String,
    pub ip_address: String,
    pub status: DeviceStatus,
    pub capabilities: Capabilities,
}

/// Every registered device with its status as of right now.
pub fn device_list(state: &RelayState) -> Vec<Device> {
    let threshold = state.config.stale_threshold;
    state
        .registry
        .agents()
        .into_iter()
        .map(|agent| Device {
            id: agent.device_id,
            name: agent.device_name,
            ip_address: agent.ip_address,
            status: if agent.last_heartbeat.elapsed() > threshold {
                DeviceStatus::Offline
            } else {
                DeviceStatus::Online
            },
            capabilities: agent.capabilities,
        })
        .collect()
}

pub fn list_online(state: &RelayState) -> Vec<Device> {
    device_list(state)
        .into_iter()
        .filter(|device| device.status == DeviceStatus::Online)
        .collect()
}

/// Push a fresh device list to every connected browser.
pub fn broadcast_device_list(state: &RelayState) {
    let envelope = protocol::devices_list_response(&device_list(state));
    for browser in state.registry.browsers() {
        let _ = browser.tx.send(Outbound::Frame(envelope.clone()));
    }
}

/// One sweep pass: evict every agent whose heartbeat exceeded the threshold,
/// treating each exactly like an abrupt disconnect. Returns the eviction
/// count.
pub async fn sweep_once(state: &RelayState) -> usize {
    let threshold = state.config.stale_threshold;
    let stale: Vec<String> = state
        .registry
        .agents()
        .into_iter()
        .filter(|agent| agent.last_heartbeat.elapsed() > threshold)
        .map(|agent| agent.device_id)
        .collect();
    if stale.is_empty() {
        return 0;
    }

    for device_id in &stale {
        if let Some(agent) = state.registry.remove_agent(device_id) {
            info!(device = %device_id, "evicting stale agent");
            let _ = agent.tx.send(Outbound::Close {
                reason: STALE_REASON.to_string(),
            });
            proxy::handle_agent_disconnect(state, device_id).await;
        }
    }
    broadcast_device_list(state);
    stale.len()
}

pub fn spawn_sweeper(state: Arc<RelayState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.config.sweep_interval);
        loop {
            interval.tick().await;
            let evicted = sweep_once(&state).await;
            if evicted > 0 {
                debug!(evicted, "presence sweep evicted stale agents");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::protocol::types;
    use crate::registry::AgentConnection;
    use chrono::Utc;
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn connect_agent_with_age(
        state: &RelayState,
        device_id: &str,
        heartbeat_age: Duration,
    ) -> UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        state.registry.register_agent(AgentConnection {
            device_id: device_id.to_string(),
            device_name: device_id.to_string(),
            ip_address: "10.0.0.1".to_string(),
            capabilities: Capabilities { ssh: true, rdp: false },
            tx,
            connected_at: Utc::now(),
            last_heartbeat: Instant::now().checked_sub(heartbeat_age).unwrap(),
        });
        rx
    }

    #[tokio::test]
    async fn stale_heartbeat_reports_offline_on_the_next_listing() {
        let state = RelayState::new(Config::default());
        let _fresh = connect_agent_with_age(&state, "pi-1", Duration::ZERO);
        let _stale = connect_agent_with_age(&state, "pi-2", Duration::from_secs(120));

        let devices = device_list(&state);
        let status_of = |id: &str| devices.iter().find(|d| d.id == id).unwrap().status;
        assert_eq!(status_of("pi-1"), DeviceStatus::Online);
        assert_eq!(status_of("pi-2"), DeviceStatus::Offline);

        let online = list_online(&state);
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].id, "pi-1");
    }

    #[tokio::test]
    async fn sweep_evicts_stale_agents_and_notifies_browsers() {
        let state = RelayState::new(Config::default());
        let _fresh = connect_agent_with_age(&state, "pi-1", Duration::ZERO);
        let mut stale_rx = connect_agent_with_age(&state, "pi-2", Duration::from_secs(120));

        let (browser_tx, mut browser_rx) = mpsc::unbounded_channel();
        state.registry.register_browser(browser_tx);

        assert_eq!(sweep_once(&state).await, 1);
        assert!(state.registry.agent("pi-2").is_none());
        assert!(state.registry.agent("pi-1").is_some());

        let Ok(Outbound::Close { reason }) = stale_rx.try_recv() else {
            panic!("expected close on the stale transport");
        };
        assert_eq!(reason, STALE_REASON);

        // Browsers got a refreshed list that no longer names the evicted
        // device.
        let Ok(Outbound::Frame(envelope)) = browser_rx.try_recv() else {
            panic!("expected a device list broadcast");
        };
        assert_eq!(envelope.kind, types::DEVICES_LIST_RESPONSE);
        let devices = envelope.payload.unwrap()["devices"].clone();
        assert_eq!(devices.as_array().unwrap().len(), 1);
        assert_eq!(devices[0]["id"], "pi-1");
    }

    #[tokio::test]
    async fn sweep_cascades_session_close_like_a_disconnect() {
        let state = RelayState::new(Config::default());
        let _stale = connect_agent_with_age(&state, "pi-2", Duration::from_secs(120));

        let (browser_tx, mut browser_rx) = mpsc::unbounded_channel();
        let browser_id = state.registry.register_browser(browser_tx);
        state
            .sessions
            .create(
                &state.registry,
                crate::protocol::SessionKind::Terminal,
                "pi-2",
                &browser_id,
                Some("s1".to_string()),
            )
            .await
            .unwrap();

        sweep_once(&state).await;

        assert_eq!(state.sessions.len().await, 0);
        let Ok(Outbound::Frame(notice)) = browser_rx.try_recv() else {
            panic!("expected a close notice");
        };
        assert_eq!(notice.kind, types::SSH_CLOSE);
        assert_eq!(
            notice.payload.unwrap()["reason"],
            proxy::AGENT_GONE_REASON
        );
    }

    #[tokio::test]
    async fn sweep_without_stale_agents_is_quiet() {
        let state = RelayState::new(Config::default());
        let _fresh = connect_agent_with_age(&state, "pi-1", Duration::ZERO);
        let (browser_tx, mut browser_rx) = mpsc::unbounded_channel();
        state.registry.register_browser(browser_tx);

        assert_eq!(sweep_once(&state).await, 0);
        assert!(browser_rx.try_recv().is_err());
    }
}
