//! Live connection tracking: one entry per connected agent (keyed by device
//! id) and per connected browser (keyed by a generated id). This is the only
//! process-wide mutable state holding actual transport handles.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Instant;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{Capabilities, Envelope};

/// Commands consumed by a socket's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    Frame(Envelope),
    Ping,
    Close { reason: String },
}

pub type OutboundTx = mpsc::UnboundedSender<Outbound>;

#[derive(Clone)]
pub struct AgentConnection {
    pub device_id: String,
    pub device_name: String,
    pub ip_address: String,
    pub capabilities: Capabilities,
    pub tx: OutboundTx,
    pub connected_at: DateTime<Utc>,
    /// Updated only by heartbeat messages, never by data traffic.
    pub last_heartbeat: Instant,
}

#[derive(Clone)]
pub struct BrowserConnection {
    pub id: String,
    pub tx: OutboundTx,
    pub connected_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct Registry {
    agents: DashMap<String, AgentConnection>,
    browsers: DashMap<String, BrowserConnection>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace-or-insert. A prior connection for the same device id is told
    /// to close before the new one becomes authoritative, so at most one
    /// transport is ever current per device.
    pub fn register_agent(&self, connection: AgentConnection) {
        if let Some((_, previous)) = self.agents.remove(&connection.device_id) {
            let _ = previous.tx.send(Outbound::Close {
                reason: "Replaced by a newer connection".to_string(),
            });
        }
        self.agents.insert(connection.device_id.clone(), connection);
    }

    pub fn register_browser(&self, tx: OutboundTx) -> String {
        let id = Uuid::new_v4().to_string();
        self.browsers.insert(
            id.clone(),
            BrowserConnection {
                id: id.clone(),
                tx,
                connected_at: Utc::now(),
            },
        );
        id
    }

    pub fn agent(&self, device_id: &str) -> Option<AgentConnection> {
        self.agents.get(device_id).map(|entry| entry.value().clone())
    }

    pub fn browser(&self, id: &str) -> Option<BrowserConnection> {
        self.browsers.get(id).map(|entry| entry.value().clone())
    }

    pub fn remove_agent(&self, device_id: &str) -> Option<AgentConnection> {
        self.agents.remove(device_id).map(|(_, connection)| connection)
    }

    pub fn remove_browser(&self, id: &str) -> Option<BrowserConnection> {
        self.browsers.remove(id).map(|(_, connection)| connection)
    }

    /// Refresh a device's heartbeat timestamp. False for unknown devices.
    pub fn touch_agent(&self, device_id: &str) -> bool {
        match self.agents.get_mut(device_id) {
            Some(mut entry) => {
                entry.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn agents(&self) -> Vec<AgentConnection> {
        self.agents.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn browsers(&self) -> Vec<BrowserConnection> {
        self.browsers.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn browser_count(&self) -> usize {
        self.browsers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn agent(device_id: &str, tx: OutboundTx) -> AgentConnection {
        AgentConnection {
            device_id: device_id.to_string(),
            device_name: device_id.to_string(),
            ip_address: "10.0.0.1".to_string(),
            capabilities: Capabilities { ssh: true, rdp: false },
            tx,
            connected_at: Utc::now(),
            last_heartbeat: Instant::now(),
        }
    }

    fn channel() -> (OutboundTx, UnboundedReceiver<Outbound>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn reregistration_closes_the_prior_transport() {
        let registry = Registry::new();
        let (old_tx, mut old_rx) = channel();
        let (new_tx, _new_rx) = channel();

        registry.register_agent(agent("pi-1", old_tx));
        registry.register_agent(agent("pi-1", new_tx.clone()));

        let Ok(Outbound::Close { reason }) = old_rx.try_recv() else {
            panic!("expected close on the replaced transport");
        };
        assert!(reason.contains("Replaced"));

        // Exactly one connection is current, and it is the new one.
        assert_eq!(registry.agent_count(), 1);
        assert!(registry.agent("pi-1").unwrap().tx.same_channel(&new_tx));
    }

    #[test]
    fn touch_is_ignored_for_unknown_devices() {
        let registry = Registry::new();
        assert!(!registry.touch_agent("ghost"));

        let (tx, _rx) = channel();
        registry.register_agent(agent("pi-1", tx));
        assert!(registry.touch_agent("pi-1"));
    }

    #[test]
    fn browser_ids_are_unique_and_removable() {
        let registry = Registry::new();
        let (tx_a, _rx_a) = channel();
        let (tx_b, _rx_b) = channel();

        let a = registry.register_browser(tx_a);
        let b = registry.register_browser(tx_b);
        assert_ne!(a, b);
        assert_eq!(registry.browser_count(), 2);

        assert!(registry.remove_browser(&a).is_some());
        assert!(registry.browser(&a).is_none());
        assert!(registry.browser(&b).is_some());
    }
}
