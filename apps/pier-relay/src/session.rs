//! Session records and the three-index table that owns them.
//!
//! Sessions are indexed by id, by owning browser, and by owning device. The
//! three indexes live behind one lock so every create and close mutates all
//! of them in a single step; a concurrent handler calling `get` after a
//! close observes the session absent everywhere.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::protocol::SessionKind;
use crate::registry::{OutboundTx, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Active,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// One relayed stream, bound to exactly one browser and one agent. The
/// transport handles are captured at creation; a transport dropping later
/// does not invalidate the record; the disconnect handlers clean up.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub kind: SessionKind,
    pub device_id: String,
    pub browser_id: String,
    pub agent_tx: OutboundTx,
    pub browser_tx: OutboundTx,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub terminal_size: Option<TerminalSize>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("no connected agent for device {0}")]
    NoAgentTransport(String),
    #[error("unknown browser connection {0}")]
    NoBrowserTransport(String),
    #[error("session {0} already exists")]
    DuplicateSession(String),
}

#[derive(Default)]
struct SessionTable {
    by_id: HashMap<String, Session>,
    by_browser: HashMap<String, HashSet<String>>,
    by_device: HashMap<String, HashSet<String>>,
}

#[derive(Default)]
pub struct SessionManager {
    table: RwLock<SessionTable>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session between `browser_id` and the agent for `device_id`.
    /// Both endpoints must be registered right now; a caller-supplied id is
    /// trusted only after the duplicate check. Failure never mutates state.
    pub async fn create(
        &self,
        registry: &Registry,
        kind: SessionKind,
        device_id: &str,
        browser_id: &str,
        session_id: Option<String>,
    ) -> Result<Session, SessionError> {
        let agent = registry
            .agent(device_id)
            .ok_or_else(|| SessionError::NoAgentTransport(device_id.to_string()))?;
        let browser = registry
            .browser(browser_id)
            .ok_or_else(|| SessionError::NoBrowserTransport(browser_id.to_string()))?;
        let id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut table = self.table.write().await;
        if table.by_id.contains_key(&id) {
            return Err(SessionError::DuplicateSession(id));
        }

        let session = Session {
            id: id.clone(),
            kind,
            device_id: device_id.to_string(),
            browser_id: browser_id.to_string(),
            agent_tx: agent.tx,
            browser_tx: browser.tx,
            status: SessionStatus::Connecting,
            created_at: Utc::now(),
            terminal_size: match kind {
                SessionKind::Terminal => Some(TerminalSize::default()),
                SessionKind::RemoteDesktop => None,
            },
        };
        table.by_id.insert(id.clone(), session.clone());
        table
            .by_browser
            .entry(browser_id.to_string())
            .or_default()
            .insert(id.clone());
        table
            .by_device
            .entry(device_id.to_string())
            .or_default()
            .insert(id);
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Option<Session> {
        self.table.read().await.by_id.get(session_id).cloned()
    }

    pub async fn by_browser(&self, browser_id: &str) -> Vec<Session> {
        let table = self.table.read().await;
        collect(&table, table.by_browser.get(browser_id))
    }

    pub async fn by_device(&self, device_id: &str) -> Vec<Session> {
        let table = self.table.read().await;
        collect(&table, table.by_device.get(device_id))
    }

    /// Idempotent close: removes the session from all three indexes before
    /// returning. Closing an absent session is a no-op, not an error.
    pub async fn close(&self, session_id: &str, reason: &str) -> Option<Session> {
        let mut table = self.table.write().await;
        let session = table.by_id.remove(session_id)?;
        detach(&mut table.by_browser, &session.browser_id, session_id);
        detach(&mut table.by_device, &session.device_id, session_id);
        debug!(session = %session_id, %reason, "session removed");
        Some(session)
    }

    pub async fn set_status(&self, session_id: &str, status: SessionStatus) -> bool {
        let mut table = self.table.write().await;
        match table.by_id.get_mut(session_id) {
            Some(session) => {
                session.status = status;
                true
            }
            None => false,
        }
    }

    pub async fn set_terminal_size(&self, session_id: &str, size: TerminalSize) -> bool {
        let mut table = self.table.write().await;
        match table.by_id.get_mut(session_id) {
            Some(session) => {
                session.terminal_size = Some(size);
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.by_id.len()
    }

    /// Live session ids as seen by each index, for consistency assertions.
    #[cfg(test)]
    async fn index_view(&self) -> (HashSet<String>, HashSet<String>, HashSet<String>) {
        let table = self.table.read().await;
        let by_id = table.by_id.keys().cloned().collect();
        let by_browser = table.by_browser.values().flatten().cloned().collect();
        let by_device = table.by_device.values().flatten().cloned().collect();
        (by_id, by_browser, by_device)
    }
}

fn collect(table: &SessionTable, ids: Option<&HashSet<String>>) -> Vec<Session> {
    ids.map(|ids| {
        ids.iter()
            .filter_map(|id| table.by_id.get(id).cloned())
            .collect()
    })
    .unwrap_or_default()
}

fn detach(index: &mut HashMap<String, HashSet<String>>, key: &str, session_id: &str) {
    if let Some(ids) = index.get_mut(key) {
        ids.remove(session_id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Capabilities;
    use tokio::sync::mpsc;

    fn registry_with(devices: &[&str], browsers: usize) -> (Registry, Vec<String>) {
        let registry = Registry::new();
        for device_id in devices {
            // The receiving half is irrelevant here; nothing sends.
            let (tx, _rx) = mpsc::unbounded_channel();
            registry.register_agent(crate::registry::AgentConnection {
                device_id: device_id.to_string(),
                device_name: device_id.to_string(),
                ip_address: "10.0.0.1".to_string(),
                capabilities: Capabilities { ssh: true, rdp: true },
                tx,
                connected_at: Utc::now(),
                last_heartbeat: std::time::Instant::now(),
            });
        }
        let mut browser_ids = Vec::new();
        for _ in 0..browsers {
            let (tx, _rx) = mpsc::unbounded_channel();
            browser_ids.push(registry.register_browser(tx));
        }
        (registry, browser_ids)
    }

    async fn assert_indexes_agree(manager: &SessionManager) {
        let (by_id, by_browser, by_device) = manager.index_view().await;
        assert_eq!(by_id, by_browser);
        assert_eq!(by_id, by_device);
    }

    #[tokio::test]
    async fn indexes_agree_across_create_close_sequences() {
        let (registry, browsers) = registry_with(&["pi-1", "pi-2"], 2);
        let manager = SessionManager::new();

        let a = manager
            .create(&registry, SessionKind::Terminal, "pi-1", &browsers[0], None)
            .await
            .unwrap();
        let b = manager
            .create(&registry, SessionKind::RemoteDesktop, "pi-2", &browsers[0], None)
            .await
            .unwrap();
        let c = manager
            .create(&registry, SessionKind::Terminal, "pi-1", &browsers[1], None)
            .await
            .unwrap();
        assert_indexes_agree(&manager).await;
        assert_eq!(manager.len().await, 3);

        manager.close(&b.id, "done").await;
        assert_indexes_agree(&manager).await;

        manager.close(&a.id, "done").await;
        manager.close(&c.id, "done").await;
        assert_indexes_agree(&manager).await;
        assert_eq!(manager.len().await, 0);
    }

    #[tokio::test]
    async fn duplicate_id_fails_without_mutation() {
        let (registry, browsers) = registry_with(&["pi-1"], 1);
        let manager = SessionManager::new();

        manager
            .create(
                &registry,
                SessionKind::Terminal,
                "pi-1",
                &browsers[0],
                Some("s1".to_string()),
            )
            .await
            .unwrap();

        let err = manager
            .create(
                &registry,
                SessionKind::RemoteDesktop,
                "pi-1",
                &browsers[0],
                Some("s1".to_string()),
            )
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::DuplicateSession("s1".to_string()));

        assert_eq!(manager.len().await, 1);
        assert_eq!(manager.get("s1").await.unwrap().kind, SessionKind::Terminal);
        assert_indexes_agree(&manager).await;
    }

    #[tokio::test]
    async fn create_requires_both_endpoints() {
        let (registry, browsers) = registry_with(&["pi-1"], 1);
        let manager = SessionManager::new();

        let err = manager
            .create(&registry, SessionKind::Terminal, "ghost", &browsers[0], None)
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::NoAgentTransport("ghost".to_string()));

        let err = manager
            .create(&registry, SessionKind::Terminal, "pi-1", "nobody", None)
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::NoBrowserTransport("nobody".to_string()));
        assert_eq!(manager.len().await, 0);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (registry, browsers) = registry_with(&["pi-1"], 1);
        let manager = SessionManager::new();

        let session = manager
            .create(&registry, SessionKind::Terminal, "pi-1", &browsers[0], None)
            .await
            .unwrap();
        assert!(manager.close(&session.id, "first").await.is_some());
        assert!(manager.close(&session.id, "second").await.is_none());
        assert!(manager.close("never-existed", "noop").await.is_none());
    }

    #[tokio::test]
    async fn terminal_sessions_carry_a_resizable_size() {
        let (registry, browsers) = registry_with(&["pi-1"], 1);
        let manager = SessionManager::new();

        let terminal = manager
            .create(&registry, SessionKind::Terminal, "pi-1", &browsers[0], None)
            .await
            .unwrap();
        assert_eq!(terminal.terminal_size, Some(TerminalSize::default()));

        manager
            .set_terminal_size(&terminal.id, TerminalSize { cols: 120, rows: 40 })
            .await;
        assert_eq!(
            manager.get(&terminal.id).await.unwrap().terminal_size,
            Some(TerminalSize { cols: 120, rows: 40 })
        );

        let rdp = manager
            .create(&registry, SessionKind::RemoteDesktop, "pi-1", &browsers[0], None)
            .await
            .unwrap();
        assert_eq!(rdp.terminal_size, None);
    }

    #[tokio::test]
    async fn lookups_are_scoped_to_their_owner() {
        let (registry, browsers) = registry_with(&["pi-1", "pi-2"], 2);
        let manager = SessionManager::new();

        manager
            .create(&registry, SessionKind::Terminal, "pi-1", &browsers[0], None)
            .await
            .unwrap();
        manager
            .create(&registry, SessionKind::Terminal, "pi-2", &browsers[0], None)
            .await
            .unwrap();
        manager
            .create(&registry, SessionKind::Terminal, "pi-2", &browsers[1], None)
            .await
            .unwrap();

        assert_eq!(manager.by_browser(&browsers[0]).await.len(), 2);
        assert_eq!(manager.by_browser(&browsers[1]).await.len(), 1);
        assert_eq!(manager.by_device("pi-2").await.len(), 2);
        assert_eq!(manager.by_device("pi-1").await.len(), 1);
        assert!(manager.by_device("ghost").await.is_empty());
    }
}
