//! Connection registry.
//!
//! Tracks every live agent session known to this instance. A session moves
//! between three states:
//!
//! ```text
//!   register ──► Connected ──deregister──► Disconnected ──┐
//!                  │   ▲                                   │ grace window
//!     sweep/fault  │   │ activity                          ▼
//!                  ▼   │                                 removed
//!                 Error ────────────────────────────────────┘
//! ```
//!
//! Re-registering a known client id replaces the old session and cancels any
//! pending removal. Removal timers are plain tokio tasks tracked by client id
//! so `shutdown()` can abort them all.

use crate::envelope::{now_millis, Envelope};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Capacity of each session's outbound queue.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Capacity of the registry event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// TYPES
// ============================================================================

/// Liveness status of a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Error,
}

/// Item queued to a session's writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Envelope(Envelope),
    /// Ask the writer to close the socket.
    Close,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub client_id: String,
    pub agent_id: String,
    pub connected_at: i64,
    pub last_seen: i64,
    pub subscriptions: BTreeSet<String>,
    pub status: ConnectionStatus,
    pub metadata: Map<String, Value>,
}

/// Lifecycle notification for in-process observers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RegistryEvent {
    Connected { client_id: String, agent_id: String },
    Disconnected { client_id: String, agent_id: String },
    ClientUnhealthy { client_id: String, agent_id: String },
    ClientRecovered { client_id: String, agent_id: String },
    Removed { client_id: String, agent_id: String },
}

/// A connected session the router may deliver to.
#[derive(Debug, Clone)]
pub struct LiveSession {
    pub client_id: String,
    pub agent_id: String,
    pub epoch: u64,
    pub outbound: mpsc::Sender<Outbound>,
}

/// Session counts by status.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionCounts {
    pub total: usize,
    pub connected: usize,
    pub disconnected: usize,
    pub error: usize,
}

struct Session {
    info: Connection,
    epoch: u64,
    outbound: Option<mpsc::Sender<Outbound>>,
}

impl Session {
    fn close(&mut self) {
        if let Some(tx) = self.outbound.take() {
            let _ = tx.try_send(Outbound::Close);
        }
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Registry of sessions keyed by client id.
pub struct ConnectionRegistry {
    sessions: DashMap<String, Session>,
    removal_timers: DashMap<String, JoinHandle<()>>,
    events: broadcast::Sender<RegistryEvent>,
    grace: Duration,
    unhealthy_after_ms: i64,
    next_epoch: AtomicU64,
}

impl ConnectionRegistry {
    /// `grace` is how long a disconnected or errored session stays listed;
    /// `unhealthy_after` is the silence after which a connected session is
    /// flagged by [`sweep_health`](Self::sweep_health).
    pub fn new(grace: Duration, unhealthy_after: Duration) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            sessions: DashMap::new(),
            removal_timers: DashMap::new(),
            events,
            grace,
            unhealthy_after_ms: unhealthy_after.as_millis() as i64,
            next_epoch: AtomicU64::new(1),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Insert a session and queue the `connected` system envelope to it.
    /// Returns the session epoch used by the `*_session` variants below.
    pub fn register(
        &self,
        client_id: &str,
        agent_id: &str,
        metadata: Map<String, Value>,
        outbound: mpsc::Sender<Outbound>,
    ) -> u64 {
        self.cancel_removal(client_id);

        let now = now_millis();
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let session = Session {
            info: Connection {
                client_id: client_id.to_string(),
                agent_id: agent_id.to_string(),
                connected_at: now,
                last_seen: now,
                subscriptions: BTreeSet::new(),
                status: ConnectionStatus::Connected,
                metadata,
            },
            epoch,
            outbound: Some(outbound.clone()),
        };

        if let Some(mut previous) = self.sessions.insert(client_id.to_string(), session) {
            debug!(client_id = %client_id, "Replacing existing session");
            previous.close();
        }

        if let Err(e) = outbound.try_send(Outbound::Envelope(Envelope::connected(agent_id, client_id))) {
            warn!(client_id = %client_id, error = %e, "Failed to queue connected envelope");
        }

        info!(client_id = %client_id, agent_id = %agent_id, "Client connected");
        self.emit(RegistryEvent::Connected {
            client_id: client_id.to_string(),
            agent_id: agent_id.to_string(),
        });
        epoch
    }

    /// Mark a session disconnected and schedule its removal.
    pub fn deregister(self: &Arc<Self>, client_id: &str) -> bool {
        self.transition(client_id, None, ConnectionStatus::Disconnected)
    }

    /// Like [`deregister`](Self::deregister) but ignored if the client id has
    /// since been re-registered.
    pub fn deregister_session(self: &Arc<Self>, client_id: &str, epoch: u64) -> bool {
        self.transition(client_id, Some(epoch), ConnectionStatus::Disconnected)
    }

    /// Mark a session errored and schedule its removal.
    pub fn mark_error(self: &Arc<Self>, client_id: &str) -> bool {
        self.transition(client_id, None, ConnectionStatus::Error)
    }

    pub fn mark_session_error(self: &Arc<Self>, client_id: &str, epoch: u64) -> bool {
        self.transition(client_id, Some(epoch), ConnectionStatus::Error)
    }

    /// Refresh `last_seen`. An errored session whose socket is still attached
    /// returns to connected.
    pub fn record_activity(&self, client_id: &str) {
        let recovered = {
            let Some(mut session) = self.sessions.get_mut(client_id) else {
                return;
            };
            session.info.last_seen = now_millis();
            if session.info.status == ConnectionStatus::Error && session.outbound.is_some() {
                session.info.status = ConnectionStatus::Connected;
                Some(session.info.agent_id.clone())
            } else {
                None
            }
        };

        if let Some(agent_id) = recovered {
            self.cancel_removal(client_id);
            info!(client_id = %client_id, agent_id = %agent_id, "Client recovered");
            self.emit(RegistryEvent::ClientRecovered {
                client_id: client_id.to_string(),
                agent_id,
            });
        }
    }

    /// Flag connected sessions that have been silent too long. Returns the
    /// client ids flagged by this sweep.
    pub fn sweep_health(self: &Arc<Self>, now_ms: i64) -> Vec<String> {
        let mut flagged = Vec::new();
        for mut entry in self.sessions.iter_mut() {
            let session = entry.value_mut();
            if session.info.status == ConnectionStatus::Connected
                && now_ms - session.info.last_seen > self.unhealthy_after_ms
            {
                session.info.status = ConnectionStatus::Error;
                flagged.push((
                    session.info.client_id.clone(),
                    session.info.agent_id.clone(),
                    session.epoch,
                ));
            }
        }

        flagged
            .into_iter()
            .map(|(client_id, agent_id, epoch)| {
                warn!(client_id = %client_id, agent_id = %agent_id, "Client missed heartbeats");
                self.emit(RegistryEvent::ClientUnhealthy {
                    client_id: client_id.clone(),
                    agent_id,
                });
                self.schedule_removal(&client_id, epoch);
                client_id
            })
            .collect()
    }

    /// Connected sessions of one agent.
    pub fn live_sessions(&self, agent_id: &str) -> Vec<LiveSession> {
        self.collect_live(|info| info.agent_id == agent_id)
    }

    /// Every connected session.
    pub fn all_live_sessions(&self) -> Vec<LiveSession> {
        self.collect_live(|_| true)
    }

    fn collect_live(&self, filter: impl Fn(&Connection) -> bool) -> Vec<LiveSession> {
        self.sessions
            .iter()
            .filter(|s| s.info.status == ConnectionStatus::Connected && filter(&s.info))
            .filter_map(|s| {
                s.outbound.as_ref().map(|tx| LiveSession {
                    client_id: s.info.client_id.clone(),
                    agent_id: s.info.agent_id.clone(),
                    epoch: s.epoch,
                    outbound: tx.clone(),
                })
            })
            .collect()
    }

    /// Queue an envelope to one session, whatever its status, as long as its
    /// socket is attached.
    pub fn send_to(&self, client_id: &str, envelope: Envelope) -> bool {
        let Some(tx) = self.sessions.get(client_id).and_then(|s| s.outbound.clone()) else {
            return false;
        };
        match tx.try_send(Outbound::Envelope(envelope)) {
            Ok(()) => true,
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "Failed to queue reply");
                false
            }
        }
    }

    /// Add or remove channel names from a session's subscription set.
    /// Returns the resulting set, or `None` for an unknown client.
    pub fn update_subscriptions(
        &self,
        client_id: &str,
        channels: &[String],
        subscribe: bool,
    ) -> Option<Vec<String>> {
        let mut session = self.sessions.get_mut(client_id)?;
        for channel in channels {
            if subscribe {
                session.info.subscriptions.insert(channel.clone());
            } else {
                session.info.subscriptions.remove(channel);
            }
        }
        Some(session.info.subscriptions.iter().cloned().collect())
    }

    pub fn get(&self, client_id: &str) -> Option<Connection> {
        self.sessions.get(client_id).map(|s| s.info.clone())
    }

    pub fn get_clients(&self) -> Vec<Connection> {
        let mut clients: Vec<Connection> = self.sessions.iter().map(|s| s.info.clone()).collect();
        clients.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        clients
    }

    pub fn counts(&self) -> ConnectionCounts {
        let mut counts = ConnectionCounts::default();
        for session in self.sessions.iter() {
            counts.total += 1;
            match session.info.status {
                ConnectionStatus::Connected => counts.connected += 1,
                ConnectionStatus::Disconnected => counts.disconnected += 1,
                ConnectionStatus::Error => counts.error += 1,
            }
        }
        counts
    }

    /// Number of sessions currently connected.
    pub fn active_count(&self) -> usize {
        self.counts().connected
    }

    /// Ask every attached socket to close and drop all sessions.
    pub fn close_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        for client_id in ids {
            if let Some((_, mut session)) = self.sessions.remove(&client_id) {
                session.close();
                self.emit(RegistryEvent::Removed {
                    client_id,
                    agent_id: session.info.agent_id,
                });
            }
        }
    }

    /// Drop one session immediately, closing its socket. Ignored if the
    /// client id has since been re-registered.
    pub fn remove_session(&self, client_id: &str, epoch: u64) -> bool {
        let Some((_, mut session)) = self.sessions.remove_if(client_id, |_, s| s.epoch == epoch) else {
            return false;
        };
        self.cancel_removal(client_id);
        session.close();
        self.emit(RegistryEvent::Removed {
            client_id: client_id.to_string(),
            agent_id: session.info.agent_id,
        });
        true
    }

    /// Abort every pending removal timer.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.removal_timers.iter().map(|t| t.key().clone()).collect();
        for client_id in ids {
            self.cancel_removal(&client_id);
        }
    }

    /// Number of removal timers still pending.
    pub fn pending_removals(&self) -> usize {
        self.removal_timers.len()
    }

    fn transition(self: &Arc<Self>, client_id: &str, epoch: Option<u64>, status: ConnectionStatus) -> bool {
        let (agent_id, session_epoch, previous) = {
            let Some(mut session) = self.sessions.get_mut(client_id) else {
                return false;
            };
            if epoch.is_some_and(|e| e != session.epoch) {
                return false;
            }
            let previous = session.info.status;
            if previous == status {
                return false;
            }
            session.info.status = status;
            if status == ConnectionStatus::Disconnected {
                session.outbound = None;
            }
            (session.info.agent_id.clone(), session.epoch, previous)
        };

        let event = match status {
            ConnectionStatus::Disconnected => {
                info!(client_id = %client_id, agent_id = %agent_id, "Client disconnected");
                RegistryEvent::Disconnected {
                    client_id: client_id.to_string(),
                    agent_id,
                }
            }
            ConnectionStatus::Error => {
                warn!(client_id = %client_id, agent_id = %agent_id, "Client marked unhealthy");
                RegistryEvent::ClientUnhealthy {
                    client_id: client_id.to_string(),
                    agent_id,
                }
            }
            ConnectionStatus::Connected => return false,
        };
        self.emit(event);

        if previous == ConnectionStatus::Connected || !self.removal_timers.contains_key(client_id) {
            self.schedule_removal(client_id, session_epoch);
        }
        true
    }

    fn schedule_removal(self: &Arc<Self>, client_id: &str, epoch: u64) {
        let registry: Weak<Self> = Arc::downgrade(self);
        let grace = self.grace;
        let id = client_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(registry) = registry.upgrade() {
                registry.removal_timers.remove(&id);
                registry.remove_if_stale(&id, epoch);
            }
        });
        if let Some(old) = self.removal_timers.insert(client_id.to_string(), handle) {
            old.abort();
        }
    }

    fn cancel_removal(&self, client_id: &str) {
        if let Some((_, handle)) = self.removal_timers.remove(client_id) {
            handle.abort();
        }
    }

    fn remove_if_stale(&self, client_id: &str, epoch: u64) {
        let removed = self.sessions.remove_if(client_id, |_, s| {
            s.epoch == epoch && s.info.status != ConnectionStatus::Connected
        });
        if let Some((_, mut session)) = removed {
            session.close();
            debug!(client_id = %client_id, "Session removed after grace window");
            self.emit(RegistryEvent::Removed {
                client_id: client_id.to_string(),
                agent_id: session.info.agent_id,
            });
        }
    }

    fn emit(&self, event: RegistryEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageType;

    fn registry() -> Arc<ConnectionRegistry> {
        ConnectionRegistry::new(Duration::from_millis(50), Duration::from_millis(100))
    }

    fn queue() -> (mpsc::Sender<Outbound>, mpsc::Receiver<Outbound>) {
        mpsc::channel(OUTBOUND_QUEUE_CAPACITY)
    }

    #[tokio::test]
    async fn test_register_queues_connected_envelope() {
        let reg = registry();
        let (tx, mut rx) = queue();
        reg.register("c1", "agent-a", Map::new(), tx);

        match rx.recv().await.unwrap() {
            Outbound::Envelope(env) => {
                assert_eq!(env.message_type, MessageType::System);
                assert_eq!(env.payload["event"], "connected");
                assert_eq!(env.payload["clientId"], "c1");
            }
            other => panic!("unexpected outbound: {:?}", other),
        }
        assert_eq!(reg.active_count(), 1);
        assert_eq!(reg.live_sessions("agent-a").len(), 1);
    }

    #[tokio::test]
    async fn test_reregister_replaces_and_closes_old_session() {
        let reg = registry();
        let (tx1, mut rx1) = queue();
        let (tx2, _rx2) = queue();
        let first = reg.register("c1", "agent-a", Map::new(), tx1);
        let second = reg.register("c1", "agent-a", Map::new(), tx2);
        assert_ne!(first, second);

        let _connected = rx1.recv().await.unwrap();
        assert_eq!(rx1.recv().await.unwrap(), Outbound::Close);
        assert_eq!(reg.counts().total, 1);

        // stale session teardown must not touch the replacement
        assert!(!reg.deregister_session("c1", first));
        assert_eq!(reg.get("c1").unwrap().status, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_remove_session_checks_epoch() {
        let reg = registry();
        let (tx, mut rx) = queue();
        let epoch = reg.register("c1", "agent-a", Map::new(), tx);

        assert!(!reg.remove_session("c1", epoch + 1));
        assert_eq!(reg.counts().total, 1);

        assert!(reg.remove_session("c1", epoch));
        assert!(reg.get("c1").is_none());
        let _connected = rx.recv().await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Outbound::Close);
    }

    #[tokio::test]
    async fn test_deregister_then_removed_after_grace() {
        let reg = registry();
        let mut events = reg.subscribe_events();
        let (tx, _rx) = queue();
        reg.register("c1", "agent-a", Map::new(), tx);
        assert!(reg.deregister("c1"));
        assert_eq!(reg.get("c1").unwrap().status, ConnectionStatus::Disconnected);
        assert!(reg.live_sessions("agent-a").is_empty());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(reg.get("c1").is_none());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen.last(), Some(RegistryEvent::Removed { .. })));
    }

    #[tokio::test]
    async fn test_reconnect_within_grace_cancels_removal() {
        let reg = registry();
        let (tx, _rx) = queue();
        reg.register("c1", "agent-a", Map::new(), tx);
        reg.deregister("c1");

        let (tx2, _rx2) = queue();
        reg.register("c1", "agent-a", Map::new(), tx2);
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(reg.get("c1").unwrap().status, ConnectionStatus::Connected);
        assert_eq!(reg.pending_removals(), 0);
    }

    #[tokio::test]
    async fn test_sweep_flags_once_and_activity_recovers() {
        let reg = ConnectionRegistry::new(Duration::from_secs(60), Duration::from_millis(100));
        let mut events = reg.subscribe_events();
        let (tx, _rx) = queue();
        reg.register("c1", "agent-a", Map::new(), tx);
        let _ = events.try_recv();

        let later = now_millis() + 1_000;
        assert_eq!(reg.sweep_health(later), vec!["c1".to_string()]);
        assert!(reg.sweep_health(later).is_empty());
        assert_eq!(reg.get("c1").unwrap().status, ConnectionStatus::Error);
        assert!(matches!(events.try_recv(), Ok(RegistryEvent::ClientUnhealthy { .. })));
        assert!(events.try_recv().is_err());

        reg.record_activity("c1");
        assert_eq!(reg.get("c1").unwrap().status, ConnectionStatus::Connected);
        assert!(matches!(events.try_recv(), Ok(RegistryEvent::ClientRecovered { .. })));
        assert_eq!(reg.pending_removals(), 0);
    }

    #[tokio::test]
    async fn test_removal_closes_attached_socket() {
        let reg = registry();
        let (tx, mut rx) = queue();
        reg.register("c1", "agent-a", Map::new(), tx);
        let _connected = rx.recv().await.unwrap();

        reg.mark_error("c1");
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(reg.get("c1").is_none());
        assert_eq!(rx.recv().await.unwrap(), Outbound::Close);
    }

    #[tokio::test]
    async fn test_subscriptions_and_shutdown() {
        let reg = ConnectionRegistry::new(Duration::from_secs(60), Duration::from_secs(60));
        let (tx, _rx) = queue();
        reg.register("c1", "agent-a", Map::new(), tx);

        let subs = reg
            .update_subscriptions("c1", &["alerts".to_string(), "tasks".to_string()], true)
            .unwrap();
        assert_eq!(subs, vec!["alerts", "tasks"]);
        let subs = reg
            .update_subscriptions("c1", &["alerts".to_string()], false)
            .unwrap();
        assert_eq!(subs, vec!["tasks"]);
        assert!(reg.update_subscriptions("nope", &[], true).is_none());

        reg.deregister("c1");
        assert_eq!(reg.pending_removals(), 1);
        reg.shutdown();
        assert_eq!(reg.pending_removals(), 0);
    }
}
