//! Channel store contract and the in-process implementation.
//!
//! The hub talks to its durable pub/sub backend only through [`ChannelStore`].
//! The daemon provides a Redis-backed store; [`MemoryStore`] serves tests and
//! single-process deployments. Clones of a `MemoryStore` share one broker, so
//! several hubs built on clones see each other's traffic the way several
//! service instances sharing a Redis server would.

use crate::errors::{StoreError, StoreResult};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// A message delivered through a pattern subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMessage {
    /// Pattern that matched.
    pub pattern: String,
    /// Concrete channel the message was published to.
    pub channel: String,
    pub payload: String,
}

pub type StoreReceiver = mpsc::UnboundedReceiver<StoreMessage>;

/// Narrow publish / pattern-subscribe / key-with-expiry contract.
#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn connect(&self) -> StoreResult<()>;

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()>;

    /// Subscribe to glob patterns. The receiver closes when the store
    /// disconnects.
    async fn subscribe(&self, patterns: &[String]) -> StoreResult<StoreReceiver>;

    async fn set_with_expiry(&self, key: &str, ttl_secs: u64, payload: &str) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn disconnect(&self) -> StoreResult<()>;

    fn is_connected(&self) -> bool;
}

/// Glob match with `*` (any run) and `?` (any single character), as used by
/// pattern subscriptions.
pub fn pattern_matches(pattern: &str, channel: &str) -> bool {
    let (pattern, text) = (pattern.as_bytes(), channel.as_bytes());
    let (mut p, mut t) = (0, 0);
    // Position of the last `*` seen and the text index it is matched up to.
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some(b'*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(b'?') => {
                p += 1;
                t += 1;
            }
            Some(&c) if c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    t = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|&c| c == b'*')
}

struct Subscriber {
    owner: u64,
    patterns: Vec<String>,
    tx: mpsc::UnboundedSender<StoreMessage>,
}

#[derive(Default)]
struct Broker {
    subscribers: Mutex<Vec<Subscriber>>,
    keys: DashMap<String, (String, Instant)>,
    unavailable: AtomicBool,
    next_handle: AtomicU64,
}

/// In-process [`ChannelStore`].
pub struct MemoryStore {
    broker: Arc<Broker>,
    handle: u64,
    connected: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        let broker = Arc::new(Broker::default());
        let handle = broker.next_handle.fetch_add(1, Ordering::Relaxed);
        Self {
            broker,
            handle,
            connected: AtomicBool::new(false),
        }
    }

    /// Simulate a backend outage: while set, `connect`, `publish` and
    /// `set_with_expiry` fail for every handle on this broker.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.broker.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of live subscriptions across all handles.
    pub fn subscriber_count(&self) -> usize {
        self.broker.subscribers.lock().len()
    }

    fn check_ready(&self) -> StoreResult<()> {
        if self.broker.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(StoreError::NotConnected);
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MemoryStore {
    /// A new, disconnected handle onto the same broker.
    fn clone(&self) -> Self {
        Self {
            broker: Arc::clone(&self.broker),
            handle: self.broker.next_handle.fetch_add(1, Ordering::Relaxed),
            connected: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ChannelStore for MemoryStore {
    async fn connect(&self) -> StoreResult<()> {
        if self.broker.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        debug!(handle = self.handle, "Memory store connected");
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        self.check_ready()?;

        let mut subscribers = self.broker.subscribers.lock();
        subscribers.retain(|sub| !sub.tx.is_closed());
        for sub in subscribers.iter() {
            if let Some(pattern) = sub.patterns.iter().find(|p| pattern_matches(p, channel)) {
                let _ = sub.tx.send(StoreMessage {
                    pattern: pattern.clone(),
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                });
            }
        }
        trace!(channel = %channel, "Published to memory store");
        Ok(())
    }

    async fn subscribe(&self, patterns: &[String]) -> StoreResult<StoreReceiver> {
        self.check_ready()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.broker.subscribers.lock().push(Subscriber {
            owner: self.handle,
            patterns: patterns.to_vec(),
            tx,
        });
        Ok(rx)
    }

    async fn set_with_expiry(&self, key: &str, ttl_secs: u64, payload: &str) -> StoreResult<()> {
        self.check_ready()?;
        let expires_at = Instant::now() + Duration::from_secs(ttl_secs);
        self.broker
            .keys
            .insert(key.to_string(), (payload.to_string(), expires_at));
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_ready()?;
        let now = Instant::now();
        self.broker.keys.remove_if(key, |_, (_, expires_at)| *expires_at <= now);
        Ok(self.broker.keys.get(key).map(|entry| entry.0.clone()))
    }

    async fn disconnect(&self) -> StoreResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        let handle = self.handle;
        self.broker.subscribers.lock().retain(|sub| sub.owner != handle);
        debug!(handle, "Memory store disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matching() {
        assert!(pattern_matches("*:*", "task:webdev-agent"));
        assert!(pattern_matches("task:*", "task:webdev-agent"));
        assert!(!pattern_matches("event:*", "task:webdev-agent"));
        assert!(pattern_matches("task:agent-?", "task:agent-1"));
        assert!(!pattern_matches("*:*", "nocolon"));
        assert!(pattern_matches("*a*b", "xxaxxbxxb"));
        assert!(!pattern_matches("*a*b", "xxaxxbxxc"));
        assert!(pattern_matches("**", ""));
        assert!(!pattern_matches("?", ""));
    }

    #[test]
    fn test_pattern_matching_long_channel() {
        let channel = format!("{}:webdev-agent", "a".repeat(1_000_000));
        assert!(pattern_matches("*:*", &channel));
        assert!(pattern_matches("a*:webdev-?gent", &channel));
        assert!(!pattern_matches("*:*x", &channel));
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers() {
        let store = MemoryStore::new();
        store.connect().await.unwrap();

        let mut tasks = store.subscribe(&["task:*".to_string()]).await.unwrap();
        let mut events = store.subscribe(&["event:*".to_string()]).await.unwrap();

        store.publish("task:a", "hello").await.unwrap();

        let msg = tasks.recv().await.unwrap();
        assert_eq!(msg.pattern, "task:*");
        assert_eq!(msg.channel, "task:a");
        assert_eq!(msg.payload, "hello");
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_clones_share_broker() {
        let a = MemoryStore::new();
        let b = a.clone();
        a.connect().await.unwrap();
        b.connect().await.unwrap();

        let mut rx = b.subscribe(&["*:*".to_string()]).await.unwrap();
        a.publish("news:broadcast", "x").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().channel, "news:broadcast");

        b.disconnect().await.unwrap();
        assert!(rx.recv().await.is_none());
        assert_eq!(a.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(store.connect().await, Err(StoreError::Unavailable(_))));

        store.set_unavailable(false);
        store.connect().await.unwrap();
        store.set_unavailable(true);
        assert!(store.publish("a:b", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_publish_requires_connect() {
        let store = MemoryStore::new();
        assert!(matches!(store.publish("a:b", "x").await, Err(StoreError::NotConnected)));
    }

    #[tokio::test]
    async fn test_keys_expire() {
        let store = MemoryStore::new();
        store.connect().await.unwrap();
        store.set_with_expiry("envelope:1", 60, "body").await.unwrap();
        assert_eq!(store.get("envelope:1").await.unwrap().as_deref(), Some("body"));

        store.set_with_expiry("envelope:2", 0, "gone").await.unwrap();
        assert_eq!(store.get("envelope:2").await.unwrap(), None);
    }
}
