/// Redis-backed channel store
///
/// Commands go over a reconnecting connection manager; every `subscribe` call
/// opens a dedicated pub/sub connection with one `PSUBSCRIBE` per pattern and
/// a task forwarding its messages into the returned receiver. The forwarder
/// resubscribes with backoff when the pub/sub connection drops, so the
/// receiver only closes on `disconnect`.
use agentlink_core::{ChannelStore, StoreError, StoreMessage, StoreReceiver, StoreResult};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use redis::aio::{ConnectionManager, PubSub};
use redis::AsyncCommands;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// First delay before resubscribing after a dropped pub/sub connection.
const RESUBSCRIBE_BASE_DELAY: Duration = Duration::from_millis(100);
/// Upper bound for the resubscribe backoff.
const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(5);

pub struct RedisStore {
    client: redis::Client,
    conn: RwLock<Option<ConnectionManager>>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl RedisStore {
    /// Parse the URL; no connection is made until [`ChannelStore::connect`].
    pub fn new(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            conn: RwLock::new(None),
            forwarders: Mutex::new(Vec::new()),
        })
    }

    /// Redis store for a pre-built connection description.
    pub fn with_connection_info(info: redis::ConnectionInfo) -> StoreResult<Self> {
        let client = redis::Client::open(info).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            conn: RwLock::new(None),
            forwarders: Mutex::new(Vec::new()),
        })
    }

    fn connection(&self) -> StoreResult<ConnectionManager> {
        self.conn.read().clone().ok_or(StoreError::NotConnected)
    }
}

fn command_error(e: redis::RedisError) -> StoreError {
    if e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::CommandFailed(e.to_string())
    }
}

async fn open_pubsub(client: &redis::Client, patterns: &[String]) -> StoreResult<PubSub> {
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| StoreError::SubscribeFailed(e.to_string()))?;
    for pattern in patterns {
        pubsub
            .psubscribe(pattern)
            .await
            .map_err(|e| StoreError::SubscribeFailed(e.to_string()))?;
    }
    Ok(pubsub)
}

/// Forward pub/sub messages into `tx` until the receiver goes away,
/// resubscribing whenever the connection drops.
async fn forward(
    client: redis::Client,
    patterns: Vec<String>,
    mut pubsub: PubSub,
    tx: mpsc::UnboundedSender<StoreMessage>,
) {
    loop {
        let mut messages = pubsub.into_on_message();
        while let Some(msg) = messages.next().await {
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(channel = %msg.get_channel_name(), error = %e, "Non-text Redis payload");
                    continue;
                }
            };
            let message = StoreMessage {
                pattern: msg.get_pattern().unwrap_or_default(),
                channel: msg.get_channel_name().to_string(),
                payload,
            };
            if tx.send(message).is_err() {
                debug!("Redis subscription receiver dropped");
                return;
            }
        }
        drop(messages);

        warn!("Redis pub/sub connection dropped, resubscribing");
        pubsub = match resubscribe(&client, &patterns, &tx).await {
            Some(pubsub) => pubsub,
            None => return,
        };
    }
}

/// Reopen the pattern subscription with exponential backoff. Gives up only
/// when the receiver has been dropped.
async fn resubscribe(
    client: &redis::Client,
    patterns: &[String],
    tx: &mpsc::UnboundedSender<StoreMessage>,
) -> Option<PubSub> {
    let mut delay = RESUBSCRIBE_BASE_DELAY;
    loop {
        if tx.is_closed() {
            return None;
        }
        tokio::time::sleep(delay).await;
        match open_pubsub(client, patterns).await {
            Ok(pubsub) => {
                info!(patterns = ?patterns, "Redis pattern subscription restored");
                return Some(pubsub);
            }
            Err(e) => {
                warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Redis resubscribe failed");
                delay = (delay * 2).min(RESUBSCRIBE_MAX_DELAY);
            }
        }
    }
}

#[async_trait]
impl ChannelStore for RedisStore {
    async fn connect(&self) -> StoreResult<()> {
        let conn = ConnectionManager::new(self.client.clone())
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        *self.conn.write() = Some(conn);
        info!("Connected to Redis");
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        let mut conn = self.connection()?;
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(command_error)
    }

    async fn subscribe(&self, patterns: &[String]) -> StoreResult<StoreReceiver> {
        if self.conn.read().is_none() {
            return Err(StoreError::NotConnected);
        }

        let pubsub = open_pubsub(&self.client, patterns).await?;
        debug!(patterns = ?patterns, "Redis pattern subscription active");

        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward(self.client.clone(), patterns.to_vec(), pubsub, tx));
        self.forwarders.lock().push(forwarder);
        Ok(rx)
    }

    async fn set_with_expiry(&self, key: &str, ttl_secs: u64, payload: &str) -> StoreResult<()> {
        let mut conn = self.connection()?;
        conn.set_ex::<_, _, ()>(key, payload, ttl_secs.max(1))
            .await
            .map_err(command_error)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection()?;
        conn.get::<_, Option<String>>(key).await.map_err(command_error)
    }

    async fn disconnect(&self) -> StoreResult<()> {
        for forwarder in self.forwarders.lock().drain(..) {
            forwarder.abort();
        }
        if self.conn.write().take().is_some() {
            info!("Disconnected from Redis");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.conn.read().is_some()
    }
}
