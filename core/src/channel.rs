/// Durable channel adapter.
///
/// Bridges validated envelopes onto a [`ChannelStore`]. Each distinct recipient
/// gets its own store channel named `{channel}:{recipient}`, so every
/// subscribed instance can tell from the channel name alone who the message is
/// for. Envelopes with a ttl are also persisted under `envelope:{id}`.
use crate::envelope::Envelope;
use crate::errors::{HubResult, StoreError, StoreResult};
use crate::store::{ChannelStore, StoreReceiver};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Base delay between store retries; doubles on every attempt.
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(25);

/// Store channel for one recipient of an envelope.
pub fn store_channel(channel: &str, recipient: &str) -> String {
    format!("{}:{}", channel, recipient)
}

/// Recipient encoded in a store channel name published for an envelope on
/// `channel`. Recipients may themselves contain `:`.
pub fn recipient_of<'a>(store_channel: &'a str, channel: &str) -> Option<&'a str> {
    store_channel
        .strip_prefix(channel)
        .and_then(|rest| rest.strip_prefix(':'))
        .filter(|recipient| !recipient.is_empty())
}

/// Key under which a ttl-bearing envelope is persisted.
pub fn persisted_key(envelope_id: &str) -> String {
    format!("envelope:{}", envelope_id)
}

/// Outcome of publishing one envelope.
#[derive(Debug, Default)]
pub struct PublishReport {
    /// Recipients whose store write succeeded.
    pub published: Vec<String>,
    /// Recipients whose store write failed after all retries.
    pub failed: Vec<(String, StoreError)>,
    /// Failure to persist the ttl copy, if any.
    pub persist_error: Option<StoreError>,
}

impl PublishReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.persist_error.is_none()
    }
}

/// Publish/subscribe bridge over a channel store.
pub struct DurableChannel {
    store: Arc<dyn ChannelStore>,
    max_retries: u32,
    retry_base: Duration,
}

impl DurableChannel {
    pub fn new(store: Arc<dyn ChannelStore>, max_retries: u32) -> Self {
        Self {
            store,
            max_retries,
            retry_base: RETRY_BASE_DELAY,
        }
    }

    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    pub async fn connect(&self) -> StoreResult<()> {
        self.store.connect().await
    }

    pub async fn disconnect(&self) -> StoreResult<()> {
        self.store.disconnect().await
    }

    pub fn is_connected(&self) -> bool {
        self.store.is_connected()
    }

    pub async fn subscribe(&self, patterns: &[String]) -> StoreResult<StoreReceiver> {
        self.store.subscribe(patterns).await
    }

    /// Write the envelope once per distinct recipient. Store failures are
    /// collected in the report rather than returned as errors.
    pub async fn publish(&self, envelope: &Envelope) -> HubResult<PublishReport> {
        let payload = envelope.to_json()?;
        let mut report = PublishReport::default();

        for recipient in &envelope.to {
            let target = store_channel(&envelope.channel, recipient);
            match self
                .with_retries(|| self.store.publish(&target, &payload))
                .await
            {
                Ok(()) => report.published.push(recipient.clone()),
                Err(e) => {
                    warn!(
                        envelope_id = %envelope.id,
                        channel = %target,
                        error = %e,
                        "Publish failed after retries"
                    );
                    report.failed.push((recipient.clone(), e));
                }
            }
        }

        if let Some(ttl_ms) = envelope.ttl {
            let key = persisted_key(&envelope.id);
            let ttl_secs = ttl_ms.div_ceil(1000);
            if let Err(e) = self
                .with_retries(|| self.store.set_with_expiry(&key, ttl_secs, &payload))
                .await
            {
                warn!(envelope_id = %envelope.id, error = %e, "Failed to persist envelope");
                report.persist_error = Some(e);
            }
        }

        debug!(
            envelope_id = %envelope.id,
            published = report.published.len(),
            failed = report.failed.len(),
            "Envelope published"
        );
        Ok(report)
    }

    /// Read back a persisted envelope, if it has not expired.
    pub async fn fetch_persisted(&self, envelope_id: &str) -> HubResult<Option<Envelope>> {
        let raw = self.store.get(&persisted_key(envelope_id)).await?;
        Ok(raw.map(|r| Envelope::from_json(&r)).transpose()?)
    }

    async fn with_retries<F, Fut>(&self, mut op: F) -> StoreResult<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = StoreResult<()>>,
    {
        let mut delay = self.retry_base;
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    debug!(attempt, error = %e, "Retrying store write");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{validate, EnvelopeDraft, MessageType};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn envelope(to: Vec<String>) -> Envelope {
        validate(EnvelopeDraft::new(
            MessageType::Task,
            "seo-agent",
            to,
            "task",
            json!({"n": 1}),
        ))
        .unwrap()
    }

    async fn connected_channel() -> (Arc<MemoryStore>, DurableChannel) {
        let store = Arc::new(MemoryStore::new());
        let channel = DurableChannel::new(store.clone(), 2).with_retry_base(Duration::from_millis(1));
        channel.connect().await.unwrap();
        (store, channel)
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(store_channel("task", "webdev-agent"), "task:webdev-agent");
        assert_eq!(recipient_of("task:webdev-agent", "task"), Some("webdev-agent"));
        assert_eq!(recipient_of("task:team:web", "task"), Some("team:web"));
        assert_eq!(recipient_of("ops:east:web", "ops:east"), Some("web"));
        assert_eq!(recipient_of("task:webdev-agent", "event"), None);
        assert_eq!(recipient_of("taskx:web", "task"), None);
        assert_eq!(recipient_of("task:", "task"), None);
        assert_eq!(persisted_key("abc"), "envelope:abc");
    }

    #[tokio::test]
    async fn test_publish_once_per_recipient() {
        let (_store, channel) = connected_channel().await;
        let mut rx = channel.subscribe(&["*:*".to_string()]).await.unwrap();

        let env = envelope(vec!["a".into(), "b".into()]);
        let report = channel.publish(&env).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.published, vec!["a", "b"]);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.channel, "task:a");
        assert_eq!(second.channel, "task:b");
        assert_eq!(Envelope::from_json(&first.payload).unwrap(), env);
    }

    #[tokio::test]
    async fn test_ttl_envelope_persisted() {
        let (_store, channel) = connected_channel().await;
        let mut env = envelope(vec!["a".into()]);
        env.ttl = Some(1_500);

        channel.publish(&env).await.unwrap();
        let fetched = channel.fetch_persisted(&env.id).await.unwrap();
        assert_eq!(fetched, Some(env));
        assert_eq!(channel.fetch_persisted("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_publish_is_reported() {
        let (store, channel) = connected_channel().await;
        store.set_unavailable(true);

        let report = channel.publish(&envelope(vec!["a".into()])).await.unwrap();
        assert!(report.published.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "a");
    }
}
