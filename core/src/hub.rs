//! Coordination hub.
//!
//! The hub owns every component of one service instance and implements the
//! message paths:
//!
//! ```text
//! send_message / handle_inbound
//!        │ validate
//!        ▼
//!  DurableChannel::publish ──► store ──► pump (every instance)
//!        │ failed recipients                 │
//!        └──────────► Router ◄───────────────┘
//!                       │
//!            session queues / OfflineBuffer
//! ```

use crate::buffer::{DeadLetter, OfflineBuffer};
use crate::channel::{recipient_of, DurableChannel};
use crate::config::HubConfig;
use crate::envelope::{now_millis, validate, Envelope, EnvelopeDraft, MessageType};
use crate::errors::HubResult;
use crate::metrics::{MetricsAggregator, MetricsSnapshot};
use crate::monitor::{CycleReport, HealthMonitor};
use crate::registry::{Connection, ConnectionRegistry, Outbound, RegistryEvent};
use crate::router::{DeliveryReport, Router};
use crate::store::{ChannelStore, StoreMessage};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct Hub {
    config: HubConfig,
    channel: DurableChannel,
    registry: Arc<ConnectionRegistry>,
    buffer: Arc<OfflineBuffer>,
    router: Router,
    metrics: Arc<MetricsAggregator>,
    monitor: HealthMonitor,
}

impl Hub {
    pub fn new(store: Arc<dyn ChannelStore>, config: HubConfig) -> HubResult<Arc<Self>> {
        config.validate()?;

        let registry = ConnectionRegistry::new(config.removal_grace(), config.unhealthy_after());
        let buffer = Arc::new(OfflineBuffer::new(
            config.buffer_batch_size,
            config.default_ttl_ms,
            config.dead_letter_enabled,
        ));
        let metrics = Arc::new(MetricsAggregator::new()?);
        let router = Router::new(registry.clone(), buffer.clone());
        let monitor = HealthMonitor::new(registry.clone(), buffer.clone(), metrics.clone());
        let channel = DurableChannel::new(store, config.max_retries);

        Ok(Arc::new(Self {
            config,
            channel,
            registry,
            buffer,
            router,
            metrics,
            monitor,
        }))
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub async fn connect(&self) -> HubResult<()> {
        self.channel.connect().await?;
        info!("Channel store connected");
        Ok(())
    }

    /// Subscribe to the configured patterns and spawn the task that feeds
    /// store messages to the router, one at a time.
    pub async fn start_pump(
        self: &Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> HubResult<JoinHandle<()>> {
        let mut messages = self.channel.subscribe(&self.config.subscribe_patterns).await?;
        debug!(patterns = ?self.config.subscribe_patterns, "Subscribed to channel store");

        let hub = Arc::clone(self);
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Channel pump shutting down");
                        break;
                    }
                    message = messages.recv() => {
                        match message {
                            Some(message) => {
                                hub.dispatch(message);
                            }
                            None => {
                                error!("Channel subscription closed unexpectedly");
                                hub.metrics.record_channel_failure();
                                break;
                            }
                        }
                    }
                }
            }
        }))
    }

    pub fn spawn_monitor(&self, shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        self.monitor
            .clone()
            .spawn(self.config.heartbeat_interval(), shutdown_rx)
    }

    /// Close every session and cancel pending removals.
    pub fn close_sessions(&self) {
        self.registry.close_all();
        self.registry.shutdown();
    }

    pub async fn disconnect(&self) -> HubResult<()> {
        self.channel.disconnect().await?;
        info!("Channel store disconnected");
        Ok(())
    }

    // ========================================================================
    // Message paths
    // ========================================================================

    /// Validate and publish an envelope. Store failures do not fail the call:
    /// affected recipients are routed locally instead.
    pub async fn send_message(&self, draft: EnvelopeDraft) -> HubResult<Envelope> {
        let sender = draft.from.clone();
        let correlation_id = draft.correlation_id.clone();
        let draft_id = draft.id.clone();

        let envelope = match validate(draft) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.metrics.record_error();
                warn!(error = %e, "Rejected envelope");
                if let (Some(sender), Some(correlation_id)) = (sender.as_deref(), correlation_id.as_deref()) {
                    self.notify_agent(
                        sender,
                        Envelope::error_notice(sender, draft_id.as_deref(), correlation_id, &e.to_string()),
                    );
                }
                return Err(e.into());
            }
        };

        let report = self.channel.publish(&envelope).await?;
        for (recipient, error) in &report.failed {
            self.metrics.record_channel_failure();
            let delivery = self.router.route(recipient, &envelope);
            self.record_delivery(&envelope, delivery);

            if let Some(correlation_id) = envelope.correlation_id.as_deref() {
                self.notify_agent(
                    &envelope.from,
                    Envelope::error_notice(
                        &envelope.from,
                        Some(&envelope.id),
                        correlation_id,
                        &format!("publish to {} failed: {}", recipient, error),
                    ),
                );
            }
        }
        if report.persist_error.is_some() {
            self.metrics.record_error();
        }

        debug!(
            envelope_id = %envelope.id,
            channel = %envelope.channel,
            recipients = envelope.to.len(),
            "Envelope sent"
        );
        Ok(envelope)
    }

    /// Handle one text frame from a connected session.
    pub async fn handle_inbound(&self, client_id: &str, agent_id: &str, text: &str) -> HubResult<()> {
        self.registry.record_activity(client_id);

        let mut draft = match EnvelopeDraft::from_json(text) {
            Ok(draft) => draft,
            Err(e) => {
                self.metrics.record_error();
                warn!(client_id = %client_id, error = %e, "Unparseable inbound frame");
                self.reject_frame(client_id, agent_id, text, &e.to_string());
                return Err(e.into());
            }
        };

        match draft.message_type {
            Some(MessageType::Heartbeat) => {
                let heartbeat_id = draft
                    .id
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                self.registry
                    .send_to(client_id, Envelope::heartbeat_ack(agent_id, &heartbeat_id));
                return Ok(());
            }
            Some(MessageType::System) => {
                if let Some(reply) = self.handle_subscription(client_id, agent_id, draft.payload.as_ref()) {
                    self.registry.send_to(client_id, reply);
                    return Ok(());
                }
            }
            _ => {}
        }

        if draft.from.as_deref().map_or(true, str::is_empty) {
            draft.from = Some(agent_id.to_string());
        }
        self.send_message(draft).await.map(|_| ())
    }

    /// Send an error notice for a frame that could not be decoded, when the
    /// raw JSON still carries a correlation id.
    fn reject_frame(&self, client_id: &str, agent_id: &str, text: &str, error: &str) {
        let Ok(raw) = serde_json::from_str::<Value>(text) else {
            return;
        };
        let Some(correlation_id) = raw
            .get("correlationId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
        else {
            return;
        };
        let original_id = raw.get("id").and_then(Value::as_str);
        self.registry.send_to(
            client_id,
            Envelope::error_notice(agent_id, original_id, correlation_id, error),
        );
    }

    fn handle_subscription(&self, client_id: &str, agent_id: &str, payload: Option<&Value>) -> Option<Envelope> {
        let payload = payload?;
        let subscribe = match payload.get("action").and_then(Value::as_str)? {
            "subscribe" => true,
            "unsubscribe" => false,
            _ => return None,
        };
        let channels: Vec<String> = payload
            .get("channels")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let current = self
            .registry
            .update_subscriptions(client_id, &channels, subscribe)?;
        debug!(client_id = %client_id, subscribe, channels = ?channels, "Subscriptions updated");

        Some(Envelope::system_reply(
            agent_id,
            json!({
                "event": if subscribe { "subscribed" } else { "unsubscribed" },
                "channels": channels,
                "subscriptions": current,
            }),
        ))
    }

    /// Route one store message to local sessions.
    pub fn dispatch(&self, message: StoreMessage) -> Option<DeliveryReport> {
        let envelope = match Envelope::from_json(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(channel = %message.channel, error = %e, "Dropping undecodable store message");
                self.metrics.record_error();
                return None;
            }
        };

        let Some(recipient) = recipient_of(&message.channel, &envelope.channel) else {
            warn!(
                channel = %message.channel,
                envelope_channel = %envelope.channel,
                "Store channel does not name a recipient of the envelope"
            );
            self.metrics.record_error();
            return None;
        };

        let report = self.router.route(recipient, &envelope);
        self.record_delivery(&envelope, report);
        Some(report)
    }

    fn record_delivery(&self, envelope: &Envelope, report: DeliveryReport) {
        self.metrics
            .record_processed((now_millis() - envelope.timestamp) as f64);
        if report.buffered > 0 {
            self.metrics.record_buffered(report.buffered);
        }
        for _ in 0..report.failed {
            self.metrics.record_error();
        }
    }

    /// Queue an envelope to every attached session of an agent without
    /// buffering.
    fn notify_agent(&self, agent_id: &str, envelope: Envelope) {
        for session in self.registry.live_sessions(agent_id) {
            let _ = session.outbound.try_send(Outbound::Envelope(envelope.clone()));
        }
    }

    // ========================================================================
    // Queries and maintenance
    // ========================================================================

    pub fn get_clients(&self) -> Vec<Connection> {
        self.registry.get_clients()
    }

    pub fn get_buffered_messages(&self, agent_id: &str) -> Vec<Envelope> {
        self.buffer.get(agent_id)
    }

    pub fn clear_buffer(&self, agent_id: &str) -> usize {
        let cleared = self.buffer.clear(agent_id);
        if cleared > 0 {
            info!(agent_id = %agent_id, cleared, "Offline buffer cleared");
        }
        cleared
    }

    pub fn get_dead_letters(&self) -> Vec<DeadLetter> {
        self.buffer.dead_letters()
    }

    pub async fn fetch_persisted(&self, envelope_id: &str) -> HubResult<Option<Envelope>> {
        self.channel.fetch_persisted(envelope_id).await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.registry.subscribe_events()
    }

    pub fn metrics_snapshot(&self, is_running: bool) -> MetricsSnapshot {
        self.metrics
            .snapshot(self.registry.counts(), self.buffer.stats(), is_running)
    }

    pub fn gather_metrics(&self) -> HubResult<String> {
        self.metrics.gather_metrics()
    }

    /// Run one health cycle immediately.
    pub fn run_maintenance(&self, now_ms: i64) -> CycleReport {
        self.monitor.run_cycle(now_ms)
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("config", &self.config)
            .field("connected", &self.channel.is_connected())
            .finish()
    }
}
