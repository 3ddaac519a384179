//! Router / dispatcher.
//!
//! Resolves a recipient to live sessions on this instance and queues the
//! envelope to each of them. Named recipients with no live session go to the
//! offline buffer. Per-session failures are isolated: the session is marked
//! errored and delivery to the remaining sessions continues.

use crate::buffer::OfflineBuffer;
use crate::envelope::{Envelope, BROADCAST};
use crate::registry::{ConnectionRegistry, LiveSession, Outbound};
use serde::Serialize;
use std::ops::AddAssign;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace, warn};

/// Outcome of routing one envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReport {
    /// Session sends attempted.
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Recipients deferred to the offline buffer.
    pub buffered: usize,
    /// Broadcasts that found no session at all.
    pub dropped: usize,
}

impl AddAssign for DeliveryReport {
    fn add_assign(&mut self, other: Self) {
        self.attempted += other.attempted;
        self.delivered += other.delivered;
        self.failed += other.failed;
        self.buffered += other.buffered;
        self.dropped += other.dropped;
    }
}

pub struct Router {
    registry: Arc<ConnectionRegistry>,
    buffer: Arc<OfflineBuffer>,
}

impl Router {
    pub fn new(registry: Arc<ConnectionRegistry>, buffer: Arc<OfflineBuffer>) -> Self {
        Self { registry, buffer }
    }

    /// Route an envelope to a single recipient.
    pub fn route(&self, recipient: &str, envelope: &Envelope) -> DeliveryReport {
        if recipient == BROADCAST {
            let sessions = self.registry.all_live_sessions();
            if sessions.is_empty() {
                debug!(envelope_id = %envelope.id, "Broadcast with no live sessions dropped");
                return DeliveryReport {
                    dropped: 1,
                    ..Default::default()
                };
            }
            return self.deliver(&sessions, envelope);
        }

        let sessions = self.registry.live_sessions(recipient);
        if sessions.is_empty() {
            self.buffer.enqueue(recipient, envelope.clone());
            return DeliveryReport {
                buffered: 1,
                ..Default::default()
            };
        }
        self.deliver(&sessions, envelope)
    }

    /// Route an envelope to every recipient it names.
    pub fn route_all(&self, envelope: &Envelope) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for recipient in &envelope.to {
            report += self.route(recipient, envelope);
        }
        report
    }

    fn deliver(&self, sessions: &[LiveSession], envelope: &Envelope) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for session in sessions {
            report.attempted += 1;
            match session.outbound.try_send(Outbound::Envelope(envelope.clone())) {
                Ok(()) => {
                    report.delivered += 1;
                    trace!(
                        client_id = %session.client_id,
                        envelope_id = %envelope.id,
                        "Envelope queued to session"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    let reason = match e {
                        TrySendError::Full(_) => "outbound queue full",
                        TrySendError::Closed(_) => "outbound queue closed",
                    };
                    warn!(
                        client_id = %session.client_id,
                        agent_id = %session.agent_id,
                        envelope_id = %envelope.id,
                        reason,
                        "Delivery to session failed"
                    );
                    self.registry.mark_session_error(&session.client_id, session.epoch);
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{validate, EnvelopeDraft, MessageType};
    use crate::registry::{ConnectionStatus, OUTBOUND_QUEUE_CAPACITY};
    use serde_json::{json, Map};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn setup() -> (Arc<ConnectionRegistry>, Arc<OfflineBuffer>, Router) {
        let registry = ConnectionRegistry::new(Duration::from_secs(10), Duration::from_secs(60));
        let buffer = Arc::new(OfflineBuffer::new(100, 300_000, false));
        let router = Router::new(registry.clone(), buffer.clone());
        (registry, buffer, router)
    }

    fn envelope(to: &str) -> Envelope {
        validate(EnvelopeDraft::new(MessageType::Event, "sender", to, "news", json!({})))
            .unwrap()
    }

    #[tokio::test]
    async fn test_offline_recipient_is_buffered() {
        let (_registry, buffer, router) = setup();
        let report = router.route("webdev-agent", &envelope("webdev-agent"));
        assert_eq!(report.buffered, 1);
        assert_eq!(report.attempted, 0);
        assert_eq!(buffer.get("webdev-agent").len(), 1);
    }

    #[tokio::test]
    async fn test_delivers_to_every_session_of_agent() {
        let (registry, _buffer, router) = setup();
        let (tx1, mut rx1) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (tx2, mut rx2) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        registry.register("c1", "agent-a", Map::new(), tx1);
        registry.register("c2", "agent-a", Map::new(), tx2);
        let _ = rx1.recv().await;
        let _ = rx2.recv().await;

        let env = envelope("agent-a");
        let report = router.route_all(&env);
        assert_eq!(report.delivered, 2);
        assert_eq!(rx1.recv().await, Some(Outbound::Envelope(env.clone())));
        assert_eq!(rx2.recv().await, Some(Outbound::Envelope(env)));
    }

    #[tokio::test]
    async fn test_broadcast_without_sessions_is_dropped() {
        let (_registry, buffer, router) = setup();
        let report = router.route_all(&envelope(BROADCAST));
        assert_eq!(report.dropped, 1);
        assert_eq!(buffer.stats().total_buffered, 0);
    }

    #[tokio::test]
    async fn test_failed_session_marked_error_others_delivered() {
        let (registry, _buffer, router) = setup();
        let mut receivers = Vec::new();
        for i in 0..5 {
            let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
            registry.register(&format!("c{}", i), &format!("agent-{}", i), Map::new(), tx);
            receivers.push(rx);
        }
        // closing one receiver makes its queue fail
        drop(receivers.remove(2));

        let report = router.route_all(&envelope(BROADCAST));
        assert_eq!(report.attempted, 5);
        assert_eq!(report.delivered, 4);
        assert_eq!(report.failed, 1);
        assert_eq!(registry.get("c2").unwrap().status, ConnectionStatus::Error);
        assert_eq!(registry.counts().connected, 4);
    }
}
