/// Offline buffer for recipients with no live session.
///
/// Each agent gets a bounded FIFO. Overflow evicts the oldest entry; entries
/// expire `ttl` (or the default ttl) after they were buffered. Evicted and
/// expired envelopes optionally land in a bounded dead-letter queue.
use crate::envelope::{now_millis, Envelope};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Dead-letter capacity as a multiple of the per-agent batch size.
const DEAD_LETTER_FACTOR: usize = 10;

#[derive(Debug, Clone)]
struct BufferedEnvelope {
    envelope: Envelope,
    expires_at: i64,
}

/// Why an envelope left the buffer undelivered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterReason {
    Overflow,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub agent_id: String,
    pub envelope: Envelope,
    pub reason: DeadLetterReason,
    pub recorded_at: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BufferStats {
    pub total_buffered: usize,
    pub agents: usize,
}

pub struct OfflineBuffer {
    queues: DashMap<String, VecDeque<BufferedEnvelope>>,
    batch_size: usize,
    default_ttl_ms: u64,
    dead_letters: Option<Mutex<VecDeque<DeadLetter>>>,
}

impl OfflineBuffer {
    pub fn new(batch_size: usize, default_ttl_ms: u64, dead_letter_enabled: bool) -> Self {
        Self {
            queues: DashMap::new(),
            batch_size,
            default_ttl_ms,
            dead_letters: dead_letter_enabled.then(|| Mutex::new(VecDeque::new())),
        }
    }

    /// Append an envelope for `agent_id`. Returns the evicted envelope, if the
    /// queue was full.
    pub fn enqueue(&self, agent_id: &str, envelope: Envelope) -> Option<Envelope> {
        let ttl = envelope.ttl.unwrap_or(self.default_ttl_ms) as i64;
        let entry = BufferedEnvelope {
            expires_at: now_millis().saturating_add(ttl),
            envelope,
        };

        let evicted = {
            let mut queue = self.queues.entry(agent_id.to_string()).or_default();
            queue.push_back(entry);
            if queue.len() > self.batch_size {
                queue.pop_front().map(|e| e.envelope)
            } else {
                None
            }
        };

        debug!(agent_id = %agent_id, "Envelope buffered for offline agent");
        if let Some(ref old) = evicted {
            warn!(agent_id = %agent_id, envelope_id = %old.id, "Offline buffer full, evicted oldest");
            self.dead_letter(agent_id, old.clone(), DeadLetterReason::Overflow);
        }
        evicted
    }

    /// Drop entries whose ttl has elapsed. Returns how many were removed.
    pub fn sweep_expired(&self, now_ms: i64) -> usize {
        let mut expired = Vec::new();
        for mut queue in self.queues.iter_mut() {
            let agent_id = queue.key().clone();
            queue.value_mut().retain(|entry| {
                if entry.expires_at <= now_ms {
                    expired.push((agent_id.clone(), entry.envelope.clone()));
                    false
                } else {
                    true
                }
            });
        }
        self.queues.retain(|_, queue| !queue.is_empty());

        let count = expired.len();
        for (agent_id, envelope) in expired {
            self.dead_letter(&agent_id, envelope, DeadLetterReason::Expired);
        }
        if count > 0 {
            debug!(count, "Expired buffered envelopes");
        }
        count
    }

    /// Buffered envelopes for an agent, oldest first.
    pub fn get(&self, agent_id: &str) -> Vec<Envelope> {
        self.queues
            .get(agent_id)
            .map(|q| q.iter().map(|e| e.envelope.clone()).collect())
            .unwrap_or_default()
    }

    /// Discard an agent's buffer. Returns how many envelopes were dropped.
    pub fn clear(&self, agent_id: &str) -> usize {
        self.queues
            .remove(agent_id)
            .map(|(_, q)| q.len())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> BufferStats {
        let mut stats = BufferStats::default();
        for queue in self.queues.iter() {
            if !queue.is_empty() {
                stats.agents += 1;
                stats.total_buffered += queue.len();
            }
        }
        stats
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters
            .as_ref()
            .map(|dl| dl.lock().iter().cloned().collect())
            .unwrap_or_default()
    }

    fn dead_letter(&self, agent_id: &str, envelope: Envelope, reason: DeadLetterReason) {
        let Some(queue) = self.dead_letters.as_ref() else {
            return;
        };
        let mut queue = queue.lock();
        queue.push_back(DeadLetter {
            agent_id: agent_id.to_string(),
            envelope,
            reason,
            recorded_at: now_millis(),
        });
        while queue.len() > self.batch_size * DEAD_LETTER_FACTOR {
            queue.pop_front();
        }
    }
}
