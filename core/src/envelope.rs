/// Envelope model and validator.
///
/// Every message exchanged between agents travels as an [`Envelope`]. Producers
/// hand in an [`EnvelopeDraft`] (every field optional); [`validate`] checks the
/// required fields, assigns the id/timestamp the producer left out, defaults the
/// priority, and normalizes `to` into a non-empty recipient list.
///
/// # Wire shape
///
/// ```text
/// { id, type: "task"|"event"|"heartbeat"|"system"|"alert",
///   from, to: string | string[], channel, payload, timestamp,
///   priority: "low"|"medium"|"high"|"critical",
///   ttl?, retryCount?, correlationId?, metadata? }
/// ```
use crate::errors::{FormatError, FormatResult};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// Recipient that fans out to every connected session of an instance.
pub const BROADCAST: &str = "broadcast";

/// Sender identity used for envelopes generated by the service itself.
pub const SYSTEM_SENDER: &str = "system";

/// Channel used for service-generated envelopes.
pub const SYSTEM_CHANNEL: &str = "system";

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Kind of envelope. Consumers interpret `payload` keyed off this tag.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Task,
    Event,
    Heartbeat,
    System,
    Alert,
}

/// Delivery priority carried with every envelope.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// A validated envelope. `to` is never empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub from: String,
    #[serde(deserialize_with = "deserialize_recipients")]
    pub to: Vec<String>,
    pub channel: String,
    pub payload: Value,
    pub timestamp: i64,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl Envelope {
    /// Whether this envelope is addressed to every connected session.
    pub fn is_broadcast(&self) -> bool {
        self.to.iter().any(|r| r == BROADCAST)
    }

    /// Serialize to the JSON wire form.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse an envelope previously produced by [`Envelope::to_json`].
    pub fn from_json(raw: &str) -> FormatResult<Self> {
        serde_json::from_str(raw).map_err(|e| FormatError::Malformed(e.to_string()))
    }

    fn service(message_type: MessageType, to: &str, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type,
            from: SYSTEM_SENDER.to_string(),
            to: vec![to.to_string()],
            channel: SYSTEM_CHANNEL.to_string(),
            payload,
            timestamp: now_millis(),
            priority: Priority::Medium,
            ttl: None,
            retry_count: None,
            correlation_id: None,
            metadata: None,
        }
    }

    /// System envelope pushed to a session right after it is accepted.
    pub fn connected(agent_id: &str, client_id: &str) -> Self {
        let timestamp = now_millis();
        Self::service(
            MessageType::System,
            agent_id,
            json!({
                "event": "connected",
                "clientId": client_id,
                "timestamp": timestamp,
            }),
        )
    }

    /// Reply to a heartbeat; `correlation_id` is the heartbeat's id.
    pub fn heartbeat_ack(agent_id: &str, heartbeat_id: &str) -> Self {
        let mut ack = Self::service(
            MessageType::Heartbeat,
            agent_id,
            json!({
                "event": "heartbeat-ack",
                "timestamp": now_millis(),
            }),
        );
        ack.correlation_id = Some(heartbeat_id.to_string());
        ack
    }

    /// Failure notice for a rejected or undeliverable envelope.
    pub fn error_notice(
        agent_id: &str,
        original_id: Option<&str>,
        correlation_id: &str,
        error: &str,
    ) -> Self {
        let mut notice = Self::service(
            MessageType::System,
            agent_id,
            json!({
                "event": "error",
                "originalId": original_id,
                "error": error,
            }),
        );
        notice.correlation_id = Some(correlation_id.to_string());
        notice.priority = Priority::High;
        notice
    }

    /// Generic system reply (subscription acknowledgements and the like).
    pub fn system_reply(agent_id: &str, payload: Value) -> Self {
        Self::service(MessageType::System, agent_id, payload)
    }
}

/// Partial envelope as supplied by producers or read off a socket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<MessageType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_optional_recipients",
        skip_serializing_if = "Option::is_none"
    )]
    pub to: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl EnvelopeDraft {
    /// Draft carrying the five required fields.
    pub fn new(
        message_type: MessageType,
        from: impl Into<String>,
        to: impl IntoRecipients,
        channel: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            message_type: Some(message_type),
            from: Some(from.into()),
            to: Some(to.into_recipients()),
            channel: Some(channel.into()),
            payload: Some(payload),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.ttl = Some(ttl_ms);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Parse a draft from JSON text. Unknown `type`/`priority` values and
    /// structurally broken input become [`FormatError::Malformed`].
    pub fn from_json(raw: &str) -> FormatResult<Self> {
        serde_json::from_str(raw).map_err(|e| FormatError::Malformed(e.to_string()))
    }
}

/// Anything that can stand in for the `to` field.
pub trait IntoRecipients {
    fn into_recipients(self) -> Vec<String>;
}

impl IntoRecipients for &str {
    fn into_recipients(self) -> Vec<String> {
        vec![self.to_string()]
    }
}

impl IntoRecipients for String {
    fn into_recipients(self) -> Vec<String> {
        vec![self]
    }
}

impl IntoRecipients for Vec<String> {
    fn into_recipients(self) -> Vec<String> {
        self
    }
}

impl IntoRecipients for &[&str] {
    fn into_recipients(self) -> Vec<String> {
        self.iter().map(|s| s.to_string()).collect()
    }
}

/// Validate a draft and complete it into an [`Envelope`].
pub fn validate(draft: EnvelopeDraft) -> FormatResult<Envelope> {
    let message_type = draft.message_type.ok_or(FormatError::MissingField("type"))?;
    let from = required_text(draft.from, "from")?;
    let to = normalize_recipients(draft.to.ok_or(FormatError::MissingField("to"))?)?;
    let channel = required_text(draft.channel, "channel")?;
    let payload = draft.payload.ok_or(FormatError::MissingField("payload"))?;

    if draft.ttl == Some(0) {
        return Err(FormatError::InvalidTtl);
    }

    let id = match draft.id {
        Some(id) if !id.trim().is_empty() => id,
        _ => Uuid::new_v4().to_string(),
    };

    Ok(Envelope {
        id,
        message_type,
        from,
        to,
        channel,
        payload,
        timestamp: draft.timestamp.unwrap_or_else(now_millis),
        priority: draft.priority.unwrap_or_default(),
        ttl: draft.ttl,
        retry_count: draft.retry_count,
        correlation_id: draft.correlation_id,
        metadata: draft.metadata,
    })
}

fn required_text(value: Option<String>, field: &'static str) -> FormatResult<String> {
    match value {
        None => Err(FormatError::MissingField(field)),
        Some(v) if v.trim().is_empty() => Err(FormatError::EmptyField(field)),
        Some(v) => Ok(v),
    }
}

/// Drop duplicate recipients (first occurrence wins) and reject blanks.
fn normalize_recipients(to: Vec<String>) -> FormatResult<Vec<String>> {
    let mut normalized: Vec<String> = Vec::with_capacity(to.len());
    for recipient in to {
        let recipient = recipient.trim().to_string();
        if recipient.is_empty() {
            return Err(FormatError::EmptyField("to"));
        }
        if !normalized.contains(&recipient) {
            normalized.push(recipient);
        }
    }
    if normalized.is_empty() {
        return Err(FormatError::NoRecipients);
    }
    Ok(normalized)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RecipientsRepr {
    One(String),
    Many(Vec<String>),
}

impl From<RecipientsRepr> for Vec<String> {
    fn from(repr: RecipientsRepr) -> Self {
        match repr {
            RecipientsRepr::One(r) => vec![r],
            RecipientsRepr::Many(rs) => rs,
        }
    }
}

fn deserialize_recipients<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    RecipientsRepr::deserialize(deserializer).map(Into::into)
}

fn deserialize_optional_recipients<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<RecipientsRepr>::deserialize(deserializer)?.map(Into::into))
}
