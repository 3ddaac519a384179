// agentlink: real-time coordination backbone for agent fleets
// Core library providing the envelope model, channel store contract, routing and health tracking

pub mod buffer;
pub mod channel;
pub mod config;
pub mod envelope;
pub mod errors;
pub mod hub;
pub mod metrics;
pub mod monitor;
pub mod registry;
pub mod router;
pub mod store;

// Re-export commonly used types
pub use errors::{FormatError, FormatResult, HubError, HubResult, StoreError, StoreResult};

pub use envelope::{
    validate, Envelope, EnvelopeDraft, IntoRecipients, MessageType, Priority, BROADCAST,
};

pub use store::{ChannelStore, MemoryStore, StoreMessage, StoreReceiver};

pub use channel::{DurableChannel, PublishReport};

pub use registry::{
    Connection, ConnectionCounts, ConnectionRegistry, ConnectionStatus, Outbound, RegistryEvent,
    OUTBOUND_QUEUE_CAPACITY,
};

pub use buffer::{BufferStats, DeadLetter, DeadLetterReason, OfflineBuffer};

pub use router::{DeliveryReport, Router};

pub use metrics::{MetricsAggregator, MetricsSnapshot};

pub use monitor::{CycleReport, HealthMonitor};

pub use config::HubConfig;

pub use hub::Hub;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
