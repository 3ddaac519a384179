/// agentlink daemon: WebSocket coordination service for agent fleets
/// Provides the network listener, Redis channel store, configuration and metrics endpoint
pub mod config;
pub mod errors;
pub mod logging;
pub mod metrics_endpoint;
pub mod redis_store;
pub mod server;
pub mod session;

// Re-export commonly used types
pub use config::{DaemonConfig, LogFormat, LoggingConfig, ServerConfig, StoreBackend, StoreConfig};
pub use errors::{DaemonError, DaemonResult};
pub use redis_store::RedisStore;
pub use server::{CoordinationServer, ServiceState};
pub use session::{SessionIdentity, UNKNOWN_AGENT};

/// Daemon version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
