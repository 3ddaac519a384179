/// agentlink daemon - Main entry point
/// Starts the WebSocket coordination service
use agentlink_daemon::{logging, CoordinationServer, DaemonConfig, LogFormat, StoreBackend};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "agentlink-daemon",
    about = "Real-time coordination service for agent fleets",
    version = env!("CARGO_PKG_VERSION")
)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        value_name = "PATH",
        env = "AGENTLINK_CONFIG",
        help = "Path to configuration file (TOML)"
    )]
    config: Option<PathBuf>,

    /// WebSocket bind address
    #[arg(long, value_name = "HOST", env = "AGENTLINK_HOST")]
    host: Option<String>,

    /// WebSocket port
    #[arg(
        short,
        long,
        value_name = "PORT",
        env = "AGENTLINK_PORT",
        help = "WebSocket port (default: 8080)"
    )]
    port: Option<u16>,

    /// Channel store backend
    #[arg(long, value_name = "BACKEND", env = "AGENTLINK_STORE", value_parser = ["redis", "memory"])]
    store: Option<String>,

    /// Redis host
    #[arg(long, value_name = "HOST", env = "AGENTLINK_REDIS_HOST")]
    redis_host: Option<String>,

    /// Redis port
    #[arg(long, value_name = "PORT", env = "AGENTLINK_REDIS_PORT")]
    redis_port: Option<u16>,

    /// Redis password
    #[arg(long, value_name = "PASSWORD", env = "AGENTLINK_REDIS_PASSWORD", hide_env_values = true)]
    redis_password: Option<String>,

    /// Serve Prometheus metrics
    #[arg(long, env = "AGENTLINK_ENABLE_METRICS", help = "Enable the metrics endpoint")]
    enable_metrics: bool,

    /// Metrics port
    #[arg(long, value_name = "PORT", env = "AGENTLINK_METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Log level
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        env = "AGENTLINK_LOG_LEVEL",
        help = "Log level (trace, debug, info, warn, error)"
    )]
    log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long, env = "AGENTLINK_LOG_JSON")]
    log_json: bool,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable verbose output")]
    verbose: bool,
}

impl Args {
    fn apply(self, config: &mut DaemonConfig) {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(store) = self.store.as_deref() {
            config.store.backend = match store {
                "memory" => StoreBackend::Memory,
                _ => StoreBackend::Redis,
            };
        }
        if let Some(host) = self.redis_host {
            config.store.host = host;
        }
        if let Some(port) = self.redis_port {
            config.store.port = port;
        }
        if self.redis_password.is_some() {
            config.store.password = self.redis_password;
        }
        if self.enable_metrics {
            config.server.enable_metrics = true;
        }
        if let Some(port) = self.metrics_port {
            config.server.metrics_port = port;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
        if self.log_json {
            config.logging.format = LogFormat::Json;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let mut args = Args::parse();

    // Load configuration
    let config_path = args.config.take();
    let mut config = DaemonConfig::load_or_default(config_path.as_deref())?;

    // Apply CLI overrides
    args.apply(&mut config);

    // Setup logging
    logging::init(&config.logging)?;

    info!("Starting agentlink daemon v{}", agentlink_daemon::VERSION);
    match &config_path {
        Some(path) => info!("Loaded configuration from: {}", path.display()),
        None => info!("Using default configuration"),
    }

    // Validate configuration
    config.validate()?;

    info!(
        "Server configuration: ws://{}:{}, store {:?} at {}:{}",
        config.server.host,
        config.server.port,
        config.store.backend,
        config.store.host,
        config.store.port
    );

    let server = CoordinationServer::new(config)?;
    server.start().await?;

    // Wait for a shutdown signal
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for CTRL+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
    }

    info!("Shutting down daemon...");
    server.stop().await?;
    info!("agentlink daemon stopped");
    Ok(())
}
