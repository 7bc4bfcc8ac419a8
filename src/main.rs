//! Notibus - Topic-based real-time notification broker
//!
//! Usage:
//!   notibus [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>       Configuration file path
//!   -b, --bind <ADDR>         TCP bind address (default: 0.0.0.0:7311)
//!   --ws-bind <ADDR>          WebSocket bind address (disabled by default)
//!   --max-connections <N>     Maximum connections (default: 10000)
//!   --queue-capacity <N>      Per-connection outbound queue capacity
//!   -l, --log-level           Log level (error, warn, info, debug, trace)
//!   -h, --help                Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use notibus::broker::{Broker, BrokerConfig};
use notibus::config::Config;
use notibus::{Metrics, MetricsServer};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// Notibus - topic-based notification broker
#[derive(Parser, Debug)]
#[command(name = "notibus")]
#[command(author = "Notibus Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Topic-based real-time notification broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// WebSocket bind address (optional, enables the WebSocket listener)
    #[arg(long)]
    ws_bind: Option<SocketAddr>,

    /// Maximum connections (0 = unlimited)
    #[arg(long)]
    max_connections: Option<usize>,

    /// Maximum frame size in bytes
    #[arg(long)]
    max_frame_size: Option<usize>,

    /// Per-connection outbound queue capacity
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise use defaults
    let file_config = if let Some(config_path) = &args.config {
        match Config::load(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        Config::default()
    };

    // Setup logging - CLI overrides config, config overrides default (info)
    let log_level = args.log_level.unwrap_or_else(|| {
        match file_config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    // CLI args override file config
    let broker_config = BrokerConfig {
        bind_addr: args.bind.unwrap_or(file_config.server.bind),
        ws_bind_addr: args.ws_bind.or(file_config.server.ws_bind),
        ws_path: file_config.server.ws_path.clone(),
        max_connections: args
            .max_connections
            .unwrap_or(file_config.limits.max_connections),
        max_frame_size: args
            .max_frame_size
            .unwrap_or(file_config.limits.max_frame_size),
        max_subscriptions_per_connection: file_config.limits.max_subscriptions_per_connection,
        queue_capacity: args
            .queue_capacity
            .unwrap_or(file_config.delivery.queue_capacity),
        overflow: file_config.delivery.overflow,
        drain_timeout: file_config.delivery.drain_timeout,
    };

    info!("Starting Notibus broker");
    info!("  Bind address: {}", broker_config.bind_addr);
    if let Some(ws_addr) = &broker_config.ws_bind_addr {
        info!(
            "  WebSocket address: {} (path: {})",
            ws_addr, broker_config.ws_path
        );
    }
    info!("  Max connections: {}", broker_config.max_connections);
    info!("  Max frame size: {} bytes", broker_config.max_frame_size);
    info!(
        "  Queue capacity: {} ({:?} on overflow)",
        broker_config.queue_capacity, broker_config.overflow
    );

    let mut broker = Broker::new(broker_config);

    // Setup metrics if configured
    if file_config.metrics.enabled {
        let metrics = Arc::new(Metrics::new());
        broker.set_metrics(metrics.clone());
        info!("  Metrics: enabled (http://{})", file_config.metrics.bind);

        let metrics_server = MetricsServer::new(metrics, file_config.metrics.bind);
        tokio::spawn(async move {
            if let Err(e) = metrics_server.run().await {
                error!("Metrics server error: {}", e);
            }
        });
    } else {
        info!("  Metrics: disabled");
    }

    // Ctrl+C triggers a graceful shutdown: listeners stop accepting and
    // every connection gets its drain timeout to flush.
    let broker = Arc::new(broker);
    let signal_target = broker.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down");
            signal_target.shutdown();
        }
    });

    broker.run().await?;
    info!("Broker stopped");

    Ok(())
}
