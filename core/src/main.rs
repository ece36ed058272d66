use clap::Parser;
use rillmq::{
    BrokerConfig, BrokerMetrics, BrokerServer, MetadataStore, QueueScanner, Result, TopicManager,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const METRICS_REPORT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "rillmq")]
#[command(about = "A realtime distributed message queue node")]
struct Args {
    /// TOML configuration file; RILLMQ_* environment variables override it
    #[arg(short, long)]
    config: Option<String>,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Listener address, e.g. 0.0.0.0:4150
    #[arg(long)]
    tcp_address: Option<String>,

    /// Node id (0-1023) embedded in message ids
    #[arg(long)]
    node_id: Option<u16>,

    /// Directory holding the metadata file
    #[arg(long)]
    data_path: Option<String>,

    /// TLS certificate file path (PEM format)
    #[arg(long)]
    tls_cert: Option<String>,

    /// TLS private key file path (PEM format)
    #[arg(long)]
    tls_key: Option<String>,

    /// Refuse clients that do not upgrade to TLS
    #[arg(long)]
    tls_required: bool,
}

impl Args {
    fn apply(self, mut config: BrokerConfig) -> BrokerConfig {
        if let Some(tcp_address) = self.tcp_address {
            config.tcp_address = tcp_address;
        }
        if let Some(node_id) = self.node_id {
            config.node_id = node_id;
        }
        if let Some(data_path) = self.data_path {
            config.data_path = data_path;
        }
        if self.tls_cert.is_some() {
            config.tls_cert = self.tls_cert;
        }
        if self.tls_key.is_some() {
            config.tls_key = self.tls_key;
        }
        config.tls_required |= self.tls_required;
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(parse_log_level(&args.log_level))
        .init();

    let config = BrokerConfig::load(args.config.as_deref())?;
    let config = args.apply(config);

    info!("Starting RillMQ node {} on {}", config.node_id, config.tcp_address);
    info!("Data path: {}", config.data_path);

    let topics = Arc::new(TopicManager::from_config(&config));
    let metrics = Arc::new(BrokerMetrics::new());
    let metadata = MetadataStore::from_config(&config);
    metadata.load(&topics)?;
    metadata.persist(&topics)?;

    let background = CancellationToken::new();
    let scanner = QueueScanner::new(topics.clone(), metrics.clone(), &config).spawn(background.clone());
    let reporter = tokio::spawn(
        metrics
            .clone()
            .reporting_loop(METRICS_REPORT_INTERVAL, background.clone()),
    );

    let server = Arc::new(BrokerServer::bind(config, topics.clone(), metrics.clone()).await?);
    let server_task = {
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Server error: {}", e);
            }
        })
    };

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
        _ = terminate() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }

    let closing = server.shutdown();
    info!("Closing {} client connections", closing);
    if let Err(e) = server_task.await {
        error!("Server task failed: {}", e);
    }
    server.wait_for_drain(DRAIN_TIMEOUT).await;

    topics.close();
    background.cancel();
    if let Err(e) = scanner.await {
        error!("Queue scanner failed: {}", e);
    }
    if let Err(e) = reporter.await {
        error!("Metrics reporter failed: {}", e);
    }

    if let Err(e) = metadata.persist(&topics) {
        error!("Failed to persist metadata: {}", e);
    }
    metrics.report();

    info!("RillMQ shut down successfully");
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            std::future::pending::<()>().await
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await
}

fn parse_log_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => {
            warn!("Invalid log level '{}', defaulting to 'info'", level);
            tracing::Level::INFO
        }
    }
}
