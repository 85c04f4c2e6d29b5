//! Logship Collector - receives shipped log payloads
//!
//! This binary runs the wire protocol server, the writer refresh task and
//! the metrics/health HTTP endpoint.

use anyhow::{Context, Result};
use axum::{
    Router,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use chrono::Utc;
use clap::Parser;
use logship_collector::{
    DedupStore, DiskSink, LoggingListener, ServerMetrics, ServerSettings, Sink,
    WireProtocolServer,
};
use logship_common::config::Config;
use logship_storage::StreamWriterCache;
use std::fmt::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "logship-collector")]
#[command(about = "Logship log collector")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/logship/collector.toml")]
    config: String,

    /// Listen address for the wire protocol
    #[arg(short, long)]
    listen: Option<String>,

    /// Root directory of rotated files
    #[arg(long)]
    root_dir: Option<PathBuf>,

    /// Dedup database path
    #[arg(long)]
    dedup_path: Option<PathBuf>,

    /// Metrics server port (Prometheus), 0 disables
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Shared state of the metrics endpoint
struct CollectorMetricsState {
    node: String,
    server: Arc<ServerMetrics>,
    cache: Arc<StreamWriterCache>,
    sink: Arc<DiskSink>,
    start_time: Instant,
}

fn load_config(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        return Ok(Config::default());
    }
    let config_str =
        std::fs::read_to_string(path).with_context(|| format!("reading config file {path}"))?;
    Ok(toml::from_str(&config_str).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to parse config file: {}", e);
        Config::default()
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = load_config(&args.config)?;

    // Merge CLI args with config file (CLI takes precedence)
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(root_dir) = args.root_dir {
        config.storage.root_dir = root_dir;
    }
    if let Some(dedup_path) = args.dedup_path {
        config.server.dedup_path = dedup_path;
    }
    if let Some(port) = args.metrics_port {
        config.server.metrics_port = port;
    }
    let log_level = if args.log_level != "info" {
        args.log_level
    } else {
        config.logging.level.clone()
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Logship collector");
    info!("Config file: {}", args.config);
    info!("Root directory: {}", config.storage.root_dir.display());

    if let Err(e) = logship_storage::validate_templates(&config.storage, Utc::now()) {
        error!("Invalid naming template: {}", e);
        std::process::exit(1);
    }

    let dedup = match DedupStore::open(&config.server.dedup_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to open dedup store: {}", e);
            std::process::exit(1);
        }
    };

    let cache = Arc::new(StreamWriterCache::new(config.storage.clone()));
    let sink = Arc::new(DiskSink::new(Arc::clone(&cache)));
    let metrics = Arc::new(ServerMetrics::default());
    let listener = Arc::new(LoggingListener::new(Arc::clone(&metrics)));
    let server = Arc::new(WireProtocolServer::new(
        ServerSettings::from(&config.server),
        sink.clone(),
        dedup,
        listener,
        Arc::clone(&metrics),
    ));

    let (refresh_stop, refresh_rx) = watch::channel(false);
    let refresh_handle = cache.spawn_refresh(refresh_rx);

    let tcp = server.bind().await.context("binding collector listener")?;
    let serve_handle = server.serve(tcp);

    if config.server.metrics_port != 0 {
        let metrics_state = Arc::new(CollectorMetricsState {
            node: config.node.name.clone(),
            server: metrics,
            cache: Arc::clone(&cache),
            sink,
            start_time: Instant::now(),
        });
        let metrics_port = config.server.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(metrics_port, metrics_state).await {
                error!("Metrics server error: {}", e);
            }
        });
        info!("Metrics available at http://0.0.0.0:{}/metrics", metrics_port);
    }

    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down...");

    server.close();
    let _ = serve_handle.await;
    let _ = refresh_stop.send(true);
    let _ = refresh_handle.await;
    cache.close_all();

    info!("Collector stopped");
    Ok(())
}

/// Prometheus metrics endpoint handler
async fn metrics_handler(
    axum::extract::State(state): axum::extract::State<Arc<CollectorMetricsState>>,
) -> impl IntoResponse {
    let mut output = String::with_capacity(8 * 1024);

    let uptime = state.start_time.elapsed().as_secs();
    let _ = writeln!(output, "# HELP logship_collector_uptime_seconds Collector uptime in seconds");
    let _ = writeln!(output, "# TYPE logship_collector_uptime_seconds counter");
    let _ = writeln!(
        output,
        "logship_collector_uptime_seconds{{node=\"{}\"}} {}",
        state.node, uptime
    );

    let _ = writeln!(output, "# HELP logship_collector_available Whether writes are admitted");
    let _ = writeln!(output, "# TYPE logship_collector_available gauge");
    let _ = writeln!(
        output,
        "logship_collector_available{{node=\"{}\"}} {}",
        state.node,
        state.sink.availability().as_value()
    );

    output.push_str(&state.server.export_prometheus(&state.node));
    output.push_str(&state.cache.metrics().export_prometheus(&state.node));

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        output,
    )
}

/// Health check endpoint
async fn health_handler(
    axum::extract::State(state): axum::extract::State<Arc<CollectorMetricsState>>,
) -> impl IntoResponse {
    if state.sink.availability().is_operational() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "UNHEALTHY")
    }
}

/// Start the metrics HTTP server
async fn start_metrics_server(port: u16, state: Arc<CollectorMetricsState>) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
    info!("Starting metrics server on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
