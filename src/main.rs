use anyhow::Context;
use tokio::signal;
use tracing::info;
use warp::Filter;

use sfu::config;
use sfu::health;
use sfu::logging;
use sfu::metrics::register_metrics;
use sfu::registry::RoomRegistry;
use sfu::signaling;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Validate environment variables before starting the server
    let cfg = config::validate_env().unwrap_or_else(|e| {
        eprintln!("Environment validation failed: {}", e);
        std::process::exit(1);
    });

    // Initialize tracing with validated RUST_LOG
    logging::init(&cfg.rust_log);

    // Initialize metrics
    register_metrics();

    let metrics_route = warp::path("metrics").and(warp::get()).map(|| {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = vec![];
        let metric_families = prometheus::gather();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    });

    let registry = RoomRegistry::new();
    let routes = signaling::route(registry).or(metrics_route).or(health::route());

    let addr: std::net::SocketAddr = format!("0.0.0.0:{}", cfg.http_port)
        .parse()
        .context("invalid HTTP_PORT")?;
    info!("SFU server listening on {}", addr);

    let shutdown_signal = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C signal handler");
        info!("Received shutdown signal (SIGINT/SIGTERM)");
    };

    let (_addr, server) = warp::serve(routes).bind_with_graceful_shutdown(addr, shutdown_signal);
    server.await;

    info!("SFU shutdown complete");
    Ok(())
}
