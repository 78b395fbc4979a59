//! WebSocket server binary.
//!
//! Hosts the fan-out hub with its keep-alive loop, the adaptive quality
//! controller and network monitor, the tracking service and the zone engine.
//! Detectors and ingestion attach through the library API.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use streamtrack_rs::config::Config;
use streamtrack_rs::integration::StreamTrackingService;
use streamtrack_rs::streaming::{self, DetectionStreamer, Hub, NetworkMonitor, QualityController};
use streamtrack_rs::zones::{InMemoryZoneRepository, ZoneEngine};

fn init_tracing() -> anyhow::Result<()> {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let env_filter =
        EnvFilter::from_default_env().add_directive("streamtrack_rs=info".parse()?);

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(env_filter)
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;

    let config = Config::from_env().context("invalid configuration")?;
    info!(bind = %config.server.bind_address(), "starting streamtrack server");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (monitor_tx, monitor_rx) = watch::channel(false);

    let monitor = if config.enable_network_monitor {
        Some(Arc::new(NetworkMonitor::new(config.network.clone())?))
    } else {
        None
    };
    let mut quality = QualityController::new(config.quality.clone())?;
    if let Some(monitor) = &monitor {
        quality = quality.with_network_monitor(Arc::clone(monitor));
    }
    let quality = Arc::new(quality);

    let hub = Arc::new(Hub::new(config.hub.clone())?.with_quality_controller(Arc::clone(&quality)));

    let streamer = Arc::new(DetectionStreamer::new(hub.clone(), config.streamer.clone()));
    streamer.start()?;

    let service = Arc::new(StreamTrackingService::new(config.tracking.clone()));
    service.start()?;
    {
        let streamer = Arc::clone(&streamer);
        service.set_tracking_callback(Arc::new(move |update| {
            if let Err(e) = streamer.stream_tracking_update(&update) {
                warn!(stream_id = %update.stream_id, error = %e, "tracking update not streamed");
            }
        }));
    }

    let zones = Arc::new(ZoneEngine::new(
        Arc::new(InMemoryZoneRepository::new()),
        config.zones.clone(),
    ));

    let mut tasks: Vec<JoinHandle<()>> = vec![
        tokio::spawn(Arc::clone(&hub).run_keepalive(shutdown_rx.clone())),
        tokio::spawn(Arc::clone(&zones).run_garbage_collector(shutdown_rx.clone())),
        quality.start(shutdown_rx.clone())?,
    ];
    if let Some(monitor) = &monitor {
        tasks.push(tokio::spawn(Arc::clone(monitor).run(monitor_rx)));
    }

    let addr: SocketAddr = config
        .server
        .bind_address()
        .parse()
        .context("invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    axum::serve(
        listener,
        streaming::ws::router(Arc::clone(&hub)).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    // Quality controller, then network monitor, then streams, then sessions.
    if let Err(e) = quality.stop() {
        warn!(error = %e, "quality controller was not running");
    }
    monitor_tx.send_replace(true);
    if let Err(e) = service.stop() {
        warn!(error = %e, "tracking service was not running");
    }
    if tokio::time::timeout(config.server.shutdown_grace, service.drained()).await.is_err() {
        warn!("queued tracking updates were not delivered within the grace period");
    }
    hub.shutdown();
    let _ = streamer.stop();
    shutdown_tx.send_replace(true);

    let drain = futures_util::future::join_all(tasks);
    if tokio::time::timeout(config.server.shutdown_grace, drain).await.is_err() {
        warn!("background tasks did not stop within the grace period");
    }

    info!("server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("received shutdown signal");
}
