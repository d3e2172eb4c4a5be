//! # Voice Bridge
//!
//! Connects PBX calls to a cloud realtime speech AI.
//!
//! ## Runtime layout:
//! - **Event stream**: one long-lived websocket to the PBX's REST interface,
//!   reconnected with backoff, feeding the dispatcher
//! - **Dispatcher**: turns call start/end events into per-call lifecycle tasks
//! - **Per call**: a media listener for the PBX's external media connection,
//!   one AI session, two relay tasks
//! - **Sweeper**: ends calls that went idle without an end event
//! - **Ops HTTP server**: health, metrics, call inspection and operator hangup
//!
//! ## Shutdown:
//! SIGINT/SIGTERM stops event intake, ends every active call (each is hung up
//! and its PBX resources released), then stops the HTTP server.

mod ai;
mod ari;
mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod media;
mod session;
mod state;

use std::path::PathBuf;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::ai::RealtimeConnector;
use crate::ari::{AriCommands, EventStreamClient};
use crate::config::AppConfig;
use crate::media::MediaListener;
use crate::session::{CallContext, CallDispatcher, CallRecordSink, CallStats, SessionRegistry};
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing();

    let config = AppConfig::load().context("loading configuration")?;
    config.validate().context("validating configuration")?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        ari = %config.ari.base_url,
        app = %config.ari.app_name,
        media_rate = config.media.sample_rate,
        ai_rate = config.ai.sample_rate,
        "Configuration loaded"
    );
    if config.ai.api_key.is_empty() {
        warn!("No AI provider key configured; every AI session will be rejected");
    }

    // Fail fast when per-call media listeners could never bind.
    let media_bind = MediaListener::check_bind(&config.media.bind_host)
        .await
        .context("probing media bind address")?;
    info!(bind = %media_bind.ip(), advertise = %config.media.advertise_host, "Media listeners available");

    let config = Arc::new(config);
    let cancel = CancellationToken::new();

    let registry = Arc::new(SessionRegistry::new(
        config.sessions.max_concurrent_sessions,
        config.media.attach_timeout() + config.ari.command_timeout(),
    ));
    let stats = Arc::new(CallStats::default());
    let commands = AriCommands::new(&config.ari, &config.media).context("building ARI client")?;

    let ctx = CallContext {
        config: config.clone(),
        commands: Arc::new(commands),
        ai: Arc::new(RealtimeConnector::new()),
        registry: registry.clone(),
        records: CallRecordSink::new(config.sessions.record_path.as_ref().map(PathBuf::from)),
        stats: stats.clone(),
    };

    let client = EventStreamClient::new(config.ari.clone(), config.reconnect.clone());
    let stream_status = client.status();
    let events = client.events(cancel.child_token());
    let dispatcher = CallDispatcher::new(ctx);
    let dispatch_task = tokio::spawn(async move { dispatcher.run(events).await });

    let sweeper = registry.clone().spawn_sweeper(
        config.sessions.sweep_interval(),
        config.sessions.max_idle(),
        cancel.child_token(),
    );

    let app_state = AppState::new(config.clone(), registry.clone(), stats, stream_status);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting ops HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/calls", web::get().to(handlers::list_calls))
                    .route("/calls/{channel_id}", web::get().to(handlers::get_call))
                    .route("/calls/{channel_id}", web::delete().to(handlers::hangup_call)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)
    .with_context(|| format!("binding ops server to {}", bind_addr))?
    .disable_signals()
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received");
        }
    }

    cancel.cancel();
    if let Err(e) = dispatch_task.await {
        warn!("Dispatcher task ended abnormally: {}", e);
    }
    registry.shutdown_all().await;
    let _ = sweeper.await;
    server_handle.stop(true).await;

    info!("Voice bridge stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_bridge=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received SIGINT");
}
