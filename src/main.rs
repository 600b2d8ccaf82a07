//! # Regional Transcriber - Main Application Entry Point
//!
//! HTTP service that denoises an uploaded voice clip and transcribes it with
//! a general-purpose Whisper model and, when the client names a region, a
//! Whisper model fine-tuned for that region's accent or language.
//!
//! ## Startup order:
//! 1. `.env`, tracing, configuration (validated)
//! 2. Region table, base model and every region model are loaded
//! 3. Only then does the HTTP listener bind
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, `config.toml`, `APP_*` env)
//! - **audio**: transcoding, spectral denoising and per-request scratch files
//! - **transcription**: region registry, Whisper models, handlers, orchestrator
//! - **state**: shared application state and metrics
//! - **middleware**: request ids, logging and metrics
//! - **handlers** / **health**: HTTP endpoints
//! - **error**: domain and HTTP error types

mod audio;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod middleware;
mod state;
mod transcription;

use crate::config::AppConfig;
use crate::state::AppState;
use crate::transcription::TranscriptionPipeline;
use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    info!("Starting regional-transcriber v{}", env!("CARGO_PKG_VERSION"));
    info!(
        base_model = %config.models.base_model_id,
        device = %config.models.device,
        "Configuration loaded: {}:{}",
        config.server.host,
        config.server.port
    );

    // Every model is loaded before the listener exists, so no request can
    // observe a handler that is still loading.
    let pipeline = TranscriptionPipeline::initialize(&config).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let workers = config.server.workers;
    let app_state = AppState::new(config, pipeline);

    info!("Starting HTTP server on {}", bind_addr);

    let mut server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .expose_headers(vec![
                "x-request-id",
                "x-original-rms",
                "x-denoised-rms",
                "x-noise-reduction",
            ])
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .configure(handlers::routes)
    });
    if workers > 0 {
        server = server.workers(workers);
    }

    let server = server
        .bind(&bind_addr)
        .with_context(|| format!("Failed to bind {}", bind_addr))?
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
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` wins; otherwise debug for this crate and info for actix.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "regional_transcriber=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Resolves on SIGTERM or SIGINT (Ctrl+C elsewhere).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Failed to install unix signal handlers, falling back to Ctrl+C");
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C; shutdown only on server exit");
        std::future::pending::<()>().await;
    }
}
