use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use shared_logging::LogLevel;
use valuation_api::{router, AppState};
use valuation_core::{Settings, ValuationService, ValuationTelemetry};

#[derive(Parser, Debug)]
#[command(
    name = "valuation-api",
    version,
    about = "Housing price prediction API"
)]
struct Args {
    /// TOML settings file; falls back to $VALUATION_CONFIG, then defaults.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref()).context("resolving settings")?;
    let telemetry = ValuationTelemetry::from_settings("api_server", &settings)?;
    telemetry.emit(
        LogLevel::Info,
        "api.starting",
        json!({
            "project": settings.api.project_name,
            "version": settings.api.version,
            "prefix": settings.api.prefix,
        }),
    );

    let service = ValuationService::from_settings(&settings, telemetry.clone())?;
    let app = router(AppState::new(service), &settings.api.prefix);

    let addr = settings.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    telemetry.emit(
        LogLevel::Info,
        "api.listening",
        json!({ "addr": addr.to_string() }),
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    telemetry.emit(LogLevel::Info, "api.stopped", json!({}));
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}
