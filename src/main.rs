// =============================================================================
// Meridian Breakout Robot — Main Entry Point
// =============================================================================
//
// The engine refuses LIVE outright: only DRYRUN and SIM run. The host
// platform normally drives `tick`/`on_bar` through the engine API; this
// binary is the standalone driver for dry-run and sim sessions.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod config;
mod engine;
mod execution;
mod journal;
mod market_data;
mod market_lock;
mod notify;
mod parity_spec;
mod policy;
mod risk;
mod stream;
mod summary;
mod time_service;
mod timetable;
mod types;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::EngineSettings;
use crate::engine::RobotEngine;
use crate::execution::{DryRunAdapter, ExecutionAdapter, SimAdapter};
use crate::notify::{LogNotifier, Notifier, NotifyConfig};
use crate::types::ExecutionMode;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Breakout Robot — Starting Up            ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let settings_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "engine_settings.json".to_string());
    let settings = EngineSettings::load(&settings_path)?;

    let notify_cfg = NotifyConfig::from_env();
    info!(
        mode = %settings.mode,
        execution_instrument = %settings.execution_instrument,
        project_root = %settings.project_root.display(),
        push_enabled = notify_cfg.enabled,
        "engine configuration resolved"
    );

    // ── 2. Adapter, notifier, engine ─────────────────────────────────────
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier::default());
    let adapter: Arc<dyn ExecutionAdapter> = match settings.mode {
        ExecutionMode::Sim => Arc::new(SimAdapter::new()),
        // LIVE never reaches an adapter; engine start refuses it.
        ExecutionMode::Dryrun | ExecutionMode::Live => Arc::new(DryRunAdapter),
    };

    let health_enabled = settings.health_monitor_enabled;
    let health_interval = settings.health_interval_secs;
    let engine = Arc::new(RobotEngine::new(settings, adapter, notifier.clone()));

    if let Err(e) = engine.start(Utc::now()) {
        error!(error = %e, "engine failed to start");
        return Err(e);
    }

    // ── 3. Tick loop ─────────────────────────────────────────────────────
    let tick_engine = engine.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            tick_engine.tick(Utc::now());
        }
    });

    // ── 4. Health monitor ────────────────────────────────────────────────
    if health_enabled {
        let health_engine = engine.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(health_interval));
            loop {
                interval.tick().await;
                health_engine.heartbeat(Utc::now());
            }
        });
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    if let Err(e) = engine.stop(Utc::now()) {
        error!(error = %e, "engine stop reported an error");
    }

    info!("Meridian Breakout Robot shut down complete.");
    Ok(())
}
