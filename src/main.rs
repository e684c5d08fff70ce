use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use slotbook::config::Config;
use slotbook::engine::Engine;
use slotbook::notify::NotifyHub;
use slotbook::reaper;
use slotbook::session::MemorySessionStore;

const HORIZON_ROLL_EVERY: Duration = Duration::from_secs(60 * 60);
const COMPACT_CHECK_EVERY: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    slotbook::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let engine = Arc::new(
        Engine::new(config.wal_path(), Arc::new(NotifyHub::new()))?
            .with_lock_timeout(config.checkout_timeout),
    );
    let sessions = Arc::new(MemorySessionStore::new(config.session_idle));

    info!("slotbook started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  facilities: {}", engine.state.len());
    info!("  generation window: {} days, browse window: {} days", config.generation_days, config.browse_days);
    info!("  session idle timeout: {:?}, hold ttl: {:?}", config.session_idle, config.hold_ttl);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let tasks = vec![
        tokio::spawn(reaper::run_hold_reaper(engine.clone(), config.reaper_interval)),
        tokio::spawn(reaper::run_session_purger(sessions.clone(), config.reaper_interval)),
        tokio::spawn(reaper::run_horizon_roller(
            engine.clone(),
            config.generation_days,
            HORIZON_ROLL_EVERY,
        )),
        tokio::spawn(reaper::run_compactor(
            engine.clone(),
            config.compact_threshold,
            COMPACT_CHECK_EVERY,
        )),
    ];

    // Graceful shutdown on SIGTERM/ctrl-c
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }

    info!("shutdown signal received, stopping background tasks");
    for task in &tasks {
        task.abort();
    }
    if let Err(e) = engine.compact_wal().await {
        tracing::error!("final WAL compaction failed: {e}");
    }
    info!("slotbook stopped");
    Ok(())
}
