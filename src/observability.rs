use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: checkout attempts. Labels: outcome (committed, conflict,
/// timeout, rolled_back).
pub const CHECKOUTS_TOTAL: &str = "slotbook_checkouts_total";

/// Histogram: checkout latency in seconds, including lock waits.
pub const CHECKOUT_DURATION_SECONDS: &str = "slotbook_checkout_duration_seconds";

/// Counter: slot ranges staged into carts.
pub const CART_ITEMS_ADDED_TOTAL: &str = "slotbook_cart_items_added_total";

/// Counter: cart compare-and-swap attempts lost to a concurrent writer.
pub const CART_CAS_RETRIES_TOTAL: &str = "slotbook_cart_cas_retries_total";

/// Counter: confirmation notifications that could not be delivered.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "slotbook_notifications_failed_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Counter: slots created by generation, regeneration and horizon rolls.
pub const SLOTS_GENERATED_TOTAL: &str = "slotbook_slots_generated_total";

/// Counter: slots placed on hold.
pub const HOLDS_PLACED_TOTAL: &str = "slotbook_holds_placed_total";

/// Counter: lapsed holds returned to Available by the reaper.
pub const HOLDS_REAPED_TOTAL: &str = "slotbook_holds_reaped_total";

/// Gauge: live sessions in the in-process session store.
pub const SESSIONS_ACTIVE: &str = "slotbook_sessions_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
