use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::info;

use crate::engine::{Engine, now_ms, today};
use crate::session::MemorySessionStore;

/// One sweep of lapsed holds. Returns how many slots went back to Available.
pub async fn reap_expired_holds(engine: &Engine) -> usize {
    let now = now_ms();
    let sweeps = engine
        .collect_expired_holds(now)
        .into_iter()
        .map(|(facility_id, slot_ids)| async move {
            match engine.release_expired_holds(facility_id, &slot_ids, now).await {
                Ok(n) => n,
                Err(e) => {
                    // Facility deleted or hold already gone
                    tracing::debug!("reaper skip facility {facility_id}: {e}");
                    0
                }
            }
        });
    let reaped: usize = join_all(sweeps).await.into_iter().sum();
    if reaped > 0 {
        metrics::counter!(crate::observability::HOLDS_REAPED_TOTAL).increment(reaped as u64);
        info!("reaped {reaped} expired holds");
    }
    reaped
}

/// Background task that periodically returns expired holds to Available.
pub async fn run_hold_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        reap_expired_holds(&engine).await;
    }
}

/// Background task that drops idle sessions (and with them, their carts).
pub async fn run_session_purger(sessions: Arc<MemorySessionStore>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let purged = sessions.purge_expired();
        metrics::gauge!(crate::observability::SESSIONS_ACTIVE).set(sessions.len() as f64);
        if purged > 0 {
            tracing::debug!("purged {purged} idle sessions");
        }
    }
}

/// Background task that keeps every facility generated `days` ahead.
pub async fn run_horizon_roller(engine: Arc<Engine>, days: u32, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let added = engine.roll_horizon(today(), days).await;
        if added > 0 {
            info!("horizon roll added {added} slots");
        }
    }
}

/// Background task that compacts the WAL once it has grown past `threshold`
/// appends.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if engine.wal_appends_since_compact().await < threshold {
            continue;
        }
        if let Err(e) = engine.compact_wal().await {
            tracing::error!("WAL compaction failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NewFacility;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use chrono::Days;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn engine_with_court(wal: &str, days: u32) -> (Arc<Engine>, Facility) {
        let engine = Arc::new(Engine::new(test_wal_path(wal), Arc::new(NotifyHub::new())).unwrap());
        let f = engine
            .create_facility(
                NewFacility {
                    name: "Court 1".into(),
                    location: String::new(),
                    price_per_hour: 100,
                    open: TimeOfDay::hm(8, 0),
                    close: TimeOfDay::hm(10, 0),
                },
                today(),
                days,
            )
            .await
            .unwrap();
        (engine, f)
    }

    #[tokio::test]
    async fn reaper_releases_only_lapsed_holds() {
        let (engine, f) = engine_with_court("reaper_collect.wal", 1).await;
        let slots = engine.slots_on(f.id, today()).await.unwrap();
        let (short, long): (Vec<Ulid>, Vec<Ulid>) = (vec![slots[0].id], vec![slots[1].id]);
        engine.place_hold(f.id, &short, "s1", now_ms() + 50).await.unwrap();
        engine.place_hold(f.id, &long, "s2", now_ms() + 60_000).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(reap_expired_holds(&engine).await, 1);
        assert_eq!(engine.get_slot(short[0]).await.unwrap().status, SlotStatus::Available);
        assert_eq!(engine.get_slot(long[0]).await.unwrap().status, SlotStatus::Reserved);
        assert_eq!(reap_expired_holds(&engine).await, 0);
    }

    #[tokio::test]
    async fn horizon_roller_extends_window() {
        let (engine, f) = engine_with_court("reaper_horizon.wal", 2).await;
        let handle = tokio::spawn(run_horizon_roller(engine.clone(), 5, Duration::from_secs(3600)));
        // The first tick fires immediately
        for _ in 0..50 {
            if !engine.slots_on(f.id, today() + Days::new(4)).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert_eq!(engine.slots_on(f.id, today() + Days::new(4)).await.unwrap().len(), 2);
        assert!(engine.slots_on(f.id, today() + Days::new(5)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn compactor_resets_append_count() {
        let (engine, _) = engine_with_court("reaper_compact.wal", 1).await;
        assert!(engine.wal_appends_since_compact().await >= 2);
        let handle = tokio::spawn(run_compactor(engine.clone(), 1, Duration::from_secs(3600)));
        for _ in 0..50 {
            if engine.wal_appends_since_compact().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }
}
