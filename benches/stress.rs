use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use ulid::Ulid;

use slotbook::cart::CartItem;
use slotbook::engine::{Engine, NewFacility, today};
use slotbook::model::*;
use slotbook::notify::NotifyHub;

const GENERATION_DAYS: u32 = 30;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

fn open_engine() -> Arc<Engine> {
    let dir = std::env::temp_dir().join(format!("slotbook_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    Arc::new(Engine::new(dir.join("slotbook.wal"), Arc::new(NotifyHub::new())).unwrap())
}

async fn setup(engine: &Engine, n: usize) -> Vec<Facility> {
    let mut facilities = Vec::with_capacity(n);
    for i in 0..n {
        let f = engine
            .create_facility(
                NewFacility {
                    name: format!("Court {i}"),
                    location: "Bench hall".into(),
                    price_per_hour: 100,
                    open: TimeOfDay::hm(6, 0),
                    close: TimeOfDay::hm(22, 0),
                },
                today(),
                GENERATION_DAYS,
            )
            .await
            .unwrap();
        facilities.push(f);
    }
    println!("  created {n} facilities x {GENERATION_DAYS} days");
    facilities
}

async fn items_for(engine: &Engine, f: &Facility, date: NaiveDate, start: u16, hours: u16) -> Vec<CartItem> {
    engine
        .resolve(f.id, date, TimeOfDay::hm(start, 0), TimeOfDay::hm(start + hours, 0))
        .await
        .map(|slots| slots.iter().map(|s| CartItem::for_slot(f, s)).collect())
        .unwrap_or_default()
}

/// Every checkout targets distinct slots, so all should commit.
async fn phase1_sequential(engine: &Engine, f: &Facility) {
    let mut latencies = Vec::new();
    let start = Instant::now();
    for day in 1..GENERATION_DAYS as u64 {
        let date = today() + Days::new(day);
        for hour in 6..22 {
            let items = items_for(engine, f, date, hour, 1).await;
            let t = Instant::now();
            engine.checkout("bench", "bench", &items).await.unwrap();
            latencies.push(t.elapsed());
        }
    }
    let elapsed = start.elapsed();
    let n = latencies.len();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} checkouts in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("checkout latency", &mut latencies);
}

/// Many sessions fight over the same two-hour block on every facility.
async fn phase2_contended(engine: Arc<Engine>, facilities: &[Facility]) {
    let n_tasks = 64;
    let date = today() + Days::new(2);
    let start = Instant::now();
    let mut handles = Vec::new();

    for i in 0..n_tasks {
        let engine = engine.clone();
        let f = facilities[i % facilities.len()].clone();
        handles.push(tokio::spawn(async move {
            let items = items_for(&engine, &f, date, 18, 2).await;
            if items.is_empty() {
                return (false, Duration::ZERO);
            }
            let t = Instant::now();
            let ok = engine
                .checkout(&format!("user-{i}"), &format!("session-{i}"), &items)
                .await
                .is_ok();
            (ok, t.elapsed())
        }));
    }

    let mut won = 0;
    let mut latencies = Vec::new();
    for h in handles {
        let (ok, latency) = h.await.unwrap();
        if ok {
            won += 1;
        }
        if latency > Duration::ZERO {
            latencies.push(latency);
        }
    }
    println!(
        "  {n_tasks} sessions over {} facilities: {won} orders in {:.2}s (expected {})",
        facilities.len(),
        start.elapsed().as_secs_f64(),
        facilities.len()
    );
    assert_eq!(won, facilities.len(), "double booking or lost order");
    print_latency("contended checkout latency", &mut latencies);
}

/// Reads while writers commit on other days.
async fn phase3_read_under_load(engine: Arc<Engine>, f: Facility) {
    let writer_engine = engine.clone();
    let writer_f = f.clone();
    let writer = tokio::spawn(async move {
        for hour in 6..22 {
            let items = items_for(&writer_engine, &writer_f, today() + Days::new(5), hour, 1).await;
            let _ = writer_engine.checkout("writer", "writer", &items).await;
        }
    });

    let mut latencies = Vec::new();
    for _ in 0..2000 {
        let t = Instant::now();
        engine
            .slots_in_window(f.id, DateWindow::new(today(), 7))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }
    writer.await.unwrap();
    print_latency("7-day browse latency", &mut latencies);
}

#[tokio::main]
async fn main() {
    println!("=== slotbook stress benchmark ===\n");

    println!("[setup]");
    let engine = open_engine();
    let facilities = setup(&engine, 8).await;

    println!("\n[phase 1] sequential checkout throughput");
    phase1_sequential(&engine, &facilities[0]).await;

    println!("\n[phase 2] contended checkouts");
    phase2_contended(engine.clone(), &facilities[1..]).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(engine.clone(), facilities[1].clone()).await;

    println!("\n[phase 4] compaction");
    let t = Instant::now();
    engine.compact_wal().await.unwrap();
    println!("  compacted in {:.2}ms", t.elapsed().as_secs_f64() * 1000.0);

    println!("\n=== benchmark complete ===");
}
