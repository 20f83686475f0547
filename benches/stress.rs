use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Duration as Days};

use slotbook::engine::Engine;
use slotbook::model::Timestamp;
use slotbook::service::{BookingError, BookingService, ExtraInfo};

const ROOMS: i64 = 10;
const HAMMER_TASKS: usize = 64;
const HAMMER_ROUNDS: usize = 200;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.3}ms, p50={:.3}ms, p95={:.3}ms, p99={:.3}ms, max={:.3}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

fn day_start(day: i64) -> Timestamp {
    DateTime::parse_from_rfc3339("2030-01-07T00:00:00+09:00").unwrap() + Days::days(day)
}

/// Half-hour slot `index` on `day`. Index 47 would end at midnight, so 0..47 are usable.
fn half_hour(day: i64, index: i64) -> (Timestamp, Timestamp) {
    let start = day_start(day) + Days::minutes(30 * index);
    (start, start + Days::minutes(30))
}

async fn setup() -> BookingService<Engine> {
    let dir = std::env::temp_dir().join(format!("slotbook_bench_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("bench.wal");
    let _ = std::fs::remove_file(&path);

    let engine = Engine::open(&path).unwrap();
    for id in 1..=ROOMS {
        engine.create_room(id, format!("Room {id}")).await.unwrap();
    }
    println!("  created {ROOMS} rooms, wal at {}", path.display());
    BookingService::new(Arc::new(engine))
}

async fn sequential_writes(svc: &BookingService<Engine>) {
    let mut latencies = Vec::new();
    let start = Instant::now();
    for day in 0..20 {
        for slot in 0..47 {
            let (s, e) = half_hour(day, slot);
            let t = Instant::now();
            svc.make(1, "bench", s, e, ExtraInfo::default()).await.unwrap();
            latencies.push(t.elapsed());
        }
    }
    let elapsed = start.elapsed();
    let n = latencies.len();
    println!(
        "  {n} bookings in {:.2}s = {:.0} ops/sec",
        elapsed.as_secs_f64(),
        n as f64 / elapsed.as_secs_f64()
    );
    print_latency("make", &mut latencies);
}

/// Many tasks race for the same slots of one room. Exactly one may win each slot.
async fn same_room_hammer(svc: &BookingService<Engine>) {
    let room = 2;
    let mut handles = Vec::new();
    let start = Instant::now();
    for task in 0..HAMMER_TASKS {
        let svc = svc.clone();
        handles.push(tokio::spawn(async move {
            let mut won = 0usize;
            let mut lost = 0usize;
            for round in 0..HAMMER_ROUNDS {
                let day = 100 + (round / 47) as i64;
                let slot = (round % 47) as i64;
                // Odd tasks ask for a full hour, overlapping two half-hour slots.
                let (s, mut e) = half_hour(day, slot);
                if task % 2 == 1 && slot < 46 {
                    e = e + Days::minutes(30);
                }
                match svc.make(room, &format!("task{task}"), s, e, ExtraInfo::default()).await {
                    Ok(_) => won += 1,
                    Err(BookingError::Unavailable { .. }) => lost += 1,
                    Err(other) => panic!("unexpected error: {other}"),
                }
            }
            (won, lost)
        }));
    }

    let (mut won, mut lost) = (0, 0);
    for h in handles {
        let (w, l) = h.await.unwrap();
        won += w;
        lost += l;
    }
    let elapsed = start.elapsed();
    println!(
        "  {} attempts in {:.2}s: {won} booked, {lost} refused",
        won + lost,
        elapsed.as_secs_f64()
    );

    let listed = svc
        .list(day_start(100), day_start(100 + (HAMMER_ROUNDS / 47) as i64 + 1))
        .await
        .unwrap();
    let rows = listed.get(&room).cloned().unwrap_or_default();
    assert_eq!(rows.len(), won, "every success must be stored exactly once");
    for pair in rows.windows(2) {
        assert!(
            pair[0].span.end <= pair[1].span.start,
            "double booking: {:?} and {:?}",
            pair[0],
            pair[1]
        );
    }
    println!("  no overlapping reservations on room {room}");
}

async fn series_under_contention(svc: &BookingService<Engine>) {
    let mut handles = Vec::new();
    for task in 0..32 {
        let svc = svc.clone();
        handles.push(tokio::spawn(async move {
            let room = 3 + (task % (ROOMS - 2));
            let (s, e) = half_hour(400, task % 4);
            let t = Instant::now();
            let extra = ExtraInfo { memo: Some("bench".into()), repeat: 8 };
            let ok = svc.make(room, "series", s, e, extra).await.is_ok();
            (ok, t.elapsed())
        }));
    }
    let mut latencies = Vec::new();
    let mut committed = 0;
    for h in handles {
        let (ok, d) = h.await.unwrap();
        latencies.push(d);
        if ok {
            committed += 1;
        }
    }
    println!("  {committed}/32 series committed");
    print_latency("make (repeat=8)", &mut latencies);
}

#[tokio::main]
async fn main() {
    println!("=== slotbook stress benchmark ===");

    println!("[setup]");
    let svc = setup().await;

    println!("\n[phase 1] sequential write throughput");
    sequential_writes(&svc).await;

    println!("\n[phase 2] same-room contention");
    same_room_hammer(&svc).await;

    println!("\n[phase 3] weekly series under contention");
    series_under_contention(&svc).await;

    println!("\ndone");
}
