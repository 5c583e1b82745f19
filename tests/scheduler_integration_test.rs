mod common;

use argus::model::VehicleId;
use argus::service::TelemetryHealth;
use common::*;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn active_trip_vehicle_polls_at_trip_cadence() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(ScriptedAdapter::new());
    let vehicle = VehicleId::new("veh-trip");
    let service = connected_service(sim_config(&dir), adapter.clone(), &vehicle).await;
    service.set_trip_active(&vehicle, true).await;
    service.start().await;

    // Just over three 30s intervals: initial poll plus three more
    settle(95_000).await;
    let count = adapter.fetch_count.load(Ordering::SeqCst);
    assert!(count >= 4, "expected at least 4 polls, saw {}", count);

    let snap = &service.fleet_snapshot(&[vehicle.clone()])[0];
    assert_eq!(snap.health, TelemetryHealth::Fresh);
}

#[tokio::test(start_paused = true)]
async fn rate_limit_backs_off_exponentially_without_surfacing_errors() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(ScriptedAdapter::new());
    let vehicle = VehicleId::new("veh-rl");
    let service = connected_service(sim_config(&dir), adapter.clone(), &vehicle).await;
    service.set_trip_active(&vehicle, true).await;

    // First poll succeeds, then the provider rate-limits three times:
    // backoff pushes the next polls to +60s, +120s, +240s
    adapter.push_fetch(FetchScript::RateLimited(None));
    adapter.push_fetch(FetchScript::RateLimited(None));
    adapter.push_fetch(FetchScript::RateLimited(None));
    // (first queued script fires on the immediate initial poll; seed a
    // successful one ahead of the rate limits)
    adapter
        .fetches
        .lock()
        .unwrap()
        .push_front(FetchScript::State(default_state(&vehicle)));

    service.start().await;
    settle(1_000).await;
    assert_eq!(adapter.fetch_count.load(Ordering::SeqCst), 1);

    // t=30s: first rate limit, t=90s: second, t=210s: third
    settle(220_000).await;
    assert_eq!(adapter.fetch_count.load(Ordering::SeqCst), 4);

    // After three consecutive rate limits the next poll must sit more
    // than 30s * 2^3 out from the last attempt
    settle(210_000).await; // t = 431s, still inside the 240s push-out
    assert_eq!(adapter.fetch_count.load(Ordering::SeqCst), 4);
    settle(30_000).await; // t = 461s, past 210s + 240s
    assert_eq!(adapter.fetch_count.load(Ordering::SeqCst), 5);

    // Rate limiting delayed polls but never surfaced as an error; the
    // snapshot still shows the last known state
    let snap = &service.fleet_snapshot(&[vehicle.clone()])[0];
    assert_ne!(snap.health, TelemetryHealth::Error);
    assert!(snap.state.is_some());
}

#[tokio::test(start_paused = true)]
async fn manual_refresh_polls_now_without_changing_tier() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(ScriptedAdapter::new());
    let vehicle = VehicleId::new("veh-idle");
    let service = connected_service(sim_config(&dir), adapter.clone(), &vehicle).await;
    service.start().await;
    settle(1_000).await;
    let baseline = adapter.fetch_count.load(Ordering::SeqCst);
    assert_eq!(baseline, 1);

    // Well before the idle cadence (>= 300s) comes around
    settle(60_000).await;
    assert_eq!(adapter.fetch_count.load(Ordering::SeqCst), 1);

    service.refresh_now(&vehicle).await;
    settle(1_000).await;
    assert_eq!(adapter.fetch_count.load(Ordering::SeqCst), 2);

    // The steady-state tier cadence is untouched: no extra poll follows
    // right behind the one-off
    settle(60_000).await;
    assert_eq!(adapter.fetch_count.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn unreachable_vehicle_reads_stale_not_error() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(ScriptedAdapter::new());
    let vehicle = VehicleId::new("veh-gone");
    let service = connected_service(sim_config(&dir), adapter.clone(), &vehicle).await;
    service.set_trip_active(&vehicle, true).await;

    let mut past = default_state(&vehicle);
    past.last_observed_at = chrono::Utc::now() - chrono::Duration::hours(1);
    adapter.push_fetch(FetchScript::State(past));
    for _ in 0..5 {
        adapter.push_fetch(FetchScript::Unreachable);
    }

    service.start().await;
    settle(120_000).await;

    // Polling kept going at tier cadence despite the failures
    assert!(adapter.fetch_count.load(Ordering::SeqCst) >= 3);

    // The hour-old observation reads STALE, never ERROR
    let snap = &service.fleet_snapshot(&[vehicle.clone()])[0];
    assert_eq!(snap.health, TelemetryHealth::Stale);
}
