mod common;

use argus::connection::ConnectionStatus;
use argus::dispatcher::CommandStatus;
use argus::events::FleetEvent;
use argus::model::{CommandKind, VehicleId};
use argus::provider::ProviderAdapter;
use argus::service::TelemetryHealth;
use common::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

fn service_with(
    config: argus::Config,
    adapter: Arc<ScriptedAdapter>,
) -> Arc<argus::TrackingService> {
    let mut adapters: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();
    adapters.insert(SIM_PROVIDER.to_string(), adapter);
    Arc::new(argus::TrackingService::with_adapters(config, adapters).unwrap())
}

#[tokio::test(start_paused = true)]
async fn handshake_moves_connecting_to_active() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(ScriptedAdapter::new());
    let vehicle = VehicleId::new("veh-1");
    let service = service_with(sim_config(&dir), adapter);

    let mut rx = service.subscribe();
    let url = service.connect(&vehicle, SIM_PROVIDER).unwrap();
    assert!(url.contains("authorize"));

    let snap = &service.fleet_snapshot(&[vehicle.clone()])[0];
    assert_eq!(snap.connection, Some(ConnectionStatus::Connecting));

    service.complete_connect(&vehicle, "code-1").await.unwrap();
    let snap = &service.fleet_snapshot(&[vehicle.clone()])[0];
    assert_eq!(snap.connection, Some(ConnectionStatus::Active));
    // Connected but nothing fetched yet
    assert_eq!(snap.health, TelemetryHealth::Syncing);

    let mut statuses = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let FleetEvent::ConnectionStatusChanged { status, .. } = event {
            statuses.push(status);
        }
    }
    assert_eq!(
        statuses,
        vec![ConnectionStatus::Connecting, ConnectionStatus::Active]
    );
}

#[tokio::test(start_paused = true)]
async fn connecting_to_unknown_provider_fails() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(ScriptedAdapter::new());
    let service = service_with(sim_config(&dir), adapter);

    let err = service
        .connect(&VehicleId::new("veh-1"), "acme")
        .unwrap_err();
    assert!(matches!(err, argus::ArgusError::Config { .. }));
}

#[tokio::test(start_paused = true)]
async fn connections_survive_restart_and_rebuild_sync_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let vehicle = VehicleId::new("veh-1");

    {
        let adapter = Arc::new(ScriptedAdapter::new());
        let service = service_with(sim_config(&dir), adapter);
        service.connect(&vehicle, SIM_PROVIDER).unwrap();
        service.complete_connect(&vehicle, "code-1").await.unwrap();
    }

    // A fresh process over the same state file
    let adapter = Arc::new(ScriptedAdapter::new());
    let service = service_with(sim_config(&dir), adapter.clone());
    service.start().await;
    settle(1_000).await;

    let snap = &service.fleet_snapshot(&[vehicle.clone()])[0];
    assert_eq!(snap.connection, Some(ConnectionStatus::Active));
    // The rebuilt job polled without any re-authorization
    assert!(adapter.fetch_count.load(Ordering::SeqCst) >= 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_tears_down_locally_and_discards_late_results() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(ScriptedAdapter::new());
    let vehicle = VehicleId::new("veh-1");
    let service = connected_service(sim_config(&dir), adapter.clone(), &vehicle).await;
    service.start().await;
    settle(50).await;

    // Leave a command hanging in flight
    for _ in 0..40 {
        adapter.push_poll(PollScript::Pending);
    }
    let command_id = service
        .request_command(&vehicle, CommandKind::Unlock)
        .unwrap();
    settle(100).await;
    assert_eq!(
        service.command_status(command_id).unwrap().status,
        CommandStatus::InFlight
    );

    service.disconnect(&vehicle).await.unwrap();

    // Local state is gone before the call returned
    let snap = &service.fleet_snapshot(&[vehicle.clone()])[0];
    assert_eq!(snap.connection, None);
    assert_eq!(snap.health, TelemetryHealth::Unknown);
    assert!(snap.state.is_none());
    assert_eq!(adapter.revoke_count.load(Ordering::SeqCst), 1);

    // The cancelled command resolved FAILED
    let record = service.command_status(command_id).unwrap();
    assert_eq!(record.status, CommandStatus::Failed);
    assert_eq!(record.failure_reason.as_deref(), Some("connection removed"));

    // The in-flight runner eventually times out, but its stale-generation
    // resolution is discarded: the record stays FAILED and nothing
    // reappears in the registry
    settle(60_000).await;
    let record = service.command_status(command_id).unwrap();
    assert_eq!(record.status, CommandStatus::Failed);
    let snap = &service.fleet_snapshot(&[vehicle.clone()])[0];
    assert!(snap.state.is_none());
}

#[tokio::test(start_paused = true)]
async fn failed_remote_revocation_still_tears_down() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(ScriptedAdapter::new());
    adapter.revoke_ok.store(false, Ordering::SeqCst);
    let vehicle = VehicleId::new("veh-1");
    let service = connected_service(sim_config(&dir), adapter.clone(), &vehicle).await;

    // Local consistency wins over remote cleanup
    service.disconnect(&vehicle).await.unwrap();
    let snap = &service.fleet_snapshot(&[vehicle.clone()])[0];
    assert_eq!(snap.connection, None);
    assert_eq!(adapter.revoke_count.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn expired_token_is_refreshed_once_and_polling_continues() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(ScriptedAdapter::new());
    let vehicle = VehicleId::new("veh-1");
    let service = connected_service(sim_config(&dir), adapter.clone(), &vehicle).await;
    service.set_trip_active(&vehicle, true).await;

    adapter.push_fetch(FetchScript::AuthExpired);
    let mut rx = service.subscribe();
    service.start().await;
    settle(1_000).await;

    // Refresh succeeded; the connection is ACTIVE again
    let snap = &service.fleet_snapshot(&[vehicle.clone()])[0];
    assert_eq!(snap.connection, Some(ConnectionStatus::Active));

    let mut statuses = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let FleetEvent::ConnectionStatusChanged { status, .. } = event {
            statuses.push(status);
        }
    }
    assert_eq!(
        statuses,
        vec![ConnectionStatus::TokenExpired, ConnectionStatus::Active]
    );

    // Polling continues at the trip cadence with the fresh tokens
    settle(35_000).await;
    assert!(adapter.fetch_count.load(Ordering::SeqCst) >= 2);
    let snap = &service.fleet_snapshot(&[vehicle.clone()])[0];
    assert_eq!(snap.health, TelemetryHealth::Fresh);
}

#[tokio::test(start_paused = true)]
async fn failed_refresh_marks_connection_and_halts_polling() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(ScriptedAdapter::new());
    adapter.refresh_ok.store(false, Ordering::SeqCst);
    let vehicle = VehicleId::new("veh-1");
    let service = connected_service(sim_config(&dir), adapter.clone(), &vehicle).await;
    service.set_trip_active(&vehicle, true).await;

    adapter.push_fetch(FetchScript::AuthExpired);
    service.start().await;
    settle(1_000).await;

    let snap = &service.fleet_snapshot(&[vehicle.clone()])[0];
    assert_eq!(snap.connection, Some(ConnectionStatus::Revoked));
    assert_eq!(snap.health, TelemetryHealth::Error);

    // Excluded from scheduling until re-authorization
    let before = adapter.fetch_count.load(Ordering::SeqCst);
    settle(120_000).await;
    assert_eq!(adapter.fetch_count.load(Ordering::SeqCst), before);

    // Commands are refused while the connection is unusable
    assert!(
        service
            .request_command(&vehicle, CommandKind::Lock)
            .is_err()
    );
}
