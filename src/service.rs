//! Tracking service orchestration
//!
//! `TrackingService` is the composition root: it owns the registry, the
//! connection manager, the scheduler, and the dispatcher, wires them
//! together, and exposes the external interface the marketplace backend
//! consumes (fleet snapshots, command requests, connect/disconnect, event
//! subscription).

use crate::config::Config;
use crate::connection::{ConnectionManager, ConnectionStatus};
use crate::dispatcher::{CommandDispatcher, CommandRecord};
use crate::error::{ArgusError, Result};
use crate::events::{EventBus, FleetEvent, ScopedEvents};
use crate::logging::get_logger;
use crate::model::{CanonicalVehicleState, CommandKind, Freshness, VehicleId};
use crate::persistence::ConnectionStore;
use crate::provider::{ProviderAdapter, build_adapters};
use crate::reconcile::Reconciler;
use crate::registry::VehicleStateRegistry;
use crate::scheduler::{PriorityTier, SyncExecutor, SyncOutcome, SyncScheduler};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, watch};
use uuid::Uuid;

/// Per-vehicle telemetry lifecycle as consumers see it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryHealth {
    /// Never connected, or nothing known yet
    Unknown,
    /// Connected but the first fetch has not landed
    Syncing,
    Fresh,
    Stale,
    /// The connection is unusable until the host re-authorizes
    Error,
}

/// One vehicle's entry in a fleet snapshot query
#[derive(Debug, Clone)]
pub struct VehicleSnapshot {
    pub vehicle: VehicleId,
    pub state: Option<CanonicalVehicleState>,
    pub health: TelemetryHealth,
    /// True when the visible state includes a command outcome the
    /// provider never confirmed
    pub unconfirmed: bool,
    pub connection: Option<ConnectionStatus>,
}

/// The tracking core: telemetry aggregation plus command orchestration
pub struct TrackingService {
    config: Config,
    registry: Arc<VehicleStateRegistry>,
    events: EventBus,
    connections: Arc<ConnectionManager>,
    scheduler: Arc<SyncScheduler>,
    dispatcher: Arc<CommandDispatcher>,
    reconciler: Arc<Reconciler>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    logger: crate::logging::StructuredLogger,
}

impl TrackingService {
    /// Create a service from configuration, building the configured
    /// provider adapters
    pub fn new(config: Config) -> Result<Self> {
        let adapters = build_adapters(&config);
        Self::with_adapters(config, adapters)
    }

    /// Create a service with explicit adapters (used by tests to inject
    /// scripted providers)
    pub fn with_adapters(
        config: Config,
        adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    ) -> Result<Self> {
        crate::logging::init_logging(&config.logging)?;
        let logger = get_logger("service");

        let registry = Arc::new(VehicleStateRegistry::new(
            config.registry.staleness_factor,
            Duration::from_secs(config.scheduler.idle_interval_min_secs),
        ));
        let events = EventBus::default();
        let store = ConnectionStore::new(&config.connections.state_file);
        let connections = Arc::new(ConnectionManager::new(adapters, store, events.clone()));
        let scheduler = Arc::new(SyncScheduler::new(&config, registry.clone()));
        let dispatcher = Arc::new(CommandDispatcher::new(
            config.clone(),
            connections.clone(),
            registry.clone(),
            events.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(registry.clone(), events.clone()));
        let (shutdown_tx, _) = watch::channel(false);

        logger.info("Initializing fleet tracking service");

        Ok(Self {
            config,
            registry,
            events,
            connections,
            scheduler,
            dispatcher,
            reconciler,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            logger,
        })
    }

    /// Start background work: restore persisted connections, rebuild
    /// their sync jobs, and launch the scheduler and command GC loops
    pub async fn start(self: &Arc<Self>) {
        let restored = self.connections.restore();
        for vehicle in &restored {
            if let Some(provider) = self.connections.provider_of(vehicle) {
                self.scheduler
                    .add_vehicle(vehicle.clone(), provider, PriorityTier::Idle)
                    .await;
            }
        }
        if !restored.is_empty() {
            self.logger.info(&format!(
                "Rebuilt sync jobs for {} restored connection(s)",
                restored.len()
            ));
        }

        let executor: Arc<dyn SyncExecutor> = Arc::new(SyncRunner {
            connections: self.connections.clone(),
            reconciler: self.reconciler.clone(),
        });
        let scheduler_task = tokio::spawn(self.scheduler.clone().run(executor));

        let dispatcher = self.dispatcher.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let gc_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(60)) => dispatcher.gc(),
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.push(scheduler_task);
        tasks.push(gc_task);
        self.logger.info("Fleet tracking service started");
    }

    /// Stop background work; pending jobs and in-flight commands are
    /// abandoned
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.scheduler.shutdown();
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.logger.info("Fleet tracking service stopped");
    }

    // ── External interface ──

    /// Current canonical state for a set of vehicles, each annotated with
    /// freshness and connection status
    pub fn fleet_snapshot(&self, vehicles: &[VehicleId]) -> Vec<VehicleSnapshot> {
        let now = chrono::Utc::now();
        vehicles
            .iter()
            .map(|vehicle| {
                let connection = self.connections.status(vehicle);
                let entry = self.registry.snapshot(vehicle, now);

                let health = match (connection, &entry) {
                    (Some(ConnectionStatus::Error) | Some(ConnectionStatus::Revoked), _) => {
                        TelemetryHealth::Error
                    }
                    (Some(_), Some(snap)) => match snap.freshness {
                        Freshness::Fresh => TelemetryHealth::Fresh,
                        Freshness::Stale => TelemetryHealth::Stale,
                    },
                    (Some(_), None) => TelemetryHealth::Syncing,
                    (None, _) => TelemetryHealth::Unknown,
                };

                VehicleSnapshot {
                    vehicle: vehicle.clone(),
                    state: entry.as_ref().map(|s| s.state.clone()),
                    health,
                    unconfirmed: entry.map(|s| s.unconfirmed).unwrap_or(false),
                    connection,
                }
            })
            .collect()
    }

    /// Issue a remote command; resolution arrives via the event bus or a
    /// later `command_status` query
    pub fn request_command(&self, vehicle: &VehicleId, kind: CommandKind) -> Result<Uuid> {
        self.dispatcher.request(vehicle, kind)
    }

    /// Explicitly retry a failed or timed-out command
    pub fn retry_command(&self, command_id: Uuid) -> Result<Uuid> {
        self.dispatcher.retry(command_id)
    }

    /// Current record of a command
    pub fn command_status(&self, command_id: Uuid) -> Option<CommandRecord> {
        self.dispatcher.status(command_id)
    }

    /// Begin a provider authorization handshake; returns the redirect
    /// target for the host
    pub fn connect(&self, vehicle: &VehicleId, provider_id: &str) -> Result<String> {
        if self.config.provider(provider_id).is_none() {
            return Err(ArgusError::config(format!(
                "Unknown provider: {}",
                provider_id
            )));
        }
        self.connections.begin_connect(vehicle, provider_id)
    }

    /// Complete the handshake with the provider's authorization code and
    /// start polling the vehicle
    pub async fn complete_connect(&self, vehicle: &VehicleId, code: &str) -> Result<()> {
        self.connections.complete_connect(vehicle, code).await?;
        if let Some(provider) = self.connections.provider_of(vehicle) {
            self.scheduler
                .add_vehicle(vehicle.clone(), provider, PriorityTier::Idle)
                .await;
        }
        Ok(())
    }

    /// Disconnect a vehicle
    ///
    /// Local state (connection, sync job, queued commands, registry
    /// entry) is gone before this returns; provider-side revocation is
    /// best-effort and never blocks the teardown.
    pub async fn disconnect(&self, vehicle: &VehicleId) -> Result<()> {
        self.connections.disconnect(vehicle).await?;
        self.scheduler.remove_vehicle(vehicle).await;
        self.dispatcher.cancel_vehicle(vehicle);
        self.registry.remove(vehicle);
        Ok(())
    }

    /// One-off immediate poll without disturbing the steady-state tier
    pub async fn refresh_now(&self, vehicle: &VehicleId) {
        self.scheduler.request_refresh(vehicle).await;
    }

    /// Move a vehicle between the active-trip and idle tiers as trips
    /// start and end
    pub async fn set_trip_active(&self, vehicle: &VehicleId, active: bool) {
        let tier = if active {
            PriorityTier::ActiveTrip
        } else {
            PriorityTier::Idle
        };
        self.scheduler.set_tier(vehicle, tier).await;
    }

    /// Explicit tier control (mothballed vehicles go to BACKGROUND)
    pub async fn set_tier(&self, vehicle: &VehicleId, tier: PriorityTier) {
        self.scheduler.set_tier(vehicle, tier).await;
    }

    /// Subscribe to every fleet event
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    /// Subscribe to events for a set of vehicles
    pub fn subscribe_vehicles(&self, vehicles: HashSet<VehicleId>) -> ScopedEvents {
        self.events.subscribe_vehicles(vehicles)
    }
}

/// Bridges the scheduler to the adapter and reconciliation layers
struct SyncRunner {
    connections: Arc<ConnectionManager>,
    reconciler: Arc<Reconciler>,
}

#[async_trait]
impl SyncExecutor for SyncRunner {
    async fn sync_vehicle(&self, vehicle: &VehicleId) -> SyncOutcome {
        let ctx = match self.connections.fetch_context(vehicle) {
            Ok(ctx) => ctx,
            Err(_) => return SyncOutcome::Halt,
        };

        match ctx
            .adapter
            .fetch_state(&ctx.tokens, vehicle, &ctx.vehicle_ref)
            .await
        {
            Ok(state) => {
                // A result from before a disconnect/reconnect is discarded
                if !self.connections.is_current(vehicle, ctx.generation) {
                    return SyncOutcome::Halt;
                }
                self.reconciler.apply(state);
                SyncOutcome::Success
            }
            Err(ArgusError::RateLimited {
                retry_after_secs, ..
            }) => SyncOutcome::RateLimited {
                retry_after: retry_after_secs.map(Duration::from_secs),
            },
            Err(ArgusError::AuthExpired { .. }) | Err(ArgusError::ConnectionRevoked { .. }) => {
                // One refresh attempt; if it fails the connection leaves
                // ACTIVE and the job halts until re-authorization
                match self.connections.handle_auth_expired(vehicle).await {
                    Ok(()) => SyncOutcome::Transient,
                    Err(_) => SyncOutcome::Halt,
                }
            }
            // Unreachable vehicles and network hiccups delay the next
            // poll, they do not error it
            Err(_) => SyncOutcome::Transient,
        }
    }
}
