//! Remote command dispatch
//!
//! Accepts command requests, serializes them per vehicle (one in flight,
//! the rest queued behind it), issues them through the right adapter, and
//! tracks asynchronous confirmation. The optimistic contract: the expected
//! post-command value is overlaid on the registry while the command is in
//! flight; CONFIRMED folds it in, FAILED rolls it back, TIMED_OUT leaves
//! it visible but flagged unconfirmed because the vehicle's true state is
//! unknown. Failed commands are never replayed automatically; retry is an
//! explicit caller action.

use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::error::{ArgusError, Result};
use crate::events::{EventBus, FleetEvent};
use crate::logging::get_logger;
use crate::model::{CommandKind, VehicleId};
use crate::provider::RemoteCommandStatus;
use crate::registry::VehicleStateRegistry;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Lifecycle status of a remote command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CommandStatus {
    Pending,
    InFlight,
    Confirmed,
    Failed,
    TimedOut,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandStatus::Confirmed | CommandStatus::Failed | CommandStatus::TimedOut
        )
    }
}

/// One remote command and its resolution
#[derive(Debug, Clone, Serialize)]
pub struct CommandRecord {
    pub id: Uuid,
    pub vehicle: VehicleId,
    pub kind: CommandKind,
    pub status: CommandStatus,
    pub requested_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub failure_reason: Option<String>,
}

/// How one command execution ended
enum Resolution {
    Confirmed,
    Failed(String),
    TimedOut,
}

#[derive(Default)]
struct Lane {
    in_flight: Option<Uuid>,
    queue: VecDeque<Uuid>,
    records: HashMap<Uuid, CommandRecord>,
}

/// Per-vehicle serializing command dispatcher
pub struct CommandDispatcher {
    config: Config,
    connections: Arc<ConnectionManager>,
    registry: Arc<VehicleStateRegistry>,
    events: EventBus,
    lanes: DashMap<VehicleId, Lane>,
    index: DashMap<Uuid, VehicleId>,
    logger: crate::logging::StructuredLogger,
}

impl CommandDispatcher {
    pub fn new(
        config: Config,
        connections: Arc<ConnectionManager>,
        registry: Arc<VehicleStateRegistry>,
        events: EventBus,
    ) -> Self {
        let logger = get_logger("dispatcher");
        Self {
            config,
            connections,
            registry,
            events,
            lanes: DashMap::new(),
            index: DashMap::new(),
            logger,
        }
    }

    /// Request a remote command; returns the command id immediately
    ///
    /// An unsupported command fails synchronously without any provider
    /// contact. When another command is in flight for the vehicle, the new
    /// one queues behind it in submission order.
    pub fn request(self: &Arc<Self>, vehicle: &VehicleId, kind: CommandKind) -> Result<Uuid> {
        self.enqueue(vehicle, kind, 0)
    }

    /// Explicitly retry a terminal command
    ///
    /// A timed-out command has an ambiguous outcome; replaying it is a
    /// caller decision, never automatic. The new command carries an
    /// incremented retry count.
    pub fn retry(self: &Arc<Self>, command_id: Uuid) -> Result<Uuid> {
        let (vehicle, kind, retry_count, status) = {
            let vehicle = self
                .index
                .get(&command_id)
                .map(|v| v.value().clone())
                .ok_or_else(|| ArgusError::generic("Unknown command id"))?;
            let lane = self
                .lanes
                .get(&vehicle)
                .ok_or_else(|| ArgusError::generic("Unknown command id"))?;
            let record = lane
                .records
                .get(&command_id)
                .ok_or_else(|| ArgusError::generic("Unknown command id"))?;
            (
                vehicle.clone(),
                record.kind,
                record.retry_count,
                record.status,
            )
        };

        if !status.is_terminal() || status == CommandStatus::Confirmed {
            return Err(ArgusError::generic(
                "Only failed or timed-out commands can be retried",
            ));
        }
        self.enqueue(&vehicle, kind, retry_count + 1)
    }

    /// Look up a command's current record
    pub fn status(&self, command_id: Uuid) -> Option<CommandRecord> {
        let vehicle = self.index.get(&command_id)?.value().clone();
        self.lanes
            .get(&vehicle)?
            .records
            .get(&command_id)
            .cloned()
    }

    /// Cancel everything for a vehicle (disconnect teardown)
    ///
    /// Queued commands resolve FAILED; an in-flight adapter call is left
    /// to finish, but its result arrives with a stale connection
    /// generation and is discarded.
    pub fn cancel_vehicle(&self, vehicle: &VehicleId) {
        let mut resolved = Vec::new();
        if let Some(mut lane) = self.lanes.get_mut(vehicle) {
            let lane = lane.value_mut();
            let ids: Vec<Uuid> = lane
                .queue
                .drain(..)
                .chain(lane.in_flight.take())
                .collect();
            for id in ids {
                if let Some(record) = lane.records.get_mut(&id)
                    && !record.status.is_terminal()
                {
                    record.status = CommandStatus::Failed;
                    record.resolved_at = Some(Utc::now());
                    record.failure_reason = Some("connection removed".to_string());
                    resolved.push((id, record.kind));
                }
            }
        }
        for (id, kind) in resolved {
            self.emit_resolved(vehicle, id, kind, CommandStatus::Failed);
        }
    }

    /// Drop resolved commands older than the retention window
    pub fn gc(&self) {
        let retention = chrono::Duration::seconds(self.config.commands.retention_secs as i64);
        let cutoff = Utc::now() - retention;
        let mut empty: Vec<VehicleId> = Vec::new();

        for mut lane in self.lanes.iter_mut() {
            let expired: Vec<Uuid> = lane
                .records
                .values()
                .filter(|r| {
                    r.status.is_terminal()
                        && r.resolved_at.map(|t| t < cutoff).unwrap_or(false)
                })
                .map(|r| r.id)
                .collect();
            for id in &expired {
                lane.records.remove(id);
                self.index.remove(id);
            }
            if lane.records.is_empty() && lane.queue.is_empty() && lane.in_flight.is_none() {
                empty.push(lane.key().clone());
            }
        }
        for vehicle in empty {
            self.lanes.remove_if(&vehicle, |_, lane| {
                lane.records.is_empty() && lane.queue.is_empty() && lane.in_flight.is_none()
            });
        }
    }

    // ── Internal machinery ──

    fn enqueue(self: &Arc<Self>, vehicle: &VehicleId, kind: CommandKind, retry_count: u32) -> Result<Uuid> {
        let ctx = self.connections.fetch_context(vehicle)?;
        // Capability precheck happens before any provider contact
        ctx.adapter
            .capabilities()
            .ensure_command(ctx.adapter.id(), kind)?;

        let id = Uuid::new_v4();
        let record = CommandRecord {
            id,
            vehicle: vehicle.clone(),
            kind,
            status: CommandStatus::Pending,
            requested_at: Utc::now(),
            resolved_at: None,
            retry_count,
            failure_reason: None,
        };

        let start_now = {
            let mut lane = self.lanes.entry(vehicle.clone()).or_default();
            lane.records.insert(id, record);
            lane.queue.push_back(id);
            lane.in_flight.is_none()
        };
        self.index.insert(id, vehicle.clone());

        self.logger.debug(&format!(
            "Queued {} for {} as command {}",
            kind, vehicle, id
        ));

        if start_now {
            self.start_next(vehicle);
        }
        Ok(id)
    }

    /// Promote the next queued command to in flight and spawn its runner
    fn start_next(self: &Arc<Self>, vehicle: &VehicleId) {
        let next = {
            let Some(mut lane) = self.lanes.get_mut(vehicle) else {
                return;
            };
            if lane.in_flight.is_some() {
                return;
            }
            match lane.queue.pop_front() {
                Some(id) => match lane.records.get(&id).map(|r| r.kind) {
                    Some(kind) => {
                        lane.in_flight = Some(id);
                        Some((id, kind))
                    }
                    None => None,
                },
                None => None,
            }
        };

        if let Some((id, kind)) = next {
            let dispatcher = Arc::clone(self);
            let vehicle = vehicle.clone();
            tokio::spawn(async move {
                dispatcher.run_command(vehicle, id, kind).await;
            });
        }
    }

    /// Execute one command end to end
    async fn run_command(self: Arc<Self>, vehicle: VehicleId, id: Uuid, kind: CommandKind) {
        let ctx = match self.connections.fetch_context(&vehicle) {
            Ok(ctx) => ctx,
            Err(e) => {
                let generation = self.connections.generation(&vehicle);
                self.resolve(&vehicle, id, kind, generation, Resolution::Failed(e.to_string()));
                return;
            }
        };
        let generation = ctx.generation;

        self.set_status(&vehicle, id, CommandStatus::InFlight);
        // Optimistic local update, tagged unconfirmed until resolution
        self.registry.apply_optimistic(&vehicle, kind);

        // Issue the command; an expired token gets one refresh attempt
        let mut ctx = ctx;
        let provider_command_id = loop {
            match ctx
                .adapter
                .send_command(&ctx.tokens, &ctx.vehicle_ref, kind)
                .await
            {
                Ok(provider_id) => break provider_id,
                Err(ArgusError::AuthExpired { .. }) => {
                    let refreshed = self.connections.handle_auth_expired(&vehicle).await.is_ok();
                    match (refreshed, self.connections.fetch_context(&vehicle)) {
                        (true, Ok(fresh)) => {
                            ctx = fresh;
                            match ctx
                                .adapter
                                .send_command(&ctx.tokens, &ctx.vehicle_ref, kind)
                                .await
                            {
                                Ok(provider_id) => break provider_id,
                                Err(e) => {
                                    self.resolve(
                                        &vehicle,
                                        id,
                                        kind,
                                        generation,
                                        Resolution::Failed(e.to_string()),
                                    );
                                    return;
                                }
                            }
                        }
                        _ => {
                            self.resolve(
                                &vehicle,
                                id,
                                kind,
                                generation,
                                Resolution::Failed("authorization expired".to_string()),
                            );
                            return;
                        }
                    }
                }
                Err(e) => {
                    self.resolve(&vehicle, id, kind, generation, Resolution::Failed(e.to_string()));
                    return;
                }
            }
        };

        let resolution = self
            .await_confirmation(&ctx, kind, &provider_command_id)
            .await;
        self.resolve(&vehicle, id, kind, generation, resolution);
    }

    /// Poll the provider with bounded exponential backoff until the
    /// command resolves or its kind-specific timeout expires
    async fn await_confirmation(
        &self,
        ctx: &crate::connection::FetchContext,
        kind: CommandKind,
        provider_command_id: &str,
    ) -> Resolution {
        let deadline = Instant::now() + self.config.command_timeout(kind);
        let poll_max = Duration::from_millis(self.config.commands.poll_max_ms);
        let mut delay = Duration::from_millis(self.config.commands.poll_initial_ms);

        loop {
            match ctx
                .adapter
                .poll_command(&ctx.tokens, provider_command_id)
                .await
            {
                Ok(RemoteCommandStatus::Confirmed) => return Resolution::Confirmed,
                Ok(RemoteCommandStatus::Failed { reason }) => return Resolution::Failed(reason),
                Ok(RemoteCommandStatus::Pending) => {}
                Err(e) => {
                    // Transient poll failures burn into the timeout window
                    self.logger
                        .debug(&format!("Confirmation poll failed: {}", e));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Resolution::TimedOut;
            }
            let wait = delay.min(deadline.duration_since(now));
            tokio::time::sleep(wait).await;
            delay = (delay * 2).min(poll_max);
        }
    }

    /// Apply a command's resolution to the registry and records
    ///
    /// A resolution stamped with an older connection generation is
    /// discarded: the vehicle was disconnected (or reconnected) while the
    /// command ran, and its cancellation already resolved the record.
    fn resolve(
        self: &Arc<Self>,
        vehicle: &VehicleId,
        id: Uuid,
        kind: CommandKind,
        generation: u64,
        resolution: Resolution,
    ) {
        if !self.connections.is_current(vehicle, generation) {
            self.logger.debug(&format!(
                "Discarding stale resolution for command {} on {}",
                id, vehicle
            ));
            return;
        }

        let status = match &resolution {
            Resolution::Confirmed => {
                self.registry.confirm_optimistic(vehicle);
                CommandStatus::Confirmed
            }
            Resolution::Failed(_) => {
                self.registry.rollback_optimistic(vehicle);
                CommandStatus::Failed
            }
            Resolution::TimedOut => {
                // Ambiguous: the vehicle may have executed the command.
                // The optimistic value stays visible, flagged unconfirmed.
                self.registry.mark_unconfirmed(vehicle);
                CommandStatus::TimedOut
            }
        };

        if let Some(mut lane) = self.lanes.get_mut(vehicle) {
            if lane.in_flight == Some(id) {
                lane.in_flight = None;
            }
            if let Some(record) = lane.records.get_mut(&id) {
                record.status = status;
                record.resolved_at = Some(Utc::now());
                if let Resolution::Failed(reason) = &resolution {
                    record.failure_reason = Some(reason.clone());
                }
            }
        }

        match status {
            CommandStatus::Confirmed => self.logger.info(&format!(
                "Command {} ({}) on {} confirmed",
                id, kind, vehicle
            )),
            CommandStatus::TimedOut => self.logger.warn(&format!(
                "Command {} ({}) on {} timed out; outcome unknown",
                id, kind, vehicle
            )),
            _ => self.logger.warn(&format!(
                "Command {} ({}) on {} failed",
                id, kind, vehicle
            )),
        }
        self.emit_resolved(vehicle, id, kind, status);

        // Hand the lane to the next queued command
        self.start_next(vehicle);
    }

    fn set_status(&self, vehicle: &VehicleId, id: Uuid, status: CommandStatus) {
        if let Some(mut lane) = self.lanes.get_mut(vehicle)
            && let Some(record) = lane.records.get_mut(&id)
        {
            record.status = status;
        }
    }

    fn emit_resolved(&self, vehicle: &VehicleId, id: Uuid, kind: CommandKind, status: CommandStatus) {
        self.events.emit(FleetEvent::CommandResolved {
            vehicle: vehicle.clone(),
            command_id: id,
            kind,
            status,
        });
    }
}
