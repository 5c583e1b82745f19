//! Fleet event bus
//!
//! Change events for external consumers (dashboard, alerting). Events are
//! fanned out over a broadcast channel; subscribers can scope their stream
//! to a set of vehicle ids. Slow subscribers lose the oldest events
//! (broadcast semantics), which is acceptable for UI consumers.

use crate::connection::ConnectionStatus;
use crate::dispatcher::CommandStatus;
use crate::model::{CommandKind, StateField, VehicleId};
use serde::Serialize;
use std::collections::HashSet;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::Stream;
use uuid::Uuid;

/// Events emitted by the tracking core
#[derive(Debug, Clone, Serialize)]
pub enum FleetEvent {
    /// Telemetry for a vehicle changed; carries only the changed fields so
    /// consumers can update incrementally
    VehicleStateChanged {
        vehicle: VehicleId,
        changed: Vec<StateField>,
        version: u64,
    },
    /// A provider connection moved to a new lifecycle status
    ConnectionStatusChanged {
        vehicle: VehicleId,
        provider: String,
        status: ConnectionStatus,
    },
    /// A remote command reached a terminal status
    CommandResolved {
        vehicle: VehicleId,
        command_id: Uuid,
        kind: CommandKind,
        status: CommandStatus,
    },
}

impl FleetEvent {
    /// The vehicle this event concerns
    pub fn vehicle(&self) -> &VehicleId {
        match self {
            FleetEvent::VehicleStateChanged { vehicle, .. }
            | FleetEvent::ConnectionStatusChanged { vehicle, .. }
            | FleetEvent::CommandResolved { vehicle, .. } => vehicle,
        }
    }
}

/// Broadcast bus carrying [`FleetEvent`]s to any number of subscribers
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FleetEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event; a bus with no subscribers drops it silently
    pub fn emit(&self, event: FleetEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to every event
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.tx.subscribe()
    }

    /// Subscribe to events for a set of vehicles; an empty set means all
    pub fn subscribe_vehicles(&self, vehicles: HashSet<VehicleId>) -> ScopedEvents {
        ScopedEvents {
            inner: BroadcastStream::new(self.tx.subscribe()),
            vehicles,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Event stream filtered to a vehicle set
pub struct ScopedEvents {
    inner: BroadcastStream<FleetEvent>,
    vehicles: HashSet<VehicleId>,
}

impl Stream for ScopedEvents {
    type Item = FleetEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => {
                    if self.vehicles.is_empty() || self.vehicles.contains(event.vehicle()) {
                        return Poll::Ready(Some(event));
                    }
                    // Out of scope; keep draining
                }
                // Lagged receiver: skip the gap and continue
                Poll::Ready(Some(Err(_))) => {}
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
