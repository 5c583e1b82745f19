//! Reconciliation of incoming telemetry against the registry
//!
//! Each successful fetch is diffed field-by-field against the stored
//! entry. Out-of-order responses (older `last_observed_at`) are dropped so
//! concurrent retries can never regress state; accepted writes emit a
//! `VehicleStateChanged` event carrying only the changed fields.

use crate::events::{EventBus, FleetEvent};
use crate::logging::get_logger;
use crate::model::{CanonicalVehicleState, StateField};
use crate::registry::{ApplyOutcome, VehicleStateRegistry};
use std::sync::Arc;

/// Field-by-field diff between two canonical states
pub(crate) fn diff_states(
    old: &CanonicalVehicleState,
    new: &CanonicalVehicleState,
) -> Vec<StateField> {
    let mut changed = Vec::new();
    if old.location != new.location {
        changed.push(StateField::Location);
    }
    if old.energy != new.energy {
        changed.push(StateField::Energy);
    }
    if old.odometer_km != new.odometer_km {
        changed.push(StateField::Odometer);
    }
    if old.tire_pressures_kpa != new.tire_pressures_kpa {
        changed.push(StateField::TirePressures);
    }
    if old.lock_state != new.lock_state {
        changed.push(StateField::LockState);
    }
    if old.power_state != new.power_state {
        changed.push(StateField::PowerState);
    }
    changed
}

/// Applies telemetry observations to the registry and emits change events
pub struct Reconciler {
    registry: Arc<VehicleStateRegistry>,
    events: EventBus,
    logger: crate::logging::StructuredLogger,
}

impl Reconciler {
    pub fn new(registry: Arc<VehicleStateRegistry>, events: EventBus) -> Self {
        let logger = get_logger("reconcile");
        Self {
            registry,
            events,
            logger,
        }
    }

    /// Apply one incoming observation; returns whether it was accepted
    pub fn apply(&self, incoming: CanonicalVehicleState) -> bool {
        let vehicle = incoming.vehicle.clone();
        match self.registry.apply_observation(incoming) {
            ApplyOutcome::Applied { changed, version } => {
                if changed.is_empty() {
                    self.logger
                        .trace(&format!("No field changes for {} (v{})", vehicle, version));
                } else {
                    self.logger.debug(&format!(
                        "Updated {} to v{} ({} field(s) changed)",
                        vehicle,
                        version,
                        changed.len()
                    ));
                    self.events.emit(FleetEvent::VehicleStateChanged {
                        vehicle,
                        changed,
                        version,
                    });
                }
                true
            }
            ApplyOutcome::OutOfOrder => {
                self.logger
                    .debug(&format!("Discarded out-of-order observation for {}", vehicle));
                false
            }
        }
    }
}
