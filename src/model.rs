//! Canonical vehicle domain model
//!
//! The normalized representation of vehicle telemetry shared by every
//! component. Provider-specific shapes never cross an adapter boundary;
//! everything downstream speaks these types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Marketplace vehicle identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VehicleId(String);

impl VehicleId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VehicleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VehicleId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Remote commands that can be issued to a vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    Lock,
    Unlock,
    StartCharge,
    StopCharge,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Lock => "Lock",
            CommandKind::Unlock => "Unlock",
            CommandKind::StartCharge => "StartCharge",
            CommandKind::StopCharge => "StopCharge",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Telemetry fields a provider can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TelemetryField {
    Location,
    Battery,
    Fuel,
    Odometer,
    TirePressure,
    LockState,
    PowerState,
}

/// GPS position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
}

/// Stored energy, mutually exclusive by vehicle class
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum EnergyLevel {
    /// EV battery state of charge, percent
    Battery(f32),
    /// Combustion fuel level, percent
    Fuel(f32),
}

impl EnergyLevel {
    pub fn percent(&self) -> f32 {
        match self {
            EnergyLevel::Battery(p) | EnergyLevel::Fuel(p) => *p,
        }
    }
}

/// Central locking state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockState {
    Locked,
    Unlocked,
    Unknown,
}

/// Engine / charging state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    Off,
    EngineOn,
    Charging,
    Unknown,
}

/// Tire pressures in kPa
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TirePressures {
    pub front_left: f32,
    pub front_right: f32,
    pub rear_left: f32,
    pub rear_right: f32,
}

/// The single normalized representation of a vehicle's telemetry
///
/// Mutated only by reconciliation; `version` increases on every accepted
/// write and a write carrying an older `last_observed_at` is discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalVehicleState {
    pub vehicle: VehicleId,
    pub provider: String,
    pub location: Option<Location>,
    pub energy: Option<EnergyLevel>,
    pub odometer_km: Option<f64>,
    pub tire_pressures_kpa: Option<TirePressures>,
    pub lock_state: LockState,
    pub power_state: PowerState,
    pub last_observed_at: DateTime<Utc>,
    pub version: u64,
}

/// Fields of [`CanonicalVehicleState`] that reconciliation diffs and
/// reports in change events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateField {
    Location,
    Energy,
    Odometer,
    TirePressures,
    LockState,
    PowerState,
}

/// Read-time freshness judgment on stored state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Freshness {
    Fresh,
    Stale,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vehicle_id_roundtrip() {
        let id = VehicleId::new("veh-42");
        assert_eq!(id.as_str(), "veh-42");
        assert_eq!(id.to_string(), "veh-42");
    }

    #[test]
    fn test_energy_level_percent() {
        assert_eq!(EnergyLevel::Battery(81.5).percent(), 81.5);
        assert_eq!(EnergyLevel::Fuel(40.0).percent(), 40.0);
    }

    #[test]
    fn test_command_kind_display() {
        assert_eq!(CommandKind::StartCharge.to_string(), "StartCharge");
    }
}
