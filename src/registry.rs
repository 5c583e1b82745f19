//! Vehicle state registry
//!
//! Per-vehicle canonical state store with versioning, staleness tracking,
//! and the optimistic-update overlay used by the command dispatcher. The
//! registry is the single source of truth consumers read from; it is
//! mutated through reconciliation (telemetry) and the dispatcher's
//! optimistic contract (commands). Entries are keyed per vehicle in a
//! sharded map so unrelated vehicles never contend on one lock.

use crate::model::{
    CanonicalVehicleState, CommandKind, Freshness, LockState, PowerState, StateField, VehicleId,
};
use crate::reconcile::diff_states;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;

/// Optimistic overlay for a single in-flight command
#[derive(Debug, Clone)]
struct OptimisticPatch {
    field: StateField,
    lock_state: Option<LockState>,
    power_state: Option<PowerState>,
    /// Set when the command timed out: the value stays visible but is no
    /// longer claimed as confirmed
    unconfirmed: bool,
}

impl OptimisticPatch {
    fn for_command(kind: CommandKind) -> Self {
        match kind {
            CommandKind::Lock => Self {
                field: StateField::LockState,
                lock_state: Some(LockState::Locked),
                power_state: None,
                unconfirmed: false,
            },
            CommandKind::Unlock => Self {
                field: StateField::LockState,
                lock_state: Some(LockState::Unlocked),
                power_state: None,
                unconfirmed: false,
            },
            CommandKind::StartCharge => Self {
                field: StateField::PowerState,
                lock_state: None,
                power_state: Some(PowerState::Charging),
                unconfirmed: false,
            },
            CommandKind::StopCharge => Self {
                field: StateField::PowerState,
                lock_state: None,
                power_state: Some(PowerState::Off),
                unconfirmed: false,
            },
        }
    }
}

#[derive(Debug)]
struct Entry {
    /// Last reconciled canonical state; never reflects optimistic values
    state: CanonicalVehicleState,
    optimistic: Option<OptimisticPatch>,
    /// Interval the scheduler most recently assigned, used for the lazy
    /// staleness judgment at read time
    poll_interval: Duration,
}

/// Outcome of applying one incoming observation
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Write accepted; `changed` lists the fields that differ from the
    /// previous entry
    Applied { changed: Vec<StateField>, version: u64 },
    /// Write carried an older or equal observation timestamp and was
    /// discarded
    OutOfOrder,
}

/// One vehicle's registry read, with the optimistic overlay merged in
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    pub state: CanonicalVehicleState,
    pub freshness: Freshness,
    /// True while an optimistic value is visible that the provider never
    /// confirmed (timed-out command)
    pub unconfirmed: bool,
}

/// Per-vehicle canonical state store
pub struct VehicleStateRegistry {
    entries: DashMap<VehicleId, Entry>,
    staleness_factor: f64,
    default_poll_interval: Duration,
}

impl VehicleStateRegistry {
    pub fn new(staleness_factor: f64, default_poll_interval: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            staleness_factor,
            default_poll_interval,
        }
    }

    /// Apply a reconciled observation
    ///
    /// Accepts the write only if `last_observed_at` is strictly newer than
    /// the stored one; the version counter increases on every accepted
    /// write. An accepted observation clears a lingering unconfirmed
    /// overlay, since real telemetry supersedes an ambiguous command
    /// outcome.
    pub(crate) fn apply_observation(&self, mut incoming: CanonicalVehicleState) -> ApplyOutcome {
        let mut entry = self
            .entries
            .entry(incoming.vehicle.clone())
            .or_insert_with(|| Entry {
                state: placeholder_state(&incoming),
                optimistic: None,
                poll_interval: self.default_poll_interval,
            });

        if incoming.last_observed_at <= entry.state.last_observed_at && entry.state.version > 0 {
            return ApplyOutcome::OutOfOrder;
        }

        let changed = diff_states(&entry.state, &incoming);
        incoming.version = entry.state.version + 1;
        let version = incoming.version;
        entry.state = incoming;

        if entry
            .optimistic
            .as_ref()
            .map(|p| p.unconfirmed)
            .unwrap_or(false)
        {
            entry.optimistic = None;
        }

        ApplyOutcome::Applied { changed, version }
    }

    /// Merged view of one vehicle (optimistic overlay applied)
    pub fn get(&self, vehicle: &VehicleId) -> Option<CanonicalVehicleState> {
        self.entries.get(vehicle).map(|e| merged_state(&e))
    }

    /// Read one vehicle with its freshness annotation
    pub fn snapshot(&self, vehicle: &VehicleId, now: DateTime<Utc>) -> Option<RegistrySnapshot> {
        self.entries.get(vehicle).map(|e| {
            let threshold = e.poll_interval.as_secs_f64() * self.staleness_factor;
            let age = (now - e.state.last_observed_at).num_milliseconds() as f64 / 1000.0;
            RegistrySnapshot {
                state: merged_state(&e),
                freshness: if age <= threshold {
                    Freshness::Fresh
                } else {
                    Freshness::Stale
                },
                unconfirmed: e
                    .optimistic
                    .as_ref()
                    .map(|p| p.unconfirmed)
                    .unwrap_or(false),
            }
        })
    }

    /// Record the poll interval the scheduler currently runs this vehicle
    /// at; feeds the staleness threshold
    pub fn set_poll_interval(&self, vehicle: &VehicleId, interval: Duration) {
        if let Some(mut entry) = self.entries.get_mut(vehicle) {
            entry.poll_interval = interval;
        }
    }

    /// Overlay the expected post-command value for an in-flight command
    pub(crate) fn apply_optimistic(&self, vehicle: &VehicleId, kind: CommandKind) {
        if let Some(mut entry) = self.entries.get_mut(vehicle) {
            entry.optimistic = Some(OptimisticPatch::for_command(kind));
        }
    }

    /// Fold the optimistic value into the canonical state (command
    /// confirmed); bumps the version so consumers see a new write
    pub(crate) fn confirm_optimistic(&self, vehicle: &VehicleId) {
        if let Some(mut entry) = self.entries.get_mut(vehicle)
            && let Some(patch) = entry.optimistic.take()
        {
            if let Some(lock) = patch.lock_state {
                entry.state.lock_state = lock;
            }
            if let Some(power) = patch.power_state {
                entry.state.power_state = power;
            }
            entry.state.version += 1;
        }
    }

    /// Drop the optimistic overlay (command failed); the canonical state
    /// was never touched, so the last confirmed value reappears
    pub(crate) fn rollback_optimistic(&self, vehicle: &VehicleId) {
        if let Some(mut entry) = self.entries.get_mut(vehicle) {
            entry.optimistic = None;
        }
    }

    /// Keep the optimistic value visible but flag it unconfirmed (command
    /// timed out; the vehicle's true state is unknown)
    pub(crate) fn mark_unconfirmed(&self, vehicle: &VehicleId) -> Option<StateField> {
        if let Some(mut entry) = self.entries.get_mut(vehicle)
            && let Some(patch) = entry.optimistic.as_mut()
        {
            patch.unconfirmed = true;
            return Some(patch.field);
        }
        None
    }

    /// Remove a vehicle entirely (disconnect teardown)
    pub fn remove(&self, vehicle: &VehicleId) {
        self.entries.remove(vehicle);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Merged view: canonical state with any optimistic overlay applied
fn merged_state(entry: &Entry) -> CanonicalVehicleState {
    let mut state = entry.state.clone();
    if let Some(patch) = &entry.optimistic {
        if let Some(lock) = patch.lock_state {
            state.lock_state = lock;
        }
        if let Some(power) = patch.power_state {
            state.power_state = power;
        }
    }
    state
}

/// Zero entry used before the first accepted observation
fn placeholder_state(incoming: &CanonicalVehicleState) -> CanonicalVehicleState {
    CanonicalVehicleState {
        vehicle: incoming.vehicle.clone(),
        provider: incoming.provider.clone(),
        location: None,
        energy: None,
        odometer_km: None,
        tire_pressures_kpa: None,
        lock_state: LockState::Unknown,
        power_state: PowerState::Unknown,
        last_observed_at: DateTime::<Utc>::MIN_UTC,
        version: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn observation(vehicle: &str, secs: i64, lock: LockState) -> CanonicalVehicleState {
        CanonicalVehicleState {
            vehicle: VehicleId::new(vehicle),
            provider: "titan".to_string(),
            location: None,
            energy: Some(crate::model::EnergyLevel::Battery(50.0)),
            odometer_km: Some(100.0),
            tire_pressures_kpa: None,
            lock_state: lock,
            power_state: PowerState::Off,
            last_observed_at: Utc.timestamp_opt(secs, 0).single().unwrap(),
            version: 0,
        }
    }

    fn registry() -> VehicleStateRegistry {
        VehicleStateRegistry::new(2.0, Duration::from_secs(30))
    }

    #[test]
    fn test_first_observation_is_applied() {
        let reg = registry();
        let outcome = reg.apply_observation(observation("veh-1", 1_000, LockState::Locked));
        match outcome {
            ApplyOutcome::Applied { version, .. } => assert_eq!(version, 1),
            ApplyOutcome::OutOfOrder => panic!("first write must be accepted"),
        }
        assert_eq!(
            reg.get(&VehicleId::new("veh-1")).unwrap().lock_state,
            LockState::Locked
        );
    }

    #[test]
    fn test_out_of_order_write_discarded() {
        let reg = registry();
        reg.apply_observation(observation("veh-1", 2_000, LockState::Locked));
        let outcome = reg.apply_observation(observation("veh-1", 1_000, LockState::Unlocked));
        assert_eq!(outcome, ApplyOutcome::OutOfOrder);
        // Equal timestamps are discarded too
        let outcome = reg.apply_observation(observation("veh-1", 2_000, LockState::Unlocked));
        assert_eq!(outcome, ApplyOutcome::OutOfOrder);

        let state = reg.get(&VehicleId::new("veh-1")).unwrap();
        assert_eq!(state.lock_state, LockState::Locked);
        assert_eq!(state.version, 1);
    }

    #[test]
    fn test_version_only_increases() {
        let reg = registry();
        for (i, secs) in [1_000, 2_000, 3_000].iter().enumerate() {
            let outcome = reg.apply_observation(observation("veh-1", *secs, LockState::Locked));
            match outcome {
                ApplyOutcome::Applied { version, .. } => assert_eq!(version, i as u64 + 1),
                ApplyOutcome::OutOfOrder => panic!("newer write must be accepted"),
            }
        }
    }

    #[test]
    fn test_optimistic_overlay_and_rollback() {
        let reg = registry();
        reg.apply_observation(observation("veh-1", 1_000, LockState::Locked));
        let id = VehicleId::new("veh-1");

        reg.apply_optimistic(&id, CommandKind::Unlock);
        assert_eq!(reg.get(&id).unwrap().lock_state, LockState::Unlocked);

        reg.rollback_optimistic(&id);
        assert_eq!(reg.get(&id).unwrap().lock_state, LockState::Locked);
    }

    #[test]
    fn test_optimistic_confirm_becomes_authoritative() {
        let reg = registry();
        reg.apply_observation(observation("veh-1", 1_000, LockState::Locked));
        let id = VehicleId::new("veh-1");

        reg.apply_optimistic(&id, CommandKind::Unlock);
        reg.confirm_optimistic(&id);

        let state = reg.get(&id).unwrap();
        assert_eq!(state.lock_state, LockState::Unlocked);
        assert_eq!(state.version, 2);
        let snap = reg.snapshot(&id, Utc.timestamp_opt(1_010, 0).single().unwrap()).unwrap();
        assert!(!snap.unconfirmed);
    }

    #[test]
    fn test_timed_out_command_leaves_unconfirmed_flag() {
        let reg = registry();
        reg.apply_observation(observation("veh-1", 1_000, LockState::Locked));
        let id = VehicleId::new("veh-1");

        reg.apply_optimistic(&id, CommandKind::Unlock);
        assert_eq!(reg.mark_unconfirmed(&id), Some(StateField::LockState));

        let snap = reg
            .snapshot(&id, Utc.timestamp_opt(1_010, 0).single().unwrap())
            .unwrap();
        assert!(snap.unconfirmed);
        // The ambiguous value stays visible rather than silently reverting
        assert_eq!(snap.state.lock_state, LockState::Unlocked);
    }

    #[test]
    fn test_fresh_observation_clears_unconfirmed_overlay() {
        let reg = registry();
        reg.apply_observation(observation("veh-1", 1_000, LockState::Locked));
        let id = VehicleId::new("veh-1");
        reg.apply_optimistic(&id, CommandKind::Unlock);
        reg.mark_unconfirmed(&id);

        reg.apply_observation(observation("veh-1", 2_000, LockState::Unlocked));
        let snap = reg
            .snapshot(&id, Utc.timestamp_opt(2_010, 0).single().unwrap())
            .unwrap();
        assert!(!snap.unconfirmed);
        assert_eq!(snap.state.lock_state, LockState::Unlocked);
    }

    #[test]
    fn test_staleness_is_judged_at_read_time() {
        let reg = registry();
        reg.apply_observation(observation("veh-1", 1_000, LockState::Locked));
        let id = VehicleId::new("veh-1");

        // Within 2x the 30s poll interval: fresh
        let snap = reg
            .snapshot(&id, Utc.timestamp_opt(1_050, 0).single().unwrap())
            .unwrap();
        assert_eq!(snap.freshness, Freshness::Fresh);

        // Beyond it: stale, without any timer having run
        let snap = reg
            .snapshot(&id, Utc.timestamp_opt(1_061, 0).single().unwrap())
            .unwrap();
        assert_eq!(snap.freshness, Freshness::Stale);
    }

    #[test]
    fn test_staleness_follows_assigned_interval() {
        let reg = registry();
        reg.apply_observation(observation("veh-1", 1_000, LockState::Locked));
        let id = VehicleId::new("veh-1");
        reg.set_poll_interval(&id, Duration::from_secs(600));

        // Well past the default threshold but within 2x the assigned one
        let snap = reg
            .snapshot(&id, Utc.timestamp_opt(2_000, 0).single().unwrap())
            .unwrap();
        assert_eq!(snap.freshness, Freshness::Fresh);
    }

    #[test]
    fn test_remove() {
        let reg = registry();
        reg.apply_observation(observation("veh-1", 1_000, LockState::Locked));
        reg.remove(&VehicleId::new("veh-1"));
        assert!(reg.get(&VehicleId::new("veh-1")).is_none());
        assert!(reg.is_empty());
    }
}
