//! Sync scheduling
//!
//! Decides which vehicles to poll and when. The core is an explicit,
//! synchronous job board (a priority queue keyed by next-poll time) that
//! the async loop drives; keeping the data structure separate from the
//! runtime makes the scheduling rules testable without timers.
//!
//! Tiers set the base cadence: ACTIVE_TRIP polls at a fixed short
//! interval, IDLE and BACKGROUND spread vehicles across a jittered window
//! so a fleet never polls in lockstep. Rate limiting pushes a job out with
//! exponential backoff capped at the provider's ceiling. A vehicle never
//! has two fetches in flight; due entries for a busy vehicle are skipped,
//! not duplicated.

use crate::config::{Config, SchedulerConfig};
use crate::logging::get_logger;
use crate::model::VehicleId;
use crate::registry::VehicleStateRegistry;
use async_trait::async_trait;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, Semaphore, watch};
use tokio::time::Instant;

/// Poll priority tier for one vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityTier {
    ActiveTrip,
    Idle,
    Background,
}

impl PriorityTier {
    /// Lower rank polls more often
    fn rank(self) -> u8 {
        match self {
            PriorityTier::ActiveTrip => 0,
            PriorityTier::Idle => 1,
            PriorityTier::Background => 2,
        }
    }
}

/// Outcome of one sync attempt, as the executor reports it back
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// Telemetry fetched and reconciled
    Success,
    /// Provider rate limit hit; job is pushed out with backoff
    RateLimited { retry_after: Option<Duration> },
    /// Transient failure (vehicle unreachable, network); tier cadence
    /// continues and consumers simply see the state go stale
    Transient,
    /// The connection is no longer usable; the job is removed until the
    /// lifecycle manager re-activates it
    Halt,
}

/// Executes one sync for a vehicle: adapter fetch plus reconciliation
#[async_trait]
pub trait SyncExecutor: Send + Sync {
    async fn sync_vehicle(&self, vehicle: &VehicleId) -> SyncOutcome;
}

#[derive(Debug)]
struct JobState {
    provider: String,
    tier: PriorityTier,
    /// Tier interval with this vehicle's jitter applied
    base_interval: Duration,
    /// Backoff ceiling from the provider's rate-limit policy
    backoff_ceiling: Duration,
    backoff_exp: u32,
    in_flight: bool,
    /// Entries in the heap with an older sequence number are stale
    seq: u64,
    due_at: Instant,
}

#[derive(Debug, PartialEq, Eq)]
struct QueuedJob {
    due_at: Instant,
    seq: u64,
    vehicle: VehicleId,
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due_at
            .cmp(&other.due_at)
            .then_with(|| self.seq.cmp(&other.seq))
            .then_with(|| self.vehicle.cmp(&other.vehicle))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A job popped from the board, ready to execute
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyJob {
    pub vehicle: VehicleId,
    pub provider: String,
}

/// Priority queue of sync jobs keyed by next-poll time
///
/// Purely synchronous; every operation takes the current instant so tests
/// can drive it deterministically.
pub struct JobBoard {
    heap: BinaryHeap<Reverse<QueuedJob>>,
    jobs: HashMap<VehicleId, JobState>,
    config: SchedulerConfig,
}

impl JobBoard {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            heap: BinaryHeap::new(),
            jobs: HashMap::new(),
            config,
        }
    }

    /// Register a vehicle; the first poll is due immediately
    pub fn add_vehicle(
        &mut self,
        vehicle: VehicleId,
        provider: String,
        tier: PriorityTier,
        backoff_ceiling: Duration,
        now: Instant,
    ) {
        let base_interval = self.tier_interval(&vehicle, tier);
        let state = JobState {
            provider,
            tier,
            base_interval,
            backoff_ceiling,
            backoff_exp: 0,
            in_flight: false,
            seq: 0,
            due_at: now,
        };
        self.jobs.insert(vehicle.clone(), state);
        self.heap.push(Reverse(QueuedJob {
            due_at: now,
            seq: 0,
            vehicle,
        }));
    }

    /// Remove a vehicle and its pending job
    pub fn remove_vehicle(&mut self, vehicle: &VehicleId) {
        self.jobs.remove(vehicle);
        // Heap entries become orphans and are dropped on pop
    }

    /// Move a vehicle to a new tier without touching its backoff state
    ///
    /// An upgrade to a faster tier polls promptly; a downgrade waits out
    /// the new, longer interval.
    pub fn set_tier(&mut self, vehicle: &VehicleId, tier: PriorityTier, now: Instant) {
        let interval = self.tier_interval(vehicle, tier);
        if let Some(state) = self.jobs.get_mut(vehicle) {
            let upgrade = tier.rank() < state.tier.rank();
            state.tier = tier;
            state.base_interval = interval;
            if state.in_flight {
                // Completion reschedules with the new cadence
                return;
            }
            state.seq += 1;
            state.due_at = if upgrade { now } else { now + interval };
            self.heap.push(Reverse(QueuedJob {
                due_at: state.due_at,
                seq: state.seq,
                vehicle: vehicle.clone(),
            }));
        }
    }

    /// Enqueue a one-off immediate poll without disturbing the
    /// steady-state tier
    pub fn request_refresh(&mut self, vehicle: &VehicleId, now: Instant) {
        if let Some(state) = self.jobs.get(vehicle) {
            if state.in_flight {
                // A fetch is already running; its result is fresh enough
                return;
            }
            self.heap.push(Reverse(QueuedJob {
                due_at: now,
                seq: state.seq,
                vehicle: vehicle.clone(),
            }));
        }
    }

    /// When the earliest valid job comes due
    pub fn next_due(&mut self) -> Option<Instant> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            match self.jobs.get(&entry.vehicle) {
                Some(state) if state.seq == entry.seq && !state.in_flight => {
                    return Some(entry.due_at);
                }
                _ => {
                    self.heap.pop();
                }
            }
        }
        None
    }

    /// Pop every job due at `now`, marking each vehicle in flight
    pub fn pop_due(&mut self, now: Instant) -> Vec<ReadyJob> {
        let mut ready = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.due_at > now {
                break;
            }
            let Some(Reverse(entry)) = self.heap.pop() else {
                break;
            };
            let Some(state) = self.jobs.get_mut(&entry.vehicle) else {
                continue;
            };
            if state.seq != entry.seq || state.in_flight {
                continue;
            }
            state.in_flight = true;
            ready.push(ReadyJob {
                vehicle: entry.vehicle,
                provider: state.provider.clone(),
            });
        }
        ready
    }

    /// Record a finished sync and schedule the next poll
    ///
    /// Returns the interval until the next poll, which also feeds the
    /// registry's staleness threshold.
    pub fn complete(
        &mut self,
        vehicle: &VehicleId,
        outcome: &SyncOutcome,
        now: Instant,
    ) -> Option<Duration> {
        let state = self.jobs.get_mut(vehicle)?;
        state.in_flight = false;
        state.seq += 1;

        let delay = match outcome {
            SyncOutcome::Success => {
                state.backoff_exp = 0;
                state.base_interval
            }
            SyncOutcome::RateLimited { retry_after } => {
                state.backoff_exp = state.backoff_exp.saturating_add(1);
                let shift = state.backoff_exp.min(16);
                let backed_off = state
                    .base_interval
                    .saturating_mul(1u32 << shift)
                    .min(state.backoff_ceiling);
                match retry_after {
                    Some(hint) => backed_off.max(*hint).min(state.backoff_ceiling),
                    None => backed_off,
                }
            }
            SyncOutcome::Transient => state.base_interval,
            SyncOutcome::Halt => {
                self.jobs.remove(vehicle);
                return None;
            }
        };

        state.due_at = now + delay;
        self.heap.push(Reverse(QueuedJob {
            due_at: state.due_at,
            seq: state.seq,
            vehicle: vehicle.clone(),
        }));
        Some(delay)
    }

    /// The interval a vehicle is currently polled at
    pub fn current_interval(&self, vehicle: &VehicleId) -> Option<Duration> {
        self.jobs.get(vehicle).map(|s| s.base_interval)
    }

    pub fn contains(&self, vehicle: &VehicleId) -> bool {
        self.jobs.contains_key(vehicle)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Tier interval with deterministic per-vehicle jitter
    ///
    /// Jitter is a hash of the vehicle id spread across the tier window,
    /// so the herd spreads out but scheduling stays reproducible.
    fn tier_interval(&self, vehicle: &VehicleId, tier: PriorityTier) -> Duration {
        let (min_secs, max_secs) = match tier {
            PriorityTier::ActiveTrip => (
                self.config.active_trip_interval_secs,
                self.config.active_trip_interval_secs,
            ),
            PriorityTier::Idle => (
                self.config.idle_interval_min_secs,
                self.config.idle_interval_max_secs,
            ),
            PriorityTier::Background => (
                self.config.background_interval_min_secs,
                self.config.background_interval_max_secs,
            ),
        };
        if max_secs <= min_secs {
            return Duration::from_secs(min_secs);
        }
        let span = max_secs - min_secs + 1;
        Duration::from_secs(min_secs + vehicle_hash(vehicle) % span)
    }
}

/// Stable per-vehicle hash (FNV-1a) for jitter placement
fn vehicle_hash(vehicle: &VehicleId) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in vehicle.as_str().bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Async scheduler driving the job board with per-provider concurrency
/// limits
pub struct SyncScheduler {
    board: Mutex<JobBoard>,
    /// One semaphore per provider; providers are independent resources
    provider_limits: HashMap<String, Arc<Semaphore>>,
    provider_ceilings: HashMap<String, Duration>,
    registry: Arc<VehicleStateRegistry>,
    wakeup: Notify,
    shutdown_tx: watch::Sender<bool>,
    logger: crate::logging::StructuredLogger,
}

impl SyncScheduler {
    pub fn new(config: &Config, registry: Arc<VehicleStateRegistry>) -> Self {
        let logger = get_logger("scheduler");
        let mut provider_limits = HashMap::new();
        let mut provider_ceilings = HashMap::new();
        for provider in &config.providers {
            provider_limits.insert(
                provider.id.clone(),
                Arc::new(Semaphore::new(provider.max_concurrent_requests)),
            );
            provider_ceilings.insert(
                provider.id.clone(),
                Duration::from_secs(provider.rate_limit_backoff_ceiling_secs),
            );
        }
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            board: Mutex::new(JobBoard::new(config.scheduler.clone())),
            provider_limits,
            provider_ceilings,
            registry,
            wakeup: Notify::new(),
            shutdown_tx,
            logger,
        }
    }

    /// Register a vehicle for polling
    pub async fn add_vehicle(&self, vehicle: VehicleId, provider: String, tier: PriorityTier) {
        let ceiling = self
            .provider_ceilings
            .get(&provider)
            .copied()
            .unwrap_or(Duration::from_secs(900));
        let mut board = self.board.lock().await;
        board.add_vehicle(vehicle.clone(), provider, tier, ceiling, Instant::now());
        if let Some(interval) = board.current_interval(&vehicle) {
            self.registry.set_poll_interval(&vehicle, interval);
        }
        drop(board);
        self.wakeup.notify_one();
    }

    /// Cancel a vehicle's pending jobs
    pub async fn remove_vehicle(&self, vehicle: &VehicleId) {
        self.board.lock().await.remove_vehicle(vehicle);
        self.wakeup.notify_one();
    }

    /// Move a vehicle between tiers
    pub async fn set_tier(&self, vehicle: &VehicleId, tier: PriorityTier) {
        let mut board = self.board.lock().await;
        board.set_tier(vehicle, tier, Instant::now());
        if let Some(interval) = board.current_interval(vehicle) {
            self.registry.set_poll_interval(vehicle, interval);
        }
        drop(board);
        self.wakeup.notify_one();
    }

    /// One-off immediate poll
    pub async fn request_refresh(&self, vehicle: &VehicleId) {
        self.board
            .lock()
            .await
            .request_refresh(vehicle, Instant::now());
        self.wakeup.notify_one();
    }

    /// Whether a vehicle is currently scheduled
    pub async fn contains(&self, vehicle: &VehicleId) -> bool {
        self.board.lock().await.contains(vehicle)
    }

    /// Interval the vehicle currently polls at
    pub async fn current_interval(&self, vehicle: &VehicleId) -> Option<Duration> {
        self.board.lock().await.current_interval(vehicle)
    }

    /// Stop the run loop
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.wakeup.notify_one();
    }

    /// Main scheduling loop
    ///
    /// Sleeps until the earliest job is due, then hands every due job to a
    /// worker task. Workers serialize per provider through that provider's
    /// semaphore and report their outcome back to the board.
    pub async fn run(self: Arc<Self>, executor: Arc<dyn SyncExecutor>) {
        self.logger.info("Sync scheduler started");
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let next_due = self.board.lock().await.next_due();
            let deadline = next_due.unwrap_or_else(|| Instant::now() + Duration::from_secs(60));

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = self.wakeup.notified() => {
                    // Board changed; recompute the sleep target
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let ready = self.board.lock().await.pop_due(Instant::now());
                    for job in ready {
                        self.spawn_worker(job, executor.clone());
                    }
                }
            }
        }
        self.logger.info("Sync scheduler stopped");
    }

    fn spawn_worker(self: &Arc<Self>, job: ReadyJob, executor: Arc<dyn SyncExecutor>) {
        let scheduler = Arc::clone(self);
        let limit = self.provider_limits.get(&job.provider).cloned();
        tokio::spawn(async move {
            // Bound concurrency per provider, never globally
            let _permit = match &limit {
                Some(semaphore) => semaphore.acquire().await.ok(),
                None => None,
            };

            let outcome = executor.sync_vehicle(&job.vehicle).await;

            let mut board = scheduler.board.lock().await;
            let next = board.complete(&job.vehicle, &outcome, Instant::now());
            drop(board);

            if let Some(interval) = next {
                scheduler
                    .registry
                    .set_poll_interval(&job.vehicle, interval);
                if matches!(outcome, SyncOutcome::RateLimited { .. }) {
                    scheduler.logger.debug(&format!(
                        "Rate limited on {}; next poll in {}s",
                        job.vehicle,
                        interval.as_secs()
                    ));
                }
            }
            scheduler.wakeup.notify_one();
        });
    }
}
