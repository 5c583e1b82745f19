//! Shared test fixtures: a scripted in-process provider adapter and
//! config helpers.
#![allow(dead_code)]

use argus::config::{Config, ProviderConfig, ProviderKind};
use argus::error::{ArgusError, Result};
use argus::model::{
    CanonicalVehicleState, CommandKind, EnergyLevel, LockState, PowerState, TelemetryField,
    VehicleId,
};
use argus::provider::{
    Capabilities, ProviderAdapter, RemoteCommandStatus, TokenSet, VehicleRef,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub const SIM_PROVIDER: &str = "sim";

/// One scripted fetch response
#[allow(dead_code)]
pub enum FetchScript {
    State(CanonicalVehicleState),
    RateLimited(Option<u64>),
    Unreachable,
    AuthExpired,
}

/// One scripted send response
#[allow(dead_code)]
pub enum SendScript {
    Accept,
    AuthExpired,
    Fail(String),
}

/// One scripted confirmation-poll response
#[allow(dead_code)]
pub enum PollScript {
    Pending,
    Confirmed,
    Failed(String),
}

/// Programmable provider adapter for exercising the tracking core
/// without a network
pub struct ScriptedAdapter {
    capabilities: Capabilities,
    pub fetches: Mutex<VecDeque<FetchScript>>,
    pub sends: Mutex<VecDeque<SendScript>>,
    pub polls: Mutex<VecDeque<PollScript>>,
    pub fetch_count: AtomicUsize,
    pub send_count: AtomicUsize,
    pub poll_count: AtomicUsize,
    pub revoke_count: AtomicUsize,
    pub refresh_ok: AtomicBool,
    pub revoke_ok: AtomicBool,
    /// High-water mark of concurrently executing commands (send through
    /// terminal poll)
    pub active_commands: AtomicUsize,
    pub max_active_commands: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self {
            capabilities: Capabilities::new(
                &[
                    CommandKind::Lock,
                    CommandKind::Unlock,
                    CommandKind::StartCharge,
                    CommandKind::StopCharge,
                ],
                &[
                    TelemetryField::Location,
                    TelemetryField::Battery,
                    TelemetryField::Odometer,
                    TelemetryField::LockState,
                    TelemetryField::PowerState,
                ],
            ),
            fetches: Mutex::new(VecDeque::new()),
            sends: Mutex::new(VecDeque::new()),
            polls: Mutex::new(VecDeque::new()),
            fetch_count: AtomicUsize::new(0),
            send_count: AtomicUsize::new(0),
            poll_count: AtomicUsize::new(0),
            revoke_count: AtomicUsize::new(0),
            refresh_ok: AtomicBool::new(true),
            revoke_ok: AtomicBool::new(true),
            active_commands: AtomicUsize::new(0),
            max_active_commands: AtomicUsize::new(0),
        }
    }

    /// Adapter that only supports locking (a combustion vehicle)
    pub fn without_charging() -> Self {
        let mut adapter = Self::new();
        adapter.capabilities = Capabilities::new(
            &[CommandKind::Lock, CommandKind::Unlock],
            &[
                TelemetryField::Location,
                TelemetryField::Fuel,
                TelemetryField::LockState,
            ],
        );
        adapter
    }

    pub fn push_fetch(&self, script: FetchScript) {
        self.fetches.lock().unwrap().push_back(script);
    }

    pub fn push_send(&self, script: SendScript) {
        self.sends.lock().unwrap().push_back(script);
    }

    pub fn push_poll(&self, script: PollScript) {
        self.polls.lock().unwrap().push_back(script);
    }

    fn command_started(&self) {
        let active = self.active_commands.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_commands.fetch_max(active, Ordering::SeqCst);
    }

    fn command_finished(&self) {
        self.active_commands.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Default telemetry observation with the current wall-clock timestamp
pub fn default_state(vehicle: &VehicleId) -> CanonicalVehicleState {
    CanonicalVehicleState {
        vehicle: vehicle.clone(),
        provider: SIM_PROVIDER.to_string(),
        location: Some(argus::model::Location {
            lat: 52.0,
            lng: 4.3,
        }),
        energy: Some(EnergyLevel::Battery(64.0)),
        odometer_km: Some(12_000.0),
        tire_pressures_kpa: None,
        lock_state: LockState::Locked,
        power_state: PowerState::Off,
        last_observed_at: chrono::Utc::now(),
        version: 0,
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn id(&self) -> &str {
        SIM_PROVIDER
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn authorize_url(&self, vehicle: &VehicleId) -> String {
        format!("https://sim.example/authorize?state={}", vehicle)
    }

    async fn exchange_code(&self, code: &str) -> Result<(TokenSet, VehicleRef)> {
        Ok((
            TokenSet {
                access_token: "access".to_string(),
                refresh_token: Some("refresh".to_string()),
                expires_at: None,
            },
            VehicleRef::new(format!("unit-{}", code)),
        ))
    }

    async fn refresh_tokens(&self, tokens: &TokenSet) -> Result<TokenSet> {
        if self.refresh_ok.load(Ordering::SeqCst) {
            Ok(TokenSet {
                access_token: "access-2".to_string(),
                refresh_token: tokens.refresh_token.clone(),
                expires_at: None,
            })
        } else {
            Err(ArgusError::revoked(SIM_PROVIDER))
        }
    }

    async fn revoke(&self, _tokens: &TokenSet) -> Result<()> {
        self.revoke_count.fetch_add(1, Ordering::SeqCst);
        if self.revoke_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ArgusError::network("provider unreachable"))
        }
    }

    async fn fetch_state(
        &self,
        _tokens: &TokenSet,
        vehicle: &VehicleId,
        _vehicle_ref: &VehicleRef,
    ) -> Result<CanonicalVehicleState> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        let script = self.fetches.lock().unwrap().pop_front();
        match script {
            Some(FetchScript::State(state)) => Ok(state),
            Some(FetchScript::RateLimited(retry_after)) => {
                Err(ArgusError::rate_limited(SIM_PROVIDER, retry_after))
            }
            Some(FetchScript::Unreachable) => Err(ArgusError::unreachable(vehicle.as_str())),
            Some(FetchScript::AuthExpired) => Err(ArgusError::auth_expired(SIM_PROVIDER)),
            None => Ok(default_state(vehicle)),
        }
    }

    async fn send_command(
        &self,
        _tokens: &TokenSet,
        _vehicle_ref: &VehicleRef,
        _kind: CommandKind,
    ) -> Result<String> {
        let n = self.send_count.fetch_add(1, Ordering::SeqCst);
        let script = self.sends.lock().unwrap().pop_front();
        match script {
            Some(SendScript::Accept) | None => {
                self.command_started();
                Ok(format!("cmd-{}", n))
            }
            Some(SendScript::AuthExpired) => Err(ArgusError::auth_expired(SIM_PROVIDER)),
            Some(SendScript::Fail(reason)) => {
                Err(ArgusError::provider(SIM_PROVIDER, reason.as_str()))
            }
        }
    }

    async fn poll_command(
        &self,
        _tokens: &TokenSet,
        _provider_command_id: &str,
    ) -> Result<RemoteCommandStatus> {
        self.poll_count.fetch_add(1, Ordering::SeqCst);
        let script = self.polls.lock().unwrap().pop_front();
        match script {
            Some(PollScript::Pending) => Ok(RemoteCommandStatus::Pending),
            Some(PollScript::Failed(reason)) => {
                self.command_finished();
                Ok(RemoteCommandStatus::Failed { reason })
            }
            Some(PollScript::Confirmed) | None => {
                self.command_finished();
                Ok(RemoteCommandStatus::Confirmed)
            }
        }
    }
}

/// Config with a single scripted provider and a throwaway state file
pub fn sim_config(state_dir: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.providers = vec![ProviderConfig {
        id: SIM_PROVIDER.to_string(),
        display_name: "Simulated Provider".to_string(),
        kind: ProviderKind::Titan,
        base_url: "https://sim.example".to_string(),
        max_concurrent_requests: 4,
        rate_limit_backoff_ceiling_secs: 900,
        commands: vec![
            CommandKind::Lock,
            CommandKind::Unlock,
            CommandKind::StartCharge,
            CommandKind::StopCharge,
        ],
        telemetry: vec![TelemetryField::Battery, TelemetryField::LockState],
    }];
    config.connections.state_file = state_dir
        .path()
        .join("connections.json")
        .to_string_lossy()
        .to_string();
    config
}

/// Build a service around one scripted adapter and connect a vehicle
pub async fn connected_service(
    config: Config,
    adapter: std::sync::Arc<ScriptedAdapter>,
    vehicle: &VehicleId,
) -> std::sync::Arc<argus::TrackingService> {
    let mut adapters: std::collections::HashMap<
        String,
        std::sync::Arc<dyn ProviderAdapter>,
    > = std::collections::HashMap::new();
    adapters.insert(SIM_PROVIDER.to_string(), adapter);

    let service = std::sync::Arc::new(
        argus::TrackingService::with_adapters(config, adapters).unwrap(),
    );
    service.connect(vehicle, SIM_PROVIDER).unwrap();
    service.complete_connect(vehicle, "code-1").await.unwrap();
    service
}
