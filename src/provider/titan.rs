//! Titan Telematics adapter
//!
//! Titan is the EV-centric integration: battery state of charge, charging
//! state, imperial units on the wire (miles, psi). Commands use a numeric
//! envelope and resolve asynchronously through a command-status endpoint.

use super::{Capabilities, ProviderAdapter, RemoteCommandStatus, TokenSet, VehicleRef};
use crate::config::ProviderConfig;
use crate::error::{ArgusError, Result};
use crate::logging::get_logger;
use crate::model::{
    CanonicalVehicleState, CommandKind, Location, EnergyLevel, LockState, PowerState,
    TirePressures, VehicleId,
};
use async_trait::async_trait;
use serde::Deserialize;

const KM_PER_MILE: f64 = 1.609_344;
const KPA_PER_PSI: f32 = 6.894_757;

/// Titan Telematics adapter
pub struct TitanAdapter {
    provider_id: String,
    base_url: String,
    client: reqwest::Client,
    capabilities: Capabilities,
    logger: crate::logging::StructuredLogger,
}

// ── Wire types (private to this adapter) ──

#[derive(Debug, Deserialize)]
struct TitanTelemetry {
    battery_level: Option<f32>,
    charging_state: Option<String>,
    odometer_miles: Option<f64>,
    location: Option<TitanLocation>,
    tire_pressure_psi: Option<TitanTires>,
    locked: Option<bool>,
    captured_at: i64,
}

#[derive(Debug, Deserialize)]
struct TitanLocation {
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, Deserialize)]
struct TitanTires {
    front_left: f32,
    front_right: f32,
    rear_left: f32,
    rear_right: f32,
}

#[derive(Debug, Deserialize)]
struct TitanCommandResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TitanCommandState {
    state: String,
    failure_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TitanTokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    vehicle_id: String,
}

impl TitanAdapter {
    pub fn new(provider: &ProviderConfig) -> Self {
        let logger = get_logger("titan");
        Self {
            provider_id: provider.id.clone(),
            base_url: provider.base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            capabilities: Capabilities::from_config(provider),
            logger,
        }
    }

    /// Map Titan's command vocabulary onto the numeric wire envelope
    fn command_code(kind: CommandKind) -> u8 {
        match kind {
            CommandKind::Lock => 1,
            CommandKind::Unlock => 2,
            CommandKind::StartCharge => 10,
            CommandKind::StopCharge => 11,
        }
    }

    /// Map an HTTP error response into the shared taxonomy
    fn map_error(&self, status: reqwest::StatusCode, retry_after: Option<u64>) -> ArgusError {
        match status.as_u16() {
            401 => ArgusError::auth_expired(&self.provider_id),
            403 => ArgusError::revoked(&self.provider_id),
            429 => ArgusError::rate_limited(&self.provider_id, retry_after),
            408 | 504 => ArgusError::Timeout {
                message: format!("Titan request timed out ({})", status),
            },
            _ => ArgusError::provider(
                self.provider_id.as_str(),
                &format!("unexpected status {}", status),
            ),
        }
    }

    async fn check_response(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        Err(self.map_error(status, retry_after))
    }
}

/// Normalize a Titan telemetry payload into canonical form
///
/// Units are converted here (miles to km, psi to kPa); a vehicle the
/// provider reports as asleep still yields its last captured values.
fn normalize_telemetry(
    vehicle: &VehicleId,
    provider_id: &str,
    payload: TitanTelemetry,
) -> Result<CanonicalVehicleState> {
    let last_observed_at = chrono::DateTime::from_timestamp(payload.captured_at, 0)
        .ok_or_else(|| ArgusError::provider(provider_id, "invalid captured_at timestamp"))?;

    let power_state = match payload.charging_state.as_deref() {
        Some("charging") => PowerState::Charging,
        Some("driving") => PowerState::EngineOn,
        Some("complete") | Some("disconnected") | Some("idle") => PowerState::Off,
        Some(_) | None => PowerState::Unknown,
    };

    let lock_state = match payload.locked {
        Some(true) => LockState::Locked,
        Some(false) => LockState::Unlocked,
        None => LockState::Unknown,
    };

    Ok(CanonicalVehicleState {
        vehicle: vehicle.clone(),
        provider: provider_id.to_string(),
        location: payload.location.map(|l| Location {
            lat: l.latitude,
            lng: l.longitude,
        }),
        energy: payload.battery_level.map(EnergyLevel::Battery),
        odometer_km: payload.odometer_miles.map(|m| m * KM_PER_MILE),
        tire_pressures_kpa: payload.tire_pressure_psi.map(|t| TirePressures {
            front_left: t.front_left * KPA_PER_PSI,
            front_right: t.front_right * KPA_PER_PSI,
            rear_left: t.rear_left * KPA_PER_PSI,
            rear_right: t.rear_right * KPA_PER_PSI,
        }),
        lock_state,
        power_state,
        last_observed_at,
        version: 0,
    })
}

#[async_trait]
impl ProviderAdapter for TitanAdapter {
    fn id(&self) -> &str {
        &self.provider_id
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn authorize_url(&self, vehicle: &VehicleId) -> String {
        format!(
            "{}/oauth/authorize?response_type=code&state={}",
            self.base_url, vehicle
        )
    }

    async fn exchange_code(&self, code: &str) -> Result<(TokenSet, VehicleRef)> {
        let url = format!("{}/oauth/token", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "grant_type": "authorization_code",
                "code": code,
            }))
            .send()
            .await?;
        let response = self.check_response(response).await?;
        let body: TitanTokenResponse = response.json().await?;

        self.logger.info("Exchanged authorization code for tokens");
        let tokens = TokenSet {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
            expires_at: body
                .expires_in
                .map(|secs| chrono::Utc::now() + chrono::Duration::seconds(secs)),
        };
        Ok((tokens, VehicleRef::new(body.vehicle_id)))
    }

    async fn refresh_tokens(&self, tokens: &TokenSet) -> Result<TokenSet> {
        let refresh = tokens
            .refresh_token
            .as_deref()
            .ok_or_else(|| ArgusError::revoked(&self.provider_id))?;
        let url = format!("{}/oauth/token", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh,
            }))
            .send()
            .await?;
        let response = self.check_response(response).await?;
        let body: TitanTokenResponse = response.json().await?;

        Ok(TokenSet {
            access_token: body.access_token,
            refresh_token: body.refresh_token.or_else(|| tokens.refresh_token.clone()),
            expires_at: body
                .expires_in
                .map(|secs| chrono::Utc::now() + chrono::Duration::seconds(secs)),
        })
    }

    async fn revoke(&self, tokens: &TokenSet) -> Result<()> {
        let url = format!("{}/oauth/revoke", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&tokens.access_token)
            .send()
            .await?;
        self.check_response(response).await?;
        Ok(())
    }

    async fn fetch_state(
        &self,
        tokens: &TokenSet,
        vehicle: &VehicleId,
        vehicle_ref: &VehicleRef,
    ) -> Result<CanonicalVehicleState> {
        let url = format!("{}/v1/vehicles/{}/telemetry", self.base_url, vehicle_ref.as_str());
        self.logger
            .debug(&format!("Fetching telemetry for {}", vehicle));

        let response = self
            .client
            .get(&url)
            .bearer_auth(&tokens.access_token)
            .send()
            .await?;
        let status = response.status();
        // Titan answers 404 for vehicles that are asleep or out of coverage
        if status.as_u16() == 404 {
            return Err(ArgusError::unreachable(vehicle.as_str()));
        }
        let response = self.check_response(response).await?;
        let payload: TitanTelemetry = response.json().await?;

        normalize_telemetry(vehicle, &self.provider_id, payload)
    }

    async fn send_command(
        &self,
        tokens: &TokenSet,
        vehicle_ref: &VehicleRef,
        kind: CommandKind,
    ) -> Result<String> {
        let url = format!("{}/v1/vehicles/{}/commands", self.base_url, vehicle_ref.as_str());
        let response = self
            .client
            .post(&url)
            .bearer_auth(&tokens.access_token)
            .json(&serde_json::json!({ "command": Self::command_code(kind) }))
            .send()
            .await?;
        let response = self.check_response(response).await?;
        let body: TitanCommandResponse = response.json().await?;

        self.logger
            .info(&format!("Issued {} command, provider id {}", kind, body.id));
        Ok(body.id)
    }

    async fn poll_command(
        &self,
        tokens: &TokenSet,
        provider_command_id: &str,
    ) -> Result<RemoteCommandStatus> {
        let url = format!("{}/v1/commands/{}", self.base_url, provider_command_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&tokens.access_token)
            .send()
            .await?;
        let response = self.check_response(response).await?;
        let body: TitanCommandState = response.json().await?;

        Ok(match body.state.as_str() {
            "success" => RemoteCommandStatus::Confirmed,
            "failure" => RemoteCommandStatus::Failed {
                reason: body
                    .failure_reason
                    .unwrap_or_else(|| "unspecified".to_string()),
            },
            _ => RemoteCommandStatus::Pending,
        })
    }
}
