//! Meridian Connect adapter
//!
//! Meridian drives the combustion fleet: fuel level as a 0..1 fraction,
//! metric units on the wire, a string action vocabulary, and an error-code
//! body instead of bare HTTP statuses.

use super::{Capabilities, ProviderAdapter, RemoteCommandStatus, TokenSet, VehicleRef};
use crate::config::ProviderConfig;
use crate::error::{ArgusError, Result};
use crate::logging::get_logger;
use crate::model::{
    CanonicalVehicleState, CommandKind, EnergyLevel, Location, LockState, PowerState,
    TirePressures, VehicleId,
};
use async_trait::async_trait;
use serde::Deserialize;

/// Meridian Connect adapter
pub struct MeridianAdapter {
    provider_id: String,
    base_url: String,
    client: reqwest::Client,
    capabilities: Capabilities,
    logger: crate::logging::StructuredLogger,
}

// ── Wire types (private to this adapter) ──

#[derive(Debug, Deserialize)]
struct MeridianStatus {
    fuel: Option<f64>,
    odo_km: Option<f64>,
    pos: Option<MeridianPosition>,
    doors: Option<String>,
    ignition: Option<bool>,
    tires_kpa: Option<MeridianTires>,
    observed: String,
}

#[derive(Debug, Deserialize)]
struct MeridianPosition {
    lat: f64,
    lon: f64,
}

#[derive(Debug, Deserialize)]
struct MeridianTires {
    fl: f32,
    fr: f32,
    rl: f32,
    rr: f32,
}

#[derive(Debug, Deserialize)]
struct MeridianAction {
    action_id: String,
}

#[derive(Debug, Deserialize)]
struct MeridianActionState {
    status: String,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MeridianErrorBody {
    error: MeridianErrorDetail,
}

#[derive(Debug, Deserialize)]
struct MeridianErrorDetail {
    code: String,
    #[serde(default)]
    retry_after_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct MeridianTokenResponse {
    token: String,
    renewal_token: Option<String>,
    valid_for_secs: Option<i64>,
    unit_ref: String,
}

impl MeridianAdapter {
    pub fn new(provider: &ProviderConfig) -> Self {
        let logger = get_logger("meridian");
        Self {
            provider_id: provider.id.clone(),
            base_url: provider.base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            capabilities: Capabilities::from_config(provider),
            logger,
        }
    }

    /// Meridian's string action vocabulary
    fn action_name(kind: CommandKind) -> &'static str {
        match kind {
            CommandKind::Lock => "LOCK_DOORS",
            CommandKind::Unlock => "UNLOCK_DOORS",
            CommandKind::StartCharge => "CHARGE_START",
            CommandKind::StopCharge => "CHARGE_STOP",
        }
    }

    /// Map a Meridian error-code body into the shared taxonomy
    fn map_error_code(&self, detail: &MeridianErrorDetail, vehicle_hint: &str) -> ArgusError {
        match detail.code.as_str() {
            "RATE_LIMIT" => ArgusError::rate_limited(&self.provider_id, detail.retry_after_secs),
            "TOKEN_EXPIRED" => ArgusError::auth_expired(&self.provider_id),
            "ACCESS_REVOKED" => ArgusError::revoked(&self.provider_id),
            "UNIT_OFFLINE" => ArgusError::unreachable(vehicle_hint),
            "ACTION_NOT_AVAILABLE" => {
                ArgusError::unsupported(self.provider_id.as_str(), "remote action")
            }
            other => ArgusError::provider(
                self.provider_id.as_str(),
                &format!("error code {}", other),
            ),
        }
    }

    /// Decode an error response, preferring Meridian's body code over the
    /// HTTP status
    async fn decode_error(&self, response: reqwest::Response, vehicle_hint: &str) -> ArgusError {
        let status = response.status();
        if let Ok(body) = response.json::<MeridianErrorBody>().await {
            return self.map_error_code(&body.error, vehicle_hint);
        }
        match status.as_u16() {
            401 => ArgusError::auth_expired(&self.provider_id),
            429 => ArgusError::rate_limited(&self.provider_id, None),
            _ => ArgusError::provider(
                self.provider_id.as_str(),
                &format!("unexpected status {}", status),
            ),
        }
    }
}

/// Normalize a Meridian status payload into canonical form
fn normalize_status(
    vehicle: &VehicleId,
    provider_id: &str,
    payload: MeridianStatus,
) -> Result<CanonicalVehicleState> {
    let last_observed_at = payload
        .observed
        .parse::<chrono::DateTime<chrono::Utc>>()
        .map_err(|e| {
            ArgusError::provider(provider_id, &format!("invalid observed timestamp: {}", e))
        })?;

    let lock_state = match payload.doors.as_deref() {
        Some("LOCKED") => LockState::Locked,
        Some("UNLOCKED") => LockState::Unlocked,
        Some(_) | None => LockState::Unknown,
    };

    let power_state = match payload.ignition {
        Some(true) => PowerState::EngineOn,
        Some(false) => PowerState::Off,
        None => PowerState::Unknown,
    };

    Ok(CanonicalVehicleState {
        vehicle: vehicle.clone(),
        provider: provider_id.to_string(),
        location: payload.pos.map(|p| Location {
            lat: p.lat,
            lng: p.lon,
        }),
        // Meridian reports fuel as a 0..1 fraction
        energy: payload
            .fuel
            .map(|f| EnergyLevel::Fuel((f * 100.0).clamp(0.0, 100.0) as f32)),
        odometer_km: payload.odo_km,
        tire_pressures_kpa: payload.tires_kpa.map(|t| TirePressures {
            front_left: t.fl,
            front_right: t.fr,
            rear_left: t.rl,
            rear_right: t.rr,
        }),
        lock_state,
        power_state,
        last_observed_at,
        version: 0,
    })
}

#[async_trait]
impl ProviderAdapter for MeridianAdapter {
    fn id(&self) -> &str {
        &self.provider_id
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn authorize_url(&self, vehicle: &VehicleId) -> String {
        format!(
            "{}/v2/auth/grant?state={}",
            self.base_url, vehicle
        )
    }

    async fn exchange_code(&self, code: &str) -> Result<(TokenSet, VehicleRef)> {
        let url = format!("{}/v2/auth/token", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "grant_code": code }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.decode_error(response, "").await);
        }
        let body: MeridianTokenResponse = response.json().await?;

        self.logger.info("Exchanged grant code for tokens");
        let tokens = TokenSet {
            access_token: body.token,
            refresh_token: body.renewal_token,
            expires_at: body
                .valid_for_secs
                .map(|secs| chrono::Utc::now() + chrono::Duration::seconds(secs)),
        };
        Ok((tokens, VehicleRef::new(body.unit_ref)))
    }

    async fn refresh_tokens(&self, tokens: &TokenSet) -> Result<TokenSet> {
        let renewal = tokens
            .refresh_token
            .as_deref()
            .ok_or_else(|| ArgusError::revoked(&self.provider_id))?;
        let url = format!("{}/v2/auth/renew", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "renewal_token": renewal }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.decode_error(response, "").await);
        }
        let body: MeridianTokenResponse = response.json().await?;

        Ok(TokenSet {
            access_token: body.token,
            refresh_token: body.renewal_token.or_else(|| tokens.refresh_token.clone()),
            expires_at: body
                .valid_for_secs
                .map(|secs| chrono::Utc::now() + chrono::Duration::seconds(secs)),
        })
    }

    async fn revoke(&self, tokens: &TokenSet) -> Result<()> {
        let url = format!("{}/v2/auth/revoke", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&tokens.access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.decode_error(response, "").await);
        }
        Ok(())
    }

    async fn fetch_state(
        &self,
        tokens: &TokenSet,
        vehicle: &VehicleId,
        vehicle_ref: &VehicleRef,
    ) -> Result<CanonicalVehicleState> {
        let url = format!(
            "{}/v2/fleet/units/{}/status",
            self.base_url,
            vehicle_ref.as_str()
        );
        self.logger
            .debug(&format!("Fetching status for {}", vehicle));

        let response = self
            .client
            .get(&url)
            .bearer_auth(&tokens.access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.decode_error(response, vehicle.as_str()).await);
        }
        let payload: MeridianStatus = response.json().await?;

        normalize_status(vehicle, &self.provider_id, payload)
    }

    async fn send_command(
        &self,
        tokens: &TokenSet,
        vehicle_ref: &VehicleRef,
        kind: CommandKind,
    ) -> Result<String> {
        let url = format!(
            "{}/v2/fleet/units/{}/actions",
            self.base_url,
            vehicle_ref.as_str()
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(&tokens.access_token)
            .json(&serde_json::json!({ "action": Self::action_name(kind) }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.decode_error(response, vehicle_ref.as_str()).await);
        }
        let body: MeridianAction = response.json().await?;

        self.logger.info(&format!(
            "Issued {} action, provider id {}",
            kind, body.action_id
        ));
        Ok(body.action_id)
    }

    async fn poll_command(
        &self,
        tokens: &TokenSet,
        provider_command_id: &str,
    ) -> Result<RemoteCommandStatus> {
        let url = format!("{}/v2/fleet/actions/{}", self.base_url, provider_command_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&tokens.access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.decode_error(response, "").await);
        }
        let body: MeridianActionState = response.json().await?;

        Ok(match body.status.as_str() {
            "DONE" => RemoteCommandStatus::Confirmed,
            "ERROR" => RemoteCommandStatus::Failed {
                reason: body.error.unwrap_or_else(|| "unspecified".to_string()),
            },
            _ => RemoteCommandStatus::Pending,
        })
    }
}
