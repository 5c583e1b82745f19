//! Provider adapter boundary
//!
//! Each telematics provider exposes a different API, capability set, and
//! command vocabulary. An adapter translates one provider into the
//! canonical interface; provider-specific wire types never leave the
//! adapter module that owns them.

use crate::config::{Config, ProviderConfig, ProviderKind};
use crate::error::{ArgusError, Result};
use crate::model::{CanonicalVehicleState, CommandKind, TelemetryField, VehicleId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub mod meridian;
pub mod titan;

/// Provider-side vehicle handle, opaque outside the adapter that minted it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VehicleRef(String);

impl VehicleRef {
    pub fn new<S: Into<String>>(handle: S) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Opaque credential material for one provider connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Asynchronous confirmation state reported by a provider for a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommandStatus {
    /// The provider accepted the command but the vehicle has not confirmed
    Pending,
    /// The vehicle executed the command
    Confirmed,
    /// The provider reported definitive non-execution
    Failed { reason: String },
}

/// What a provider can do, derived from its configuration entry
#[derive(Debug, Clone)]
pub struct Capabilities {
    commands: HashSet<CommandKind>,
    telemetry: HashSet<TelemetryField>,
}

impl Capabilities {
    pub fn new(commands: &[CommandKind], telemetry: &[TelemetryField]) -> Self {
        Self {
            commands: commands.iter().copied().collect(),
            telemetry: telemetry.iter().copied().collect(),
        }
    }

    pub fn from_config(provider: &ProviderConfig) -> Self {
        Self::new(&provider.commands, &provider.telemetry)
    }

    pub fn supports_command(&self, kind: CommandKind) -> bool {
        self.commands.contains(&kind)
    }

    pub fn supports_field(&self, field: TelemetryField) -> bool {
        self.telemetry.contains(&field)
    }

    /// Fail with `UnsupportedCapability` before any provider contact
    pub fn ensure_command(&self, provider_id: &str, kind: CommandKind) -> Result<()> {
        if self.supports_command(kind) {
            Ok(())
        } else {
            Err(ArgusError::unsupported(provider_id, kind.as_str()))
        }
    }
}

/// Canonical interface every provider integration implements
///
/// Adapters normalize units (miles to km, psi to kPa, fuel fractions to
/// percent) and map provider error codes into the shared taxonomy. All
/// network suspension happens inside these methods; callers never see a
/// provider wire format.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable provider id, matching the configuration entry
    fn id(&self) -> &str;

    /// Capability set declared for this provider
    fn capabilities(&self) -> &Capabilities;

    /// Authorization redirect target for the connect handshake
    fn authorize_url(&self, vehicle: &VehicleId) -> String;

    /// Exchange an authorization code for tokens and the provider's own
    /// handle for the vehicle
    async fn exchange_code(&self, code: &str) -> Result<(TokenSet, VehicleRef)>;

    /// Mint fresh tokens from stored refresh material
    async fn refresh_tokens(&self, tokens: &TokenSet) -> Result<TokenSet>;

    /// Best-effort provider-side revocation of the connection
    async fn revoke(&self, tokens: &TokenSet) -> Result<()>;

    /// Fetch current telemetry, normalized to canonical form
    async fn fetch_state(
        &self,
        tokens: &TokenSet,
        vehicle: &VehicleId,
        vehicle_ref: &VehicleRef,
    ) -> Result<CanonicalVehicleState>;

    /// Issue a remote command; returns the provider's command id
    async fn send_command(
        &self,
        tokens: &TokenSet,
        vehicle_ref: &VehicleRef,
        kind: CommandKind,
    ) -> Result<String>;

    /// Poll the confirmation state of a previously issued command
    async fn poll_command(
        &self,
        tokens: &TokenSet,
        provider_command_id: &str,
    ) -> Result<RemoteCommandStatus>;
}

/// Construct the adapter for each configured provider
pub fn build_adapters(config: &Config) -> HashMap<String, Arc<dyn ProviderAdapter>> {
    let mut adapters: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();
    for provider in &config.providers {
        let adapter: Arc<dyn ProviderAdapter> = match provider.kind {
            ProviderKind::Titan => Arc::new(titan::TitanAdapter::new(provider)),
            ProviderKind::Meridian => Arc::new(meridian::MeridianAdapter::new(provider)),
        };
        adapters.insert(provider.id.clone(), adapter);
    }
    adapters
}
