//! Connection lifecycle management
//!
//! Owns the binding between a vehicle and its telematics provider: the
//! authorization handshake, token refresh, revocation, and teardown.
//! Every connection carries a generation counter; results of in-flight
//! work stamped with an older generation are discarded on arrival, which
//! is how disconnect cancels work it cannot interrupt.

use crate::error::{ArgusError, Result};
use crate::events::{EventBus, FleetEvent};
use crate::logging::get_logger;
use crate::model::VehicleId;
use crate::persistence::ConnectionStore;
use crate::provider::{ProviderAdapter, TokenSet, VehicleRef};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Lifecycle status of a provider connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connecting,
    Active,
    TokenExpired,
    Revoked,
    Error,
}

/// Binding of one vehicle to one provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConnection {
    pub vehicle: VehicleId,
    pub provider: String,
    /// Opaque credential material; absent until the handshake completes
    pub tokens: Option<TokenSet>,
    /// Provider-side vehicle handle; absent until the handshake completes
    pub vehicle_ref: Option<VehicleRef>,
    pub connected_at: DateTime<Utc>,
    pub status: ConnectionStatus,
    pub generation: u64,
}

/// Everything an adapter call needs for one vehicle
#[derive(Clone)]
pub struct FetchContext {
    pub adapter: Arc<dyn ProviderAdapter>,
    pub tokens: TokenSet,
    pub vehicle_ref: VehicleRef,
    pub generation: u64,
}

/// Manages provider connections for the whole fleet
pub struct ConnectionManager {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    connections: DashMap<VehicleId, ProviderConnection>,
    /// Generation counters outlive their connection so late results from a
    /// removed connection still compare stale
    generations: DashMap<VehicleId, u64>,
    store: ConnectionStore,
    events: EventBus,
    logger: crate::logging::StructuredLogger,
}

impl ConnectionManager {
    pub fn new(
        adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
        store: ConnectionStore,
        events: EventBus,
    ) -> Self {
        let logger = get_logger("connection");
        Self {
            adapters,
            connections: DashMap::new(),
            generations: DashMap::new(),
            store,
            events,
            logger,
        }
    }

    /// Restore persisted connections; returns the vehicles that should be
    /// rescheduled for polling
    pub fn restore(&self) -> Vec<VehicleId> {
        let mut restored = Vec::new();
        for connection in self.store.load() {
            // A connection cannot be restored without its adapter
            if !self.adapters.contains_key(&connection.provider) {
                self.logger.warn(&format!(
                    "Dropping persisted connection for {}: unknown provider {}",
                    connection.vehicle, connection.provider
                ));
                continue;
            }
            self.generations
                .insert(connection.vehicle.clone(), connection.generation);
            if connection.status == ConnectionStatus::Active {
                restored.push(connection.vehicle.clone());
            }
            self.connections
                .insert(connection.vehicle.clone(), connection);
        }
        restored
    }

    /// Begin the authorization handshake; returns the redirect target the
    /// caller sends the host to
    pub fn begin_connect(&self, vehicle: &VehicleId, provider_id: &str) -> Result<String> {
        let adapter = self.adapter(provider_id)?;
        let generation = self.next_generation(vehicle);

        let connection = ProviderConnection {
            vehicle: vehicle.clone(),
            provider: provider_id.to_string(),
            tokens: None,
            vehicle_ref: None,
            connected_at: Utc::now(),
            status: ConnectionStatus::Connecting,
            generation,
        };
        self.connections.insert(vehicle.clone(), connection);
        self.persist();
        self.emit_status(vehicle, provider_id, ConnectionStatus::Connecting);

        self.logger.info(&format!(
            "Started {} authorization for {}",
            provider_id, vehicle
        ));
        Ok(adapter.authorize_url(vehicle))
    }

    /// Complete the handshake with the authorization code from the
    /// provider redirect
    pub async fn complete_connect(&self, vehicle: &VehicleId, code: &str) -> Result<()> {
        let provider_id = self
            .connections
            .get(vehicle)
            .map(|c| c.provider.clone())
            .ok_or_else(|| ArgusError::not_connected(vehicle.as_str()))?;
        let adapter = self.adapter(&provider_id)?;

        let (tokens, vehicle_ref) = adapter.exchange_code(code).await?;
        let generation = self.next_generation(vehicle);

        if let Some(mut connection) = self.connections.get_mut(vehicle) {
            connection.tokens = Some(tokens);
            connection.vehicle_ref = Some(vehicle_ref);
            connection.connected_at = Utc::now();
            connection.status = ConnectionStatus::Active;
            connection.generation = generation;
        }
        self.persist();
        self.emit_status(vehicle, &provider_id, ConnectionStatus::Active);

        self.logger
            .info(&format!("Connected {} via {}", vehicle, provider_id));
        Ok(())
    }

    /// Assemble the adapter call context for an ACTIVE connection
    pub fn fetch_context(&self, vehicle: &VehicleId) -> Result<FetchContext> {
        let connection = self
            .connections
            .get(vehicle)
            .ok_or_else(|| ArgusError::not_connected(vehicle.as_str()))?;
        if connection.status != ConnectionStatus::Active {
            return Err(ArgusError::not_connected(vehicle.as_str()));
        }
        let adapter = self.adapter(&connection.provider)?;
        let tokens = connection
            .tokens
            .clone()
            .ok_or_else(|| ArgusError::not_connected(vehicle.as_str()))?;
        let vehicle_ref = connection
            .vehicle_ref
            .clone()
            .ok_or_else(|| ArgusError::not_connected(vehicle.as_str()))?;
        Ok(FetchContext {
            adapter,
            tokens,
            vehicle_ref,
            generation: connection.generation,
        })
    }

    /// Current generation for a vehicle; 0 if it was never connected
    pub fn generation(&self, vehicle: &VehicleId) -> u64 {
        self.generations.get(vehicle).map(|g| *g).unwrap_or(0)
    }

    /// Whether a stamped generation still refers to the live connection
    pub fn is_current(&self, vehicle: &VehicleId, generation: u64) -> bool {
        self.generation(vehicle) == generation
    }

    /// Connection status for a vehicle
    pub fn status(&self, vehicle: &VehicleId) -> Option<ConnectionStatus> {
        self.connections.get(vehicle).map(|c| c.status)
    }

    /// Provider id for a vehicle
    pub fn provider_of(&self, vehicle: &VehicleId) -> Option<String> {
        self.connections.get(vehicle).map(|c| c.provider.clone())
    }

    /// Handle an AuthExpired failure from an adapter call: one refresh
    /// attempt with the stored refresh material, then ERROR (or REVOKED if
    /// the provider says so)
    pub async fn handle_auth_expired(&self, vehicle: &VehicleId) -> Result<()> {
        let (provider_id, tokens) = {
            let connection = self
                .connections
                .get(vehicle)
                .ok_or_else(|| ArgusError::not_connected(vehicle.as_str()))?;
            (connection.provider.clone(), connection.tokens.clone())
        };
        let adapter = self.adapter(&provider_id)?;

        self.set_status(vehicle, ConnectionStatus::TokenExpired);
        self.emit_status(vehicle, &provider_id, ConnectionStatus::TokenExpired);

        let Some(tokens) = tokens else {
            self.set_status(vehicle, ConnectionStatus::Error);
            self.emit_status(vehicle, &provider_id, ConnectionStatus::Error);
            return Err(ArgusError::auth_expired(provider_id));
        };

        match adapter.refresh_tokens(&tokens).await {
            Ok(fresh) => {
                if let Some(mut connection) = self.connections.get_mut(vehicle) {
                    connection.tokens = Some(fresh);
                    connection.status = ConnectionStatus::Active;
                }
                self.persist();
                self.emit_status(vehicle, &provider_id, ConnectionStatus::Active);
                self.logger
                    .info(&format!("Refreshed {} tokens for {}", provider_id, vehicle));
                Ok(())
            }
            Err(e) => {
                let status = if matches!(e, ArgusError::ConnectionRevoked { .. }) {
                    ConnectionStatus::Revoked
                } else {
                    ConnectionStatus::Error
                };
                self.set_status(vehicle, status);
                self.persist();
                self.emit_status(vehicle, &provider_id, status);
                self.logger.warn(&format!(
                    "Token refresh failed for {} ({}): {}",
                    vehicle, provider_id, e
                ));
                Err(e)
            }
        }
    }

    /// Disconnect a vehicle
    ///
    /// Two-phase: best-effort provider-side revocation first, then local
    /// teardown. Local teardown always happens; a failed remote revocation
    /// is logged and never retried. The caller (service) removes the
    /// vehicle's jobs, queued commands, and registry entry.
    pub async fn disconnect(&self, vehicle: &VehicleId) -> Result<()> {
        let connection = self
            .connections
            .get(vehicle)
            .map(|c| c.value().clone())
            .ok_or_else(|| ArgusError::not_connected(vehicle.as_str()))?;

        if let (Ok(adapter), Some(tokens)) =
            (self.adapter(&connection.provider), connection.tokens.as_ref())
        {
            if let Err(e) = adapter.revoke(tokens).await {
                self.logger.warn(&format!(
                    "Provider-side revocation failed for {} ({}): {}",
                    vehicle, connection.provider, e
                ));
            }
        }

        // Local teardown proceeds regardless of the remote outcome
        self.next_generation(vehicle);
        self.connections.remove(vehicle);
        self.persist();
        self.emit_status(vehicle, &connection.provider, ConnectionStatus::Revoked);

        self.logger
            .info(&format!("Disconnected {} from {}", vehicle, connection.provider));
        Ok(())
    }

    fn adapter(&self, provider_id: &str) -> Result<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(provider_id)
            .cloned()
            .ok_or_else(|| ArgusError::config(format!("Unknown provider: {}", provider_id)))
    }

    fn next_generation(&self, vehicle: &VehicleId) -> u64 {
        let mut entry = self.generations.entry(vehicle.clone()).or_insert(0);
        *entry += 1;
        *entry
    }

    fn set_status(&self, vehicle: &VehicleId, status: ConnectionStatus) {
        if let Some(mut connection) = self.connections.get_mut(vehicle) {
            connection.status = status;
        }
    }

    fn emit_status(&self, vehicle: &VehicleId, provider: &str, status: ConnectionStatus) {
        self.events.emit(FleetEvent::ConnectionStatusChanged {
            vehicle: vehicle.clone(),
            provider: provider.to_string(),
            status,
        });
    }

    fn persist(&self) {
        let connections: Vec<ProviderConnection> =
            self.connections.iter().map(|c| c.value().clone()).collect();
        if let Err(e) = self.store.save(&connections) {
            self.logger
                .warn(&format!("Failed to persist connections: {}", e));
        }
    }
}
