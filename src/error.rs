//! Error types and handling for Argus
//!
//! This module defines the error types used throughout the application,
//! including the shared taxonomy that provider adapters map their
//! proprietary error codes onto.

use thiserror::Error;

/// Result type alias for Argus operations
pub type Result<T> = std::result::Result<T, ArgusError>;

/// Main error type for Argus
#[derive(Debug, Error)]
pub enum ArgusError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Provider rejected the request due to rate limiting; delays the next
    /// poll rather than failing it
    #[error("Rate limited by provider {provider}")]
    RateLimited {
        provider: String,
        /// Provider-suggested wait, if it sent one
        retry_after_secs: Option<u64>,
    },

    /// Provider credentials are no longer valid; triggers a token refresh
    #[error("Authorization expired for provider {provider}")]
    AuthExpired { provider: String },

    /// Provider authorization was revoked and cannot be refreshed
    #[error("Connection revoked for provider {provider}")]
    ConnectionRevoked { provider: String },

    /// The vehicle did not answer the provider; surfaced as staleness, not
    /// as a caller-visible failure
    #[error("Vehicle {vehicle} unreachable")]
    VehicleUnreachable { vehicle: String },

    /// Command or telemetry field not supported by the bound provider
    #[error("Provider {provider} does not support {capability}")]
    UnsupportedCapability { provider: String, capability: String },

    /// No provider connection exists for the vehicle
    #[error("Vehicle {vehicle} is not connected to any provider")]
    NotConnected { vehicle: String },

    /// Generic provider API failure
    #[error("Provider error ({provider}): {message}")]
    Provider { provider: String, message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Network-related errors
    #[error("Network error: {message}")]
    Network { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

impl ArgusError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        ArgusError::Config {
            message: message.into(),
        }
    }

    /// Create a new rate-limited error
    pub fn rate_limited<S: Into<String>>(provider: S, retry_after_secs: Option<u64>) -> Self {
        ArgusError::RateLimited {
            provider: provider.into(),
            retry_after_secs,
        }
    }

    /// Create a new auth-expired error
    pub fn auth_expired<S: Into<String>>(provider: S) -> Self {
        ArgusError::AuthExpired {
            provider: provider.into(),
        }
    }

    /// Create a new connection-revoked error
    pub fn revoked<S: Into<String>>(provider: S) -> Self {
        ArgusError::ConnectionRevoked {
            provider: provider.into(),
        }
    }

    /// Create a new vehicle-unreachable error
    pub fn unreachable<S: Into<String>>(vehicle: S) -> Self {
        ArgusError::VehicleUnreachable {
            vehicle: vehicle.into(),
        }
    }

    /// Create a new unsupported-capability error
    pub fn unsupported<S: Into<String>>(provider: S, capability: S) -> Self {
        ArgusError::UnsupportedCapability {
            provider: provider.into(),
            capability: capability.into(),
        }
    }

    /// Create a new not-connected error
    pub fn not_connected<S: Into<String>>(vehicle: S) -> Self {
        ArgusError::NotConnected {
            vehicle: vehicle.into(),
        }
    }

    /// Create a new provider error
    pub fn provider<S: Into<String>>(provider: S, message: S) -> Self {
        ArgusError::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        ArgusError::Io {
            message: message.into(),
        }
    }

    /// Create a new network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        ArgusError::Network {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(field: S, message: S) -> Self {
        ArgusError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        ArgusError::Timeout {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        ArgusError::Generic {
            message: message.into(),
        }
    }

    /// Whether this error is transient from the scheduler's point of view:
    /// the poll is delayed and retried internally, never surfaced to fleet
    /// snapshot consumers as a failure
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ArgusError::RateLimited { .. }
                | ArgusError::VehicleUnreachable { .. }
                | ArgusError::Network { .. }
                | ArgusError::Timeout { .. }
        )
    }
}

impl From<std::io::Error> for ArgusError {
    fn from(err: std::io::Error) -> Self {
        ArgusError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for ArgusError {
    fn from(err: serde_yaml::Error) -> Self {
        ArgusError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ArgusError {
    fn from(err: serde_json::Error) -> Self {
        ArgusError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for ArgusError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ArgusError::timeout(err.to_string())
        } else {
            ArgusError::network(err.to_string())
        }
    }
}
