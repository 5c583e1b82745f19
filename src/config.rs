//! Configuration management for Argus
//!
//! This module handles loading, validation, and management of the service
//! configuration from YAML files with support for environment variable
//! overrides.

use crate::error::{ArgusError, Result};
use crate::model::{CommandKind, TelemetryField};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub mod defaults;

fn default_true() -> bool {
    true
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Telematics provider integrations, loaded once at startup
    pub providers: Vec<ProviderConfig>,

    /// Sync scheduler tiers and worker pool
    pub scheduler: SchedulerConfig,

    /// Remote command confirmation behavior
    pub commands: CommandsConfig,

    /// Vehicle state registry behavior
    pub registry: RegistryConfig,

    /// Connection persistence
    pub connections: ConnectionsConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// One provider integration entry
///
/// These records are the immutable `Provider` configuration: identity,
/// display metadata, capability set, and rate-limit policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Stable provider identifier (referenced by connections)
    pub id: String,

    /// Human-readable name for dashboards
    pub display_name: String,

    /// Which adapter implementation drives this provider
    pub kind: ProviderKind,

    /// Base URL of the provider API
    pub base_url: String,

    /// Maximum concurrent requests against this provider
    #[serde(default = "defaults::default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Ceiling for rate-limit backoff, in seconds
    #[serde(default = "defaults::default_backoff_ceiling_secs")]
    pub rate_limit_backoff_ceiling_secs: u64,

    /// Remote commands this provider supports
    pub commands: Vec<CommandKind>,

    /// Telemetry fields this provider reports
    pub telemetry: Vec<TelemetryField>,
}

/// Adapter implementation selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Titan,
    Meridian,
}

/// Sync scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Poll interval for vehicles on an active trip, in seconds
    pub active_trip_interval_secs: u64,

    /// Idle tier interval window (jittered per vehicle), in seconds
    pub idle_interval_min_secs: u64,
    pub idle_interval_max_secs: u64,

    /// Background tier interval window (jittered per vehicle), in seconds
    pub background_interval_min_secs: u64,
    pub background_interval_max_secs: u64,
}

/// Remote command configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    /// Confirmation timeout for lock/unlock, in seconds
    pub lock_timeout_secs: u64,

    /// Confirmation timeout for charge start/stop, in seconds
    pub charge_timeout_secs: u64,

    /// Initial delay between confirmation polls, in milliseconds
    pub poll_initial_ms: u64,

    /// Maximum delay between confirmation polls, in milliseconds
    pub poll_max_ms: u64,

    /// How long resolved commands stay queryable before GC, in seconds
    pub retention_secs: u64,
}

/// Vehicle state registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// State older than this factor times the vehicle's poll interval
    /// reads as STALE
    pub staleness_factor: f64,
}

/// Connection persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionsConfig {
    /// Path of the JSON file holding provider connections across restarts
    pub state_file: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Optional console-specific level override
    pub console_level: Option<String>,

    /// Optional file-specific level override
    pub file_level: Option<String>,

    /// Path to log file; console-only when unset
    pub file: Option<String>,

    /// Emit JSON-formatted console logs
    pub json_format: bool,

    /// Mirror file logs to the console
    #[serde(default = "default_true")]
    pub console_output: bool,
}

impl Config {
    /// Load configuration from the default location
    ///
    /// The path comes from `ARGUS_CONFIG` when set, falling back to
    /// `argus.yaml` in the working directory. A missing file yields the
    /// built-in defaults.
    pub fn load() -> Result<Self> {
        let path = std::env::var("ARGUS_CONFIG").unwrap_or_else(|_| "argus.yaml".to_string());
        Self::load_from_path(&path)
    }

    /// Load configuration from an explicit path
    pub fn load_from_path(path: &str) -> Result<Self> {
        let path_ref = Path::new(path);
        if !path_ref.exists() {
            let config = Config::default();
            config.validate()?;
            return Ok(config);
        }

        let contents = std::fs::read_to_string(path_ref)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration invariants
    pub fn validate(&self) -> Result<()> {
        if self.providers.is_empty() {
            return Err(ArgusError::validation(
                "providers",
                "at least one provider must be configured",
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if provider.id.is_empty() {
                return Err(ArgusError::validation("providers.id", "must not be empty"));
            }
            if !seen.insert(provider.id.as_str()) {
                return Err(ArgusError::validation(
                    "providers.id",
                    "provider ids must be unique",
                ));
            }
            if provider.base_url.is_empty() {
                return Err(ArgusError::validation(
                    "providers.base_url",
                    "must not be empty",
                ));
            }
            if provider.max_concurrent_requests == 0 {
                return Err(ArgusError::validation(
                    "providers.max_concurrent_requests",
                    "must be at least 1",
                ));
            }
            if provider.rate_limit_backoff_ceiling_secs < self.scheduler.active_trip_interval_secs {
                return Err(ArgusError::validation(
                    "providers.rate_limit_backoff_ceiling_secs",
                    "must not be below the active-trip poll interval",
                ));
            }
        }

        let s = &self.scheduler;
        if s.active_trip_interval_secs == 0 {
            return Err(ArgusError::validation(
                "scheduler.active_trip_interval_secs",
                "must be nonzero",
            ));
        }
        if s.idle_interval_min_secs > s.idle_interval_max_secs {
            return Err(ArgusError::validation(
                "scheduler.idle_interval",
                "min must not exceed max",
            ));
        }
        if s.background_interval_min_secs > s.background_interval_max_secs {
            return Err(ArgusError::validation(
                "scheduler.background_interval",
                "min must not exceed max",
            ));
        }

        let c = &self.commands;
        if c.lock_timeout_secs == 0 || c.charge_timeout_secs == 0 {
            return Err(ArgusError::validation(
                "commands.timeouts",
                "must be nonzero",
            ));
        }
        if c.poll_initial_ms == 0 || c.poll_initial_ms > c.poll_max_ms {
            return Err(ArgusError::validation(
                "commands.poll",
                "initial delay must be nonzero and not exceed the max",
            ));
        }

        if self.registry.staleness_factor < 1.0 {
            return Err(ArgusError::validation(
                "registry.staleness_factor",
                "must be at least 1.0",
            ));
        }

        Ok(())
    }

    /// Look up a provider entry by id
    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.id == id)
    }

    /// Confirmation timeout for one command kind
    pub fn command_timeout(&self, kind: CommandKind) -> std::time::Duration {
        let secs = match kind {
            CommandKind::Lock | CommandKind::Unlock => self.commands.lock_timeout_secs,
            CommandKind::StartCharge | CommandKind::StopCharge => self.commands.charge_timeout_secs,
        };
        std::time::Duration::from_secs(secs)
    }
}
