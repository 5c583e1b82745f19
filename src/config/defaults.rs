use super::*;
use crate::model::{CommandKind, TelemetryField};

pub(super) fn default_max_concurrent_requests() -> usize {
    4
}

pub(super) fn default_backoff_ceiling_secs() -> u64 {
    900
}

impl Default for Config {
    fn default() -> Self {
        Self {
            providers: vec![
                ProviderConfig {
                    id: "titan".to_string(),
                    display_name: "Titan Telematics".to_string(),
                    kind: ProviderKind::Titan,
                    base_url: "https://api.titan-telematics.example".to_string(),
                    max_concurrent_requests: default_max_concurrent_requests(),
                    rate_limit_backoff_ceiling_secs: default_backoff_ceiling_secs(),
                    commands: vec![
                        CommandKind::Lock,
                        CommandKind::Unlock,
                        CommandKind::StartCharge,
                        CommandKind::StopCharge,
                    ],
                    telemetry: vec![
                        TelemetryField::Location,
                        TelemetryField::Battery,
                        TelemetryField::Odometer,
                        TelemetryField::TirePressure,
                        TelemetryField::LockState,
                        TelemetryField::PowerState,
                    ],
                },
                ProviderConfig {
                    id: "meridian".to_string(),
                    display_name: "Meridian Connect".to_string(),
                    kind: ProviderKind::Meridian,
                    base_url: "https://fleet.meridian-connect.example".to_string(),
                    max_concurrent_requests: default_max_concurrent_requests(),
                    rate_limit_backoff_ceiling_secs: default_backoff_ceiling_secs(),
                    commands: vec![CommandKind::Lock, CommandKind::Unlock],
                    telemetry: vec![
                        TelemetryField::Location,
                        TelemetryField::Fuel,
                        TelemetryField::Odometer,
                        TelemetryField::LockState,
                        TelemetryField::PowerState,
                    ],
                },
            ],
            scheduler: SchedulerConfig::default(),
            commands: CommandsConfig::default(),
            registry: RegistryConfig::default(),
            connections: ConnectionsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            active_trip_interval_secs: 30,
            idle_interval_min_secs: 300,
            idle_interval_max_secs: 900,
            background_interval_min_secs: 1800,
            background_interval_max_secs: 3600,
        }
    }
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: 30,
            charge_timeout_secs: 60,
            poll_initial_ms: 1000,
            poll_max_ms: 8000,
            retention_secs: 3600,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            staleness_factor: 2.0,
        }
    }
}

impl Default for ConnectionsConfig {
    fn default() -> Self {
        Self {
            state_file: "/data/argus_connections.json".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            console_level: None,
            file_level: None,
            file: None,
            json_format: false,
            console_output: true,
        }
    }
}
