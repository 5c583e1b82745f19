//! Persistence layer for provider connections
//!
//! Connections must survive restarts so the scheduler can rebuild its jobs
//! without every host re-authorizing. Saving is best-effort: a failed or
//! corrupt state file is logged and ignored, never fatal.

use crate::connection::ProviderConnection;
use crate::error::Result;
use crate::logging::get_logger;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Serialized state file contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedState {
    connections: Vec<ProviderConnection>,
}

/// Connection store backed by a JSON state file
pub struct ConnectionStore {
    file_path: String,
    logger: crate::logging::StructuredLogger,
}

impl ConnectionStore {
    /// Create a new connection store
    pub fn new(file_path: &str) -> Self {
        let logger = get_logger("persistence");
        Self {
            file_path: file_path.to_string(),
            logger,
        }
    }

    /// Load persisted connections from disk
    ///
    /// A missing file is normal on first start and yields an empty list.
    pub fn load(&self) -> Vec<ProviderConnection> {
        let path = Path::new(&self.file_path);
        if !path.exists() {
            self.logger
                .info("No connection state file found, starting empty");
            return Vec::new();
        }

        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<PersistedState>(&contents) {
                Ok(state) => {
                    self.logger.info(&format!(
                        "Restored {} persisted connection(s)",
                        state.connections.len()
                    ));
                    state.connections
                }
                Err(e) => {
                    self.logger
                        .warn(&format!("Corrupt connection state file ignored: {}", e));
                    Vec::new()
                }
            },
            Err(e) => {
                self.logger
                    .warn(&format!("Failed to read connection state file: {}", e));
                Vec::new()
            }
        }
    }

    /// Save connections to disk atomically (write-then-rename)
    pub fn save(&self, connections: &[ProviderConnection]) -> Result<()> {
        let state = PersistedState {
            connections: connections.to_vec(),
        };
        let contents = serde_json::to_string_pretty(&state)?;

        let path = Path::new(&self.file_path);
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = format!("{}.tmp", self.file_path);
        std::fs::write(&tmp_path, contents)?;
        std::fs::rename(&tmp_path, path)?;

        self.logger.debug(&format!(
            "Saved {} connection(s) to {}",
            state.connections.len(),
            self.file_path
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionStatus;
    use crate::model::VehicleId;
    use crate::provider::{TokenSet, VehicleRef};

    fn connection(vehicle: &str) -> ProviderConnection {
        ProviderConnection {
            vehicle: VehicleId::new(vehicle),
            provider: "titan".to_string(),
            tokens: Some(TokenSet {
                access_token: "at".to_string(),
                refresh_token: Some("rt".to_string()),
                expires_at: None,
            }),
            vehicle_ref: Some(VehicleRef::new("t-99")),
            connected_at: chrono::Utc::now(),
            status: ConnectionStatus::Active,
            generation: 3,
        }
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connections.json");
        let store = ConnectionStore::new(&path.to_string_lossy());

        store.save(&[connection("veh-1"), connection("veh-2")]).unwrap();
        let restored = store.load();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0].vehicle.as_str(), "veh-1");
        assert_eq!(restored[0].generation, 3);
        assert_eq!(restored[0].status, ConnectionStatus::Active);
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let store = ConnectionStore::new("/nonexistent/dir/connections.json");
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_load_corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connections.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = ConnectionStore::new(&path.to_string_lossy());
        assert!(store.load().is_empty());
    }
}
