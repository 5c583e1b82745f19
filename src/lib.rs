//! # Argus - Fleet Telemetry Aggregation & Remote Command Orchestration
//!
//! A Rust service that binds marketplace vehicles to third-party
//! telematics providers, maintains one canonical, continuously refreshed
//! fleet state, and safely issues asynchronous remote commands
//! (lock/unlock doors, start/stop EV charging) to physical vehicles.
//!
//! ## Features
//!
//! - **Provider Adapters**: each integration translates a proprietary
//!   telemetry/command API into one canonical interface
//! - **Vehicle State Registry**: versioned per-vehicle canonical state
//!   with lazy staleness tracking
//! - **Connection Lifecycle**: authorization handshake, token refresh,
//!   generation-stamped disconnect
//! - **Sync Scheduler**: tiered poll intervals, per-provider rate limits,
//!   exponential backoff
//! - **Command Dispatcher**: per-vehicle serialization with optimistic
//!   updates and rollback
//! - **Event Bus**: incremental change events for dashboards and alerting
//!
//! ## Architecture
//!
//! The application follows a modular architecture with clear separation of
//! concerns:
//!
//! - `config`: Configuration management and validation
//! - `logging`: Structured logging and tracing
//! - `model`: Canonical vehicle domain types
//! - `provider`: Adapter boundary and the provider integrations
//! - `registry`: Canonical state store
//! - `reconcile`: Telemetry diff-and-merge
//! - `events`: Broadcast event bus
//! - `connection`: Provider connection lifecycle
//! - `persistence`: Connection state across restarts
//! - `scheduler`: Sync job scheduling
//! - `dispatcher`: Remote command orchestration
//! - `service`: Composition root and external interface

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod logging;
pub mod model;
pub mod persistence;
pub mod provider;
pub mod reconcile;
pub mod registry;
pub mod scheduler;
pub mod service;

// Re-export commonly used types
pub use config::Config;
pub use error::{ArgusError, Result};
pub use service::TrackingService;
