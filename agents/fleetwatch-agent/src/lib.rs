//! Fleetwatch Agent Library
//!
//! This crate provides the core functionality for the Fleetwatch host agent,
//! including registration, the WebSocket command channel with automatic
//! reconnection, periodic heartbeat and metrics reporting, and the remote
//! operation handlers.

pub mod agent;
pub mod cli;
pub mod connection;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod runtime;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use agent::identity::{AgentIdentity, IdentityHandle};
pub use agent::shutdown::ShutdownCoordinator;
pub use agent::state::{ConnectionState, ConnectionStateManager};
pub use agent::Agent;
pub use cli::config::{Config, ConfigStore};
pub use connection::client::{Backend, BackendClient};
pub use connection::protocol::{AgentMessage, Envelope, InboundMessage};
pub use error::{AgentError, Result};
pub use metrics::collector::{MetricsSource, SysinfoCollector};
