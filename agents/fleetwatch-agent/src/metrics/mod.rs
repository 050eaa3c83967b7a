//! Metrics module
//!
//! Host telemetry collection and the rules deciding when a sample is sent.

pub mod collector;
pub mod snapshot;

pub use collector::{MetricsSource, SysinfoCollector};
pub use snapshot::{MonitorData, ReportGate, SystemInfo};
