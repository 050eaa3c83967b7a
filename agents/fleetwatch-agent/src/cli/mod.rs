//! CLI support module
//!
//! Configuration loading and persistence used by the binary and the agent.

pub mod config;
