//! Runtime module
//!
//! Container runtime abstraction used by the docker command handler.

pub mod adapter;
pub mod docker;
