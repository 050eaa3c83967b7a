//! Connection module
//!
//! Everything that talks to the backend: the wire protocol, the transport
//! carrying it and the client that registers, connects and sends telemetry.

pub mod client;
pub mod protocol;
pub mod transport;
