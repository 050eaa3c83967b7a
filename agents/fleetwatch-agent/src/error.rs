//! Error types
//!
//! Every recoverable failure in the agent is expressed as an [`AgentError`].
//! Only configuration and logging failures at startup are fatal; those are
//! handled with `anyhow` in the binary.

use std::io;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Agent errors.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Registration with the backend was rejected or failed.
    #[error("registration failed: {0}")]
    Registration(String),

    /// The connection to the backend is broken.
    #[error("connection error: {0}")]
    Connection(String),

    /// No transport is currently open.
    #[error("not connected to backend")]
    NotConnected,

    /// A write did not complete before its deadline.
    #[error("write timed out after {0:?}")]
    WriteTimeout(std::time::Duration),

    /// WebSocket protocol or transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// HTTP client error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Docker engine error.
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// Command parameters are missing or malformed.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// Legacy action not recognised.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// Typed envelope with an unrecognised type.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// Terminal session lookup failed in both the local map and the registry.
    #[error("session does not exist: {0}")]
    SessionNotFound(String),

    /// An operation handler reported a failure.
    #[error("{0}")]
    Command(String),

    /// Self-upgrade failed.
    #[error("upgrade failed: {0}")]
    Upgrade(String),
}

impl AgentError {
    /// Returns true when the error means the backend connection is unusable
    /// and a reconnect should be requested.
    pub fn is_connection_error(&self) -> bool {
        match self {
            AgentError::Connection(_) | AgentError::NotConnected | AgentError::WriteTimeout(_) => {
                true
            }
            AgentError::WebSocket(e) => matches!(
                e,
                tungstenite::Error::ConnectionClosed
                    | tungstenite::Error::AlreadyClosed
                    | tungstenite::Error::Io(_)
                    | tungstenite::Error::Tls(_)
                    | tungstenite::Error::Protocol(_)
            ),
            AgentError::Http(e) => e.is_connect() || e.is_timeout(),
            AgentError::Io(e) => is_connection_io_kind(e.kind()),
            _ => false,
        }
    }
}

fn is_connection_io_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::NotConnected
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
    )
}

/// Result type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;
