//! Backend Client
//!
//! HTTP (registration, settings) and WebSocket (telemetry, commands) access to
//! the backend. The [`Backend`] trait is what the supervisor and the runners
//! depend on, so they can be driven by in-memory fakes in tests.

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::agent::identity::IdentityHandle;
use crate::agent::reconnect::ReconnectRequester;
use crate::agent::state::ConnectionState;
use crate::cli::config::MetricsConfig;
use crate::connection::protocol::AgentMessage;
use crate::connection::transport::{TransportSlot, WebSocketTransport};
use crate::error::{AgentError, Result};
use crate::metrics::snapshot::{MonitorData, SystemInfo};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Operations the agent needs from the backend
#[async_trait]
pub trait Backend: Send + Sync {
    /// Exchange a registration token for `(server_id, secret_key)`
    async fn register_agent(&self, token: &str) -> Result<(u64, String)>;

    /// Open the transport using the current identity
    async fn connect_websocket(&self) -> Result<()>;

    /// Close the transport if open
    async fn close_websocket(&self);

    fn is_connected(&self) -> bool;

    async fn send_heartbeat(&self) -> Result<()>;

    async fn send_monitor_data(&self, data: &MonitorData) -> Result<()>;

    async fn send_system_info(&self, info: &SystemInfo) -> Result<()>;

    async fn fetch_settings(&self) -> Result<RemoteSettings>;

    /// Whether `err` means the connection is broken
    fn is_connection_error(&self, err: &AgentError) -> bool {
        err.is_connection_error()
    }
}

/// Standard backend response wrapper
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    token: &'a str,
    hostname: String,
    agent_version: &'static str,
    os: &'static str,
    arch: &'static str,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    server_id: u64,
    secret_key: String,
}

/// Agent settings served by the backend. Missing fields keep local values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSettings {
    #[serde(default)]
    pub heartbeat_interval_secs: Option<u64>,
    #[serde(default)]
    pub metrics_interval_secs: Option<u64>,
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
}

/// Production [`Backend`] implementation
pub struct BackendClient {
    http: reqwest::Client,
    server_url: String,
    identity: IdentityHandle,
    slot: TransportSlot,
    inbound: mpsc::Sender<String>,
    reconnect: ReconnectRequester,
    started: Instant,
}

impl BackendClient {
    /// Create a client. Inbound text frames from every transport it opens are
    /// forwarded to `inbound`; dead transports raise `reconnect`.
    pub fn new(
        server_url: &str,
        identity: IdentityHandle,
        slot: TransportSlot,
        inbound: mpsc::Sender<String>,
        reconnect: ReconnectRequester,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("fleetwatch-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            server_url: server_url.trim_end_matches('/').to_string(),
            identity,
            slot,
            inbound,
            reconnect,
            started: Instant::now(),
        })
    }

    pub fn transport_slot(&self) -> &TransportSlot {
        &self.slot
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api/agent{}", self.server_url, path)
    }

    /// WebSocket URL carrying the agent's credentials
    pub fn websocket_url(&self) -> Result<Url> {
        let identity = self.identity.get();
        if !identity.is_configured() {
            return Err(AgentError::Config("agent identity is not configured".to_string()));
        }

        let mut url = Url::parse(&self.api_url("/ws"))
            .map_err(|e| AgentError::Config(format!("invalid server_url: {}", e)))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| AgentError::Config(format!("cannot derive websocket scheme from {}", self.server_url)))?;
        url.query_pairs_mut()
            .append_pair("server_id", &identity.server_id.to_string())
            .append_pair("secret_key", &identity.secret_key);
        Ok(url)
    }

    async fn send_message(&self, message: &AgentMessage) -> Result<()> {
        self.slot.send_text(message.to_json()?).await
    }

    async fn unwrap_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        what: &str,
    ) -> Result<T> {
        let status = response.status();
        let body: ApiResponse<T> = response.json().await.map_err(|e| {
            if e.is_decode() {
                AgentError::Command(format!("{} returned an unreadable body (HTTP {}): {}", what, status, e))
            } else {
                AgentError::Http(e)
            }
        })?;

        if !body.success {
            let message = body
                .error
                .map(|e| format!("[{}] {}", e.code, e.message))
                .unwrap_or_else(|| format!("HTTP {}", status));
            return Err(AgentError::Command(format!("{} rejected: {}", what, message)));
        }

        body.data
            .ok_or_else(|| AgentError::Command(format!("{} returned no data", what)))
    }
}

#[async_trait]
impl Backend for BackendClient {
    async fn register_agent(&self, token: &str) -> Result<(u64, String)> {
        let request = RegisterRequest {
            token,
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            agent_version: env!("CARGO_PKG_VERSION"),
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
        };

        let response = self
            .http
            .post(self.api_url("/register"))
            .json(&request)
            .send()
            .await?;

        let registered: RegisterResponse = Self::unwrap_response(response, "registration")
            .await
            .map_err(|e| match e {
                AgentError::Command(message) => AgentError::Registration(message),
                other => other,
            })?;

        if registered.server_id == 0 || registered.secret_key.is_empty() {
            return Err(AgentError::Registration(
                "backend returned an empty identity".to_string(),
            ));
        }

        info!(server_id = registered.server_id, "Agent registered");
        Ok((registered.server_id, registered.secret_key))
    }

    async fn connect_websocket(&self) -> Result<()> {
        let url = self.websocket_url()?;
        debug!(host = ?url.host_str(), "Opening WebSocket");

        let transport =
            WebSocketTransport::connect(url.as_str(), self.inbound.clone(), self.reconnect.clone())
                .await?;

        if let Some(previous) = self.slot.replace(transport) {
            previous.close().await;
        }
        Ok(())
    }

    async fn close_websocket(&self) {
        if let Some(transport) = self.slot.take() {
            transport.close().await;
        }
    }

    fn is_connected(&self) -> bool {
        self.slot.is_alive()
    }

    async fn send_heartbeat(&self) -> Result<()> {
        let state = if self.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        let message = AgentMessage::heartbeat(
            self.identity.get().server_id,
            self.started.elapsed().as_secs(),
            state,
        );
        self.send_message(&message).await
    }

    async fn send_monitor_data(&self, data: &MonitorData) -> Result<()> {
        self.send_message(&AgentMessage::MonitorData(data.clone())).await
    }

    async fn send_system_info(&self, info: &SystemInfo) -> Result<()> {
        self.send_message(&AgentMessage::SystemInfo(info.clone())).await
    }

    async fn fetch_settings(&self) -> Result<RemoteSettings> {
        let identity = self.identity.get();
        let response = self
            .http
            .get(self.api_url("/settings"))
            .header("X-Server-ID", identity.server_id.to_string())
            .header("X-Secret-Key", identity.secret_key)
            .send()
            .await?;

        Self::unwrap_response(response, "settings").await
    }
}
