//! Agent self-upgrade
//!
//! Triggered by an `agent_upgrade` envelope. Every stage is reported back as
//! an `agent_upgrade_status` push carrying the request id, so the backend can
//! follow progress without polling. A failure at any stage is reported as
//! `failed` and leaves the running binary untouched.

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::agent::pending::PendingRequests;
use crate::agent::shutdown::RestartHandle;
use crate::connection::protocol::{Envelope, UpgradeRequest, AGENT_UPGRADE_STATUS};
use crate::connection::transport::TransportSlot;
use crate::error::{AgentError, Result};
use crate::handlers::push;

/// Upper bound for a whole upgrade, download included
pub const UPGRADE_TIMEOUT: Duration = Duration::from_secs(15 * 60);
/// How long to wait for the backend to answer a manifest lookup
pub const MANIFEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Request type asking the backend where to download a version
pub const AGENT_UPGRADE_MANIFEST: &str = "agent_upgrade_manifest";

/// Upgrade progress labels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeStatus {
    Received,
    Starting,
    Downloading,
    Verifying,
    Installing,
    Restarting,
    Success,
    Noop,
    Failed,
}

impl UpgradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpgradeStatus::Received => "received",
            UpgradeStatus::Starting => "starting",
            UpgradeStatus::Downloading => "downloading",
            UpgradeStatus::Verifying => "verifying",
            UpgradeStatus::Installing => "installing",
            UpgradeStatus::Restarting => "restarting",
            UpgradeStatus::Success => "success",
            UpgradeStatus::Noop => "noop",
            UpgradeStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for UpgradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend reply to a manifest lookup
#[derive(Debug, Deserialize)]
struct Manifest {
    download_url: String,
    #[serde(default)]
    sha256: Option<String>,
}

/// Executes `agent_upgrade` requests
pub struct UpgradeHandler {
    http: reqwest::Client,
    slot: TransportSlot,
    pending: PendingRequests,
    restart: RestartHandle,
    exe_path: PathBuf,
    current_version: String,
    timeout: Duration,
}

impl UpgradeHandler {
    pub fn new(
        slot: TransportSlot,
        pending: PendingRequests,
        restart: RestartHandle,
        exe_path: PathBuf,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("fleetwatch-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            slot,
            pending,
            restart,
            exe_path,
            current_version: env!("CARGO_PKG_VERSION").to_string(),
            timeout: UPGRADE_TIMEOUT,
        })
    }

    pub fn with_current_version(mut self, version: &str) -> Self {
        self.current_version = version.to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run one upgrade request to completion, reporting as it goes
    pub async fn handle(&self, request_id: &str, request: UpgradeRequest) {
        let target = request.version.clone().unwrap_or_default();
        info!(request_id, target_version = %target, "Upgrade requested");
        self.send_status(request_id, &target, UpgradeStatus::Received, "upgrade request received", None)
            .await;

        let outcome = tokio::time::timeout(self.timeout, self.execute(request_id, request)).await;
        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("upgrade timed out after {:?}", self.timeout),
        };

        error!(request_id, target_version = %target, error = %failure, "Upgrade failed");
        self.send_status(request_id, &target, UpgradeStatus::Failed, &failure, None)
            .await;
    }

    /// Report a request that could not be decoded
    pub async fn reject(&self, request_id: &str, reason: &str) {
        warn!(request_id, error = %reason, "Rejected malformed upgrade request");
        self.send_status(request_id, "", UpgradeStatus::Received, "upgrade request received", None)
            .await;
        let message = format!("invalid upgrade request: {}", reason);
        self.send_status(request_id, "", UpgradeStatus::Failed, &message, None)
            .await;
    }

    async fn execute(&self, request_id: &str, request: UpgradeRequest) -> Result<()> {
        let version = request
            .version
            .clone()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| AgentError::Upgrade("version is required".to_string()))?;

        if version == self.current_version && !request.force {
            self.send_status(
                request_id,
                &version,
                UpgradeStatus::Noop,
                &format!("already running version {}", version),
                None,
            )
            .await;
            return Ok(());
        }

        self.send_status(request_id, &version, UpgradeStatus::Starting, "starting upgrade", None)
            .await;

        let (download_url, expected_sha256) = match request.download_url.filter(|u| !u.is_empty()) {
            Some(url) => (url, request.sha256),
            None => {
                let manifest = self.resolve_manifest(request_id, &version).await?;
                (manifest.download_url, request.sha256.or(manifest.sha256))
            }
        };

        self.send_status(
            request_id,
            &version,
            UpgradeStatus::Downloading,
            "downloading agent binary",
            Some(json!({ "download_url": download_url })),
        )
        .await;
        let binary = self.download(&download_url).await?;

        self.send_status(
            request_id,
            &version,
            UpgradeStatus::Verifying,
            "verifying download",
            Some(json!({ "size": binary.len() })),
        )
        .await;
        verify_checksum(&binary, expected_sha256.as_deref())?;

        self.send_status(request_id, &version, UpgradeStatus::Installing, "installing new binary", None)
            .await;
        install_binary(&self.exe_path, &binary).await?;

        self.send_status(request_id, &version, UpgradeStatus::Restarting, "restarting agent", None)
            .await;
        self.send_status(
            request_id,
            &version,
            UpgradeStatus::Success,
            &format!("upgraded to {}", version),
            None,
        )
        .await;

        info!(request_id, version = %version, "Upgrade installed, restarting");
        self.restart.request_restart();
        Ok(())
    }

    /// Ask the backend for the download location of `version`
    async fn resolve_manifest(&self, request_id: &str, version: &str) -> Result<Manifest> {
        let manifest_id = format!("{}-manifest", request_id);
        // Registered before sending so a fast reply cannot be missed.
        let guard = self.pending.register(&manifest_id)?;

        let envelope = Envelope::new(
            AGENT_UPGRADE_MANIFEST,
            &manifest_id,
            json!({
                "version": version,
                "os": std::env::consts::OS,
                "arch": std::env::consts::ARCH,
            }),
        );
        self.slot.send_text(envelope.to_json()?).await?;

        let reply = guard.wait(MANIFEST_TIMEOUT).await?;
        serde_json::from_value(reply)
            .map_err(|e| AgentError::Upgrade(format!("invalid manifest: {}", e)))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.http.get(url).send().await?.error_for_status()?;
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(AgentError::Upgrade("downloaded binary is empty".to_string()));
        }
        Ok(bytes.to_vec())
    }

    async fn send_status(
        &self,
        request_id: &str,
        target_version: &str,
        status: UpgradeStatus,
        message: &str,
        extra: Option<Value>,
    ) {
        let mut payload = Map::new();
        payload.insert("status".to_string(), json!(status.as_str()));
        payload.insert("message".to_string(), json!(message));
        payload.insert("time".to_string(), json!(Utc::now().to_rfc3339()));
        payload.insert(
            "agent".to_string(),
            json!({
                "version": self.current_version,
                "target_version": target_version,
            }),
        );
        if let Some(Value::Object(extra)) = extra {
            for (key, value) in extra {
                payload.entry(key).or_insert(value);
            }
        }

        let envelope = Envelope::new(AGENT_UPGRADE_STATUS, request_id, Value::Object(payload));
        push(&self.slot, &envelope).await;
    }
}

fn verify_checksum(binary: &[u8], expected: Option<&str>) -> Result<()> {
    let Some(expected) = expected.map(str::trim).filter(|s| !s.is_empty()) else {
        warn!("No checksum supplied, skipping verification");
        return Ok(());
    };

    let actual = hex::encode(Sha256::digest(binary));
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(AgentError::Upgrade(format!(
            "checksum mismatch: expected {}, got {}",
            expected, actual
        )));
    }
    Ok(())
}

/// Replace `exe_path` with `binary` by staging next to it and renaming
async fn install_binary(exe_path: &Path, binary: &[u8]) -> Result<()> {
    let mut staged = exe_path.as_os_str().to_owned();
    staged.push(".new");
    let staged = PathBuf::from(staged);

    tokio::fs::write(&staged, binary).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o755)).await?;
    }

    if let Err(e) = tokio::fs::rename(&staged, exe_path).await {
        let _ = tokio::fs::remove_file(&staged).await;
        return Err(AgentError::Upgrade(format!(
            "failed to replace {}: {}",
            exe_path.display(),
            e
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::shutdown::ShutdownCoordinator;
    use crate::connection::transport::testing::MemoryTransport;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct Fixture {
        handler: Arc<UpgradeHandler>,
        transport: Arc<MemoryTransport>,
        pending: PendingRequests,
        shutdown: ShutdownCoordinator,
        exe: PathBuf,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("fleetwatch-agent");
        std::fs::write(&exe, b"old binary").unwrap();

        let slot = TransportSlot::new();
        let transport = MemoryTransport::new();
        slot.replace(transport.clone());
        let pending = PendingRequests::new();
        let shutdown = ShutdownCoordinator::new();
        let handler = UpgradeHandler::new(slot, pending.clone(), shutdown.restart_handle(), exe.clone())
            .unwrap()
            .with_current_version("1.0.0");

        Fixture {
            handler: Arc::new(handler),
            transport,
            pending,
            shutdown,
            exe,
            _dir: dir,
        }
    }

    fn statuses(transport: &MemoryTransport) -> Vec<String> {
        transport
            .sent_json()
            .iter()
            .filter(|m| m["type"] == AGENT_UPGRADE_STATUS)
            .map(|m| m["payload"]["status"].as_str().unwrap().to_string())
            .collect()
    }

    /// Serve `body` once over HTTP and return its URL
    async fn serve_binary(body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(header.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
        });
        format!("http://{}/agent", addr)
    }

    #[tokio::test]
    async fn test_same_version_is_noop() {
        let f = fixture();
        f.handler
            .handle(
                "r-1",
                UpgradeRequest {
                    version: Some("1.0.0".to_string()),
                    download_url: Some("http://unused".to_string()),
                    ..Default::default()
                },
            )
            .await;

        assert_eq!(statuses(&f.transport), vec!["received", "noop"]);
        let sent = f.transport.sent_json();
        assert_eq!(sent[1]["request_id"], "r-1");
        assert_eq!(sent[1]["payload"]["agent"]["version"], "1.0.0");
        assert!(!f.shutdown.restart_requested());
    }

    #[tokio::test]
    async fn test_missing_version_fails() {
        let f = fixture();
        f.handler.handle("r-2", UpgradeRequest::default()).await;

        assert_eq!(statuses(&f.transport), vec!["received", "failed"]);
        let failed = f.transport.sent_json().pop().unwrap();
        assert!(failed["payload"]["message"]
            .as_str()
            .unwrap()
            .contains("version is required"));
    }

    #[tokio::test]
    async fn test_reject_reports_failed_with_request_id() {
        let f = fixture();
        f.handler.reject("u-9", "invalid type: integer `5`").await;

        assert_eq!(statuses(&f.transport), vec!["received", "failed"]);
        let failed = f.transport.sent_json().pop().unwrap();
        assert_eq!(failed["request_id"], "u-9");
        assert!(failed["payload"]["message"]
            .as_str()
            .unwrap()
            .starts_with("invalid upgrade request"));
        assert!(!f.shutdown.restart_requested());
    }

    #[tokio::test]
    async fn test_full_upgrade() {
        let f = fixture();
        let body: &'static [u8] = b"new binary";
        let url = serve_binary(body).await;

        f.handler
            .handle(
                "r-3",
                UpgradeRequest {
                    version: Some("1.1.0".to_string()),
                    download_url: Some(url),
                    sha256: Some(hex::encode(Sha256::digest(body))),
                    force: false,
                },
            )
            .await;

        assert_eq!(
            statuses(&f.transport),
            vec![
                "received",
                "starting",
                "downloading",
                "verifying",
                "installing",
                "restarting",
                "success"
            ]
        );
        assert_eq!(std::fs::read(&f.exe).unwrap(), body);
        assert!(f.shutdown.restart_requested());
    }

    #[tokio::test]
    async fn test_checksum_mismatch_keeps_binary() {
        let f = fixture();
        let url = serve_binary(b"tampered").await;

        f.handler
            .handle(
                "r-4",
                UpgradeRequest {
                    version: Some("1.1.0".to_string()),
                    download_url: Some(url),
                    sha256: Some("00".repeat(32)),
                    force: false,
                },
            )
            .await;

        let statuses = statuses(&f.transport);
        assert_eq!(statuses.last().map(String::as_str), Some("failed"));
        assert_eq!(std::fs::read(&f.exe).unwrap(), b"old binary");
        assert!(!f.shutdown.restart_requested());
    }

    #[tokio::test]
    async fn test_download_url_resolved_through_manifest() {
        let f = fixture();
        let body: &'static [u8] = b"manifest binary";
        let url = serve_binary(body).await;

        let handler = f.handler.clone();
        let task = tokio::spawn(async move {
            handler
                .handle(
                    "r-5",
                    UpgradeRequest {
                        version: Some("2.0.0".to_string()),
                        ..Default::default()
                    },
                )
                .await;
        });

        // Answer the lookup once it has gone out.
        let mut answered = false;
        for _ in 0..250 {
            let asked = f
                .transport
                .sent_json()
                .iter()
                .any(|m| m["type"] == AGENT_UPGRADE_MANIFEST && m["request_id"] == "r-5-manifest");
            if asked {
                answered = f.pending.complete("r-5-manifest", json!({ "download_url": url }));
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(answered);

        task.await.unwrap();
        assert_eq!(statuses(&f.transport).last().map(String::as_str), Some("success"));
        assert_eq!(std::fs::read(&f.exe).unwrap(), body);
    }

    #[test]
    fn test_verify_checksum() {
        let digest = hex::encode(Sha256::digest(b"abc"));
        assert!(verify_checksum(b"abc", Some(&digest.to_uppercase())).is_ok());
        assert!(verify_checksum(b"abc", None).is_ok());
        assert!(verify_checksum(b"abd", Some(&digest)).is_err());
    }
}
