//! Nginx operations
//!
//! `nginx_status`, `nginx_test`, `nginx_reload` and `nginx_sites`, all driven
//! through the nginx binary.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::error::{AgentError, Result};
use crate::handlers::CommandHandler;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Captured result of one nginx invocation
#[derive(Debug, Clone)]
struct CommandOutput {
    success: bool,
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

/// Handler for `nginx_*` actions
pub struct NginxHandler {
    binary: String,
    sites_dir: PathBuf,
}

impl NginxHandler {
    pub fn new(binary: &str, sites_dir: &str) -> Self {
        Self {
            binary: binary.to_string(),
            sites_dir: PathBuf::from(sites_dir),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = timeout(COMMAND_TIMEOUT, command.output())
            .await
            .map_err(|_| {
                AgentError::Command(format!("{} {} timed out", self.binary, args.join(" ")))
            })??;

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn status(&self) -> Result<Value> {
        let version = self.run(&["-v"]).await?;
        // nginx prints its version on stderr
        let version_text = if version.stderr.is_empty() {
            version.stdout
        } else {
            version.stderr
        };
        let test = self.run(&["-t"]).await?;

        Ok(json!({
            "installed": version.success,
            "version": version_text,
            "config_ok": test.success,
        }))
    }

    async fn test_config(&self) -> Result<Value> {
        let output = self.run(&["-t"]).await?;
        Ok(json!({
            "ok": output.success,
            "exit_code": output.code,
            "output": format!("{}{}", output.stdout, output.stderr),
        }))
    }

    async fn reload(&self) -> Result<Value> {
        let test = self.run(&["-t"]).await?;
        if !test.success {
            warn!(output = %test.stderr, "Refusing to reload, configuration test failed");
            return Err(AgentError::Command(format!(
                "configuration test failed: {}",
                test.stderr
            )));
        }

        let reload = self.run(&["-s", "reload"]).await?;
        if !reload.success {
            return Err(AgentError::Command(format!("reload failed: {}", reload.stderr)));
        }

        info!("nginx reloaded");
        Ok(json!({ "status": "success" }))
    }

    async fn sites(&self) -> Result<Value> {
        let mut sites = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.sites_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            sites.push(entry.file_name().to_string_lossy().to_string());
        }
        sites.sort();

        Ok(json!({ "dir": self.sites_dir.display().to_string(), "sites": sites }))
    }
}

#[async_trait]
impl CommandHandler for NginxHandler {
    async fn handle(&self, action: &str, _params: Value) -> Result<Value> {
        match action {
            "nginx_status" => self.status().await,
            "nginx_test" => self.test_config().await,
            "nginx_reload" => self.reload().await,
            "nginx_sites" => self.sites().await,
            _ => Err(AgentError::UnknownCommand(action.to_string())),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reload_with_passing_config() {
        // `true` accepts any arguments and exits 0.
        let handler = NginxHandler::new("true", "/nonexistent");
        let result = handler.handle("nginx_reload", json!({})).await.unwrap();
        assert_eq!(result["status"], "success");

        let test = handler.handle("nginx_test", json!({})).await.unwrap();
        assert_eq!(test["ok"], true);
    }

    #[tokio::test]
    async fn test_reload_refused_when_config_test_fails() {
        let handler = NginxHandler::new("false", "/nonexistent");
        let err = handler.handle("nginx_reload", json!({})).await.unwrap_err();
        assert!(err.to_string().contains("configuration test failed"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_an_error() {
        let handler = NginxHandler::new("/nonexistent/nginx", "/nonexistent");
        assert!(matches!(
            handler.handle("nginx_status", json!({})).await,
            Err(AgentError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_sites_listing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.conf"), "").unwrap();
        std::fs::write(dir.path().join("a.conf"), "").unwrap();

        let handler = NginxHandler::new("true", &dir.path().display().to_string());
        let result = handler.handle("nginx_sites", json!({})).await.unwrap();
        assert_eq!(result["sites"], json!(["a.conf", "b.conf"]));
    }
}
