//! Operation handlers
//!
//! Each handler family (file, process, docker, nginx, terminal) receives the
//! legacy command's action and its untouched params, and returns the JSON the
//! backend gets back.

pub mod docker;
pub mod file;
pub mod nginx;
pub mod process;
pub mod terminal;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use crate::cli::config::HandlerConfig;
use crate::connection::protocol::{CommandCategory, Envelope};
use crate::connection::transport::TransportSlot;
use crate::error::{AgentError, Result};
use crate::runtime::docker::DockerRuntime;

/// A family of operations addressed by action name
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, action: &str, params: Value) -> Result<Value>;
}

/// One handler per routable category
#[derive(Clone)]
pub struct HandlerSet {
    pub file: Arc<dyn CommandHandler>,
    pub process: Arc<dyn CommandHandler>,
    pub docker: Arc<dyn CommandHandler>,
    pub nginx: Arc<dyn CommandHandler>,
    pub terminal: Arc<dyn CommandHandler>,
}

impl HandlerSet {
    /// Production handlers
    pub fn from_config(config: &HandlerConfig, slot: TransportSlot) -> Result<Self> {
        let runtime = Arc::new(DockerRuntime::with_socket(&config.docker_socket)?);
        Ok(Self {
            file: Arc::new(file::FileHandler::new(config.max_file_read_bytes)),
            process: Arc::new(process::ProcessHandler::new()),
            docker: Arc::new(docker::DockerHandler::new(runtime)),
            nginx: Arc::new(nginx::NginxHandler::new(
                &config.nginx_bin,
                &config.nginx_sites_dir,
            )),
            terminal: Arc::new(terminal::TerminalHandler::new(
                &config.shell,
                Arc::new(terminal::SessionRegistry::new()),
                slot,
            )),
        })
    }

    /// Handler for a category; `None` for ping and unknown actions
    pub fn get(&self, category: CommandCategory) -> Option<&Arc<dyn CommandHandler>> {
        match category {
            CommandCategory::File => Some(&self.file),
            CommandCategory::Process => Some(&self.process),
            CommandCategory::Docker => Some(&self.docker),
            CommandCategory::Nginx => Some(&self.nginx),
            CommandCategory::Terminal => Some(&self.terminal),
            CommandCategory::Ping | CommandCategory::Unknown => None,
        }
    }
}

/// Decode an action's params into its typed form
pub(crate) fn parse_params<T: DeserializeOwned>(action: &str, params: Value) -> Result<T> {
    serde_json::from_value(params)
        .map_err(|e| AgentError::InvalidParams(format!("{}: {}", action, e)))
}

/// Push an unsolicited message; dropped with a warning when disconnected
pub(crate) async fn push(slot: &TransportSlot, envelope: &Envelope) {
    let text = match envelope.to_json() {
        Ok(text) => text,
        Err(e) => {
            warn!(kind = %envelope.kind, error = %e, "Failed to encode push message");
            return;
        }
    };
    if let Err(e) = slot.send_text(text).await {
        warn!(
            kind = %envelope.kind,
            request_id = %envelope.request_id,
            error = %e,
            "Push message dropped"
        );
    }
}
