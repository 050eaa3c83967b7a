//! Docker operations
//!
//! Thin mapping from `docker_*` actions to a [`ContainerRuntime`].

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use crate::error::{AgentError, Result};
use crate::handlers::{parse_params, CommandHandler};
use crate::runtime::adapter::ContainerRuntime;

const DEFAULT_STOP_TIMEOUT: i64 = 10;
const DEFAULT_LOG_TAIL: usize = 200;

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    #[serde(default)]
    all: bool,
}

#[derive(Debug, Deserialize)]
struct ContainerParams {
    id: String,
    #[serde(default)]
    timeout: Option<i64>,
    #[serde(default)]
    force: bool,
    #[serde(default)]
    tail: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct PullParams {
    image: String,
}

/// Handler for `docker_*` actions
pub struct DockerHandler {
    runtime: Arc<dyn ContainerRuntime>,
}

impl DockerHandler {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    fn container(action: &str, params: Value) -> Result<ContainerParams> {
        let params: ContainerParams = parse_params(action, params)?;
        if params.id.trim().is_empty() {
            return Err(AgentError::InvalidParams(format!("{}: id is empty", action)));
        }
        Ok(params)
    }
}

#[async_trait]
impl CommandHandler for DockerHandler {
    async fn handle(&self, action: &str, params: Value) -> Result<Value> {
        match action {
            "docker_list" => {
                let p: ListParams = parse_params(action, params)?;
                let containers = self.runtime.list_containers(p.all).await?;
                Ok(json!({ "containers": containers }))
            }
            "docker_start" => {
                let p = Self::container(action, params)?;
                self.runtime.start_container(&p.id).await?;
                Ok(json!({ "status": "success", "id": p.id }))
            }
            "docker_stop" => {
                let p = Self::container(action, params)?;
                self.runtime
                    .stop_container(&p.id, p.timeout.unwrap_or(DEFAULT_STOP_TIMEOUT))
                    .await?;
                Ok(json!({ "status": "success", "id": p.id }))
            }
            "docker_restart" => {
                let p = Self::container(action, params)?;
                self.runtime
                    .restart_container(&p.id, p.timeout.unwrap_or(DEFAULT_STOP_TIMEOUT))
                    .await?;
                Ok(json!({ "status": "success", "id": p.id }))
            }
            "docker_remove" => {
                let p = Self::container(action, params)?;
                self.runtime.remove_container(&p.id, p.force).await?;
                Ok(json!({ "status": "success", "id": p.id }))
            }
            "docker_logs" => {
                let p = Self::container(action, params)?;
                let lines = self
                    .runtime
                    .logs(&p.id, p.tail.unwrap_or(DEFAULT_LOG_TAIL))
                    .await?;
                Ok(json!({ "id": p.id, "logs": lines }))
            }
            "docker_images" => {
                let images = self.runtime.list_images().await?;
                Ok(json!({ "images": images }))
            }
            "docker_pull" => {
                let p: PullParams = parse_params(action, params)?;
                info!(image = %p.image, "Pulling image on request");
                self.runtime.pull_image(&p.image).await?;
                Ok(json!({ "status": "success", "image": p.image }))
            }
            "docker_version" => Ok(json!({ "version": self.runtime.version().await? })),
            _ => Err(AgentError::UnknownCommand(action.to_string())),
        }
    }
}
