//! Container Runtime Trait
//!
//! Defines the interface the docker command handler drives.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Container information returned by the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: ContainerState,
    /// Human readable status, e.g. "Up 3 hours"
    pub status: String,
    pub created: i64,
    pub ports: Vec<PortBinding>,
}

/// Container state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl ContainerState {
    pub fn parse(state: Option<&str>) -> Self {
        match state {
            Some("created") => ContainerState::Created,
            Some("running") => ContainerState::Running,
            Some("paused") => ContainerState::Paused,
            Some("restarting") => ContainerState::Restarting,
            Some("removing") => ContainerState::Removing,
            Some("exited") => ContainerState::Exited,
            Some("dead") => ContainerState::Dead,
            _ => ContainerState::Unknown,
        }
    }
}

/// Published port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortBinding {
    pub container_port: u16,
    pub host_port: Option<u16>,
    pub host_ip: Option<String>,
    pub protocol: String,
}

/// Image information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub size: i64,
    pub created: i64,
}

/// Runtime the docker handler talks to
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Runtime version string
    async fn version(&self) -> Result<String>;

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerInfo>>;

    async fn start_container(&self, id: &str) -> Result<()>;

    async fn stop_container(&self, id: &str, timeout_secs: i64) -> Result<()>;

    async fn restart_container(&self, id: &str, timeout_secs: i64) -> Result<()>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<()>;

    /// Last `tail` log lines (stdout and stderr)
    async fn logs(&self, id: &str, tail: usize) -> Result<Vec<String>>;

    async fn list_images(&self) -> Result<Vec<ImageInfo>>;

    async fn pull_image(&self, image: &str) -> Result<()>;
}
