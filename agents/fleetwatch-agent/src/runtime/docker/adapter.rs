//! Docker Runtime
//!
//! [`ContainerRuntime`] implementation backed by the Docker engine API via
//! bollard.

use async_trait::async_trait;
use bollard::container::{
    ListContainersOptions, LogsOptions, RemoveContainerOptions, RestartContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{debug, info};

use crate::error::Result;
use crate::runtime::adapter::{
    ContainerInfo, ContainerRuntime, ContainerState, ImageInfo, PortBinding,
};

/// Docker runtime
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Client for the engine listening on `socket_path`. No request is made
    /// until the first command arrives.
    pub fn with_socket(socket_path: &str) -> Result<Self> {
        let client = Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn version(&self) -> Result<String> {
        let version = self.client.version().await?;
        Ok(format!(
            "Docker {} (API {})",
            version.version.unwrap_or_default(),
            version.api_version.unwrap_or_default()
        ))
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerInfo>> {
        let options = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };

        let containers = self.client.list_containers(Some(options)).await?;

        Ok(containers
            .into_iter()
            .map(|container| ContainerInfo {
                id: container.id.unwrap_or_default(),
                name: container
                    .names
                    .and_then(|n| n.first().cloned())
                    .unwrap_or_default()
                    .trim_start_matches('/')
                    .to_string(),
                image: container.image.unwrap_or_default(),
                state: ContainerState::parse(container.state.as_deref()),
                status: container.status.unwrap_or_default(),
                created: container.created.unwrap_or_default(),
                ports: container
                    .ports
                    .unwrap_or_default()
                    .iter()
                    .map(|p| PortBinding {
                        container_port: p.private_port,
                        host_port: p.public_port,
                        host_ip: p.ip.clone(),
                        protocol: p
                            .typ
                            .as_ref()
                            .map(|t| t.to_string())
                            .unwrap_or_else(|| "tcp".to_string()),
                    })
                    .collect(),
            })
            .collect())
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        info!(container_id = %id, "Container started");
        Ok(())
    }

    async fn stop_container(&self, id: &str, timeout_secs: i64) -> Result<()> {
        self.client
            .stop_container(id, Some(StopContainerOptions { t: timeout_secs }))
            .await?;
        info!(container_id = %id, "Container stopped");
        Ok(())
    }

    async fn restart_container(&self, id: &str, timeout_secs: i64) -> Result<()> {
        self.client
            .restart_container(
                id,
                Some(RestartContainerOptions {
                    t: timeout_secs as isize,
                }),
            )
            .await?;
        info!(container_id = %id, "Container restarted");
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.client.remove_container(id, Some(options)).await?;
        info!(container_id = %id, "Container removed");
        Ok(())
    }

    async fn logs(&self, id: &str, tail: usize) -> Result<Vec<String>> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };

        let mut stream = self.client.logs(id, Some(options));
        let mut lines = Vec::new();
        while let Some(chunk) = stream.next().await {
            lines.push(chunk?.to_string());
        }
        Ok(lines)
    }

    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        let options = ListImagesOptions::<String> {
            all: false,
            ..Default::default()
        };

        let images = self.client.list_images(Some(options)).await?;

        Ok(images
            .into_iter()
            .map(|img| ImageInfo {
                id: img.id,
                repo_tags: img.repo_tags,
                size: img.size,
                created: img.created,
            })
            .collect())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            if let Some(status) = progress?.status {
                debug!(image = %image, status = %status, "Pulling image");
            }
        }

        info!(image = %image, "Image pulled");
        Ok(())
    }
}
