//! File operations
//!
//! `file_list`, `file_read`, `file_write`, `file_delete`, `file_mkdir` and
//! `file_stat`. Paths must be absolute; contents travel base64 encoded.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::error::{AgentError, Result};
use crate::handlers::{parse_params, CommandHandler};

#[derive(Debug, Deserialize)]
struct PathParams {
    path: String,
}

#[derive(Debug, Deserialize)]
struct WriteParams {
    path: String,
    /// Base64 encoded
    content: String,
    #[serde(default)]
    append: bool,
}

#[derive(Debug, Deserialize)]
struct DeleteParams {
    path: String,
    #[serde(default)]
    recursive: bool,
}

/// Metadata for a single filesystem entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub size: u64,
    pub modified: Option<String>,
    pub mode: Option<String>,
}

impl FileEntry {
    fn from_metadata(path: &Path, metadata: &Metadata, is_symlink: bool) -> Self {
        Self {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string()),
            path: path.display().to_string(),
            is_dir: metadata.is_dir(),
            is_symlink,
            size: metadata.len(),
            modified: metadata
                .modified()
                .ok()
                .map(|t| DateTime::<Utc>::from(t).to_rfc3339()),
            mode: mode_string(metadata),
        }
    }
}

#[cfg(unix)]
fn mode_string(metadata: &Metadata) -> Option<String> {
    use std::os::unix::fs::PermissionsExt;
    Some(format!("{:o}", metadata.permissions().mode() & 0o7777))
}

#[cfg(not(unix))]
fn mode_string(_metadata: &Metadata) -> Option<String> {
    None
}

/// Handler for `file_*` actions
pub struct FileHandler {
    max_read_bytes: u64,
}

impl FileHandler {
    pub fn new(max_read_bytes: u64) -> Self {
        Self { max_read_bytes }
    }

    fn absolute(path: &str) -> Result<PathBuf> {
        let path = PathBuf::from(path);
        if !path.is_absolute() {
            return Err(AgentError::InvalidParams(format!(
                "path must be absolute: {}",
                path.display()
            )));
        }
        Ok(path)
    }

    async fn stat(path: &Path) -> Result<FileEntry> {
        let link_meta = fs::symlink_metadata(path).await?;
        let is_symlink = link_meta.file_type().is_symlink();
        let metadata = if is_symlink {
            fs::metadata(path).await.unwrap_or(link_meta)
        } else {
            link_meta
        };
        Ok(FileEntry::from_metadata(path, &metadata, is_symlink))
    }

    async fn list(&self, path: &Path) -> Result<Value> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(path).await?;
        while let Some(entry) = dir.next_entry().await? {
            // Entries can vanish between readdir and stat.
            if let Ok(file) = Self::stat(&entry.path()).await {
                entries.push(file);
            }
        }
        entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));

        Ok(json!({ "path": path.display().to_string(), "entries": entries }))
    }

    async fn read(&self, path: &Path) -> Result<Value> {
        let metadata = fs::metadata(path).await?;
        if metadata.is_dir() {
            return Err(AgentError::InvalidParams(format!(
                "{} is a directory",
                path.display()
            )));
        }
        if metadata.len() > self.max_read_bytes {
            return Err(AgentError::Command(format!(
                "file too large: {} bytes (limit {})",
                metadata.len(),
                self.max_read_bytes
            )));
        }

        let content = fs::read(path).await?;
        Ok(json!({
            "path": path.display().to_string(),
            "size": content.len(),
            "content": STANDARD.encode(&content),
        }))
    }

    async fn write(&self, params: WriteParams) -> Result<Value> {
        let path = Self::absolute(&params.path)?;
        let content = STANDARD
            .decode(params.content.as_bytes())
            .map_err(|e| AgentError::InvalidParams(format!("content is not base64: {}", e)))?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(params.append)
            .truncate(!params.append)
            .open(&path)
            .await?;
        file.write_all(&content).await?;
        file.flush().await?;

        info!(path = %path.display(), bytes = content.len(), "File written");
        Ok(json!({ "status": "success", "path": path.display().to_string(), "size": content.len() }))
    }

    async fn delete(&self, params: DeleteParams) -> Result<Value> {
        let path = Self::absolute(&params.path)?;
        if path.parent().is_none() {
            return Err(AgentError::InvalidParams("refusing to delete /".to_string()));
        }

        let metadata = fs::symlink_metadata(&path).await?;
        if metadata.is_dir() {
            if params.recursive {
                fs::remove_dir_all(&path).await?;
            } else {
                fs::remove_dir(&path).await?;
            }
        } else {
            fs::remove_file(&path).await?;
        }

        info!(path = %path.display(), "Path deleted");
        Ok(json!({ "status": "success", "path": path.display().to_string() }))
    }
}

#[async_trait]
impl CommandHandler for FileHandler {
    async fn handle(&self, action: &str, params: Value) -> Result<Value> {
        match action {
            "file_list" => {
                let p: PathParams = parse_params(action, params)?;
                self.list(&Self::absolute(&p.path)?).await
            }
            "file_read" => {
                let p: PathParams = parse_params(action, params)?;
                self.read(&Self::absolute(&p.path)?).await
            }
            "file_write" => self.write(parse_params(action, params)?).await,
            "file_delete" => self.delete(parse_params(action, params)?).await,
            "file_mkdir" => {
                let p: PathParams = parse_params(action, params)?;
                let path = Self::absolute(&p.path)?;
                fs::create_dir_all(&path).await?;
                Ok(json!({ "status": "success", "path": path.display().to_string() }))
            }
            "file_stat" => {
                let p: PathParams = parse_params(action, params)?;
                let entry = Self::stat(&Self::absolute(&p.path)?).await?;
                Ok(serde_json::to_value(entry)?)
            }
            _ => Err(AgentError::UnknownCommand(action.to_string())),
        }
    }
}
