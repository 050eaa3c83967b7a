//! Process operations: `process_list` and `process_kill`

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use sysinfo::{Pid, System};
use tracing::info;

use crate::error::{AgentError, Result};
use crate::handlers::{parse_params, CommandHandler};

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    /// "cpu" or "memory"
    #[serde(default)]
    sort_by: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct KillParams {
    pid: u32,
}

/// One row of `process_list`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    pub cpu_usage: f32,
    pub memory: u64,
    pub status: String,
}

/// Handler for `process_*` actions
pub struct ProcessHandler {
    system: Arc<Mutex<System>>,
}

impl ProcessHandler {
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
        }
    }

    async fn list(&self, params: ListParams) -> Result<Value> {
        let system = self.system.clone();
        let mut entries = tokio::task::spawn_blocking(move || {
            let mut system = system.lock();
            system.refresh_processes();
            system
                .processes()
                .values()
                .map(|p| ProcessEntry {
                    pid: p.pid().as_u32(),
                    name: p.name().to_string(),
                    cpu_usage: p.cpu_usage(),
                    memory: p.memory(),
                    status: p.status().to_string(),
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| AgentError::Command(format!("process listing panicked: {}", e)))?;

        sort_entries(&mut entries, params.sort_by.as_deref());
        if let Some(limit) = params.limit {
            entries.truncate(limit);
        }

        Ok(json!({ "processes": entries, "count": entries.len() }))
    }

    async fn kill(&self, params: KillParams) -> Result<Value> {
        if params.pid == std::process::id() {
            return Err(AgentError::InvalidParams("refusing to kill the agent itself".to_string()));
        }

        let system = self.system.clone();
        let pid = params.pid;
        let killed = tokio::task::spawn_blocking(move || {
            let mut system = system.lock();
            system.refresh_processes();
            system.process(Pid::from_u32(pid)).map(|p| p.kill())
        })
        .await
        .map_err(|e| AgentError::Command(format!("process kill panicked: {}", e)))?;

        match killed {
            None => Err(AgentError::Command(format!("process {} not found", pid))),
            Some(false) => Err(AgentError::Command(format!("failed to signal process {}", pid))),
            Some(true) => {
                info!(pid, "Process killed");
                Ok(json!({ "status": "success", "pid": pid }))
            }
        }
    }
}

impl Default for ProcessHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn sort_entries(entries: &mut [ProcessEntry], sort_by: Option<&str>) {
    match sort_by {
        Some("memory") => entries.sort_by(|a, b| b.memory.cmp(&a.memory)),
        Some("cpu") => entries.sort_by(|a, b| b.cpu_usage.total_cmp(&a.cpu_usage)),
        _ => entries.sort_by_key(|e| e.pid),
    }
}

#[async_trait]
impl CommandHandler for ProcessHandler {
    async fn handle(&self, action: &str, params: Value) -> Result<Value> {
        match action {
            "process_list" => {
                let params = if params.is_null() {
                    ListParams::default()
                } else {
                    parse_params(action, params)?
                };
                self.list(params).await
            }
            "process_kill" => self.kill(parse_params(action, params)?).await,
            _ => Err(AgentError::UnknownCommand(action.to_string())),
        }
    }
}
