//! Terminal sessions
//!
//! Each session is a shell child process with piped stdio. Input arrives via
//! `terminal_input`; output is pushed back unsolicited as `terminal_output`
//! envelopes. A shell that exits by itself is reaped and announced with a
//! `terminal_exit` envelope. The handler keeps its own session map in front of the shared
//! [`SessionRegistry`], which remains the authority on which sessions exist.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::protocol::{Envelope, TERMINAL_EXIT, TERMINAL_OUTPUT};
use crate::connection::transport::TransportSlot;
use crate::error::{AgentError, Result};
use crate::handlers::{parse_params, push, CommandHandler};

const READ_CHUNK: usize = 4096;
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Deserialize)]
struct CreateParams {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    cols: Option<u16>,
    #[serde(default)]
    rows: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct SessionParams {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct InputParams {
    session_id: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct ResizeParams {
    session_id: String,
    cols: u16,
    rows: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// A running shell
pub struct TerminalSession {
    id: String,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Child>,
    size: SyncMutex<TerminalSize>,
    created_at: DateTime<Utc>,
    exited: AtomicBool,
}

impl TerminalSession {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn size(&self) -> TerminalSize {
        *self.size.lock()
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        let Some(stdin) = stdin.as_mut() else {
            return Err(AgentError::Command(format!("session {} is closed", self.id)));
        };
        stdin.write_all(data).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn terminate(&self) {
        self.exited.store(true, Ordering::SeqCst);
        self.stdin.lock().await.take();
        let mut child = self.child.lock().await;
        match tokio::time::timeout(KILL_TIMEOUT, child.kill()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(session_id = %self.id, error = %e, "Shell already gone"),
            Err(_) => debug!(session_id = %self.id, "Timed out waiting for shell to exit"),
        }
    }

    fn summary(&self) -> Value {
        json!({
            "session_id": self.id,
            "size": self.size(),
            "created_at": self.created_at.to_rfc3339(),
        })
    }
}

/// Authoritative set of live sessions, shared by every terminal handler
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<TerminalSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Arc<TerminalSession>> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    pub fn insert(&self, session: Arc<TerminalSession>) {
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn remove(&self, id: &str) -> Option<Arc<TerminalSession>> {
        self.sessions.remove(id).map(|(_, s)| s)
    }

    /// Remove `session` only if it is still the one registered under its id
    fn remove_exact(&self, session: &Arc<TerminalSession>) -> bool {
        self.sessions
            .remove_if(&session.id, |_, s| Arc::ptr_eq(s, session))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn all(&self) -> Vec<Arc<TerminalSession>> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }
}

/// Handler for `terminal_*` actions
pub struct TerminalHandler {
    shell: String,
    local: Arc<DashMap<String, Arc<TerminalSession>>>,
    registry: Arc<SessionRegistry>,
    slot: TransportSlot,
}

impl TerminalHandler {
    pub fn new(shell: &str, registry: Arc<SessionRegistry>, slot: TransportSlot) -> Self {
        Self {
            shell: shell.to_string(),
            local: Arc::new(DashMap::new()),
            registry,
            slot,
        }
    }

    /// Local map first, then the registry once
    fn lookup(&self, id: &str) -> Result<Arc<TerminalSession>> {
        let cached = self.local.get(id).map(|s| s.value().clone());
        if let Some(session) = cached {
            if !session.has_exited() {
                return Ok(session);
            }
            // Exited or closed through another handler
            self.local.remove_if(id, |_, s| Arc::ptr_eq(s, &session));
        }
        match self.registry.get(id) {
            Some(session) => {
                self.local.insert(id.to_string(), session.clone());
                Ok(session)
            }
            None => Err(AgentError::SessionNotFound(id.to_string())),
        }
    }

    async fn create(&self, params: CreateParams) -> Result<Value> {
        let id = params
            .session_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.registry.get(&id).is_some() {
            return Err(AgentError::InvalidParams(format!("session already exists: {}", id)));
        }

        let mut child = Command::new(&self.shell)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let defaults = TerminalSize::default();
        let session = Arc::new(TerminalSession {
            id: id.clone(),
            stdin: Mutex::new(child.stdin.take()),
            child: Mutex::new(child),
            size: SyncMutex::new(TerminalSize {
                cols: params.cols.unwrap_or(defaults.cols),
                rows: params.rows.unwrap_or(defaults.rows),
            }),
            created_at: Utc::now(),
            exited: AtomicBool::new(false),
        });

        self.registry.insert(session.clone());
        self.local.insert(id.clone(), session.clone());

        if let Some(stderr) = stderr {
            tokio::spawn(pump_output(stderr, id.clone(), "stderr", self.slot.clone()));
        }
        if let Some(stdout) = stdout {
            let reaper = Reaper {
                session,
                registry: self.registry.clone(),
                local: self.local.clone(),
                slot: self.slot.clone(),
            };
            let slot = self.slot.clone();
            let session_id = id.clone();
            tokio::spawn(async move {
                pump_output(stdout, session_id, "stdout", slot).await;
                reaper.run().await;
            });
        }

        info!(session_id = %id, shell = %self.shell, "Terminal session created");
        Ok(json!({ "status": "success", "session_id": id }))
    }

    async fn close(&self, id: &str) -> Result<Value> {
        let session = self.lookup(id)?;
        self.local.remove(id);
        self.registry.remove(id);
        session.terminate().await;

        info!(session_id = %id, "Terminal session closed");
        Ok(json!({ "status": "success", "session_id": id }))
    }
}

/// Cleans up after a shell whose stdout closed without `terminal_close`
struct Reaper {
    session: Arc<TerminalSession>,
    registry: Arc<SessionRegistry>,
    local: Arc<DashMap<String, Arc<TerminalSession>>>,
    slot: TransportSlot,
}

impl Reaper {
    async fn run(self) {
        let session = self.session;
        // Losing this race means terminal_close already owns the teardown.
        if !self.registry.remove_exact(&session) {
            return;
        }
        self.local
            .remove_if(&session.id, |_, s| Arc::ptr_eq(s, &session));
        session.exited.store(true, Ordering::SeqCst);
        session.stdin.lock().await.take();

        let mut child = session.child.lock().await;
        let exit_code = match tokio::time::timeout(KILL_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => status.code(),
            Ok(Err(e)) => {
                warn!(session_id = %session.id, error = %e, "Failed to collect shell status");
                None
            }
            Err(_) => {
                // stdout closed but the shell lingers
                if let Err(e) = child.kill().await {
                    debug!(session_id = %session.id, error = %e, "Shell already gone");
                }
                None
            }
        };
        drop(child);

        info!(session_id = %session.id, ?exit_code, "Terminal session exited");
        let envelope = Envelope::new(
            TERMINAL_EXIT,
            "",
            json!({ "session_id": session.id, "exit_code": exit_code }),
        );
        push(&self.slot, &envelope).await;
    }
}

/// Turns a byte stream into text without splitting multi-byte characters
/// across reads
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let split = self.pending.len() - incomplete_tail(&self.pending);
        let text = String::from_utf8_lossy(&self.pending[..split]).into_owned();
        self.pending.drain(..split);
        text
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Length of a trailing sequence that is a valid prefix of a longer character
fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xC2..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF4 => 4,
            _ => return 0,
        };
        return if width > back { back } else { 0 };
    }
    0
}

async fn pump_output<R>(mut reader: R, session_id: String, stream: &'static str, slot: TransportSlot)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    let mut carry = Utf8Carry::default();
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(session_id = %session_id, stream, error = %e, "Terminal read failed");
                break;
            }
        };
        let data = carry.push(&buf[..n]);
        if !data.is_empty() {
            push_output(&slot, &session_id, stream, data).await;
        }
    }
    let rest = carry.finish();
    if !rest.is_empty() {
        push_output(&slot, &session_id, stream, rest).await;
    }
    debug!(session_id = %session_id, stream, "Terminal output ended");
}

async fn push_output(slot: &TransportSlot, session_id: &str, stream: &str, data: String) {
    let envelope = Envelope::new(
        TERMINAL_OUTPUT,
        "",
        json!({
            "session_id": session_id,
            "stream": stream,
            "data": data,
        }),
    );
    push(slot, &envelope).await;
}

#[async_trait]
impl CommandHandler for TerminalHandler {
    async fn handle(&self, action: &str, params: Value) -> Result<Value> {
        match action {
            "terminal_create" => {
                let params = if params.is_null() {
                    CreateParams::default()
                } else {
                    parse_params(action, params)?
                };
                self.create(params).await
            }
            "terminal_input" => {
                let p: InputParams = parse_params(action, params)?;
                self.lookup(&p.session_id)?.write(p.data.as_bytes()).await?;
                Ok(json!({ "status": "success" }))
            }
            "terminal_resize" => {
                let p: ResizeParams = parse_params(action, params)?;
                let session = self.lookup(&p.session_id)?;
                // Pipes have no window; the size is kept for listing only.
                *session.size.lock() = TerminalSize {
                    cols: p.cols,
                    rows: p.rows,
                };
                Ok(json!({ "status": "success", "size": session.size() }))
            }
            "terminal_close" => {
                let p: SessionParams = parse_params(action, params)?;
                self.close(&p.session_id).await
            }
            "terminal_list" => {
                let sessions: Vec<Value> =
                    self.registry.all().iter().map(|s| s.summary()).collect();
                Ok(json!({ "sessions": sessions }))
            }
            _ => Err(AgentError::UnknownCommand(action.to_string())),
        }
    }
}
