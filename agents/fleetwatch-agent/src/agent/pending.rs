//! Request correlation
//!
//! A flow that sends a request over the transport and expects a typed reply
//! registers the request id first, then sends. The dispatcher completes the
//! entry when a message with that id arrives. Dropping the guard unregisters,
//! so an abandoned wait never leaves a stale entry behind.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::{AgentError, Result};

/// Registration number plus the reply channel
type Slot = (u64, oneshot::Sender<Value>);

/// In-flight requests awaiting a reply
#[derive(Clone, Default)]
pub struct PendingRequests {
    inner: Arc<DashMap<String, Slot>>,
    next: Arc<AtomicU64>,
}

/// Registration of one request; unregisters on drop
pub struct PendingGuard {
    id: String,
    token: u64,
    rx: Option<oneshot::Receiver<Value>>,
    map: Arc<DashMap<String, Slot>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` before the request goes out. An id that is already
    /// waiting is rejected.
    pub fn register(&self, id: &str) -> Result<PendingGuard> {
        let (tx, rx) = oneshot::channel();
        let token = self.next.fetch_add(1, Ordering::Relaxed);
        match self.inner.entry(id.to_string()) {
            Entry::Occupied(_) => {
                return Err(AgentError::InvalidParams(format!(
                    "request already pending: {}",
                    id
                )))
            }
            Entry::Vacant(entry) => {
                entry.insert((token, tx));
            }
        }
        Ok(PendingGuard {
            id: id.to_string(),
            token,
            rx: Some(rx),
            map: self.inner.clone(),
        })
    }

    /// Deliver a reply. Returns false when nobody is waiting for `id`.
    pub fn complete(&self, id: &str, value: Value) -> bool {
        if id.is_empty() {
            return false;
        }
        match self.inner.remove(id) {
            Some((_, (_, tx))) => tx.send(value).is_ok(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl PendingGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the reply, at most `limit`
    pub async fn wait(mut self, limit: Duration) -> Result<Value> {
        let Some(rx) = self.rx.take() else {
            return Err(AgentError::Command(format!("request {} already awaited", self.id)));
        };
        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(AgentError::Command(format!("request {} abandoned", self.id))),
            Err(_) => Err(AgentError::Command(format!(
                "no reply to {} within {:?}",
                self.id, limit
            ))),
        }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        // A later registration under the same id is not ours to remove.
        self.map.remove_if(&self.id, |_, (token, _)| *token == self.token);
    }
}
