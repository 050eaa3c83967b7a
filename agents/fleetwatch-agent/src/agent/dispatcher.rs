//! Command Dispatcher
//!
//! Turns inbound text frames into responses. Every frame is handled on its
//! own tracked task, so a slow handler never delays the next message, and
//! every response goes out under a bounded write deadline.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::agent::pending::PendingRequests;
use crate::agent::upgrade::UpgradeHandler;
use crate::connection::protocol::{
    error_response, pong, CommandCategory, InboundMessage, LegacyCommand, TypedMessage,
    AGENT_UPGRADE,
};
use crate::connection::transport::{Transport, TransportSlot};
use crate::error::AgentError;
use crate::handlers::HandlerSet;

/// Deadline for writing one response
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Holds a write deadline on a transport and clears it when dropped, whether
/// the write succeeded or not
pub struct WriteDeadlineGuard {
    transport: Arc<dyn Transport>,
}

impl WriteDeadlineGuard {
    pub fn new(transport: Arc<dyn Transport>, deadline: Duration) -> Self {
        transport.set_write_deadline(Some(deadline));
        Self { transport }
    }
}

impl Drop for WriteDeadlineGuard {
    fn drop(&mut self) {
        self.transport.set_write_deadline(None);
    }
}

pub struct CommandDispatcher {
    slot: TransportSlot,
    handlers: HandlerSet,
    upgrade: Option<Arc<UpgradeHandler>>,
    pending: PendingRequests,
    tracker: TaskTracker,
    cancel: CancellationToken,
    // Deadline set, write and reset happen as one unit.
    write_lock: Mutex<()>,
    write_timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(
        slot: TransportSlot,
        handlers: HandlerSet,
        pending: PendingRequests,
        tracker: TaskTracker,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            slot,
            handlers,
            upgrade: None,
            pending,
            tracker,
            cancel,
            write_lock: Mutex::new(()),
            write_timeout: WRITE_TIMEOUT,
        }
    }

    pub fn with_upgrade(mut self, upgrade: Arc<UpgradeHandler>) -> Self {
        self.upgrade = Some(upgrade);
        self
    }

    /// Consume inbound frames until shutdown or until every sender is gone
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<String>) {
        loop {
            let text = tokio::select! {
                _ = self.cancel.cancelled() => break,
                text = inbound.recv() => match text {
                    Some(text) => text,
                    None => break,
                },
            };

            let dispatcher = self.clone();
            let cancel = self.cancel.clone();
            self.tracker.spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = dispatcher.process(text) => {}
                }
            });
        }
        debug!("Dispatcher stopped");
    }

    /// Handle one frame and write back its response, if it has one
    pub async fn process(&self, text: String) {
        if let Some(response) = self.handle_text(&text).await {
            self.respond(response).await;
        }
    }

    /// Interpret one frame. `None` means nothing should be written back now.
    pub async fn handle_text(&self, text: &str) -> Option<Value> {
        let message = match InboundMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Failed to parse inbound message");
                return Some(error_response(
                    &format!("failed to parse command: {}", e),
                    None,
                ));
            }
        };

        match message {
            InboundMessage::Typed(typed) => self.handle_typed(typed).await,
            InboundMessage::Legacy(command) => Some(self.handle_legacy(command).await),
        }
    }

    async fn handle_typed(&self, typed: TypedMessage) -> Option<Value> {
        match typed {
            TypedMessage::AgentUpgrade {
                request_id,
                request,
            } => match &self.upgrade {
                Some(upgrade) => {
                    // Progress goes out as status pushes, not as a response.
                    upgrade.handle(&request_id, request).await;
                    None
                }
                None => Some(error_response(
                    "agent upgrade is not available",
                    Some(&request_id),
                )),
            },
            TypedMessage::Malformed {
                kind,
                request_id,
                error,
            } => {
                warn!(kind = %kind, request_id = %request_id, error = %error, "Malformed typed message");
                match (&self.upgrade, kind.as_str()) {
                    (Some(upgrade), AGENT_UPGRADE) => {
                        upgrade.reject(&request_id, &error).await;
                        None
                    }
                    _ => Some(error_response(
                        &format!("invalid {} payload: {}", kind, error),
                        Some(&request_id),
                    )),
                }
            }
            TypedMessage::Unknown {
                kind,
                request_id,
                payload,
            } => {
                if self.pending.complete(&request_id, payload) {
                    debug!(kind = %kind, request_id = %request_id, "Reply delivered to waiting request");
                    return None;
                }
                warn!(kind = %kind, request_id = %request_id, "Unknown message type");
                Some(error_response(
                    &AgentError::UnknownMessageType(kind).to_string(),
                    Some(&request_id),
                ))
            }
        }
    }

    async fn handle_legacy(&self, command: LegacyCommand) -> Value {
        let category = CommandCategory::classify(&command.action);
        debug!(action = %command.action, %category, "Dispatching command");

        let handler = match category {
            CommandCategory::Ping => return pong(),
            _ => self.handlers.get(category),
        };
        let Some(handler) = handler else {
            warn!(action = %command.action, "Unknown command");
            return error_response(&AgentError::UnknownCommand(command.action).to_string(), None);
        };

        match handler.handle(&command.action, command.params).await {
            Ok(response) => {
                info!(action = %command.action, "Command completed");
                response
            }
            Err(e) => {
                warn!(action = %command.action, error = %e, "Command failed");
                error_response(&e.to_string(), None)
            }
        }
    }

    async fn respond(&self, response: Value) {
        let Some(transport) = self.slot.current() else {
            warn!("No transport, dropping response");
            return;
        };
        let text = match serde_json::to_string(&response) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Failed to encode response");
                return;
            }
        };

        let _serialised = self.write_lock.lock().await;
        let _deadline = WriteDeadlineGuard::new(transport.clone(), self.write_timeout);
        if let Err(e) = transport.send_text(text).await {
            warn!(error = %e, "Failed to write response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::transport::testing::MemoryTransport;
    use crate::error::Result;
    use crate::handlers::CommandHandler;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    #[derive(Default)]
    struct RecordingHandler {
        calls: SyncMutex<Vec<(String, Value)>>,
        fail: bool,
    }

    #[async_trait]
    impl CommandHandler for RecordingHandler {
        async fn handle(&self, action: &str, params: Value) -> Result<Value> {
            self.calls.lock().push((action.to_string(), params));
            if self.fail {
                return Err(AgentError::Command("disk on fire".to_string()));
            }
            Ok(json!({ "status": "success", "handled": action }))
        }
    }

    struct Harness {
        dispatcher: Arc<CommandDispatcher>,
        transport: Arc<MemoryTransport>,
        slot: TransportSlot,
        file: Arc<RecordingHandler>,
        docker: Arc<RecordingHandler>,
        others: Vec<Arc<RecordingHandler>>,
        pending: PendingRequests,
        cancel: CancellationToken,
    }

    fn harness() -> Harness {
        let file = Arc::new(RecordingHandler::default());
        let docker = Arc::new(RecordingHandler::default());
        let process = Arc::new(RecordingHandler::default());
        let nginx = Arc::new(RecordingHandler {
            fail: true,
            ..Default::default()
        });
        let terminal = Arc::new(RecordingHandler::default());
        let handlers = HandlerSet {
            file: file.clone(),
            process: process.clone(),
            docker: docker.clone(),
            nginx: nginx.clone(),
            terminal: terminal.clone(),
        };

        let slot = TransportSlot::new();
        let transport = MemoryTransport::new();
        slot.replace(transport.clone());
        let pending = PendingRequests::new();
        let cancel = CancellationToken::new();

        let dispatcher = CommandDispatcher::new(
            slot.clone(),
            handlers,
            pending.clone(),
            TaskTracker::new(),
            cancel.clone(),
        );

        Harness {
            dispatcher: Arc::new(dispatcher),
            transport,
            slot,
            file,
            docker,
            others: vec![process, nginx, terminal],
            pending,
            cancel,
        }
    }

    impl Harness {
        fn total_calls(&self) -> usize {
            self.file.calls.lock().len()
                + self.docker.calls.lock().len()
                + self.others.iter().map(|h| h.calls.lock().len()).sum::<usize>()
        }
    }

    #[tokio::test]
    async fn test_routing() {
        let h = harness();

        let response = h
            .dispatcher
            .handle_text(r#"{"action":"file_list","params":{"path":"/var/log","extra":[1,{"a":null}]}}"#)
            .await
            .unwrap();
        assert_eq!(response["handled"], "file_list");
        assert_eq!(
            h.file.calls.lock()[0],
            (
                "file_list".to_string(),
                json!({ "path": "/var/log", "extra": [1, { "a": null }] })
            )
        );

        let response = h
            .dispatcher
            .handle_text(r#"{"action":"docker_stop","params":{"id":"abc"}}"#)
            .await
            .unwrap();
        assert_eq!(response["handled"], "docker_stop");
        assert_eq!(h.docker.calls.lock().len(), 1);
        assert_eq!(h.total_calls(), 2);
    }

    #[tokio::test]
    async fn test_ping_bypasses_handlers() {
        let h = harness();
        let response = h.dispatcher.handle_text(r#"{"action":"ping"}"#).await.unwrap();
        assert_eq!(response, json!({ "status": "pong" }));
        assert_eq!(h.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_action_names_the_action() {
        let h = harness();
        let response = h
            .dispatcher
            .handle_text(r#"{"action":"frobnicate","params":{}}"#)
            .await
            .unwrap();
        assert_eq!(response["status"], "error");
        assert!(response["error"].as_str().unwrap().contains("frobnicate"));
        assert_eq!(h.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_handler_error_is_returned() {
        let h = harness();
        let response = h
            .dispatcher
            .handle_text(r#"{"action":"nginx_reload"}"#)
            .await
            .unwrap();
        assert_eq!(
            response,
            json!({ "status": "error", "error": "disk on fire" })
        );
    }

    #[tokio::test]
    async fn test_parse_failure() {
        let h = harness();
        let response = h.dispatcher.handle_text("{not json").await.unwrap();
        assert_eq!(response["status"], "error");
        assert!(response["error"]
            .as_str()
            .unwrap()
            .starts_with("failed to parse command"));
    }

    #[tokio::test]
    async fn test_unknown_type_is_correlated() {
        let h = harness();
        let response = h
            .dispatcher
            .handle_text(r#"{"type":"cert_renew","request_id":"r-9","payload":{"x":1}}"#)
            .await
            .unwrap();
        assert_eq!(
            response,
            json!({
                "status": "error",
                "error": "unknown message type: cert_renew",
                "request_id": "r-9",
            })
        );
    }

    #[tokio::test]
    async fn test_upgrade_without_handler() {
        let h = harness();
        let response = h
            .dispatcher
            .handle_text(r#"{"type":"agent_upgrade","request_id":"u-1","payload":{"version":"9.9.9"}}"#)
            .await
            .unwrap();
        assert_eq!(response["request_id"], "u-1");
    }

    #[tokio::test]
    async fn test_malformed_upgrade_is_correlated() {
        let h = harness();
        let response = h
            .dispatcher
            .handle_text(r#"{"type":"agent_upgrade","request_id":"u-9","payload":{"version":5}}"#)
            .await
            .unwrap();
        assert_eq!(response["status"], "error");
        assert_eq!(response["request_id"], "u-9");
        assert!(response["error"]
            .as_str()
            .unwrap()
            .starts_with("invalid agent_upgrade payload"));
    }

    #[tokio::test]
    async fn test_reply_completes_pending_request() {
        let h = harness();
        let guard = h.pending.register("u-2-manifest").unwrap();

        let response = h
            .dispatcher
            .handle_text(
                r#"{"type":"agent_upgrade_manifest","request_id":"u-2-manifest","payload":{"download_url":"https://x"}}"#,
            )
            .await;
        assert!(response.is_none());

        let reply = guard.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply["download_url"], "https://x");
    }

    #[tokio::test]
    async fn test_write_deadline_is_reset() {
        let h = harness();

        h.dispatcher.process(r#"{"action":"ping"}"#.to_string()).await;
        assert_eq!(
            h.transport.deadlines_seen.lock().as_slice(),
            [Some(WRITE_TIMEOUT)]
        );
        assert_eq!(h.transport.write_deadline(), None);

        // A failed write resets it too.
        h.transport.fail_writes.store(true, Ordering::SeqCst);
        h.dispatcher.process(r#"{"action":"ping"}"#.to_string()).await;
        assert_eq!(h.transport.deadlines_seen.lock().len(), 2);
        assert_eq!(h.transport.write_deadline(), None);

        // An unrelated write afterwards is not time-boxed.
        h.transport.fail_writes.store(false, Ordering::SeqCst);
        h.slot.send_text("{}".to_string()).await.unwrap();
        assert_eq!(h.transport.deadlines_seen.lock()[2], None);
    }

    #[tokio::test]
    async fn test_response_dropped_without_transport() {
        let h = harness();
        h.slot.take();
        h.dispatcher.process(r#"{"action":"ping"}"#.to_string()).await;
        assert!(h.transport.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_run_answers_frames() {
        let h = harness();
        let (tx, rx) = mpsc::channel(8);
        let run = tokio::spawn(h.dispatcher.clone().run(rx));

        tx.send(r#"{"action":"ping"}"#.to_string()).await.unwrap();
        tx.send(r#"{"action":"file_stat","params":{"path":"/"}}"#.to_string())
            .await
            .unwrap();

        for _ in 0..100 {
            if h.transport.sent.lock().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let sent = h.transport.sent_json();
        assert_eq!(sent.len(), 2);
        assert!(sent.contains(&json!({ "status": "pong" })));

        h.cancel.cancel();
        run.await.unwrap();
    }
}
