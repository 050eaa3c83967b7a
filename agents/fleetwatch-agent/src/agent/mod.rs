//! Agent module
//!
//! Connection lifecycle, periodic runners, command dispatch and shutdown.
//! [`Agent`] wires them together around one transport slot, one reconnect
//! channel and one shutdown token.

pub mod dispatcher;
pub mod identity;
pub mod pending;
pub mod reconnect;
pub mod runners;
pub mod shutdown;
pub mod state;
pub mod supervisor;
pub mod upgrade;

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use crate::cli::config::{Config, ConfigStore};
use crate::connection::client::{Backend, BackendClient};
use crate::connection::transport::TransportSlot;
use crate::error::Result;
use crate::handlers::HandlerSet;
use crate::metrics::collector::{MetricsSource, SysinfoCollector};

use dispatcher::CommandDispatcher;
use identity::IdentityHandle;
use pending::PendingRequests;
use reconnect::{reconnect_channel, ReconnectReceiver, ReconnectRequester, RetryPolicy};
use runners::{settings_channel, HeartbeatRunner, MetricsRunner, RuntimeSettings, SettingsRunner};
use shutdown::ShutdownCoordinator;
use state::{ConnectionStateManager, SharedStateManager};
use supervisor::ConnectionSupervisor;
use upgrade::UpgradeHandler;

/// Inbound frames buffered between the transport reader and the dispatcher
const INBOUND_BUFFER: usize = 256;

/// A fully wired agent, ready to be started
pub struct Agent {
    config: Config,
    store: Arc<ConfigStore>,
    identity: IdentityHandle,
    state: SharedStateManager,
    slot: TransportSlot,
    backend: Arc<dyn Backend>,
    metrics: Arc<dyn MetricsSource>,
    handlers: HandlerSet,
    pending: PendingRequests,
    reconnect: ReconnectRequester,
    requests: ReconnectReceiver,
    inbound: mpsc::Receiver<String>,
}

impl Agent {
    /// Build the production agent from the stored configuration
    pub fn new(store: Arc<ConfigStore>) -> Result<Self> {
        let config = store.snapshot();
        let identity = IdentityHandle::new(config.identity());
        let slot = TransportSlot::new();
        let (reconnect, requests) = reconnect_channel();
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_BUFFER);

        let backend = Arc::new(BackendClient::new(
            &config.server_url,
            identity.clone(),
            slot.clone(),
            inbound_tx,
            reconnect.clone(),
        )?);
        let handlers = HandlerSet::from_config(&config.handlers, slot.clone())?;

        Ok(Self {
            config,
            store,
            identity,
            state: Arc::new(ConnectionStateManager::new()),
            slot,
            backend,
            metrics: Arc::new(SysinfoCollector::new()),
            handlers,
            pending: PendingRequests::new(),
            reconnect,
            requests,
            inbound,
        })
    }

    pub fn state(&self) -> SharedStateManager {
        self.state.clone()
    }

    /// Spawn the supervisor, the runners and the dispatcher on the
    /// coordinator's tracker. Returns the backend so the caller can hand it
    /// to [`ShutdownCoordinator::shutdown`].
    pub fn spawn(self, shutdown: &ShutdownCoordinator) -> Result<Arc<dyn Backend>> {
        let cancel = shutdown.token();
        let tracker = shutdown.tracker();

        let local = RuntimeSettings::from_config(&self.config);
        let (settings_tx, settings_rx) = settings_channel(local);

        let supervisor = Arc::new(
            ConnectionSupervisor::new(
                self.backend.clone(),
                self.metrics.clone(),
                self.identity.clone(),
                self.state.clone(),
                self.reconnect.clone(),
                cancel.clone(),
                tracker.clone(),
            )
            .with_store(self.store.clone())
            .with_policy(RetryPolicy::default().with_base_delay(self.config.reconnect_base_delay())),
        );

        let heartbeat = HeartbeatRunner::new(
            self.backend.clone(),
            self.identity.clone(),
            self.reconnect.clone(),
            settings_rx.clone(),
            cancel.clone(),
        );
        let metrics = MetricsRunner::new(
            self.backend.clone(),
            self.metrics.clone(),
            self.identity.clone(),
            self.reconnect.clone(),
            settings_rx,
            cancel.clone(),
        );
        let settings = SettingsRunner::new(
            self.backend.clone(),
            self.identity.clone(),
            local,
            settings_tx,
            cancel.clone(),
            self.config.settings_interval(),
        );

        let upgrade = UpgradeHandler::new(
            self.slot.clone(),
            self.pending.clone(),
            shutdown.restart_handle(),
            std::env::current_exe()?,
        )?;
        let dispatcher = Arc::new(
            CommandDispatcher::new(
                self.slot.clone(),
                self.handlers,
                self.pending,
                tracker,
                cancel,
            )
            .with_upgrade(Arc::new(upgrade)),
        );

        shutdown.spawn(supervisor.run(self.requests));
        shutdown.spawn(heartbeat.run());
        shutdown.spawn(metrics.run());
        shutdown.spawn(settings.run());
        shutdown.spawn(dispatcher.run(self.inbound));

        info!(
            server_url = %self.config.server_url,
            registered = self.identity.is_configured(),
            "Agent started"
        );
        Ok(self.backend)
    }

    /// Run until a termination signal (or a restart request), then shut down
    /// in order
    pub async fn run(self, shutdown: &ShutdownCoordinator) -> Result<()> {
        let backend = self.spawn(shutdown)?;
        shutdown.wait_for_signal().await;
        info!("Shutting down agent");
        shutdown.shutdown(backend.as_ref()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_unregistered_agent_starts_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            server_url: "http://127.0.0.1:9".to_string(),
            ..Config::default()
        };
        let store = Arc::new(ConfigStore::new(dir.path().join("agent.toml"), config));

        let agent = Agent::new(store).unwrap();
        let state = agent.state();
        let shutdown = ShutdownCoordinator::with_grace_period(Duration::from_secs(5));
        let backend = agent.spawn(&shutdown).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!state.is_connected());
        assert!(!backend.is_connected());

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), shutdown.shutdown(backend.as_ref()))
            .await
            .unwrap();
        assert!(shutdown.tracker().is_empty());
    }
}
