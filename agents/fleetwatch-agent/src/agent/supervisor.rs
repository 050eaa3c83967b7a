//! Connection Supervisor
//!
//! The only component that opens or replaces the transport and the only
//! writer of [`ConnectionState`]. Everything else reports trouble through a
//! [`ReconnectRequester`] and the supervisor decides what to do about it.
//!
//! Reconnects use two tiers: a bounded exponential backoff episode, then a
//! single cooldown timer that starts a fresh episode. The second tier never
//! gives up until shutdown.

use parking_lot::Mutex as SyncMutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::agent::identity::IdentityHandle;
use crate::agent::reconnect::{ReconnectReceiver, ReconnectRequester, RetryPolicy};
use crate::agent::state::{LivenessTracker, SharedStateManager};
use crate::cli::config::ConfigStore;
use crate::connection::client::Backend;
use crate::metrics::collector::MetricsSource;

/// Poll interval of the liveness check
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// How a reconnect episode ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodeOutcome {
    Connected,
    /// Retries ran out; a cooldown retry has been scheduled
    Exhausted,
    /// Shutdown fired mid-episode
    Cancelled,
}

pub struct ConnectionSupervisor {
    backend: Arc<dyn Backend>,
    metrics: Arc<dyn MetricsSource>,
    identity: IdentityHandle,
    store: Option<Arc<ConfigStore>>,
    state: SharedStateManager,
    policy: RetryPolicy,
    reconnect: ReconnectRequester,
    cancel: CancellationToken,
    tracker: TaskTracker,
    liveness: SyncMutex<LivenessTracker>,
    monitor_interval: Duration,
}

impl ConnectionSupervisor {
    pub fn new(
        backend: Arc<dyn Backend>,
        metrics: Arc<dyn MetricsSource>,
        identity: IdentityHandle,
        state: SharedStateManager,
        reconnect: ReconnectRequester,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            backend,
            metrics,
            identity,
            store: None,
            state,
            policy: RetryPolicy::default(),
            reconnect,
            cancel,
            tracker,
            liveness: SyncMutex::new(LivenessTracker::new(false)),
            monitor_interval: MONITOR_INTERVAL,
        }
    }

    /// Persist registered identities through `store`
    pub fn with_store(mut self, store: Arc<ConfigStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_monitor_interval(mut self, monitor_interval: Duration) -> Self {
        self.monitor_interval = monitor_interval;
        self
    }

    /// True when the agent has either an identity or a token to get one
    fn can_connect(&self) -> bool {
        let identity = self.identity.get();
        identity.is_configured() || identity.registration_token.is_some()
    }

    /// Register if needed, then open the transport. Never fails loudly:
    /// every problem is logged and reported as `false`.
    pub async fn try_connect(&self) -> bool {
        let identity = self.identity.get();

        if !identity.is_configured() {
            let Some(token) = identity.registration_token else {
                warn!("Agent is not registered and has no registration token");
                self.state.set_disconnected(Some("unregistered".to_string()));
                return false;
            };

            info!("Registering agent with backend");
            match self.backend.register_agent(&token).await {
                Ok((server_id, secret_key)) => {
                    let registered = self.identity.set_registered(server_id, secret_key);
                    if let Some(store) = &self.store {
                        if let Err(e) = store.save_identity(&registered) {
                            // The identity still works for this process.
                            error!(error = %e, "Failed to persist agent identity");
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Agent registration failed");
                    self.state.set_disconnected(Some(format!("registration failed: {}", e)));
                    return false;
                }
            }
        }

        self.state.set_connecting();
        match self.backend.connect_websocket().await {
            Ok(()) => {
                self.liveness.lock().observe(true);
                self.state.set_connected();
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to connect to backend");
                self.liveness.lock().observe(false);
                self.state.set_disconnected(Some(e.to_string()));
                false
            }
        }
    }

    /// One liveness poll. Returns the new liveness on an edge, `None` when
    /// nothing changed. A falling edge raises a reconnect request.
    pub fn check_liveness(&self) -> Option<bool> {
        let alive = self.backend.is_connected();
        let edge = self.liveness.lock().observe(alive);

        match edge {
            Some(false) => {
                warn!("Liveness check lost the connection");
                self.state.set_disconnected(Some("liveness check failed".to_string()));
                self.reconnect.request("liveness check failed");
            }
            Some(true) => {
                info!("Liveness check sees the connection again");
                self.state.set_connected();
            }
            None => {}
        }
        edge
    }

    /// Act on a reconnect request already taken off the channel.
    ///
    /// Returns `None` when nothing needed doing.
    pub async fn handle_reconnect_request(&self) -> Option<EpisodeOutcome> {
        if self.state.is_connected() && self.backend.is_connected() {
            info!("Reconnect requested while connected, ignoring");
            return None;
        }
        if !self.can_connect() {
            debug!("Reconnect requested while unregistered, ignoring");
            return None;
        }

        self.state.set_disconnected(Some("reconnecting".to_string()));
        Some(self.run_episode().await)
    }

    /// Bounded exponential backoff; schedules the cooldown retry on
    /// exhaustion.
    pub async fn run_episode(&self) -> EpisodeOutcome {
        let mut retry = self.policy.start();

        while retry.attempt < self.policy.max_retries {
            let delay = self.policy.delay_for(retry.attempt);
            info!(
                attempt = retry.attempt + 1,
                max_retries = self.policy.max_retries,
                delay = ?delay,
                "Waiting before reconnect attempt"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Reconnect aborted by shutdown");
                    return EpisodeOutcome::Cancelled;
                }
                _ = sleep(delay) => {}
            }

            retry.attempt += 1;
            if self.try_connect().await {
                info!(attempts = retry.attempt, "Reconnected to backend");
                retry.reset();
                self.spawn_telemetry_resend(true);
                return EpisodeOutcome::Connected;
            }
            warn!(attempt = retry.attempt, "Reconnect attempt failed");
        }

        retry.reset();
        warn!(
            max_retries = self.policy.max_retries,
            cooldown = ?self.policy.cooldown,
            "Reconnect attempts exhausted, retrying after cooldown"
        );
        self.schedule_cooldown();
        EpisodeOutcome::Exhausted
    }

    fn schedule_cooldown(&self) {
        let cancel = self.cancel.clone();
        let reconnect = self.reconnect.clone();
        let cooldown = self.policy.cooldown;

        self.tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = sleep(cooldown) => {
                    reconnect.request("reconnect cooldown elapsed");
                }
            }
        });
    }

    /// Send the host description (and a fresh sample) without holding up the
    /// caller
    fn spawn_telemetry_resend(&self, include_monitor_data: bool) {
        let backend = self.backend.clone();
        let metrics = self.metrics.clone();
        let cancel = self.cancel.clone();

        self.tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = resend_telemetry(backend, metrics, include_monitor_data) => {}
            }
        });
    }

    pub async fn close(&self) {
        self.backend.close_websocket().await;
    }

    /// Supervisor main loop: initial connect, then reconnect requests and
    /// liveness polls until shutdown.
    pub async fn run(self: Arc<Self>, mut requests: ReconnectReceiver) {
        if self.try_connect().await {
            self.spawn_telemetry_resend(false);
        } else if self.can_connect() {
            self.reconnect.request("initial connect failed");
        }

        let mut monitor = interval(self.monitor_interval);
        monitor.set_missed_tick_behavior(MissedTickBehavior::Delay);
        monitor.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Supervisor stopping");
                    break;
                }
                request = requests.recv() => {
                    if request.is_none() {
                        break;
                    }
                    if let Some(outcome) = self.handle_reconnect_request().await {
                        debug!(?outcome, "Reconnect episode finished");
                    }
                }
                _ = monitor.tick() => {
                    self.check_liveness();
                }
            }
        }

        self.close().await;
    }
}

async fn resend_telemetry(
    backend: Arc<dyn Backend>,
    metrics: Arc<dyn MetricsSource>,
    include_monitor_data: bool,
) {
    match metrics.get_system_info().await {
        Ok(info) => {
            if let Err(e) = backend.send_system_info(&info).await {
                warn!(error = %e, "Failed to send system info");
            }
        }
        Err(e) => warn!(error = %e, "Failed to collect system info"),
    }

    if !include_monitor_data {
        return;
    }
    match metrics.get_monitor_data().await {
        Ok(data) => {
            if let Err(e) = backend.send_monitor_data(&data).await {
                warn!(error = %e, "Failed to send monitor data");
            }
        }
        Err(e) => warn!(error = %e, "Failed to collect monitor data"),
    }
}
