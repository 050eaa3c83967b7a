//! Periodic Task Runners
//!
//! Heartbeat, metrics and settings loops. Each one waits on its own ticker,
//! the shared settings watch and the shutdown token, so none of them can hold
//! up shutdown. Failures never stop a runner; connectivity problems are
//! handed to the supervisor as reconnect requests.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::identity::IdentityHandle;
use crate::agent::reconnect::ReconnectRequester;
use crate::cli::config::{Config, MetricsConfig};
use crate::connection::client::{Backend, RemoteSettings};
use crate::metrics::collector::MetricsSource;
use crate::metrics::snapshot::{MonitorData, ReportGate};

/// Consecutive heartbeat failures that count as a lost connection
pub const HEARTBEAT_FAILURE_THRESHOLD: u32 = 3;

/// Intervals and toggles the runners currently work with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub heartbeat_interval: Duration,
    pub metrics_interval: Duration,
    pub metrics: MetricsConfig,
}

impl RuntimeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            metrics_interval: config.metrics_interval(),
            metrics: config.metrics,
        }
    }

    /// Overlay backend settings; absent or zero values keep the local ones
    pub fn merged(&self, remote: &RemoteSettings) -> Self {
        let secs = |value: Option<u64>, fallback: Duration| {
            value
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(fallback)
        };
        Self {
            heartbeat_interval: secs(remote.heartbeat_interval_secs, self.heartbeat_interval),
            metrics_interval: secs(remote.metrics_interval_secs, self.metrics_interval),
            metrics: remote.metrics.unwrap_or(self.metrics),
        }
    }
}

/// Channel carrying [`RuntimeSettings`]; a change is the "interval changed"
/// signal
pub fn settings_channel(
    initial: RuntimeSettings,
) -> (watch::Sender<RuntimeSettings>, watch::Receiver<RuntimeSettings>) {
    watch::channel(initial)
}

/// Ticker whose first tick is one full period away
fn delayed_ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Consecutive heartbeat failure counter
#[derive(Debug, Clone)]
pub struct HeartbeatFailures {
    count: u32,
    threshold: u32,
}

impl HeartbeatFailures {
    pub fn new(threshold: u32) -> Self {
        Self { count: 0, threshold }
    }

    /// Count a failure. Returns true, and starts over, when the threshold is
    /// reached.
    pub fn record_failure(&mut self) -> bool {
        self.count += 1;
        if self.count >= self.threshold {
            self.count = 0;
            return true;
        }
        false
    }

    pub fn record_success(&mut self) {
        self.count = 0;
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

pub struct HeartbeatRunner {
    backend: Arc<dyn Backend>,
    identity: IdentityHandle,
    reconnect: ReconnectRequester,
    settings: watch::Receiver<RuntimeSettings>,
    cancel: CancellationToken,
    failures: HeartbeatFailures,
}

impl HeartbeatRunner {
    pub fn new(
        backend: Arc<dyn Backend>,
        identity: IdentityHandle,
        reconnect: ReconnectRequester,
        settings: watch::Receiver<RuntimeSettings>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            backend,
            identity,
            reconnect,
            settings,
            cancel,
            failures: HeartbeatFailures::new(HEARTBEAT_FAILURE_THRESHOLD),
        }
    }

    async fn tick(&mut self) {
        if !self.identity.is_configured() {
            debug!("Skipping heartbeat, agent not registered");
            return;
        }

        let result = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = self.backend.send_heartbeat() => result,
        };

        match result {
            Ok(()) => self.failures.record_success(),
            Err(e) => {
                warn!(error = %e, failures = self.failures.count() + 1, "Heartbeat failed");
                if self.failures.record_failure() {
                    self.reconnect.request("repeated heartbeat failures");
                }
            }
        }
    }

    pub async fn run(mut self) {
        let mut period = self.settings.borrow_and_update().heartbeat_interval;
        let mut ticker = delayed_ticker(period);
        let mut settings_open = true;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
                changed = self.settings.changed(), if settings_open => {
                    if changed.is_err() {
                        settings_open = false;
                        continue;
                    }
                    let next = self.settings.borrow_and_update().heartbeat_interval;
                    if next != period {
                        info!(interval = ?next, "Heartbeat interval changed");
                        period = next;
                        ticker = delayed_ticker(period);
                    }
                }
            }
        }
        debug!("Heartbeat runner stopped");
    }
}

pub struct MetricsRunner {
    backend: Arc<dyn Backend>,
    metrics: Arc<dyn MetricsSource>,
    identity: IdentityHandle,
    reconnect: ReconnectRequester,
    settings: watch::Receiver<RuntimeSettings>,
    cancel: CancellationToken,
    gate: ReportGate,
}

impl MetricsRunner {
    pub fn new(
        backend: Arc<dyn Backend>,
        metrics: Arc<dyn MetricsSource>,
        identity: IdentityHandle,
        reconnect: ReconnectRequester,
        settings: watch::Receiver<RuntimeSettings>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            backend,
            metrics,
            identity,
            reconnect,
            settings,
            cancel,
            gate: ReportGate::new(),
        }
    }

    async fn tick(&mut self) {
        let toggles = self.settings.borrow().metrics;
        if !toggles.any_enabled() || !self.identity.is_configured() {
            return;
        }

        let collected = tokio::select! {
            _ = self.cancel.cancelled() => return,
            collected = self.metrics.get_monitor_data() => collected,
        };
        let data = match collected {
            Ok(data) => mask_disabled(data, toggles),
            Err(e) => {
                warn!(error = %e, "Failed to collect monitor data");
                return;
            }
        };

        let now = Instant::now();
        if !self.gate.should_send(&data, now) {
            debug!("Metrics unchanged, skipping send");
            return;
        }

        let sent = tokio::select! {
            _ = self.cancel.cancelled() => return,
            sent = self.backend.send_monitor_data(&data) => sent,
        };
        match sent {
            Ok(()) => self.gate.mark_sent(data, now),
            Err(e) if self.backend.is_connection_error(&e) => {
                warn!(error = %e, "Metrics send failed, connection lost");
                self.reconnect.request("metrics send failed");
            }
            Err(e) => warn!(error = %e, "Metrics send failed"),
        }
    }

    pub async fn run(mut self) {
        let mut period = self.settings.borrow_and_update().metrics_interval;
        let mut ticker = delayed_ticker(period);
        let mut settings_open = true;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
                changed = self.settings.changed(), if settings_open => {
                    if changed.is_err() {
                        settings_open = false;
                        continue;
                    }
                    period = self.settings.borrow_and_update().metrics_interval;
                    info!(interval = ?period, "Metrics settings changed, collecting now");
                    ticker = delayed_ticker(period);
                    self.gate.reset();
                    self.tick().await;
                }
            }
        }
        debug!("Metrics runner stopped");
    }
}

/// Zero the categories that are switched off
fn mask_disabled(mut data: MonitorData, toggles: MetricsConfig) -> MonitorData {
    if !toggles.cpu {
        data.cpu_usage = 0.0;
    }
    if !toggles.memory {
        data.memory_used = 0;
        data.memory_total = 0;
    }
    if !toggles.disk {
        data.disk_used = 0;
        data.disk_total = 0;
    }
    if !toggles.network {
        data.network_in = 0.0;
        data.network_out = 0.0;
    }
    if !toggles.load {
        data.load_avg_1 = 0.0;
        data.load_avg_5 = 0.0;
        data.load_avg_15 = 0.0;
    }
    data
}

pub struct SettingsRunner {
    backend: Arc<dyn Backend>,
    identity: IdentityHandle,
    local: RuntimeSettings,
    publisher: watch::Sender<RuntimeSettings>,
    cancel: CancellationToken,
    period: Duration,
}

impl SettingsRunner {
    pub fn new(
        backend: Arc<dyn Backend>,
        identity: IdentityHandle,
        local: RuntimeSettings,
        publisher: watch::Sender<RuntimeSettings>,
        cancel: CancellationToken,
        period: Duration,
    ) -> Self {
        Self {
            backend,
            identity,
            local,
            publisher,
            cancel,
            period,
        }
    }

    /// Fetch once. Returns true when the published settings changed.
    async fn refresh(&self) -> bool {
        if !self.identity.is_configured() {
            return false;
        }

        let fetched = tokio::select! {
            _ = self.cancel.cancelled() => return false,
            fetched = self.backend.fetch_settings() => fetched,
        };
        let remote = match fetched {
            Ok(remote) => remote,
            Err(e) => {
                warn!(error = %e, "Failed to fetch settings");
                return false;
            }
        };

        let next = self.local.merged(&remote);
        let changed = self.publisher.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            info!(
                heartbeat = ?next.heartbeat_interval,
                metrics = ?next.metrics_interval,
                "Settings updated from backend"
            );
        }
        changed
    }

    pub async fn run(self) {
        // First tick fires immediately.
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.refresh().await;
                }
            }
        }
        debug!("Settings runner stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::identity::AgentIdentity;
    use crate::agent::reconnect::{reconnect_channel, ReconnectReceiver};
    use crate::testing::{FakeBackend, FakeMetrics, Failure};
    use std::sync::atomic::Ordering;
    use tokio::time::sleep;

    fn identity() -> IdentityHandle {
        IdentityHandle::new(AgentIdentity {
            server_id: 1,
            secret_key: "s".to_string(),
            registration_token: None,
        })
    }

    fn settings() -> RuntimeSettings {
        RuntimeSettings::from_config(&Config::default())
    }

    struct MetricsHarness {
        runner: MetricsRunner,
        backend: Arc<FakeBackend>,
        metrics: Arc<FakeMetrics>,
        receiver: ReconnectReceiver,
    }

    fn metrics_harness() -> MetricsHarness {
        let backend = Arc::new(FakeBackend::new());
        let metrics = Arc::new(FakeMetrics::new());
        let (requester, receiver) = reconnect_channel();
        let (_tx, rx) = settings_channel(settings());
        let runner = MetricsRunner::new(
            backend.clone(),
            metrics.clone(),
            identity(),
            requester,
            rx,
            CancellationToken::new(),
        );
        MetricsHarness {
            runner,
            backend,
            metrics,
            receiver,
        }
    }

    #[test]
    fn test_failure_counter() {
        let mut failures = HeartbeatFailures::new(3);
        assert!(!failures.record_failure());
        assert!(!failures.record_failure());
        failures.record_success();
        assert_eq!(failures.count(), 0);

        assert!(!failures.record_failure());
        assert!(!failures.record_failure());
        assert!(failures.record_failure());
        assert_eq!(failures.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_heartbeat_failures_raise_one_request() {
        let backend = Arc::new(FakeBackend::new());
        *backend.heartbeat_failure.lock() = Failure::Connection;
        let (requester, mut receiver) = reconnect_channel();
        let (_tx, rx) = settings_channel(settings());
        let cancel = CancellationToken::new();

        let runner = HeartbeatRunner::new(backend.clone(), identity(), requester, rx, cancel.clone());
        let task = tokio::spawn(runner.run());

        // Ticks at 30s and 60s: below the threshold.
        sleep(Duration::from_secs(65)).await;
        assert_eq!(backend.heartbeat_calls.load(Ordering::SeqCst), 2);
        assert!(!receiver.try_recv());

        sleep(Duration::from_secs(30)).await;
        assert_eq!(backend.heartbeat_calls.load(Ordering::SeqCst), 3);
        assert!(receiver.try_recv());
        assert!(!receiver.try_recv());

        // Counter started over: two more failures are not enough.
        sleep(Duration::from_secs(60)).await;
        assert_eq!(backend.heartbeat_calls.load(Ordering::SeqCst), 5);
        assert!(!receiver.try_recv());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_skipped_when_unregistered() {
        let backend = Arc::new(FakeBackend::new());
        let (requester, _receiver) = reconnect_channel();
        let (_tx, rx) = settings_channel(settings());
        let cancel = CancellationToken::new();

        let runner = HeartbeatRunner::new(
            backend.clone(),
            IdentityHandle::default(),
            requester,
            rx,
            cancel.clone(),
        );
        let task = tokio::spawn(runner.run());
        sleep(Duration::from_secs(100)).await;
        assert_eq!(backend.heartbeat_calls.load(Ordering::SeqCst), 0);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_follows_interval_change() {
        let backend = Arc::new(FakeBackend::new());
        let (requester, _receiver) = reconnect_channel();
        let (tx, rx) = settings_channel(settings());
        let cancel = CancellationToken::new();

        let runner = HeartbeatRunner::new(backend.clone(), identity(), requester, rx, cancel.clone());
        let task = tokio::spawn(runner.run());

        sleep(Duration::from_secs(1)).await;
        tx.send_modify(|s| s.heartbeat_interval = Duration::from_secs(5));
        sleep(Duration::from_secs(12)).await;
        assert_eq!(backend.heartbeat_calls.load(Ordering::SeqCst), 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_metrics_connection_error_requests_reconnect() {
        let mut h = metrics_harness();
        *h.backend.monitor_failure.lock() = Failure::Connection;
        h.runner.tick().await;
        assert!(h.receiver.try_recv());
    }

    #[tokio::test]
    async fn test_metrics_other_error_only_logs() {
        let mut h = metrics_harness();
        *h.backend.monitor_failure.lock() = Failure::Other;
        h.runner.tick().await;
        assert!(!h.receiver.try_recv());
        assert_eq!(h.metrics.collections.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_sent_only_when_significant() {
        let mut h = metrics_harness();

        h.metrics.set_cpu(10.0);
        h.runner.tick().await;
        assert_eq!(h.backend.monitor_sent.lock().len(), 1);

        sleep(Duration::from_secs(30)).await;
        h.metrics.set_cpu(10.5);
        h.runner.tick().await;
        assert_eq!(h.backend.monitor_sent.lock().len(), 1);

        sleep(Duration::from_secs(10)).await;
        h.metrics.set_cpu(11.5);
        h.runner.tick().await;
        assert_eq!(h.backend.monitor_sent.lock().len(), 2);

        // Nothing changes, but the quiet period forces a send.
        sleep(Duration::from_secs(60)).await;
        h.runner.tick().await;
        assert_eq!(h.backend.monitor_sent.lock().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_settings_change_collects_immediately() {
        let backend = Arc::new(FakeBackend::new());
        let metrics = Arc::new(FakeMetrics::new());
        let (requester, _receiver) = reconnect_channel();
        let (tx, rx) = settings_channel(settings());
        let cancel = CancellationToken::new();

        let runner = MetricsRunner::new(
            backend.clone(),
            metrics.clone(),
            identity(),
            requester,
            rx,
            cancel.clone(),
        );
        let task = tokio::spawn(runner.run());

        sleep(Duration::from_secs(1)).await;
        assert_eq!(metrics.collections.load(Ordering::SeqCst), 0);

        tx.send_modify(|s| s.metrics_interval = Duration::from_secs(5));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(metrics.collections.load(Ordering::SeqCst), 1);
        assert_eq!(backend.monitor_sent.lock().len(), 1);

        sleep(Duration::from_secs(5)).await;
        assert_eq!(metrics.collections.load(Ordering::SeqCst), 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_metrics_are_not_collected() {
        let mut h = metrics_harness();
        let (_tx, rx) = settings_channel(RuntimeSettings {
            metrics: MetricsConfig {
                cpu: false,
                memory: false,
                disk: false,
                network: false,
                load: false,
            },
            ..settings()
        });
        h.runner.settings = rx;
        h.runner.tick().await;
        assert_eq!(h.metrics.collections.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_mask_disabled() {
        let data = MonitorData {
            cpu_usage: 50.0,
            memory_used: 10,
            network_in: 3.0,
            ..Default::default()
        };
        let masked = mask_disabled(
            data,
            MetricsConfig {
                cpu: false,
                network: false,
                ..MetricsConfig::default()
            },
        );
        assert_eq!(masked.cpu_usage, 0.0);
        assert_eq!(masked.network_in, 0.0);
        assert_eq!(masked.memory_used, 10);
    }

    #[tokio::test]
    async fn test_settings_published_only_on_change() {
        let backend = Arc::new(FakeBackend::new());
        let (tx, mut rx) = settings_channel(settings());
        let runner = SettingsRunner::new(
            backend.clone(),
            identity(),
            settings(),
            tx,
            CancellationToken::new(),
            Duration::from_secs(60),
        );

        // Backend has nothing to override.
        assert!(!runner.refresh().await);
        assert!(!rx.has_changed().unwrap());

        backend.settings.lock().heartbeat_interval_secs = Some(10);
        assert!(runner.refresh().await);
        assert!(rx.has_changed().unwrap());
        assert_eq!(
            rx.borrow_and_update().heartbeat_interval,
            Duration::from_secs(10)
        );

        assert!(!runner.refresh().await);
        assert!(!rx.has_changed().unwrap());
        assert_eq!(backend.settings_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settings_fetched_at_startup_then_every_period() {
        let backend = Arc::new(FakeBackend::new());
        let (tx, _rx) = settings_channel(settings());
        let cancel = CancellationToken::new();
        let runner = SettingsRunner::new(
            backend.clone(),
            identity(),
            settings(),
            tx,
            cancel.clone(),
            Duration::from_secs(60),
        );
        let task = tokio::spawn(runner.run());

        sleep(Duration::from_millis(10)).await;
        assert_eq!(backend.settings_calls.load(Ordering::SeqCst), 1);
        sleep(Duration::from_secs(60)).await;
        assert_eq!(backend.settings_calls.load(Ordering::SeqCst), 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[test]
    fn test_merge_keeps_local_values() {
        let local = settings();
        let merged = local.merged(&RemoteSettings {
            heartbeat_interval_secs: Some(0),
            metrics_interval_secs: Some(15),
            metrics: None,
        });
        assert_eq!(merged.heartbeat_interval, local.heartbeat_interval);
        assert_eq!(merged.metrics_interval, Duration::from_secs(15));
        assert_eq!(merged.metrics, local.metrics);
    }
}
