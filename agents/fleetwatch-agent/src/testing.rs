//! In-memory collaborators shared by unit tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::time::Instant;

use crate::connection::client::{Backend, RemoteSettings};
use crate::error::{AgentError, Result};
use crate::metrics::collector::MetricsSource;
use crate::metrics::snapshot::{MonitorData, SystemInfo};

/// How a scripted send should fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    None,
    Connection,
    Other,
}

impl Failure {
    fn check(self) -> Result<()> {
        match self {
            Failure::None => Ok(()),
            Failure::Connection => Err(AgentError::Connection("connection reset".to_string())),
            Failure::Other => Err(AgentError::Command("payload rejected".to_string())),
        }
    }
}

/// Scriptable [`Backend`]
pub struct FakeBackend {
    pub connected: AtomicBool,
    /// Outcomes for upcoming connect calls; `connect_default` applies once empty
    pub connect_script: Mutex<VecDeque<bool>>,
    pub connect_default: AtomicBool,
    pub connect_calls: Mutex<Vec<Instant>>,
    pub register_result: Mutex<Option<(u64, String)>>,
    pub register_calls: AtomicUsize,
    pub closes: AtomicUsize,
    pub heartbeat_failure: Mutex<Failure>,
    pub heartbeat_calls: AtomicUsize,
    pub monitor_failure: Mutex<Failure>,
    pub monitor_sent: Mutex<Vec<MonitorData>>,
    pub system_info_sent: AtomicUsize,
    pub settings: Mutex<RemoteSettings>,
    pub settings_calls: AtomicUsize,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            connected: AtomicBool::new(false),
            connect_script: Mutex::new(VecDeque::new()),
            connect_default: AtomicBool::new(true),
            connect_calls: Mutex::new(Vec::new()),
            register_result: Mutex::new(None),
            register_calls: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            heartbeat_failure: Mutex::new(Failure::None),
            heartbeat_calls: AtomicUsize::new(0),
            monitor_failure: Mutex::new(Failure::None),
            monitor_sent: Mutex::new(Vec::new()),
            system_info_sent: AtomicUsize::new(0),
            settings: Mutex::new(RemoteSettings::default()),
            settings_calls: AtomicUsize::new(0),
        }
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every connect attempt fails
    pub fn unreachable() -> Self {
        let backend = Self::default();
        backend.connect_default.store(false, Ordering::SeqCst);
        backend
    }

    pub fn connect_count(&self) -> usize {
        self.connect_calls.lock().len()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn register_agent(&self, _token: &str) -> Result<(u64, String)> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        self.register_result
            .lock()
            .clone()
            .ok_or_else(|| AgentError::Registration("invalid token".to_string()))
    }

    async fn connect_websocket(&self) -> Result<()> {
        self.connect_calls.lock().push(Instant::now());
        let ok = self
            .connect_script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.connect_default.load(Ordering::SeqCst));
        if ok {
            self.set_connected(true);
            Ok(())
        } else {
            Err(AgentError::Connection("connection refused".to_string()))
        }
    }

    async fn close_websocket(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.set_connected(false);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_heartbeat(&self) -> Result<()> {
        self.heartbeat_calls.fetch_add(1, Ordering::SeqCst);
        let failure = *self.heartbeat_failure.lock();
        failure.check()
    }

    async fn send_monitor_data(&self, data: &MonitorData) -> Result<()> {
        let failure = *self.monitor_failure.lock();
        failure.check()?;
        self.monitor_sent.lock().push(data.clone());
        Ok(())
    }

    async fn send_system_info(&self, _info: &SystemInfo) -> Result<()> {
        self.system_info_sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_settings(&self) -> Result<RemoteSettings> {
        self.settings_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.settings.lock().clone())
    }
}

/// [`MetricsSource`] returning whatever sample the test sets
#[derive(Default)]
pub struct FakeMetrics {
    pub sample: Mutex<MonitorData>,
    pub collections: AtomicUsize,
}

impl FakeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_cpu(&self, cpu_usage: f64) {
        self.sample.lock().cpu_usage = cpu_usage;
    }
}

#[async_trait]
impl MetricsSource for FakeMetrics {
    async fn get_system_info(&self) -> Result<SystemInfo> {
        Ok(SystemInfo {
            hostname: "test-host".to_string(),
            ..Default::default()
        })
    }

    async fn get_monitor_data(&self) -> Result<MonitorData> {
        self.collections.fetch_add(1, Ordering::SeqCst);
        Ok(self.sample.lock().clone())
    }
}
