//! Host metrics collection
//!
//! [`MetricsSource`] is the seam the agent uses for telemetry;
//! [`SysinfoCollector`] is the production implementation.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use sysinfo::{Disks, Networks, System};

use crate::error::{AgentError, Result};
use crate::metrics::snapshot::{MonitorData, SystemInfo};

/// Source of host telemetry
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// One-shot host description, sent on every (re)connect
    async fn get_system_info(&self) -> Result<SystemInfo>;

    /// Fresh sample, called on every metrics tick
    async fn get_monitor_data(&self) -> Result<MonitorData>;
}

struct CollectorState {
    system: System,
    disks: Disks,
    networks: Networks,
    last_network_refresh: Instant,
}

/// Metrics source backed by the `sysinfo` crate.
///
/// Keeps its `System` between calls: CPU usage and network throughput are
/// both deltas against the previous refresh.
#[derive(Clone)]
pub struct SysinfoCollector {
    state: Arc<Mutex<CollectorState>>,
}

impl SysinfoCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();

        Self {
            state: Arc::new(Mutex::new(CollectorState {
                system,
                disks: Disks::new_with_refreshed_list(),
                networks: Networks::new_with_refreshed_list(),
                last_network_refresh: Instant::now(),
            })),
        }
    }

    fn collect_system_info(state: &mut CollectorState) -> SystemInfo {
        state.system.refresh_cpu();
        state.system.refresh_memory();
        state.disks.refresh_list();

        let cpus = state.system.cpus();
        SystemInfo {
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            os: System::name().unwrap_or_default(),
            os_version: System::os_version().unwrap_or_default(),
            kernel_version: System::kernel_version().unwrap_or_default(),
            arch: std::env::consts::ARCH.to_string(),
            cpu_model: cpus.first().map(|c| c.brand().to_string()).unwrap_or_default(),
            cpu_cores: cpus.len(),
            memory_total: state.system.total_memory(),
            disk_total: state.disks.list().iter().map(|d| d.total_space()).sum(),
            boot_time: System::boot_time(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    fn collect_monitor_data(state: &mut CollectorState) -> MonitorData {
        state.system.refresh_cpu();
        state.system.refresh_memory();
        state.disks.refresh();
        state.networks.refresh();

        let elapsed = state.last_network_refresh.elapsed().as_secs_f64().max(1e-3);
        state.last_network_refresh = Instant::now();

        let (received, transmitted) = state
            .networks
            .iter()
            .fold((0u64, 0u64), |(rx, tx), (_, data)| {
                (rx + data.received(), tx + data.transmitted())
            });

        let (disk_total, disk_free) = state
            .disks
            .list()
            .iter()
            .fold((0u64, 0u64), |(total, free), d| {
                (total + d.total_space(), free + d.available_space())
            });

        let load = System::load_average();

        MonitorData {
            cpu_usage: f64::from(state.system.global_cpu_info().cpu_usage()),
            memory_used: state.system.used_memory(),
            memory_total: state.system.total_memory(),
            disk_used: disk_total.saturating_sub(disk_free),
            disk_total,
            network_in: received as f64 / elapsed,
            network_out: transmitted as f64 / elapsed,
            load_avg_1: load.one,
            load_avg_5: load.five,
            load_avg_15: load.fifteen,
            uptime_secs: System::uptime(),
            timestamp: Utc::now(),
        }
    }
}

impl Default for SysinfoCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricsSource for SysinfoCollector {
    async fn get_system_info(&self) -> Result<SystemInfo> {
        let state = self.state.clone();
        tokio::task::spawn_blocking(move || Self::collect_system_info(&mut state.lock()))
            .await
            .map_err(|e| AgentError::Command(format!("system info collection panicked: {}", e)))
    }

    async fn get_monitor_data(&self) -> Result<MonitorData> {
        let state = self.state.clone();
        tokio::task::spawn_blocking(move || Self::collect_monitor_data(&mut state.lock()))
            .await
            .map_err(|e| AgentError::Command(format!("metrics collection panicked: {}", e)))
    }
}
