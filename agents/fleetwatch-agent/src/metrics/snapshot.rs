//! Metric snapshots and the significance gate
//!
//! The metrics runner only transmits a snapshot when it differs noticeably
//! from the last one sent, or when the quiet period has passed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

const MIB: u64 = 1024 * 1024;
const KIB: f64 = 1024.0;

/// CPU usage change, in percentage points
pub const CPU_THRESHOLD: f64 = 1.0;
/// Memory used change, in bytes
pub const MEMORY_THRESHOLD: u64 = 10 * MIB;
/// Disk used change, in bytes
pub const DISK_THRESHOLD: u64 = 100 * MIB;
/// Network throughput change per direction, in bytes/s
pub const NETWORK_THRESHOLD: f64 = 5.0 * KIB;
/// 1-minute load average change
pub const LOAD_THRESHOLD: f64 = 0.1;
/// Longest time between two sends
pub const QUIET_PERIOD: Duration = Duration::from_secs(60);

/// Static description of the host, sent once per connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub os: String,
    pub os_version: String,
    pub kernel_version: String,
    pub arch: String,
    pub cpu_model: String,
    pub cpu_cores: usize,
    pub memory_total: u64,
    pub disk_total: u64,
    pub boot_time: u64,
    pub agent_version: String,
}

/// One sample of the host's live metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorData {
    /// Global CPU usage, percent
    pub cpu_usage: f64,
    /// Bytes
    pub memory_used: u64,
    pub memory_total: u64,
    pub disk_used: u64,
    pub disk_total: u64,
    /// Bytes per second
    pub network_in: f64,
    pub network_out: f64,
    pub load_avg_1: f64,
    pub load_avg_5: f64,
    pub load_avg_15: f64,
    pub uptime_secs: u64,
    pub timestamp: DateTime<Utc>,
}

impl MonitorData {
    /// True when any field moved past its threshold relative to `previous`
    pub fn differs_significantly(&self, previous: &MonitorData) -> bool {
        (self.cpu_usage - previous.cpu_usage).abs() > CPU_THRESHOLD
            || self.memory_used.abs_diff(previous.memory_used) > MEMORY_THRESHOLD
            || self.disk_used.abs_diff(previous.disk_used) > DISK_THRESHOLD
            || (self.network_in - previous.network_in).abs() > NETWORK_THRESHOLD
            || (self.network_out - previous.network_out).abs() > NETWORK_THRESHOLD
            || (self.load_avg_1 - previous.load_avg_1).abs() > LOAD_THRESHOLD
    }
}

/// Remembers the last snapshot that went out and decides whether the next
/// one is worth sending.
#[derive(Debug)]
pub struct ReportGate {
    quiet_period: Duration,
    last_sent: Option<(MonitorData, Instant)>,
}

impl ReportGate {
    pub fn new() -> Self {
        Self::with_quiet_period(QUIET_PERIOD)
    }

    pub fn with_quiet_period(quiet_period: Duration) -> Self {
        Self {
            quiet_period,
            last_sent: None,
        }
    }

    pub fn should_send(&self, data: &MonitorData, now: Instant) -> bool {
        match &self.last_sent {
            None => true,
            Some((previous, sent_at)) => {
                now.saturating_duration_since(*sent_at) >= self.quiet_period
                    || data.differs_significantly(previous)
            }
        }
    }

    /// Record a successful send
    pub fn mark_sent(&mut self, data: MonitorData, now: Instant) {
        self.last_sent = Some((data, now));
    }

    /// Forget the last send so the next snapshot goes out unconditionally
    pub fn reset(&mut self) {
        self.last_sent = None;
    }
}

impl Default for ReportGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MonitorData {
        MonitorData {
            cpu_usage: 20.0,
            memory_used: 2_000 * MIB,
            memory_total: 8_000 * MIB,
            disk_used: 50_000 * MIB,
            disk_total: 100_000 * MIB,
            network_in: 10_000.0,
            network_out: 4_000.0,
            load_avg_1: 0.5,
            ..Default::default()
        }
    }

    #[test]
    fn test_small_cpu_change_is_not_significant() {
        let base = sample();
        let next = MonitorData {
            cpu_usage: 20.5,
            ..base.clone()
        };
        assert!(!next.differs_significantly(&base));

        let next = MonitorData {
            cpu_usage: 21.5,
            ..base.clone()
        };
        assert!(next.differs_significantly(&base));
    }

    #[test]
    fn test_each_threshold() {
        let base = sample();
        let cases = [
            (MonitorData { memory_used: base.memory_used + 10 * MIB, ..base.clone() }, false),
            (MonitorData { memory_used: base.memory_used + 11 * MIB, ..base.clone() }, true),
            (MonitorData { disk_used: base.disk_used - 100 * MIB, ..base.clone() }, false),
            (MonitorData { disk_used: base.disk_used - 101 * MIB, ..base.clone() }, true),
            (MonitorData { network_in: base.network_in + 5.0 * KIB, ..base.clone() }, false),
            (MonitorData { network_out: base.network_out + 5.5 * KIB, ..base.clone() }, true),
            (MonitorData { load_avg_1: 0.55, ..base.clone() }, false),
            (MonitorData { load_avg_1: 0.65, ..base.clone() }, true),
            (MonitorData { load_avg_5: 9.0, memory_total: 1, ..base.clone() }, false),
        ];
        for (next, expected) in cases {
            assert_eq!(next.differs_significantly(&base), expected, "{next:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_suppresses_insignificant_changes_within_quiet_period() {
        let mut gate = ReportGate::new();
        let start = Instant::now();
        let base = sample();

        assert!(gate.should_send(&base, start));
        gate.mark_sent(base.clone(), start);

        let tiny = MonitorData {
            cpu_usage: base.cpu_usage + 0.5,
            ..base.clone()
        };
        let later = start + Duration::from_secs(30);
        assert!(!gate.should_send(&tiny, later));

        let big = MonitorData {
            cpu_usage: base.cpu_usage + 1.5,
            ..base.clone()
        };
        assert!(gate.should_send(&big, later));

        // Unchanged data still goes out once the quiet period passes.
        assert!(gate.should_send(&tiny, start + QUIET_PERIOD));

        gate.reset();
        assert!(gate.should_send(&tiny, later));
    }
}
