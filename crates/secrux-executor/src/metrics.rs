//! Host metrics for heartbeats.

use std::sync::Mutex;
use std::time::Instant;

use sysinfo::System;

/// Snapshot reported in each heartbeat.
#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub cpu_usage: f64,
    pub memory_usage_mb: u64,
    pub uptime_seconds: i64,
}

/// Host metrics source. Refreshed on every collection.
pub struct HostMetrics {
    system: Mutex<System>,
    started_at: Instant,
}

impl HostMetrics {
    pub fn new() -> Self {
        let mut system = System::new();
        // Prime the CPU sampler; usage is a delta between refreshes.
        system.refresh_cpu_usage();
        Self {
            system: Mutex::new(system),
            started_at: Instant::now(),
        }
    }

    pub fn collect(&self) -> MetricsSnapshot {
        let mut system = self.system.lock().expect("metrics lock poisoned");
        system.refresh_cpu_usage();
        system.refresh_memory();
        MetricsSnapshot {
            cpu_usage: system.global_cpu_usage() as f64,
            memory_usage_mb: system.used_memory() / (1024 * 1024),
            uptime_seconds: self.started_at.elapsed().as_secs() as i64,
        }
    }
}

impl Default for HostMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_is_sane() {
        let metrics = HostMetrics::new();
        let snapshot = metrics.collect();
        assert!(snapshot.cpu_usage >= 0.0);
        assert!(snapshot.uptime_seconds >= 0);
    }
}
