//! Purge queue metrics
//!
//! # Prometheus Metrics
//!
//! - `pq_executing_ops` - Purge queue op cost in flight
//! - `pq_executing` - Purge queue items in flight
//! - `pq_executed` - Purge queue items executed
//!
//! The metric names are part of the monitoring contract; dashboards and
//! alerts key on them.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters for the purge queue
#[derive(Debug, Default)]
pub struct PurgeMetrics {
    executing_ops: AtomicU64,
    executing: AtomicU64,
    executed: AtomicU64,
}

impl PurgeMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_executing_ops(&self, ops: u64) {
        self.executing_ops.store(ops, Ordering::Relaxed);
    }

    pub fn set_executing(&self, items: u64) {
        self.executing.store(items, Ordering::Relaxed);
    }

    pub fn inc_executed(&self) {
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn executing_ops(&self) -> u64 {
        self.executing_ops.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn executing(&self) -> u64 {
        self.executing.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    /// Render in Prometheus text exposition format.
    #[must_use]
    pub fn export_prometheus(&self) -> String {
        let mut out = String::with_capacity(512);
        write_metric(
            &mut out,
            "pq_executing_ops",
            "Purge queue op cost in flight",
            "gauge",
            self.executing_ops(),
        );
        write_metric(
            &mut out,
            "pq_executing",
            "Purge queue items in flight",
            "gauge",
            self.executing(),
        );
        write_metric(
            &mut out,
            "pq_executed",
            "Purge queue items executed",
            "counter",
            self.executed(),
        );
        out
    }
}

fn write_metric(out: &mut String, name: &str, help: &str, kind: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
}
