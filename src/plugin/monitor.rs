//! Execution metrics: global counters plus a bounded history per plugin.

use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;

use crate::model::config::MonitorConfig;
use crate::model::context::unix_millis;
use crate::model::result::ExecutionResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionRecord {
    pub success: bool,
    pub timed_out: bool,
    pub elapsed_ms: u64,
    pub error: Option<String>,
    pub finished_at: u64,
}

#[derive(Debug, Default)]
struct PluginHistory {
    records: VecDeque<ExecutionRecord>,
    total: u64,
    succeeded: u64,
    failed: u64,
    timeouts: u64,
    slow: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginMetrics {
    pub plugin_id: String,
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub slow: u64,
    /// Computed over the retained history only.
    pub average_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub last_error: Option<String>,
}

impl PluginMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.succeeded as f64 / self.total as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_executions: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub units_spawned: u64,
    pub average_ms: f64,
    pub plugins: Vec<PluginMetrics>,
}

#[derive(Debug)]
pub struct Monitor {
    history: RwLock<HashMap<String, PluginHistory>>,
    capacity: usize,
    slow_threshold_ms: u64,
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timeouts: AtomicU64,
    total_time_ms: AtomicU64,
    units_spawned: AtomicU64,
}

impl Monitor {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            history: RwLock::new(HashMap::new()),
            capacity: config.history_capacity.max(1),
            slow_threshold_ms: config.slow_threshold_ms,
            total: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            total_time_ms: AtomicU64::new(0),
            units_spawned: AtomicU64::new(0),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, PluginHistory>> {
        self.history
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, PluginHistory>> {
        self.history
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn unit_spawned(&self) {
        self.units_spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn units_spawned(&self) -> u64 {
        self.units_spawned.load(Ordering::Relaxed)
    }

    pub fn record(&self, result: &ExecutionResult) {
        let timed_out = result.is_timeout();
        let slow = result.execution_time_ms >= self.slow_threshold_ms;

        self.total.fetch_add(1, Ordering::Relaxed);
        self.total_time_ms
            .fetch_add(result.execution_time_ms, Ordering::Relaxed);
        if result.success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        if timed_out {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        }
        if slow {
            tracing::info!(
                plugin = %result.plugin_id,
                elapsed_ms = result.execution_time_ms,
                threshold_ms = self.slow_threshold_ms,
                "slow plugin execution"
            );
        }

        let mut history = self.write();
        let entry = history.entry(result.plugin_id.clone()).or_default();
        entry.total += 1;
        if result.success {
            entry.succeeded += 1;
        } else {
            entry.failed += 1;
        }
        if timed_out {
            entry.timeouts += 1;
        }
        if slow {
            entry.slow += 1;
        }
        if entry.records.len() == self.capacity {
            entry.records.pop_front();
        }
        entry.records.push_back(ExecutionRecord {
            success: result.success,
            timed_out,
            elapsed_ms: result.execution_time_ms,
            error: result.error_message(),
            finished_at: unix_millis(),
        });
    }

    pub fn history(&self, plugin_id: &str) -> Vec<ExecutionRecord> {
        self.read()
            .get(plugin_id)
            .map(|entry| entry.records.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn plugin_metrics(&self, plugin_id: &str) -> Option<PluginMetrics> {
        self.read()
            .get(plugin_id)
            .map(|entry| summarize(plugin_id, entry))
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let total_time = self.total_time_ms.load(Ordering::Relaxed);
        let mut plugins: Vec<PluginMetrics> = self
            .read()
            .iter()
            .map(|(plugin_id, entry)| summarize(plugin_id, entry))
            .collect();
        plugins.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));

        MetricsSnapshot {
            total_executions: total,
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            units_spawned: self.units_spawned(),
            average_ms: if total == 0 {
                0.0
            } else {
                total_time as f64 / total as f64
            },
            plugins,
        }
    }

    /// Human-readable summary, one line per plugin.
    pub fn status_report(&self) -> String {
        let snapshot = self.snapshot();
        let mut report = format!(
            "executions: {} ok: {} failed: {} timeouts: {} units: {} avg: {:.1}ms\n",
            snapshot.total_executions,
            snapshot.succeeded,
            snapshot.failed,
            snapshot.timeouts,
            snapshot.units_spawned,
            snapshot.average_ms,
        );
        for plugin in &snapshot.plugins {
            let _ = writeln!(
                report,
                "  {}: {} runs, {:.0}% ok, avg {:.1}ms (min {} / max {}), {} slow{}",
                plugin.plugin_id,
                plugin.total,
                plugin.success_rate() * 100.0,
                plugin.average_ms,
                plugin.min_ms,
                plugin.max_ms,
                plugin.slow,
                plugin
                    .last_error
                    .as_ref()
                    .map(|err| format!(", last error: {err}"))
                    .unwrap_or_default(),
            );
        }
        report
    }

    pub fn forget(&self, plugin_id: &str) {
        self.write().remove(plugin_id);
    }

    pub fn clear(&self) {
        self.write().clear();
        for counter in [
            &self.total,
            &self.succeeded,
            &self.failed,
            &self.timeouts,
            &self.total_time_ms,
            &self.units_spawned,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

fn summarize(plugin_id: &str, entry: &PluginHistory) -> PluginMetrics {
    let times = entry.records.iter().map(|record| record.elapsed_ms);
    let count = entry.records.len();
    let sum: u64 = times.clone().sum();
    PluginMetrics {
        plugin_id: plugin_id.to_string(),
        total: entry.total,
        succeeded: entry.succeeded,
        failed: entry.failed,
        timeouts: entry.timeouts,
        slow: entry.slow,
        average_ms: if count == 0 {
            0.0
        } else {
            sum as f64 / count as f64
        },
        min_ms: times.clone().min().unwrap_or(0),
        max_ms: times.max().unwrap_or(0),
        last_error: entry
            .records
            .iter()
            .rev()
            .find_map(|record| record.error.clone()),
    }
}
