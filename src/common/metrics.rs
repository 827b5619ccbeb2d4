//! Cluster coordination metrics
//!
//! Prometheus-compatible counters and a latency histogram for the
//! transfer, write and read paths.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for latency measurements (in milliseconds)
const LATENCY_BUCKETS: [f64; 10] = [1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0];

/// Latency histogram
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    /// Sum in microseconds
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            buckets: (0..=LATENCY_BUCKETS.len())
                .map(|_| AtomicU64::new(0))
                .collect(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        let idx = LATENCY_BUCKETS
            .iter()
            .position(|&boundary| ms <= boundary)
            .unwrap_or(LATENCY_BUCKETS.len());

        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative (upper bound, count) pairs, `+Inf` last
    pub fn cumulative(&self) -> Vec<(f64, u64)> {
        let mut total = 0;
        let mut out = Vec::with_capacity(self.buckets.len());
        for (i, bucket) in self.buckets.iter().enumerate() {
            total += bucket.load(Ordering::Relaxed);
            let bound = LATENCY_BUCKETS.get(i).copied().unwrap_or(f64::INFINITY);
            out.push((bound, total));
        }
        out
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum_ms(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Metrics shared by every component of a node
#[derive(Debug)]
pub struct ClusterMetrics {
    pub topology_commits: Counter,
    pub topology_conflicts: Counter,

    pub transfers_started: Counter,
    pub transfers_completed: Counter,
    pub transfers_failed: Counter,
    pub transfers_aborted: Counter,

    pub writes_weak: Counter,
    pub writes_medium: Counter,
    pub writes_strong: Counter,
    pub write_failures: Counter,
    pub replicas_deactivated: Counter,
    pub write_latency: Histogram,

    pub reads: Counter,
    pub read_quorum_failures: Counter,

    start_time: Instant,
}

impl ClusterMetrics {
    pub fn new() -> Self {
        Self {
            topology_commits: Counter::new(),
            topology_conflicts: Counter::new(),
            transfers_started: Counter::new(),
            transfers_completed: Counter::new(),
            transfers_failed: Counter::new(),
            transfers_aborted: Counter::new(),
            writes_weak: Counter::new(),
            writes_medium: Counter::new(),
            writes_strong: Counter::new(),
            write_failures: Counter::new(),
            replicas_deactivated: Counter::new(),
            write_latency: Histogram::new(),
            reads: Counter::new(),
            read_quorum_failures: Counter::new(),
            start_time: Instant::now(),
        }
    }

    /// Render in Prometheus text exposition format
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let counters: [(&str, &str, &Counter); 13] = [
            ("topology_commits_total", "Committed topology revisions", &self.topology_commits),
            ("topology_conflicts_total", "Rejected stale-revision mutations", &self.topology_conflicts),
            ("transfers_started_total", "Shard transfers started", &self.transfers_started),
            ("transfers_completed_total", "Shard transfers completed", &self.transfers_completed),
            ("transfers_failed_total", "Shard transfers that exhausted retries", &self.transfers_failed),
            ("transfers_aborted_total", "Shard transfers aborted", &self.transfers_aborted),
            ("writes_weak_total", "Weak-ordered writes admitted", &self.writes_weak),
            ("writes_medium_total", "Medium-ordered writes admitted", &self.writes_medium),
            ("writes_strong_total", "Strong-ordered writes admitted", &self.writes_strong),
            ("write_failures_total", "Writes that did not complete", &self.write_failures),
            ("replicas_deactivated_total", "Replicas marked dead after failed updates", &self.replicas_deactivated),
            ("reads_total", "Reads resolved", &self.reads),
            ("read_quorum_failures_total", "Reads failed for lack of replicas", &self.read_quorum_failures),
        ];

        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP minivec_{} {}", name, help);
            let _ = writeln!(out, "# TYPE minivec_{} counter", name);
            let _ = writeln!(out, "minivec_{} {}", name, counter.get());
        }

        out.push_str("# HELP minivec_write_duration_ms Write latency in milliseconds\n");
        out.push_str("# TYPE minivec_write_duration_ms histogram\n");
        for (le, count) in self.write_latency.cumulative() {
            if le.is_infinite() {
                let _ = writeln!(out, "minivec_write_duration_ms_bucket{{le=\"+Inf\"}} {}", count);
            } else {
                let _ = writeln!(out, "minivec_write_duration_ms_bucket{{le=\"{}\"}} {}", le, count);
            }
        }
        let _ = writeln!(out, "minivec_write_duration_ms_sum {}", self.write_latency.sum_ms());
        let _ = writeln!(out, "minivec_write_duration_ms_count {}", self.write_latency.count());

        out.push_str("# HELP minivec_uptime_seconds Node uptime in seconds\n");
        out.push_str("# TYPE minivec_uptime_seconds gauge\n");
        let _ = writeln!(out, "minivec_uptime_seconds {}", self.start_time.elapsed().as_secs());

        out
    }
}

impl Default for ClusterMetrics {
    fn default() -> Self {
        Self::new()
    }
}
