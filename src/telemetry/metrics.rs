// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Metrics collection for performance monitoring.
//!
//! Provides lightweight metrics collection without external dependencies.
//! Suitable for a single-process control plane where full observability
//! stacks are overkill.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

/// Global metrics instance.
pub static GLOBAL_METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

/// Central metrics collection.
#[derive(Debug)]
pub struct Metrics {
    /// Operation metrics by name (store queries, git calls, commands).
    operations: RwLock<HashMap<String, OperationMetrics>>,

    /// Messages handled since startup.
    messages_handled: AtomicU64,

    /// Assistant invocations since startup.
    assistant_invocations: AtomicU64,

    /// Worktrees created / destroyed since startup.
    worktrees_created: AtomicU64,
    worktrees_destroyed: AtomicU64,

    /// Start time for calculating uptime.
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            operations: RwLock::new(HashMap::new()),
            messages_handled: AtomicU64::new(0),
            assistant_invocations: AtomicU64::new(0),
            worktrees_created: AtomicU64::new(0),
            worktrees_destroyed: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a generic operation.
    pub fn record_operation(&self, name: &str, duration: Duration) {
        let mut ops = self.operations.write().unwrap();
        let metrics = ops
            .entry(name.to_string())
            .or_insert_with(OperationMetrics::new);
        metrics.record(duration);
    }

    /// Record a handled inbound message.
    pub fn record_message(&self) {
        self.messages_handled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an assistant invocation.
    pub fn record_assistant_invocation(&self) {
        self.assistant_invocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a worktree creation.
    pub fn record_worktree_created(&self) {
        self.worktrees_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a worktree destruction.
    pub fn record_worktree_destroyed(&self) {
        self.worktrees_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get metrics for a specific operation.
    pub fn operation_metrics(&self, name: &str) -> Option<OperationMetrics> {
        self.operations.read().unwrap().get(name).cloned()
    }

    /// Counter snapshot: (messages, invocations, created, destroyed).
    pub fn counters(&self) -> (u64, u64, u64, u64) {
        (
            self.messages_handled.load(Ordering::Relaxed),
            self.assistant_invocations.load(Ordering::Relaxed),
            self.worktrees_created.load(Ordering::Relaxed),
            self.worktrees_destroyed.load(Ordering::Relaxed),
        )
    }

    /// Process uptime.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Timing statistics for a named operation.
#[derive(Debug, Clone)]
pub struct OperationMetrics {
    pub count: u64,
    pub total: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl OperationMetrics {
    fn new() -> Self {
        Self {
            count: 0,
            total: Duration::ZERO,
            min: Duration::MAX,
            max: Duration::ZERO,
        }
    }

    fn record(&mut self, duration: Duration) {
        self.count += 1;
        self.total += duration;
        self.min = self.min.min(duration);
        self.max = self.max.max(duration);
    }

    /// Mean duration over all recordings.
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / self.count as u32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_operation() {
        let metrics = Metrics::new();
        metrics.record_operation("store.update_conversation", Duration::from_millis(5));
        metrics.record_operation("store.update_conversation", Duration::from_millis(15));

        let op = metrics
            .operation_metrics("store.update_conversation")
            .unwrap();
        assert_eq!(op.count, 2);
        assert_eq!(op.min, Duration::from_millis(5));
        assert_eq!(op.max, Duration::from_millis(15));
        assert_eq!(op.mean(), Duration::from_millis(10));
    }

    #[test]
    fn test_counters() {
        let metrics = Metrics::new();
        metrics.record_message();
        metrics.record_message();
        metrics.record_assistant_invocation();
        metrics.record_worktree_created();
        metrics.record_worktree_destroyed();

        assert_eq!(metrics.counters(), (2, 1, 1, 1));
    }

    #[test]
    fn test_unknown_operation() {
        let metrics = Metrics::new();
        assert!(metrics.operation_metrics("nope").is_none());
    }
}
