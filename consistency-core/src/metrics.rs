//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the core.
//!
//! # Metrics
//!
//! - `consistency_identifiers_allocated_total{entity_class}` - Identifiers issued
//! - `consistency_reassignments_total` - Suspense entries credited to an account
//! - `consistency_reassign_conflicts_total` - Reassignments lost to a concurrent winner
//! - `consistency_transaction_rollbacks_total` - Transactions discarded by a failing step
//! - `consistency_transaction_duration_seconds` - Histogram of transaction latencies
//! - `consistency_store_retries_total` - Retries after transient store failures

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
///
/// Each collector owns its registry, so several cores can live in one process.
#[derive(Clone)]
pub struct Metrics {
    /// Identifiers issued, by entity class
    pub identifiers_allocated: IntCounterVec,

    /// Successful reassignments
    pub reassignments_total: IntCounter,

    /// Reassignments that found the entry already handled
    pub reassign_conflicts: IntCounter,

    /// Rolled back transactions
    pub transaction_rollbacks: IntCounter,

    /// Transaction duration histogram
    pub transaction_duration: Histogram,

    /// Store retries
    pub store_retries: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let identifiers_allocated = IntCounterVec::new(
            Opts::new(
                "consistency_identifiers_allocated_total",
                "Total number of identifiers issued",
            ),
            &["entity_class"],
        )?;
        registry.register(Box::new(identifiers_allocated.clone()))?;

        let reassignments_total = IntCounter::new(
            "consistency_reassignments_total",
            "Total number of suspense entries reassigned",
        )?;
        registry.register(Box::new(reassignments_total.clone()))?;

        let reassign_conflicts = IntCounter::new(
            "consistency_reassign_conflicts_total",
            "Reassignments that found the entry already assigned",
        )?;
        registry.register(Box::new(reassign_conflicts.clone()))?;

        let transaction_rollbacks = IntCounter::new(
            "consistency_transaction_rollbacks_total",
            "Transactions rolled back by a failing step",
        )?;
        registry.register(Box::new(transaction_rollbacks.clone()))?;

        let transaction_duration = Histogram::with_opts(
            HistogramOpts::new(
                "consistency_transaction_duration_seconds",
                "Histogram of ledger transaction latencies",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 1.0]),
        )?;
        registry.register(Box::new(transaction_duration.clone()))?;

        let store_retries = IntCounter::new(
            "consistency_store_retries_total",
            "Retries after transient store failures",
        )?;
        registry.register(Box::new(store_retries.clone()))?;

        Ok(Self {
            identifiers_allocated,
            reassignments_total,
            reassign_conflicts,
            transaction_rollbacks,
            transaction_duration,
            store_retries,
            registry,
        })
    }

    /// Record an issued identifier
    pub fn record_identifier(&self, entity_class: &str) {
        self.identifiers_allocated
            .with_label_values(&[entity_class])
            .inc();
    }

    /// Record a committed reassignment
    pub fn record_reassignment(&self) {
        self.reassignments_total.inc();
    }

    /// Record a reassignment that lost a race
    pub fn record_reassign_conflict(&self) {
        self.reassign_conflicts.inc();
    }

    /// Record a finished transaction
    pub fn record_transaction(&self, duration_seconds: f64, committed: bool) {
        self.transaction_duration.observe(duration_seconds);
        if !committed {
            self.transaction_rollbacks.inc();
        }
    }

    /// Record a retry
    pub fn record_retry(&self) {
        self.store_retries.inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("reassignments_total", &self.reassignments_total.get())
            .field("transaction_rollbacks", &self.transaction_rollbacks.get())
            .finish_non_exhaustive()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}
