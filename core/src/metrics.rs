//! # RillMQ Metrics
//!
//! Lock-free counters updated on the connection and scanner hot paths.
//!
//! Every update is a single relaxed atomic increment; readers take a
//! [`MetricsSnapshot`], which is what gets logged periodically and at
//! shutdown.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use rillmq::metrics::BrokerMetrics;
//!
//! let metrics = BrokerMetrics::new();
//! metrics.record_published(3);
//! metrics.record_delivered();
//! assert_eq!(metrics.snapshot().messages_published, 3);
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Node-wide counters (lock-free)
#[derive(Debug, Default)]
pub struct BrokerMetrics {
    connections_total: AtomicU64,
    active_connections: AtomicU64,
    messages_published: AtomicU64,
    messages_delivered: AtomicU64,
    messages_finished: AtomicU64,
    messages_requeued: AtomicU64,
    messages_timed_out: AtomicU64,
    messages_deferred: AtomicU64,
    protocol_errors: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub active_connections: u64,
    pub messages_published: u64,
    pub messages_delivered: u64,
    pub messages_finished: u64,
    pub messages_requeued: u64,
    pub messages_timed_out: u64,
    pub messages_deferred: u64,
    pub protocol_errors: u64,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Never wrap below zero if a close is recorded twice
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn record_published(&self, count: u64) {
        self.messages_published.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.messages_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_finished(&self) {
        self.messages_finished.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_requeued(&self, count: u64) {
        self.messages_requeued.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_timed_out(&self, count: u64) {
        self.messages_timed_out.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_deferred(&self) {
        self.messages_deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            messages_published: self.messages_published.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            messages_finished: self.messages_finished.load(Ordering::Relaxed),
            messages_requeued: self.messages_requeued.load(Ordering::Relaxed),
            messages_timed_out: self.messages_timed_out.load(Ordering::Relaxed),
            messages_deferred: self.messages_deferred.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
        }
    }

    pub fn report(&self) {
        let s = self.snapshot();
        info!("=== RillMQ Metrics Report ===");
        info!(
            "Connections: active={}, total={}",
            s.active_connections, s.connections_total
        );
        info!(
            "Messages: published={}, delivered={}, finished={}",
            s.messages_published, s.messages_delivered, s.messages_finished
        );
        info!(
            "Redelivery: requeued={}, timed_out={}, deferred={}",
            s.messages_requeued, s.messages_timed_out, s.messages_deferred
        );
        info!("Protocol errors: {}", s.protocol_errors);
    }

    /// Log a report every `period` until `shutdown` fires
    pub async fn reporting_loop(self: Arc<Self>, period: Duration, shutdown: CancellationToken) {
        let mut ticker = interval(period);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.report(),
            }
        }
    }
}
