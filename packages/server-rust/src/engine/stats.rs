//! Engine counters.
//!
//! Each counter is kept as an atomic for `Engine::stats()` and mirrored to a
//! `metrics` counter so an installed recorder can export it.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub launched: u64,
    pub targets_created: u64,
    pub retired: u64,
    pub abandoned: u64,
    pub unmatched_drops: u64,
    pub unknown_op_drops: u64,
    pub stale_drops: u64,
    pub refused_drops: u64,
    pub transport_failures: u64,
}

#[derive(Debug, Default)]
pub(crate) struct EngineStats {
    launched: AtomicU64,
    targets_created: AtomicU64,
    retired: AtomicU64,
    abandoned: AtomicU64,
    unmatched_drops: AtomicU64,
    unknown_op_drops: AtomicU64,
    stale_drops: AtomicU64,
    refused_drops: AtomicU64,
    transport_failures: AtomicU64,
}

impl EngineStats {
    pub(crate) fn record_launch(&self, op_name: &'static str) {
        self.launched.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("opflow_ops_launched_total", "op" => op_name).increment(1);
    }

    pub(crate) fn record_target_created(&self, op_name: &'static str) {
        self.targets_created.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("opflow_targets_created_total", "op" => op_name).increment(1);
    }

    pub(crate) fn record_retired(&self, op_name: &'static str) {
        self.retired.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("opflow_ops_retired_total", "op" => op_name).increment(1);
    }

    pub(crate) fn record_abandoned(&self, op_name: &'static str) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("opflow_ops_abandoned_total", "op" => op_name).increment(1);
    }

    pub(crate) fn record_unmatched(&self) {
        self.unmatched_drops.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("opflow_routing_drops_total", "reason" => "unmatched_mailbox")
            .increment(1);
    }

    pub(crate) fn record_unknown_op(&self) {
        self.unknown_op_drops.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("opflow_routing_drops_total", "reason" => "unknown_op").increment(1);
    }

    pub(crate) fn record_stale(&self) {
        self.stale_drops.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("opflow_routing_drops_total", "reason" => "stale").increment(1);
    }

    pub(crate) fn record_refused(&self) {
        self.refused_drops.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("opflow_routing_drops_total", "reason" => "refused").increment(1);
    }

    pub(crate) fn record_transport_failure(&self) {
        self.transport_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("opflow_transport_failures_total").increment(1);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            launched: self.launched.load(Ordering::Relaxed),
            targets_created: self.targets_created.load(Ordering::Relaxed),
            retired: self.retired.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            unmatched_drops: self.unmatched_drops.load(Ordering::Relaxed),
            unknown_op_drops: self.unknown_op_drops.load(Ordering::Relaxed),
            stale_drops: self.stale_drops.load(Ordering::Relaxed),
            refused_drops: self.refused_drops.load(Ordering::Relaxed),
            transport_failures: self.transport_failures.load(Ordering::Relaxed),
        }
    }
}
