use fnv::FnvHashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

/// Monotonic counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// In-process engine counters, shared by every task of an [`Engine`](crate::engine::Engine).
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub payloads_received: Counter,
    pub keep_alives: Counter,
    pub trades_accepted: Counter,
    pub trades_rejected: Counter,
    pub duplicates: Counter,
    pub late_trades: Counter,
    pub invariant_resets: Counter,
    pub connect_attempts: Counter,
    pub disconnects: Counter,
    pub stale_timeouts: Counter,
    pub circuit_opens: Counter,
    pub notifications_sent: Counter,
    pub notifications_dropped: Counter,
    pub instruments_evicted: Counter,
    rejects_by_reason: Mutex<FnvHashMap<&'static str, u64>>,
}

impl EngineMetrics {
    /// Count a rejected payload or trade under its reason code.
    pub fn record_reject(&self, code: &'static str) {
        self.trades_rejected.inc();
        *self.rejects_by_reason.lock().entry(code).or_default() += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            payloads_received: self.payloads_received.get(),
            keep_alives: self.keep_alives.get(),
            trades_accepted: self.trades_accepted.get(),
            trades_rejected: self.trades_rejected.get(),
            duplicates: self.duplicates.get(),
            late_trades: self.late_trades.get(),
            invariant_resets: self.invariant_resets.get(),
            connect_attempts: self.connect_attempts.get(),
            disconnects: self.disconnects.get(),
            stale_timeouts: self.stale_timeouts.get(),
            circuit_opens: self.circuit_opens.get(),
            notifications_sent: self.notifications_sent.get(),
            notifications_dropped: self.notifications_dropped.get(),
            instruments_evicted: self.instruments_evicted.get(),
            rejects_by_reason: self
                .rejects_by_reason
                .lock()
                .iter()
                .map(|(code, count)| (code.to_string(), *count))
                .collect(),
        }
    }
}

/// Point in time copy of [`EngineMetrics`].
#[derive(Clone, PartialEq, Eq, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub payloads_received: u64,
    pub keep_alives: u64,
    pub trades_accepted: u64,
    pub trades_rejected: u64,
    pub duplicates: u64,
    pub late_trades: u64,
    pub invariant_resets: u64,
    pub connect_attempts: u64,
    pub disconnects: u64,
    pub stale_timeouts: u64,
    pub circuit_opens: u64,
    pub notifications_sent: u64,
    pub notifications_dropped: u64,
    pub instruments_evicted: u64,
    pub rejects_by_reason: BTreeMap<String, u64>,
}
