//! Observability ledger: a bounded ring of request records plus running
//! aggregate stats.
//!
//! One record is appended per relayed call, at terminal state only. Readers
//! (`list`, `stats`) never block writers longer than the copy itself; both
//! the ring and the aggregate live under the same lock so that
//! `total_requests == success_count + error_count` holds at every
//! observation point. No lock is ever held across I/O.

use crate::proxy::types::{ErrorKind, LedgerCapacity, RequestId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// One proxied call, as recorded at terminal state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: RequestId,
    pub method: String,
    pub path: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status_code: Option<u16>,
    pub upstream_latency_ms: u64,
    pub byte_count_in: u64,
    pub byte_count_out: u64,
    pub streaming: bool,
    pub error_kind: Option<ErrorKind>,
}

impl RequestRecord {
    /// A record counts as a success when the relay produced a terminal
    /// status below 400 and classified no failure.
    pub fn is_success(&self) -> bool {
        self.error_kind.is_none() && self.status_code.is_some_and(|code| code < 400)
    }
}

/// Running aggregate over all records ever appended, including evicted ones.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct StatsAggregate {
    pub total_requests: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub sum_latency_ms: u64,
}

impl StatsAggregate {
    /// Success percentage in [0, 100]; 0 when no requests were seen.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            (self.success_count as f64 / self.total_requests as f64) * 100.0
        }
    }

    /// Mean upstream latency in milliseconds; 0 when no requests were seen.
    pub fn avg_response_time(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.sum_latency_ms as f64 / self.total_requests as f64
        }
    }
}

struct LedgerInner {
    records: VecDeque<RequestRecord>,
    stats: StatsAggregate,
}

/// Fixed-capacity record ring plus aggregate stats, safe under concurrent
/// access from every in-flight request.
pub struct Ledger {
    inner: RwLock<LedgerInner>,
    capacity: usize,
    evicted: AtomicU64,
}

impl Ledger {
    pub fn new(capacity: LedgerCapacity) -> Self {
        let capacity = capacity.into_inner();
        Self {
            inner: RwLock::new(LedgerInner {
                records: VecDeque::with_capacity(capacity),
                stats: StatsAggregate::default(),
            }),
            capacity,
            evicted: AtomicU64::new(0),
        }
    }

    /// Append a terminal record, evicting the oldest when the ring is full,
    /// and fold it into the aggregate.
    pub fn record(&self, record: RequestRecord) {
        debug_assert!(
            record
                .finished_at
                .is_none_or(|finished| finished >= record.started_at),
            "finished_at must not precede started_at"
        );

        let success = record.is_success();
        let latency = record.upstream_latency_ms;

        let mut inner = self.inner.write();
        if inner.records.len() >= self.capacity {
            inner.records.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        inner.records.push_back(record);

        inner.stats.total_requests += 1;
        if success {
            inner.stats.success_count += 1;
        } else {
            inner.stats.error_count += 1;
        }
        inner.stats.sum_latency_ms += latency;
    }

    /// Up to `limit` most-recent records, newest first.
    pub fn list(&self, limit: usize) -> Vec<RequestRecord> {
        let inner = self.inner.read();
        inner.records.iter().rev().take(limit).cloned().collect()
    }

    /// Snapshot of the aggregate.
    pub fn stats(&self) -> StatsAggregate {
        self.inner.read().stats
    }

    /// Number of records dropped from the ring so far.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capacity(n: usize) -> LedgerCapacity {
        LedgerCapacity::try_new(n).expect("positive capacity")
    }

    fn record(status: Option<u16>, error_kind: Option<ErrorKind>) -> RequestRecord {
        let started_at = Utc::now();
        RequestRecord {
            id: RequestId::new(),
            method: "POST".to_string(),
            path: "/v1/chat/completions".to_string(),
            started_at,
            finished_at: Some(started_at),
            status_code: status,
            upstream_latency_ms: 10,
            byte_count_in: 100,
            byte_count_out: 200,
            streaming: false,
            error_kind,
        }
    }

    #[test]
    fn record_and_list_roundtrip() {
        let ledger = Ledger::new(capacity(10));
        ledger.record(record(Some(200), None));

        let records = ledger.list(10);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status_code, Some(200));
        assert!(records[0].is_success());
    }

    #[test]
    fn list_is_newest_first() {
        let ledger = Ledger::new(capacity(10));
        let mut ids = Vec::new();
        for _ in 0..3 {
            let r = record(Some(200), None);
            ids.push(r.id);
            ledger.record(r);
        }

        let listed: Vec<_> = ledger.list(10).into_iter().map(|r| r.id).collect();
        ids.reverse();
        assert_eq!(listed, ids);
    }

    #[test]
    fn list_limit_zero_is_empty() {
        let ledger = Ledger::new(capacity(10));
        ledger.record(record(Some(200), None));
        assert!(ledger.list(0).is_empty());
    }

    #[test]
    fn list_is_idempotent() {
        let ledger = Ledger::new(capacity(10));
        for _ in 0..5 {
            ledger.record(record(Some(200), None));
        }

        let first: Vec<_> = ledger.list(3).into_iter().map(|r| r.id).collect();
        let second: Vec<_> = ledger.list(3).into_iter().map(|r| r.id).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn list_beyond_capacity_returns_at_most_capacity() {
        let ledger = Ledger::new(capacity(4));
        for _ in 0..10 {
            ledger.record(record(Some(200), None));
        }

        assert_eq!(ledger.list(100).len(), 4);
        assert_eq!(ledger.evicted(), 6);
        // Eviction never rewinds the aggregate.
        assert_eq!(ledger.stats().total_requests, 10);
    }

    #[test]
    fn stats_invariant_holds() {
        let ledger = Ledger::new(capacity(16));
        ledger.record(record(Some(200), None));
        ledger.record(record(Some(400), Some(ErrorKind::ClientRequestError)));
        ledger.record(record(Some(502), Some(ErrorKind::UpstreamUnavailable)));
        ledger.record(record(None, Some(ErrorKind::ClientDisconnected)));

        let stats = ledger.stats();
        assert_eq!(stats.total_requests, 4);
        assert_eq!(stats.success_count + stats.error_count, stats.total_requests);
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.error_count, 3);
    }

    #[test]
    fn stats_rates_with_no_traffic() {
        let ledger = Ledger::new(capacity(4));
        let stats = ledger.stats();
        assert_eq!(stats.success_rate(), 0.0);
        assert_eq!(stats.avg_response_time(), 0.0);
    }

    #[test]
    fn stats_invariant_under_concurrent_writes() {
        use std::sync::Arc;
        use std::thread;

        let ledger = Arc::new(Ledger::new(capacity(64)));
        let threads = 8;
        let writes_per_thread = 50;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    for i in 0..writes_per_thread {
                        if (t + i) % 3 == 0 {
                            ledger.record(record(Some(502), Some(ErrorKind::UpstreamUnavailable)));
                        } else {
                            ledger.record(record(Some(200), None));
                        }
                        let stats = ledger.stats();
                        assert_eq!(
                            stats.success_count + stats.error_count,
                            stats.total_requests
                        );
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("writer thread");
        }

        assert_eq!(ledger.stats().total_requests, (threads * writes_per_thread) as u64);
    }
}
