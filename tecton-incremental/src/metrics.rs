//! Layer proxy metrics
//!
//! Every proxy carries a [`ProxyMetrics`] counting the [`ProxyEvent`]s of its
//! caches. Tests use these counters to observe recomputation without
//! instrumenting the computations themselves.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Something a layer proxy did while answering a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyEvent {
    /// A request was answered from a per-time cache.
    Hit,
    /// A request missed every cache.
    Miss,
    /// A bounded cache dropped its least-recently-used entry.
    Eviction,
    /// Cached results were discarded because an input changed.
    Invalidation,
    /// A per-time result was computed.
    Compute,
    /// A whole time span was computed.
    TimeSpan,
}

impl ProxyEvent {
    const ALL: [ProxyEvent; 6] = [
        ProxyEvent::Hit,
        ProxyEvent::Miss,
        ProxyEvent::Eviction,
        ProxyEvent::Invalidation,
        ProxyEvent::Compute,
        ProxyEvent::TimeSpan,
    ];

    fn slot(self) -> usize {
        self as usize
    }
}

/// Event counters for one layer proxy
#[derive(Debug)]
pub struct ProxyMetrics {
    layer_name: &'static str,
    events: [AtomicU64; ProxyEvent::ALL.len()],
    compute_ns: AtomicU64,
    time_span_ns: AtomicU64,
    /// Dead entries removed from the reconstructed geometry index.
    pruned_index_entries: AtomicU64,
}

impl ProxyMetrics {
    pub fn new(layer_name: &'static str) -> Self {
        ProxyMetrics {
            layer_name,
            events: Default::default(),
            compute_ns: AtomicU64::new(0),
            time_span_ns: AtomicU64::new(0),
            pruned_index_entries: AtomicU64::new(0),
        }
    }

    pub fn layer_name(&self) -> &'static str {
        self.layer_name
    }

    pub fn record(&self, event: ProxyEvent) {
        self.events[event.slot()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self, event: ProxyEvent) -> u64 {
        self.events[event.slot()].load(Ordering::Relaxed)
    }

    pub fn record_hit(&self) {
        self.record(ProxyEvent::Hit);
    }

    pub fn record_miss(&self) {
        self.record(ProxyEvent::Miss);
    }

    pub fn record_eviction(&self) {
        self.record(ProxyEvent::Eviction);
    }

    pub fn record_invalidation(&self) {
        self.record(ProxyEvent::Invalidation);
    }

    pub fn record_compute(&self, elapsed: Duration) {
        self.record(ProxyEvent::Compute);
        self.compute_ns.fetch_add(nanos(elapsed), Ordering::Relaxed);
    }

    pub fn record_time_span(&self, elapsed: Duration) {
        self.record(ProxyEvent::TimeSpan);
        self.time_span_ns.fetch_add(nanos(elapsed), Ordering::Relaxed);
    }

    pub fn record_pruned(&self, entries: usize) {
        self.pruned_index_entries
            .fetch_add(entries as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            layer_name: self.layer_name,
            hits: self.count(ProxyEvent::Hit),
            misses: self.count(ProxyEvent::Miss),
            evictions: self.count(ProxyEvent::Eviction),
            invalidations: self.count(ProxyEvent::Invalidation),
            computes: self.count(ProxyEvent::Compute),
            time_spans: self.count(ProxyEvent::TimeSpan),
            pruned_index_entries: self.pruned_index_entries.load(Ordering::Relaxed),
            compute_time: Duration::from_nanos(self.compute_ns.load(Ordering::Relaxed)),
            time_span_time: Duration::from_nanos(self.time_span_ns.load(Ordering::Relaxed)),
        }
    }
}

fn nanos(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)
}

/// A point-in-time copy of [`ProxyMetrics`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub layer_name: &'static str,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub computes: u64,
    pub time_spans: u64,
    pub pruned_index_entries: u64,
    pub compute_time: Duration,
    pub time_span_time: Duration,
}

impl MetricsSnapshot {
    /// Fraction of per-time requests served from cache; zero before any.
    pub fn hit_rate(&self) -> f64 {
        match self.hits + self.misses {
            0 => 0.0,
            requests => self.hits as f64 / requests as f64,
        }
    }

    pub fn mean_compute_time(&self) -> Duration {
        match u32::try_from(self.computes) {
            Ok(0) => Duration::ZERO,
            Ok(computes) => self.compute_time / computes,
            Err(_) => Duration::from_nanos(
                u64::try_from(self.compute_time.as_nanos() / u128::from(self.computes))
                    .unwrap_or(u64::MAX),
            ),
        }
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}/{} cached ({:.0}%), {} evicted, {} invalidated, {} computed in {:?}",
            self.layer_name,
            self.hits,
            self.hits + self.misses,
            self.hit_rate() * 100.0,
            self.evictions,
            self.invalidations,
            self.computes,
            self.compute_time,
        )?;
        if self.time_spans > 0 {
            write!(f, ", {} spans in {:?}", self.time_spans, self.time_span_time)?;
        }
        if self.pruned_index_entries > 0 {
            write!(f, ", {} index entries pruned", self.pruned_index_entries)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_counted_separately() {
        let metrics = ProxyMetrics::new("velocity_field_calculator");
        for event in [ProxyEvent::Hit, ProxyEvent::Hit, ProxyEvent::Miss] {
            metrics.record(event);
        }
        metrics.record_time_span(Duration::from_millis(4));
        metrics.record_pruned(3);

        let snapshot = metrics.snapshot();
        assert_eq!((snapshot.hits, snapshot.misses), (2, 1));
        assert_eq!(snapshot.time_spans, 1);
        assert_eq!(snapshot.computes, 0);
        assert_eq!(snapshot.pruned_index_entries, 3);
        assert_eq!(metrics.count(ProxyEvent::Eviction), 0);
    }

    #[test]
    fn test_mean_compute_time_and_display() {
        let metrics = ProxyMetrics::new("reconstruct");
        assert_eq!(metrics.snapshot().mean_compute_time(), Duration::ZERO);

        metrics.record_miss();
        metrics.record_compute(Duration::from_millis(10));
        metrics.record_miss();
        metrics.record_compute(Duration::from_millis(20));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.mean_compute_time(), Duration::from_millis(15));
        assert_eq!(
            snapshot.to_string(),
            "reconstruct: 0/2 cached (0%), 0 evicted, 0 invalidated, 2 computed in 30ms"
        );
    }
}
