//! Lock-free gateway counters and periodic reporting
//!
//! Counters are updated from the dispatch loop and read by the status
//! reporter. Only `report()` resets anything (periodic counters are swapped
//! to zero); monotonic totals are never reset.
//!
//! NOTE: All atomics use Relaxed ordering; these are statistical counters
//! only and must not drive control flow.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::info;

/// Publish acknowledgement latency buckets (milliseconds)
/// Buckets: ≤1, ≤2, ≤5, ≤10, ≤25, ≤50, ≤100, ≤250, ≤500, ≤1000, >1000
const BUCKET_BOUNDS: [u64; 10] = [1, 2, 5, 10, 25, 50, 100, 250, 500, 1000];
const NUM_BUCKETS: usize = 11;

#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
}

#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
    }
    result
}

/// Upper bound of the bucket holding the given percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = ((total as f64 * percentile).ceil() as u64).max(1);
    let mut cumulative = 0u64;

    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [1, 2, 5, 10, 25, 50, 100, 250, 500, 1000, 2000];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Gateway counters shared between the dispatch loop and reporters
pub struct GatewayMetrics {
    /// Messages acknowledged by a broker (monotonic)
    published_total: AtomicU64,
    /// Messages acknowledged since last report (reset on report)
    published_since_report: AtomicU64,
    /// Publish attempts that errored or timed out (monotonic)
    publish_failed_total: AtomicU64,
    /// Device messages dropped because no broker was connected (monotonic)
    dropped_no_broker_total: AtomicU64,
    /// Messages whose generated topic was invalid (monotonic)
    topic_rejected_total: AtomicU64,
    /// Messages delivered by broker subscriptions (monotonic)
    inbound_total: AtomicU64,
    /// Inbound messages with no matching device or a full device queue (monotonic)
    inbound_dropped_total: AtomicU64,
    /// Reconnect attempts scheduled (monotonic)
    reconnect_attempts_total: AtomicU64,
    /// Brokers that exhausted their retry budget (monotonic)
    brokers_failed_total: AtomicU64,
    /// Brokers currently connected (gauge)
    brokers_connected: AtomicU64,
    /// Publish latency histogram (reset on report)
    publish_latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Max publish latency in ms (reset on report)
    publish_latency_max_ms: AtomicU64,
    last_report_time: Mutex<Instant>,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self {
            published_total: AtomicU64::new(0),
            published_since_report: AtomicU64::new(0),
            publish_failed_total: AtomicU64::new(0),
            dropped_no_broker_total: AtomicU64::new(0),
            topic_rejected_total: AtomicU64::new(0),
            inbound_total: AtomicU64::new(0),
            inbound_dropped_total: AtomicU64::new(0),
            reconnect_attempts_total: AtomicU64::new(0),
            brokers_failed_total: AtomicU64::new(0),
            brokers_connected: AtomicU64::new(0),
            publish_latency_buckets: Default::default(),
            publish_latency_max_ms: AtomicU64::new(0),
            last_report_time: Mutex::new(Instant::now()),
        }
    }

    /// Broker acknowledged a message after `latency_ms`
    #[inline]
    pub fn record_published(&self, latency_ms: u64) {
        self.published_total.fetch_add(1, Ordering::Relaxed);
        self.published_since_report.fetch_add(1, Ordering::Relaxed);
        self.publish_latency_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.publish_latency_max_ms, latency_ms);
    }

    #[inline]
    pub fn record_publish_failed(&self) {
        self.publish_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dropped_no_broker(&self) {
        self.dropped_no_broker_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_topic_rejected(&self) {
        self.topic_rejected_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_inbound(&self) {
        self.inbound_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_inbound_dropped(&self) {
        self.inbound_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_broker_failed(&self) {
        self.brokers_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_brokers_connected(&self, count: usize) {
        self.brokers_connected.store(count as u64, Ordering::Relaxed);
    }

    pub fn published_total(&self) -> u64 {
        self.published_total.load(Ordering::Relaxed)
    }

    pub fn publish_failed_total(&self) -> u64 {
        self.publish_failed_total.load(Ordering::Relaxed)
    }

    pub fn dropped_no_broker_total(&self) -> u64 {
        self.dropped_no_broker_total.load(Ordering::Relaxed)
    }

    pub fn topic_rejected_total(&self) -> u64 {
        self.topic_rejected_total.load(Ordering::Relaxed)
    }

    pub fn inbound_total(&self) -> u64 {
        self.inbound_total.load(Ordering::Relaxed)
    }

    pub fn inbound_dropped_total(&self) -> u64 {
        self.inbound_dropped_total.load(Ordering::Relaxed)
    }

    pub fn reconnect_attempts_total(&self) -> u64 {
        self.reconnect_attempts_total.load(Ordering::Relaxed)
    }

    pub fn brokers_failed_total(&self) -> u64 {
        self.brokers_failed_total.load(Ordering::Relaxed)
    }

    pub fn brokers_connected(&self) -> u64 {
        self.brokers_connected.load(Ordering::Relaxed)
    }

    /// Swap periodic counters and build a summary
    pub fn report(&self) -> MetricsSummary {
        let published_count = self.published_since_report.swap(0, Ordering::Relaxed);
        let buckets = swap_buckets(&self.publish_latency_buckets);
        let latency_max_ms = self.publish_latency_max_ms.swap(0, Ordering::Relaxed);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        self.summary(published_count, elapsed, buckets, latency_max_ms)
    }

    /// Summary of the current period without resetting anything
    pub fn snapshot(&self) -> MetricsSummary {
        let published_count = self.published_since_report.load(Ordering::Relaxed);
        let buckets = load_buckets(&self.publish_latency_buckets);
        let latency_max_ms = self.publish_latency_max_ms.load(Ordering::Relaxed);
        let elapsed = self.last_report_time.lock().elapsed();

        self.summary(published_count, elapsed, buckets, latency_max_ms)
    }

    fn summary(
        &self,
        published_count: u64,
        elapsed: Duration,
        buckets: [u64; NUM_BUCKETS],
        latency_max_ms: u64,
    ) -> MetricsSummary {
        let published_per_sec = if elapsed.as_secs_f64() > 0.0 {
            published_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let timestamp = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();

        MetricsSummary {
            timestamp,
            published_total: self.published_total.load(Ordering::Relaxed),
            published_per_sec,
            publish_failed_total: self.publish_failed_total.load(Ordering::Relaxed),
            dropped_no_broker_total: self.dropped_no_broker_total.load(Ordering::Relaxed),
            topic_rejected_total: self.topic_rejected_total.load(Ordering::Relaxed),
            inbound_total: self.inbound_total.load(Ordering::Relaxed),
            inbound_dropped_total: self.inbound_dropped_total.load(Ordering::Relaxed),
            reconnect_attempts_total: self.reconnect_attempts_total.load(Ordering::Relaxed),
            brokers_failed_total: self.brokers_failed_total.load(Ordering::Relaxed),
            brokers_connected: self.brokers_connected.load(Ordering::Relaxed),
            publish_lat_buckets: buckets,
            publish_lat_p50_ms: percentile_from_buckets(&buckets, 0.50),
            publish_lat_p99_ms: percentile_from_buckets(&buckets, 0.99),
            publish_lat_max_ms: latency_max_ms,
        }
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view, also the JSON body of status reports
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    /// RFC 3339, UTC
    pub timestamp: String,
    pub published_total: u64,
    pub published_per_sec: f64,
    pub publish_failed_total: u64,
    pub dropped_no_broker_total: u64,
    pub topic_rejected_total: u64,
    pub inbound_total: u64,
    pub inbound_dropped_total: u64,
    pub reconnect_attempts_total: u64,
    pub brokers_failed_total: u64,
    pub brokers_connected: u64,
    /// Bounds: ≤1, ≤2, ≤5, ≤10, ≤25, ≤50, ≤100, ≤250, ≤500, ≤1000, >1000 ms
    pub publish_lat_buckets: [u64; NUM_BUCKETS],
    pub publish_lat_p50_ms: u64,
    pub publish_lat_p99_ms: u64,
    pub publish_lat_max_ms: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            published_total = %self.published_total,
            published_per_sec = format!("{:.1}", self.published_per_sec),
            publish_failed = %self.publish_failed_total,
            dropped_no_broker = %self.dropped_no_broker_total,
            inbound = %self.inbound_total,
            reconnects = %self.reconnect_attempts_total,
            brokers_connected = %self.brokers_connected,
            brokers_failed = %self.brokers_failed_total,
            p99_ms = %self.publish_lat_p99_ms,
            "metrics"
        );
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}
