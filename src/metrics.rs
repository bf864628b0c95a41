use std::sync::{Arc, Mutex};
use std::time::Instant;

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct AllocationLabels {
    result: AllocationResult,
}

/// Terminal outcome of an allocation request, as a metric label.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum AllocationResult {
    Ready,
    Processing,
    Conflict,
    BadInstance,
    Error,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct EventLabels {
    kind: EventKind,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum EventKind {
    Launch,
    Terminate,
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Prometheus metrics for devpool.
///
/// All methods are cheap atomic operations; the struct is `Clone + Send +
/// Sync` via an internal `Arc`.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Mutex<Registry>,
    active_users: Gauge,
    warm_pool_size: Gauge,
    desired_capacity: Gauge,
    allocations_total: Family<AllocationLabels, Counter>,
    allocation_duration_seconds: Histogram,
    reaped_total: Counter,
    lifecycle_events_total: Family<EventLabels, Counter>,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let active_users = Gauge::default();
        registry.register(
            "devpool_active_users",
            "Users with a RUNNING workspace",
            active_users.clone(),
        );

        let warm_pool_size = Gauge::default();
        registry.register(
            "devpool_warm_pool_size",
            "Unassigned ready instances in the warm pool",
            warm_pool_size.clone(),
        );

        let desired_capacity = Gauge::default();
        registry.register(
            "devpool_asg_desired_capacity",
            "Desired capacity last written to the ASG",
            desired_capacity.clone(),
        );

        let allocations_total = Family::<AllocationLabels, Counter>::default();
        registry.register(
            "devpool_allocations_total",
            "Allocation requests by outcome",
            allocations_total.clone(),
        );

        // Warm-path allocations land well under a second; the tail covers
        // retried cloud calls.
        let allocation_duration_seconds = Histogram::new(exponential_buckets(0.01, 2.0, 12));
        registry.register(
            "devpool_allocation_duration_seconds",
            "Allocation request duration in seconds",
            allocation_duration_seconds.clone(),
        );

        let reaped_total = Counter::default();
        registry.register(
            "devpool_reaped_total",
            "Idle workspaces reaped",
            reaped_total.clone(),
        );

        let lifecycle_events_total = Family::<EventLabels, Counter>::default();
        registry.register(
            "devpool_lifecycle_events_total",
            "Lifecycle events handled by kind",
            lifecycle_events_total.clone(),
        );

        Self {
            inner: Arc::new(MetricsInner {
                registry: Mutex::new(registry),
                active_users,
                warm_pool_size,
                desired_capacity,
                allocations_total,
                allocation_duration_seconds,
                reaped_total,
                lifecycle_events_total,
                start_time: Instant::now(),
            }),
        }
    }

    pub fn set_active_users(&self, n: u64) {
        self.inner.active_users.set(n as i64);
    }

    pub fn set_warm_pool_size(&self, n: u64) {
        self.inner.warm_pool_size.set(n as i64);
    }

    pub fn set_desired_capacity(&self, n: u32) {
        self.inner.desired_capacity.set(n as i64);
    }

    pub fn record_allocation(&self, result: AllocationResult, duration: std::time::Duration) {
        self.inner
            .allocations_total
            .get_or_create(&AllocationLabels { result })
            .inc();
        self.inner
            .allocation_duration_seconds
            .observe(duration.as_secs_f64());
    }

    pub fn record_reaped(&self, count: u64) {
        self.inner.reaped_total.inc_by(count);
    }

    pub fn record_lifecycle_event(&self, kind: EventKind) {
        self.inner
            .lifecycle_events_total
            .get_or_create(&EventLabels { kind })
            .inc();
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }

    /// Text exposition format for the scrape endpoint.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        let registry = self.inner.registry.lock().expect("metrics registry poisoned");
        encode(&mut out, &registry).expect("metrics encoding is infallible for String");
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
