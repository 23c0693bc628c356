use std::time::{Duration, Instant};

use anyhow::Result;
use opentelemetry::{metrics::Histogram, KeyValue};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};

pub fn low_latency_boundaries() -> Vec<f64> {
    vec![
        0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 100.0,
    ]
}

pub fn init_provider(
    enable_metrics: bool,
    endpoint: Option<&String>,
    interval: Duration,
    instance_id: Option<&str>,
    service_version: &str,
) -> Result<Option<SdkMeterProvider>> {
    if !enable_metrics {
        return Ok(None);
    }

    let mut resource_builder = Resource::builder()
        .with_attribute(KeyValue::new("service.namespace", "scan-scheduler"))
        .with_attribute(KeyValue::new("service.name", "scan-scheduler-server"))
        .with_attribute(KeyValue::new(
            "service.version",
            service_version.to_string(),
        ));

    if let Some(instance_id) = instance_id {
        resource_builder = resource_builder.with_attribute(KeyValue::new(
            "scheduler.instance.id",
            instance_id.to_owned(),
        ));
    }

    let resource = resource_builder.build();

    let mut exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = endpoint {
        exporter = exporter.with_endpoint(endpoint.to_owned());
    }
    let exporter = exporter.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider.clone());
    Ok(Some(provider))
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

/// Records the time between `start` and drop into `metric`.
pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: &'a [KeyValue],
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    pub fn start(metric: &'a T) -> Self {
        Self::start_with_labels(metric, &[])
    }

    pub fn start_with_labels(metric: &'a T, labels: &'a [KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels,
        }
    }
}

impl<T: TimerUpdate + Sync> Drop for Timer<'_, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), self.labels);
    }
}

pub mod scheduler_stats {
    use std::sync::atomic::{AtomicU64, Ordering};

    use opentelemetry::metrics::{Counter, Gauge, Histogram};

    use crate::low_latency_boundaries;

    /// Scheduler instruments. The lifetime totals are mirrored in atomics so
    /// they can be read back without going through an exporter.
    #[derive(Debug)]
    pub struct Metrics {
        pub total_assignments: Counter<u64>,
        pub total_local_assignments: Counter<u64>,
        pub num_backends: Gauge<u64>,
        pub initialized: Gauge<u64>,
        pub schedule_latency: Histogram<f64>,
        pub membership_updates: Counter<u64>,
        assignments: AtomicU64,
        local_assignments: AtomicU64,
        backends: AtomicU64,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("scheduler");

            let total_assignments = meter
                .u64_counter("scheduler.total-scan-ranges-assigned")
                .with_description("number of scan ranges assigned to backends")
                .build();

            let total_local_assignments = meter
                .u64_counter("scheduler.total-locally-assigned")
                .with_description("number of scan ranges assigned to a backend holding a replica")
                .build();

            let num_backends = meter
                .u64_gauge("scheduler.num-backends")
                .with_description("number of cluster members known to the scheduler")
                .build();

            let initialized = meter
                .u64_gauge("scheduler.initialized")
                .with_description("1 once the scheduler has been initialized")
                .build();

            let schedule_latency = meter
                .f64_histogram("scheduler.schedule_latency")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("time spent building a query schedule in seconds")
                .build();

            let membership_updates = meter
                .u64_counter("scheduler.membership_updates")
                .with_description("number of membership deltas applied")
                .build();

            Metrics {
                total_assignments,
                total_local_assignments,
                num_backends,
                initialized,
                schedule_latency,
                membership_updates,
                assignments: AtomicU64::new(0),
                local_assignments: AtomicU64::new(0),
                backends: AtomicU64::new(0),
            }
        }

        pub fn record_assignment(&self, is_local: bool) {
            self.total_assignments.add(1, &[]);
            self.assignments.fetch_add(1, Ordering::Relaxed);
            if is_local {
                self.total_local_assignments.add(1, &[]);
                self.local_assignments.fetch_add(1, Ordering::Relaxed);
            }
        }

        pub fn set_num_backends(&self, num_backends: u64) {
            self.num_backends.record(num_backends, &[]);
            self.backends.store(num_backends, Ordering::Relaxed);
        }

        pub fn set_initialized(&self) {
            self.initialized.record(1, &[]);
        }

        pub fn num_assignments(&self) -> u64 {
            self.assignments.load(Ordering::Relaxed)
        }

        pub fn num_local_assignments(&self) -> u64 {
            self.local_assignments.load(Ordering::Relaxed)
        }

        pub fn num_backends(&self) -> u64 {
            self.backends.load(Ordering::Relaxed)
        }
    }

}
