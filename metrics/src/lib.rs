use std::time::{Duration, Instant};

use anyhow::Result;
use opentelemetry::{metrics::Histogram, KeyValue};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use tracing::info;

/// Installs a periodic OTLP exporter as the global meter provider.
///
/// Until this runs every instrument created through
/// `opentelemetry::global::meter` is a no-op.
pub fn init_provider(endpoint: Option<&str>) -> Result<SdkMeterProvider> {
    let mut exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = endpoint {
        exporter = exporter.with_endpoint(endpoint);
    }
    let provider = SdkMeterProvider::builder()
        .with_periodic_exporter(exporter.build()?)
        .build();
    opentelemetry::global::set_meter_provider(provider.clone());
    info!("metrics export enabled");
    Ok(provider)
}

pub mod gateway_stats {
    use opentelemetry::metrics::{Counter, Histogram, UpDownCounter};

    #[derive(Debug)]
    pub struct Metrics {
        pub requests: Counter<u64>,
        pub cache_lookups: Counter<u64>,
        pub cache_writes: Counter<u64>,
        pub mirrors: Counter<u64>,
        pub mirrored_bytes: Counter<u64>,
        pub mirror_duration: Histogram<f64>,
        pub active_streams: UpDownCounter<i64>,
        pub background_failures: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("mirror-gateway");
            let requests = meter
                .u64_counter("mirror_gateway.requests")
                .with_description("requests served, by method and source")
                .build();
            let cache_lookups = meter
                .u64_counter("mirror_gateway.cache_lookups")
                .with_description("edge cache lookups, by outcome")
                .build();
            let cache_writes = meter
                .u64_counter("mirror_gateway.cache_writes")
                .with_description("edge cache entries written")
                .build();
            let mirrors = meter
                .u64_counter("mirror_gateway.mirrors")
                .with_description("mirror attempts, by strategy and outcome")
                .build();
            let mirrored_bytes = meter
                .u64_counter("mirror_gateway.mirrored_bytes")
                .with_description("bytes written into the primary store by mirroring")
                .build();
            let mirror_duration = meter
                .f64_histogram("mirror_gateway.mirror_duration")
                .with_unit("s")
                .with_description("time spent mirroring one object")
                .build();
            let active_streams = meter
                .i64_up_down_counter("mirror_gateway.active_streams")
                .with_description("response bodies currently streaming to clients")
                .build();
            let background_failures = meter
                .u64_counter("mirror_gateway.background_failures")
                .with_description("background tasks that failed or panicked, by task")
                .build();
            Metrics {
                requests,
                cache_lookups,
                cache_writes,
                mirrors,
                mirrored_bytes,
                mirror_duration,
                active_streams,
                background_failures,
            }
        }
    }
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

/// Records the time between its creation and its drop.
pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: Vec<KeyValue>,
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    pub fn start(metric: &'a T) -> Self {
        Self::start_with_labels(metric, &[])
    }

    pub fn start_with_labels(metric: &'a T, labels: &[KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels: labels.to_vec(),
        }
    }
}

impl<T: TimerUpdate + Sync> Drop for Timer<'_, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), &self.labels);
    }
}
