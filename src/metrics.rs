//! Metrics for checkpoint activity.
//!
//! Instruments are created from the global OpenTelemetry meter, so
//! they are no-ops until [`initialize_metrics`] installs a provider.

use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::Aggregation;
use opentelemetry_sdk::metrics::Instrument;
use opentelemetry_sdk::metrics::MeterProvider;
use opentelemetry_sdk::metrics::Stream;
use prometheus::default_registry;
use prometheus::Encoder;
use prometheus::TextEncoder;

use crate::errors::StateError;
use crate::errors::StateResult;

#[macro_export]
macro_rules! with_timer {
    ($histogram: expr, $labels: expr, $body: expr) => {{
        let now = std::time::Instant::now();
        let res = $body;
        $histogram.record(now.elapsed().as_secs_f64(), &$labels);
        res
    }};
}

/// Initialize the global registry for Prometheus metrics,
/// and create a global MeterProvider.
pub fn initialize_metrics() -> StateResult<()> {
    // Initialize the global default registry for prometheus metrics
    // as internally it's a lazy static.
    let registry = default_registry();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .with_namespace("opstate")
        .build()
        .map_err(|err| StateError::Metrics(err.to_string()))?;

    let provider = MeterProvider::builder()
        .with_reader(exporter)
        .with_view(
            opentelemetry_sdk::metrics::new_view(
                Instrument::new().name("*duration*"), // Must match histogram name
                Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
                    boundaries: vec![
                        0.0, 0.0005, 0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0,
                        2.5, 5.0,
                    ],
                    record_min_max: true,
                }),
            )
            .map_err(|err| StateError::Metrics(err.to_string()))?,
        )
        .build();
    global::set_meter_provider(provider);
    Ok(())
}

/// Text exposition of everything in the default Prometheus registry.
pub fn render_metrics() -> StateResult<String> {
    let families = default_registry().gather();
    let mut buf = Vec::new();
    TextEncoder::new()
        .encode(&families, &mut buf)
        .map_err(|err| StateError::Metrics(err.to_string()))?;
    String::from_utf8(buf).map_err(|err| StateError::Metrics(err.to_string()))
}

/// Instruments recorded by a [`crate::checkpoint::KvStore`].
pub(crate) struct StoreMetrics {
    pub(crate) saved_count: Counter<u64>,
    pub(crate) evicted_count: Counter<u64>,
    pub(crate) evict_error_count: Counter<u64>,
    pub(crate) save_duration: Histogram<f64>,
    pub(crate) labels: Vec<KeyValue>,
}

impl StoreMetrics {
    pub(crate) fn new(rule_id: &str) -> Self {
        let meter = global::meter("opstate");
        Self {
            saved_count: meter
                .u64_counter("checkpoint_saved_count")
                .with_description("number of checkpoints made durable")
                .init(),
            evicted_count: meter
                .u64_counter("checkpoint_evicted_count")
                .with_description("number of checkpoint records deleted after leaving retention")
                .init(),
            evict_error_count: meter
                .u64_counter("checkpoint_evict_error_count")
                .with_description("number of failed checkpoint record deletes")
                .init(),
            save_duration: meter
                .f64_histogram("checkpoint_save_duration_seconds")
                .with_description("duration of writing a checkpoint to storage in seconds")
                .init(),
            labels: vec![KeyValue::new("rule_id", rule_id.to_owned())],
        }
    }
}

#[test]
fn timer_returns_body_value() {
    let metrics = StoreMetrics::new("timer_test");
    let found = with_timer!(metrics.save_duration, metrics.labels, 40 + 2);
    assert_eq!(found, 42);
}

#[test]
fn checkpoint_counts_are_exported() -> StateResult<()> {
    use std::sync::Arc;

    use crate::checkpoint::KvStore;
    use crate::checkpoint::StateStore;
    use crate::engine::MemEngine;
    use crate::state::StateMap;

    initialize_metrics()?;
    let store = KvStore::with_engine("metrics_test", Arc::new(MemEngine::new()), 1)?;
    store.save_state(1, "op1", StateMap::new())?;
    store.save_checkpoint(1)?;

    let text = render_metrics()?;
    assert!(text.contains("opstate_checkpoint_saved_count"), "{text}");
    assert!(text.contains("opstate_checkpoint_save_duration_seconds"), "{text}");
    assert!(text.contains(r#"rule_id="metrics_test""#), "{text}");
    Ok(())
}
