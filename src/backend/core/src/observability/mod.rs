//! Observability: Distributed Tracing, Metrics, and Logging.

use opentelemetry_otlp::WithExportConfig;
use tracing::Subscriber;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::ObservabilityConfig;

const DEFAULT_FILTER: &str = "info,transmute_core=debug";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Initialize the observability stack.
pub fn init(config: &ObservabilityConfig) -> anyhow::Result<()> {
    subscriber(config)?.try_init()?;
    metrics::register_metrics();
    Ok(())
}

/// Build the subscriber: env filter, optional OTLP export, then JSON or pretty output.
fn subscriber(
    config: &ObservabilityConfig,
) -> anyhow::Result<impl Subscriber + Send + Sync + 'static> {
    // Set up OpenTelemetry tracing if endpoint is provided
    let telemetry_layer = match config.otlp_endpoint.as_deref() {
        Some(endpoint) => {
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint),
                )
                .with_trace_config(
                    opentelemetry_sdk::trace::config()
                        .with_resource(opentelemetry_sdk::Resource::new(vec![
                            opentelemetry::KeyValue::new("service.name", config.service_name.clone()),
                        ])),
                )
                .install_batch(opentelemetry_sdk::runtime::Tokio)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    Ok(tracing_subscriber::registry()
        .with(env_filter())
        .with(telemetry_layer)
        .with(fmt_layer(config.json_logging)))
}

fn fmt_layer<S>(json: bool) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    }
}

/// Shutdown OpenTelemetry.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}

/// Metrics registry and helpers.
pub mod metrics {
    use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
    use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

    /// Install the Prometheus recorder and return the handle that renders `/metrics`.
    pub fn install_prometheus() -> anyhow::Result<PrometheusHandle> {
        let handle = PrometheusBuilder::new().install_recorder()?;
        Ok(handle)
    }

    /// Register all metric descriptions.
    pub fn register_metrics() {
        // Counters
        describe_counter!(
            "transmute_jobs_submitted_total",
            "Total number of jobs accepted by the broker"
        );
        describe_counter!(
            "transmute_jobs_completed_total",
            "Jobs that reached a terminal state, labelled by outcome"
        );
        describe_counter!(
            "transmute_job_retries_total",
            "Retries scheduled after transient faults"
        );
        describe_counter!(
            "transmute_jobs_redelivered_total",
            "Deliveries returned to the queue after their visibility timeout"
        );
        describe_counter!(
            "transmute_worker_recycles_total",
            "Worker loops retired after reaching their job budget"
        );
        describe_counter!(
            "transmute_batches_dispatched_total",
            "Batches whose members were enqueued"
        );
        describe_counter!(
            "transmute_batch_items_total",
            "Member jobs created by batch dispatch"
        );
        describe_counter!(
            "transmute_archives_built_total",
            "Result archives packaged for download"
        );
        describe_counter!(
            "transmute_store_operations_total",
            "Result store operations, labelled by operation"
        );
        describe_counter!(
            "transmute_errors_total",
            "Errors raised, labelled by code"
        );

        // Gauges
        describe_gauge!(
            "transmute_active_jobs",
            "Jobs currently executing in this process"
        );
        describe_gauge!(
            "transmute_queue_depth",
            "Messages waiting in the broker queue"
        );

        // Histograms
        describe_histogram!(
            "transmute_job_duration_seconds",
            "Job execution duration in seconds"
        );
        describe_histogram!(
            "transmute_batch_aggregation_seconds",
            "Time spent polling members for one batch status"
        );
    }

    pub fn record_job_submitted(kind: &'static str) {
        counter!("transmute_jobs_submitted_total", "kind" => kind).increment(1);
    }

    pub fn record_job_finished(kind: &'static str, outcome: &'static str, duration_secs: f64) {
        counter!("transmute_jobs_completed_total", "kind" => kind, "outcome" => outcome)
            .increment(1);
        histogram!("transmute_job_duration_seconds", "kind" => kind).record(duration_secs);
    }

    pub fn record_retry(kind: &'static str) {
        counter!("transmute_job_retries_total", "kind" => kind).increment(1);
    }

    pub fn record_redelivered(count: u64) {
        counter!("transmute_jobs_redelivered_total").increment(count);
    }

    pub fn record_worker_recycled() {
        counter!("transmute_worker_recycles_total").increment(1);
    }

    pub fn record_batch_dispatched(items: u64) {
        counter!("transmute_batches_dispatched_total").increment(1);
        counter!("transmute_batch_items_total").increment(items);
    }

    pub fn record_archive_built() {
        counter!("transmute_archives_built_total").increment(1);
    }

    pub fn record_store_op(op: &'static str) {
        counter!("transmute_store_operations_total", "op" => op).increment(1);
    }

    pub fn record_aggregation(duration_secs: f64) {
        histogram!("transmute_batch_aggregation_seconds").record(duration_secs);
    }

    pub fn set_active_jobs(count: u64) {
        gauge!("transmute_active_jobs").set(count as f64);
    }

    pub fn set_queue_depth(depth: u64) {
        gauge!("transmute_queue_depth").set(depth as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_subscriber_logs_in_both_formats() {
        for json_logging in [true, false] {
            let config = ObservabilityConfig {
                json_logging,
                ..Default::default()
            };
            let subscriber = subscriber(&config).unwrap();
            tracing::subscriber::with_default(subscriber, || {
                tracing::info!(job_id = "abc", "subscriber built");
            });
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_otlp_subscriber_builds_with_fmt_layer() {
        let config = ObservabilityConfig {
            otlp_endpoint: Some("http://127.0.0.1:4317".to_string()),
            json_logging: false,
            ..Default::default()
        };
        let subscriber = subscriber(&config).unwrap();
        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("convert", job_id = "abc");
            let _guard = span.enter();
            tracing::info!("exported through otlp");
        });
    }
}
