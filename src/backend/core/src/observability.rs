//! Observability: tracing, metrics, and logging.

use opentelemetry_otlp::WithExportConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the observability stack.
pub fn init(service_name: &str, otlp_endpoint: Option<&str>) -> anyhow::Result<()> {
    if let Some(endpoint) = otlp_endpoint {
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
                        opentelemetry::KeyValue::new("service.name", service_name.to_string()),
                    ])),
            )
            .install_batch(opentelemetry_sdk::runtime::Tokio)?;

        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(telemetry_layer)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }

    Ok(())
}

/// Shutdown OpenTelemetry.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}

/// Metrics registry and helpers.
pub mod metrics {
    use metrics::{describe_counter, describe_gauge};

    /// Register all metric descriptions.
    pub fn register_metrics() {
        describe_counter!(
            "litrev_jobs_completed_total",
            "Jobs that reached COMPLETED, by queue"
        );
        describe_counter!(
            "litrev_jobs_failed_total",
            "Jobs that reached a failed status, by queue"
        );
        describe_counter!(
            "litrev_jobs_resumed_total",
            "Jobs recovered through the resume protocol"
        );
        describe_counter!(
            "litrev_errors_total",
            "Errors raised, by code and category"
        );
        describe_counter!(
            "litrev_credits_charged_total",
            "Credits charged, in hundredths"
        );
        describe_gauge!(
            "litrev_queue_depth",
            "Tasks ready for delivery, by queue"
        );
    }
}
