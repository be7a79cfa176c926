use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing::info;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })?;

    info!(
        target = "ondata::infra::telemetry",
        level = %logging.level,
        format = ?logging.format,
        "telemetry initialised"
    );
    Ok(())
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "ondata_cache_resolve_total",
            Unit::Count,
            "Cache resolutions by outcome (serve, redirect, produce, fallback)."
        );
        describe_histogram!(
            "ondata_cache_wait_cycles",
            Unit::Count,
            "Poll cycles spent waiting on another producer before a resolution."
        );
        describe_counter!(
            "ondata_cache_reclaim_total",
            Unit::Count,
            "Abandoned cache entries deleted so they can be produced again."
        );
        describe_counter!(
            "ondata_dependency_calls_total",
            Unit::Count,
            "Outbound blob and database calls by dependency, action and success."
        );
        describe_histogram!(
            "ondata_dependency_latency_ms",
            Unit::Milliseconds,
            "Outbound call latency in milliseconds."
        );
        describe_counter!(
            "ondata_producer_chunks_total",
            Unit::Count,
            "Formatted response chunks produced."
        );
    });
}
