use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install the global tracing subscriber and describe the service metrics.
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
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "keystash_store_commands_total",
            Unit::Count,
            "Store commands committed, labelled by operation."
        );
        describe_counter!(
            "keystash_chunks_committed_total",
            Unit::Count,
            "Payload chunks committed by the splitter."
        );
        describe_counter!(
            "keystash_expiry_fired_total",
            Unit::Count,
            "TTL timers that claimed their entry."
        );
        describe_gauge!(
            "keystash_event_queue_len",
            Unit::Count,
            "Store events waiting for the projection consumer."
        );
        describe_histogram!(
            "keystash_projection_consume_ms",
            Unit::Milliseconds,
            "Projection batch latency in milliseconds."
        );
        describe_counter!(
            "keystash_bulk_delete_batches_total",
            Unit::Count,
            "Bulk delete batches executed, labelled by outcome."
        );
    });
}
