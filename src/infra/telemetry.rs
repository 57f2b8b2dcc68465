use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder().parse_lossy(&logging.level);

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
            "spurgo_targets_enqueued_total",
            Unit::Count,
            "Total number of purge targets fanned out into the URL queue."
        );
        describe_counter!(
            "spurgo_targets_purged_total",
            Unit::Count,
            "Total number of targets acknowledged by the purge client."
        );
        describe_counter!(
            "spurgo_purge_failures_total",
            Unit::Count,
            "Total number of failed purge-client calls."
        );
        describe_histogram!(
            "spurgo_expand_drain_ms",
            Unit::Milliseconds,
            "Duration of one object-queue expansion drain."
        );
        describe_histogram!(
            "spurgo_url_drain_ms",
            Unit::Milliseconds,
            "Duration of one URL-queue drain."
        );
    });
}
