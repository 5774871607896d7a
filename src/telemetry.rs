use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};
use crate::error::CacheError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), CacheError> {
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
        .map_err(|err| CacheError::telemetry(format!("failed to install tracing subscriber: {err}")))
}

/// Registers descriptions for every metric the cache emits. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "cache_machine_fetch_hit_total",
            Unit::Count,
            "Fetches served from the content store."
        );
        describe_counter!(
            "cache_machine_fetch_miss_total",
            Unit::Count,
            "Fetches that computed and stored a value."
        );
        describe_counter!(
            "cache_machine_fetch_bypass_total",
            Unit::Count,
            "Fetches computed uncached because expires_at had passed."
        );
        describe_counter!(
            "cache_machine_keys_deleted_total",
            Unit::Count,
            "Content keys deleted by invalidation."
        );
        describe_counter!(
            "cache_machine_timestamps_reset_total",
            Unit::Count,
            "Timestamp tokens reset."
        );
        describe_counter!(
            "cache_machine_map_rebuild_total",
            Unit::Count,
            "Association maps rebuilt from the record source."
        );
        describe_histogram!(
            "cache_machine_invalidation_ms",
            Unit::Milliseconds,
            "Invalidation latency per lifecycle event in milliseconds."
        );
    });
}
