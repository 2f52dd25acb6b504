use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::Environment;

/// Installs the global subscriber: human readable output when running
/// locally, JSON lines anywhere else. The level comes from `RUST_LOG`,
/// `info` when unset.
pub fn setup_tracing(environment: Environment) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let log_layer = {
        let base_layer = fmt::layer().with_target(true).with_level(true);

        if environment.is_local() {
            base_layer.with_ansi(true).with_filter(filter).boxed()
        } else {
            base_layer
                .json()
                .flatten_event(true)
                .with_current_span(false)
                .with_filter(filter)
                .boxed()
        }
    };

    tracing_subscriber::registry().with(log_layer).try_init()
}
