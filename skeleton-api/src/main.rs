use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use tracing::info;

use graceful::Coordinator;
use skeleton_api::config::Config;
use skeleton_api::handlers::{AppState, StatusSettings};
use skeleton_api::Api;
use skeleton_common::context::ServiceContext;
use skeleton_common::{logging, metrics, API_HEALTH_SUBJECT};

const SERVICE_NAME: &str = "api";
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env().wrap_err("failed to load configuration from env")?;
    logging::setup_tracing(config.environment)?;
    config.validate().wrap_err("invalid configuration")?;

    info!(
        version = VERSION,
        environment = %config.environment,
        "starting skeleton api"
    );

    let recorder = if config.export_prometheus {
        Some(metrics::setup_metrics_recorder()?)
    } else {
        None
    };

    let context = ServiceContext::connect(
        SERVICE_NAME,
        VERSION,
        &config.database,
        &config.nats,
        API_HEALTH_SUBJECT,
    )
    .await?;

    let state = AppState::new(
        context,
        StatusSettings {
            probe_timeout: config.database.probe_timeout.0,
            reply_window: config.status_reply_window.0,
        },
    )
    .with_allowed_origins(config.allowed_origins.0.clone());
    let coordinator = Coordinator::new(config.shutdown_timeout.0).with_name(SERVICE_NAME);

    let api = Api::start(&config.bind(), coordinator, state, recorder).await?;
    api.run().await;

    info!("skeleton api exited");
    Ok(())
}
