//! Runs the background jobs of the skeleton service.
//!
//! Without arguments the scheduler runs every job in a loop until it receives
//! a termination signal. Job names given as arguments are run once, in order,
//! and the process exits.
use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use tokio::net::TcpListener;
use tracing::info;

use graceful::Coordinator;
use skeleton_common::context::ServiceContext;
use skeleton_common::{logging, metrics, SCHEDULER_HEALTH_SUBJECT};
use skeleton_scheduler::config::Config;
use skeleton_scheduler::jobs::{ActiveUsersJob, JobSpec};
use skeleton_scheduler::{Scheduler, SchedulerSettings};

const SERVICE_NAME: &str = "scheduler";
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env().wrap_err("failed to load configuration from env")?;
    logging::setup_tracing(config.environment)?;
    config.validate().wrap_err("invalid configuration")?;

    let run_once: Vec<String> = std::env::args().skip(1).collect();

    info!(
        version = VERSION,
        environment = %config.environment,
        "starting skeleton scheduler"
    );

    let recorder = if config.export_prometheus && run_once.is_empty() {
        Some(metrics::setup_metrics_recorder()?)
    } else {
        None
    };

    let context = ServiceContext::connect(
        SERVICE_NAME,
        VERSION,
        &config.database,
        &config.nats,
        SCHEDULER_HEALTH_SUBJECT,
    )
    .await?;

    let mut scheduler = Scheduler::new(
        context.clone(),
        SchedulerSettings {
            verbose_jobs: config.debug_jobs,
            stats_interval: config.jobs.stats_interval.0,
            startup_delay: config.jobs.startup_delay.0,
        },
    );
    scheduler.register(
        JobSpec::from_config(ActiveUsersJob::NAME, &config.jobs),
        ActiveUsersJob::new(context.users()),
    )?;

    if !run_once.is_empty() {
        let result = scheduler.run_jobs_once(&run_once).await;
        context.close().await;
        result?;
        info!(jobs = ?run_once, "jobs done");
        return Ok(());
    }

    let listener = TcpListener::bind(config.bind())
        .await
        .wrap_err_with(|| format!("failed to bind {}", config.bind()))?;
    let coordinator = Coordinator::new(config.shutdown_timeout.0).with_name(SERVICE_NAME);

    let running = scheduler.start(coordinator, listener, recorder)?;
    running.run().await;

    info!("skeleton scheduler exited");
    Ok(())
}
