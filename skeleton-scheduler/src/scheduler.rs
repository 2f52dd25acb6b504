use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics_exporter_prometheus::PrometheusHandle;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, trace, warn};

use graceful::{
    Coordinator, Deadline, GracefulError, ShutdownPhase, ShutdownTrigger, ShutdownWait,
};
use skeleton_common::context::ServiceContext;

use crate::handlers;
use crate::jobs::{Job, JobError, JobSnapshot, JobSpec, JobStats};

const JOB_RUNS: &str = "scheduler_job_runs_total";
const JOB_DURATION_SECONDS: &str = "scheduler_job_duration_seconds";
const JOBS_RUNNING: &str = "scheduler_jobs_running";

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("unknown job {0:?}")]
    UnknownJob(String),
    #[error("job {0:?} is already registered")]
    DuplicateJob(String),
    #[error("job {name} failed: {error}")]
    JobFailed {
        name: String,
        #[source]
        error: JobError,
    },
    #[error("failed to read the listener address: {0}")]
    LocalAddr(io::Error),
    #[error(transparent)]
    Shutdown(#[from] GracefulError),
    #[error("http server failed: {0}")]
    Serve(io::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    /// Log job runs at info rather than trace.
    pub verbose_jobs: bool,
    pub stats_interval: Duration,
    pub startup_delay: Duration,
}

struct RegisteredJob {
    spec: JobSpec,
    job: Arc<dyn Job>,
    stats: JobStats,
}

type Jobs = Arc<Vec<Arc<RegisteredJob>>>;

/// Runs registered jobs in independent loops until shutdown.
pub struct Scheduler {
    context: ServiceContext,
    settings: SchedulerSettings,
    jobs: Vec<Arc<RegisteredJob>>,
}

impl Scheduler {
    pub fn new(context: ServiceContext, settings: SchedulerSettings) -> Self {
        Self {
            context,
            settings,
            jobs: Vec::new(),
        }
    }

    pub fn register<J: Job>(&mut self, spec: JobSpec, job: J) -> Result<(), SchedulerError> {
        if self.jobs.iter().any(|j| j.spec.name == spec.name) {
            return Err(SchedulerError::DuplicateJob(spec.name));
        }
        self.jobs.push(Arc::new(RegisteredJob {
            spec,
            job: Arc::new(job),
            stats: JobStats::default(),
        }));
        Ok(())
    }

    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.iter().map(|j| j.spec.name.as_str()).collect()
    }

    pub fn stats(&self) -> Vec<JobSnapshot> {
        snapshots(&self.jobs)
    }

    /// Runs each named job once, in order, and stops at the first failure.
    /// Names are all checked before anything runs.
    pub async fn run_jobs_once(&self, names: &[String]) -> Result<(), SchedulerError> {
        let selected = names
            .iter()
            .map(|name| {
                self.jobs
                    .iter()
                    .find(|j| &j.spec.name == name)
                    .cloned()
                    .ok_or_else(|| SchedulerError::UnknownJob(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(jobs = ?names, "scheduler: running jobs once");
        for job in selected {
            execute(&job, self.settings.verbose_jobs)
                .await
                .map_err(|error| SchedulerError::JobFailed {
                    name: job.spec.name.clone(),
                    error,
                })?;
        }
        Ok(())
    }

    /// Starts the job loops and the health server on `listener`.
    pub fn start(
        self,
        coordinator: Coordinator,
        listener: TcpListener,
        metrics: Option<PrometheusHandle>,
    ) -> Result<RunningScheduler, SchedulerError> {
        let local_addr = listener.local_addr().map_err(SchedulerError::LocalAddr)?;
        let jobs: Jobs = Arc::new(self.jobs);
        let stop = CancellationToken::new();
        let tracker = TaskTracker::new();
        let (server_sender, server_receiver) = oneshot::channel();

        let (wait, trigger) = coordinator.start({
            let stop = stop.clone();
            let tracker = tracker.clone();
            let jobs = jobs.clone();
            let context = self.context.clone();
            move |deadline| teardown(deadline, stop, tracker, jobs, server_receiver, context)
        })?;

        for job in jobs.iter() {
            tracker.spawn(job_loop(job.clone(), self.settings, stop.clone()));
        }
        tracker.spawn(stats_loop(
            jobs.clone(),
            self.settings.stats_interval,
            stop.clone(),
        ));

        let app = handlers::app(stop.clone(), metrics);
        let server_trigger = trigger.clone();
        let stopped = stop.clone();
        let server: JoinHandle<io::Result<()>> = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { stopped.cancelled().await })
                .await;
            if let Err(err) = &result {
                error!(error = %err, "scheduler: http server failed");
            }
            server_trigger.trigger();
            result
        });
        if let Err(server) = server_sender.send(server) {
            server.abort();
        }

        info!(
            jobs = jobs.len(),
            address = %local_addr,
            "scheduler started jobs"
        );

        Ok(RunningScheduler {
            local_addr,
            jobs,
            wait,
            trigger,
        })
    }
}

/// Handle on a started [`Scheduler`].
pub struct RunningScheduler {
    local_addr: SocketAddr,
    jobs: Jobs,
    wait: ShutdownWait,
    trigger: ShutdownTrigger,
}

impl RunningScheduler {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Vec<JobSnapshot> {
        snapshots(&self.jobs)
    }

    pub fn phase(&self) -> ShutdownPhase {
        self.wait.phase()
    }

    /// Blocks until the scheduler has shut down.
    pub async fn run(&self) {
        self.wait.wait().await
    }

    pub async fn stop(&self) {
        let started = Instant::now();
        self.trigger.trigger();
        self.wait.wait().await;
        info!(
            duration_ms = started.elapsed().as_millis() as u64,
            "scheduler: stopped"
        );
    }
}

fn snapshots(jobs: &[Arc<RegisteredJob>]) -> Vec<JobSnapshot> {
    jobs.iter()
        .map(|j| j.stats.snapshot(&j.spec.name))
        .collect()
}

async fn job_loop(job: Arc<RegisteredJob>, settings: SchedulerSettings, stop: CancellationToken) {
    job.stats.set_started(true);

    tokio::select! {
        _ = stop.cancelled() => {}
        _ = tokio::time::sleep(settings.startup_delay) => {
            while !stop.is_cancelled() {
                let pause = match execute(&job, settings.verbose_jobs).await {
                    Ok(()) => job.spec.wait_after_success,
                    Err(_) => job.spec.wait_after_error,
                };
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }
    }

    job.stats.set_started(false);
}

/// Runs the job once under its timeout. Panics and timeouts are reported as
/// errors of the run.
async fn execute(job: &Arc<RegisteredJob>, verbose: bool) -> Result<(), JobError> {
    let name = job.spec.name.as_str();
    if verbose {
        info!(job = name, "starting job");
    } else {
        trace!(job = name, "starting job");
    }

    job.stats.begin_run();
    metrics::gauge!(JOBS_RUNNING, "job" => name.to_owned()).set(1.0);
    let started = Instant::now();

    let runner = job.job.clone();
    let handle = tokio::spawn(async move { runner.run().await });
    let abort = handle.abort_handle();
    let result = match tokio::time::timeout(job.spec.timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) if err.is_panic() => Err(JobError::Panicked(panic_reason(err.into_panic()))),
        Ok(Err(err)) => Err(JobError::Failed(err.to_string())),
        Err(_) => {
            abort.abort();
            Err(JobError::Timeout(job.spec.timeout))
        }
    };

    let duration = started.elapsed();
    job.stats.end_run(result.is_ok());
    metrics::gauge!(JOBS_RUNNING, "job" => name.to_owned()).set(0.0);
    metrics::histogram!(JOB_DURATION_SECONDS, "job" => name.to_owned())
        .record(duration.as_secs_f64());

    match &result {
        Ok(()) => {
            metrics::counter!(JOB_RUNS, "job" => name.to_owned(), "outcome" => "success")
                .increment(1);
            let duration_ms = duration.as_millis() as u64;
            if verbose {
                info!(job = name, duration_ms, "job finished successfully");
            } else {
                trace!(job = name, duration_ms, "job finished successfully");
            }
        }
        Err(err) => {
            metrics::counter!(JOB_RUNS, "job" => name.to_owned(), "outcome" => "error")
                .increment(1);
            error!(
                job = name,
                duration_ms = duration.as_millis() as u64,
                error = %err,
                "job failed"
            );
        }
    }

    result
}

fn panic_reason(payload: Box<dyn Any + Send>) -> String {
    if let Some(reason) = payload.downcast_ref::<&str>() {
        (*reason).to_owned()
    } else if let Some(reason) = payload.downcast_ref::<String>() {
        reason.clone()
    } else {
        "unknown panic".to_owned()
    }
}

async fn stats_loop(jobs: Jobs, interval: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                for job in snapshots(&jobs) {
                    info!(
                        job = %job.name,
                        started = job.started,
                        running = job.running,
                        last_run = ?job.last_run,
                        runs = job.runs,
                        success_runs = job.success_runs,
                        error_runs = job.error_runs,
                        "scheduler statistics"
                    );
                }
            }
        }
    }
}

async fn teardown(
    deadline: Deadline,
    stop: CancellationToken,
    tracker: TaskTracker,
    jobs: Jobs,
    server: oneshot::Receiver<JoinHandle<io::Result<()>>>,
    context: ServiceContext,
) -> Result<(), SchedulerError> {
    info!("scheduler: stopping jobs");
    stop.cancel();
    tracker.close();

    if deadline.run(tracker.wait()).await.is_ok() {
        info!("all scheduler jobs stopped");
    } else {
        let running: Vec<&str> = jobs
            .iter()
            .filter(|j| j.stats.is_running())
            .map(|j| j.spec.name.as_str())
            .collect();
        warn!(jobs = ?running, "scheduler: jobs still running at the deadline");
    }

    let mut result = Ok(());
    if let Ok(server) = server.await {
        let abort = server.abort_handle();
        match deadline.run(server).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => result = Err(SchedulerError::Serve(err)),
            Ok(Err(err)) => warn!(error = %err, "scheduler: http server task failed"),
            Err(_) => abort.abort(),
        }
    }

    context.close().await;
    result
}
