use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use skeleton_common::database::UserStore;

use crate::config::JobsConfig;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("panicked: {0}")]
    Panicked(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Failed(String),
}

/// A unit of periodic background work.
///
/// The scheduler calls `run` in a loop, pausing between two runs. A run is
/// bounded by the timeout of its [`JobSpec`], and may be abandoned when it
/// exceeds it.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    async fn run(&self) -> Result<(), JobError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub name: String,
    pub timeout: Duration,
    pub wait_after_success: Duration,
    pub wait_after_error: Duration,
}

impl JobSpec {
    /// A job following the configured defaults.
    pub fn from_config(name: &str, config: &JobsConfig) -> Self {
        Self {
            name: name.to_owned(),
            timeout: config.timeout.0,
            wait_after_success: config.interval.0,
            wait_after_error: config.wait_after_error.0,
        }
    }
}

/// Run counters of a single job, updated by the scheduler.
#[derive(Debug, Default)]
pub struct JobStats {
    started: AtomicBool,
    running: AtomicBool,
    success_runs: AtomicU64,
    error_runs: AtomicU64,
    last_run: Mutex<Option<DateTime<Utc>>>,
}

impl JobStats {
    pub(crate) fn set_started(&self, started: bool) {
        self.started.store(started, Ordering::SeqCst);
    }

    pub(crate) fn begin_run(&self) {
        self.running.store(true, Ordering::SeqCst);
        *self.last_run.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
    }

    pub(crate) fn end_run(&self, success: bool) {
        if success {
            self.success_runs.fetch_add(1, Ordering::SeqCst);
        } else {
            self.error_runs.fetch_add(1, Ordering::SeqCst);
        }
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self, name: &str) -> JobSnapshot {
        let success_runs = self.success_runs.load(Ordering::SeqCst);
        let error_runs = self.error_runs.load(Ordering::SeqCst);
        JobSnapshot {
            name: name.to_owned(),
            started: self.started.load(Ordering::SeqCst),
            running: self.is_running(),
            last_run: *self.last_run.lock().unwrap_or_else(|e| e.into_inner()),
            runs: success_runs + error_runs,
            success_runs,
            error_runs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSnapshot {
    pub name: String,
    pub started: bool,
    pub running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub runs: u64,
    pub success_runs: u64,
    pub error_runs: u64,
}

/// Publishes the number of active users as a gauge.
pub struct ActiveUsersJob {
    users: UserStore,
}

impl ActiveUsersJob {
    pub const NAME: &'static str = "count-active-users";

    pub fn new(users: UserStore) -> Self {
        Self { users }
    }
}

#[async_trait]
impl Job for ActiveUsersJob {
    async fn run(&self) -> Result<(), JobError> {
        let active = self.users.count_active().await?;
        debug!(active, "counted active users");
        metrics::gauge!("skeleton_active_users").set(active as f64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skeleton_common::database::NewUser;
    use sqlx::PgPool;

    #[test]
    fn snapshot_counts_runs() {
        let stats = JobStats::default();
        stats.set_started(true);
        stats.begin_run();
        assert!(stats.is_running());
        stats.end_run(true);
        stats.begin_run();
        stats.end_run(false);
        stats.begin_run();
        stats.end_run(true);

        let snapshot = stats.snapshot("job");
        assert_eq!(snapshot.runs, 3);
        assert_eq!(snapshot.success_runs, 2);
        assert_eq!(snapshot.error_runs, 1);
        assert!(snapshot.started);
        assert!(!snapshot.running);
        assert!(snapshot.last_run.is_some());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn active_users_job_queries_the_database(db: PgPool) {
        let users = UserStore::new(db.clone());
        users
            .insert(NewUser {
                email: "job@example.com".to_owned(),
                firstname: "Job".to_owned(),
                lastname: "Runner".to_owned(),
            })
            .await
            .unwrap();

        ActiveUsersJob::new(users).run().await.unwrap();

        db.close().await;
        let closed = ActiveUsersJob::new(UserStore::new(db)).run().await;
        assert!(matches!(closed, Err(JobError::Database(_))));
    }
}
