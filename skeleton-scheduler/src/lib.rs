pub mod config;
pub mod handlers;
pub mod jobs;
pub mod scheduler;

pub use scheduler::{RunningScheduler, Scheduler, SchedulerError, SchedulerSettings};
