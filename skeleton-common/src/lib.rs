pub mod config;
pub mod context;
pub mod database;
pub mod logging;
pub mod messaging;
pub mod metrics;
pub mod probes;
pub mod status_page;
pub mod subscriber;

/// Subject the API replicas answer health pings on.
pub const API_HEALTH_SUBJECT: &str = "api.health";
/// Subject the scheduler replicas answer health pings on.
pub const SCHEDULER_HEALTH_SUBJECT: &str = "scheduler.health";
