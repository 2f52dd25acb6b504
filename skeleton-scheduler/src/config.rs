use envconfig::Envconfig;

use skeleton_common::config::{ConfigError, DatabaseConfig, EnvMsDuration, Environment, NatsConfig};

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,

    #[envconfig(from = "ENVIRONMENT", default = "local")]
    pub environment: Environment,

    #[envconfig(from = "SHUTDOWN_TIMEOUT_MS", default = "30000")]
    pub shutdown_timeout: EnvMsDuration,

    #[envconfig(from = "EXPORT_PROMETHEUS", default = "false")]
    pub export_prometheus: bool,

    /// Log job runs at info instead of trace.
    #[envconfig(from = "DEBUG_JOBS", default = "false")]
    pub debug_jobs: bool,

    #[envconfig(nested = true)]
    pub jobs: JobsConfig,

    #[envconfig(nested = true)]
    pub database: DatabaseConfig,

    #[envconfig(nested = true)]
    pub nats: NatsConfig,
}

#[derive(Envconfig, Clone, Debug)]
pub struct JobsConfig {
    /// Pause between two runs of a job that succeeded.
    #[envconfig(from = "JOB_INTERVAL_MS", default = "60000")]
    pub interval: EnvMsDuration,

    #[envconfig(from = "JOB_WAIT_AFTER_ERROR_MS", default = "10000")]
    pub wait_after_error: EnvMsDuration,

    #[envconfig(from = "JOB_TIMEOUT_MS", default = "30000")]
    pub timeout: EnvMsDuration,

    /// Delay before the first run of every job.
    #[envconfig(from = "JOB_STARTUP_DELAY_MS", default = "5000")]
    pub startup_delay: EnvMsDuration,

    #[envconfig(from = "JOB_STATS_INTERVAL_MS", default = "60000")]
    pub stats_interval: EnvMsDuration,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::Empty("BIND_HOST"));
        }
        if self.shutdown_timeout.0.is_zero() {
            return Err(ConfigError::Zero("SHUTDOWN_TIMEOUT_MS"));
        }
        for (name, value) in [
            ("JOB_INTERVAL_MS", self.jobs.interval),
            ("JOB_WAIT_AFTER_ERROR_MS", self.jobs.wait_after_error),
            ("JOB_TIMEOUT_MS", self.jobs.timeout),
            ("JOB_STATS_INTERVAL_MS", self.jobs.stats_interval),
        ] {
            if value.0.is_zero() {
                return Err(ConfigError::Zero(name));
            }
        }
        self.database.validate()?;
        self.nats.validate()
    }
}
