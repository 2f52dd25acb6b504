use std::convert::Infallible;
use std::str::FromStr;

use axum::http::HeaderValue;
use envconfig::Envconfig;

use skeleton_common::config::{ConfigError, DatabaseConfig, EnvMsDuration, Environment, NatsConfig};

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3300")]
    pub port: u16,

    #[envconfig(from = "ENVIRONMENT", default = "local")]
    pub environment: Environment,

    #[envconfig(from = "SHUTDOWN_TIMEOUT_MS", default = "10000")]
    pub shutdown_timeout: EnvMsDuration,

    /// How long the status page listens for health replies.
    #[envconfig(from = "STATUS_REPLY_WINDOW_MS", default = "1000")]
    pub status_reply_window: EnvMsDuration,

    #[envconfig(from = "EXPORT_PROMETHEUS", default = "false")]
    pub export_prometheus: bool,

    /// Comma separated origins allowed to call the API from a browser.
    /// `*` allows any origin.
    #[envconfig(from = "ALLOWED_ORIGINS", default = "")]
    pub allowed_origins: AllowedOrigins,

    #[envconfig(nested = true)]
    pub database: DatabaseConfig,

    #[envconfig(nested = true)]
    pub nats: NatsConfig,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllowedOrigins(pub Vec<String>);

impl FromStr for AllowedOrigins {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(AllowedOrigins(
            s.split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(str::to_owned)
                .collect(),
        ))
    }
}

impl AllowedOrigins {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for origin in &self.0 {
            HeaderValue::from_str(origin).map_err(|err| ConfigError::Invalid {
                name: "ALLOWED_ORIGINS",
                reason: format!("{origin:?}: {err}"),
            })?;
        }
        Ok(())
    }
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
        if self.status_reply_window.0.is_zero() {
            return Err(ConfigError::Zero("STATUS_REPLY_WINDOW_MS"));
        }
        self.allowed_origins.validate()?;
        self.database.validate()?;
        self.nats.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    #[test]
    fn defaults() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();

        assert_eq!(config.bind(), "0.0.0.0:3300");
        assert_eq!(config.environment, Environment::Local);
        assert_eq!(config.shutdown_timeout.0, Duration::from_secs(10));
        assert_eq!(config.status_reply_window.0, Duration::from_secs(1));
        assert!(!config.export_prometheus);
        assert!(config.nats.nats_url.is_none());
        assert!(config.allowed_origins.0.is_empty());
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn reads_allowed_origins() {
        let env = HashMap::from([(
            "ALLOWED_ORIGINS".to_owned(),
            "https://app.example.com, http://localhost:3000,".to_owned(),
        )]);
        let config = Config::init_from_hashmap(&env).unwrap();

        assert_eq!(
            config.allowed_origins.0,
            vec!["https://app.example.com", "http://localhost:3000"]
        );
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn rejects_unprintable_origins() {
        let env = HashMap::from([(
            "ALLOWED_ORIGINS".to_owned(),
            "https://app.example.com\u{7f}".to_owned(),
        )]);
        let config = Config::init_from_hashmap(&env).unwrap();

        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                name: "ALLOWED_ORIGINS",
                ..
            })
        ));
    }

    #[test]
    fn reads_nested_sections() {
        let env = HashMap::from([
            ("ENVIRONMENT".to_owned(), "production".to_owned()),
            ("BIND_PORT".to_owned(), "8080".to_owned()),
            ("NATS_URL".to_owned(), "nats://nats:4222".to_owned()),
            ("MAX_PG_CONNECTIONS".to_owned(), "4".to_owned()),
        ]);
        let config = Config::init_from_hashmap(&env).unwrap();

        assert!(config.environment.is_production());
        assert_eq!(config.port, 8080);
        assert_eq!(config.nats.nats_url.as_deref(), Some("nats://nats:4222"));
        assert_eq!(config.database.max_pg_connections, 4);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn rejects_zero_timeouts() {
        let env = HashMap::from([("SHUTDOWN_TIMEOUT_MS".to_owned(), "0".to_owned())]);
        let config = Config::init_from_hashmap(&env).unwrap();
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero("SHUTDOWN_TIMEOUT_MS"))
        );
    }

    #[test]
    fn rejects_unknown_environment() {
        let env = HashMap::from([("ENVIRONMENT".to_owned(), "staging".to_owned())]);
        assert!(Config::init_from_hashmap(&env).is_err());
    }
}
