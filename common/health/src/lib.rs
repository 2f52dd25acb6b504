use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

mod runner;

pub use runner::run_all;

/// Status reporting for the dependencies of a service.
///
/// A status page is built from a list of keyed probes: each probe checks one
/// dependency (a database, a fleet of service replicas, the local process)
/// and reports a `ProbeResult`. Probes are cheap values, created for a single
/// status request and dropped afterwards.
///
/// Failures never escape a probe: a broken dependency is reported as a
/// `ProbeStatus::Error` result with a human readable `info`, so that the
/// status page can always render the full picture.

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    /// Not checked yet, cancelled, or reported with a status we don't know
    #[default]
    Unknown,
    Error,
    Warning,
    Healthy,
}

impl ProbeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeStatus::Unknown => "unknown",
            ProbeStatus::Error => "error",
            ProbeStatus::Warning => "warning",
            ProbeStatus::Healthy => "healthy",
        }
    }
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsing never fails: anything we don't recognise is `Unknown`.
impl FromStr for ProbeStatus {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "error" => ProbeStatus::Error,
            "warning" => ProbeStatus::Warning,
            "healthy" => ProbeStatus::Healthy,
            _ => ProbeStatus::Unknown,
        })
    }
}

impl<'de> Deserialize<'de> for ProbeStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let status = String::deserialize(deserializer)?;
        Ok(status.parse().unwrap_or_default())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("a healthy probe result must report at least one instance")]
pub struct InvalidProbeResult;

/// Outcome of a single probe run.
///
/// A result reporting zero instances is never healthy: constructors and
/// deserialization both enforce it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawProbeResult")]
pub struct ProbeResult {
    status: ProbeStatus,
    info: String,
    instance_count: u32,
}

#[derive(Deserialize)]
struct RawProbeResult {
    #[serde(default)]
    status: ProbeStatus,
    #[serde(default)]
    info: String,
    #[serde(default)]
    instance_count: u32,
}

impl TryFrom<RawProbeResult> for ProbeResult {
    type Error = InvalidProbeResult;

    fn try_from(raw: RawProbeResult) -> Result<Self, Self::Error> {
        if raw.status == ProbeStatus::Healthy && raw.instance_count == 0 {
            return Err(InvalidProbeResult);
        }
        Ok(Self {
            status: raw.status,
            info: raw.info,
            instance_count: raw.instance_count,
        })
    }
}

impl ProbeResult {
    /// A single healthy instance.
    pub fn healthy(info: impl Into<String>) -> Self {
        Self {
            status: ProbeStatus::Healthy,
            info: info.into(),
            instance_count: 1,
        }
    }

    /// Healthy if at least one instance answered, an error otherwise.
    pub fn healthy_instances(info: impl Into<String>, instance_count: u32) -> Self {
        let status = if instance_count == 0 {
            ProbeStatus::Error
        } else {
            ProbeStatus::Healthy
        };
        Self {
            status,
            info: info.into(),
            instance_count,
        }
    }

    pub fn warning(info: impl Into<String>) -> Self {
        Self {
            status: ProbeStatus::Warning,
            info: info.into(),
            instance_count: 0,
        }
    }

    pub fn error(info: impl Into<String>) -> Self {
        Self {
            status: ProbeStatus::Error,
            info: info.into(),
            instance_count: 0,
        }
    }

    pub fn unknown(info: impl Into<String>) -> Self {
        Self {
            status: ProbeStatus::Unknown,
            info: info.into(),
            instance_count: 0,
        }
    }

    pub fn status(&self) -> ProbeStatus {
        self.status
    }

    pub fn info(&self) -> &str {
        &self.info
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    pub fn is_healthy(&self) -> bool {
        self.status == ProbeStatus::Healthy
    }
}

/// A unit of health-check logic.
///
/// Implementations are expected to bound their own execution time: the
/// runner waits for every probe to return.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn run(&self) -> ProbeResult;
}

/// A probe result tagged with the key it was registered under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyedResult {
    pub key: String,
    #[serde(flatten)]
    pub result: ProbeResult,
}
