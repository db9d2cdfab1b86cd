use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::models::deployment::Environment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(HealthStatus::Healthy),
            "unhealthy" => Ok(HealthStatus::Unhealthy),
            "unknown" => Ok(HealthStatus::Unknown),
            other => anyhow::bail!("unknown health status: {other}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub environment: Environment,
    pub service_name: String,
    pub status: HealthStatus,
    pub replicas_running: Option<i64>,
    pub replicas_desired: Option<i64>,
    pub last_checked: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl ServiceHealth {
    /// Placeholder for a service whose health could not be determined.
    pub fn unknown(
        environment: Environment,
        service_name: &str,
        last_checked: DateTime<Utc>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            environment,
            service_name: service_name.to_string(),
            status: HealthStatus::Unknown,
            replicas_running: None,
            replicas_desired: None,
            last_checked,
            error_message: Some(error_message.into()),
        }
    }
}
