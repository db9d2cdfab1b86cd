use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::models::health::HealthStatus;

pub const SYSTEM_ACTOR: &str = "system";
pub const MANUAL_ACTOR: &str = "manual";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Preprod,
    Prod,
}

impl Environment {
    pub const ALL: [Environment; 2] = [Environment::Prod, Environment::Preprod];

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Preprod => "preprod",
            Environment::Prod => "prod",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "preprod" => Ok(Environment::Preprod),
            "prod" => Ok(Environment::Prod),
            other => anyhow::bail!("unknown environment: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    RolledBack,
}

impl HistoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryStatus::Pending => "pending",
            HistoryStatus::InProgress => "in_progress",
            HistoryStatus::Success => "success",
            HistoryStatus::Failed => "failed",
            HistoryStatus::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for HistoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HistoryStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(HistoryStatus::Pending),
            "in_progress" => Ok(HistoryStatus::InProgress),
            "success" => Ok(HistoryStatus::Success),
            "failed" => Ok(HistoryStatus::Failed),
            "rolled_back" => Ok(HistoryStatus::RolledBack),
            other => anyhow::bail!("unknown history status: {other}"),
        }
    }
}

/// Latest known-good version of one service in one environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: i64,
    pub environment: Environment,
    pub service_name: String,
    pub version: String,
    pub commit_sha: String,
    pub deployed_at: DateTime<Utc>,
    pub deployed_by: String,
}

/// One service's participation in one deployment attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub environment: Environment,
    pub service_name: String,
    pub version: String,
    pub commit_sha: String,
    pub status: HistoryStatus,
    pub deployed_by: String,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentState {
    pub commit_sha: String,
    pub deployed_at: DateTime<Utc>,
    pub services: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceOutcome {
    pub history_id: i64,
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_status: Option<HealthStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<HistoryStatus>,
}

/// Outcome of a deployment group, as returned by deploy and status lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentStatus {
    pub deployment_id: i64,
    pub environment: Environment,
    pub status: HistoryStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub services_deployed: Vec<ServiceOutcome>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub environment: Option<Environment>,
    pub service: Option<String>,
}

// ── HTTP payloads ──

#[derive(Debug, Deserialize)]
pub struct DeployProdRequest {
    #[serde(default)]
    pub confirm: bool,
    pub services: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct RollbackRequest {
    #[serde(default)]
    pub confirm: bool,
    pub deployment_history_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub environment: Option<String>,
    pub service: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}
