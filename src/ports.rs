//! Seams between the deployment engine and the outside world.
//!
//! Each trait has one production implementation (`ReleaseDb`, `GitHubClient`,
//! the Docker adapters) and deterministic fakes used in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::error::{ManifestError, OrchestratorError};
use crate::models::deployment::{
    Environment, EnvironmentState, HistoryEntry, HistoryFilter, HistoryStatus,
};
use crate::models::health::ServiceHealth;
use crate::models::manifest::Manifest;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[async_trait]
pub trait ManifestFetcher: Send + Sync {
    async fn fetch(&self, path: &str) -> Result<Manifest, ManifestError>;
}

/// Applies a whole stack in one call. Implementations may block; the engine
/// runs them on the blocking pool.
pub trait ContainerOrchestrator: Send + Sync {
    fn deploy_stack(
        &self,
        environment: Environment,
        services: &BTreeMap<String, String>,
    ) -> Result<(), OrchestratorError>;
}

/// Must return exactly one entry per requested service, using `unknown` for
/// services it cannot resolve.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(
        &self,
        environment: Environment,
        services: &[String],
    ) -> anyhow::Result<Vec<ServiceHealth>>;
}

pub trait EnvironmentRepository: Send + Sync {
    fn get_environment(&self, environment: Environment) -> anyhow::Result<Option<EnvironmentState>>;

    fn get_all_environments(&self) -> anyhow::Result<BTreeMap<Environment, EnvironmentState>>;

    fn record_deployment(
        &self,
        environment: Environment,
        service_name: &str,
        version: &str,
        commit_sha: &str,
        deployed_at: DateTime<Utc>,
        deployed_by: &str,
    ) -> anyhow::Result<()>;
}

pub trait HistoryRepository: Send + Sync {
    fn start_history(
        &self,
        environment: Environment,
        service_name: &str,
        version: &str,
        commit_sha: &str,
        deployed_by: &str,
        started_at: DateTime<Utc>,
    ) -> anyhow::Result<i64>;

    fn complete_history(
        &self,
        history_id: i64,
        status: HistoryStatus,
        completed_at: DateTime<Utc>,
        duration_seconds: f64,
        error_message: Option<&str>,
    ) -> anyhow::Result<()>;

    fn fetch_history(&self, history_id: i64) -> anyhow::Result<Option<HistoryEntry>>;

    fn list_history_for_started_at(
        &self,
        environment: Environment,
        started_at: DateTime<Utc>,
    ) -> anyhow::Result<Vec<HistoryEntry>>;

    fn list_history(
        &self,
        filter: &HistoryFilter,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<(Vec<HistoryEntry>, i64)>;
}

pub trait HealthRepository: Send + Sync {
    fn store(&self, health: &ServiceHealth) -> anyhow::Result<()>;

    fn list(&self, environment: Option<Environment>) -> anyhow::Result<Vec<ServiceHealth>>;
}
