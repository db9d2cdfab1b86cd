use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::diff::compute_diff;
use crate::error::{EngineError, OrchestratorError};
use crate::health::HealthService;
use crate::models::deployment::{
    DeploymentStatus, Environment, EnvironmentState, HistoryEntry, HistoryFilter, HistoryStatus,
    ServiceOutcome,
};
use crate::models::diff::ServiceDiff;
use crate::models::health::HealthStatus;
use crate::ports::{Clock, ContainerOrchestrator, EnvironmentRepository, HistoryRepository};

const SKIPPED_MESSAGE: &str = "Skipped due to earlier failure";

/// Drives deploy-then-verify workflows against the container platform.
///
/// At most one deployment runs at a time across *all* environments. A second
/// caller is rejected immediately rather than queued.
pub struct DeploymentEngine {
    environments: Arc<dyn EnvironmentRepository>,
    history: Arc<dyn HistoryRepository>,
    orchestrator: Arc<dyn ContainerOrchestrator>,
    health: Arc<HealthService>,
    clock: Arc<dyn Clock>,
    deploy_timeout: Option<Duration>,
    in_flight: Arc<Mutex<Option<Environment>>>,
}

struct HistoryContext {
    history_id: i64,
    service_name: String,
    version: String,
}

type StackTask = JoinHandle<Result<(), OrchestratorError>>;

/// Claim on the engine's single deployment slot. Dropping it frees the slot.
struct DeploySlot {
    in_flight: Arc<Mutex<Option<Environment>>>,
}

impl Drop for DeploySlot {
    fn drop(&mut self) {
        let mut active = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        *active = None;
    }
}

/// Keep the slot claimed until a timed-out stack deploy actually returns, so
/// no second stack call can overlap it.
fn release_after(slot: DeploySlot, environment: Environment, task: StackTask) {
    tokio::spawn(async move {
        match task.await {
            Ok(Ok(())) => tracing::warn!(
                "timed-out stack deploy for {environment} completed after being recorded as failed"
            ),
            Ok(Err(e)) => tracing::warn!("timed-out stack deploy for {environment} failed: {e}"),
            Err(e) => tracing::warn!("timed-out stack deploy for {environment} aborted: {e}"),
        }
        drop(slot);
    });
}

impl DeploymentEngine {
    pub fn new(
        environments: Arc<dyn EnvironmentRepository>,
        history: Arc<dyn HistoryRepository>,
        orchestrator: Arc<dyn ContainerOrchestrator>,
        health: Arc<HealthService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            environments,
            history,
            orchestrator,
            health,
            clock,
            deploy_timeout: None,
            in_flight: Arc::new(Mutex::new(None)),
        }
    }

    /// Bound the wait on the stack deploy call. A timed-out deploy is recorded
    /// as failed; the slot stays claimed until the call itself returns.
    pub fn with_deploy_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.deploy_timeout = timeout;
        self
    }

    pub fn is_deployment_in_progress(&self) -> bool {
        self.active_environment().is_some()
    }

    pub fn active_environment(&self) -> Option<Environment> {
        *self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn claim_slot(&self, environment: Environment) -> Result<DeploySlot, EngineError> {
        let mut active = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = *active {
            return Err(EngineError::ConflictInProgress {
                environment: current,
            });
        }
        *active = Some(environment);
        Ok(DeploySlot {
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    pub async fn deploy_preprod(
        &self,
        commit_sha: &str,
        services: &BTreeMap<String, String>,
        deployed_by: &str,
    ) -> Result<DeploymentStatus, EngineError> {
        self.deploy(Environment::Preprod, services, commit_sha, deployed_by, None)
            .await
    }

    pub async fn deploy_prod(
        &self,
        services: &BTreeMap<String, String>,
        commit_sha: &str,
        deployed_by: &str,
        subset: Option<&[String]>,
    ) -> Result<DeploymentStatus, EngineError> {
        self.deploy(Environment::Prod, services, commit_sha, deployed_by, subset)
            .await
    }

    /// Deploy production from whatever preprod currently runs.
    pub async fn promote(
        &self,
        subset: Option<&[String]>,
        deployed_by: &str,
    ) -> Result<DeploymentStatus, EngineError> {
        let preprod = self
            .environments
            .get_environment(Environment::Preprod)?
            .ok_or(EngineError::NotDeployed(Environment::Preprod))?;
        self.deploy_prod(&preprod.services, &preprod.commit_sha, deployed_by, subset)
            .await
    }

    pub async fn deploy(
        &self,
        environment: Environment,
        target_versions: &BTreeMap<String, String>,
        commit_sha: &str,
        deployed_by: &str,
        subset: Option<&[String]>,
    ) -> Result<DeploymentStatus, EngineError> {
        let slot = self.claim_slot(environment)?;
        let mut pending = None;
        let result = self
            .run_workflow(
                environment,
                target_versions,
                commit_sha,
                deployed_by,
                subset,
                &mut pending,
            )
            .await;
        match pending {
            Some(task) => release_after(slot, environment, task),
            None => drop(slot),
        }
        result
    }

    async fn run_workflow(
        &self,
        environment: Environment,
        target_versions: &BTreeMap<String, String>,
        commit_sha: &str,
        deployed_by: &str,
        subset: Option<&[String]>,
        pending: &mut Option<StackTask>,
    ) -> Result<DeploymentStatus, EngineError> {
        let selected = select_services(target_versions, subset)?;

        let started_at = self.clock.now();
        let records = self.start_history(
            environment,
            &selected,
            target_versions,
            commit_sha,
            deployed_by,
            started_at,
        )?;

        let stack: BTreeMap<String, String> = records
            .iter()
            .map(|r| (r.service_name.clone(), r.version.clone()))
            .collect();
        tracing::info!(
            "deploying {} service(s) to {environment} at commit {commit_sha}: {}",
            stack.len(),
            selected.join(", ")
        );

        let outcome = self.run_stack_deploy(environment, stack, pending).await;
        let completed_at = self.clock.now();
        let duration_seconds = seconds_between(started_at, completed_at);

        let (status, error_message, services_deployed) = match outcome {
            Ok(()) => {
                for (idx, record) in records.iter().enumerate() {
                    if let Err(e) = self.history.complete_history(
                        record.history_id,
                        HistoryStatus::Success,
                        completed_at,
                        duration_seconds,
                        None,
                    ) {
                        self.abandon(&records[idx..], started_at);
                        return Err(EngineError::Store(e));
                    }
                    if let Err(e) = self.environments.record_deployment(
                        environment,
                        &record.service_name,
                        &record.version,
                        commit_sha,
                        completed_at,
                        deployed_by,
                    ) {
                        tracing::error!(
                            "history {} finalized but {} state was not recorded: {e}",
                            record.history_id,
                            record.service_name
                        );
                        self.abandon(&records[idx + 1..], started_at);
                        return Err(EngineError::Store(e));
                    }
                }
                let health = self.refresh_health(environment, &selected).await;
                let payload = records
                    .iter()
                    .map(|r| ServiceOutcome {
                        history_id: r.history_id,
                        name: r.service_name.clone(),
                        version: r.version.clone(),
                        health_status: Some(
                            health
                                .get(&r.service_name)
                                .copied()
                                .unwrap_or(HealthStatus::Unknown),
                        ),
                        status: None,
                    })
                    .collect();
                tracing::info!(
                    "deployment to {environment} succeeded in {duration_seconds:.1}s"
                );
                (HistoryStatus::Success, None, payload)
            }
            Err(message) => {
                tracing::error!("deployment failed for {environment}: {message}");
                for (idx, record) in records.iter().enumerate() {
                    if let Err(e) = self.history.complete_history(
                        record.history_id,
                        HistoryStatus::Failed,
                        completed_at,
                        duration_seconds,
                        Some(&message),
                    ) {
                        self.abandon(&records[idx..], started_at);
                        return Err(EngineError::Store(e));
                    }
                }
                let payload = records
                    .iter()
                    .map(|r| ServiceOutcome {
                        history_id: r.history_id,
                        name: r.service_name.clone(),
                        version: r.version.clone(),
                        health_status: None,
                        status: Some(HistoryStatus::Failed),
                    })
                    .collect();
                (HistoryStatus::Failed, Some(message), payload)
            }
        };

        Ok(DeploymentStatus {
            deployment_id: records[0].history_id,
            environment,
            status,
            started_at,
            completed_at: Some(completed_at),
            duration_seconds: Some(duration_seconds),
            services_deployed,
            error_message,
        })
    }

    fn start_history(
        &self,
        environment: Environment,
        selected: &[String],
        target_versions: &BTreeMap<String, String>,
        commit_sha: &str,
        deployed_by: &str,
        started_at: DateTime<Utc>,
    ) -> Result<Vec<HistoryContext>, EngineError> {
        let mut records: Vec<HistoryContext> = Vec::with_capacity(selected.len());
        for service in selected {
            let version = target_versions[service].clone();
            match self.history.start_history(
                environment,
                service,
                &version,
                commit_sha,
                deployed_by,
                started_at,
            ) {
                Ok(history_id) => records.push(HistoryContext {
                    history_id,
                    service_name: service.clone(),
                    version,
                }),
                Err(e) => {
                    self.abandon(&records, started_at);
                    return Err(EngineError::Store(e));
                }
            }
        }
        Ok(records)
    }

    /// Best-effort: mark rows left behind by a bookkeeping error as failed so
    /// none of them stays in_progress.
    fn abandon(&self, records: &[HistoryContext], started_at: DateTime<Utc>) {
        if records.is_empty() {
            return;
        }
        let now = self.clock.now();
        for record in records {
            if let Err(err) = self.history.complete_history(
                record.history_id,
                HistoryStatus::Failed,
                now,
                seconds_between(started_at, now),
                Some(SKIPPED_MESSAGE),
            ) {
                tracing::warn!(
                    "failed to finalize history {} after bookkeeping error: {err}",
                    record.history_id
                );
            }
        }
    }

    /// Run the blocking stack deploy. On timeout the still-running task is
    /// handed back through `pending`.
    async fn run_stack_deploy(
        &self,
        environment: Environment,
        stack: BTreeMap<String, String>,
        pending: &mut Option<StackTask>,
    ) -> Result<(), String> {
        let orchestrator = Arc::clone(&self.orchestrator);
        let mut task =
            tokio::task::spawn_blocking(move || orchestrator.deploy_stack(environment, &stack));

        let joined = match self.deploy_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    *pending = Some(task);
                    return Err(OrchestratorError::TimedOut(limit).to_string());
                }
            },
            None => task.await,
        };

        match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(format!("stack deploy task aborted: {e}")),
        }
    }

    /// Health never fails a deployment that already succeeded; anything the
    /// probe could not answer reads as unknown.
    async fn refresh_health(
        &self,
        environment: Environment,
        services: &[String],
    ) -> BTreeMap<String, HealthStatus> {
        match self.health.refresh_environment(environment, services).await {
            Ok(results) => results
                .into_iter()
                .map(|h| (h.service_name, h.status))
                .collect(),
            Err(e) => {
                tracing::warn!("health refresh after deploy to {environment} failed: {e}");
                BTreeMap::new()
            }
        }
    }

    pub fn get_status(&self, deployment_id: i64) -> Result<Option<DeploymentStatus>, EngineError> {
        let Some(record) = self.history.fetch_history(deployment_id)? else {
            return Ok(None);
        };
        let group = self
            .history
            .list_history_for_started_at(record.environment, record.started_at)?;

        let mut status = HistoryStatus::Success;
        let mut error_message = None;
        let mut completed_at = record.completed_at;
        for entry in &group {
            match entry.status {
                HistoryStatus::Failed | HistoryStatus::RolledBack => {
                    status = HistoryStatus::Failed;
                    error_message = entry.error_message.clone();
                }
                HistoryStatus::InProgress if status != HistoryStatus::Failed => {
                    status = HistoryStatus::InProgress;
                }
                _ => {}
            }
            if let Some(done) = entry.completed_at {
                if completed_at.is_none_or(|c| done > c) {
                    completed_at = Some(done);
                }
            }
        }

        let services_deployed = group
            .iter()
            .map(|entry| ServiceOutcome {
                history_id: entry.id,
                name: entry.service_name.clone(),
                version: entry.version.clone(),
                health_status: None,
                status: Some(entry.status),
            })
            .collect();

        Ok(Some(DeploymentStatus {
            deployment_id,
            environment: record.environment,
            status,
            started_at: record.started_at,
            completed_at,
            duration_seconds: completed_at.map(|c| seconds_between(record.started_at, c)),
            services_deployed,
            error_message,
        }))
    }

    /// Replay a production deployment group's exact versions as a new deployment.
    pub async fn rollback(
        &self,
        history_id: i64,
        deployed_by: &str,
    ) -> Result<DeploymentStatus, EngineError> {
        let record = self
            .history
            .fetch_history(history_id)?
            .filter(|r| r.environment == Environment::Prod)
            .ok_or_else(|| {
                EngineError::NotFound(format!("production deployment record {history_id}"))
            })?;
        let group = self
            .history
            .list_history_for_started_at(record.environment, record.started_at)?;
        let services: BTreeMap<String, String> = group
            .into_iter()
            .map(|e| (e.service_name, e.version))
            .collect();
        let subset: Vec<String> = services.keys().cloned().collect();

        tracing::info!(
            "rolling back prod to history group of {history_id} ({} service(s))",
            services.len()
        );
        self.deploy(
            Environment::Prod,
            &services,
            &record.commit_sha,
            deployed_by,
            Some(&subset),
        )
        .await
    }

    pub fn diff_environments(&self) -> Result<Vec<ServiceDiff>, EngineError> {
        let states = self.environments.get_all_environments()?;
        Ok(compute_diff(
            states.get(&Environment::Prod),
            states.get(&Environment::Preprod),
        ))
    }

    pub fn environment_state(
        &self,
        environment: Environment,
    ) -> Result<Option<EnvironmentState>, EngineError> {
        Ok(self.environments.get_environment(environment)?)
    }

    pub fn environment_states(
        &self,
    ) -> Result<BTreeMap<Environment, EnvironmentState>, EngineError> {
        Ok(self.environments.get_all_environments()?)
    }

    pub fn list_history(
        &self,
        filter: &HistoryFilter,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<HistoryEntry>, i64), EngineError> {
        Ok(self.history.list_history(filter, limit, offset)?)
    }

    pub fn history_entry(&self, history_id: i64) -> Result<Option<HistoryEntry>, EngineError> {
        Ok(self.history.fetch_history(history_id)?)
    }

    pub fn related_history(
        &self,
        environment: Environment,
        started_at: DateTime<Utc>,
    ) -> Result<Vec<HistoryEntry>, EngineError> {
        Ok(self
            .history
            .list_history_for_started_at(environment, started_at)?)
    }
}

/// Services to deploy, in ascending name order.
fn select_services(
    target_versions: &BTreeMap<String, String>,
    subset: Option<&[String]>,
) -> Result<Vec<String>, EngineError> {
    let selected: Vec<String> = match subset {
        None => target_versions.keys().cloned().collect(),
        Some(requested) => {
            let mut names: Vec<String> = requested
                .iter()
                .filter(|name| target_versions.contains_key(*name))
                .cloned()
                .collect();
            names.sort();
            names.dedup();
            if names.is_empty() {
                return Err(EngineError::InvalidRequest(
                    "no valid services requested for deployment".to_string(),
                ));
            }
            names
        }
    };
    if selected.is_empty() {
        return Err(EngineError::InvalidRequest(
            "no services supplied for deployment".to_string(),
        ));
    }
    Ok(selected)
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_microseconds().unwrap_or(0) as f64 / 1_000_000.0
}
