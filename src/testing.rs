//! Deterministic collaborators for unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use crate::engine::DeploymentEngine;
use crate::error::{ManifestError, OrchestratorError};
use crate::health::HealthService;
use crate::models::deployment::Environment;
use crate::models::health::{HealthStatus, ServiceHealth};
use crate::models::manifest::Manifest;
use crate::ports::{Clock, ContainerOrchestrator, HealthProbe, ManifestFetcher};
use crate::release_db::ReleaseDb;

pub fn versions(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn manifest(commit_sha: &str, pairs: &[(&str, &str)]) -> Manifest {
    Manifest {
        commit_sha: commit_sha.to_string(),
        raw_text: String::new(),
        services: versions(pairs),
    }
}

/// Advances by `step` on every reading so each deployment gets its own group key.
pub struct StepClock {
    current: Mutex<DateTime<Utc>>,
    step: Duration,
}

impl StepClock {
    pub fn new(step_secs: i64) -> Self {
        Self {
            current: Mutex::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()),
            step: Duration::seconds(step_secs),
        }
    }
}

impl Clock for StepClock {
    fn now(&self) -> DateTime<Utc> {
        let mut current = self.current.lock().unwrap();
        let now = *current;
        *current = now + self.step;
        now
    }
}

#[derive(Default)]
pub struct RecordingOrchestrator {
    calls: Mutex<Vec<(Environment, BTreeMap<String, String>)>>,
}

impl RecordingOrchestrator {
    pub fn calls(&self) -> Vec<(Environment, BTreeMap<String, String>)> {
        self.calls.lock().unwrap().clone()
    }
}

impl ContainerOrchestrator for RecordingOrchestrator {
    fn deploy_stack(
        &self,
        environment: Environment,
        services: &BTreeMap<String, String>,
    ) -> Result<(), OrchestratorError> {
        self.calls.lock().unwrap().push((environment, services.clone()));
        Ok(())
    }
}

pub struct FailingOrchestrator(pub &'static str);

impl ContainerOrchestrator for FailingOrchestrator {
    fn deploy_stack(
        &self,
        _environment: Environment,
        _services: &BTreeMap<String, String>,
    ) -> Result<(), OrchestratorError> {
        Err(OrchestratorError::CommandFailed(self.0.to_string()))
    }
}

/// Signals when a stack deploy starts, then blocks until released.
pub struct GatedOrchestrator {
    entered: Mutex<Option<oneshot::Sender<()>>>,
    release: Mutex<Option<oneshot::Receiver<()>>>,
}

impl GatedOrchestrator {
    pub fn new() -> (Self, oneshot::Receiver<()>, oneshot::Sender<()>) {
        let (entered_tx, entered_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        let gate = Self {
            entered: Mutex::new(Some(entered_tx)),
            release: Mutex::new(Some(release_rx)),
        };
        (gate, entered_rx, release_tx)
    }
}

impl ContainerOrchestrator for GatedOrchestrator {
    fn deploy_stack(
        &self,
        _environment: Environment,
        _services: &BTreeMap<String, String>,
    ) -> Result<(), OrchestratorError> {
        if let Some(tx) = self.entered.lock().unwrap().take() {
            let _ = tx.send(());
        }
        let release = self.release.lock().unwrap().take();
        if let Some(rx) = release {
            let _ = rx.blocking_recv();
        }
        Ok(())
    }
}

/// Reports every requested service healthy, except the ones listed in `omit`.
/// Each request is recorded.
#[derive(Default)]
pub struct HealthyProbe {
    pub omit: Vec<String>,
    pub requests: Mutex<Vec<(Environment, Vec<String>)>>,
}

impl HealthyProbe {
    pub fn omitting(names: &[&str]) -> Self {
        Self {
            omit: names.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn requests(&self) -> Vec<(Environment, Vec<String>)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HealthProbe for HealthyProbe {
    async fn probe(
        &self,
        environment: Environment,
        services: &[String],
    ) -> anyhow::Result<Vec<ServiceHealth>> {
        self.requests
            .lock()
            .unwrap()
            .push((environment, services.to_vec()));
        Ok(services
            .iter()
            .filter(|s| !self.omit.contains(s))
            .map(|s| ServiceHealth {
                environment,
                service_name: s.clone(),
                status: HealthStatus::Healthy,
                replicas_running: Some(1),
                replicas_desired: Some(1),
                last_checked: Utc::now(),
                error_message: None,
            })
            .collect())
    }
}

pub struct FailingProbe;

#[async_trait]
impl HealthProbe for FailingProbe {
    async fn probe(
        &self,
        _environment: Environment,
        _services: &[String],
    ) -> anyhow::Result<Vec<ServiceHealth>> {
        anyhow::bail!("docker daemon unreachable")
    }
}

/// Serves whatever manifest it currently holds and counts fetches.
pub struct ScriptedFetcher {
    current: Mutex<Result<Manifest, String>>,
    fetches: Mutex<usize>,
}

impl ScriptedFetcher {
    pub fn new(manifest: Manifest) -> Self {
        Self {
            current: Mutex::new(Ok(manifest)),
            fetches: Mutex::new(0),
        }
    }

    pub fn set(&self, manifest: Manifest) {
        *self.current.lock().unwrap() = Ok(manifest);
    }

    pub fn fail_with(&self, message: &str) {
        *self.current.lock().unwrap() = Err(message.to_string());
    }

    pub fn fetches(&self) -> usize {
        *self.fetches.lock().unwrap()
    }
}

#[async_trait]
impl ManifestFetcher for ScriptedFetcher {
    async fn fetch(&self, _path: &str) -> Result<Manifest, ManifestError> {
        *self.fetches.lock().unwrap() += 1;
        self.current
            .lock()
            .unwrap()
            .clone()
            .map_err(ManifestError::Transport)
    }
}

pub fn engine_with(
    orchestrator: Arc<dyn ContainerOrchestrator>,
    probe: Arc<dyn HealthProbe>,
) -> (Arc<ReleaseDb>, DeploymentEngine) {
    let db = Arc::new(ReleaseDb::open(":memory:").unwrap());
    let health = Arc::new(HealthService::new(
        db.clone(),
        probe,
        Arc::new(StepClock::new(1)),
    ));
    let engine = DeploymentEngine::new(
        db.clone(),
        db.clone(),
        orchestrator,
        health,
        Arc::new(StepClock::new(1)),
    );
    (db, engine)
}
