use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::DeploymentEngine;
use crate::models::deployment::{Environment, HistoryStatus, SYSTEM_ACTOR};
use crate::models::manifest::PREPROD_MANIFEST_PATH;
use crate::ports::ManifestFetcher;

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The manifest listed no services.
    Empty,
    /// The manifest commit matches the last one handled.
    Unchanged,
    /// A preprod deployment ran for the new commit.
    Deployed {
        commit_sha: String,
        status: HistoryStatus,
    },
}

/// Keeps preprod in sync with the manifest in the source repository.
pub struct EnvironmentPoller {
    fetcher: Arc<dyn ManifestFetcher>,
    engine: Arc<DeploymentEngine>,
    manifest_path: String,
    last_seen: Mutex<Option<String>>,
}

impl EnvironmentPoller {
    pub fn new(fetcher: Arc<dyn ManifestFetcher>, engine: Arc<DeploymentEngine>) -> Self {
        Self {
            fetcher,
            engine,
            manifest_path: PREPROD_MANIFEST_PATH.to_string(),
            last_seen: Mutex::new(None),
        }
    }

    /// Start from the commit preprod already runs so a restart does not redeploy it.
    pub async fn seed_from_state(&self) -> anyhow::Result<()> {
        let state = self.engine.environment_state(Environment::Preprod)?;
        *self.last_seen.lock().await = state.map(|s| s.commit_sha);
        Ok(())
    }

    pub async fn last_seen(&self) -> Option<String> {
        self.last_seen.lock().await.clone()
    }

    pub async fn check_for_changes(&self) -> anyhow::Result<PollOutcome> {
        let manifest = self.fetcher.fetch(&self.manifest_path).await?;
        if manifest.services.is_empty() {
            tracing::debug!("poller: no services in {}; skipping", self.manifest_path);
            return Ok(PollOutcome::Empty);
        }

        let mut last_seen = self.last_seen.lock().await;
        if last_seen.as_deref() == Some(manifest.commit_sha.as_str()) {
            tracing::debug!("poller: no new commit for {}", self.manifest_path);
            return Ok(PollOutcome::Unchanged);
        }

        tracing::info!(
            "poller: detected new commit {} for preprod; triggering deployment",
            manifest.commit_sha
        );
        let result = self
            .engine
            .deploy_preprod(&manifest.commit_sha, &manifest.services, SYSTEM_ACTOR)
            .await?;
        *last_seen = Some(manifest.commit_sha.clone());

        Ok(PollOutcome::Deployed {
            commit_sha: manifest.commit_sha,
            status: result.status,
        })
    }
}

/// Handle to a running poller task.
pub struct PollerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Signal the loop to stop and wait for the current iteration to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!("poller task ended abnormally: {e}");
        }
    }
}

/// Spawn the poller loop. A zero interval disables it.
pub fn spawn_poller(poller: Arc<EnvironmentPoller>, interval_secs: u64) -> Option<PollerHandle> {
    if interval_secs == 0 {
        tracing::info!("poller: disabled by config");
        return None;
    }

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        tracing::info!(
            "poller: started for {} (interval={interval_secs}s)",
            poller.manifest_path
        );
        if let Err(e) = poller.seed_from_state().await {
            tracing::warn!("poller: could not read preprod state: {e}");
        }

        loop {
            if token.is_cancelled() {
                break;
            }
            match poller.check_for_changes().await {
                Ok(PollOutcome::Deployed { commit_sha, status }) => {
                    tracing::info!("poller: deployment of {commit_sha} finished with {status}");
                }
                Ok(_) => {}
                Err(e) => tracing::error!("poller iteration failed: {e}"),
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(interval_secs)) => {}
                _ = token.cancelled() => break,
            }
        }
        tracing::info!("poller: stopped");
    });

    Some(PollerHandle { cancel, task })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        FailingOrchestrator, HealthyProbe, RecordingOrchestrator, ScriptedFetcher, engine_with,
        manifest,
    };

    fn poller_with(
        fetcher: Arc<ScriptedFetcher>,
        orchestrator: Arc<dyn crate::ports::ContainerOrchestrator>,
    ) -> (Arc<crate::release_db::ReleaseDb>, EnvironmentPoller) {
        let (db, engine) = engine_with(orchestrator, Arc::new(HealthyProbe::default()));
        (db, EnvironmentPoller::new(fetcher, Arc::new(engine)))
    }

    #[tokio::test]
    async fn test_new_commit_deploys_then_goes_quiet() {
        let fetcher = Arc::new(ScriptedFetcher::new(manifest(
            "abc123",
            &[("jellyfin", "2025040803")],
        )));
        let orchestrator = Arc::new(RecordingOrchestrator::default());
        let (db, poller) = poller_with(fetcher.clone(), orchestrator.clone());

        let first = poller.check_for_changes().await.unwrap();
        assert_eq!(
            first,
            PollOutcome::Deployed {
                commit_sha: "abc123".to_string(),
                status: HistoryStatus::Success,
            }
        );
        let second = poller.check_for_changes().await.unwrap();
        assert_eq!(second, PollOutcome::Unchanged);

        assert_eq!(orchestrator.calls().len(), 1);
        assert_eq!(fetcher.fetches(), 2);
        let state = db.get_environment_state(Environment::Preprod).unwrap().unwrap();
        assert_eq!(state.commit_sha, "abc123");
        let (entries, _) = db
            .list_history(&Default::default(), 10, 0)
            .unwrap();
        assert_eq!(entries[0].deployed_by, SYSTEM_ACTOR);

        fetcher.set(manifest("def456", &[("jellyfin", "2025040900")]));
        let third = poller.check_for_changes().await.unwrap();
        assert!(matches!(third, PollOutcome::Deployed { .. }));
        assert_eq!(orchestrator.calls().len(), 2);
        assert_eq!(poller.last_seen().await.as_deref(), Some("def456"));
    }

    #[tokio::test]
    async fn test_seeded_commit_is_not_redeployed() {
        let fetcher = Arc::new(ScriptedFetcher::new(manifest("abc123", &[("api", "1")])));
        let orchestrator = Arc::new(RecordingOrchestrator::default());
        let (db, poller) = poller_with(fetcher, orchestrator.clone());
        db.upsert_deployment(
            Environment::Preprod,
            "api",
            "1",
            "abc123",
            chrono::Utc::now(),
            SYSTEM_ACTOR,
        )
        .unwrap();

        poller.seed_from_state().await.unwrap();
        assert_eq!(
            poller.check_for_changes().await.unwrap(),
            PollOutcome::Unchanged
        );
        assert!(orchestrator.calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_manifest_is_skipped() {
        let fetcher = Arc::new(ScriptedFetcher::new(manifest("abc123", &[])));
        let orchestrator = Arc::new(RecordingOrchestrator::default());
        let (_db, poller) = poller_with(fetcher, orchestrator.clone());

        assert_eq!(poller.check_for_changes().await.unwrap(), PollOutcome::Empty);
        assert!(orchestrator.calls().is_empty());
        assert_eq!(poller.last_seen().await, None);
    }

    #[tokio::test]
    async fn test_failed_deploy_still_advances_last_seen() {
        let fetcher = Arc::new(ScriptedFetcher::new(manifest("abc123", &[("api", "1")])));
        let (_db, poller) = poller_with(fetcher, Arc::new(FailingOrchestrator("pull denied")));

        let outcome = poller.check_for_changes().await.unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Deployed {
                commit_sha: "abc123".to_string(),
                status: HistoryStatus::Failed,
            }
        );
        assert_eq!(
            poller.check_for_changes().await.unwrap(),
            PollOutcome::Unchanged
        );
    }

    #[tokio::test]
    async fn test_fetch_error_leaves_state_alone() {
        let fetcher = Arc::new(ScriptedFetcher::new(manifest("abc123", &[("api", "1")])));
        fetcher.fail_with("connection reset");
        let orchestrator = Arc::new(RecordingOrchestrator::default());
        let (_db, poller) = poller_with(fetcher.clone(), orchestrator.clone());

        let err = poller.check_for_changes().await.unwrap_err();
        assert!(err.to_string().contains("connection reset"));
        assert_eq!(poller.last_seen().await, None);
        assert!(orchestrator.calls().is_empty());
    }

    #[tokio::test]
    async fn test_spawned_poller_runs_once_and_stops() {
        let fetcher = Arc::new(ScriptedFetcher::new(manifest("abc123", &[("api", "1")])));
        let orchestrator = Arc::new(RecordingOrchestrator::default());
        let (_db, poller) = poller_with(fetcher.clone(), orchestrator.clone());
        let poller = Arc::new(poller);

        assert!(spawn_poller(poller.clone(), 0).is_none());

        let handle = spawn_poller(poller.clone(), 3600).unwrap();
        while fetcher.fetches() == 0 {
            tokio::task::yield_now().await;
        }
        handle.stop().await;

        assert_eq!(fetcher.fetches(), 1);
        assert_eq!(poller.last_seen().await.as_deref(), Some("abc123"));
        assert_eq!(orchestrator.calls().len(), 1);
    }
}
