use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::models::deployment::Environment;
use crate::models::health::{HealthStatus, ServiceHealth};
use crate::ports::{Clock, EnvironmentRepository, HealthProbe, HealthRepository};

/// Probes service health and keeps the latest snapshot per service.
pub struct HealthService {
    repository: Arc<dyn HealthRepository>,
    probe: Arc<dyn HealthProbe>,
    clock: Arc<dyn Clock>,
}

impl HealthService {
    pub fn new(
        repository: Arc<dyn HealthRepository>,
        probe: Arc<dyn HealthProbe>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            probe,
            clock,
        }
    }

    /// Probe `services` and persist one entry per requested name.
    ///
    /// Names the probe did not answer for, and every name when the probe itself
    /// fails, are stored as unknown.
    pub async fn refresh_environment(
        &self,
        environment: Environment,
        services: &[String],
    ) -> anyhow::Result<Vec<ServiceHealth>> {
        if services.is_empty() {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let mut by_name: BTreeMap<String, ServiceHealth> =
            match self.probe.probe(environment, services).await {
                Ok(results) => results
                    .into_iter()
                    .map(|h| (h.service_name.clone(), h))
                    .collect(),
                Err(e) => {
                    tracing::warn!("health probe for {environment} failed: {e}");
                    services
                        .iter()
                        .map(|s| {
                            let entry = ServiceHealth::unknown(environment, s, now, e.to_string());
                            (s.clone(), entry)
                        })
                        .collect()
                }
            };

        let mut results = Vec::with_capacity(services.len());
        for service in services {
            let entry = by_name.remove(service).unwrap_or_else(|| {
                ServiceHealth::unknown(environment, service, now, "service not reported by probe")
            });
            self.repository.store(&entry)?;
            results.push(entry);
        }
        Ok(results)
    }

    /// Latest health grouped by environment. Both environments are always present.
    pub fn snapshot(
        &self,
    ) -> anyhow::Result<BTreeMap<Environment, BTreeMap<String, ServiceHealth>>> {
        let mut snapshot: BTreeMap<Environment, BTreeMap<String, ServiceHealth>> =
            Environment::ALL.iter().map(|env| (*env, BTreeMap::new())).collect();
        for entry in self.repository.list(None)? {
            snapshot
                .entry(entry.environment)
                .or_default()
                .insert(entry.service_name.clone(), entry);
        }
        Ok(snapshot)
    }
}

/// Periodically refresh health for every deployed service.
/// A zero interval disables the monitor.
pub fn spawn_health_monitor(
    health: Arc<HealthService>,
    environments: Arc<dyn EnvironmentRepository>,
    interval_secs: u64,
) {
    if interval_secs == 0 {
        tracing::info!("health monitor: disabled by config");
        return;
    }

    tokio::spawn(async move {
        tracing::info!("health monitor: started (interval={interval_secs}s)");
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;
            if let Err(e) = refresh_all(&health, environments.as_ref()).await {
                tracing::error!("health monitor error: {e}");
            }
        }
    });
}

async fn refresh_all(
    health: &HealthService,
    environments: &dyn EnvironmentRepository,
) -> anyhow::Result<()> {
    for (env, state) in environments.get_all_environments()? {
        let services: Vec<String> = state.services.keys().cloned().collect();
        match health.refresh_environment(env, &services).await {
            Ok(results) => {
                let unhealthy = results
                    .iter()
                    .filter(|h| h.status != HealthStatus::Healthy)
                    .count();
                tracing::debug!(
                    "health monitor: {env} probed {} services ({unhealthy} not healthy)",
                    results.len()
                );
            }
            Err(e) => tracing::warn!("health monitor: probe for {env} failed: {e}"),
        }
    }
    Ok(())
}
