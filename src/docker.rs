//! Docker Swarm adapters: stack deploys via `docker stack deploy` and replica
//! health via `docker service ls`, plus deterministic stand-ins for dev/test
//! instances without a swarm.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Output};

use crate::error::OrchestratorError;
use crate::models::deployment::Environment;
use crate::models::health::{HealthStatus, ServiceHealth};
use crate::ports::{ContainerOrchestrator, HealthProbe};

pub fn stack_name(environment: Environment) -> String {
    format!("homelab-{environment}")
}

fn default_service() -> Value {
    json!({
        "deploy": {
            "replicas": 1,
            "restart_policy": { "condition": "on-failure" },
        },
    })
}

/// Compose document for one stack.
///
/// With a template, its top-level keys (networks, volumes, ...) are kept and a
/// deployed service starts from the template's entry of the same name. Template
/// services that are not being deployed are left out. `image` is always set
/// from the prefix and version.
pub fn render_stack(
    image_prefix: &str,
    services: &BTreeMap<String, String>,
    template: Option<&Value>,
) -> Value {
    let mut document = match template {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    let configured = document.remove("services");

    let mut entries = Map::new();
    for (service, version) in services {
        let mut entry = configured
            .as_ref()
            .and_then(|c| c.get(service))
            .filter(|v| v.is_object())
            .cloned()
            .unwrap_or_else(default_service);
        entry["image"] = json!(format!("{image_prefix}-{service}:{version}"));
        entries.insert(service.clone(), entry);
    }

    document.entry("version").or_insert_with(|| json!("3.8"));
    document.insert("services".to_string(), Value::Object(entries));
    Value::Object(document)
}

/// Read a compose template. The file must hold a YAML mapping.
pub fn load_stack_template(path: impl AsRef<Path>) -> anyhow::Result<Value> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read stack template {}: {e}", path.display()))?;
    parse_stack_template(&raw)
}

pub fn parse_stack_template(raw: &str) -> anyhow::Result<Value> {
    let template: Value = serde_yaml::from_str(raw)?;
    if !template.is_object() {
        anyhow::bail!("stack template must be a mapping");
    }
    if let Some(services) = template.get("services") {
        if !services.is_object() {
            anyhow::bail!("stack template `services` must be a mapping");
        }
    }
    Ok(template)
}

fn docker_command(docker_host: Option<&str>) -> Command {
    let mut cmd = Command::new("docker");
    if let Some(host) = docker_host {
        cmd.env("DOCKER_HOST", host);
    }
    cmd
}

fn stderr_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

pub struct DockerStackOrchestrator {
    image_prefix: String,
    docker_host: Option<String>,
    template: Option<Value>,
}

impl DockerStackOrchestrator {
    pub fn new(image_prefix: impl Into<String>, docker_host: Option<String>) -> Self {
        Self {
            image_prefix: image_prefix.into(),
            docker_host,
            template: None,
        }
    }

    pub fn with_template(mut self, template: Option<Value>) -> Self {
        self.template = template;
        self
    }
}

impl ContainerOrchestrator for DockerStackOrchestrator {
    fn deploy_stack(
        &self,
        environment: Environment,
        services: &BTreeMap<String, String>,
    ) -> Result<(), OrchestratorError> {
        if services.is_empty() {
            tracing::info!("no services supplied for {environment}; skipping stack deploy");
            return Ok(());
        }

        let document = render_stack(&self.image_prefix, services, self.template.as_ref());
        let rendered = serde_yaml::to_string(&document)
            .map_err(|e| OrchestratorError::Render(e.to_string()))?;
        let mut compose = tempfile::Builder::new()
            .prefix("release-manager-")
            .suffix(&format!("-{environment}.yml"))
            .tempfile()?;
        compose.write_all(rendered.as_bytes())?;
        compose.flush()?;

        let stack = stack_name(environment);
        tracing::debug!(
            "running docker stack deploy for {stack} with {}",
            compose.path().display()
        );
        let output = docker_command(self.docker_host.as_deref())
            .args(["stack", "deploy", "--with-registry-auth", "--compose-file"])
            .arg(compose.path())
            .arg(&stack)
            .output()
            .map_err(|e| OrchestratorError::Unavailable(format!("failed to run docker: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            tracing::debug!("docker stack deploy output: {}", stdout.trim());
        }
        if !output.status.success() {
            let stderr = stderr_text(&output);
            tracing::error!("docker stack deploy for {stack} failed: {stderr}");
            return Err(OrchestratorError::CommandFailed(stderr));
        }
        Ok(())
    }
}

/// Parse a `Replicas` column such as `1/1` or `0/2 (max 1 per node)`.
pub fn parse_replicas(raw: &str) -> Option<(i64, i64)> {
    let first = raw.split_whitespace().next()?;
    let (running, desired) = first.split_once('/')?;
    Some((running.parse().ok()?, desired.parse().ok()?))
}

/// Build one entry per requested service from `docker service ls` lines of the
/// form `<name> <replicas>`.
pub fn health_from_listing(
    environment: Environment,
    services: &[String],
    listing: &str,
    checked_at: DateTime<Utc>,
) -> Vec<ServiceHealth> {
    let replicas: BTreeMap<&str, &str> = listing
        .lines()
        .filter_map(|line| line.trim().split_once(' '))
        .collect();
    let stack = stack_name(environment);

    services
        .iter()
        .map(|service| {
            let swarm_name = format!("{stack}_{service}");
            let Some(raw) = replicas.get(swarm_name.as_str()) else {
                return ServiceHealth::unknown(environment, service, checked_at, "Service not found");
            };
            match parse_replicas(raw) {
                Some((running, desired)) => ServiceHealth {
                    environment,
                    service_name: service.clone(),
                    status: if running == desired {
                        HealthStatus::Healthy
                    } else {
                        HealthStatus::Unhealthy
                    },
                    replicas_running: Some(running),
                    replicas_desired: Some(desired),
                    last_checked: checked_at,
                    error_message: None,
                },
                None => ServiceHealth::unknown(
                    environment,
                    service,
                    checked_at,
                    format!("unrecognised replicas value {raw:?}"),
                ),
            }
        })
        .collect()
}

pub struct DockerHealthProbe {
    docker_host: Option<String>,
}

impl DockerHealthProbe {
    pub fn new(docker_host: Option<String>) -> Self {
        Self { docker_host }
    }

    fn list_stack(&self, environment: Environment) -> Result<String, String> {
        let output = docker_command(self.docker_host.as_deref())
            .args(["service", "ls", "--filter"])
            .arg(format!("name={}_", stack_name(environment)))
            .args(["--format", "{{.Name}} {{.Replicas}}"])
            .output()
            .map_err(|e| format!("failed to run docker: {e}"))?;
        if !output.status.success() {
            return Err(stderr_text(&output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl HealthProbe for DockerHealthProbe {
    async fn probe(
        &self,
        environment: Environment,
        services: &[String],
    ) -> anyhow::Result<Vec<ServiceHealth>> {
        if services.is_empty() {
            return Ok(Vec::new());
        }
        let docker_host = self.docker_host.clone();
        let listing = tokio::task::spawn_blocking(move || {
            DockerHealthProbe { docker_host }.list_stack(environment)
        })
        .await?;

        let now = Utc::now();
        Ok(match listing {
            Ok(listing) => health_from_listing(environment, services, &listing, now),
            Err(message) => {
                tracing::error!("failed to list services for {environment}: {message}");
                services
                    .iter()
                    .map(|s| ServiceHealth::unknown(environment, s, now, message.clone()))
                    .collect()
            }
        })
    }
}

/// Accepts every stack deploy without touching Docker.
#[derive(Debug, Default)]
pub struct StubOrchestrator;

impl ContainerOrchestrator for StubOrchestrator {
    fn deploy_stack(
        &self,
        environment: Environment,
        services: &BTreeMap<String, String>,
    ) -> Result<(), OrchestratorError> {
        tracing::debug!(
            "stubbed docker deploy for {environment} ({} services)",
            services.len()
        );
        Ok(())
    }
}

/// Reports every service as one healthy replica, except those marked stopped.
#[derive(Debug)]
pub struct StubHealthProbe {
    stopped: Vec<String>,
}

impl StubHealthProbe {
    pub fn new(stopped: Vec<String>) -> Self {
        Self { stopped }
    }
}

impl Default for StubHealthProbe {
    fn default() -> Self {
        Self::new(vec!["inspector".to_string()])
    }
}

#[async_trait]
impl HealthProbe for StubHealthProbe {
    async fn probe(
        &self,
        environment: Environment,
        services: &[String],
    ) -> anyhow::Result<Vec<ServiceHealth>> {
        let now = Utc::now();
        Ok(services
            .iter()
            .map(|service| {
                let stopped = self.stopped.contains(service);
                ServiceHealth {
                    environment,
                    service_name: service.clone(),
                    status: if stopped {
                        HealthStatus::Unhealthy
                    } else {
                        HealthStatus::Healthy
                    },
                    replicas_running: Some(if stopped { 0 } else { 1 }),
                    replicas_desired: Some(1),
                    last_checked: now,
                    error_message: stopped.then(|| "Paused in stub mode".to_string()),
                }
            })
            .collect())
    }
}

/// Stub adapters are only allowed on instances named `dev*` or `test*`.
pub fn stub_allowed(environment_name: &str) -> bool {
    let name = environment_name.to_lowercase();
    name.starts_with("dev") || name.starts_with("test")
}
