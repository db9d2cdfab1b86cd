use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Process settings: `release-manager.toml` first, then environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_environment_name")]
    pub environment_name: String,
    #[serde(default)]
    pub stub_mode: bool,
    #[serde(default)]
    pub github: GitHubConfig,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Seconds between manifest polls. 0 = poller off.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Upper bound for a single stack deploy. 0 = unbounded.
    #[serde(default = "default_deployment_timeout")]
    pub deployment_timeout_secs: u64,
    /// Seconds between background health checks. 0 = monitor off.
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default)]
    pub web: WebConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubConfig {
    #[serde(default = "default_repo")]
    pub repo: String,
    pub token: Option<String>,
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            repo: default_repo(),
            token: None,
            api_url: default_api_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DockerConfig {
    pub host: Option<String>,
    #[serde(default = "default_image_prefix")]
    pub image_prefix: String,
    /// Compose file (YAML) whose top-level keys and per-service settings are
    /// merged into every rendered stack.
    pub stack_template: Option<String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host: None,
            image_prefix: default_image_prefix(),
            stack_template: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_web_host")]
    pub host: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_web_host(),
            port: default_web_port(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            environment_name: default_environment_name(),
            stub_mode: false,
            github: GitHubConfig::default(),
            docker: DockerConfig::default(),
            database_path: default_database_path(),
            poll_interval_secs: default_poll_interval(),
            deployment_timeout_secs: default_deployment_timeout(),
            health_check_interval_secs: default_health_interval(),
            web: WebConfig::default(),
        }
    }
}

fn default_environment_name() -> String {
    "preprod".to_string()
}

fn default_repo() -> String {
    "oscar-barlow/home.services".to_string()
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_image_prefix() -> String {
    "ghcr.io/oscar-barlow/home.services".to_string()
}

fn default_database_path() -> String {
    "./data/release-manager.db".to_string()
}

fn default_poll_interval() -> u64 {
    60
}

fn default_deployment_timeout() -> u64 {
    300
}

fn default_health_interval() -> u64 {
    30
}

fn default_web_host() -> String {
    "0.0.0.0".to_string()
}

fn default_web_port() -> u16 {
    8080
}

impl Settings {
    /// Load settings from a TOML file (defaults if it doesn't exist), then
    /// apply overrides from the process environment.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut settings = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let settings: Settings = toml::from_str(&contents)?;
            tracing::info!("loaded config from {}", path.display());
            settings
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            Self::default()
        };
        settings.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<()> {
        if let Some(v) = lookup("ENVIRONMENT_NAME") {
            self.environment_name = v;
        }
        self.environment_name = normalize_environment_name(&self.environment_name);
        if let Some(v) = lookup("STUB_MODE") {
            self.stub_mode = to_bool(&v);
        }
        if let Some(v) = lookup("GITHUB_REPO") {
            self.github.repo = v;
        }
        if self.github.repo.trim().is_empty() {
            anyhow::bail!("GITHUB_REPO must not be empty");
        }
        if let Some(v) = lookup("GITHUB_TOKEN") {
            self.github.token = Some(v);
        }
        if let Some(v) = lookup("GITHUB_API_URL") {
            self.github.api_url = v;
        }
        if let Some(v) = lookup("DOCKER_HOST") {
            self.docker.host = Some(v);
        }
        if let Some(v) = lookup("IMAGE_PREFIX") {
            self.docker.image_prefix = v;
        }
        if let Some(v) = lookup("STACK_TEMPLATE") {
            self.docker.stack_template = (!v.trim().is_empty()).then_some(v);
        }
        if let Some(v) = lookup("DATABASE_PATH") {
            self.database_path = v;
        }
        if let Some(v) = lookup("WEB_HOST") {
            self.web.host = v;
        }
        override_number(&lookup, "POLL_INTERVAL_SECONDS", &mut self.poll_interval_secs)?;
        override_number(
            &lookup,
            "DEPLOYMENT_TIMEOUT_SECONDS",
            &mut self.deployment_timeout_secs,
        )?;
        override_number(
            &lookup,
            "HEALTH_CHECK_INTERVAL_SECONDS",
            &mut self.health_check_interval_secs,
        )?;
        override_number(&lookup, "WEB_PORT", &mut self.web.port)?;
        Ok(())
    }

    pub fn deployment_timeout(&self) -> Option<Duration> {
        (self.deployment_timeout_secs > 0).then(|| Duration::from_secs(self.deployment_timeout_secs))
    }

    pub fn resolved_database_path(&self) -> PathBuf {
        resolve_database_path(&self.database_path, &self.environment_name)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.web.host, self.web.port)
    }
}

fn override_number<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) -> anyhow::Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw:?}: {e}"))?;
    }
    Ok(())
}

pub fn to_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

pub fn normalize_environment_name(raw: &str) -> String {
    let trimmed = raw.trim();
    let name = if trimmed.is_empty() { "preprod" } else { trimmed };
    name.replace(' ', "-").to_lowercase()
}

/// Scope the database file to the instance name.
///
/// A trailing `/` or a path without an extension is a directory and gets
/// `release-manager-{env}.db` inside it. A file path gets `-{env}` appended to
/// its stem unless the name already contains it as a `-` separated part.
pub fn resolve_database_path(raw: &str, environment_name: &str) -> PathBuf {
    let path = PathBuf::from(raw);
    if raw.ends_with('/') || path.extension().is_none() {
        return path.join(format!("release-manager-{environment_name}.db"));
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    if stem.split('-').any(|part| part == environment_name) {
        return path;
    }
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{stem}-{environment_name}.{extension}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.environment_name, "preprod");
        assert_eq!(settings.github.repo, "oscar-barlow/home.services");
        assert_eq!(settings.poll_interval_secs, 60);
        assert_eq!(settings.deployment_timeout(), Some(Duration::from_secs(300)));
        assert_eq!(settings.bind_address(), "0.0.0.0:8080");
        assert_eq!(
            settings.resolved_database_path(),
            PathBuf::from("./data/release-manager-preprod.db")
        );
    }

    #[test]
    fn test_toml_then_env_overrides() {
        let mut settings: Settings = toml::from_str(
            r#"
            environment_name = "Dev Box"
            poll_interval_secs = 10

            [docker]
            image_prefix = "registry.local/home"
            stack_template = "/etc/release-manager/stack.yml"

            [web]
            port = 9000
            "#,
        )
        .unwrap();
        assert_eq!(settings.github.api_url, "https://api.github.com");

        settings
            .apply_overrides(lookup_from(&[
                ("STUB_MODE", "Yes"),
                ("WEB_PORT", "9100"),
                ("DEPLOYMENT_TIMEOUT_SECONDS", "0"),
                ("GITHUB_TOKEN", "t0ken"),
            ]))
            .unwrap();

        assert_eq!(settings.environment_name, "dev-box");
        assert!(settings.stub_mode);
        assert_eq!(settings.poll_interval_secs, 10);
        assert_eq!(settings.docker.image_prefix, "registry.local/home");
        assert_eq!(settings.web.port, 9100);
        assert_eq!(settings.deployment_timeout(), None);
        assert_eq!(settings.github.token.as_deref(), Some("t0ken"));
        assert_eq!(
            settings.docker.stack_template.as_deref(),
            Some("/etc/release-manager/stack.yml")
        );

        settings
            .apply_overrides(lookup_from(&[("STACK_TEMPLATE", "")]))
            .unwrap();
        assert_eq!(settings.docker.stack_template, None);
    }

    #[test]
    fn test_bad_numbers_and_empty_repo_are_rejected() {
        let mut settings = Settings::default();
        assert!(settings
            .apply_overrides(lookup_from(&[("POLL_INTERVAL_SECONDS", "soon")]))
            .is_err());

        let mut settings = Settings::default();
        assert!(settings
            .apply_overrides(lookup_from(&[("GITHUB_REPO", " ")]))
            .is_err());
    }

    #[test]
    fn test_to_bool() {
        for truthy in ["1", "true", "YES", " on "] {
            assert!(to_bool(truthy), "{truthy}");
        }
        for falsy in ["0", "false", "", "maybe"] {
            assert!(!to_bool(falsy), "{falsy}");
        }
    }

    #[test]
    fn test_resolve_database_path() {
        assert_eq!(
            resolve_database_path("./data/", "prod"),
            PathBuf::from("./data/release-manager-prod.db")
        );
        assert_eq!(
            resolve_database_path("/var/lib/rm", "prod"),
            PathBuf::from("/var/lib/rm/release-manager-prod.db")
        );
        assert_eq!(
            resolve_database_path("/var/lib/rm/state.db", "prod"),
            PathBuf::from("/var/lib/rm/state-prod.db")
        );
        assert_eq!(
            resolve_database_path("/var/lib/rm/state-prod.db", "prod"),
            PathBuf::from("/var/lib/rm/state-prod.db")
        );
    }
}
