use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::ManifestError;
use crate::models::manifest::Manifest;
use crate::ports::ManifestFetcher;

/// Extract `service -> version` pairs from `.env` style text.
///
/// Only keys ending in `_VERSION` or `_TAG` count. `JELLYFIN_VERSION=1` and
/// `home_assistant_tag=2` become `jellyfin` and `home-assistant`.
pub fn parse_service_versions(raw_text: &str) -> BTreeMap<String, String> {
    let mut services = BTreeMap::new();
    for line in raw_text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        let key = key.trim().to_lowercase();
        let Some(service) = key
            .strip_suffix("_version")
            .or_else(|| key.strip_suffix("_tag"))
        else {
            continue;
        };
        services.insert(service.replace('_', "-"), value.to_string());
    }
    services
}

/// Contents API payload for a single file.
#[derive(Debug, Deserialize)]
struct ContentsPayload {
    #[serde(default)]
    content: String,
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    sha: Option<String>,
}

fn decode_payload(payload: ContentsPayload) -> Result<Manifest, ManifestError> {
    let raw_text = match payload.encoding.as_deref() {
        Some("base64") => {
            // The API wraps base64 at 60 columns.
            let compact: String = payload
                .content
                .chars()
                .filter(|c| !c.is_ascii_whitespace())
                .collect();
            let bytes = STANDARD
                .decode(compact)
                .map_err(|e| ManifestError::Decode(format!("bad base64 content: {e}")))?;
            String::from_utf8(bytes)
                .map_err(|e| ManifestError::Decode(format!("content is not utf-8: {e}")))?
        }
        _ => payload.content,
    };
    let services = parse_service_versions(&raw_text);
    Ok(Manifest {
        commit_sha: payload.sha.unwrap_or_default(),
        raw_text,
        services,
    })
}

/// Minimal client for the GitHub contents API.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    client: Client,
    base_url: String,
    repo: String,
    token: Option<String>,
}

impl GitHubClient {
    pub fn new(
        base_url: &str,
        repo: impl Into<String>,
        token: Option<String>,
    ) -> Result<Self, ManifestError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("release-manager/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            repo: repo.into(),
            token: token.filter(|t| !t.is_empty()),
        })
    }

    fn contents_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/contents/{}",
            self.base_url,
            self.repo,
            path.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl ManifestFetcher for GitHubClient {
    async fn fetch(&self, path: &str) -> Result<Manifest, ManifestError> {
        let url = self.contents_url(path);
        tracing::debug!("fetching manifest from {url}");

        let mut request = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => return Err(ManifestError::NotFound(url)),
            status if !status.is_success() => {
                return Err(ManifestError::Transport(format!("GET {url} returned {status}")));
            }
            _ => {}
        }

        let payload: ContentsPayload = response
            .json()
            .await
            .map_err(|e| ManifestError::Decode(e.to_string()))?;
        decode_payload(payload)
    }
}
