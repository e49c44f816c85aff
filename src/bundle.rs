//! Project file bundles and the collaborator that serves them.
//!
//! A bundle is the authoritative `path → content` map of a project at the
//! moment it is fetched. The backend exposes it as
//! `GET {api_base}/projects/{id}/bundle` returning `{"files": {path: content}}`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Project-relative path → file content, ordered by path.
pub type FileBundle = BTreeMap<String, String>;

/// Agent bookkeeping files that live next to project sources but must never
/// reach the sandbox.
/// Any path containing one of these is agent bookkeeping, not project source.
const AGENT_STATE_MARKERS: &[&str] = &[".agent_state.json", "agent_state.json"];

/// Backend project identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub u64);

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ProjectId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// One explicit write pushed by the agent's file-apply step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUpdate {
    pub path: String,
    pub content: String,
}

impl FileUpdate {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Normalize a bundle path to the project-relative form used as cache key:
/// backslashes become slashes, leading `./` and `/` are stripped.
pub fn normalize_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let mut rest = unified.as_str();
    loop {
        if let Some(stripped) = rest.strip_prefix("./") {
            rest = stripped;
        } else if let Some(stripped) = rest.strip_prefix('/') {
            rest = stripped;
        } else {
            break;
        }
    }
    rest.to_string()
}

fn is_agent_state_file(path: &str) -> bool {
    AGENT_STATE_MARKERS.iter().any(|marker| path.contains(marker))
}

/// Normalize every key and drop agent state files.
pub fn sanitize_bundle(raw: impl IntoIterator<Item = (String, String)>) -> FileBundle {
    raw.into_iter()
        .map(|(path, content)| (normalize_path(&path), content))
        .filter(|(path, _)| !path.is_empty() && !is_agent_state_file(path))
        .collect()
}

/// Source of project bundles. Must be cheap to call repeatedly: every load
/// re-fetches.
#[async_trait]
pub trait BundleSource: Send + Sync {
    async fn fetch_bundle(&self, project: ProjectId) -> anyhow::Result<FileBundle>;
}

#[derive(Deserialize)]
struct BundleResponse {
    files: BTreeMap<String, String>,
}

/// HTTP client for the project backend's bundle endpoint.
pub struct HttpBundleSource {
    base_url: String,
    http: reqwest::Client,
}

impl HttpBundleSource {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {e}"))?;

        Ok(Self::with_client(base_url, http))
    }

    pub fn with_client(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    fn bundle_url(&self, project: ProjectId) -> String {
        format!("{}/projects/{project}/bundle", self.base_url)
    }
}

#[async_trait]
impl BundleSource for HttpBundleSource {
    async fn fetch_bundle(&self, project: ProjectId) -> anyhow::Result<FileBundle> {
        let url = self.bundle_url(project);

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Bundle request failed: {e}"))?;

        let status = resp.status();
        let body_text = resp
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable>".to_string());

        anyhow::ensure!(
            status.is_success(),
            "Backend returned {status}: {body_text}"
        );

        let parsed: BundleResponse = serde_json::from_str(&body_text)
            .map_err(|e| anyhow::anyhow!("Failed to parse bundle response: {e}"))?;

        let files = sanitize_bundle(parsed.files);
        tracing::debug!(%project, files = files.len(), "fetched project bundle");
        Ok(files)
    }
}
