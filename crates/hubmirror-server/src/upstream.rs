//! Upstream hub client and commit resolution.
//!
//! Three reqwest clients with different redirect/timeout shapes: `meta`
//! follows redirects with a hard timeout (API JSON), `probe` keeps 3xx
//! responses intact (the file HEAD probe needs the Location header), and
//! `stream` follows redirects but has no overall deadline (block
//! transfers can be long).

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::AUTHORIZATION;
use reqwest::redirect::Policy;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;
use url::Url;

use hubmirror_cache::{CacheLayout, Envelope, RepoCoord};

use crate::config::Config;
use crate::error::ApiError;
use crate::urls::join_base;

/// Hard deadline for metadata calls.
pub const API_TIMEOUT: Duration = Duration::from_secs(15);
/// Existence probes retry this many times on transient failures.
const EXIST_RETRIES: usize = 3;

#[derive(Clone)]
pub struct UpstreamClient {
    config: Arc<Config>,
    layout: CacheLayout,
    meta: reqwest::Client,
    probe: reqwest::Client,
    stream: reqwest::Client,
}

impl UpstreamClient {
    pub fn new(config: Arc<Config>, layout: CacheLayout) -> Result<Self, reqwest::Error> {
        let meta = reqwest::Client::builder().timeout(API_TIMEOUT).build()?;
        let probe = reqwest::Client::builder()
            .redirect(Policy::none())
            .timeout(API_TIMEOUT)
            .build()?;
        let stream = reqwest::Client::builder()
            .connect_timeout(API_TIMEOUT)
            .build()?;
        Ok(Self {
            config,
            layout,
            meta,
            probe,
            stream,
        })
    }

    /// Client for API JSON (follows redirects, strict timeout).
    pub fn meta(&self) -> &reqwest::Client {
        &self.meta
    }

    /// Client for the file HEAD probe (does not follow redirects).
    pub fn probe(&self) -> &reqwest::Client {
        &self.probe
    }

    /// Client for ranged body transfers (follows redirects, no overall
    /// deadline).
    pub fn stream(&self) -> &reqwest::Client {
        &self.stream
    }

    fn api_url(&self, coord: &RepoCoord, reference: Option<&str>) -> Option<Url> {
        let mut tail = format!(
            "/api/{}/{}",
            coord.repo_type.as_str(),
            coord.org_repo()
        );
        if let Some(reference) = reference {
            tail.push_str("/revision/");
            tail.push_str(reference);
        }
        join_base(&self.config.hf_url_base(), &tail)
    }

    /// Latest commit sha on the default branch, or `None` when the
    /// repository is unknown. Falls back to the cached metadata
    /// envelopes on upstream failure; never fabricates a sha.
    pub async fn newest_commit(&self, coord: &RepoCoord, auth: Option<&str>) -> Option<String> {
        if self.config.offline {
            return self.newest_commit_offline(coord);
        }
        let url = self.api_url(coord, None)?;
        let mut request = self.meta.get(url);
        if let Some(auth) = auth {
            request = request.header(AUTHORIZATION, auth);
        }
        match request.send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => {
                match response.json::<serde_json::Value>().await {
                    Ok(body) => body.get("sha").and_then(|v| v.as_str()).map(String::from),
                    Err(_) => self.newest_commit_offline(coord),
                }
            }
            Ok(_) => self.newest_commit_offline(coord),
            Err(err) => {
                debug!(error = %err, "newest-commit probe failed, trying cached metadata");
                self.newest_commit_offline(coord)
            }
        }
    }

    /// Resolves a ref (branch name or sha) to a commit sha.
    pub async fn resolve_commit(
        &self,
        coord: &RepoCoord,
        reference: &str,
        auth: Option<&str>,
    ) -> Option<String> {
        if self.config.offline {
            return self.resolve_commit_offline(coord, reference);
        }
        let url = self.api_url(coord, Some(reference))?;
        let mut request = self.meta.get(url);
        if let Some(auth) = auth {
            request = request.header(AUTHORIZATION, auth);
        }
        match request.send().await {
            Ok(response)
                if matches!(response.status().as_u16(), 200 | 307) =>
            {
                match response.json::<serde_json::Value>().await {
                    Ok(body) => body.get("sha").and_then(|v| v.as_str()).map(String::from),
                    Err(_) => self.resolve_commit_offline(coord, reference),
                }
            }
            Ok(_) => self.resolve_commit_offline(coord, reference),
            Err(err) => {
                debug!(error = %err, "revision probe failed, trying cached metadata");
                self.resolve_commit_offline(coord, reference)
            }
        }
    }

    /// Whether the repository (or the given revision of it) exists
    /// upstream. Used to tell "unknown repo" apart from "unknown
    /// revision". Retried on transient failures; a final timeout
    /// surfaces as [`ApiError::ProxyTimeout`].
    pub async fn repo_exists(
        &self,
        coord: &RepoCoord,
        reference: Option<&str>,
        auth: Option<&str>,
    ) -> Result<bool, ApiError> {
        if self.config.offline {
            return Ok(match reference {
                Some(reference) => self.resolve_commit_offline(coord, reference).is_some(),
                None => self.newest_commit_offline(coord).is_some(),
            });
        }
        let url = self
            .api_url(coord, reference)
            .ok_or_else(|| ApiError::Internal("cannot build upstream api url".to_string()))?;
        let mut last_err = None;
        for _ in 0..EXIST_RETRIES {
            let mut request = self.probe.head(url.clone());
            if let Some(auth) = auth {
                request = request.header(AUTHORIZATION, auth);
            }
            match request.send().await {
                Ok(response) => {
                    return Ok(matches!(response.status().as_u16(), 200 | 307));
                }
                Err(err) if err.is_timeout() || err.is_connect() => {
                    last_err = Some(err);
                }
                Err(err) => return Err(err.into()),
            }
        }
        debug!(error = ?last_err, "existence probe exhausted retries");
        Err(ApiError::ProxyTimeout)
    }

    /// Newest commit from cached metadata: scan every revision envelope,
    /// order by `lastModified`, return the newest sha.
    fn newest_commit_offline(&self, coord: &RepoCoord) -> Option<String> {
        let revision_dir = self.layout.revision_dir(coord);
        let entries = std::fs::read_dir(revision_dir).ok()?;
        let mut revisions: Vec<(OffsetDateTime, String)> = Vec::new();
        for entry in entries.flatten() {
            let dir = entry.path();
            for name in ["meta_head.json", "meta_get.json"] {
                let Ok(envelope) = Envelope::read(&dir.join(name)) else {
                    continue;
                };
                if let Some((modified, sha)) = parse_meta_envelope(&envelope) {
                    revisions.push((modified, sha));
                    break;
                }
            }
        }
        revisions.sort_by_key(|(modified, _)| *modified);
        revisions.pop().map(|(_, sha)| sha)
    }

    fn resolve_commit_offline(&self, coord: &RepoCoord, reference: &str) -> Option<String> {
        for method in ["get", "head"] {
            let path = self.layout.meta_path(coord, reference, method);
            let Ok(envelope) = Envelope::read(&path) else {
                continue;
            };
            let body: serde_json::Value = serde_json::from_slice(&envelope.content).ok()?;
            if let Some(sha) = body.get("sha").and_then(|v| v.as_str()) {
                return Some(sha.to_string());
            }
        }
        None
    }
}

fn parse_meta_envelope(envelope: &Envelope) -> Option<(OffsetDateTime, String)> {
    let body: serde_json::Value = serde_json::from_slice(&envelope.content).ok()?;
    let sha = body.get("sha")?.as_str()?.to_string();
    let modified = body.get("lastModified")?.as_str()?;
    let modified = OffsetDateTime::parse(modified, &Rfc3339).ok()?;
    Some((modified, sha))
}
