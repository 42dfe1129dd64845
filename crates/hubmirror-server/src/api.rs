//! Envelope-cached proxies for the hub's metadata API: repo metadata,
//! tree listings, paths-info, and commit history. These are plain
//! cache-and-forward wrappers — no block logic.

use std::path::Path;

use axum::body::Body;
use axum::extract::{Path as UrlPath, RawForm, RawQuery, State};
use axum::http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use url::Url;

use hubmirror_cache::{Envelope, RepoCoord, RepoType};

use crate::error::ApiError;
use crate::state::AppState;
use crate::urls::join_base;

pub(crate) fn parse_repo_type(raw: &str) -> Result<RepoType, ApiError> {
    raw.parse().map_err(|_| ApiError::PageNotFound)
}

pub(crate) fn auth_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(String::from)
}

pub(crate) fn gate_proxy(state: &AppState, coord: &RepoCoord) -> Result<(), ApiError> {
    if state.config.proxy_rules.allow(&coord.org_repo()) {
        Ok(())
    } else {
        Err(ApiError::RepoNotFound)
    }
}

/// Resolves a ref (or the default branch) to a sha, mapping failure to
/// the repo-vs-revision 404 distinction.
pub(crate) async fn resolve_or_404(
    state: &AppState,
    coord: &RepoCoord,
    reference: Option<&str>,
    auth: Option<&str>,
) -> Result<String, ApiError> {
    let resolved = match reference {
        Some(reference) => state.upstream.resolve_commit(coord, reference, auth).await,
        None => state.upstream.newest_commit(coord, auth).await,
    };
    match resolved {
        Some(sha) => Ok(sha),
        None => {
            if reference.is_some() && state.upstream.repo_exists(coord, None, auth).await? {
                Err(ApiError::RevisionNotFound)
            } else {
                Err(ApiError::RepoNotFound)
            }
        }
    }
}

/// Replays a cached envelope, or forwards to the upstream and persists
/// the reply when it was a cacheable 200.
async fn forward_envelope(
    state: &AppState,
    save_path: &Path,
    upstream_url: Url,
    method: &Method,
    auth: Option<&str>,
    allow_cache: bool,
    form: Option<&[(&str, &str)]>,
) -> Result<Envelope, ApiError> {
    if save_path.exists() {
        return Ok(Envelope::read(save_path)?);
    }
    if state.config.offline {
        return Err(ApiError::EntryNotFound);
    }

    let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .unwrap_or(reqwest::Method::GET);
    let mut request = state.upstream.meta().request(method, upstream_url);
    if let Some(auth) = auth {
        request = request.header(AUTHORIZATION, auth);
    }
    if let Some(form) = form {
        request = request.form(&form.to_vec());
    }
    let response = request.send().await.map_err(ApiError::from)?;
    let status = response.status();
    let headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let content = response.bytes().await.map_err(ApiError::from)?.to_vec();

    let envelope = Envelope::new(status.as_u16(), headers, content);
    if status == reqwest::StatusCode::OK && allow_cache {
        envelope.write_atomic(save_path)?;
    }
    Ok(envelope)
}

fn envelope_reply(envelope: Envelope, head: bool) -> Result<Response, ApiError> {
    let status = StatusCode::from_u16(envelope.status_code)
        .map_err(|err| ApiError::ProxyInvalidData(err.to_string()))?;
    let content_type = envelope
        .header("content-type")
        .unwrap_or("application/json")
        .to_string();
    let len = envelope.content.len();
    let body = if head {
        Body::empty()
    } else {
        Body::from(envelope.content)
    };
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .header(CONTENT_LENGTH, len)
        .body(body)
        .map_err(|err| ApiError::Internal(err.to_string()))
}

async fn serve_meta(
    state: AppState,
    repo_type: String,
    org: String,
    repo: String,
    reference: Option<String>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let repo_type = parse_repo_type(&repo_type)?;
    let coord = RepoCoord::new(repo_type, Some(org), repo);
    gate_proxy(&state, &coord)?;
    let auth = auth_header(&headers);

    let sha = resolve_or_404(&state, &coord, reference.as_deref(), auth.as_deref()).await?;
    let save_path = state.layout.meta_path(&coord, &sha, method.as_str());

    let mut tail = format!("/api/{}/{}", coord.repo_type.as_str(), coord.org_repo());
    if let Some(reference) = &reference {
        tail.push_str("/revision/");
        tail.push_str(reference);
    }
    let upstream_url = join_base(&state.config.hf_url_base(), &tail)
        .ok_or_else(|| ApiError::Internal("cannot build upstream url".to_string()))?;

    let allow_cache = state.config.cache_rules.allow(&coord.org_repo());
    let envelope = forward_envelope(
        &state,
        &save_path,
        upstream_url,
        &method,
        auth.as_deref(),
        allow_cache,
        None,
    )
    .await?;
    envelope_reply(envelope, method == Method::HEAD)
}

/// `GET|HEAD /api/{type}/{org}/{repo}` — metadata at the newest commit.
pub async fn meta_root(
    State(state): State<AppState>,
    UrlPath((repo_type, org, repo)): UrlPath<(String, String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    serve_meta(state, repo_type, org, repo, None, method, headers).await
}

/// `GET|HEAD /api/{type}/{org}/{repo}/revision/{commit}`.
pub async fn meta_revision(
    State(state): State<AppState>,
    UrlPath((repo_type, org, repo, commit)): UrlPath<(String, String, String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    serve_meta(state, repo_type, org, repo, Some(commit), method, headers).await
}

fn query_flag(query: Option<&str>, name: &str) -> bool {
    let Some(query) = query else {
        return false;
    };
    url::form_urlencoded::parse(query.as_bytes())
        .any(|(key, value)| key == name && value != "false" && value != "0")
}

#[allow(clippy::too_many_arguments)]
async fn serve_tree(
    state: AppState,
    repo_type: String,
    org: String,
    repo: String,
    commit: String,
    path: String,
    query: Option<String>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let repo_type = parse_repo_type(&repo_type)?;
    let coord = RepoCoord::new(repo_type, Some(org), repo);
    gate_proxy(&state, &coord)?;
    let auth = auth_header(&headers);

    let sha = resolve_or_404(&state, &coord, Some(&commit), auth.as_deref()).await?;
    let recursive = query_flag(query.as_deref(), "recursive");
    let expand = query_flag(query.as_deref(), "expand");
    let save_path = state
        .layout
        .tree_path(&coord, &sha, &path, method.as_str(), recursive, expand);

    let mut tail = format!(
        "/api/{}/{}/tree/{}/{}",
        coord.repo_type.as_str(),
        coord.org_repo(),
        commit,
        path
    );
    if let Some(query) = &query {
        tail.push('?');
        tail.push_str(query);
    }
    let upstream_url = join_base(&state.config.hf_url_base(), &tail)
        .ok_or_else(|| ApiError::Internal("cannot build upstream url".to_string()))?;

    let allow_cache = state.config.cache_rules.allow(&coord.org_repo());
    let envelope = forward_envelope(
        &state,
        &save_path,
        upstream_url,
        &method,
        auth.as_deref(),
        allow_cache,
        None,
    )
    .await?;
    envelope_reply(envelope, method == Method::HEAD)
}

/// `GET|HEAD /api/{type}/{org}/{repo}/tree/{commit}` — repo root listing.
pub async fn tree_root(
    State(state): State<AppState>,
    UrlPath((repo_type, org, repo, commit)): UrlPath<(String, String, String, String)>,
    RawQuery(query): RawQuery,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    serve_tree(
        state,
        repo_type,
        org,
        repo,
        commit,
        String::new(),
        query,
        method,
        headers,
    )
    .await
}

/// `GET|HEAD /api/{type}/{org}/{repo}/tree/{commit}/{path}`.
pub async fn tree_path(
    State(state): State<AppState>,
    UrlPath((repo_type, org, repo, commit, path)): UrlPath<(String, String, String, String, String)>,
    RawQuery(query): RawQuery,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    serve_tree(
        state, repo_type, org, repo, commit, path, query, method, headers,
    )
    .await
}

/// `GET|HEAD /api/{type}/{org}/{repo}/commits/{commit}` — history.
pub async fn commits(
    State(state): State<AppState>,
    UrlPath((repo_type, org, repo, commit)): UrlPath<(String, String, String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let repo_type = parse_repo_type(&repo_type)?;
    let coord = RepoCoord::new(repo_type, Some(org), repo);
    gate_proxy(&state, &coord)?;
    let auth = auth_header(&headers);

    let sha = resolve_or_404(&state, &coord, Some(&commit), auth.as_deref()).await?;
    let save_path = state.layout.commits_path(&coord, &sha, method.as_str());
    let tail = format!(
        "/api/{}/{}/commits/{}",
        coord.repo_type.as_str(),
        coord.org_repo(),
        commit
    );
    let upstream_url = join_base(&state.config.hf_url_base(), &tail)
        .ok_or_else(|| ApiError::Internal("cannot build upstream url".to_string()))?;

    let allow_cache = state.config.cache_rules.allow(&coord.org_repo());
    let envelope = forward_envelope(
        &state,
        &save_path,
        upstream_url,
        &method,
        auth.as_deref(),
        allow_cache,
        None,
    )
    .await?;
    envelope_reply(envelope, method == Method::HEAD)
}

/// `POST /api/{type}/{org}/{repo}/paths-info/{commit}` — one cached
/// envelope per requested path, merged into a single JSON array reply.
pub async fn paths_info(
    State(state): State<AppState>,
    UrlPath((repo_type, org, repo, commit)): UrlPath<(String, String, String, String)>,
    headers: HeaderMap,
    RawForm(form): RawForm,
) -> Result<Response, ApiError> {
    let repo_type = parse_repo_type(&repo_type)?;
    let coord = RepoCoord::new(repo_type, Some(org), repo);
    gate_proxy(&state, &coord)?;
    let auth = auth_header(&headers);

    let paths: Vec<String> = url::form_urlencoded::parse(&form)
        .filter(|(key, _)| key == "paths" || key == "paths[]")
        .map(|(_, value)| value.into_owned())
        .collect();

    let sha = resolve_or_404(&state, &coord, Some(&commit), auth.as_deref()).await?;
    let tail = format!(
        "/api/{}/{}/paths-info/{}",
        coord.repo_type.as_str(),
        coord.org_repo(),
        commit
    );
    let upstream_url = join_base(&state.config.hf_url_base(), &tail)
        .ok_or_else(|| ApiError::Internal("cannot build upstream url".to_string()))?;
    let allow_cache = state.config.cache_rules.allow(&coord.org_repo());

    let mut merged: Vec<serde_json::Value> = Vec::new();
    for path in paths {
        let save_path = state.layout.paths_info_path(&coord, &sha, &path, "post");
        let envelope = match forward_envelope(
            &state,
            &save_path,
            upstream_url.clone(),
            &Method::POST,
            auth.as_deref(),
            allow_cache,
            Some(&[("paths", path.as_str())]),
        )
        .await
        {
            Ok(envelope) => envelope,
            // A path the upstream has nothing for just contributes no
            // entries.
            Err(ApiError::EntryNotFound) => continue,
            Err(err) => return Err(err),
        };
        if envelope.status_code != 200 {
            continue;
        }
        let parsed: serde_json::Value = serde_json::from_slice(&envelope.content)
            .map_err(|_| {
                ApiError::ProxyInvalidData("paths-info reply was not JSON".to_string())
            })?;
        match parsed {
            serde_json::Value::Array(items) => merged.extend(items),
            _ => {
                return Err(ApiError::ProxyInvalidData(
                    "paths-info reply was not a JSON array".to_string(),
                ))
            }
        }
    }

    let body = serde_json::to_vec(&merged).map_err(|err| ApiError::Internal(err.to_string()))?;
    Ok((
        StatusCode::OK,
        [(CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response())
}
