//! File-serving routes: `resolve` forms, the CDN alias, and LFS blobs.
//! Thin wrappers that resolve coordinates and commits, then hand off to
//! the streaming pipeline.

use axum::extract::{OriginalUri, Path as UrlPath, State};
use axum::http::header::RANGE;
use axum::http::{HeaderMap, Method, Uri};
use axum::response::{IntoResponse, Response};

use hubmirror_cache::{RepoCoord, RepoType};

use crate::api::{auth_header, gate_proxy, parse_repo_type, resolve_or_404};
use crate::error::ApiError;
use crate::pipeline::{stream_file, FileRequest};
use crate::state::AppState;
use crate::urls::join_base;

fn range_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(RANGE)
        .and_then(|value| value.to_str().ok())
        .map(String::from)
}

async fn serve_resolve(
    state: AppState,
    coord: RepoCoord,
    reference: String,
    file_path: String,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    gate_proxy(&state, &coord)?;
    let auth = auth_header(&headers);
    let sha = resolve_or_404(&state, &coord, Some(&reference), auth.as_deref()).await?;

    let head_path = state.layout.head_path(&coord, &sha, &file_path);
    let cache_path = state.layout.file_path(&coord, &sha, &file_path);

    // The hub serves model resolves at the bare `/{org_repo}/resolve/..`
    // form; datasets and spaces carry their type segment.
    let tail = match coord.repo_type {
        RepoType::Models => format!("/{}/resolve/{}/{}", coord.org_repo(), sha, file_path),
        _ => format!(
            "/{}/{}/resolve/{}/{}",
            coord.repo_type.as_str(),
            coord.org_repo(),
            sha,
            file_path
        ),
    };
    let upstream_url = join_base(&state.config.hf_url_base(), &tail)
        .ok_or_else(|| ApiError::Internal("cannot build upstream url".to_string()))?;

    let request = FileRequest {
        method,
        upstream_url,
        head_path,
        file_path: cache_path,
        authorization: auth,
        range: range_header(&headers),
        allow_cache: state.config.cache_rules.allow(&coord.org_repo()),
        commit: Some(sha),
    };
    Ok(stream_file(&state, request).await?.into_response())
}

/// `/{type}/{org}/{repo}/resolve/{commit}/{file}`.
pub async fn resolve_typed(
    State(state): State<AppState>,
    UrlPath((repo_type, org, repo, commit, file_path)): UrlPath<(
        String,
        String,
        String,
        String,
        String,
    )>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let repo_type = parse_repo_type(&repo_type)?;
    let coord = RepoCoord::new(repo_type, Some(org), repo);
    serve_resolve(state, coord, commit, file_path, method, headers).await
}

/// `/{org_or_type}/{repo}/resolve/{commit}/{file}` — compatibility form.
/// A leading segment that names a repo type selects an org-less repo of
/// that type; anything else is an `org/repo` under `models`.
pub async fn resolve_compat(
    State(state): State<AppState>,
    UrlPath((org_or_type, repo, commit, file_path)): UrlPath<(String, String, String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let coord = match org_or_type.parse::<RepoType>() {
        Ok(repo_type) => RepoCoord::new(repo_type, None, repo),
        Err(_) => RepoCoord::new(RepoType::Models, Some(org_or_type), repo),
    };
    serve_resolve(state, coord, commit, file_path, method, headers).await
}

/// `/{org_repo}/resolve/{commit}/{file}` — legacy models-only form for
/// single-segment repository names.
pub async fn resolve_legacy(
    State(state): State<AppState>,
    UrlPath((org_repo, commit, file_path)): UrlPath<(String, String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let coord = RepoCoord::new(RepoType::Models, None, org_repo);
    serve_resolve(state, coord, commit, file_path, method, headers).await
}

fn mirror_request_url(state: &AppState, uri: &Uri) -> Result<url::Url, ApiError> {
    let tail = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    join_base(&state.config.mirror_lfs_url_base(), tail)
        .ok_or_else(|| ApiError::Internal("cannot reconstruct request url".to_string()))
}

/// `/{org}/{repo}/{hash}` — CDN-style alias for `models` blobs. The
/// request URL itself (including any `oriloc`) names the upstream.
pub async fn cdn_alias(
    State(state): State<AppState>,
    UrlPath((org, repo, hash_file)): UrlPath<(String, String, String)>,
    OriginalUri(uri): OriginalUri,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let coord = RepoCoord::new(RepoType::Models, Some(org), repo);
    gate_proxy(&state, &coord)?;

    let request = FileRequest {
        method,
        upstream_url: mirror_request_url(&state, &uri)?,
        head_path: state.layout.cdn_head_path(&coord, &hash_file),
        file_path: state.layout.cdn_file_path(&coord, &hash_file),
        authorization: auth_header(&headers),
        range: range_header(&headers),
        allow_cache: state.config.cache_rules.allow(&coord.org_repo()),
        commit: None,
    };
    Ok(stream_file(&state, request).await?.into_response())
}

/// `/repos/{d1}/{d2}/{hash_repo}/{hash_file}` — LFS blob fetch, cached
/// purely by hash.
pub async fn lfs_blob(
    State(state): State<AppState>,
    UrlPath((d1, d2, hash_repo, hash_file)): UrlPath<(String, String, String, String)>,
    OriginalUri(uri): OriginalUri,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let request = FileRequest {
        method,
        upstream_url: mirror_request_url(&state, &uri)?,
        head_path: state.layout.lfs_head_path(&d1, &d2, &hash_repo, &hash_file),
        file_path: state.layout.lfs_file_path(&d1, &d2, &hash_repo, &hash_file),
        authorization: auth_header(&headers),
        range: range_header(&headers),
        allow_cache: true,
        commit: None,
    };
    Ok(stream_file(&state, request).await?.into_response())
}
