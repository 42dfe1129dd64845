#![allow(dead_code)]

//! Shared test harness: a stub upstream hub and a mirror app wired at it.
//!
//! The stub knows two repositories: the orgless model `gpt2` and the
//! org'd model `openai/gpt2`, both at [`STUB_SHA`] on `main`. Dynamic
//! route segments use positional names because sibling routes must agree
//! on the parameter name at each position.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::{Path, RawForm, State};
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use hubmirror_server::{AppState, Config};

pub const STUB_SHA: &str = "0123456789abcdef0123456789abcdef01234567";

#[derive(Default)]
pub struct HubState {
    pub payload: Mutex<Vec<u8>>,
    /// HEAD probes of resource bodies (range fetches not included).
    pub head_count: AtomicUsize,
    /// GETs of the revision API endpoints.
    pub revision_count: AtomicUsize,
    /// Raw `range` header of every ranged body fetch, in order.
    pub range_requests: Mutex<Vec<String>>,
    /// When set, the resolve endpoints answer 302 with this location.
    pub redirect: Mutex<Option<String>>,
}

pub struct StubHub {
    pub base: String,
    pub state: Arc<HubState>,
}

fn known(org: Option<&str>, repo: &str) -> bool {
    matches!((org, repo), (None, "gpt2") | (Some("openai"), "gpt2"))
}

fn known_ref(reference: &str) -> bool {
    reference == "main" || reference == STUB_SHA
}

fn repo_json() -> Response {
    axum::Json(serde_json::json!({
        "sha": STUB_SHA,
        "lastModified": "2024-01-01T00:00:00Z",
    }))
    .into_response()
}

pub async fn spawn_hub(payload: Vec<u8>) -> StubHub {
    let state = Arc::new(HubState {
        payload: Mutex::new(payload),
        ..HubState::default()
    });
    let router = Router::new()
        .route("/api/models/:p3", get(api_repo_orgless))
        .route("/api/models/:p3/revision/:p5", get(api_revision_orgless))
        .route("/api/models/:p3/:p4", get(api_repo_org))
        .route("/api/models/:p3/:p4/revision/:p6", get(api_revision_org))
        .route("/api/models/:p3/:p4/tree/:p6", get(api_tree_org))
        .route("/api/models/:p3/:p4/paths-info/:p6", post(api_paths_info_org))
        .route("/:p1/resolve/:commit/*file", get(resolve_orgless))
        .route("/:p1/:p2/resolve/:commit/*file", get(resolve_org))
        .route("/repos/:p2/:p3/:p4/:p5", get(blob))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    StubHub {
        base: format!("http://{addr}"),
        state,
    }
}

async fn api_repo_orgless(Path(repo): Path<String>) -> Response {
    if known(None, &repo) {
        repo_json()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn api_repo_org(Path((org, repo)): Path<(String, String)>) -> Response {
    if known(Some(&org), &repo) {
        repo_json()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn api_revision_orgless(
    State(state): State<Arc<HubState>>,
    Path((repo, reference)): Path<(String, String)>,
    method: Method,
) -> Response {
    if !known(None, &repo) || !known_ref(&reference) {
        return StatusCode::NOT_FOUND.into_response();
    }
    if method == Method::GET {
        state.revision_count.fetch_add(1, Ordering::SeqCst);
    }
    repo_json()
}

async fn api_revision_org(
    State(state): State<Arc<HubState>>,
    Path((org, repo, reference)): Path<(String, String, String)>,
    method: Method,
) -> Response {
    if !known(Some(&org), &repo) || !known_ref(&reference) {
        return StatusCode::NOT_FOUND.into_response();
    }
    if method == Method::GET {
        state.revision_count.fetch_add(1, Ordering::SeqCst);
    }
    repo_json()
}

async fn api_tree_org(Path((org, repo, reference)): Path<(String, String, String)>) -> Response {
    if !known(Some(&org), &repo) || !known_ref(&reference) {
        return StatusCode::NOT_FOUND.into_response();
    }
    axum::Json(serde_json::json!([
        { "type": "file", "path": "config.json", "size": 12 },
    ]))
    .into_response()
}

async fn api_paths_info_org(
    Path((org, repo, reference)): Path<(String, String, String)>,
    RawForm(form): RawForm,
) -> Response {
    if !known(Some(&org), &repo) || !known_ref(&reference) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let path = url::form_urlencoded::parse(&form)
        .find(|(key, _)| key == "paths")
        .map(|(_, value)| value.into_owned())
        .unwrap_or_default();
    axum::Json(serde_json::json!([
        { "type": "file", "path": path, "size": 1 },
    ]))
    .into_response()
}

async fn resolve_orgless(
    State(state): State<Arc<HubState>>,
    Path((_repo, _commit, _file)): Path<(String, String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    resolve_common(&state, method, &headers)
}

async fn resolve_org(
    State(state): State<Arc<HubState>>,
    Path((_org, _repo, _commit, _file)): Path<(String, String, String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    resolve_common(&state, method, &headers)
}

fn resolve_common(state: &HubState, method: Method, headers: &HeaderMap) -> Response {
    if let Some(location) = state.redirect.lock().unwrap().clone() {
        return Response::builder()
            .status(StatusCode::FOUND)
            .header(header::LOCATION, location)
            .body(Body::empty())
            .unwrap();
    }
    serve_payload(state, method, headers)
}

async fn blob(
    State(state): State<Arc<HubState>>,
    Path((_d1, _d2, _d3, _d4)): Path<(String, String, String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    serve_payload(&state, method, &headers)
}

fn serve_payload(state: &HubState, method: Method, headers: &HeaderMap) -> Response {
    let payload = state.payload.lock().unwrap().clone();
    if let Some(range) = headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        state.range_requests.lock().unwrap().push(range.to_string());
        let spec = range.trim_start_matches("bytes=");
        let (start, end) = spec.split_once('-').unwrap();
        let start: usize = start.parse().unwrap();
        let end: usize = end.parse().unwrap();
        let slice = payload[start..=end].to_vec();
        return Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .header(
                header::CONTENT_RANGE,
                format!("bytes {start}-{end}/{}", payload.len()),
            )
            .body(Body::from(slice))
            .unwrap();
    }
    if method == Method::HEAD {
        state.head_count.fetch_add(1, Ordering::SeqCst);
    }
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "binary/octet-stream")
        .header(header::ETAG, "\"stub-etag\"")
        .body(Body::from(payload))
        .unwrap()
}

pub fn hub_netloc(base: &str) -> String {
    base.trim_start_matches("http://").to_string()
}

pub fn mirror_config(dir: &tempfile::TempDir, hub: &StubHub) -> Config {
    let netloc = hub_netloc(&hub.base);
    Config {
        hf_scheme: "http".to_string(),
        hf_netloc: netloc.clone(),
        hf_lfs_netloc: netloc,
        repos_path: dir.path().to_path_buf(),
        ..Config::default()
    }
}

pub fn mirror_state(dir: &tempfile::TempDir, hub: &StubHub) -> AppState {
    AppState::new(mirror_config(dir, hub)).unwrap()
}

/// Drives one request through the mirror router and collects the reply.
pub async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    extra_headers: &[(&str, &str)],
) -> (StatusCode, HeaderMap, bytes::Bytes) {
    send_with_body(app, method, uri, extra_headers, Body::empty()).await
}

pub async fn send_with_body(
    app: &Router,
    method: Method,
    uri: &str,
    extra_headers: &[(&str, &str)],
    body: Body,
) -> (StatusCode, HeaderMap, bytes::Bytes) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in extra_headers {
        builder = builder.header(*name, *value);
    }
    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, body)
}
