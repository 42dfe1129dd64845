//! The range-streaming pipeline.
//!
//! Services one `GET`/`HEAD` for a file resource: normalizes the upstream
//! URL, obtains the authoritative header (cached envelope, upstream HEAD,
//! or offline synthesis), projects the client-facing headers, then for
//! `GET` splices the requested byte range out of cached blocks and
//! upstream ranged fetches — persisting every block that becomes complete
//! along the way.

use std::path::PathBuf;

use axum::body::Body;
use axum::http::header::{
    ACCEPT_ENCODING, ACCEPT_RANGES, ACCESS_CONTROL_ALLOW_ORIGIN, AUTHORIZATION, CACHE_CONTROL,
    CONTENT_LENGTH, CONTENT_TYPE, ETAG, LOCATION, RANGE,
};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use url::Url;

use hubmirror_cache::{
    contiguous_runs, touch_access_time, BlockFile, Envelope, Run, DEFAULT_BLOCK_SIZE,
};
use hubmirror_http_range::{block_info, parse_range_header};

use crate::config::Config;
use crate::error::ApiError;
use crate::state::AppState;
use crate::urls::{has_query_param, join_base, netloc, query_param, url_tail};

pub const HEADER_X_REPO_COMMIT: &str = "x-repo-commit";
pub const HEADER_X_LINKED_ETAG: &str = "x-linked-etag";
pub const HEADER_X_LINKED_SIZE: &str = "x-linked-size";
/// Query parameter carrying the original CDN location through a
/// mirror-side redirect.
pub const ORIGINAL_LOC_PARAM: &str = "oriloc";

const CACHE_CONTROL_VALUE: &str = "public, max-age=604800, immutable, s-maxage=604800";
const BODY_CHANNEL_DEPTH: usize = 8;

/// One file-serving request, already resolved to concrete cache paths.
pub struct FileRequest {
    pub method: Method,
    pub upstream_url: Url,
    pub head_path: PathBuf,
    pub file_path: PathBuf,
    pub authorization: Option<String>,
    pub range: Option<String>,
    pub allow_cache: bool,
    /// Resolved commit sha, reflected back in `x-repo-commit`.
    pub commit: Option<String>,
}

pub struct FileResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}

impl IntoResponse for FileResponse {
    fn into_response(self) -> Response {
        (self.status, self.headers, self.body).into_response()
    }
}

pub async fn stream_file(state: &AppState, request: FileRequest) -> Result<FileResponse, ApiError> {
    let config = state.config.clone();
    let url = normalize_upstream_url(&config, &request.upstream_url)?;

    let mut envelope = full_header(state, &request, &url).await?;
    if envelope.status_code != 200 {
        return replay_envelope(&config, &envelope);
    }

    if config.offline && envelope.header("etag").is_none() {
        let digest = hex::encode(Sha256::digest(url.as_str().as_bytes()));
        envelope
            .headers
            .insert("etag".to_string(), format!("\"{}-10\"", &digest[..32]));
    }

    // A HEAD can answer without a known size (offline with nothing
    // cached); a GET cannot.
    let known_size: Option<u64> = envelope.header("content-length").and_then(|v| v.parse().ok());
    let size = match known_size {
        Some(size) => size,
        None if request.method == Method::HEAD => 0,
        None => {
            return Err(ApiError::ProxyInvalidData(
                "upstream header is missing content-length".to_string(),
            ))
        }
    };

    let range = match &request.range {
        Some(raw) if known_size.is_some() => Some(
            parse_range_header(raw)
                .map_err(|err| ApiError::BadRange(err.to_string()))
                .and_then(|spec| {
                    spec.resolve(size)
                        .map_err(|err| ApiError::BadRange(err.to_string()))
                })?,
        ),
        _ => None,
    };
    let (start, end) = match range {
        Some(range) => (range.start, range.end),
        None => (0, size),
    };

    let mut headers = project_headers(&config, &envelope, request.commit.as_deref());
    if known_size.is_some() {
        headers.insert(
            CONTENT_LENGTH,
            HeaderValue::from_str(&(end - start).to_string())
                .map_err(|err| ApiError::Internal(err.to_string()))?,
        );
    }

    if request.method == Method::HEAD || start >= end {
        return Ok(FileResponse {
            status: StatusCode::OK,
            headers,
            body: Body::empty(),
        });
    }

    let container = state
        .registry
        .open_or_create(&request.file_path, DEFAULT_BLOCK_SIZE)
        .await?;
    if container.file_size() < size {
        container.resize(size).await?;
    }
    touch_access_time(&request.file_path);

    let runs = {
        let container = container.clone();
        tokio::task::spawn_blocking(move || contiguous_runs(&container, start, end))
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))??
    };

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(BODY_CHANNEL_DEPTH);
    let client = state.upstream.stream().clone();
    let authorization = request.authorization.clone();
    let allow_cache = request.allow_cache;
    tokio::spawn(async move {
        for run in runs {
            let result = if run.remote {
                stream_remote_run(
                    &client,
                    &url,
                    authorization.as_deref(),
                    &container,
                    run,
                    allow_cache,
                    &tx,
                )
                .await
            } else {
                stream_cached_run(&container, run, &tx).await
            };
            match result {
                Ok(()) => {}
                Err(StreamAbort::ClientGone) => {
                    debug!("client went away mid-stream");
                    return;
                }
                Err(StreamAbort::Failed(err)) => {
                    warn!(error = %err, "file stream failed");
                    let _ = tx.send(Err(std::io::Error::other(err.to_string()))).await;
                    return;
                }
            }
        }
    });

    Ok(FileResponse {
        status: StatusCode::OK,
        headers,
        body: Body::from_stream(ReceiverStream::new(rx)),
    })
}

/// Step 1: recover the true upstream target. A URL carrying `oriloc` was
/// minted by a prior mirror-side redirect; otherwise any non-upstream
/// host (i.e. our own) is re-rooted onto the LFS base.
fn normalize_upstream_url(config: &Config, url: &Url) -> Result<Url, ApiError> {
    if let Some(original) = query_param(url, ORIGINAL_LOC_PARAM) {
        return Url::parse(&original)
            .map_err(|_| ApiError::ProxyInvalidData("malformed oriloc parameter".to_string()));
    }
    let loc = netloc(url);
    if loc != config.hf_netloc && loc != config.hf_lfs_netloc {
        return join_base(&config.hf_lfs_url_base(), &url_tail(url)).ok_or_else(|| {
            ApiError::ProxyInvalidData("cannot map request onto the upstream LFS host".to_string())
        });
    }
    Ok(url.clone())
}

/// Step 2: the authoritative header for the resource — replayed from the
/// envelope cache, probed upstream (and cached), or synthesized offline.
async fn full_header(
    state: &AppState,
    request: &FileRequest,
    url: &Url,
) -> Result<Envelope, ApiError> {
    let config = &state.config;
    if request.head_path.exists() {
        return Ok(Envelope::read(&request.head_path)?);
    }
    if config.offline {
        return Ok(Envelope::new(200, std::iter::empty(), Vec::new()));
    }

    // The probe never carries the client's range; only authorization
    // crosses to the upstream.
    let mut probe = state.upstream.probe().head(url.clone());
    if let Some(auth) = &request.authorization {
        probe = probe.header(AUTHORIZATION, auth);
    }
    let response = probe.send().await.map_err(ApiError::from)?;
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

    match status.as_u16() {
        200 => {
            if request.allow_cache {
                envelope.write_atomic(&request.head_path)?;
            }
        }
        300..=399 => {
            if envelope.header("location").is_none() {
                return Err(ApiError::ProxyInvalidData(
                    "upstream redirect without a location".to_string(),
                ));
            }
            if request.allow_cache {
                envelope.write_atomic(&request.head_path)?;
            }
        }
        // Auth failures pass through verbatim and are never cached.
        403 => {}
        other => {
            return Err(ApiError::ProxyInvalidData(format!(
                "unexpected upstream status {other}"
            )));
        }
    }
    Ok(envelope)
}

/// Step 3: client-facing headers derived from the envelope.
fn project_headers(config: &Config, envelope: &Envelope, commit: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static(CACHE_CONTROL_VALUE));

    for name in [
        CONTENT_TYPE,
        ETAG,
        HeaderName::from_static(HEADER_X_REPO_COMMIT),
        HeaderName::from_static(HEADER_X_LINKED_ETAG),
        HeaderName::from_static(HEADER_X_LINKED_SIZE),
    ] {
        if let Some(value) = envelope.header(name.as_str()) {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.insert(name, value);
            }
        }
    }
    if let Some(commit) = commit {
        if let Ok(value) = HeaderValue::from_str(commit) {
            headers.insert(HeaderName::from_static(HEADER_X_REPO_COMMIT), value);
        }
    }
    if let Some(location) = envelope.header("location") {
        if let Ok(value) = HeaderValue::from_str(&rewrite_location(config, location)) {
            headers.insert(LOCATION, value);
        }
    }
    headers
}

/// Rewrites an absolute upstream Location onto the mirror's LFS base,
/// carrying the original target in `oriloc`. Relative locations and
/// locations that already carry `oriloc` (loop guard) pass unchanged.
pub fn rewrite_location(config: &Config, location: &str) -> String {
    let Ok(url) = Url::parse(location) else {
        return location.to_string();
    };
    if url.host_str().map_or(true, str::is_empty) {
        return location.to_string();
    }
    if has_query_param(&url, ORIGINAL_LOC_PARAM) {
        return location.to_string();
    }
    match join_base(&config.mirror_lfs_url_base(), &url_tail(&url)) {
        Some(mirror) => {
            crate::urls::add_query_param(&mirror, ORIGINAL_LOC_PARAM, location).to_string()
        }
        None => location.to_string(),
    }
}

/// Serves a cached non-200 envelope verbatim (Location rewritten).
fn replay_envelope(config: &Config, envelope: &Envelope) -> Result<FileResponse, ApiError> {
    let status = StatusCode::from_u16(envelope.status_code)
        .map_err(|err| ApiError::ProxyInvalidData(err.to_string()))?;
    let mut headers = HeaderMap::new();
    for (name, value) in &envelope.headers {
        if matches!(
            name.as_str(),
            "connection" | "keep-alive" | "transfer-encoding" | "upgrade" | "content-length"
        ) {
            continue;
        }
        let value = if name == "location" {
            rewrite_location(config, value)
        } else {
            value.clone()
        };
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            headers.insert(name, value);
        }
    }
    if let Ok(len) = HeaderValue::from_str(&envelope.content.len().to_string()) {
        headers.insert(CONTENT_LENGTH, len);
    }
    Ok(FileResponse {
        status,
        headers,
        body: Body::from(envelope.content.clone()),
    })
}

enum StreamAbort {
    ClientGone,
    Failed(ApiError),
}

type BodySender = mpsc::Sender<Result<Bytes, std::io::Error>>;

/// Serves one fully-cached run out of the container.
async fn stream_cached_run(
    container: &BlockFile,
    run: Run,
    tx: &BodySender,
) -> Result<(), StreamAbort> {
    let block_size = container.block_size();
    let file_size = container.file_size();
    let mut pos = run.start;
    let mut sent = 0u64;
    while pos < run.end {
        let info = block_info(pos, block_size, file_size);
        let block = container
            .read_block(info.index)
            .await
            .map_err(|err| StreamAbort::Failed(err.into()))?
            .ok_or_else(|| {
                StreamAbort::Failed(ApiError::Internal(format!(
                    "cache corrupt: block {} vanished mid-stream",
                    info.index
                )))
            })?;
        let lo = (pos - info.start) as usize;
        let hi = (run.end.min(info.end) - info.start) as usize;
        let chunk = block.slice(lo..hi);
        sent += chunk.len() as u64;
        if tx.send(Ok(chunk)).await.is_err() {
            return Err(StreamAbort::ClientGone);
        }
        pos = info.end.min(run.end);
    }
    if sent != run.len() {
        return Err(StreamAbort::Failed(ApiError::Internal(format!(
            "cache corrupt: served {sent} bytes of a {}-byte run",
            run.len()
        ))));
    }
    Ok(())
}

/// Fetches one remote run with an upstream ranged GET, yielding bytes to
/// the client as they arrive and persisting every block that becomes
/// complete. Only the `authorization` header is forwarded upstream.
async fn stream_remote_run(
    client: &reqwest::Client,
    url: &Url,
    authorization: Option<&str>,
    container: &BlockFile,
    run: Run,
    allow_cache: bool,
    tx: &BodySender,
) -> Result<(), StreamAbort> {
    let block_size = container.block_size();
    let file_size = container.file_size();

    let mut request = client
        .get(url.clone())
        .header(RANGE, format!("bytes={}-{}", run.start, run.end - 1))
        .header(ACCEPT_ENCODING, "identity");
    if let Some(auth) = authorization {
        request = request.header(AUTHORIZATION, auth);
    }
    let response = request
        .send()
        .await
        .map_err(|err| StreamAbort::Failed(err.into()))?;
    if !matches!(response.status().as_u16(), 200 | 206) {
        return Err(StreamAbort::Failed(ApiError::ProxyInvalidData(format!(
            "upstream range fetch returned {}",
            response.status()
        ))));
    }

    let mut body = response.bytes_stream();
    let mut received = 0u64;
    // Bytes of the block currently being assembled; `acc_start` is the
    // absolute offset of its first byte.
    let mut acc = BytesMut::new();
    let mut acc_start = run.start;

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|err| StreamAbort::Failed(err.into()))?;
        if chunk.is_empty() {
            continue;
        }
        received += chunk.len() as u64;
        if received > run.len() {
            return Err(StreamAbort::Failed(ApiError::ProxyInvalidData(format!(
                "upstream sent more than the requested {} bytes",
                run.len()
            ))));
        }
        if tx.send(Ok(chunk.clone())).await.is_err() {
            return Err(StreamAbort::ClientGone);
        }
        if !allow_cache {
            continue;
        }

        acc.extend_from_slice(&chunk);
        loop {
            if acc_start >= run.end {
                break;
            }
            let info = block_info(acc_start, block_size, file_size);
            let have_end = acc_start + acc.len() as u64;
            if have_end < info.end {
                break;
            }
            let head = acc.split_to((info.end - acc_start) as usize);
            // A run that begins mid-block cannot complete that block;
            // only persist when the buffer spans the whole block.
            if acc_start == info.start {
                let has = container
                    .has_block_blocking(info.index)
                    .map_err(|err| StreamAbort::Failed(err.into()))?;
                if !has {
                    let mut block = head;
                    block.resize(block_size as usize, 0);
                    container
                        .write_block(info.index, block.freeze())
                        .await
                        .map_err(|err| StreamAbort::Failed(err.into()))?;
                }
            }
            acc_start = info.end;
        }
    }

    if received != run.len() {
        return Err(StreamAbort::Failed(ApiError::Internal(format!(
            "short read from upstream: got {received} of {} bytes",
            run.len()
        ))));
    }
    Ok(())
}
