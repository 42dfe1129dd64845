//! End-to-end range streaming against a stub upstream: cold fills, warm
//! hits, mixed cache/remote splices, suffix ranges, LFS blobs.

mod common;

use axum::http::{header, Method, StatusCode};
use std::sync::atomic::Ordering;

use common::{mirror_state, send, spawn_hub, STUB_SHA};
use hubmirror_cache::{make_parent_dirs, BlockFile, RepoCoord, RepoType};
use hubmirror_server::{app, AppState};

const FILE: &str = "data.bin";
const BLOCK: u64 = 16;

fn coord() -> RepoCoord {
    RepoCoord::new(RepoType::Models, None, "gpt2".to_string())
}

fn container_path(state: &AppState) -> std::path::PathBuf {
    state.layout.file_path(&coord(), STUB_SHA, FILE)
}

/// Pre-creates the container with small blocks so the spec geometry
/// (B = 16, S = 40, N = 3) applies instead of the production default.
fn seed_container(state: &AppState) -> BlockFile {
    let path = container_path(state);
    make_parent_dirs(&path).unwrap();
    BlockFile::open(&path, BLOCK).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cold_get_full_range_fills_every_block() {
    let hub = spawn_hub(vec![b'A'; 40]).await;
    let dir = tempfile::tempdir().unwrap();
    let state = mirror_state(&dir, &hub);
    drop(seed_container(&state));
    let app = app(state.clone());

    let (status, headers, body) = send(
        &app,
        Method::GET,
        "/gpt2/resolve/main/data.bin",
        &[("range", "bytes=0-39")],
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], vec![b'A'; 40].as_slice());
    assert_eq!(headers[header::CONTENT_LENGTH], "40");
    assert_eq!(headers[header::ACCEPT_RANGES], "bytes");
    assert_eq!(headers[header::ETAG], "\"stub-etag\"");
    assert_eq!(headers["x-repo-commit"], STUB_SHA);
    assert!(headers[header::CACHE_CONTROL]
        .to_str()
        .unwrap()
        .contains("immutable"));

    // Exactly one upstream range fetch, covering the whole resource.
    assert_eq!(
        *hub.state.range_requests.lock().unwrap(),
        vec!["bytes=0-39".to_string()]
    );

    // All three blocks are now authoritative; the short final block is
    // zero-padded on disk past the 8 valid bytes.
    let container = BlockFile::open(container_path(&state), BLOCK).unwrap();
    for i in 0..3 {
        assert!(container.has_block_blocking(i).unwrap(), "block {i}");
    }
    let last = container.read_block_blocking(2).unwrap().unwrap();
    assert_eq!(&last[..8], &[b'A'; 8]);
    assert_eq!(&last[8..], &[0u8; 8]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn warm_partial_get_touches_no_upstream() {
    let hub = spawn_hub(vec![b'A'; 40]).await;
    let dir = tempfile::tempdir().unwrap();
    let state = mirror_state(&dir, &hub);
    drop(seed_container(&state));
    let app = app(state.clone());

    let (status, _, body) = send(
        &app,
        Method::GET,
        "/gpt2/resolve/main/data.bin",
        &[("range", "bytes=0-39")],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.len(), 40);
    assert_eq!(hub.state.head_count.load(Ordering::SeqCst), 1);

    let (status, headers, body) = send(
        &app,
        Method::GET,
        "/gpt2/resolve/main/data.bin",
        &[("range", "bytes=5-20")],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], vec![b'A'; 16].as_slice());
    assert_eq!(headers[header::CONTENT_LENGTH], "16");

    // The warm request replayed the cached head and served every byte
    // from the container: no new HEAD, no new range fetch.
    assert_eq!(hub.state.head_count.load(Ordering::SeqCst), 1);
    assert_eq!(hub.state.range_requests.lock().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mixed_get_splices_cache_and_remote() {
    let mut payload = vec![b'X'; 16];
    payload.extend_from_slice(&[b'Y'; 24]);
    let hub = spawn_hub(payload.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let state = mirror_state(&dir, &hub);

    // Block 0 is already cached; 1 and 2 are not.
    let container = seed_container(&state);
    container.resize_blocking(40).unwrap();
    container.write_block_blocking(0, &[b'X'; 16]).unwrap();
    drop(container);

    let app = app(state.clone());
    let (status, _, body) = send(
        &app,
        Method::GET,
        "/gpt2/resolve/main/data.bin",
        &[("range", "bytes=0-39")],
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], payload.as_slice());
    // Only the missing tail was fetched.
    assert_eq!(
        *hub.state.range_requests.lock().unwrap(),
        vec!["bytes=16-39".to_string()]
    );

    let container = BlockFile::open(container_path(&state), BLOCK).unwrap();
    assert!(container.has_block_blocking(1).unwrap());
    assert!(container.has_block_blocking(2).unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn suffix_range_serves_the_tail_with_padding_truncated() {
    let payload: Vec<u8> = (0..40).collect();
    let hub = spawn_hub(payload.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let state = mirror_state(&dir, &hub);
    drop(seed_container(&state));
    let app = app(state.clone());

    let (status, headers, body) = send(
        &app,
        Method::GET,
        "/gpt2/resolve/main/data.bin",
        &[("range", "bytes=-10")],
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_LENGTH], "10");
    assert_eq!(&body[..], &payload[30..]);
    assert_eq!(
        *hub.state.range_requests.lock().unwrap(),
        vec!["bytes=30-39".to_string()]
    );

    // The run began mid-block, so block 1 could not complete; the final
    // block was fully covered and persisted zero-padded.
    let container = BlockFile::open(container_path(&state), BLOCK).unwrap();
    assert!(!container.has_block_blocking(1).unwrap());
    assert!(container.has_block_blocking(2).unwrap());
    let last = container.read_block_blocking(2).unwrap().unwrap();
    assert_eq!(&last[..8], &payload[32..40]);
    assert_eq!(&last[8..], &[0u8; 8]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn head_serves_headers_without_a_body() {
    let hub = spawn_hub(vec![b'A'; 40]).await;
    let dir = tempfile::tempdir().unwrap();
    let state = mirror_state(&dir, &hub);
    let app = app(state.clone());

    let (status, headers, body) = send(
        &app,
        Method::HEAD,
        "/gpt2/resolve/main/data.bin",
        &[],
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
    assert_eq!(headers[header::CONTENT_LENGTH], "40");
    assert_eq!(headers[header::ACCEPT_RANGES], "bytes");
    assert_eq!(hub.state.range_requests.lock().unwrap().len(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lfs_blobs_cache_by_hash_and_replay() {
    let payload: Vec<u8> = (0..40).rev().collect();
    let hub = spawn_hub(payload.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let state = mirror_state(&dir, &hub);
    let app = app(state.clone());

    let (status, _, body) = send(&app, Method::GET, "/repos/aa/bb/hashrepo/hashfile", &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], payload.as_slice());
    assert_eq!(hub.state.range_requests.lock().unwrap().len(), 1);

    // The second fetch is served out of the lfs container.
    let (status, _, body) = send(&app, Method::GET, "/repos/aa/bb/hashrepo/hashfile", &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], payload.as_slice());
    assert_eq!(hub.state.range_requests.lock().unwrap().len(), 1);

    assert!(state
        .layout
        .lfs_file_path("aa", "bb", "hashrepo", "hashfile")
        .exists());
    assert!(state
        .layout
        .lfs_head_path("aa", "bb", "hashrepo", "hashfile")
        .exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_length_resources_emit_header_only() {
    let hub = spawn_hub(Vec::new()).await;
    let dir = tempfile::tempdir().unwrap();
    let state = mirror_state(&dir, &hub);
    let app = app(state.clone());

    let (status, headers, body) = send(&app, Method::GET, "/gpt2/resolve/main/data.bin", &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_LENGTH], "0");
    assert!(body.is_empty());
    assert_eq!(hub.state.range_requests.lock().unwrap().len(), 0);
}
