//! Caching mirror for a HuggingFace-compatible hub.
//!
//! Serves repository metadata and file payloads, transparently caching
//! both: small API replies as JSON envelopes, large payloads as
//! block-addressed containers that fill in as ranges stream through.

pub mod api;
pub mod config;
pub mod error;
pub mod http;
pub mod pipeline;
pub mod rules;
pub mod state;
pub mod upstream;
pub mod urls;

pub use config::{Args, Config};
pub use error::ApiError;
pub use state::AppState;

use axum::routing::{get, post};
use axum::Router;

/// The full route surface. Dynamic segments share positional names
/// (`p1`..`p3`) because sibling routes must agree on parameter names at
/// each position.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/:repo_type/:org/:repo", get(api::meta_root))
        .route(
            "/api/:repo_type/:org/:repo/revision/:commit",
            get(api::meta_revision),
        )
        .route(
            "/api/:repo_type/:org/:repo/tree/:commit",
            get(api::tree_root),
        )
        .route(
            "/api/:repo_type/:org/:repo/tree/:commit/*path",
            get(api::tree_path),
        )
        .route(
            "/api/:repo_type/:org/:repo/paths-info/:commit",
            post(api::paths_info),
        )
        .route(
            "/api/:repo_type/:org/:repo/commits/:commit",
            get(api::commits),
        )
        .route("/repos/:p1/:p2/:p3/:p4", get(http::lfs_blob))
        .route(
            "/:p1/:p2/:p3/resolve/:commit/*file_path",
            get(http::resolve_typed),
        )
        .route(
            "/:p1/:p2/resolve/:commit/*file_path",
            get(http::resolve_compat),
        )
        .route("/:p1/resolve/:commit/*file_path", get(http::resolve_legacy))
        .route("/:p1/:p2/:p3", get(http::cdn_alias))
        .fallback(fallback)
        .with_state(state)
}

async fn fallback() -> ApiError {
    ApiError::PageNotFound
}
