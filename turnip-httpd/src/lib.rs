//! Git smart HTTP frontend.
//!
//! Translates smart HTTP requests into the extended pack protocol spoken by
//! the virt proxy, authenticating callers against the authorisation service
//! and mapping backend error packets onto HTTP statuses.
pub mod error;
mod git;

use std::net::SocketAddr;
use std::process::Command;
use std::str;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context as _;
use axum::body::Body;
use axum::http::Request;
use axum::routing::any;
use axum::Router;
use tower_http::trace::TraceLayer;

use turnip::virtinfo::{self, VirtInfo};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone)]
pub struct Options {
    pub listen: SocketAddr,
    /// Virt proxy address, `host:port`.
    pub backend: String,
    pub virtinfo_endpoint: String,
}

/// Shared handler state.
#[derive(Clone)]
pub struct Context {
    pub backend: String,
    pub virtinfo: Arc<dyn VirtInfo>,
    /// Output of `git version`, advertised to protocol-v2 clients.
    pub git_version: String,
}

/// Run the server.
pub async fn run(options: Options) -> anyhow::Result<()> {
    let git_version = Command::new("git")
        .arg("--version")
        .output()
        .context("'git' command must be available")?
        .stdout;
    let git_version = str::from_utf8(&git_version)?
        .trim()
        .strip_prefix("git version ")
        .unwrap_or("unknown")
        .to_owned();
    tracing::info!("git version {git_version}");
    tracing::info!("listening on http://{}", options.listen);

    let ctx = Context {
        backend: options.backend,
        virtinfo: Arc::new(virtinfo::Client::new(options.virtinfo_endpoint)),
        git_version,
    };
    let request_id = Arc::new(AtomicU64::new(1));
    let app = router(ctx)
        .layer(
            TraceLayer::new_for_http().make_span_with(move |_request: &Request<Body>| {
                tracing::info_span!(
                    "request",
                    id = request_id.fetch_add(1, Ordering::SeqCst)
                )
            }),
        )
        .into_make_service();

    axum_server::bind(options.listen)
        .serve(app)
        .await
        .map_err(anyhow::Error::from)
}

/// All the routes: the root answers OPTIONS for the load balancer's sake,
/// everything else resolves by path suffix.
pub fn router(ctx: Context) -> Router {
    Router::new()
        .route("/", any(git::root_handler))
        .fallback(git::git_handler)
        .with_state(ctx)
}

pub mod logger {
    pub use turnip::logger::init;
}
