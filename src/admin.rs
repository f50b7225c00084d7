//! Built-in routes served beside the mirror: the local image directory and
//! the status endpoint that reloads the site registry.

use crate::classify;
use crate::config::ServerConfig;
use crate::registry::SiteRegistry;
use crate::upstream::UpstreamStats;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Response, StatusCode};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Version information for the mirror
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
pub(crate) fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
pub(crate) fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .header("x-mirror-version", format!("{}/{}", PKG_NAME, VERSION))
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}

/// Where a request goes before any site lookup happens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Image,
    Status,
    Mirror,
}

#[derive(Debug, Clone)]
pub struct Routes {
    image_prefix: String,
    image_root: PathBuf,
    status_path: String,
}

impl Routes {
    pub fn new(image_prefix: impl Into<String>, image_root: impl Into<PathBuf>, status_path: impl Into<String>) -> Self {
        Self {
            image_prefix: image_prefix.into(),
            image_root: image_root.into(),
            status_path: status_path.into(),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(&config.image_prefix, &config.image_root, &config.status_path)
    }

    pub fn image_root(&self) -> &Path {
        &self.image_root
    }

    pub fn route(&self, method: &Method, path: &str) -> Route {
        if path == self.status_path {
            Route::Status
        } else if method == Method::GET && path.starts_with(&self.image_prefix) {
            Route::Image
        } else {
            Route::Mirror
        }
    }
}

/// File under `root` for the request path; `.`/`..` segments are dropped
pub fn image_file(root: &Path, path: &str) -> PathBuf {
    let mut file = root.to_path_buf();
    for segment in path.split('/') {
        match segment {
            "" | "." | ".." => continue,
            s if s.contains('\\') || s.contains('\0') => continue,
            s => file.push(s),
        }
    }
    file
}

/// Serve a file from the local image directory
pub async fn serve_image(root: &Path, path: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let file = image_file(root, path);
    match tokio::fs::read(&file).await {
        Ok(body) => {
            debug!(path = %file.display(), bytes = body.len(), "Serving local image");
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", classify::content_type_for_path(path))
                .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
                .expect("valid response with static content type")
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => response(StatusCode::NOT_FOUND, "not found"),
        Err(e) => {
            warn!(path = %file.display(), error = %e, "Failed to read local image");
            response(StatusCode::NOT_FOUND, "not found")
        }
    }
}

/// Reload the registry and report `{"code":200}`
pub async fn status(registry: Arc<SiteRegistry>, upstream: Arc<UpstreamStats>) -> Response<BoxBody<Bytes, hyper::Error>> {
    let result = tokio::task::spawn_blocking(move || registry.refresh()).await;
    match result {
        Ok(Ok(stats)) => {
            info!(
                bound = stats.bound,
                unbound = stats.unbound,
                origin_requests = upstream.get_total_requests(),
                origin_failures = upstream.get_failed_requests(),
                origin_bytes = upstream.get_bytes_received(),
                "Site registry reloaded via status endpoint"
            );
            json_response(StatusCode::OK, serde_json::json!({ "code": 200 }).to_string())
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Site registry reload failed");
            json_response(StatusCode::INTERNAL_SERVER_ERROR, serde_json::json!({ "code": 500 }).to_string())
        }
        Err(e) => {
            warn!(error = %e, "Site registry reload task failed");
            json_response(StatusCode::INTERNAL_SERVER_ERROR, serde_json::json!({ "code": 500 }).to_string())
        }
    }
}
