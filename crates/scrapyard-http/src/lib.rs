//! Local HTTP surface serving cached site bundles.
//!
//! `GET /local/{siteId}/{path...}` resolves a blob from the local content
//! store with the usual static-site fallbacks (directory index files, bare
//! paths mapping to `.html`, and a root-level any-html rescue) and serves it
//! with its stored content type plus an `X-Origin: cached` marker. Missing
//! paths get a 404 whose body lists what the site actually contains.

use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use scrapyard_store::{FileStore, StoreError, StoredFile};

/// Marker header distinguishing cache hits from live fetches.
pub const ORIGIN_HEADER: &str = "x-origin";

#[derive(Clone)]
pub struct HttpState {
    pub files: Arc<Mutex<FileStore>>,
}

pub fn build_router(state: HttpState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/local/{site_id}", get(serve_site_root))
        .route("/local/{site_id}/", get(serve_site_root))
        .route("/local/{site_id}/{*path}", get(serve_site_path))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Outcome of a lookup against the content store.
pub enum Resolution {
    Found(StoredFile),
    /// Nothing matched; carries the site's stored paths as a diagnostic.
    NotFound { available: Vec<String> },
}

/// Resolve a request path to a stored blob.
///
/// `rest` is the path after `/local/{siteId}/`, possibly empty. Fallback
/// order: the literal path (empty or trailing-slash paths get `index.html`
/// appended), then for extensionless paths `{path}.html` and
/// `{path}/index.html`, and for the site root any top-level `index.html`
/// (case-insensitive) or failing that any top-level `.html` file.
pub fn resolve(files: &FileStore, site_id: &str, rest: &str) -> Result<Resolution, StoreError> {
    let mut fp = if rest.is_empty() {
        "index.html".to_string()
    } else {
        rest.to_string()
    };
    if fp.ends_with('/') {
        fp.push_str("index.html");
    }

    if let Some(file) = files.get(site_id, &fp)? {
        return Ok(Resolution::Found(file));
    }

    let last_segment = fp.rsplit('/').next().unwrap_or(&fp);
    if !last_segment.contains('.') {
        if let Some(file) = files.get(site_id, &format!("{fp}.html"))? {
            return Ok(Resolution::Found(file));
        }
        if let Some(file) = files.get(site_id, &format!("{fp}/index.html"))? {
            return Ok(Resolution::Found(file));
        }
    }

    let available: Vec<String> = files
        .list_entries(site_id)?
        .into_iter()
        .map(|e| e.path)
        .collect();

    if rest.is_empty() {
        let top_level = |p: &str| !p.contains('/');
        let rescue = available
            .iter()
            .find(|p| top_level(p) && p.eq_ignore_ascii_case("index.html"))
            .or_else(|| {
                available
                    .iter()
                    .find(|p| top_level(p) && p.to_ascii_lowercase().ends_with(".html"))
            });
        if let Some(path) = rescue {
            if let Some(file) = files.get(site_id, path)? {
                return Ok(Resolution::Found(file));
            }
        }
    }

    Ok(Resolution::NotFound { available })
}

async fn serve_site_root(
    State(state): State<HttpState>,
    Path(site_id): Path<String>,
) -> Response {
    serve(&state, &site_id, "")
}

async fn serve_site_path(
    State(state): State<HttpState>,
    Path((site_id, path)): Path<(String, String)>,
) -> Response {
    serve(&state, &site_id, &path)
}

fn serve(state: &HttpState, site_id: &str, rest: &str) -> Response {
    let resolution = {
        let files = state.files.lock().expect("file store lock");
        resolve(&files, site_id, rest)
    };

    match resolution {
        Ok(Resolution::Found(file)) => {
            let content_type = HeaderValue::from_str(&file.content_type)
                .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
            (
                [
                    (header::CONTENT_TYPE, content_type),
                    (
                        header::HeaderName::from_static(ORIGIN_HEADER),
                        HeaderValue::from_static("cached"),
                    ),
                ],
                Body::from(file.bytes),
            )
                .into_response()
        }
        Ok(Resolution::NotFound { available }) => {
            let mut body = format!("File not found: /local/{site_id}/{rest}\n\nAvailable files:\n");
            if available.is_empty() {
                body.push_str("  (none cached for this site)\n");
            }
            for path in available {
                body.push_str("  ");
                body.push_str(&path);
                body.push('\n');
            }
            (StatusCode::NOT_FOUND, body).into_response()
        }
        Err(e) => {
            warn!(site = site_id, path = rest, error = %e, "content store lookup failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "content store failure").into_response()
        }
    }
}
