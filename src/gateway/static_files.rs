//! Static file serving for the dashboard.
//!
//! Files come from `gateway.web_dir` on disk. Unknown non-API paths fall back
//! to `index.html` so client-side routes resolve.

use super::AppState;
use axum::{
    extract::State,
    http::{StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use std::path::{Component, Path, PathBuf};

/// GET / and any unmatched path.
pub async fn handle_fallback(State(state): State<AppState>, uri: Uri) -> Response {
    let Some(web_dir) = state.web_dir.as_deref() else {
        return (StatusCode::NOT_FOUND, "Not found").into_response();
    };

    let requested = uri.path().trim_start_matches('/');
    if requested.starts_with("api/") || requested == "api" {
        return (StatusCode::NOT_FOUND, "Not found").into_response();
    }

    if let Some(path) = resolve(web_dir, requested) {
        if let Some(response) = serve_file(&path).await {
            return response;
        }
    }
    serve_file(&web_dir.join("index.html"))
        .await
        .unwrap_or_else(|| (StatusCode::NOT_FOUND, "Not found").into_response())
}

/// Map a request path onto `root`, refusing anything that could escape it.
fn resolve(root: &Path, requested: &str) -> Option<PathBuf> {
    if requested.is_empty() {
        return Some(root.join("index.html"));
    }
    let relative = Path::new(requested);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return None;
    }
    Some(root.join(relative))
}

async fn serve_file(path: &Path) -> Option<Response> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    if !metadata.is_file() {
        return None;
    }
    let content = tokio::fs::read(path).await.ok()?;
    let mime = mime_guess::from_path(path)
        .first_or_octet_stream()
        .to_string();
    let cache = if path.components().any(|c| c.as_os_str() == "assets") {
        // Hashed filenames, immutable cache
        "public, max-age=31536000, immutable"
    } else {
        "no-cache"
    };

    Some(
        (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, mime),
                (header::CACHE_CONTROL, cache.to_string()),
            ],
            content,
        )
            .into_response(),
    )
}
