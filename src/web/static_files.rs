use axum::{
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use rust_embed::Embed;

/// Viewer page and its assets
#[derive(Embed)]
#[folder = "web/"]
pub struct StaticAssets;

pub async fn index_handler() -> Response {
    serve_file("index.html")
}

pub async fn static_handler(uri: Uri) -> Response {
    serve_file(uri.path().trim_start_matches('/'))
}

fn serve_file(path: &str) -> Response {
    match StaticAssets::get(path) {
        Some(asset) => {
            let mime = mime_guess::from_path(path)
                .first_or_octet_stream()
                .to_string();
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, mime),
                    (header::CACHE_CONTROL, "no-cache".to_string()),
                ],
                asset.data.into_owned(),
            )
                .into_response()
        }
        None => {
            tracing::debug!("Static file not found: {}", path);
            (StatusCode::NOT_FOUND, "Not Found").into_response()
        }
    }
}
