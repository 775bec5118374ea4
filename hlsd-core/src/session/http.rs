//! HTTP serving adapter for a [`Session`].

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio_util::io::ReaderStream;
use tracing::warn;

use super::{Session, SessionError};

pub const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

const HLS_HEADERS: [(HeaderName, &str); 2] = [
    (header::CONTENT_TYPE, PLAYLIST_CONTENT_TYPE),
    (header::CACHE_CONTROL, "no-cache"),
];

/// Routes for one session, meant to be nested under a per-stream prefix:
/// `/playlist` and `/{file}` for segments.
pub fn router(session: Arc<Session>) -> Router {
    Router::new()
        .route("/playlist", get(playlist))
        .route("/{file}", get(media))
        .with_state(session)
}

async fn playlist(State(session): State<Arc<Session>>) -> Response {
    serve_playlist(&session).await
}

async fn media(State(session): State<Arc<Session>>, Path(file): Path<String>) -> Response {
    serve_media(&session, &file).await
}

pub async fn serve_playlist(session: &Arc<Session>) -> Response {
    match session.playlist().await {
        Ok(playlist) => (HLS_HEADERS, playlist).into_response(),
        Err(err) => err.into_response(),
    }
}

/// Streams a segment from the working directory. Never starts the transcoder.
pub async fn serve_media(session: &Session, file: &str) -> Response {
    let Some(path) = session.media_path(file).await else {
        return media_not_found();
    };
    match tokio::fs::File::open(&path).await {
        Ok(file) => (HLS_HEADERS, Body::from_stream(ReaderStream::new(file))).into_response(),
        Err(err) => {
            // removed between lookup and open
            warn!(session = %session.name(), path = %path.display(), error = %err, "media file vanished");
            media_not_found()
        }
    }
}

pub fn media_not_found() -> Response {
    (StatusCode::NOT_FOUND, "404 media not found").into_response()
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        match self {
            SessionError::ShutDown => (StatusCode::NOT_FOUND, "404 playlist not found").into_response(),
            SessionError::Timeout => {
                (StatusCode::INTERNAL_SERVER_ERROR, "500 not available").into_response()
            }
            other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response(),
        }
    }
}
