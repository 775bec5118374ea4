//! Direct transcoding: the profile's stdout is piped straight into the
//! response body. The unbuffered route ties the process to the response; the
//! buffered route lets the transcode run to completion on its own.

use std::io;
use std::process::Stdio;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use hlsd_core::ProfileCatalog;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::AppState;

pub const TRANSPORT_STREAM_CONTENT_TYPE: &str = "video/mp2t";

/// Chunks held between the transcoder and a slow client on the buffered route.
const BUFFERED_CHUNKS: usize = 64;

/// Logs when the response body, and with it the process, is dropped.
struct ProcessGuard {
    _child: Child,
    path: String,
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        info!(path = %self.path, "command stopped");
    }
}

pub async fn stream(
    State(state): State<AppState>,
    Path((profile, input)): Path<(String, String)>,
) -> Response {
    let path = format!("/{profile}/{input}");
    let (child, stdout) = match launch(&state, &state.http_profiles, &profile, &input, &path, true)
    {
        Ok(launched) => launched,
        Err(response) => return response,
    };

    let guard = ProcessGuard {
        _child: child,
        path,
    };
    let body = ReaderStream::new(stdout).map(move |chunk| {
        let _guard = &guard;
        chunk
    });
    transport_stream(Body::from_stream(body))
}

pub async fn stream_buffered(
    State(state): State<AppState>,
    Path((profile, input)): Path<(String, String)>,
) -> Response {
    let path = format!("/{profile}/{input}/buf");
    let (child, stdout) = match launch(&state, &state.profiles, &profile, &input, &path, false) {
        Ok(launched) => launched,
        Err(response) => return response,
    };

    let (tx, rx) = mpsc::channel(BUFFERED_CHUNKS);
    tokio::spawn(pump(path, child, stdout, tx));
    transport_stream(Body::from_stream(ReceiverStream::new(rx)))
}

fn transport_stream(body: Body) -> Response {
    ([(header::CONTENT_TYPE, TRANSPORT_STREAM_CONTENT_TYPE)], body).into_response()
}

/// Resolves and spawns `profile` for a configured stream; failures are
/// already turned into responses.
fn launch(
    state: &AppState,
    catalog: &ProfileCatalog,
    profile: &str,
    input: &str,
    path: &str,
    kill_on_drop: bool,
) -> Result<(Child, ChildStdout), Response> {
    let Some(source) = state.streams.get(input) else {
        warn!(%path, "unknown stream");
        return Err((StatusCode::NOT_FOUND, format!("unknown stream: {input}")).into_response());
    };

    let mut command = catalog.command(profile, source).map_err(|err| {
        warn!(%path, error = %err, "transcode could not be started");
        (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
    })?;
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(kill_on_drop);

    let mut child = command.spawn().map_err(|err| {
        warn!(%path, error = %err, "transcode could not be started");
        (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
    })?;
    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err((StatusCode::INTERNAL_SERVER_ERROR, "transcoder stdio was not captured")
            .into_response());
    };

    info!(%path, pid = child.id(), "command started");
    tokio::spawn(log_lines(path.to_string(), stderr));
    Ok((child, stdout))
}

/// Forwards transcoder output to the client until it goes away, then keeps
/// draining so the process can finish.
async fn pump(
    path: String,
    mut child: Child,
    stdout: ChildStdout,
    tx: mpsc::Sender<io::Result<Bytes>>,
) {
    let mut chunks = ReaderStream::new(stdout);
    let mut client = Some(tx);
    while let Some(chunk) = chunks.next().await {
        let Some(sender) = &client else {
            continue;
        };
        if sender.send(chunk).await.is_err() {
            debug!(%path, "client disconnected, draining output");
            client = None;
        }
    }
    drop(client);

    match child.wait().await {
        Ok(status) => info!(%path, %status, "command stopped"),
        Err(err) => warn!(%path, error = %err, "waiting for command failed"),
    }
}

async fn log_lines(path: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(%path, module = "ffmpeg", "{line}");
    }
}
