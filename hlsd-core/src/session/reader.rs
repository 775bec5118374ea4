use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::process::ChildStdout;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Revision, Session};

/// A single read is taken as one complete playlist revision; revisions larger
/// than this arrive as several revisions and are not stitched together.
pub(crate) const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Consumes transcoder stdout for one generation. Output closing without a
/// shutdown ends the generation.
pub(super) async fn read_playlists(
    session: Arc<Session>,
    generation: u64,
    mut stdout: ChildStdout,
    handoff: watch::Sender<Option<String>>,
    shutdown: CancellationToken,
) {
    let mut handoff = Some(handoff);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(session = %session.name(), generation, "output reader stopped");
                return;
            }
            read = stdout.read(&mut buf) => read,
        };

        let n = match read {
            Ok(0) => {
                info!(session = %session.name(), generation, "transcoder output closed");
                session.stop_generation(generation);
                return;
            }
            Ok(n) => n,
            Err(err) => {
                warn!(session = %session.name(), generation, error = %err, "transcoder read failed");
                session.stop_generation(generation);
                return;
            }
        };

        let playlist = String::from_utf8_lossy(&buf[..n]).into_owned();
        match session.record_revision(generation, playlist) {
            Revision::Stale => return,
            Revision::Recorded { sequence } => {
                debug!(session = %session.name(), sequence, "received playlist");
            }
            Revision::Activated { sequence, playlist } => {
                info!(session = %session.name(), sequence, "stream active");
                // publish once, then close
                if let Some(handoff) = handoff.take() {
                    handoff.send_replace(Some(playlist));
                }
            }
        }
    }
}
