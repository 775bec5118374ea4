//! On-demand transcoding sessions.
//!
//! A [`Session`] owns at most one transcoder subprocess at a time. The
//! subprocess is started lazily by the first playlist request, its stdout is
//! read as a sequence of complete playlist revisions, and it is killed (with
//! its whole process group) once nobody has asked for the stream for a while.
//! Every start/stop cycle is a generation with its own working directory,
//! shutdown token and first-playlist handoff.

pub mod http;
mod process;
mod reader;
mod reaper;

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use tempfile::TempDir;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use self::reaper::should_stop;

/// Builds the transcoder command for a session input.
///
/// The session overrides the working directory, stdio and process group of
/// whatever the factory returns.
pub type CommandFactory = Arc<dyn Fn(&str) -> Command + Send + Sync>;

type Hook = Arc<dyn Fn() + Send + Sync>;
type LogHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("has already started")]
    AlreadyStarted,
    #[error("could not create working directory: {0}")]
    WorkDir(#[source] std::io::Error),
    #[error("{0}")]
    Launch(#[source] std::io::Error),
    #[error("session was shut down before the playlist became available")]
    ShutDown,
    #[error("timed out waiting for the first playlist")]
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTimings {
    /// How often the idle reaper evaluates the session.
    pub reaper_period: Duration,
    /// Upper bound for a request waiting on the first playlist.
    pub playlist_timeout: Duration,
    /// Playlist revisions required before the stream counts as active.
    pub minimum_sequences: u64,
    /// Idle time after which an active stream is stopped.
    pub active_idle_timeout: Duration,
    /// Idle time after which a stream that never became active is stopped.
    pub inactive_idle_timeout: Duration,
    /// Grace period between stop and working directory removal.
    pub remove_delay: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            reaper_period: Duration::from_secs(4),
            playlist_timeout: Duration::from_secs(20),
            minimum_sequences: 2,
            active_idle_timeout: Duration::from_secs(12),
            inactive_idle_timeout: Duration::from_secs(24),
            remove_delay: Duration::from_secs(2),
        }
    }
}

/// Observational callbacks. They run on the session's own tasks and must
/// return quickly.
#[derive(Clone, Default)]
pub struct SessionEvents {
    pub on_start: Option<Hook>,
    pub on_log: Option<LogHook>,
    pub on_stop: Option<Hook>,
}

impl SessionEvents {
    pub fn on_start(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_start = Some(Arc::new(hook));
        self
    }

    pub fn on_log(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_log = Some(Arc::new(hook));
        self
    }

    pub fn on_stop(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_stop = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for SessionEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionEvents")
            .field("on_start", &self.on_start.is_some())
            .field("on_log", &self.on_log.is_some())
            .field("on_stop", &self.on_stop.is_some())
            .finish()
    }
}

struct Running {
    child: Child,
    workdir: TempDir,
}

struct SessionState {
    generation: u64,
    running: Option<Running>,
    workdir: Option<PathBuf>,
    last_request: Instant,
    active: bool,
    sequence: u64,
    playlist: String,
    handoff: watch::Receiver<Option<String>>,
    shutdown: CancellationToken,
}

pub(crate) enum Revision {
    /// The writer belongs to a superseded generation.
    Stale,
    Recorded { sequence: u64 },
    Activated { sequence: u64, playlist: String },
}

pub struct Session {
    name: String,
    input: String,
    factory: CommandFactory,
    timings: SessionTimings,
    events: SessionEvents,
    state: Mutex<SessionState>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("input", &self.input)
            .field("timings", &self.timings)
            .field("events", &self.events)
            .finish()
    }
}

impl Session {
    pub fn new(name: impl Into<String>, input: impl Into<String>, factory: CommandFactory) -> Self {
        let (_, handoff) = watch::channel(None);
        Self {
            name: name.into(),
            input: input.into(),
            factory,
            timings: SessionTimings::default(),
            events: SessionEvents::default(),
            state: Mutex::new(SessionState {
                generation: 0,
                running: None,
                workdir: None,
                last_request: Instant::now(),
                active: false,
                sequence: 0,
                playlist: String::new(),
                handoff,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn with_timings(mut self, timings: SessionTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_events(mut self, events: SessionEvents) -> Self {
        self.events = events;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timings(&self) -> &SessionTimings {
        &self.timings
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn sequence(&self) -> u64 {
        self.state.lock().sequence
    }

    pub fn current_playlist(&self) -> String {
        self.state.lock().playlist.clone()
    }

    /// Working directory of the current (or most recently stopped) generation.
    pub fn workdir(&self) -> Option<PathBuf> {
        self.state.lock().workdir.clone()
    }

    /// Pid of the running subprocess.
    pub fn pid(&self) -> Option<u32> {
        self.state
            .lock()
            .running
            .as_ref()
            .and_then(|running| running.child.id())
    }

    /// Records request activity for the idle reaper.
    pub fn touch(&self) {
        self.state.lock().last_request = Instant::now();
    }

    /// Launches a new generation.
    ///
    /// Must be called from within a tokio runtime: the output reader, the
    /// stderr logger and the idle reaper are spawned as tasks.
    pub fn start(self: &Arc<Self>) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        if state.running.is_some() {
            return Err(SessionError::AlreadyStarted);
        }

        debug!(session = %self.name, "performing start");

        let workdir = tempfile::Builder::new()
            .prefix("hlsd-")
            .tempdir()
            .map_err(SessionError::WorkDir)?;

        let mut command = (self.factory)(&self.input);
        command
            .current_dir(workdir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        process::isolate_process_group(&mut command);

        let mut child = command.spawn().map_err(SessionError::Launch)?;
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            process::kill_process_group(&mut child, &self.name);
            return Err(SessionError::Launch(std::io::Error::other(
                "subprocess stdio was not captured",
            )));
        };

        let (handoff_tx, handoff_rx) = watch::channel(None);
        let shutdown = CancellationToken::new();

        state.generation += 1;
        let generation = state.generation;
        state.active = false;
        state.sequence = 0;
        state.playlist.clear();
        state.last_request = Instant::now();
        state.handoff = handoff_rx;
        state.shutdown = shutdown.clone();
        state.workdir = Some(workdir.path().to_path_buf());

        info!(
            session = %self.name,
            generation,
            pid = child.id(),
            workdir = %workdir.path().display(),
            "transcoder started"
        );
        state.running = Some(Running { child, workdir });
        drop(state);

        tokio::spawn(reader::read_playlists(
            Arc::clone(self),
            generation,
            stdout,
            handoff_tx,
            shutdown.clone(),
        ));
        tokio::spawn(process::log_stderr(
            self.name.clone(),
            stderr,
            self.events.on_log.clone(),
        ));
        tokio::spawn(reaper::reap_idle(Arc::clone(self), shutdown));

        if let Some(hook) = &self.events.on_start {
            hook();
        }
        Ok(())
    }

    /// Kills the running generation. A no-op when nothing is running.
    ///
    /// The handle is released immediately; reaping the child and removing the
    /// working directory happen in the background.
    pub fn stop(&self) {
        self.stop_locked(self.state.lock());
    }

    /// Ends `generation` if it is still the current one. Used when the
    /// transcoder output closes on its own.
    pub(crate) fn stop_generation(&self, generation: u64) {
        let state = self.state.lock();
        if state.generation != generation {
            return;
        }
        self.stop_locked(state);
    }

    fn stop_locked(&self, mut state: MutexGuard<'_, SessionState>) {
        let Some(Running { mut child, workdir }) = state.running.take() else {
            return;
        };

        debug!(session = %self.name, generation = state.generation, "performing stop");
        state.shutdown.cancel();
        process::kill_process_group(&mut child, &self.name);
        drop(state);

        let name = self.name.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(session = %name, %status, "transcoder exited"),
                Err(err) => warn!(session = %name, error = %err, "waiting for transcoder failed"),
            }
        });

        let name = self.name.clone();
        let delay = self.timings.remove_delay;
        tokio::spawn(async move {
            sleep(delay).await;
            remove_workdir(&name, workdir).await;
        });

        if let Some(hook) = &self.events.on_stop {
            hook();
        }
    }

    /// Stops the subprocess when it has been idle past its timeout tier.
    pub fn cleanup(&self) {
        let (idle, active, running) = {
            let state = self.state.lock();
            (
                state.last_request.elapsed(),
                state.active,
                state.running.is_some(),
            )
        };
        let stop = running && should_stop(active, idle, &self.timings);

        debug!(
            session = %self.name,
            idle_ms = idle.as_millis() as u64,
            active,
            stop,
            "performing cleanup"
        );

        if stop {
            self.stop();
        }
    }

    /// Returns the playlist, starting the transcoder and waiting for the
    /// first revisions when needed.
    pub async fn playlist(self: &Arc<Self>) -> Result<String, SessionError> {
        self.touch();

        if !self.is_running() {
            match self.start() {
                // another request won the race
                Ok(()) | Err(SessionError::AlreadyStarted) => {}
                Err(err) => {
                    warn!(session = %self.name, error = %err, "transcode could not be started");
                    return Err(err);
                }
            }
        }

        let (mut handoff, shutdown) = {
            let state = self.state.lock();
            if state.running.is_none() {
                return Err(SessionError::ShutDown);
            }
            if state.active {
                return Ok(state.playlist.clone());
            }
            (state.handoff.clone(), state.shutdown.clone())
        };

        tokio::select! {
            biased;
            playlist = wait_for_handoff(&mut handoff) => Ok(playlist),
            _ = shutdown.cancelled() => {
                warn!(session = %self.name, "playlist load failed because of shutdown");
                Err(SessionError::ShutDown)
            }
            _ = sleep(self.timings.playlist_timeout) => {
                warn!(session = %self.name, "playlist load timed out");
                Err(SessionError::Timeout)
            }
        }
    }

    /// Resolves a segment name inside the working directory. Only the final
    /// path component of `name` is used.
    pub async fn media_path(&self, name: &str) -> Option<PathBuf> {
        let file_name = media_file_name(name)?;
        let workdir = self.workdir()?;
        let path = workdir.join(file_name);

        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => {
                self.touch();
                Some(path)
            }
            _ => {
                warn!(session = %self.name, path = %path.display(), "media file not found");
                None
            }
        }
    }

    pub(crate) fn record_revision(&self, generation: u64, playlist: String) -> Revision {
        let mut state = self.state.lock();
        if state.generation != generation {
            return Revision::Stale;
        }
        state.playlist = playlist;
        state.sequence += 1;
        let sequence = state.sequence;
        if sequence == self.timings.minimum_sequences {
            state.active = true;
            Revision::Activated {
                sequence,
                playlist: state.playlist.clone(),
            }
        } else {
            Revision::Recorded { sequence }
        }
    }
}

async fn wait_for_handoff(handoff: &mut watch::Receiver<Option<String>>) -> String {
    let published = handoff
        .wait_for(Option::is_some)
        .await
        .ok()
        .and_then(|value| (*value).clone());
    match published {
        Some(playlist) => playlist,
        // the reader ended without activating; only shutdown or timeout remain
        None => std::future::pending().await,
    }
}

fn media_file_name(name: &str) -> Option<&Path> {
    let file_name = Path::new(name).file_name()?;
    if file_name.is_empty() {
        return None;
    }
    Some(Path::new(file_name))
}

async fn remove_workdir(name: &str, workdir: TempDir) {
    let path = workdir.path().to_path_buf();
    match tokio::task::spawn_blocking(move || workdir.close()).await {
        Ok(Ok(())) => debug!(session = %name, path = %path.display(), "removed working directory"),
        Ok(Err(err)) => {
            warn!(session = %name, path = %path.display(), error = %err, "removing working directory failed")
        }
        Err(err) => warn!(session = %name, error = %err, "working directory removal task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_names_lose_their_directories() {
        assert_eq!(media_file_name("segment1.ts"), Some(Path::new("segment1.ts")));
        assert_eq!(media_file_name("../../etc/passwd"), Some(Path::new("passwd")));
        assert_eq!(media_file_name("/abs/path/seg.ts"), Some(Path::new("seg.ts")));
        assert_eq!(media_file_name(".."), None);
        assert_eq!(media_file_name("a/.."), None);
        assert_eq!(media_file_name(""), None);
        assert_eq!(media_file_name("/"), None);
    }

    #[test]
    fn default_timings() {
        let timings = SessionTimings::default();
        assert_eq!(timings.minimum_sequences, 2);
        assert!(timings.inactive_idle_timeout > timings.active_idle_timeout);
        assert!(timings.playlist_timeout < timings.inactive_idle_timeout);
    }

    fn idle_session() -> Session {
        Session::new("test", "input", Arc::new(|_: &str| Command::new("true")))
    }

    #[test]
    fn revisions_from_stale_generations_are_dropped() {
        let session = idle_session();
        session.state.lock().generation = 3;
        assert!(matches!(
            session.record_revision(2, "#EXTM3U\nold".into()),
            Revision::Stale
        ));
        assert_eq!(session.sequence(), 0);
        assert_eq!(session.current_playlist(), "");
    }

    #[test]
    fn activation_fires_once_at_minimum() {
        let session = idle_session();
        session.state.lock().generation = 1;
        assert!(matches!(
            session.record_revision(1, "one".into()),
            Revision::Recorded { sequence: 1 }
        ));
        assert!(!session.is_active());
        match session.record_revision(1, "two".into()) {
            Revision::Activated { sequence, playlist } => {
                assert_eq!(sequence, 2);
                assert_eq!(playlist, "two");
            }
            _ => panic!("second revision should activate"),
        }
        assert!(session.is_active());
        assert!(matches!(
            session.record_revision(1, "three".into()),
            Revision::Recorded { sequence: 3 }
        ));
        assert_eq!(session.current_playlist(), "three");
        assert!(session.is_active());
    }

    #[test]
    fn playlist_future_is_send() {
        fn assert_send<T: Send>(_: T) {}
        let session = Arc::new(idle_session());
        assert_send(session.playlist());
    }

    #[tokio::test]
    async fn stop_without_subprocess_is_a_noop() {
        let stops = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&stops);
        let session = idle_session().with_events(SessionEvents::default().on_stop(move || {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));
        session.stop();
        session.stop();
        assert_eq!(stops.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert!(!session.is_running());
    }
}
