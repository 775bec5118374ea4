use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::profile::{ProfileCatalog, ProfileError};
use crate::session::{CommandFactory, Session, SessionEvents, SessionTimings};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown stream: {0}")]
    UnknownStream(String),
    #[error(transparent)]
    Profile(#[from] ProfileError),
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = match &self {
            RegistryError::UnknownStream(_)
            | RegistryError::Profile(ProfileError::NotFound(_))
            | RegistryError::Profile(ProfileError::InvalidName(_)) => StatusCode::NOT_FOUND,
            RegistryError::Profile(ProfileError::Io { .. }) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct SessionKey {
    profile: String,
    input: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub profile: String,
    pub input: String,
    pub running: bool,
    pub active: bool,
}

/// Sessions keyed by profile and stream, created on first use.
#[derive(Debug)]
pub struct StreamRegistry {
    streams: BTreeMap<String, String>,
    catalog: ProfileCatalog,
    timings: SessionTimings,
    events: SessionEvents,
    sessions: RwLock<HashMap<SessionKey, Arc<Session>>>,
}

impl StreamRegistry {
    pub fn new(
        streams: BTreeMap<String, String>,
        catalog: ProfileCatalog,
        timings: SessionTimings,
    ) -> Self {
        Self {
            streams,
            catalog,
            timings,
            events: SessionEvents::default(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            config.streams.clone(),
            ProfileCatalog::new(config.hls_profiles_dir()),
            config.session.timings(),
        )
    }

    /// Hooks installed on every session created afterwards.
    pub fn with_events(mut self, events: SessionEvents) -> Self {
        self.events = events;
        self
    }

    pub fn streams(&self) -> &BTreeMap<String, String> {
        &self.streams
    }

    pub fn catalog(&self) -> &ProfileCatalog {
        &self.catalog
    }

    /// Existing session, without creating one.
    pub fn get(&self, profile: &str, input: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(&key(profile, input)).cloned()
    }

    /// Returns the session for `profile`/`input`, creating it when needed.
    pub fn session(&self, profile: &str, input: &str) -> Result<Arc<Session>, RegistryError> {
        if let Some(session) = self.get(profile, input) {
            return Ok(session);
        }

        let source = self
            .streams
            .get(input)
            .ok_or_else(|| RegistryError::UnknownStream(input.to_string()))?;
        let script = self.catalog.resolve(profile)?;

        let factory: CommandFactory = Arc::new(move |input: &str| {
            let mut command = Command::new(&script);
            command.arg(input);
            command
        });

        let mut sessions = self.sessions.write();
        let session = sessions.entry(key(profile, input)).or_insert_with(|| {
            info!(profile, input, "registering session");
            Arc::new(
                Session::new(format!("{profile}/{input}"), source.clone(), factory)
                    .with_timings(self.timings.clone())
                    .with_events(self.events.clone()),
            )
        });
        Ok(Arc::clone(session))
    }

    pub fn sessions(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read();
        let mut summaries = sessions
            .iter()
            .map(|(key, session)| SessionSummary {
                profile: key.profile.clone(),
                input: key.input.clone(),
                running: session.is_running(),
                active: session.is_active(),
            })
            .collect::<Vec<_>>();
        summaries.sort_by(|a, b| (&a.profile, &a.input).cmp(&(&b.profile, &b.input)));
        summaries
    }

    /// Stops every session. Sessions stay registered and restart on demand.
    pub fn shutdown(&self) {
        let sessions = self.sessions.read().values().cloned().collect::<Vec<_>>();
        debug!(count = sessions.len(), "stopping sessions");
        for session in sessions {
            session.stop();
        }
    }
}

fn key(profile: &str, input: &str) -> SessionKey {
    SessionKey {
        profile: profile.to_string(),
        input: input.to_string(),
    }
}
