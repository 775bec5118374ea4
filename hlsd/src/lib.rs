pub mod passthrough;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{Path as UrlPath, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use clap::{Args, Parser, Subcommand, ValueEnum};
use hlsd_core::session::http::{media_not_found, serve_media, serve_playlist};
use hlsd_core::{
    load_server_config, ProfileCatalog, ServerConfig, SessionSummary, StreamRegistry,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] hlsd_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("profile error: {0}")]
    Profile(#[from] hlsd_core::ProfileError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "On-demand HLS transcoding server", long_about = None)]
pub struct Cli {
    /// Path to the server configuration
    #[arg(long, default_value = "config.toml")]
    pub config: PathBuf,
    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, default_value_t = false)]
    pub debug: bool,
    /// Output format for reports
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve streams over HTTP
    Serve(ServeArgs),
    /// Validate configuration and list streams and profiles
    Check,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on, overrides server.bind
    #[arg(long)]
    pub bind: Option<String>,
}

pub fn init_tracing(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = load_server_config(&cli.config)?;

    match &cli.command {
        Commands::Serve(args) => serve(&config, args).await,
        Commands::Check => {
            let report = check(&cli.config, &config)?;
            for entry in &report {
                render(entry, cli.format)?;
            }
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::MissingResource(
                    "one or more checks failed".to_string(),
                ));
            }
            Ok(())
        }
    }
}

/// State shared by every route: the session registry plus what the
/// pass-through handler needs.
#[derive(Debug, Clone)]
pub struct AppState {
    pub registry: Arc<StreamRegistry>,
    /// Profiles root, used by the buffered pass-through route.
    pub profiles: ProfileCatalog,
    pub http_profiles: ProfileCatalog,
    pub streams: Arc<BTreeMap<String, String>>,
}

impl AppState {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            registry: Arc::new(StreamRegistry::from_config(config)),
            profiles: ProfileCatalog::new(config.profiles_dir()),
            http_profiles: ProfileCatalog::new(config.http_profiles_dir()),
            streams: Arc::new(config.streams.clone()),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/hls/{profile}/{input}/playlist", get(hls_playlist))
        .route("/hls/{profile}/{input}/{file}", get(hls_media))
        .route("/{profile}/{input}", get(passthrough::stream))
        .route("/{profile}/{input}/buf", get(passthrough::stream_buffered))
        .with_state(state)
}

async fn serve(config: &ServerConfig, args: &ServeArgs) -> Result<()> {
    let bind = args.bind.clone().unwrap_or_else(|| config.server.bind.clone());
    let state = AppState::from_config(config);
    let app = router(state.clone());

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(%bind, streams = state.streams.len(), "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down sessions");
    state.registry.shutdown();
    // let the deferred working directory removal run before the runtime exits
    tokio::time::sleep(config.session.timings().remove_delay).await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

async fn health(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.registry.sessions())
}

async fn hls_playlist(
    State(state): State<AppState>,
    UrlPath((profile, input)): UrlPath<(String, String)>,
) -> Response {
    match state.registry.session(&profile, &input) {
        Ok(session) => serve_playlist(&session).await,
        Err(err) => {
            warn!(%profile, %input, error = %err, "session unavailable");
            err.into_response()
        }
    }
}

async fn hls_media(
    State(state): State<AppState>,
    UrlPath((profile, input, file)): UrlPath<(String, String, String)>,
) -> Response {
    match state.registry.get(&profile, &input) {
        Some(session) => serve_media(&session, &file).await,
        None => media_not_found(),
    }
}

fn check(config_path: &Path, config: &ServerConfig) -> Result<Vec<HealthEntry>> {
    let mut report = vec![HealthEntry::ok(
        "config",
        format!("{} (bind {})", config_path.display(), config.server.bind),
    )];

    if config.streams.is_empty() {
        report.push(HealthEntry::warn("streams", "no streams configured"));
    }
    for (name, source) in &config.streams {
        report.push(HealthEntry::ok(format!("stream {name}"), source.clone()));
    }

    for (label, catalog) in [
        ("hls profiles", ProfileCatalog::new(config.hls_profiles_dir())),
        ("http profiles", ProfileCatalog::new(config.http_profiles_dir())),
    ] {
        let profiles = catalog.list()?;
        let entry = if profiles.is_empty() {
            HealthEntry::error(label, format!("none found in {}", catalog.root().display()))
        } else {
            HealthEntry::ok(label, profiles.join(", "))
        };
        report.push(entry);
    }

    let buffered = ProfileCatalog::new(config.profiles_dir());
    let profiles = buffered.list()?;
    report.push(if profiles.is_empty() {
        HealthEntry::warn(
            "buffered profiles",
            format!("none found in {}", buffered.root().display()),
        )
    } else {
        HealthEntry::ok("buffered profiles", profiles.join(", "))
    });

    Ok(report)
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for HealthEntry {
    fn display(&self) -> String {
        format!(
            "[{status}] {name}: {detail}",
            status = self.status,
            name = self.name,
            detail = self.detail
        )
    }
}
