use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};
use crate::session::SessionTimings;

const DEFAULT_BASE_DIR: &str = "/etc/transcode";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub paths: PathsSection,
    /// Stream name to source url, handed to the profile script as its input.
    #[serde(default)]
    pub streams: BTreeMap<String, String>,
    #[serde(default)]
    pub session: SessionSection,
}

impl ServerConfig {
    /// Falls back to `/etc/transcode` when it exists, then to the current directory.
    pub fn base_dir(&self) -> PathBuf {
        if let Some(dir) = self.paths.base_dir.as_deref().filter(|dir| !dir.is_empty()) {
            return PathBuf::from(dir);
        }
        let system = Path::new(DEFAULT_BASE_DIR);
        if system.exists() {
            return system.to_path_buf();
        }
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
    }

    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir().join(path)
        }
    }

    pub fn profiles_dir(&self) -> PathBuf {
        let profiles = self.paths.profiles.as_deref().unwrap_or("profiles");
        self.resolve_path(profiles)
    }

    pub fn hls_profiles_dir(&self) -> PathBuf {
        self.profiles_dir().join("hls")
    }

    pub fn http_profiles_dir(&self) -> PathBuf {
        self.profiles_dir().join("http")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsSection {
    pub base_dir: Option<String>,
    pub profiles: Option<String>,
}

/// Timing overrides for every session, in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub reaper_period_ms: u64,
    pub playlist_timeout_ms: u64,
    pub minimum_sequences: u64,
    pub active_idle_timeout_ms: u64,
    pub inactive_idle_timeout_ms: u64,
    pub remove_delay_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        let timings = SessionTimings::default();
        Self {
            reaper_period_ms: millis(timings.reaper_period),
            playlist_timeout_ms: millis(timings.playlist_timeout),
            minimum_sequences: timings.minimum_sequences,
            active_idle_timeout_ms: millis(timings.active_idle_timeout),
            inactive_idle_timeout_ms: millis(timings.inactive_idle_timeout),
            remove_delay_ms: millis(timings.remove_delay),
        }
    }
}

impl SessionSection {
    pub fn timings(&self) -> SessionTimings {
        SessionTimings {
            reaper_period: Duration::from_millis(self.reaper_period_ms.max(1)),
            playlist_timeout: Duration::from_millis(self.playlist_timeout_ms),
            minimum_sequences: self.minimum_sequences.max(1),
            active_idle_timeout: Duration::from_millis(self.active_idle_timeout_ms),
            inactive_idle_timeout: Duration::from_millis(self.inactive_idle_timeout_ms),
            remove_delay: Duration::from_millis(self.remove_delay_ms),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub fn load_server_config<P: AsRef<Path>>(path: P) -> Result<ServerConfig> {
    let path = path.as_ref();
    let config: ServerConfig = load_toml(path)?;
    validate_streams(&config.streams, path)?;
    Ok(config)
}

/// Stream names become a single url segment; sources are passed to profiles.
fn validate_streams(streams: &BTreeMap<String, String>, path: &Path) -> Result<()> {
    for (name, source) in streams {
        let reason = if name.is_empty() {
            Some("empty name")
        } else if name.contains('/') {
            Some("name contains '/'")
        } else if source.trim().is_empty() {
            Some("empty source")
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(ConfigError::InvalidStream {
                name: name.clone(),
                reason,
                path: path.to_path_buf(),
            });
        }
    }
    Ok(())
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
[server]
bind = "0.0.0.0:9000"

[paths]
base_dir = "/srv/transcode"
profiles = "custom-profiles"

[streams]
cam = "rtsp://camera.local/stream"
news = "http://upstream.example/news.ts"

[session]
playlist_timeout_ms = 5000
minimum_sequences = 3
"#;

    #[test]
    fn parses_full_config() {
        let config: ServerConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(config.streams.len(), 2);
        assert_eq!(config.streams["cam"], "rtsp://camera.local/stream");
        assert_eq!(
            config.hls_profiles_dir(),
            PathBuf::from("/srv/transcode/custom-profiles/hls")
        );

        let timings = config.session.timings();
        assert_eq!(timings.playlist_timeout, Duration::from_secs(5));
        assert_eq!(timings.minimum_sequences, 3);
        // untouched keys keep their defaults
        assert_eq!(timings.reaper_period, SessionTimings::default().reaper_period);
        assert_eq!(
            timings.inactive_idle_timeout,
            SessionTimings::default().inactive_idle_timeout
        );
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert!(config.streams.is_empty());
        let timings = config.session.timings();
        let defaults = SessionTimings::default();
        assert_eq!(timings.active_idle_timeout, defaults.active_idle_timeout);
        assert_eq!(timings.remove_delay, defaults.remove_delay);
        assert_eq!(timings.minimum_sequences, defaults.minimum_sequences);
    }

    #[test]
    fn absolute_profiles_path_is_kept() {
        let config: ServerConfig =
            toml::from_str("[paths]\nbase_dir = \"/srv\"\nprofiles = \"/opt/profiles\"").unwrap();
        assert_eq!(config.profiles_dir(), PathBuf::from("/opt/profiles"));
        assert_eq!(config.http_profiles_dir(), PathBuf::from("/opt/profiles/http"));
    }

    #[test]
    fn load_reports_path_on_failure() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        match load_server_config(&missing) {
            Err(ConfigError::Io { path, .. }) => assert_eq!(path, missing),
            other => panic!("unexpected result: {other:?}"),
        }

        let broken = dir.path().join("broken.toml");
        std::fs::write(&broken, "[server\nbind = ").unwrap();
        assert!(matches!(
            load_server_config(&broken),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn load_rejects_unusable_streams() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[streams]\n\"a/b\" = \"rtsp://cam\"\n").unwrap();
        match load_server_config(&path) {
            Err(err @ ConfigError::InvalidStream { .. }) => {
                assert!(err.to_string().contains("`a/b`"), "{err}");
            }
            other => panic!("unexpected result: {other:?}"),
        }

        std::fs::write(&path, "[streams]\ncam = \" \"\n").unwrap();
        assert!(matches!(
            load_server_config(&path),
            Err(ConfigError::InvalidStream { reason: "empty source", .. })
        ));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = load_server_config(&path).unwrap();
        assert_eq!(config.streams["news"], "http://upstream.example/news.ts");
    }
}
