use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Problems with the server configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration {}: {source}", path.display())]
    Io { source: io::Error, path: PathBuf },
    #[error("malformed configuration {}: {source}", path.display())]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
    #[error("invalid stream `{name}` in {}: {reason}", path.display())]
    InvalidStream {
        name: String,
        reason: &'static str,
        path: PathBuf,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
