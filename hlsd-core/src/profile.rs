use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::process::Command;

const PROFILE_EXTENSION: &str = "sh";

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("invalid profile name: {0}")]
    InvalidName(String),
    #[error("profile not found: {0}")]
    NotFound(String),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Directory of transcoding profiles; each profile is an executable
/// `<name>.sh` invoked with the stream input as its only argument.
#[derive(Debug, Clone)]
pub struct ProfileCatalog {
    root: PathBuf,
}

impl ProfileCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, name: &str) -> Result<PathBuf, ProfileError> {
        if !is_valid_name(name) {
            return Err(ProfileError::InvalidName(name.to_string()));
        }
        let path = self.root.join(format!("{name}.{PROFILE_EXTENSION}"));
        if !path.is_file() {
            return Err(ProfileError::NotFound(name.to_string()));
        }
        Ok(path)
    }

    pub fn command(&self, name: &str, input: &str) -> Result<Command, ProfileError> {
        let script = self.resolve(name)?;
        let mut command = Command::new(script);
        command.arg(input);
        Ok(command)
    }

    /// Profile names, sorted. A missing catalog directory is empty.
    pub fn list(&self) -> Result<Vec<String>, ProfileError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(ProfileError::Io {
                    source,
                    path: self.root.clone(),
                })
            }
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| ProfileError::Io {
                source,
                path: self.root.clone(),
            })?;
            let path = entry.path();
            if !path.is_file()
                || path.extension().and_then(|ext| ext.to_str()) != Some(PROFILE_EXTENSION)
            {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                if is_valid_name(stem) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
