pub mod config;
pub mod error;
pub mod profile;
pub mod registry;
pub mod session;

pub use config::{load_server_config, PathsSection, ServerConfig, ServerSection, SessionSection};
pub use error::{ConfigError, Result};
pub use profile::{ProfileCatalog, ProfileError};
pub use registry::{RegistryError, SessionSummary, StreamRegistry};
pub use session::{
    CommandFactory, Session, SessionError, SessionEvents, SessionTimings,
};
