//! Configuration loading errors shared by the workspace binaries

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading and validating service configuration.
#[derive(Error, Debug)]
pub enum Error {
    /// A value parsed but is out of policy (zero TTL, bad URL, missing section).
    #[error("Configuration error: {0}")]
    Config(String),

    /// A secret referenced by path could not be read. The path is reported,
    /// the contents never are.
    #[error("failed to read {field} {path}: {source}")]
    SecretFile {
        field: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;
