//! Errors raised while locating, reading, or validating vault configuration.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    /// A loaded or constructed config failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// `config.json` exists but is not valid JSON for [`crate::Config`].
    #[error("malformed config file: {0}")]
    MalformedConfig(#[from] serde_json::Error),

    /// No home directory to put `~/.vault` under.
    #[error("could not determine home directory")]
    NoHomeDirectory,
}

pub type CoreResult<T> = Result<T, CoreError>;
