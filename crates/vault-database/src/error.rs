//! Error taxonomy and engine result-code mapping.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result code carried by [`VaultError::StatementFailed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// A code reported by the storage engine.
    Engine {
        /// Primary result code (`SQLITE_ERROR`, `SQLITE_CONSTRAINT`, ...).
        primary: i32,
        /// Extended result code.
        extended: i32,
    },
    /// An application-level command failed without an engine code.
    CommandFailed,
}

impl ResultCode {
    /// Numeric value of [`ResultCode::CommandFailed`] in the manager's own domain.
    pub const COMMAND_FAILED: i32 = 1;

    /// Numeric code: the extended engine code, or [`Self::COMMAND_FAILED`].
    pub fn as_i32(&self) -> i32 {
        match self {
            ResultCode::Engine { extended, .. } => *extended,
            ResultCode::CommandFailed => Self::COMMAND_FAILED,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultCode::Engine { extended, .. } => write!(f, "engine code {}", extended),
            ResultCode::CommandFailed => f.write_str("command failed"),
        }
    }
}

/// Error type for every vault operation.
#[derive(Error, Debug)]
pub enum VaultError {
    /// Wrong credential, or the file is not a readable encrypted database.
    #[error("invalid key or corrupted database")]
    InvalidKey,

    /// `create` was called for a path that already exists.
    #[error("database already exists: {0}")]
    AlreadyExists(PathBuf),

    /// `open` was called for a path that does not exist.
    #[error("database not found: {0}")]
    DatabaseNotFound(PathBuf),

    /// The operation needs an unlocked database.
    #[error("database is not open")]
    NotOpen,

    /// `open`/`create` was called while a handle is already held.
    #[error("database is already open")]
    AlreadyOpen,

    /// `reopen` was called without a cached key.
    #[error("no cached key available")]
    NoCachedKey,

    /// Rekey was rejected; the previous key has been restored unless the
    /// reason says otherwise.
    #[error("rekey failed: {reason}")]
    RekeyFailed { reason: String },

    /// A statement failed inside the engine.
    #[error("statement failed ({code}): {message}")]
    StatementFailed { code: ResultCode, message: String },

    /// Key material failed shape validation.
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// A bind parameter had an unsupported type.
    #[error("invalid parameter at index {index}: {reason}")]
    InvalidParameter { index: usize, reason: String },

    /// The operation cannot run inside an open transaction.
    #[error("operation not allowed inside a transaction")]
    TransactionActive,

    /// The handle is borrowed by an enclosing operation on the queue.
    #[error("database handle is in use by an enclosing operation")]
    Busy,

    /// The command queue worker is gone.
    #[error("command queue is closed")]
    QueueClosed,

    /// Filesystem failure during backup or restore.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] vault_config::CoreError),
}

impl VaultError {
    /// Build a [`VaultError::StatementFailed`] for an application-level failure.
    pub fn command_failed(message: impl Into<String>) -> Self {
        VaultError::StatementFailed {
            code: ResultCode::CommandFailed,
            message: message.into(),
        }
    }

    /// The result code, when this error carries one.
    pub fn result_code(&self) -> Option<ResultCode> {
        match self {
            VaultError::StatementFailed { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Map an engine failure seen while unlocking into [`VaultError::InvalidKey`].
    ///
    /// Anything the probe cannot read counts as a wrong key or a damaged file.
    pub(crate) fn from_probe(err: rusqlite::Error) -> Self {
        tracing::debug!(error = %err, "integrity probe failed");
        VaultError::InvalidKey
    }
}

impl From<rusqlite::Error> for VaultError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(ffi_err, message) => {
                let message = message.unwrap_or_else(|| ffi_err.to_string());
                VaultError::StatementFailed {
                    code: ResultCode::Engine {
                        primary: ffi_err.extended_code & 0xff,
                        extended: ffi_err.extended_code,
                    },
                    message,
                }
            }
            other => VaultError::command_failed(other.to_string()),
        }
    }
}

/// Result type alias using VaultError.
pub type VaultResult<T> = Result<T, VaultError>;
