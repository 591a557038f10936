//! File system paths for the vault.

use crate::{CoreError, CoreResult};
use std::path::PathBuf;

/// Directory under the home directory that holds vault runtime files.
const BASE_DIR_NAME: &str = ".vault";
/// Database filename used when the config does not name one.
const DEFAULT_DATABASE_NAME: &str = "vault.db";

/// Manages file system paths for the vault.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Base directory (~/.vault)
    base_dir: PathBuf,
    /// Directory holding the encrypted database and its rollback/staging siblings
    data_dir: PathBuf,
}

impl Paths {
    /// Create a new Paths instance rooted at `~/.vault`.
    pub fn new() -> CoreResult<Self> {
        let home = dirs::home_dir().ok_or(CoreError::NoHomeDirectory)?;

        let base_dir = home.join(BASE_DIR_NAME);
        Ok(Self {
            data_dir: base_dir.join("data"),
            base_dir,
        })
    }

    /// Create a new Paths instance with a custom base directory.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self {
            data_dir: base_dir.join("data"),
            base_dir,
        }
    }

    /// Get the base directory (~/.vault).
    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Get the data directory (~/.vault/data).
    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    /// Get the config file path (~/.vault/config.json).
    pub fn config_file(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    /// Get the database file path for `name` (~/.vault/data/<name>).
    ///
    /// An empty name falls back to `vault.db`.
    pub fn database_file(&self, name: &str) -> PathBuf {
        let name = if name.trim().is_empty() {
            DEFAULT_DATABASE_NAME
        } else {
            name
        };
        self.data_dir.join(name)
    }

    /// Ensure all required directories exist.
    pub fn ensure_dirs(&self) -> CoreResult<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }
}
