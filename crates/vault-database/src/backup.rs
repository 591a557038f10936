//! File-level copies of the database used around rekey and restore.
//!
//! Every copy is written to a `.partial` sibling first and renamed into place,
//! so a crash mid-copy never leaves a torn file under a well-known name.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const ROLLBACK_SUFFIX: &str = "-rollback";
const REKEY_SUFFIX: &str = "-rekey";
const PARTIAL_SUFFIX: &str = ".partial";

/// The main database path and its well-known siblings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSet {
    database: PathBuf,
    rollback: PathBuf,
    rekey: PathBuf,
}

impl BackupSet {
    /// Derive `<name>-rollback` and `<name>-rekey` next to `database`.
    pub fn for_database(database: impl Into<PathBuf>) -> Self {
        let database = database.into();
        Self {
            rollback: with_suffix(&database, ROLLBACK_SUFFIX),
            rekey: with_suffix(&database, REKEY_SUFFIX),
            database,
        }
    }

    pub fn database_path(&self) -> &Path {
        &self.database
    }

    pub fn rollback_path(&self) -> &Path {
        &self.rollback
    }

    pub fn rekey_path(&self) -> &Path {
        &self.rekey
    }

    /// Directory containing the database file.
    pub fn directory(&self) -> &Path {
        self.database.parent().unwrap_or_else(|| Path::new("."))
    }

    pub fn database_exists(&self) -> bool {
        self.database.is_file()
    }

    pub fn has_rollback(&self) -> bool {
        self.rollback.is_file()
    }

    /// Size of the main file in bytes, or `None` if it does not exist.
    pub fn database_size(&self) -> io::Result<Option<u64>> {
        match fs::metadata(&self.database) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Snapshot the main file to the rollback path, replacing a stale one.
    pub fn create_rollback(&self) -> io::Result<()> {
        copy_atomic(&self.database, &self.rollback)?;
        info!(rollback = %self.rollback.display(), "Rollback snapshot created");
        Ok(())
    }

    /// Delete the rollback file. Missing files are not an error.
    pub fn remove_rollback(&self) -> io::Result<bool> {
        remove_if_exists(&self.rollback)
    }

    /// Replace the main file with the rollback snapshot and consume it.
    ///
    /// The caller must have released every handle on the main file.
    pub fn restore_from_rollback(&self) -> io::Result<()> {
        if !self.has_rollback() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no rollback file at {}", self.rollback.display()),
            ));
        }
        fs::rename(&self.rollback, &self.database)?;
        self.remove_journal()?;
        info!(path = %self.database.display(), "Database restored from rollback");
        Ok(())
    }

    /// Replace the main file with a copy of `source`. `source` is left in place.
    pub fn restore_from_file(&self, source: &Path) -> io::Result<()> {
        copy_atomic(source, &self.database)?;
        self.remove_journal()?;
        info!(
            path = %self.database.display(),
            source = %source.display(),
            "Database restored from file"
        );
        Ok(())
    }

    /// Copy the main file to `destination`.
    pub fn copy_to(&self, destination: &Path) -> io::Result<()> {
        if destination == self.database {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "replica path must differ from the database path",
            ));
        }
        copy_atomic(&self.database, destination)?;
        debug!(destination = %destination.display(), "Database copied");
        Ok(())
    }

    /// Delete a leftover staging file from an earlier export.
    pub fn remove_staging(&self) -> io::Result<bool> {
        remove_if_exists(&self.rekey)
    }

    /// Move the finished staging file over the main file.
    pub fn promote_staging(&self) -> io::Result<()> {
        fs::rename(&self.rekey, &self.database)?;
        self.remove_journal()?;
        Ok(())
    }

    /// A hot journal left from the replaced file would be replayed against the
    /// new one, so it goes with it.
    fn remove_journal(&self) -> io::Result<()> {
        let journal = with_suffix(&self.database, "-journal");
        if remove_if_exists(&journal)? {
            warn!(journal = %journal.display(), "Removed stale journal");
        }
        Ok(())
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Copy `source` to `destination` through a `.partial` sibling and a rename.
fn copy_atomic(source: &Path, destination: &Path) -> io::Result<()> {
    let partial = with_suffix(destination, PARTIAL_SUFFIX);
    let result = fs::copy(source, &partial).and_then(|_| {
        fs::File::open(&partial)?.sync_all()?;
        fs::rename(&partial, destination)
    });
    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    result
}
