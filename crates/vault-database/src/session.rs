//! Session state machine and the crash-safe rekey protocol.
//!
//! [`SessionCore`] lives on the command queue's worker thread and is only ever
//! reached through the queue, so its fields use `Cell`/`RefCell` rather than
//! locks.
//!
//! # Rekey (strict order)
//!
//! 1. Notify `will_rekey`, enter `Rekeying`
//! 2. Snapshot the file to `<name>-rollback`
//! 3. Apply the new key (`PRAGMA rekey`, or an export through `<name>-rekey`
//!    when page-level settings change)
//! 4. Success: drop the rollback, back to `Open`, notify `did_rekey`
//! 5. Failure: restore the rollback, reopen with the old key, back to `Open`,
//!    notify `did_encounter_rekey_error`
//!
//! A crash between 2 and 4 leaves the rollback on disk. It is reported at
//! startup but only restored on request.

use crate::backup::BackupSet;
use crate::key_material::{password_is_valid, Credential, KeyMaterial};
use crate::observer::SessionObserver;
use crate::{VaultError, VaultResult};
use rusqlite::{params, Connection, DatabaseName, OpenFlags, OptionalExtension};
use std::cell::{Cell, RefCell};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use vault_config::{CipherDefaults, Config, DEFAULT_MIN_PASSWORD_LENGTH};

/// Schema alias for the staging copy while exporting under new settings.
const EXPORT_SCHEMA: &str = "vault_export";

/// Statement that proves the key decrypts the file.
const PROBE_SQL: &str = "SELECT count(*) FROM sqlite_master";

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Open,
    Rekeying,
}

/// Behavior knobs for a [`crate::SessionManager`].
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Shortest password sent to the engine.
    pub min_password_length: usize,
    /// Remember the last successful key so `reopen` works.
    pub cache_key: bool,
    /// Settings used by the `*_with_password` helpers.
    pub cipher: CipherDefaults,
    /// How long the engine retries on a locked file.
    pub busy_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            min_password_length: DEFAULT_MIN_PASSWORD_LENGTH,
            cache_key: false,
            cipher: CipherDefaults::default(),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl ManagerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_password_length: config.min_password_length,
            cache_key: config.cache_keys,
            cipher: config.cipher.clone(),
            ..Self::default()
        }
    }
}

/// Everything the worker thread owns for one database file.
pub(crate) struct SessionCore {
    pub(crate) files: BackupSet,
    pub(crate) options: ManagerOptions,
    pub(crate) observer: Arc<dyn SessionObserver>,
    state: Cell<SessionState>,
    handle: RefCell<Option<Connection>>,
    // Always tracked while open; needed to recover from a failed rekey.
    active_key: RefCell<Option<KeyMaterial>>,
    // Opt-in copy kept across close for `reopen`.
    cached_key: RefCell<Option<KeyMaterial>>,
    pub(crate) in_transaction: Cell<bool>,
    #[cfg(test)]
    rekey_fault: Cell<Option<RekeyFault>>,
}

/// Points after the engine has rewritten the file where a test can make rekey fail.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RekeyFault {
    AfterRekeyPragma,
    AfterPromote,
}

impl SessionCore {
    pub(crate) fn new(
        files: BackupSet,
        options: ManagerOptions,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        Self {
            files,
            options,
            observer,
            state: Cell::new(SessionState::Closed),
            handle: RefCell::new(None),
            active_key: RefCell::new(None),
            cached_key: RefCell::new(None),
            in_transaction: Cell::new(false),
            #[cfg(test)]
            rekey_fault: Cell::new(None),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Borrow the live handle for the duration of `f`.
    pub(crate) fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> VaultResult<T>,
    ) -> VaultResult<T> {
        if self.state.get() == SessionState::Closed {
            return Err(VaultError::NotOpen);
        }
        let guard = self.handle.try_borrow().map_err(|_| VaultError::Busy)?;
        let conn = guard.as_ref().ok_or(VaultError::NotOpen)?;
        f(conn)
    }

    /// Run the integrity probe against the live handle.
    pub(crate) fn is_unlocked(&self) -> bool {
        self.with_connection(|conn| probe(conn).map_err(VaultError::from_probe))
            .is_ok()
    }

    // ==========================================
    // Create / open / close
    // ==========================================

    pub(crate) fn create(&self, key: KeyMaterial) -> VaultResult<()> {
        self.ensure_closed()?;
        key.validate(self.options.min_password_length)?;

        let path = self.files.database_path();
        if path.exists() {
            return Err(VaultError::AlreadyExists(path.to_path_buf()));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!(path = %path.display(), raw = key.is_raw(), "Creating encrypted database");

        let conn = match self
            .open_connection(&key, true)
            .and_then(|conn| materialize(&conn).map(|()| conn))
        {
            Ok(conn) => conn,
            Err(e) => {
                // Leave nothing behind that a retry would trip over as AlreadyExists
                if let Err(cleanup) = std::fs::remove_file(path) {
                    debug!(error = %cleanup, "No partial database to remove");
                }
                return Err(e);
            }
        };

        self.install(conn, key);
        self.observer.did_create_database(path);
        Ok(())
    }

    pub(crate) fn open(&self, key: KeyMaterial) -> VaultResult<()> {
        self.ensure_closed()?;

        if let Credential::Password { value, .. } = key.credential() {
            if !password_is_valid(value, self.options.min_password_length) {
                debug!("Password rejected by length policy before unlock");
                return Err(VaultError::InvalidKey);
            }
        }
        key.validate(self.options.min_password_length)?;

        let path = self.files.database_path();
        if !self.files.database_exists() {
            return Err(VaultError::DatabaseNotFound(path.to_path_buf()));
        }

        match self.open_connection(&key, false) {
            Ok(conn) => {
                self.install(conn, key);
                info!(path = %path.display(), "Database unlocked");
                self.observer.did_open_database(path);
                Ok(())
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to unlock database");
                self.observer.did_encounter_database_error(&e.to_string());
                Err(e)
            }
        }
    }

    /// Open with the cached key without closing first.
    pub(crate) fn open_with_cached_key(&self) -> VaultResult<()> {
        let key = self.cached_key()?;
        self.open(key)
    }

    /// Release the handle. Closing a closed session does nothing.
    pub(crate) fn close(&self) -> VaultResult<()> {
        if self.state.get() == SessionState::Closed {
            return Ok(());
        }
        self.release_handle()?;
        self.active_key.borrow_mut().take();
        self.state.set(SessionState::Closed);
        info!(path = %self.files.database_path().display(), "Database closed");
        Ok(())
    }

    pub(crate) fn reopen(&self) -> VaultResult<()> {
        let key = self.cached_key()?;
        self.close()?;
        self.open(key)
    }

    fn cached_key(&self) -> VaultResult<KeyMaterial> {
        self.cached_key
            .borrow()
            .clone()
            .ok_or(VaultError::NoCachedKey)
    }

    fn ensure_closed(&self) -> VaultResult<()> {
        match self.state.get() {
            SessionState::Closed => Ok(()),
            _ => Err(VaultError::AlreadyOpen),
        }
    }

    fn ensure_open_idle(&self) -> VaultResult<()> {
        if self.state.get() != SessionState::Open {
            return Err(VaultError::NotOpen);
        }
        if self.in_transaction.get() {
            return Err(VaultError::TransactionActive);
        }
        // A row callback further up the stack still holds the handle
        drop(self.handle.try_borrow_mut().map_err(|_| VaultError::Busy)?);
        Ok(())
    }

    fn install(&self, conn: Connection, key: KeyMaterial) {
        *self.handle.borrow_mut() = Some(conn);
        if self.options.cache_key {
            *self.cached_key.borrow_mut() = Some(key.clone());
        }
        *self.active_key.borrow_mut() = Some(key);
        self.in_transaction.set(false);
        self.state.set(SessionState::Open);
    }

    /// Take the handle out and close it, rolling back an open transaction.
    fn release_handle(&self) -> VaultResult<()> {
        let taken = self
            .handle
            .try_borrow_mut()
            .map_err(|_| VaultError::Busy)?
            .take();
        if let Some(conn) = taken {
            if self.in_transaction.replace(false) {
                if let Err(e) = conn.execute_batch("ROLLBACK") {
                    warn!(error = %e, "Rollback on close failed");
                }
            }
            if let Err((_conn, e)) = conn.close() {
                warn!(error = %e, "Engine reported an error while closing");
            }
        }
        Ok(())
    }

    /// Open, key, probe and configure a fresh connection to the main file.
    fn open_connection(&self, key: &KeyMaterial, create: bool) -> VaultResult<Connection> {
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        if create {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        let conn = Connection::open_with_flags(self.files.database_path(), flags)?;

        key.apply_to(&conn)?;
        probe(&conn).map_err(VaultError::from_probe)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = DELETE;
            PRAGMA foreign_keys = ON;
            PRAGMA secure_delete = ON;
            PRAGMA temp_store = MEMORY;
            ",
        )?;
        conn.busy_timeout(self.options.busy_timeout)?;
        Ok(conn)
    }

    // ==========================================
    // Engine metadata
    // ==========================================

    pub(crate) fn cipher_version(&self) -> VaultResult<Option<String>> {
        self.with_connection(|conn| pragma_text(conn, "PRAGMA cipher_version"))
    }

    pub(crate) fn cipher_provider(&self) -> VaultResult<Option<String>> {
        self.with_connection(|conn| pragma_text(conn, "PRAGMA cipher_provider"))
    }

    pub(crate) fn schema_version(&self) -> VaultResult<i64> {
        self.with_connection(|conn| {
            Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
        })
    }

    pub(crate) fn set_schema_version(&self, version: i64) -> VaultResult<()> {
        self.with_connection(|conn| Ok(conn.pragma_update(None, "user_version", version)?))
    }

    // ==========================================
    // Rekey
    // ==========================================

    pub(crate) fn rekey(&self, new_key: KeyMaterial) -> VaultResult<()> {
        new_key.validate(self.options.min_password_length)?;
        self.ensure_open_idle()?;
        let old_key = self
            .active_key
            .borrow()
            .clone()
            .ok_or(VaultError::NotOpen)?;
        let export = old_key.requires_export(&new_key);

        self.observer.will_rekey();
        self.state.set(SessionState::Rekeying);
        info!(
            path = %self.files.database_path().display(),
            export,
            raw = new_key.is_raw(),
            "Rekeying database"
        );

        if let Err(e) = self.files.create_rollback() {
            // Nothing has been touched yet
            self.state.set(SessionState::Open);
            let err = VaultError::Io(e);
            warn!(error = %err, "Could not snapshot database before rekey");
            self.observer.did_encounter_rekey_error(&err);
            return Err(err);
        }

        let attempt = if export {
            self.rekey_by_export(&new_key)
        } else {
            self.rekey_in_place(&new_key)
        };

        match attempt {
            Ok(()) => {
                if let Err(e) = self.files.remove_rollback() {
                    warn!(error = %e, "Rekey succeeded but the rollback file could not be removed");
                }
                if self.options.cache_key {
                    *self.cached_key.borrow_mut() = Some(new_key.clone());
                }
                *self.active_key.borrow_mut() = Some(new_key);
                self.state.set(SessionState::Open);
                info!("Rekey complete");
                self.observer.did_rekey();
                Ok(())
            }
            Err(cause) => {
                warn!(error = %cause, "Rekey failed; restoring rollback");
                let err = match self.recover_after_failed_rekey(&old_key) {
                    Ok(()) => VaultError::RekeyFailed {
                        reason: cause.to_string(),
                    },
                    Err(recovery) => {
                        error!(error = %recovery, "Recovery after failed rekey failed");
                        self.state.set(SessionState::Closed);
                        self.active_key.borrow_mut().take();
                        VaultError::RekeyFailed {
                            reason: format!(
                                "{}; recovery failed: {}; rollback kept at {}",
                                cause,
                                recovery,
                                self.files.rollback_path().display()
                            ),
                        }
                    }
                };
                self.observer.did_encounter_rekey_error(&err);
                Err(err)
            }
        }
    }

    /// Only the secret changes: rekey the live handle, then confirm the file on
    /// disk opens with the new key through a second connection.
    fn rekey_in_place(&self, new_key: &KeyMaterial) -> VaultResult<()> {
        self.with_connection(|conn| {
            conn.pragma_update(None, "rekey", new_key.key_literal().as_str())?;
            Ok(())
        })?;
        #[cfg(test)]
        self.trip_rekey_fault(RekeyFault::AfterRekeyPragma)?;

        let verify = self.open_connection(new_key, false)?;
        drop(verify);
        Ok(())
    }

    /// Page-level settings change: export into a staging file keyed with the
    /// new settings, then swap it in.
    fn rekey_by_export(&self, new_key: &KeyMaterial) -> VaultResult<()> {
        self.files.remove_staging()?;
        let staging = self.files.rekey_path().to_string_lossy().into_owned();

        self.with_connection(|conn| {
            conn.execute(
                &format!("ATTACH DATABASE ?1 AS {} KEY ?2", EXPORT_SCHEMA),
                params![staging, new_key.key_literal().as_str()],
            )?;

            let exported = export_into_staging(conn, new_key);
            let detached = conn.execute_batch(&format!("DETACH DATABASE {}", EXPORT_SCHEMA));
            exported?;
            detached?;
            Ok(())
        })?;

        self.release_handle()?;
        self.files.promote_staging()?;
        #[cfg(test)]
        self.trip_rekey_fault(RekeyFault::AfterPromote)?;

        let conn = self.open_connection(new_key, false)?;
        *self.handle.try_borrow_mut().map_err(|_| VaultError::Busy)? = Some(conn);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn arm_rekey_fault(&self, fault: RekeyFault) {
        self.rekey_fault.set(Some(fault));
    }

    #[cfg(test)]
    fn trip_rekey_fault(&self, stage: RekeyFault) -> VaultResult<()> {
        if self.rekey_fault.get() == Some(stage) {
            self.rekey_fault.set(None);
            return Err(VaultError::command_failed(format!("fault injected at {stage:?}")));
        }
        Ok(())
    }

    fn recover_after_failed_rekey(&self, old_key: &KeyMaterial) -> VaultResult<()> {
        self.release_handle()?;
        if let Err(e) = self.files.remove_staging() {
            warn!(error = %e, "Could not remove staging file");
        }
        self.files.restore_from_rollback()?;

        let conn = self.open_connection(old_key, false)?;
        *self.handle.try_borrow_mut().map_err(|_| VaultError::Busy)? = Some(conn);
        self.state.set(SessionState::Open);
        info!("Previous key restored after failed rekey");
        Ok(())
    }

    // ==========================================
    // Backup and restore
    // ==========================================

    pub(crate) fn create_rollback(&self) -> VaultResult<()> {
        self.ensure_not_mid_transaction()?;
        Ok(self.files.create_rollback()?)
    }

    pub(crate) fn remove_rollback(&self) -> VaultResult<bool> {
        Ok(self.files.remove_rollback()?)
    }

    /// Replace the database with the rollback snapshot. The session ends closed.
    pub(crate) fn restore_from_rollback(&self) -> VaultResult<()> {
        if !self.files.has_rollback() {
            return Err(VaultError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no rollback file at {}", self.files.rollback_path().display()),
            )));
        }
        self.close()?;
        self.files.restore_from_rollback()?;
        Ok(())
    }

    /// Replace the database with a copy of `source`. The session ends closed.
    pub(crate) fn restore_from_file(&self, source: &Path) -> VaultResult<()> {
        if !source.is_file() {
            return Err(VaultError::DatabaseNotFound(source.to_path_buf()));
        }
        self.close()?;
        self.files.restore_from_file(source)?;
        Ok(())
    }

    pub(crate) fn copy_to(&self, destination: &Path) -> VaultResult<()> {
        self.ensure_not_mid_transaction()?;
        if !self.files.database_exists() {
            return Err(VaultError::DatabaseNotFound(
                self.files.database_path().to_path_buf(),
            ));
        }
        Ok(self.files.copy_to(destination)?)
    }

    fn ensure_not_mid_transaction(&self) -> VaultResult<()> {
        // Uncommitted pages may already have spilled into the main file
        if self.in_transaction.get() {
            return Err(VaultError::TransactionActive);
        }
        Ok(())
    }
}

fn probe(conn: &Connection) -> rusqlite::Result<()> {
    conn.query_row(PROBE_SQL, [], |row| row.get::<_, i64>(0))
        .map(|_| ())
}

/// Force the engine to write the header and first page of a new file.
fn materialize(conn: &Connection) -> VaultResult<()> {
    conn.execute_batch(
        "
        BEGIN;
        CREATE TABLE _vault_init (id INTEGER);
        DROP TABLE _vault_init;
        COMMIT;
        ",
    )?;
    Ok(())
}

fn export_into_staging(conn: &Connection, new_key: &KeyMaterial) -> VaultResult<()> {
    let schema = DatabaseName::Attached(EXPORT_SCHEMA);
    new_key.apply_settings(conn, schema)?;
    conn.query_row(&format!("SELECT sqlcipher_export('{}')", EXPORT_SCHEMA), [], |_| {
        Ok(())
    })?;
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    conn.pragma_update(Some(schema), "user_version", version)?;
    Ok(())
}

fn pragma_text(conn: &Connection, sql: &str) -> VaultResult<Option<String>> {
    Ok(conn
        .query_row(sql, [], |row| row.get::<_, String>(0))
        .optional()?)
}
