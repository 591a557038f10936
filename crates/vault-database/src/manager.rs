//! Public facade over one encrypted database file.
//!
//! Every method submits work to the session's command queue, so a
//! `SessionManager` can be cloned and shared freely across threads. Calls
//! made from inside queued work run inline.

use crate::backup::BackupSet;
use crate::executor::CommandQueue;
use crate::key_material::{password_is_valid, KeyMaterial};
use crate::observer::{NullObserver, SessionObserver};
use crate::query::QueryExecutor;
use crate::session::{ManagerOptions, SessionCore, SessionState};
use crate::VaultResult;
use rusqlite::types::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use vault_config::{Config, Paths};

struct ManagerInner {
    queue: CommandQueue<SessionCore>,
    files: BackupSet,
    options: ManagerOptions,
}

/// Owns the session for one database path.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("path", &self.inner.files.database_path())
            .field("queue", &self.inner.queue.name())
            .finish()
    }
}

impl SessionManager {
    /// Manager with default options and no observer.
    pub fn new(path: impl Into<PathBuf>) -> VaultResult<Self> {
        Self::with_options(path, ManagerOptions::default(), Arc::new(NullObserver))
    }

    pub fn with_options(
        path: impl Into<PathBuf>,
        options: ManagerOptions,
        observer: Arc<dyn SessionObserver>,
    ) -> VaultResult<Self> {
        let files = BackupSet::for_database(path);

        if files.has_rollback() {
            warn!(
                rollback = %files.rollback_path().display(),
                "Found a rollback file from an interrupted rekey; restore it explicitly if needed"
            );
        }

        let queue_name = format!(
            "vault-{}",
            files
                .database_path()
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "db".to_string())
        );
        let core = SessionCore::new(files.clone(), options.clone(), observer);
        let queue = CommandQueue::new(queue_name, core)?;

        info!(path = %files.database_path().display(), "Session manager ready");

        Ok(Self {
            inner: Arc::new(ManagerInner {
                queue,
                files,
                options,
            }),
        })
    }

    /// Manager for the configured database under `paths`.
    pub fn from_config(
        config: &Config,
        paths: &Paths,
        observer: Arc<dyn SessionObserver>,
    ) -> VaultResult<Self> {
        paths.ensure_dirs()?;
        Self::with_options(
            paths.database_file(&config.database_name),
            ManagerOptions::from_config(config),
            observer,
        )
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.inner.options
    }

    /// Length policy applied before any password reaches the engine.
    pub fn password_is_valid(&self, password: &str) -> bool {
        password_is_valid(password, self.inner.options.min_password_length)
    }

    // ==========================================
    // Paths and files
    // ==========================================

    pub fn path(&self) -> &Path {
        self.inner.files.database_path()
    }

    pub fn rollback_path(&self) -> &Path {
        self.inner.files.rollback_path()
    }

    pub fn rekey_path(&self) -> &Path {
        self.inner.files.rekey_path()
    }

    pub fn database_directory(&self) -> &Path {
        self.inner.files.directory()
    }

    pub fn database_exists(&self) -> bool {
        self.inner.files.database_exists()
    }

    pub fn has_rollback(&self) -> bool {
        self.inner.files.has_rollback()
    }

    /// File size in bytes, `None` when the file does not exist.
    pub fn database_size(&self) -> VaultResult<Option<u64>> {
        Ok(self.inner.files.database_size()?)
    }

    // ==========================================
    // Queue entry points
    // ==========================================

    /// Run `f` on the queue and wait for its result.
    pub fn in_queue<F, T>(&self, f: F) -> VaultResult<T>
    where
        F: FnOnce(&QueryExecutor<'_>) -> T + Send + 'static,
        T: Send + 'static,
    {
        self.inner
            .queue
            .run_sync(move |core| f(&QueryExecutor::new(core)))
    }

    /// Enqueue `f` and return immediately.
    pub fn in_queue_async<F>(&self, f: F) -> VaultResult<()>
    where
        F: FnOnce(&QueryExecutor<'_>) + Send + 'static,
    {
        self.inner
            .queue
            .run_async(move |core| f(&QueryExecutor::new(core)))
    }

    /// Run `f` on the queue and await it from async code.
    pub async fn call<F, T>(&self, f: F) -> VaultResult<T>
    where
        F: FnOnce(&QueryExecutor<'_>) -> T + Send + 'static,
        T: Send + 'static,
    {
        self.inner
            .queue
            .call(move |core| f(&QueryExecutor::new(core)))
            .await
    }

    fn with_core<F, T>(&self, f: F) -> VaultResult<T>
    where
        F: FnOnce(&SessionCore) -> VaultResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.inner.queue.run_sync(f)?
    }

    // ==========================================
    // Lifecycle
    // ==========================================

    pub fn state(&self) -> SessionState {
        self.inner
            .queue
            .run_sync(|core| core.state())
            .unwrap_or(SessionState::Closed)
    }

    /// True if the handle is open and the integrity probe passes.
    pub fn is_unlocked(&self) -> bool {
        self.inner
            .queue
            .run_sync(|core| core.is_unlocked())
            .unwrap_or(false)
    }

    pub fn create(&self, key: KeyMaterial) -> VaultResult<()> {
        self.with_core(move |core| core.create(key))
    }

    pub fn create_with_password(&self, password: &str) -> VaultResult<()> {
        self.create(self.password_key(password))
    }

    pub fn open(&self, key: KeyMaterial) -> VaultResult<()> {
        self.with_core(move |core| core.open(key))
    }

    pub fn open_with_password(&self, password: &str) -> VaultResult<()> {
        self.open(self.password_key(password))
    }

    /// Open with the key cached by an earlier successful open.
    pub fn open_with_cached_key(&self) -> VaultResult<()> {
        self.with_core(|core| core.open_with_cached_key())
    }

    pub fn close(&self) -> VaultResult<()> {
        self.with_core(|core| core.close())
    }

    /// Close and open again with the cached key.
    pub fn reopen(&self) -> VaultResult<()> {
        self.with_core(|core| core.reopen())
    }

    /// Switch to `new_key`, keeping the old key if anything goes wrong.
    pub fn rekey(&self, new_key: KeyMaterial) -> VaultResult<()> {
        self.with_core(move |core| core.rekey(new_key))
    }

    pub fn rekey_with_password(&self, password: &str) -> VaultResult<()> {
        self.rekey(self.password_key(password))
    }

    /// Make the next rekey fail at `fault`.
    #[cfg(test)]
    pub(crate) fn arm_rekey_fault(&self, fault: crate::session::RekeyFault) {
        self.inner
            .queue
            .run_sync(move |core| core.arm_rekey_fault(fault))
            .unwrap();
    }

    fn password_key(&self, password: &str) -> KeyMaterial {
        KeyMaterial::password_with(password, &self.inner.options.cipher)
    }

    // ==========================================
    // Backup and restore
    // ==========================================

    pub fn create_rollback(&self) -> VaultResult<()> {
        self.with_core(|core| core.create_rollback())
    }

    /// Delete the rollback file; returns whether one existed.
    pub fn remove_rollback(&self) -> VaultResult<bool> {
        self.with_core(|core| core.remove_rollback())
    }

    /// Close the session and put the rollback snapshot back in place.
    pub fn restore_from_rollback(&self) -> VaultResult<()> {
        self.with_core(|core| core.restore_from_rollback())
    }

    /// Close the session and replace the database with a copy of `source`.
    pub fn restore_from_file(&self, source: impl Into<PathBuf>) -> VaultResult<()> {
        let source = source.into();
        self.with_core(move |core| core.restore_from_file(&source))
    }

    pub fn copy_to(&self, destination: impl Into<PathBuf>) -> VaultResult<()> {
        let destination = destination.into();
        self.with_core(move |core| core.copy_to(&destination))
    }

    /// Best-effort copy; failures are logged and reported as `false`.
    pub fn create_replica(&self, destination: impl Into<PathBuf>) -> bool {
        let destination = destination.into();
        match self.copy_to(&destination) {
            Ok(()) => true,
            Err(e) => {
                error!(destination = %destination.display(), error = %e, "Replica copy failed");
                false
            }
        }
    }

    // ==========================================
    // Engine metadata
    // ==========================================

    pub fn cipher_version(&self) -> VaultResult<Option<String>> {
        self.with_core(|core| core.cipher_version())
    }

    pub fn cipher_provider(&self) -> VaultResult<Option<String>> {
        self.with_core(|core| core.cipher_provider())
    }

    pub fn schema_version(&self) -> VaultResult<i64> {
        self.with_core(|core| core.schema_version())
    }

    pub fn set_schema_version(&self, version: i64) -> VaultResult<()> {
        self.with_core(move |core| core.set_schema_version(version))
    }

    // ==========================================
    // Queries (each one a single queued job)
    // ==========================================

    /// # Panics
    ///
    /// Panics if the statement fails.
    pub fn execute(&self, sql: &str) {
        if let Err(e) = self.try_execute(sql) {
            panic!("statement failed: {e}: {sql}");
        }
    }

    pub fn try_execute(&self, sql: &str) -> VaultResult<()> {
        let sql = sql.to_string();
        self.in_queue(move |db| db.try_execute(&sql))?
    }

    /// Enqueue a statement without waiting. Failures are logged.
    pub fn execute_async(&self, sql: &str) -> VaultResult<()> {
        let sql = sql.to_string();
        self.in_queue_async(move |db| {
            if let Err(e) = db.try_execute(&sql) {
                error!(error = %e, "Queued statement failed");
            }
        })
    }

    /// # Panics
    ///
    /// Panics if the statement fails.
    pub fn execute_with(&self, sql: &str, params: Vec<Value>) -> usize {
        match self.try_execute_with(sql, params) {
            Ok(changed) => changed,
            Err(e) => panic!("statement failed: {e}: {sql}"),
        }
    }

    pub fn try_execute_with(&self, sql: &str, params: Vec<Value>) -> VaultResult<usize> {
        let sql = sql.to_string();
        self.in_queue(move |db| db.try_execute_with(&sql, &params))?
    }

    pub fn rows_for(&self, sql: &str, params: Vec<Value>) -> VaultResult<Vec<Vec<Value>>> {
        let sql = sql.to_string();
        self.in_queue(move |db| db.rows_for(&sql, &params))?
    }

    pub fn scalar(&self, sql: &str, params: Vec<Value>) -> VaultResult<Option<Value>> {
        let sql = sql.to_string();
        self.in_queue(move |db| db.scalar(&sql, &params))?
    }

    pub fn scalar_text(&self, sql: &str, params: Vec<Value>) -> VaultResult<Option<String>> {
        let sql = sql.to_string();
        self.in_queue(move |db| db.scalar_text(&sql, &params))?
    }

    pub fn blob(&self, sql: &str, params: Vec<Value>) -> VaultResult<Option<Vec<u8>>> {
        let sql = sql.to_string();
        self.in_queue(move |db| db.blob(&sql, &params))?
    }

    pub fn count_for_sql(&self, sql: &str) -> VaultResult<i64> {
        let sql = sql.to_string();
        self.in_queue(move |db| db.count_for_sql(&sql))?
    }

    pub fn count_for_table(&self, table: &str) -> VaultResult<i64> {
        let table = table.to_string();
        self.in_queue(move |db| db.count_for_table(&table))?
    }

    pub fn begin_transaction(&self) -> VaultResult<()> {
        self.in_queue(|db| db.begin_transaction())?
    }

    pub fn commit_transaction(&self) -> VaultResult<()> {
        self.in_queue(|db| db.commit_transaction())?
    }

    pub fn rollback_transaction(&self) -> VaultResult<()> {
        self.in_queue(|db| db.rollback_transaction())?
    }

    pub fn in_transaction(&self) -> bool {
        self.in_queue(|db| db.in_transaction()).unwrap_or(false)
    }

    /// Run `body` atomically as one queued job. See [`QueryExecutor::transaction`].
    pub fn transaction<F, T>(&self, body: F) -> VaultResult<T>
    where
        F: FnOnce(&QueryExecutor<'_>) -> VaultResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.in_queue(move |db| db.transaction(body))?
    }
}
