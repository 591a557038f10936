//! Integration tests for the vault session manager.
//!
//! - `lifecycle.rs`    - create / open / close / reopen and the unlock probe
//! - `rekey.rs`        - in-place and export rekey, failure recovery
//! - `queries.rs`      - statement execution and result shapes
//! - `transactions.rs` - explicit and scoped transactions
//! - `concurrency.rs`  - queue ordering and re-entrancy through the manager
//! - `backup.rs`       - rollback files, restores and replicas

mod queries;

use crate::observer::{LifecycleEvent, RecordingObserver, SessionObserver};
use crate::{KeyMaterial, ManagerOptions, SessionManager, VaultError};
use std::sync::Arc;
use tempfile::{tempdir, TempDir};
use vault_config::CipherDefaults;

pub(crate) const PASSWORD: &str = "correct-horse";
pub(crate) const OTHER_PASSWORD: &str = "battery-staple";

/// Keeps key derivation cheap; file format is otherwise the engine default.
pub(crate) const FAST_KDF_ITERATIONS: u32 = 4000;

pub(crate) fn fast_key(password: &str) -> KeyMaterial {
    KeyMaterial::password(password).with_kdf_iterations(FAST_KDF_ITERATIONS)
}

pub(crate) fn fast_options() -> ManagerOptions {
    ManagerOptions {
        cipher: CipherDefaults {
            kdf_iterations: FAST_KDF_ITERATIONS,
            ..CipherDefaults::default()
        },
        ..ManagerOptions::default()
    }
}

pub(crate) fn observed_manager(dir: &TempDir) -> (SessionManager, Arc<RecordingObserver>) {
    observed_manager_with(dir, fast_options())
}

pub(crate) fn observed_manager_with(
    dir: &TempDir,
    options: ManagerOptions,
) -> (SessionManager, Arc<RecordingObserver>) {
    let observer = Arc::new(RecordingObserver::new());
    let manager = SessionManager::with_options(
        dir.path().join("vault.db"),
        options,
        Arc::clone(&observer) as Arc<dyn SessionObserver>,
    )
    .unwrap();
    (manager, observer)
}

pub(crate) fn manager_in(dir: &TempDir) -> SessionManager {
    observed_manager(dir).0
}

/// Fresh manager over a created, unlocked database with a `notes` table.
pub(crate) fn unlocked_with_notes(dir: &TempDir) -> SessionManager {
    let manager = manager_in(dir);
    manager.create(fast_key(PASSWORD)).unwrap();
    manager.execute("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL)");
    manager
}

pub(crate) fn note_bodies(manager: &SessionManager) -> Vec<String> {
    manager
        .rows_for("SELECT body FROM notes ORDER BY id", vec![])
        .unwrap()
        .into_iter()
        .map(|row| match &row[0] {
            rusqlite::types::Value::Text(text) => text.clone(),
            other => panic!("unexpected value: {other:?}"),
        })
        .collect()
}

/// End-to-end walk through the common path.
#[test]
fn basic_workflow() {
    let dir = tempdir().unwrap();
    let (manager, observer) = observed_manager(&dir);

    // Create and write
    manager.create(fast_key(PASSWORD)).unwrap();
    manager.execute("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL)");
    manager.execute("INSERT INTO notes (body) VALUES ('first')");
    manager.close().unwrap();

    // Wrong password is rejected
    assert!(matches!(
        manager.open(fast_key(OTHER_PASSWORD)),
        Err(VaultError::InvalidKey)
    ));
    assert!(!manager.is_unlocked());

    // Right password unlocks
    manager.open(fast_key(PASSWORD)).unwrap();
    assert!(manager.is_unlocked());

    // Rekey, then the new password is the only one that works
    manager.rekey(fast_key(OTHER_PASSWORD)).unwrap();
    manager.close().unwrap();
    assert!(matches!(
        manager.open(fast_key(PASSWORD)),
        Err(VaultError::InvalidKey)
    ));
    manager.open(fast_key(OTHER_PASSWORD)).unwrap();
    assert_eq!(note_bodies(&manager), vec!["first".to_string()]);

    let path = dir.path().join("vault.db");
    let events = observer.events();
    assert_eq!(events[0], LifecycleEvent::Created(path.clone()));
    assert!(matches!(events[1], LifecycleEvent::DatabaseError(_)));
    assert_eq!(events[2], LifecycleEvent::Opened(path.clone()));
    assert_eq!(events[3], LifecycleEvent::WillRekey);
    assert_eq!(events[4], LifecycleEvent::DidRekey);
    assert!(matches!(events[5], LifecycleEvent::DatabaseError(_)));
    assert_eq!(events[6], LifecycleEvent::Opened(path));
    assert!(!manager.has_rollback());
}
