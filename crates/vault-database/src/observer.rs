//! Lifecycle notifications for whoever presents the vault to a user.
//!
//! Every method has an empty default, so implementors pick the events they
//! care about. Notifications are delivered synchronously on the command queue's
//! worker thread, after the state change they describe.
//!
//! An observer may call back into the manager: synchronous calls from the
//! worker run inline. It must not block waiting on another thread that is
//! itself waiting on the queue.

use crate::VaultError;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Receives session lifecycle events.
pub trait SessionObserver: Send + Sync {
    /// A new database file was created and unlocked.
    fn did_create_database(&self, _path: &Path) {}

    /// An existing database was unlocked.
    fn did_open_database(&self, _path: &Path) {}

    /// A rekey is about to start. The rollback snapshot does not exist yet.
    fn will_rekey(&self) {}

    /// The rekey finished and the new key is in use.
    fn did_rekey(&self) {}

    /// The rekey failed. The old key is back in use unless `error` says otherwise.
    fn did_encounter_rekey_error(&self, _error: &VaultError) {}

    /// A statement or unlock attempt failed.
    fn did_encounter_database_error(&self, _message: &str) {}
}

/// An observer that ignores every event.
#[derive(Debug, Default)]
pub struct NullObserver;

impl SessionObserver for NullObserver {}

/// One recorded notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Created(PathBuf),
    Opened(PathBuf),
    WillRekey,
    DidRekey,
    RekeyFailed(String),
    DatabaseError(String),
}

/// An observer that records all events for testing.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all recorded events.
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().expect("lock poisoned").clone()
    }

    /// Clears all recorded events.
    pub fn clear(&self) {
        self.events.lock().expect("lock poisoned").clear();
    }

    fn record(&self, event: LifecycleEvent) {
        self.events.lock().expect("lock poisoned").push(event);
    }
}

impl SessionObserver for RecordingObserver {
    fn did_create_database(&self, path: &Path) {
        self.record(LifecycleEvent::Created(path.to_path_buf()));
    }

    fn did_open_database(&self, path: &Path) {
        self.record(LifecycleEvent::Opened(path.to_path_buf()));
    }

    fn will_rekey(&self) {
        self.record(LifecycleEvent::WillRekey);
    }

    fn did_rekey(&self) {
        self.record(LifecycleEvent::DidRekey);
    }

    fn did_encounter_rekey_error(&self, error: &VaultError) {
        self.record(LifecycleEvent::RekeyFailed(error.to_string()));
    }

    fn did_encounter_database_error(&self, message: &str) {
        self.record(LifecycleEvent::DatabaseError(message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_observer_keeps_order() {
        let observer = RecordingObserver::new();
        observer.will_rekey();
        observer.did_encounter_rekey_error(&VaultError::InvalidKey);
        observer.did_open_database(Path::new("/tmp/a.db"));

        assert_eq!(
            observer.events(),
            vec![
                LifecycleEvent::WillRekey,
                LifecycleEvent::RekeyFailed("invalid key or corrupted database".to_string()),
                LifecycleEvent::Opened(PathBuf::from("/tmp/a.db")),
            ]
        );

        observer.clear();
        assert!(observer.events().is_empty());
    }

    #[test]
    fn test_null_observer_accepts_everything() {
        let observer = NullObserver;
        observer.did_rekey();
        observer.did_encounter_database_error("ignored");
    }
}
