//! # Vault Database
//!
//! Owns one SQLCipher-encrypted database file: creating and unlocking it,
//! switching keys without ever risking the data, and funnelling every
//! statement through a single worker thread.
//!
//! ## Principles
//!
//! - **One handle, one thread** - All access goes through the command queue
//! - **Rekey never loses data** - A rollback snapshot exists until the new key is proven
//! - **Unlock is verified** - A key counts only once the probe reads the schema
//!
//! ## Files
//!
//! ```text
//! <name>            the encrypted database
//! <name>-rollback   snapshot taken before a rekey
//! <name>-rekey      staging file while exporting under new cipher settings
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use vault_database::{KeyMaterial, SessionManager};
//!
//! let manager = SessionManager::new("/tmp/notes.db").unwrap();
//! manager.create(KeyMaterial::password("correct-horse")).unwrap();
//! manager.execute("CREATE TABLE notes (body TEXT)");
//! manager.rekey(KeyMaterial::generate_raw()).unwrap();
//! assert_eq!(manager.count_for_table("notes").unwrap(), 0);
//! ```
//!
//! ## Crate Structure
//!
//! - [`key_material`] - Credentials and cipher settings
//! - [`observer`] - Lifecycle notifications
//! - `session` - State machine and rekey protocol
//! - `executor` - Serialized command queue
//! - `backup` - Rollback, staging, and replica files

mod backup;
mod error;
mod executor;
pub mod key_material;
mod manager;
pub mod observer;
mod query;
mod registry;
mod session;

#[cfg(test)]
mod tests;

pub use backup::BackupSet;
pub use error::{ResultCode, VaultError, VaultResult};
pub use executor::CommandQueue;
pub use key_material::{password_is_valid, CipherSettings, Credential, KeyMaterial};
pub use manager::SessionManager;
pub use observer::{LifecycleEvent, NullObserver, RecordingObserver, SessionObserver};
pub use query::QueryExecutor;
pub use registry::ManagerRegistry;
pub use rusqlite::types::Value;
pub use session::{ManagerOptions, SessionState};
