//! Configuration, file system paths, and logging for the encrypted vault.

mod config;
mod error;
pub mod logging;
mod paths;

pub use config::{
    CipherDefaults, Config, DEFAULT_CIPHER_PAGE_SIZE, DEFAULT_HMAC_ALGORITHM,
    DEFAULT_KDF_ALGORITHM, DEFAULT_KDF_ITERATIONS, DEFAULT_LOG_LEVEL, DEFAULT_MIN_PASSWORD_LENGTH,
};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, LogFormat};
pub use paths::Paths;
