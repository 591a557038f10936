//! Configuration management for the vault.

use crate::{CoreError, CoreResult, LogFormat, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Shortest password accepted before any engine call is made.
pub const DEFAULT_MIN_PASSWORD_LENGTH: usize = 8;

/// SQLCipher 4 default PBKDF2 iteration count.
pub const DEFAULT_KDF_ITERATIONS: u32 = 256_000;

/// SQLCipher 4 default page size.
pub const DEFAULT_CIPHER_PAGE_SIZE: u32 = 4096;

/// SQLCipher 4 default key derivation algorithm.
pub const DEFAULT_KDF_ALGORITHM: &str = "PBKDF2_HMAC_SHA512";

/// SQLCipher 4 default page HMAC algorithm.
pub const DEFAULT_HMAC_ALGORITHM: &str = "HMAC_SHA512";

/// Cipher settings applied to keys built from a bare password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CipherDefaults {
    /// Cipher name forwarded to `PRAGMA cipher`. `None` keeps the engine default.
    pub cipher_name: Option<String>,
    /// PBKDF2 iteration count (`PRAGMA kdf_iter`).
    pub kdf_iterations: u32,
    /// Key derivation hash (`PRAGMA cipher_kdf_algorithm`).
    pub kdf_algorithm: String,
    /// Page size in bytes (`PRAGMA cipher_page_size`).
    pub page_size: u32,
    /// Per-page HMAC protection (`PRAGMA cipher_use_hmac`).
    pub use_hmac: bool,
    /// Page HMAC hash (`PRAGMA cipher_hmac_algorithm`).
    pub hmac_algorithm: String,
    /// Commercial license token (`PRAGMA cipher_license`).
    pub license: Option<String>,
}

impl Default for CipherDefaults {
    fn default() -> Self {
        Self {
            cipher_name: None,
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
            kdf_algorithm: DEFAULT_KDF_ALGORITHM.to_string(),
            page_size: DEFAULT_CIPHER_PAGE_SIZE,
            use_hmac: true,
            hmac_algorithm: DEFAULT_HMAC_ALGORITHM.to_string(),
            license: None,
        }
    }
}

/// Main vault configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Log line format.
    #[serde(default)]
    pub log_format: LogFormat,
    /// Database filename inside the data directory.
    #[serde(default = "default_database_name")]
    pub database_name: String,
    /// Minimum accepted password length.
    #[serde(default = "default_min_password_length")]
    pub min_password_length: usize,
    /// Keep the last successful key in memory so `reopen` works.
    #[serde(default)]
    pub cache_keys: bool,
    /// Cipher settings for password-derived keys.
    #[serde(default)]
    pub cipher: CipherDefaults,
}

fn default_database_name() -> String {
    "vault.db".to_string()
}

fn default_min_password_length() -> usize {
    DEFAULT_MIN_PASSWORD_LENGTH
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            log_format: LogFormat::default(),
            database_name: default_database_name(),
            min_password_length: DEFAULT_MIN_PASSWORD_LENGTH,
            cache_keys: false,
            cipher: CipherDefaults::default(),
        }
    }
}

impl Config {
    /// Load configuration from the paths' config file, falling back to defaults.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    /// Reject settings the engine could never accept.
    pub fn validate(&self) -> CoreResult<()> {
        if self.cipher.kdf_iterations == 0 {
            return Err(CoreError::InvalidConfig(
                "cipher.kdf_iterations must be positive".to_string(),
            ));
        }
        let page = self.cipher.page_size;
        if !(512..=65536).contains(&page) || !page.is_power_of_two() {
            return Err(CoreError::InvalidConfig(format!(
                "cipher.page_size must be a power of two between 512 and 65536, got {}",
                page
            )));
        }
        Ok(())
    }

    /// Override configuration from environment variables.
    fn load_from_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply `VAULT_LOG_LEVEL` and `VAULT_KDF_ITERATIONS` from `lookup`.
    ///
    /// Unparseable iteration counts are ignored.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(log_level) = lookup("VAULT_LOG_LEVEL").filter(|v| !v.trim().is_empty()) {
            self.log_level = log_level;
        }
        if let Some(iterations) = lookup("VAULT_KDF_ITERATIONS")
            .and_then(|raw| raw.trim().parse::<u32>().ok())
        {
            self.cipher.kdf_iterations = iterations;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.min_password_length, DEFAULT_MIN_PASSWORD_LENGTH);
        assert!(!config.cache_keys);
        assert_eq!(config.cipher.kdf_iterations, DEFAULT_KDF_ITERATIONS);
        assert_eq!(config.cipher.page_size, DEFAULT_CIPHER_PAGE_SIZE);
        assert!(config.cipher.use_hmac);
        assert!(config.cipher.license.is_none());
    }

    #[test]
    fn test_config_load_from_file_partial() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");

        let config_json = r#"{
            "log_level": "debug",
            "cipher": { "kdf_iterations": 64000 }
        }"#;
        std::fs::write(&config_path, config_json).unwrap();

        let config = Config::load_from_file(&config_path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.cipher.kdf_iterations, 64000);
        // Unspecified cipher fields keep their defaults
        assert_eq!(config.cipher.page_size, DEFAULT_CIPHER_PAGE_SIZE);
        assert_eq!(config.database_name, "vault.db");
    }

    #[test]
    fn test_malformed_config_file_is_reported() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(&config_path, "{ \"log_level\": ").unwrap();

        assert!(matches!(
            Config::load_from_file(&config_path),
            Err(CoreError::MalformedConfig(_))
        ));
    }

    #[test]
    fn test_config_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let mut config = Config::default();
        config.log_level = "trace".to_string();
        config.cache_keys = true;
        config.cipher.license = Some("license-token".to_string());
        config.save(&paths).unwrap();

        let loaded = Config::load(&paths).unwrap();
        assert!(loaded.cache_keys);
        assert_eq!(loaded.cipher.license.as_deref(), Some("license-token"));
    }

    #[test]
    fn test_config_load_nonexistent_uses_defaults() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let config = Config::load(&paths).unwrap();
        assert_eq!(config.cipher, CipherDefaults::default());
    }

    #[test]
    fn test_overrides_from_lookup() {
        let mut config = Config::default();
        config.apply_overrides(|name| match name {
            "VAULT_LOG_LEVEL" => Some("warn".to_string()),
            "VAULT_KDF_ITERATIONS" => Some("1000".to_string()),
            _ => None,
        });
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.cipher.kdf_iterations, 1000);
    }

    #[test]
    fn test_bad_iteration_override_is_ignored() {
        let mut config = Config::default();
        config.apply_overrides(|name| match name {
            "VAULT_KDF_ITERATIONS" => Some("lots".to_string()),
            _ => None,
        });
        assert_eq!(config.cipher.kdf_iterations, DEFAULT_KDF_ITERATIONS);
    }

    #[test]
    fn test_validate_rejects_odd_page_size() {
        let mut config = Config::default();
        config.cipher.page_size = 3000;
        assert!(matches!(config.validate(), Err(CoreError::InvalidConfig(_))));

        config.cipher.page_size = 1024;
        assert!(config.validate().is_ok());

        config.cipher.kdf_iterations = 0;
        assert!(config.validate().is_err());
    }
}
