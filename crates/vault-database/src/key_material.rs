//! Credentials and cipher configuration for unlocking the store.
//!
//! A [`KeyMaterial`] never derives key bytes itself. Passwords are handed to the
//! engine's KDF pragmas together with the configured iteration count and hash;
//! raw keys are handed over as the engine's `x'...'` literal and skip the KDF.

use crate::{VaultError, VaultResult};
use rand::RngCore;
use rusqlite::{Connection, DatabaseName};
use std::fmt;
use vault_config::{
    CipherDefaults, DEFAULT_CIPHER_PAGE_SIZE, DEFAULT_HMAC_ALGORITHM, DEFAULT_KDF_ALGORITHM,
    DEFAULT_KDF_ITERATIONS,
};
use zeroize::Zeroizing;

pub use vault_config::DEFAULT_MIN_PASSWORD_LENGTH as MIN_PASSWORD_LENGTH;

/// Accepted raw key lengths in hex digits: key, key + salt, and 64-byte keys.
pub const RAW_KEY_HEX_LENGTHS: [usize; 3] = [64, 96, 128];

/// Size of a generated raw key (256 bits).
pub const RAW_KEY_SIZE: usize = 32;

/// Returns true if `password` is long enough to be worth sending to the engine.
pub fn password_is_valid(password: &str, min_length: usize) -> bool {
    !password.trim().is_empty() && password.chars().count() >= min_length.max(1)
}

/// The secret half of a key.
#[derive(Clone)]
pub enum Credential {
    /// Passphrase run through the engine's KDF.
    Password {
        value: Zeroizing<String>,
        kdf_iterations: u32,
        kdf_algorithm: String,
    },
    /// Hex-encoded key bytes used as-is.
    RawKey { hex: Zeroizing<String> },
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password {
                kdf_iterations,
                kdf_algorithm,
                ..
            } => f
                .debug_struct("Password")
                .field("value", &"<redacted>")
                .field("kdf_iterations", kdf_iterations)
                .field("kdf_algorithm", kdf_algorithm)
                .finish(),
            Credential::RawKey { hex } => f
                .debug_struct("RawKey")
                .field("hex_len", &hex.len())
                .finish(),
        }
    }
}

/// Page-level cipher configuration that travels with a credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherSettings {
    pub cipher_name: Option<String>,
    pub use_hmac: bool,
    pub page_size: u32,
    pub hmac_algorithm: String,
    pub license: Option<String>,
}

impl Default for CipherSettings {
    fn default() -> Self {
        Self {
            cipher_name: None,
            use_hmac: true,
            page_size: DEFAULT_CIPHER_PAGE_SIZE,
            hmac_algorithm: DEFAULT_HMAC_ALGORITHM.to_string(),
            license: None,
        }
    }
}

impl From<&CipherDefaults> for CipherSettings {
    fn from(defaults: &CipherDefaults) -> Self {
        Self {
            cipher_name: defaults.cipher_name.clone(),
            use_hmac: defaults.use_hmac,
            page_size: defaults.page_size,
            hmac_algorithm: defaults.hmac_algorithm.clone(),
            license: defaults.license.clone(),
        }
    }
}

/// A credential plus the cipher settings it must be applied with.
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    credential: Credential,
    settings: CipherSettings,
}

impl KeyMaterial {
    /// Password key with SQLCipher 4 default settings.
    pub fn password(value: impl Into<String>) -> Self {
        Self {
            credential: Credential::Password {
                value: Zeroizing::new(value.into()),
                kdf_iterations: DEFAULT_KDF_ITERATIONS,
                kdf_algorithm: DEFAULT_KDF_ALGORITHM.to_string(),
            },
            settings: CipherSettings::default(),
        }
    }

    /// Password key using configured defaults.
    pub fn password_with(value: impl Into<String>, defaults: &CipherDefaults) -> Self {
        Self {
            credential: Credential::Password {
                value: Zeroizing::new(value.into()),
                kdf_iterations: defaults.kdf_iterations,
                kdf_algorithm: defaults.kdf_algorithm.clone(),
            },
            settings: CipherSettings::from(defaults),
        }
    }

    /// Raw hex key with default settings.
    pub fn raw(hex: impl Into<String>) -> Self {
        Self {
            credential: Credential::RawKey {
                hex: Zeroizing::new(hex.into()),
            },
            settings: CipherSettings::default(),
        }
    }

    /// Raw hex key using configured cipher settings. KDF fields are ignored.
    pub fn raw_with(hex: impl Into<String>, defaults: &CipherDefaults) -> Self {
        Self {
            credential: Credential::RawKey {
                hex: Zeroizing::new(hex.into()),
            },
            settings: CipherSettings::from(defaults),
        }
    }

    /// Generate a fresh random 256-bit raw key.
    pub fn generate_raw() -> Self {
        let mut bytes = Zeroizing::new([0u8; RAW_KEY_SIZE]);
        rand::thread_rng().fill_bytes(&mut bytes[..]);
        Self::raw(hex::encode_upper(&bytes[..]))
    }

    pub fn with_kdf_iterations(mut self, iterations: u32) -> Self {
        if let Credential::Password { kdf_iterations, .. } = &mut self.credential {
            *kdf_iterations = iterations;
        }
        self
    }

    pub fn with_kdf_algorithm(mut self, algorithm: impl Into<String>) -> Self {
        if let Credential::Password { kdf_algorithm, .. } = &mut self.credential {
            *kdf_algorithm = algorithm.into();
        }
        self
    }

    pub fn with_cipher(mut self, name: impl Into<String>) -> Self {
        self.settings.cipher_name = Some(name.into());
        self
    }

    pub fn with_hmac(mut self, use_hmac: bool) -> Self {
        self.settings.use_hmac = use_hmac;
        self
    }

    pub fn with_hmac_algorithm(mut self, algorithm: impl Into<String>) -> Self {
        self.settings.hmac_algorithm = algorithm.into();
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.settings.page_size = page_size;
        self
    }

    pub fn with_license(mut self, license: impl Into<String>) -> Self {
        self.settings.license = Some(license.into());
        self
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn settings(&self) -> &CipherSettings {
        &self.settings
    }

    pub fn is_raw(&self) -> bool {
        matches!(self.credential, Credential::RawKey { .. })
    }

    /// KDF parameters the engine will use with this key.
    ///
    /// Raw keys never touch the KDF, so they report the engine defaults the
    /// handle is left with.
    pub fn effective_kdf(&self) -> (u32, &str) {
        match &self.credential {
            Credential::Password {
                kdf_iterations,
                kdf_algorithm,
                ..
            } => (*kdf_iterations, kdf_algorithm.as_str()),
            Credential::RawKey { .. } => (DEFAULT_KDF_ITERATIONS, DEFAULT_KDF_ALGORITHM),
        }
    }

    /// Check the shape of the key before any engine call.
    pub fn validate(&self, min_password_length: usize) -> VaultResult<()> {
        match &self.credential {
            Credential::Password {
                value,
                kdf_iterations,
                kdf_algorithm,
            } => {
                if !password_is_valid(value, min_password_length) {
                    return Err(VaultError::InvalidKeyMaterial(format!(
                        "password must be at least {} characters",
                        min_password_length
                    )));
                }
                if *kdf_iterations == 0 {
                    return Err(VaultError::InvalidKeyMaterial(
                        "kdf iterations must be positive".to_string(),
                    ));
                }
                if kdf_algorithm.trim().is_empty() {
                    return Err(VaultError::InvalidKeyMaterial(
                        "kdf algorithm must not be empty".to_string(),
                    ));
                }
            }
            Credential::RawKey { hex } => validate_raw_hex(hex)?,
        }

        let page = self.settings.page_size;
        if !(512..=65536).contains(&page) || !page.is_power_of_two() {
            return Err(VaultError::InvalidKeyMaterial(format!(
                "page size {} is not a power of two between 512 and 65536",
                page
            )));
        }
        if self.settings.hmac_algorithm.trim().is_empty() {
            return Err(VaultError::InvalidKeyMaterial(
                "hmac algorithm must not be empty".to_string(),
            ));
        }
        if matches!(&self.settings.cipher_name, Some(name) if name.trim().is_empty()) {
            return Err(VaultError::InvalidKeyMaterial(
                "cipher name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// The value passed to `PRAGMA key`, `PRAGMA rekey` and `ATTACH ... KEY`.
    pub(crate) fn key_literal(&self) -> Zeroizing<String> {
        match &self.credential {
            Credential::Password { value, .. } => value.clone(),
            Credential::RawKey { hex } => Zeroizing::new(format!("x'{}'", hex.as_str())),
        }
    }

    /// Key a fresh, untouched handle and apply settings to the main schema.
    pub(crate) fn apply_to(&self, conn: &Connection) -> rusqlite::Result<()> {
        if let Some(license) = &self.settings.license {
            conn.pragma_update(None, "cipher_license", license.as_str())?;
        }
        conn.pragma_update(None, "key", self.key_literal().as_str())?;
        self.apply_settings(conn, DatabaseName::Main)
    }

    /// Apply cipher settings to `schema`. Must run before the schema is first read.
    pub(crate) fn apply_settings(
        &self,
        conn: &Connection,
        schema: DatabaseName<'_>,
    ) -> rusqlite::Result<()> {
        if let Some(cipher) = &self.settings.cipher_name {
            conn.pragma_update(Some(schema), "cipher", cipher.as_str())?;
        }
        conn.pragma_update(Some(schema), "cipher_page_size", self.settings.page_size)?;
        if let Credential::Password {
            kdf_iterations,
            kdf_algorithm,
            ..
        } = &self.credential
        {
            conn.pragma_update(Some(schema), "kdf_iter", *kdf_iterations)?;
            conn.pragma_update(Some(schema), "cipher_kdf_algorithm", kdf_algorithm.as_str())?;
        }
        conn.pragma_update(Some(schema), "cipher_use_hmac", self.settings.use_hmac)?;
        conn.pragma_update(
            Some(schema),
            "cipher_hmac_algorithm",
            self.settings.hmac_algorithm.as_str(),
        )?;
        Ok(())
    }

    /// True if moving from `self` to `next` changes anything beyond the secret,
    /// which `PRAGMA rekey` cannot do in place.
    pub(crate) fn requires_export(&self, next: &KeyMaterial) -> bool {
        let current = &self.settings;
        let wanted = &next.settings;
        if current.cipher_name != wanted.cipher_name
            || current.use_hmac != wanted.use_hmac
            || current.page_size != wanted.page_size
            || current.hmac_algorithm != wanted.hmac_algorithm
        {
            return true;
        }
        match next.credential {
            Credential::Password { .. } => self.effective_kdf() != next.effective_kdf(),
            Credential::RawKey { .. } => false,
        }
    }
}

fn validate_raw_hex(hex: &str) -> VaultResult<()> {
    if !RAW_KEY_HEX_LENGTHS.contains(&hex.len()) {
        return Err(VaultError::InvalidKeyMaterial(format!(
            "raw key must be {:?} hex digits, got {}",
            RAW_KEY_HEX_LENGTHS,
            hex.len()
        )));
    }
    if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(VaultError::InvalidKeyMaterial(
            "raw key must contain only hex digits".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &str = "2DD29CA851E7B56E4697B0E1F08507293D761A05CE4D1B628663F411A8086D99";

    #[test]
    fn test_password_policy() {
        assert!(!password_is_valid("", MIN_PASSWORD_LENGTH));
        assert!(!password_is_valid("        ", MIN_PASSWORD_LENGTH));
        assert!(!password_is_valid("short", MIN_PASSWORD_LENGTH));
        assert!(password_is_valid("new-pass", MIN_PASSWORD_LENGTH));
        assert!(password_is_valid("correct-horse", MIN_PASSWORD_LENGTH));
        // Length counts characters, not bytes
        assert!(!password_is_valid("ééé", 4));
    }

    #[test]
    fn test_validate_password_key() {
        assert!(KeyMaterial::password("correct-horse").validate(8).is_ok());
        assert!(matches!(
            KeyMaterial::password("abc").validate(8),
            Err(VaultError::InvalidKeyMaterial(_))
        ));
        assert!(KeyMaterial::password("correct-horse")
            .with_kdf_iterations(0)
            .validate(8)
            .is_err());
    }

    #[test]
    fn test_validate_raw_key() {
        assert!(KeyMaterial::raw(RAW).validate(8).is_ok());
        assert!(KeyMaterial::raw(format!("{RAW}{}", &RAW[..32])).validate(8).is_ok());
        assert!(KeyMaterial::raw(&RAW[..60]).validate(8).is_err());

        let bad_char = format!("{}Z", &RAW[..63]);
        assert!(matches!(
            KeyMaterial::raw(bad_char).validate(8),
            Err(VaultError::InvalidKeyMaterial(_))
        ));
    }

    #[test]
    fn test_validate_page_size() {
        let key = KeyMaterial::password("correct-horse").with_page_size(1000);
        assert!(key.validate(8).is_err());
        let key = KeyMaterial::password("correct-horse").with_page_size(1024);
        assert!(key.validate(8).is_ok());
    }

    #[test]
    fn test_key_literal_forms() {
        assert_eq!(
            KeyMaterial::password("correct-horse").key_literal().as_str(),
            "correct-horse"
        );
        assert_eq!(
            KeyMaterial::raw(RAW).key_literal().as_str(),
            format!("x'{RAW}'")
        );
    }

    #[test]
    fn test_generated_raw_keys_are_valid_and_distinct() {
        let a = KeyMaterial::generate_raw();
        let b = KeyMaterial::generate_raw();
        assert!(a.is_raw());
        assert!(a.validate(8).is_ok());
        assert_ne!(a.key_literal().as_str(), b.key_literal().as_str());
    }

    #[test]
    fn test_password_with_config_defaults() {
        let defaults = CipherDefaults {
            kdf_iterations: 4000,
            page_size: 1024,
            use_hmac: false,
            ..CipherDefaults::default()
        };
        let key = KeyMaterial::password_with("correct-horse", &defaults);
        assert_eq!(key.effective_kdf().0, 4000);
        assert_eq!(key.settings().page_size, 1024);
        assert!(!key.settings().use_hmac);
    }

    #[test]
    fn test_requires_export() {
        let old = KeyMaterial::password("correct-horse");
        assert!(!old.requires_export(&KeyMaterial::password("new-pass")));
        assert!(!old.requires_export(&KeyMaterial::raw(RAW)));
        assert!(old.requires_export(&KeyMaterial::password("new-pass").with_kdf_iterations(4000)));
        assert!(old.requires_export(&KeyMaterial::password("new-pass").with_page_size(1024)));
        assert!(old.requires_export(&KeyMaterial::raw(RAW).with_hmac(false)));
        // The license token is not a file setting
        assert!(!old.requires_export(&KeyMaterial::password("new-pass").with_license("token")));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let rendered = format!("{:?}", KeyMaterial::password("correct-horse"));
        assert!(!rendered.contains("correct-horse"));
        let rendered = format!("{:?}", KeyMaterial::raw(RAW));
        assert!(!rendered.contains(RAW));
    }
}
