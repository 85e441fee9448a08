//! Credential protection for stored passwords.
//!
//! Passwords in a [`crate::config::CacheConfig`] are kept at rest in a form
//! protected by a named scheme (`secure_name`). The [`CredentialProtector`]
//! trait is the seam to whatever secret-management service the application
//! uses; [`KeyedProtector`] is a self-contained implementation keyed by a
//! per-scheme secret.
//!
//! # Example
//!
//! ```
//! use cache_bridge::security::{CredentialProtector, KeyedProtector, SchemeConfig};
//!
//! let protector = KeyedProtector::new();
//! assert!(protector.register_scheme("Primary", SchemeConfig::new("correct horse")));
//!
//! let sealed = protector.encrypt("Primary", "s3cret").unwrap();
//! assert_ne!(sealed, "s3cret");
//! assert_eq!(protector.decrypt("Primary", &sealed).unwrap(), "s3cret");
//! ```

use crate::config::DEFAULT_SECURE_NAME;
use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Environment variable holding the secret of the default scheme.
pub const SECURE_KEY_ENV: &str = "CACHE_SECURE_KEY";

const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 32;

/// Settings of one protection scheme.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemeConfig {
    secret: String,
}

impl SchemeConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        SchemeConfig {
            secret: secret.into(),
        }
    }
}

impl std::fmt::Debug for SchemeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemeConfig").field("secret", &"***").finish()
    }
}

/// Encrypts and decrypts credentials under named schemes.
///
/// Implementations must be safe to share across threads; the builder and the
/// provider lifecycle both hold an `Arc<dyn CredentialProtector>`.
pub trait CredentialProtector: Send + Sync {
    /// Register (or replace) a scheme. Returns `false` when the config is unusable.
    fn register_scheme(&self, name: &str, config: SchemeConfig) -> bool;

    /// Forget a scheme. No-op when absent.
    fn deregister_scheme(&self, name: &str);

    /// Whether `name` is currently registered.
    fn is_registered(&self, name: &str) -> bool;

    /// Protect `plaintext` under scheme `scheme`.
    ///
    /// # Errors
    /// Returns `Error::Credential` if the scheme is unknown.
    fn encrypt(&self, scheme: &str, plaintext: &str) -> Result<String>;

    /// Recover the plaintext of `ciphertext` protected under `scheme`.
    ///
    /// # Errors
    /// Returns `Error::Credential` if the scheme is unknown or the value was
    /// not produced by that scheme.
    fn decrypt(&self, scheme: &str, ciphertext: &str) -> Result<String>;

    /// Move a protected value from scheme `from` to scheme `to`.
    ///
    /// An empty scheme name stands for "stored as plaintext".
    fn rekey(&self, value: &str, from: &str, to: &str) -> Result<String> {
        let plaintext = if from.is_empty() {
            value.to_string()
        } else {
            self.decrypt(from, value)?
        };
        if to.is_empty() {
            Ok(plaintext)
        } else {
            self.encrypt(to, &plaintext)
        }
    }
}

/// Per-scheme key material.
struct SchemeKeys {
    cipher: [u8; 32],
    mac: [u8; 32],
}

impl SchemeKeys {
    fn derive(secret: &str) -> Self {
        let mut cipher = Sha256::new();
        cipher.update(b"cache-bridge:cipher:");
        cipher.update(secret.as_bytes());

        let mut mac = Sha256::new();
        mac.update(b"cache-bridge:mac:");
        mac.update(secret.as_bytes());

        SchemeKeys {
            cipher: cipher.finalize().into(),
            mac: mac.finalize().into(),
        }
    }

    fn keystream_xor(&self, nonce: &[u8], data: &mut [u8]) -> Result<()> {
        for (counter, chunk) in data.chunks_mut(32).enumerate() {
            let mut block = <HmacSha256 as Mac>::new_from_slice(&self.cipher)
                .map_err(|e| Error::Credential(format!("Invalid cipher key: {}", e)))?;
            block.update(nonce);
            block.update(&(counter as u64).to_be_bytes());
            let pad = block.finalize().into_bytes();
            for (byte, key) in chunk.iter_mut().zip(pad.iter()) {
                *byte ^= key;
            }
        }
        Ok(())
    }

    fn authenticator(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<HmacSha256> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac)
            .map_err(|e| Error::Credential(format!("Invalid MAC key: {}", e)))?;
        mac.update(nonce);
        mac.update(ciphertext);
        Ok(mac)
    }
}

/// Secret-keyed credential protector.
///
/// Values are sealed as `base64(nonce || ciphertext || tag)`: an HMAC-SHA256
/// keystream in counter mode, authenticated by a separate HMAC-SHA256 over
/// nonce and ciphertext. Both keys are derived from the scheme secret.
#[derive(Default)]
pub struct KeyedProtector {
    schemes: DashMap<String, SchemeKeys>,
}

impl KeyedProtector {
    pub fn new() -> Self {
        KeyedProtector {
            schemes: DashMap::new(),
        }
    }

    /// Create a protector whose default scheme is seeded from `CACHE_SECURE_KEY`.
    ///
    /// When the variable is unset the protector starts empty, and stored
    /// passwords using the default scheme are treated as plaintext.
    pub fn from_env() -> Self {
        let protector = Self::new();
        if let Ok(secret) = std::env::var(SECURE_KEY_ENV) {
            if protector.register_scheme(DEFAULT_SECURE_NAME, SchemeConfig::new(secret)) {
                debug!("Default credential scheme {} initialized", DEFAULT_SECURE_NAME);
            }
        }
        protector
    }

    fn unknown_scheme(scheme: &str) -> Error {
        Error::Credential(format!("Credential scheme not registered: {}", scheme))
    }
}

impl CredentialProtector for KeyedProtector {
    fn register_scheme(&self, name: &str, config: SchemeConfig) -> bool {
        if name.trim().is_empty() || config.secret.is_empty() {
            return false;
        }
        if self
            .schemes
            .insert(name.to_string(), SchemeKeys::derive(&config.secret))
            .is_some()
        {
            warn!("⚠ Credential scheme {} replaced", name);
        }
        true
    }

    fn deregister_scheme(&self, name: &str) {
        if self.schemes.remove(name).is_some() {
            debug!("Credential scheme {} deregistered", name);
        }
    }

    fn is_registered(&self, name: &str) -> bool {
        self.schemes.contains_key(name)
    }

    fn encrypt(&self, scheme: &str, plaintext: &str) -> Result<String> {
        let keys = self
            .schemes
            .get(scheme)
            .ok_or_else(|| Self::unknown_scheme(scheme))?;

        let nonce: [u8; NONCE_LEN] = rand::random();
        let mut body = plaintext.as_bytes().to_vec();
        keys.keystream_xor(&nonce, &mut body)?;
        let tag = keys.authenticator(&nonce, &body)?.finalize().into_bytes();

        let mut sealed = Vec::with_capacity(NONCE_LEN + body.len() + TAG_LEN);
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&body);
        sealed.extend_from_slice(&tag);
        Ok(STANDARD.encode(sealed))
    }

    fn decrypt(&self, scheme: &str, ciphertext: &str) -> Result<String> {
        let keys = self
            .schemes
            .get(scheme)
            .ok_or_else(|| Self::unknown_scheme(scheme))?;

        let sealed = STANDARD
            .decode(ciphertext)
            .map_err(|e| Error::Credential(format!("Malformed protected value: {}", e)))?;
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::Credential("Protected value too short".into()));
        }

        let (nonce, rest) = sealed.split_at(NONCE_LEN);
        let (body, tag) = rest.split_at(rest.len() - TAG_LEN);
        keys.authenticator(nonce, body)?
            .verify_slice(tag)
            .map_err(|_| {
                Error::Credential(format!("Value was not protected by scheme {}", scheme))
            })?;

        let mut plain = body.to_vec();
        keys.keystream_xor(nonce, &mut plain)?;
        String::from_utf8(plain)
            .map_err(|e| Error::Credential(format!("Decrypted value is not UTF-8: {}", e)))
    }
}
