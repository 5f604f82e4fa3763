//! Encrypted on-disk config cache
//!
//! The config bundle is cached at `config_cache/master_config.enc`, sealed
//! with AES-256-GCM under a key derived from the current date plus a fixed
//! password (PBKDF2-HMAC-SHA256, 100k iterations, fixed salt). Because the
//! key rotates daily, reads also try the previous day's key to cover the
//! midnight boundary. The payload embeds an MD5 checksum over the canonical
//! JSON of the bundle; a mismatch is treated as a cache miss.
//!
//! Writes are atomic (temp file + rename) so a crashed write never leaves a
//! half-sealed cache behind.

use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use chrono::{Duration, Local, NaiveDate};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, warn};

use super::bundle::ConfigBundle;
use crate::types::now_ts;

/// Cache file name under the cache directory.
pub const CACHE_FILE_NAME: &str = "master_config.enc";

/// Fixed salt for key derivation; must match the config-authoring tooling.
const KEY_SALT: &[u8] = b"detector_cache_salt_2024";

/// Password suffix appended to the date when deriving the daily key.
const KEY_PASSWORD: &str = "Ma!!orca123";

const PBKDF2_ITERATIONS: u32 = 100_000;

/// Cached bundles older than this are ignored.
const MAX_CACHE_AGE_SECS: f64 = 86_400.0;

const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache file missing")]
    Missing,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("decryption failed with today's and yesterday's key")]
    Decrypt,
    #[error("encryption failed")]
    Encrypt,
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("cache too old ({age_secs:.0}s)")]
    TooOld { age_secs: f64 },
    #[error("payload invalid: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct CachePayload {
    timestamp: f64,
    data: Value,
    checksum: String,
}

/// Derive the 32-byte AES key for a given date.
fn derive_key(date: NaiveDate) -> [u8; 32] {
    let password = format!("{}{}", date.format("%Y_%m_%d"), KEY_PASSWORD);
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), KEY_SALT, PBKDF2_ITERATIONS, &mut key);
    key
}

/// Canonical JSON with recursively sorted object keys, so the checksum is
/// stable across serialization orders.
fn canonical_json(value: &Value) -> String {
    fn canonicalize(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&Value::String((*key).clone()).to_string());
                    out.push(':');
                    canonicalize(&map[*key], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    canonicalize(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }

    let mut out = String::new();
    canonicalize(value, &mut out);
    out
}

/// MD5 checksum over the canonical JSON of a bundle value.
pub fn bundle_checksum(data: &Value) -> String {
    format!("{:x}", md5::compute(canonical_json(data)))
}

/// Encrypted cache bound to one directory.
#[derive(Debug, Clone)]
pub struct ConfigCache {
    path: PathBuf,
}

impl ConfigCache {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            path: cache_dir.join(CACHE_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Seal the bundle under today's key and atomically replace the cache
    /// file.
    pub fn store(&self, bundle: &ConfigBundle) -> Result<(), CacheError> {
        let data = serde_json::to_value(bundle)?;
        let payload = CachePayload {
            timestamp: now_ts(),
            checksum: bundle_checksum(&data),
            data,
        };
        let plaintext = serde_json::to_vec(&payload)?;

        let key = derive_key(Local::now().date_naive());
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| CacheError::Encrypt)?;

        let mut file_bytes = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        file_bytes.extend_from_slice(&nonce_bytes);
        file_bytes.extend_from_slice(&ciphertext);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("enc.tmp");
        std::fs::write(&tmp, &file_bytes)?;
        std::fs::rename(&tmp, &self.path)?;

        debug!(path = %self.path.display(), "Saved encrypted config cache");
        Ok(())
    }

    /// Load and validate the cached bundle.
    ///
    /// Tries today's key first, then yesterday's (midnight rotation). A
    /// checksum mismatch or an over-age payload is a cache miss - the
    /// in-memory state is never touched by a bad cache.
    pub fn load(&self) -> Result<ConfigBundle, CacheError> {
        if !self.path.exists() {
            return Err(CacheError::Missing);
        }
        let file_bytes = std::fs::read(&self.path)?;
        if file_bytes.len() <= NONCE_LEN {
            return Err(CacheError::Decrypt);
        }
        let (nonce_bytes, ciphertext) = file_bytes.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let today = Local::now().date_naive();
        let yesterday = today - Duration::days(1);

        let mut plaintext = None;
        for (date, label) in [(today, "today"), (yesterday, "yesterday")] {
            let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&derive_key(date)));
            if let Ok(pt) = cipher.decrypt(nonce, ciphertext) {
                if label == "yesterday" {
                    debug!("Config cache decrypted with yesterday's key");
                }
                plaintext = Some(pt);
                break;
            }
        }
        let plaintext = plaintext.ok_or(CacheError::Decrypt)?;

        let payload: CachePayload = serde_json::from_slice(&plaintext)?;
        if bundle_checksum(&payload.data) != payload.checksum {
            warn!("Config cache checksum mismatch - treating as miss");
            return Err(CacheError::ChecksumMismatch);
        }

        let age_secs = now_ts() - payload.timestamp;
        if age_secs > MAX_CACHE_AGE_SECS {
            return Err(CacheError::TooOld { age_secs });
        }

        Ok(serde_json::from_value(payload.data)?)
    }
}
