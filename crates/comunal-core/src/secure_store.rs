//! Password-sealed JSON documents on disk.
//!
//! File layout: `<hex HMAC-SHA256 of token>\n<token>`, where the token is the
//! self-contained ciphertext produced by [`crate::crypto::encrypt_token`] and
//! the HMAC is keyed with the raw password bytes. A document whose seal or
//! token does not verify is reported as [`StoreError::Corrupted`] and must be
//! treated like a missing one.

use crate::atomic::{self, StagedWrite, BACKUP_SUFFIX};
use crate::config::{StoreConfig, DEFAULT_READ_ATTEMPTS, DEFAULT_READ_RETRY_DELAY_MS};
use crate::crypto::{
    decrypt_token, derive_key, encrypt_token, seal, verify_seal, DERIVED_KEY_LEN, KDF_ITERATIONS,
};
use crate::error::StoreError;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};
use zeroize::Zeroizing;

struct CachedKey {
    fingerprint: [u8; 32],
    key: Zeroizing<[u8; DERIVED_KEY_LEN]>,
}

pub struct SecureStore {
    root: PathBuf,
    kdf_iterations: u32,
    read_attempts: u32,
    read_retry_delay: Duration,
    key_cache: Mutex<Option<CachedKey>>,
}

impl std::fmt::Debug for SecureStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureStore")
            .field("root", &self.root)
            .field("kdf_iterations", &self.kdf_iterations)
            .field("read_attempts", &self.read_attempts)
            .finish_non_exhaustive()
    }
}

impl SecureStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            kdf_iterations: KDF_ITERATIONS,
            read_attempts: DEFAULT_READ_ATTEMPTS,
            read_retry_delay: Duration::from_millis(DEFAULT_READ_RETRY_DELAY_MS),
            key_cache: Mutex::new(None),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(&config.data_dir)
            .with_kdf_iterations(config.kdf_iterations)
            .with_read_retry(config.read_attempts, config.read_retry_delay())
    }

    /// Only for tests and tooling; documents sealed with a different count
    /// cannot be opened by a default store.
    pub fn with_kdf_iterations(mut self, iterations: u32) -> Self {
        self.kdf_iterations = iterations.max(1);
        self
    }

    pub fn with_read_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.read_attempts = attempts.max(1);
        self.read_retry_delay = delay;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn document_path(&self, document: &str) -> Result<PathBuf, StoreError> {
        let valid = !document.is_empty()
            && !document.starts_with('.')
            && !document.contains(['/', '\\'])
            && document != "..";
        if !valid {
            return Err(StoreError::InvalidName(document.to_string()));
        }
        Ok(self.root.join(document))
    }

    pub fn exists(&self, document: &str) -> bool {
        self.document_path(document)
            .map(|p| p.is_file())
            .unwrap_or(false)
    }

    pub fn save(&self, document: &str, payload: &Value, password: &str) -> Result<(), StoreError> {
        let staged = self.stage(document, payload, password)?;
        self.commit(document, staged)
    }

    pub fn save_as<T: Serialize>(
        &self,
        document: &str,
        value: &T,
        password: &str,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_value(value).map_err(|source| StoreError::Serialize {
            document: document.to_string(),
            source,
        })?;
        self.save(document, &payload, password)
    }

    /// Seal `payload` and write it to a temp file beside the document. The
    /// live file is not touched until [`SecureStore::commit`].
    pub fn stage(
        &self,
        document: &str,
        payload: &Value,
        password: &str,
    ) -> Result<StagedWrite, StoreError> {
        let path = self.document_path(document)?;
        let plaintext = serde_json::to_vec(payload).map_err(|source| StoreError::Serialize {
            document: document.to_string(),
            source,
        })?;
        let key = self.key_for(password);
        let token = encrypt_token(&key, &plaintext)?;
        let digest = seal(password, token.as_bytes())?;
        let mut content = Vec::with_capacity(digest.len() + 1 + token.len());
        content.extend_from_slice(digest.as_bytes());
        content.push(b'\n');
        content.extend_from_slice(token.as_bytes());

        atomic::copy_aside(&path, BACKUP_SUFFIX);
        atomic::stage(&path, &content).map_err(|e| StoreError::write(document, e))
    }

    pub fn commit(&self, document: &str, staged: StagedWrite) -> Result<(), StoreError> {
        let path = staged.destination().to_path_buf();
        staged
            .commit()
            .map_err(|e| StoreError::write(document, e))?;
        atomic::hide(&path);
        debug!(document, path = %path.display(), "document written");
        Ok(())
    }

    pub fn load(&self, document: &str, password: &str) -> Result<Value, StoreError> {
        let path = self.document_path(document)?;
        if !path.exists() {
            return Err(StoreError::NotFound(document.to_string()));
        }
        let bytes = self.read_with_retry(&path, document)?;

        let newline = bytes
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| StoreError::corrupted(document, "missing seal line"))?;
        let (seal_line, token) = (&bytes[..newline], &bytes[newline + 1..]);
        let seal_hex = std::str::from_utf8(seal_line)
            .map_err(|_| StoreError::corrupted(document, "seal line is not text"))?;

        if !verify_seal(password, token, seal_hex) {
            warn!(document, path = %path.display(), "integrity seal mismatch, possible tampering");
            return Err(StoreError::corrupted(document, "integrity seal mismatch"));
        }

        let key = self.key_for(password);
        let plaintext = decrypt_token(&key, token).map_err(|e| {
            warn!(document, "token rejected after seal check: {e}");
            StoreError::corrupted(document, e.to_string())
        })?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| StoreError::corrupted(document, format!("invalid json: {e}")))
    }

    pub fn load_as<T: DeserializeOwned>(
        &self,
        document: &str,
        password: &str,
    ) -> Result<T, StoreError> {
        let value = self.load(document, password)?;
        serde_json::from_value(value).map_err(|e| StoreError::Schema {
            document: document.to_string(),
            reason: e.to_string(),
        })
    }

    /// Delete a document. Returns whether a file was removed.
    pub fn remove(&self, document: &str) -> Result<bool, StoreError> {
        let path = self.document_path(document)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::write(document, e)),
        }
    }

    fn read_with_retry(&self, path: &Path, document: &str) -> Result<Vec<u8>, StoreError> {
        for attempt in 1..=self.read_attempts {
            match fs::read(path) {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(StoreError::NotFound(document.to_string()));
                }
                Err(e) => {
                    warn!(document, attempt, "read failed: {e}");
                    if attempt < self.read_attempts {
                        thread::sleep(self.read_retry_delay);
                    }
                }
            }
        }
        warn!(document, "giving up after {} read attempts", self.read_attempts);
        Err(StoreError::NotFound(document.to_string()))
    }

    fn key_for(&self, password: &str) -> Zeroizing<[u8; DERIVED_KEY_LEN]> {
        let mut hasher = Sha256::new();
        hasher.update(self.kdf_iterations.to_le_bytes());
        hasher.update(password.as_bytes());
        let mut fingerprint = [0u8; 32];
        fingerprint.copy_from_slice(&hasher.finalize());

        let mut cache = self.key_cache.lock();
        if let Some(cached) = cache.as_ref() {
            if cached.fingerprint == fingerprint {
                return cached.key.clone();
            }
        }
        let key = derive_key(password, self.kdf_iterations);
        *cache = Some(CachedKey {
            fingerprint,
            key: key.clone(),
        });
        key
    }
}
