//! Encrypted per-device credential store.
//!
//! Each item is the JSON of a [`DeviceCredentials`], sealed with
//! XChaCha20-Poly1305 under a 32-byte key kept next to the data file.
//! Stored form is `base64(nonce || ciphertext)`.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    XChaCha20Poly1305, XNonce,
};
use chrono::{SecondsFormat, Utc};
use rand::RngCore;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use super::models::{DeviceCredentials, SecretsFile};
use super::StorageError;
use crate::scheduler::CredentialResolver;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;

pub struct SecretStore {
    key: [u8; KEY_LEN],
    path: PathBuf,
    lock: Mutex<()>,
}

impl SecretStore {
    /// Open the store, generating a key file on first use.
    pub fn open<K: AsRef<Path>, D: AsRef<Path>>(key_path: K, data_path: D) -> Result<Self, StorageError> {
        let key = load_or_create_key(key_path.as_ref())?;
        Ok(Self {
            key,
            path: data_path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<DeviceCredentials>, StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let file = self.load()?;
        let Some(blob) = file.items.get(id) else {
            return Ok(None);
        };
        let plaintext = open_sealed(&self.key, blob)?;
        Ok(Some(serde_json::from_slice(&plaintext)?))
    }

    pub fn set(&self, id: &str, credentials: &DeviceCredentials) -> Result<(), StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = self.load()?;
        let raw = serde_json::to_vec(credentials)?;
        file.items.insert(id.to_string(), seal(&self.key, &raw)?);
        file.updated_at = now_rfc3339();
        self.save(&file)
    }

    pub fn delete(&self, id: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = self.load()?;
        file.items.remove(id);
        file.updated_at = now_rfc3339();
        self.save(&file)
    }

    fn load(&self) -> Result<SecretsFile, StorageError> {
        if !self.path.exists() {
            return Ok(SecretsFile {
                version: 1,
                updated_at: now_rfc3339(),
                items: Default::default(),
            });
        }
        let data = fs::read(&self.path)?;
        let mut file: SecretsFile = serde_json::from_slice(&data)?;
        if file.version == 0 {
            file.version = 1;
        }
        Ok(file)
    }

    fn save(&self, file: &SecretsFile) -> Result<(), StorageError> {
        let payload = serde_json::to_vec_pretty(file)?;
        write_private(&self.path, &payload)
    }
}

impl CredentialResolver for SecretStore {
    fn lookup(&self, device_id: &str) -> Result<Option<DeviceCredentials>, StorageError> {
        self.get(device_id)
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn load_or_create_key(path: &Path) -> Result<[u8; KEY_LEN], StorageError> {
    if path.exists() {
        let raw = fs::read_to_string(path)?;
        let decoded = STANDARD
            .decode(raw.trim())
            .map_err(|e| StorageError::InvalidKey(e.to_string()))?;
        return decoded
            .try_into()
            .map_err(|v: Vec<u8>| StorageError::InvalidKey(format!("expected {} bytes, got {}", KEY_LEN, v.len())));
    }

    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    write_private(path, STANDARD.encode(key).as_bytes())?;
    tracing::info!("Generated new secret key at {}", path.display());
    Ok(key)
}

/// Write a file readable by the owner only. The mode is set at creation.
fn write_private(path: &Path, payload: &[u8]) -> Result<(), StorageError> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(payload)?;
    Ok(())
}

fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<String, StorageError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from(nonce_bytes);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| StorageError::Crypto(format!("encryption failed: {}", e)))?;

    let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(combined))
}

fn open_sealed(key: &[u8; KEY_LEN], payload: &str) -> Result<Vec<u8>, StorageError> {
    let data = STANDARD
        .decode(payload)
        .map_err(|e| StorageError::Crypto(format!("invalid payload encoding: {}", e)))?;
    if data.len() < NONCE_LEN {
        return Err(StorageError::Crypto("invalid payload".to_string()));
    }
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|e| StorageError::Crypto(format!("decryption failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> DeviceCredentials {
        DeviceCredentials {
            os: "linux".into(),
            host: "10.0.0.5".into(),
            port: 22,
            auth_method: "password".into(),
            username: "admin".into(),
            password: "hunter2".into(),
            connect_enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_set_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretStore::open(dir.path().join("secrets.key"), dir.path().join("secrets.json")).unwrap();

        assert_eq!(store.get("node-1").unwrap(), None);

        store.set("node-1", &creds()).unwrap();
        assert_eq!(store.get("node-1").unwrap(), Some(creds()));
        assert_eq!(store.lookup("node-1").unwrap(), Some(creds()));

        store.delete("node-1").unwrap();
        assert_eq!(store.get("node-1").unwrap(), None);
    }

    #[test]
    fn test_secrets_not_stored_in_clear() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("secrets.json");
        let store = SecretStore::open(dir.path().join("secrets.key"), &data).unwrap();
        store.set("node-1", &creds()).unwrap();

        let raw = fs::read_to_string(&data).unwrap();
        assert!(raw.contains("node-1"));
        assert!(!raw.contains("hunter2"));
    }

    #[test]
    fn test_key_reused_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("secrets.key");
        let data = dir.path().join("secrets.json");

        SecretStore::open(&key, &data).unwrap().set("a", &creds()).unwrap();
        let reopened = SecretStore::open(&key, &data).unwrap();
        assert_eq!(reopened.get("a").unwrap(), Some(creds()));
    }

    #[test]
    fn test_wrong_key_fails_to_decrypt() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("secrets.json");
        SecretStore::open(dir.path().join("one.key"), &data)
            .unwrap()
            .set("a", &creds())
            .unwrap();

        let other = SecretStore::open(dir.path().join("two.key"), &data).unwrap();
        assert!(matches!(other.get("a"), Err(StorageError::Crypto(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_key_and_data_files_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("secrets.key");
        let data = dir.path().join("secrets.json");
        SecretStore::open(&key, &data).unwrap().set("a", &creds()).unwrap();

        for path in [&key, &data] {
            let mode = fs::metadata(path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600, "{}", path.display());
        }
    }

    #[test]
    fn test_invalid_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("secrets.key");
        fs::write(&key, STANDARD.encode([1u8; 16])).unwrap();
        let result = SecretStore::open(&key, dir.path().join("secrets.json"));
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));
    }
}
