//! Flat-file board store.

use chrono::Utc;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use super::StorageError;

/// The canvas document, persisted as pretty-printed JSON.
pub struct BoardStore {
    dir: PathBuf,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl BoardStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        let dir = dir.as_ref().to_path_buf();
        let path = dir.join("board.json");
        Self {
            dir,
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the data directory and a default board if none exists yet.
    pub fn ensure(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir)?;
        if !self.path.exists() {
            let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
            if !self.path.exists() {
                let payload = serde_json::to_vec_pretty(&default_board())?;
                fs::write(&self.path, payload)?;
                tracing::info!("Created default board at {}", self.path.display());
            }
        }
        Ok(())
    }

    /// Raw board bytes, creating the default board first if needed.
    pub fn load(&self) -> Result<Vec<u8>, StorageError> {
        self.ensure()?;
        Ok(fs::read(&self.path)?)
    }

    /// Validate and store a board document.
    pub fn save(&self, body: &[u8]) -> Result<(), StorageError> {
        let doc: serde_json::Value = serde_json::from_slice(body)?;
        let pretty = serde_json::to_vec_pretty(&doc)?;

        fs::create_dir_all(&self.dir)?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        fs::write(&self.path, pretty)?;
        Ok(())
    }
}

fn default_board() -> serde_json::Value {
    json!({
        "version": 1,
        "meta": {
            "name": "InfraMap",
            "updatedAt": Utc::now().to_rfc3339(),
            "monitoring": {
                "enabled": false,
                "intervalSec": 30,
                "showStatus": false
            }
        },
        "viewport": {"x": 0, "y": 0, "zoom": 1},
        "nodes": [
            {
                "id": "net-1",
                "type": "network",
                "label": "LAN-1",
                "x": -260,
                "y": -180,
                "width": 520,
                "height": 320,
                "color": "#1d6fa3",
                "networkPublicIp": "203.0.113.0/24",
                "notes": "Primary LAN segment"
            },
            {
                "id": "node-1",
                "type": "server",
                "label": "Server A",
                "x": -140,
                "y": -60,
                "network": "",
                "ipPrivate": "10.0.0.10",
                "ipPublic": "203.0.113.10",
                "notes": "Primary app server"
            },
            {
                "id": "node-2",
                "type": "router",
                "label": "Edge Router",
                "x": 120,
                "y": 60,
                "network": "",
                "ipPrivate": "10.0.0.1",
                "ipPublic": "198.51.100.1",
                "notes": "Gateway to ISP"
            }
        ],
        "links": []
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BoardSnapshot;

    #[test]
    fn test_default_board_created() {
        let dir = tempfile::tempdir().unwrap();
        let store = BoardStore::new(dir.path().join("data"));

        let bytes = store.load().unwrap();
        assert!(store.path().exists());

        let snapshot = BoardSnapshot::parse(&bytes).unwrap();
        assert_eq!(snapshot.devices.len(), 3);
        assert_eq!(snapshot.policy.interval_sec, 30);
        assert!(!snapshot.devices.iter().any(|d| d.ping_enabled()));
    }

    #[test]
    fn test_save_rejects_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = BoardStore::new(dir.path());

        assert!(matches!(store.save(b"{nope"), Err(StorageError::Json(_))));
        assert!(!store.path().exists());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = BoardStore::new(dir.path());

        store.save(br#"{"nodes":[{"id":"a","type":"server"}]}"#).unwrap();
        let text = String::from_utf8(store.load().unwrap()).unwrap();
        assert!(text.contains("\n"));

        let snapshot = BoardSnapshot::parse(text.as_bytes()).unwrap();
        assert_eq!(snapshot.devices[0].id, "a");
    }
}
