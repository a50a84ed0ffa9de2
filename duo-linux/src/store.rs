//! Persisted session state: manual-disconnect flag and the last peer we reached.

use std::path::{Path, PathBuf};

use duo_core::{DeviceKind, SessionKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Identity and reachability of the last peer a session reached `Ready` with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastPeer {
    pub id: String,
    pub name: String,
    pub kind: DeviceKind,
    pub addresses: Vec<String>,
    pub port: u16,
    #[serde(default)]
    pub key: Option<SessionKey>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// Stable id this device announces; generated on first run.
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub manually_disconnected: bool,
    #[serde(default)]
    pub last_peer: Option<LastPeer>,
}

/// Settings persistence seam. Writes are best effort; failures are logged by implementors.
pub trait SessionStore: Send + Sync {
    fn load(&self) -> SessionState;
    fn save(&self, state: &SessionState);

    fn manually_disconnected(&self) -> bool {
        self.load().manually_disconnected
    }

    fn set_manually_disconnected(&self, value: bool) {
        let mut s = self.load();
        if s.manually_disconnected != value {
            s.manually_disconnected = value;
            self.save(&s);
        }
    }

    fn last_peer(&self) -> Option<LastPeer> {
        self.load().last_peer
    }

    fn set_last_peer(&self, peer: LastPeer) {
        let mut s = self.load();
        s.last_peer = Some(peer);
        self.save(&s);
    }

    fn device_id(&self) -> String {
        let mut s = self.load();
        if let Some(id) = &s.device_id {
            return id.clone();
        }
        let id = uuid::Uuid::new_v4().to_string();
        s.device_id = Some(id.clone());
        self.save(&s);
        id
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<SessionState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn load(&self) -> SessionState {
        self.state.lock().clone()
    }

    fn save(&self, state: &SessionState) {
        *self.state.lock() = state.clone();
    }
}

/// JSON file store. Reads are cached; writes go through a temp file and rename.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    cache: Mutex<SessionState>,
}

impl JsonFileStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cache = read_state(&path).unwrap_or_default();
        Self {
            path,
            cache: Mutex::new(cache),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_state(path: &Path) -> Option<SessionState> {
    let text = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&text) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Discarding unreadable session state");
            None
        }
    }
}

fn write_state(path: &Path, state: &SessionState) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let body = serde_json::to_vec_pretty(state)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)
}

impl SessionStore for JsonFileStore {
    fn load(&self) -> SessionState {
        self.cache.lock().clone()
    }

    fn save(&self, state: &SessionState) {
        let mut cache = self.cache.lock();
        *cache = state.clone();
        if let Err(e) = write_state(&self.path, state) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to persist session state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> LastPeer {
        LastPeer {
            id: "desk-1".into(),
            name: "Studio".into(),
            kind: DeviceKind::Desktop,
            addresses: vec!["192.168.1.20".into()],
            port: 6996,
            key: Some(SessionKey::generate()),
        }
    }

    #[test]
    fn memory_store_flags() {
        let s = MemoryStore::new();
        assert!(!s.manually_disconnected());
        s.set_manually_disconnected(true);
        assert!(s.manually_disconnected());
        assert!(s.last_peer().is_none());
        s.set_last_peer(peer());
        assert_eq!(s.last_peer().unwrap().id, "desk-1");
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/session.json");
        let p = peer();
        {
            let s = JsonFileStore::open(&path);
            s.set_last_peer(p.clone());
            s.set_manually_disconnected(true);
        }
        let id = JsonFileStore::open(&path).device_id();
        let reopened = JsonFileStore::open(&path);
        assert!(reopened.manually_disconnected());
        assert_eq!(reopened.last_peer(), Some(p));
        assert_eq!(reopened.device_id(), id);
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "{not json").unwrap();
        let s = JsonFileStore::open(&path);
        assert_eq!(s.load(), SessionState::default());
    }
}
