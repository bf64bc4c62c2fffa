//! Durable peer → backend-conversation mapping.
//!
//! Backed by one JSON file keyed `backend id -> peer -> conversation id`,
//! reread in full on startup and rewritten in full on every effective write.
//! Writes are rare next to reads, so one coarse lock covers all peers.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone)]
struct ConversationRecord {
    conversation_id: String,
    last_used: DateTime<Utc>,
}

pub struct SessionStore {
    path: PathBuf,
    inner: Mutex<HashMap<String, HashMap<String, ConversationRecord>>>,
}

impl SessionStore {
    /// Loads the store from `path`; a missing or unreadable file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let inner = match fs::read_to_string(&path) {
            Ok(text) => parse_store(&text).unwrap_or_else(|err| {
                warn!("session store unreadable, starting empty: {}: {err}", path.display());
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            inner: Mutex::new(inner),
        }
    }

    pub fn get(&self, backend_id: &str, peer: &str) -> Option<String> {
        self.inner
            .lock()
            .get(backend_id)
            .and_then(|peers| peers.get(peer))
            .map(|record| record.conversation_id.clone())
    }

    /// Persists a conversation id. Writing the value already stored is a
    /// no-op so redundant backend echoes do not touch the file.
    pub fn set(&self, backend_id: &str, peer: &str, conversation_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let peers = inner.entry(backend_id.to_string()).or_default();
        if let Some(existing) = peers.get_mut(peer) {
            if existing.conversation_id == conversation_id {
                existing.last_used = Utc::now();
                return Ok(());
            }
        }
        peers.insert(
            peer.to_string(),
            ConversationRecord {
                conversation_id: conversation_id.to_string(),
                last_used: Utc::now(),
            },
        );
        self.persist(&inner)
    }

    /// Drops the stored conversation id for one peer, forcing the next turn
    /// to start a fresh backend conversation.
    pub fn forget(&self, backend_id: &str, peer: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let removed = inner
            .get_mut(backend_id)
            .and_then(|peers| peers.remove(peer))
            .is_some();
        if !removed {
            return Ok(());
        }
        self.persist(&inner)
    }

    pub fn clear_all(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.clear();
        self.persist(&inner)
    }

    fn persist(&self, inner: &HashMap<String, HashMap<String, ConversationRecord>>) -> Result<()> {
        let mut root = serde_json::Map::new();
        for (backend, peers) in inner {
            let mut flat = serde_json::Map::new();
            for (peer, record) in peers {
                flat.insert(peer.clone(), Value::String(record.conversation_id.clone()));
            }
            root.insert(backend.clone(), Value::Object(flat));
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create session store dir: {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(&Value::Object(root))?;
        fs::write(&self.path, text)
            .with_context(|| format!("write session store: {}", self.path.display()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn parse_store(text: &str) -> Result<HashMap<String, HashMap<String, ConversationRecord>>> {
    let raw: HashMap<String, HashMap<String, String>> = serde_json::from_str(text)?;
    let now = Utc::now();
    Ok(raw
        .into_iter()
        .map(|(backend, peers)| {
            let peers = peers
                .into_iter()
                .map(|(peer, conversation_id)| {
                    (
                        peer,
                        ConversationRecord {
                            conversation_id,
                            last_used: now,
                        },
                    )
                })
                .collect();
            (backend, peers)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::open(dir.path().join("sessions.json"));
        store.set("dify", "wxid_u1", "conv-1").expect("set");
        assert_eq!(store.get("dify", "wxid_u1").as_deref(), Some("conv-1"));
        assert_eq!(store.get("coze", "wxid_u1"), None);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sessions.json");
        {
            let store = SessionStore::open(&path);
            store.set("dify", "wxid_u1", "conv-1").expect("set");
            store.set("coze", "wxid_u1", "conv-9").expect("set");
        }
        let reopened = SessionStore::open(&path);
        assert_eq!(reopened.get("dify", "wxid_u1").as_deref(), Some("conv-1"));
        assert_eq!(reopened.get("coze", "wxid_u1").as_deref(), Some("conv-9"));
    }

    #[test]
    fn identical_set_skips_rewrite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sessions.json");
        let store = SessionStore::open(&path);
        store.set("dify", "wxid_u1", "conv-1").expect("set");
        // Remove the file behind the store's back; an identical set must not
        // recreate it, a changed one must.
        fs::remove_file(&path).expect("remove");
        store.set("dify", "wxid_u1", "conv-1").expect("set same");
        assert!(!path.exists());
        store.set("dify", "wxid_u1", "conv-2").expect("set new");
        assert!(path.exists());
    }

    #[test]
    fn clear_all_empties_store_and_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sessions.json");
        let store = SessionStore::open(&path);
        store.set("dify", "wxid_u1", "conv-1").expect("set");
        store.clear_all().expect("clear");
        assert_eq!(store.get("dify", "wxid_u1"), None);
        let reopened = SessionStore::open(&path);
        assert_eq!(reopened.get("dify", "wxid_u1"), None);
    }

    #[test]
    fn forget_drops_single_peer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::open(dir.path().join("sessions.json"));
        store.set("dify", "wxid_u1", "conv-1").expect("set");
        store.set("dify", "wxid_u2", "conv-2").expect("set");
        store.forget("dify", "wxid_u1").expect("forget");
        assert_eq!(store.get("dify", "wxid_u1"), None);
        assert_eq!(store.get("dify", "wxid_u2").as_deref(), Some("conv-2"));
    }
}
