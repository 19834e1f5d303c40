//! Profile Override Store (§3, §6): keyed by profile name, `open` / iterate /
//! `put` / `del` / `close`. A `LEVEL_LOCKED`-like error is a soft failure
//! (§4.1, §6).
//!
//! The reference implementation persists overrides as an append-only
//! `.jsonl` event log, directly grounded on the donor's `ThoughtChain`
//! disk format (`thought_chain.rs`): one JSON line per write, replayed on
//! load to reconstruct the committed map. Unlike `ThoughtChain` there is no
//! hash chain here — overrides are small, mutable-by-key records, not an
//! append-only narrative, so the donor's *file layout* is reused without its
//! tamper-evidence machinery.

use crate::orchestrator::error::StoreError;
use crate::orchestrator::types::ProfileOverride;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Mutex;

#[async_trait]
pub trait ProfileOverrideStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<ProfileOverride>, StoreError>;
    async fn put(&self, name: &str, record: ProfileOverride) -> Result<(), StoreError>;
    async fn delete(&self, name: &str) -> Result<(), StoreError>;
}

/// In-memory reference implementation — no persistence, used in tests and
/// as the default when no durable store is configured.
pub struct InMemoryProfileOverrideStore {
    records: Mutex<HashMap<String, ProfileOverride>>,
    /// When set, every operation fails with [`StoreError::Locked`], modeling
    /// the §4.1 "store-locked at open" failure mode.
    locked: Mutex<bool>,
}

impl InMemoryProfileOverrideStore {
    pub fn new() -> Self {
        InMemoryProfileOverrideStore {
            records: Mutex::new(HashMap::new()),
            locked: Mutex::new(false),
        }
    }

    pub fn new_locked() -> Self {
        let s = Self::new();
        *s.locked.lock().unwrap() = true;
        s
    }
}

impl Default for InMemoryProfileOverrideStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProfileOverrideStore for InMemoryProfileOverrideStore {
    async fn load_all(&self) -> Result<Vec<ProfileOverride>, StoreError> {
        if *self.locked.lock().unwrap() {
            return Err(StoreError::Locked("in-memory store is locked".into()));
        }
        Ok(self.records.lock().unwrap().values().cloned().collect())
    }

    async fn put(&self, name: &str, record: ProfileOverride) -> Result<(), StoreError> {
        if *self.locked.lock().unwrap() {
            return Err(StoreError::Locked("in-memory store is locked".into()));
        }
        self.records.lock().unwrap().insert(name.to_string(), record);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        if *self.locked.lock().unwrap() {
            return Err(StoreError::Locked("in-memory store is locked".into()));
        }
        self.records.lock().unwrap().remove(name);
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum OverrideEvent {
    Put { name: String, record: ProfileOverride },
    Delete { name: String },
}

/// Durable `.jsonl`-backed store, grounded on `ThoughtChain`'s disk layout.
pub struct JsonlProfileOverrideStore {
    file_path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlProfileOverrideStore {
    pub fn open(dir: &PathBuf) -> std::io::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(JsonlProfileOverrideStore {
            file_path: dir.join("profile_overrides.jsonl"),
            write_lock: Mutex::new(()),
        })
    }

    fn append_event(&self, event: &OverrideEvent) -> std::io::Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let mut file = OpenOptions::new().create(true).append(true).open(&self.file_path)?;
        let line = serde_json::to_string(event)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writeln!(file, "{}", line)
    }

    fn replay(&self) -> std::io::Result<HashMap<String, ProfileOverride>> {
        let mut committed = HashMap::new();
        if !self.file_path.exists() {
            return Ok(committed);
        }
        let file = fs::File::open(&self.file_path)?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event: OverrideEvent = serde_json::from_str(&line)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            match event {
                OverrideEvent::Put { name, record } => {
                    committed.insert(name, record);
                }
                OverrideEvent::Delete { name } => {
                    committed.remove(&name);
                }
            }
        }
        Ok(committed)
    }
}

#[async_trait]
impl ProfileOverrideStore for JsonlProfileOverrideStore {
    async fn load_all(&self) -> Result<Vec<ProfileOverride>, StoreError> {
        self.replay()
            .map(|m| m.into_values().collect())
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    async fn put(&self, name: &str, record: ProfileOverride) -> Result<(), StoreError> {
        self.append_event(&OverrideEvent::Put {
            name: name.to_string(),
            record,
        })
        .map_err(|e| StoreError::Io(e.to_string()))
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.append_event(&OverrideEvent::Delete { name: name.to_string() })
            .map_err(|e| StoreError::Io(e.to_string()))
    }
}
