//! Card deny-lists.
//!
//! Two independent sets, the global list and the secondary list, each
//! mapping a normalised hexadecimal UID to a human-readable denial
//! message. The global list is consulted strictly before the secondary
//! list and before every MEMREG decision.
//!
//! UIDs are canonicalised to upper-case 8-20 hex characters before both
//! insert and lookup; non-conforming UIDs are silently dropped on insert
//! and always miss on lookup. Persistence is a single atomic file write
//! (temp file + rename), so a concurrent reload never observes a torn
//! list.

use passgate_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{info, warn};

fn canonical(uid: &str) -> Option<String> {
    let uid = uid.trim().to_uppercase();
    let ok = (8..=20).contains(&uid.len()) && uid.bytes().all(|b| b.is_ascii_hexdigit());
    ok.then_some(uid)
}

/// One deny-list entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardEntry {
    pub uid: String,
    pub message: String,
}

/// Result of a [`CardList::sync_global`] call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Lists {
    global: HashMap<String, String>,
    secondary: HashMap<String, String>,
}

/// Concurrent-safe deny-list store with O(1) lookup.
#[derive(Debug, Default)]
pub struct CardList {
    lists: RwLock<Lists>,
    file: Option<PathBuf>,
}

impl CardList {
    #[must_use]
    pub fn new() -> Self {
        CardList::default()
    }

    /// Attach a persistence file. Mutations are written through; `load`
    /// reads it back.
    #[must_use]
    pub fn with_persist_file(path: impl Into<PathBuf>) -> Self {
        CardList {
            lists: RwLock::new(Lists::default()),
            file: Some(path.into()),
        }
    }

    /// Look up a UID in the global list. Returns the denial message.
    #[must_use]
    pub fn check_global(&self, uid: &str) -> Option<String> {
        let uid = canonical(uid)?;
        self.lists.read().unwrap().global.get(&uid).cloned()
    }

    /// Look up a UID in the secondary list. Returns the denial message.
    #[must_use]
    pub fn check_secondary(&self, uid: &str) -> Option<String> {
        let uid = canonical(uid)?;
        self.lists.read().unwrap().secondary.get(&uid).cloned()
    }

    /// Add entries to the global list. Returns the UIDs actually added.
    pub fn add_global(&self, entries: &[CardEntry]) -> Vec<String> {
        self.add(entries, true)
    }

    /// Add entries to the secondary list. Returns the UIDs actually added.
    pub fn add_secondary(&self, entries: &[CardEntry]) -> Vec<String> {
        self.add(entries, false)
    }

    fn add(&self, entries: &[CardEntry], global: bool) -> Vec<String> {
        let mut added = Vec::new();
        {
            let mut lists = self.lists.write().unwrap();
            let map = if global {
                &mut lists.global
            } else {
                &mut lists.secondary
            };
            for entry in entries {
                if let Some(uid) = canonical(&entry.uid) {
                    map.insert(uid.clone(), entry.message.clone());
                    added.push(uid);
                }
            }
        }
        if !added.is_empty() {
            self.persist();
        }
        added
    }

    /// Remove UIDs from the global list. Returns the UIDs actually removed.
    pub fn del_global(&self, uids: &[String]) -> Vec<String> {
        self.del(uids, true)
    }

    /// Remove UIDs from the secondary list. Returns the UIDs actually removed.
    pub fn del_secondary(&self, uids: &[String]) -> Vec<String> {
        self.del(uids, false)
    }

    fn del(&self, uids: &[String], global: bool) -> Vec<String> {
        let mut removed = Vec::new();
        {
            let mut lists = self.lists.write().unwrap();
            let map = if global {
                &mut lists.global
            } else {
                &mut lists.secondary
            };
            for uid in uids {
                if let Some(uid) = canonical(uid) {
                    if map.remove(&uid).is_some() {
                        removed.push(uid);
                    }
                }
            }
        }
        if !removed.is_empty() {
            self.persist();
        }
        removed
    }

    /// Replace the global list with `entries` in one atomic step, adding
    /// missing UIDs and removing UIDs no longer present.
    pub fn sync_global(&self, entries: &[CardEntry]) -> SyncDiff {
        let incoming: HashMap<String, String> = entries
            .iter()
            .filter_map(|e| canonical(&e.uid).map(|uid| (uid, e.message.clone())))
            .collect();

        let mut diff = SyncDiff::default();
        {
            let mut lists = self.lists.write().unwrap();
            for (uid, message) in &incoming {
                if !lists.global.contains_key(uid) {
                    lists.global.insert(uid.clone(), message.clone());
                    diff.added.push(uid.clone());
                }
            }
            let stale: Vec<String> = lists
                .global
                .keys()
                .filter(|uid| !incoming.contains_key(*uid))
                .cloned()
                .collect();
            for uid in stale {
                lists.global.remove(&uid);
                diff.removed.push(uid);
            }
        }

        if !diff.added.is_empty() || !diff.removed.is_empty() {
            self.persist();
        }
        diff
    }

    /// Snapshot of the global list.
    #[must_use]
    pub fn global_entries(&self) -> HashMap<String, String> {
        self.lists.read().unwrap().global.clone()
    }

    /// Snapshot of the secondary list.
    #[must_use]
    pub fn secondary_entries(&self) -> HashMap<String, String> {
        self.lists.read().unwrap().secondary.clone()
    }

    /// Load both lists from the persistence file. A missing file leaves
    /// the lists empty.
    ///
    /// # Errors
    /// Returns `Error::Config` when the file exists but cannot be parsed.
    pub fn load(&self) -> Result<()> {
        let Some(path) = &self.file else {
            return Ok(());
        };
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let loaded: Lists = serde_json::from_slice(&data)
            .map_err(|e| Error::Config(format!("card list file {}: {e}", path.display())))?;

        let mut lists = self.lists.write().unwrap();
        info!(
            global = loaded.global.len(),
            secondary = loaded.secondary.len(),
            "card lists loaded"
        );
        *lists = loaded;
        Ok(())
    }

    fn persist(&self) {
        let Some(path) = &self.file else {
            return;
        };
        let snapshot = {
            let lists = self.lists.read().unwrap();
            serde_json::to_vec_pretty(&*lists)
        };
        match snapshot {
            Ok(bytes) => {
                if let Err(e) = atomic_write(path, &bytes) {
                    warn!(path = %path.display(), error = %e, "card list persist failed");
                }
            }
            Err(e) => warn!(error = %e, "card list serialize failed"),
        }
    }
}

/// Write via a sibling temp file and rename, so readers never observe a
/// partial file.
fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}
