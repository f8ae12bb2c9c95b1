//! MEMREG: the in-memory usage ledger.
//!
//! A two-level mapping `storage_key -> uid_key -> ()` records transient
//! possession (a towel issued, a tester kit taken out). Terminals carry
//! two independent MEMREG roles:
//!
//! - `memreg_dev = "towel/add"`: the terminal *registers* usage: a tag
//!   read flips or sets the mark per the mode table below.
//! - `memreg_deny = "towel"`: the terminal *gates* on usage: a set mark
//!   denies the pass.
//!
//! Keys match `[A-Za-z0-9_\-+]{1,64}`, with an optional `/mode` suffix on
//! device keys. The store is purely in memory and all operations are
//! atomic.

use passgate_core::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Registration mode carried by a device key suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemRegMode {
    /// Toggle: set when clear, clear when set
    #[default]
    Auto,
    /// Set only (aliases: `set`, `add`)
    Set,
    /// Clear only (aliases: `clr`, `clear`, `del`)
    Clr,
    /// Same as Set, display-oriented
    Disp,
    /// Same as Clr, checkout-oriented
    Take,
}

/// Parsed `storage[/mode]` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemRegKey {
    pub storage: String,
    pub mode: MemRegMode,
}

impl MemRegKey {
    /// Parse a MEMREG key.
    ///
    /// # Errors
    /// Returns `Error::InvalidStorageKey` when the key does not match
    /// `[A-Za-z0-9_\-+]{1,64}(/[A-Za-z0-9_\-+]+)?`.
    pub fn parse(key: &str) -> Result<Self> {
        let key = key.trim();
        if key.is_empty() || key.len() > 64 {
            return Err(Error::InvalidStorageKey(key.to_string()));
        }

        let (storage, mode_token) = match key.split_once('/') {
            Some((s, m)) => (s, Some(m)),
            None => (key, None),
        };

        if storage.is_empty() || !storage.bytes().all(valid_key_byte) {
            return Err(Error::InvalidStorageKey(key.to_string()));
        }

        let mode = match mode_token {
            None => MemRegMode::Auto,
            Some(token) => {
                if token.is_empty() || !token.bytes().all(valid_key_byte) {
                    return Err(Error::InvalidStorageKey(key.to_string()));
                }
                match token.to_lowercase().as_str() {
                    "set" | "add" => MemRegMode::Set,
                    "clr" | "clear" | "del" => MemRegMode::Clr,
                    "disp" => MemRegMode::Disp,
                    "take" => MemRegMode::Take,
                    _ => MemRegMode::Auto,
                }
            }
        };

        Ok(MemRegKey {
            storage: storage.to_string(),
            mode,
        })
    }
}

fn valid_key_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'+')
}

/// The ledger. `has`, `set` and `del` are individually atomic;
/// [`apply_device_mode`](MemRegStore::apply_device_mode) performs its
/// read-modify-write under one lock acquisition.
#[derive(Debug, Default)]
pub struct MemRegStore {
    storage: Mutex<HashMap<String, HashSet<String>>>,
}

/// What a device-mode application did, and which message to show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemRegAction {
    /// `true` when the ledger changed
    pub changed: bool,
    /// Message selector: `set`, `clr`, `info_set` or `info_clr`
    pub selector: &'static str,
}

impl MemRegStore {
    #[must_use]
    pub fn new() -> Self {
        MemRegStore::default()
    }

    /// Is a mark set for (storage, uid)?
    ///
    /// # Errors
    /// Returns `Error::InvalidStorageKey` for malformed keys.
    pub fn has(&self, storage: &str, uid: &str) -> Result<bool> {
        let sk = MemRegKey::parse(storage)?;
        let uk = MemRegKey::parse(uid)?;
        let map = self.storage.lock().unwrap();
        Ok(map
            .get(&sk.storage)
            .is_some_and(|uids| uids.contains(&uk.storage)))
    }

    /// Set the mark for (storage, uid).
    pub fn set(&self, storage: &str, uid: &str) -> Result<()> {
        let sk = MemRegKey::parse(storage)?;
        let uk = MemRegKey::parse(uid)?;
        let mut map = self.storage.lock().unwrap();
        map.entry(sk.storage).or_default().insert(uk.storage);
        Ok(())
    }

    /// Clear the mark for (storage, uid).
    pub fn del(&self, storage: &str, uid: &str) -> Result<()> {
        let sk = MemRegKey::parse(storage)?;
        let uk = MemRegKey::parse(uid)?;
        let mut map = self.storage.lock().unwrap();
        if let Some(uids) = map.get_mut(&sk.storage) {
            uids.remove(&uk.storage);
            if uids.is_empty() {
                map.remove(&sk.storage);
            }
        }
        Ok(())
    }

    /// Apply a device-mode read atomically:
    ///
    /// | mode       | mark clear          | mark set            |
    /// |------------|---------------------|---------------------|
    /// | auto       | set, `set`          | clear, `clr`        |
    /// | set / disp | set, `set`          | no-op, `info_set`   |
    /// | clr / take | no-op, `info_clr`   | clear, `clr`        |
    pub fn apply_device_mode(&self, key: &MemRegKey, uid: &str) -> Result<MemRegAction> {
        let uk = MemRegKey::parse(uid)?;
        let mut map = self.storage.lock().unwrap();
        let uids = map.entry(key.storage.clone()).or_default();
        let has = uids.contains(&uk.storage);

        let action = match (key.mode, has) {
            (MemRegMode::Auto, false) | (MemRegMode::Set | MemRegMode::Disp, false) => {
                uids.insert(uk.storage);
                MemRegAction {
                    changed: true,
                    selector: "set",
                }
            }
            (MemRegMode::Auto, true) | (MemRegMode::Clr | MemRegMode::Take, true) => {
                uids.remove(&uk.storage);
                MemRegAction {
                    changed: true,
                    selector: "clr",
                }
            }
            (MemRegMode::Set | MemRegMode::Disp, true) => MemRegAction {
                changed: false,
                selector: "info_set",
            },
            (MemRegMode::Clr | MemRegMode::Take, false) => MemRegAction {
                changed: false,
                selector: "info_clr",
            },
        };

        if map.get(&key.storage).is_some_and(HashSet::is_empty) {
            map.remove(&key.storage);
        }
        Ok(action)
    }

    /// Snapshot for the status listing.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, Vec<String>> {
        self.storage
            .lock()
            .unwrap()
            .iter()
            .map(|(k, uids)| (k.clone(), uids.iter().cloned().collect()))
            .collect()
    }
}

/// Device-side message for a storage and selector.
#[must_use]
pub fn device_message(storage: &str, selector: &str) -> &'static str {
    match (storage, selector) {
        ("towel", "set") => "Полотенце\n[ВЫДАНО]\nУСПЕШНО",
        ("towel", "clr") => "Полотенце\n[СДАНО]\nУСПЕШНО",
        ("towel", "info_set") => "Ошибка\nПолотенце:\nуже было ВЫДАНО",
        ("towel", "info_clr") => "Полотенце:\n[НЕ ВЫДАНО]",
        (_, "set") => "Отметка\n[УСТАНОВЛЕНА]\nУСПЕШНО",
        (_, "clr") => "Отметка\n[СНЯТА]\nУСПЕШНО",
        (_, "info_set") => "Статус отметки:\n[УСТАНОВЛЕНА]",
        (_, "info_clr") => "Статус отметки:\n[СНЯТА]",
        _ => "Ошибка",
    }
}

/// Denial message shown when `memreg_deny` blocks a pass.
#[must_use]
pub fn deny_message(storage: &str) -> &'static str {
    match storage {
        "towel" => "СДАЙТЕ\nПОЛОТЕНЦЕ",
        _ => "СНИМИТЕ\nОТМЕТКУ",
    }
}
