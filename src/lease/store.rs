//! File-backed lease store: one JSON object keyed by client-key, upsert
//! semantics, written durably (temp file + fsync + rename) before `upsert`
//! returns, matching the `Config::save_to_file` pattern in `config/mod.rs`.
//!
//! Map and file are updated inside a single critical section: the two can
//! never diverge after a successful `upsert`. A write failure is logged by
//! the caller (the range/prefix handler) but does not roll back the
//! in-memory entry — availability wins over strict persistence here.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::PersistenceError;
use crate::lease::{ClientKey, LeaseRecord};

pub struct LeaseStore {
    path: PathBuf,
    records: Mutex<HashMap<ClientKey, LeaseRecord>>,
}

impl LeaseStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Read all records from disk into memory. Called once at handler
    /// setup. A missing file is treated as an empty store, not an error.
    pub fn load(&self) -> Result<HashMap<ClientKey, LeaseRecord>, PersistenceError> {
        let map = match fs::read_to_string(&self.path) {
            Ok(content) => {
                let on_disk: HashMap<String, LeaseRecord> =
                    serde_json::from_str(&content).map_err(PersistenceError::Serialize)?;
                on_disk
                    .into_iter()
                    .filter_map(|(k, v)| ClientKey::parse_hex_colon(&k).map(|k| (k, v)))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(PersistenceError::Read {
                    path: self.path.display().to_string(),
                    source: e,
                })
            }
        };
        *self.records.lock().unwrap() = map.clone();
        Ok(map)
    }

    /// Current in-memory value for `key`, if any.
    pub fn get(&self, key: &ClientKey) -> Option<LeaseRecord> {
        self.records.lock().unwrap().get(key).cloned()
    }

    /// Upsert `record` under `key`: updates the in-memory map and persists
    /// the whole store durably, inside one critical section.
    pub fn upsert(&self, key: ClientKey, record: LeaseRecord) -> Result<(), PersistenceError> {
        let mut guard = self.records.lock().unwrap();
        guard.insert(key, record);
        Self::flush(&self.path, &guard)
    }

    /// Snapshot of every record currently held, used for warm-recovery
    /// iteration at handler setup.
    pub fn snapshot(&self) -> HashMap<ClientKey, LeaseRecord> {
        self.records.lock().unwrap().clone()
    }

    fn flush(path: &Path, records: &HashMap<ClientKey, LeaseRecord>) -> Result<(), PersistenceError> {
        let on_disk: HashMap<String, &LeaseRecord> =
            records.iter().map(|(k, v)| (k.to_string(), v)).collect();
        let content =
            serde_json::to_string_pretty(&on_disk).map_err(PersistenceError::Serialize)?;

        let tmp_path = path.with_extension("tmp");
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| PersistenceError::Write {
                    path: path.display().to_string(),
                    source,
                })?;
            }
        }
        let mut file = fs::File::create(&tmp_path).map_err(|source| PersistenceError::Write {
            path: tmp_path.display().to_string(),
            source,
        })?;
        use std::io::Write;
        file.write_all(content.as_bytes())
            .map_err(|source| PersistenceError::Write {
                path: tmp_path.display().to_string(),
                source,
            })?;
        file.sync_all().map_err(|source| PersistenceError::Write {
            path: tmp_path.display().to_string(),
            source,
        })?;
        fs::rename(&tmp_path, path).map_err(|source| PersistenceError::Write {
            path: path.display().to_string(),
            source,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn tmp_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        p.push(format!("coredhcp-rs-test-{name}-{nanos}.json"));
        p
    }

    #[test]
    fn save_then_load_yields_equal_record() {
        let path = tmp_path("roundtrip");
        let store = LeaseStore::new(&path);
        let key = ClientKey::from_mac([0, 1, 2, 3, 4, 5]);
        let record = LeaseRecord::new("192.0.2.20".into(), 12345, Some("host".into()));
        store.upsert(key.clone(), record.clone()).unwrap();

        let reloaded = LeaseStore::new(&path);
        let map = reloaded.load().unwrap();
        assert_eq!(map.get(&key), Some(&record));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_file_loads_as_empty() {
        let path = tmp_path("missing");
        let store = LeaseStore::new(&path);
        let map = store.load().unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn upsert_overwrites_same_key() {
        let path = tmp_path("overwrite");
        let store = LeaseStore::new(&path);
        let key = ClientKey::from_mac([9, 9, 9, 9, 9, 9]);
        store
            .upsert(key.clone(), LeaseRecord::new("192.0.2.30".into(), 1, None))
            .unwrap();
        store
            .upsert(key.clone(), LeaseRecord::new("192.0.2.31".into(), 2, None))
            .unwrap();
        assert_eq!(store.snapshot().len(), 1);
        assert_eq!(store.get(&key).unwrap().address, "192.0.2.31");
        let _ = fs::remove_file(&path);
    }
}
