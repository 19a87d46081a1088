// SPDX-License-Identifier: Apache-2.0

//! JSON file-based persistence with atomic writes.
//!
//! The database keeps all scopes in memory and rewrites the whole file on
//! every change using a write-to-temp-then-rename strategy, so the file on
//! disk is always a complete snapshot.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use super::StateBackend;
use crate::error::{Error, Result};

/// State stored in the JSON file
#[derive(Debug, Default, Serialize, Deserialize)]
struct DatabaseState {
    scopes: HashMap<String, HashMap<String, serde_json::Value>>,
}

/// A shared JSON file database handle
#[derive(Clone)]
pub struct JsonFileDatabase {
    path: PathBuf,
    state: Arc<RwLock<DatabaseState>>,
}

impl JsonFileDatabase {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let state = if path.exists() {
            let file = File::open(&path)
                .map_err(|e| Error::Persistence(format!("failed to open registry: {}", e)))?;
            let reader = BufReader::new(file);
            serde_json::from_reader(reader)
                .map_err(|e| Error::Persistence(format!("failed to parse registry: {}", e)))?
        } else {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    fs::create_dir_all(parent).map_err(|e| {
                        Error::Persistence(format!("failed to create registry directory: {}", e))
                    })?;
                }
            }
            DatabaseState::default()
        };

        Ok(Self {
            path,
            state: Arc::new(RwLock::new(state)),
        })
    }

    /// Create an in-memory database (useful for testing)
    pub fn open_memory() -> Self {
        Self {
            path: PathBuf::new(),
            state: Arc::new(RwLock::new(DatabaseState::default())),
        }
    }

    /// Access the entries of one scope
    pub fn store(&self, scope: impl Into<String>) -> JsonFileStore {
        JsonFileStore {
            path: self.path.clone(),
            state: self.state.clone(),
            scope: scope.into(),
        }
    }

    /// Write the current state to disk
    pub fn flush(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }

        let state = self
            .state
            .read()
            .map_err(|e| Error::Persistence(e.to_string()))?;

        atomic_write(&self.path, &state)
    }
}

/// The entries of one scope of a [`JsonFileDatabase`].
#[derive(Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    state: Arc<RwLock<DatabaseState>>,
    scope: String,
}

impl JsonFileStore {
    fn modify(&self, f: impl FnOnce(&mut HashMap<String, serde_json::Value>)) -> Result<()> {
        // Writing under the lock keeps snapshots from being renamed out of order
        let mut state = self
            .state
            .write()
            .map_err(|e| Error::Persistence(e.to_string()))?;

        f(state.scopes.entry(self.scope.clone()).or_default());

        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        atomic_write(&self.path, &state)
    }
}

impl StateBackend for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let state = self
            .state
            .read()
            .map_err(|e| Error::Persistence(e.to_string()))?;
        Ok(state
            .scopes
            .get(&self.scope)
            .and_then(|scope| scope.get(key))
            .cloned())
    }

    fn set(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.modify(|scope| {
            scope.insert(key.to_string(), value);
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.modify(|scope| {
            scope.remove(key);
        })
    }

    fn each(&self, f: &mut dyn FnMut(&str, &serde_json::Value)) -> Result<()> {
        let state = self
            .state
            .read()
            .map_err(|e| Error::Persistence(e.to_string()))?;
        if let Some(scope) = state.scopes.get(&self.scope) {
            for (key, value) in scope {
                f(key, value);
            }
        }
        Ok(())
    }
}

/// Write state to file atomically (write to temp, then rename)
fn atomic_write(path: &Path, state: &DatabaseState) -> Result<()> {
    use portable_atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Persistence(format!("failed to create parent directory: {}", e))
            })?;
        }
    }

    // Process ID plus a counter keeps temp files of concurrent writers apart
    let unique_id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let temp_path = path.with_extension(format!("tmp.{}.{}", std::process::id(), unique_id));

    let file = File::create(&temp_path)
        .map_err(|e| Error::Persistence(format!("failed to create temp file: {}", e)))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, state)
        .map_err(|e| Error::Persistence(format!("failed to write registry: {}", e)))?;

    use std::io::Write;
    writer
        .flush()
        .map_err(|e| Error::Persistence(format!("failed to flush registry: {}", e)))?;
    drop(writer);

    fs::rename(&temp_path, path)
        .map_err(|e| Error::Persistence(format!("failed to rename registry file: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_get_remove() {
        let db = JsonFileDatabase::open_memory();
        let store = db.store("filestream");

        assert!(store.get("key1").unwrap().is_none());

        store.set("key1", json!({"offset": 100})).unwrap();
        assert_eq!(Some(json!({"offset": 100})), store.get("key1").unwrap());

        store.remove("key1").unwrap();
        assert!(store.get("key1").unwrap().is_none());
    }

    #[test]
    fn test_scopes_are_isolated() {
        let db = JsonFileDatabase::open_memory();
        let a = db.store("scope1");
        let b = db.store("scope2");

        a.set("key", json!("value1")).unwrap();
        b.set("key", json!("value2")).unwrap();

        assert_eq!(Some(json!("value1")), a.get("key").unwrap());
        assert_eq!(Some(json!("value2")), b.get("key").unwrap());

        let mut keys = Vec::new();
        a.each(&mut |k, _| keys.push(k.to_string())).unwrap();
        assert_eq!(vec!["key"], keys);
    }

    #[test]
    fn test_reopen_from_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("data").join("registry.json");

        {
            let db = JsonFileDatabase::open(&db_path).unwrap();
            let store = db.store("filestream");
            store.set("a", json!({"offset": 1})).unwrap();
            store.set("b", json!({"offset": 2})).unwrap();
            store.remove("a").unwrap();
        }

        let db = JsonFileDatabase::open(&db_path).unwrap();
        let store = db.store("filestream");
        assert!(store.get("a").unwrap().is_none());
        assert_eq!(Some(json!({"offset": 2})), store.get("b").unwrap());

        // No temp files are left behind
        let leftovers = fs::read_dir(db_path.parent().unwrap())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .contains("tmp")
            })
            .count();
        assert_eq!(0, leftovers);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("registry.json");
        fs::write(&db_path, b"{not json").unwrap();

        assert!(matches!(
            JsonFileDatabase::open(&db_path),
            Err(Error::Persistence(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_write_failure_is_reported() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = tempfile::tempdir().unwrap();
        let readonly = temp_dir.path().join("readonly");
        fs::create_dir_all(&readonly).unwrap();
        let db = JsonFileDatabase::open(readonly.join("registry.json")).unwrap();
        let store = db.store("filestream");

        fs::set_permissions(&readonly, fs::Permissions::from_mode(0o555)).unwrap();
        // Privileged users can write regardless of permissions
        let privileged = File::create(readonly.join("probe")).is_ok();
        let result = store.set("key", json!(1));
        fs::set_permissions(&readonly, fs::Permissions::from_mode(0o755)).unwrap();

        if !privileged {
            assert!(matches!(result, Err(Error::Persistence(_))));
        }
    }
}
