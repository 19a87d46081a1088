// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

use super::{Resource, ResourceLease, Store};
use crate::error::Result;
use crate::identity::{FileSource, IDENTITY_SEP, SourceIdentifier};

/// Registry operations the prospector performs on the sources it tracks.
pub trait StateMetadataUpdater: Send + Sync {
    fn find_cursor_meta(&self, src: &FileSource) -> Result<Value>;

    fn update_metadata(&self, src: &FileSource, meta: Value) -> Result<()>;

    fn remove(&self, src: &FileSource) -> Result<()>;

    fn reset_cursor(&self, src: &FileSource, cursor: Value) -> Result<()>;
}

/// View of the store restricted to the keys of one input.
#[derive(Clone)]
pub struct SourceStore {
    store: Store,
    identifier: Arc<SourceIdentifier>,
}

impl SourceStore {
    pub fn new(store: Store, identifier: SourceIdentifier) -> Self {
        Self {
            store,
            identifier: Arc::new(identifier),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn identifier(&self) -> &SourceIdentifier {
        &self.identifier
    }

    /// Store key of `src`
    pub fn id(&self, src: &FileSource) -> String {
        self.identifier.id(src)
    }

    pub fn find(&self, src: &FileSource, create: bool) -> Option<ResourceLease> {
        self.store.find(&self.id(src), create)
    }

    /// Mark every entry of this input for which `pred` returns true as
    /// removed. Entries held by a running harvester are skipped.
    pub fn clean_if(&self, mut pred: impl FnMut(&str, Option<&Value>) -> bool) -> usize {
        let identifier = self.identifier.clone();
        let mut removed = 0;
        for (key, resource) in self.candidates(|key| identifier.matches_input(key)) {
            let Some(_guard) = resource.try_lock() else {
                debug!(key, "Skipping cleanup of resource in use");
                continue;
            };
            let meta = resource.state().meta.clone();
            if pred(&key, meta.as_ref()) {
                self.store.update_ttl(&resource, Some(Duration::ZERO));
                removed += 1;
            }
        }
        removed
    }

    /// Move entries of this input to new keys. `new_key` receives the old key
    /// and metadata and returns the new key with the metadata to store.
    pub fn update_identifiers(
        &self,
        new_key: impl FnMut(&str, Option<&Value>) -> Option<(String, Value)>,
    ) -> usize {
        let identifier = self.identifier.clone();
        self.migrate(move |key| identifier.matches_input(key), new_key)
    }

    /// Adopt entries written by the inputs in `from_ids`. When `new_key`
    /// declines an entry, the identity part of its key is kept and only the
    /// input ID is replaced.
    pub fn take_over(
        &self,
        from_ids: &[String],
        mut new_key: impl FnMut(&str, Option<&Value>) -> Option<(String, Value)>,
    ) -> usize {
        let input_type = self.store.input_type().to_string();
        let prefixes: Vec<String> = from_ids
            .iter()
            .map(|id| SourceIdentifier::new(&input_type, Some(id)).prefix().to_string())
            .collect();
        let own_prefix = self.identifier.prefix().to_string();

        self.migrate(
            |key| prefixes.iter().any(|p| key.starts_with(p.as_str())),
            |key, meta| {
                if let Some(found) = new_key(key, meta) {
                    return Some(found);
                }
                let identity = split_key(key)?.2;
                Some((
                    format!("{}{}", own_prefix, identity),
                    meta.cloned().unwrap_or(Value::Null),
                ))
            },
        )
    }

    fn migrate(
        &self,
        matches: impl Fn(&str) -> bool,
        mut new_key: impl FnMut(&str, Option<&Value>) -> Option<(String, Value)>,
    ) -> usize {
        let mut migrated = 0;
        for (key, resource) in self.candidates(matches) {
            let Some(_guard) = resource.try_lock() else {
                debug!(key, "Skipping migration of resource in use");
                continue;
            };
            let meta = resource.state().meta.clone();
            let Some((target, meta)) = new_key(&key, meta.as_ref()) else {
                continue;
            };
            if target == key {
                continue;
            }

            let copy = Arc::new(resource.copy_with_new_key(target.clone()));
            {
                let mut state = copy.state();
                state.meta = Some(meta);
                state.stored = false;
            }
            {
                let mut table = self.store.lock_table();
                if table.contains_key(&target) {
                    continue;
                }
                table.insert(target.clone(), copy.clone());
            }
            self.store.write_state(&target, &mut copy.state());
            self.store.update_ttl(&resource, Some(Duration::ZERO));

            info!(from = key, to = target, "Migrated registry entry");
            migrated += 1;
        }
        migrated
    }

    /// Live resources whose key satisfies `matches`. The table is only
    /// locked while collecting them.
    fn candidates(&self, matches: impl Fn(&str) -> bool) -> Vec<(String, Arc<Resource>)> {
        let table = self.store.lock_table();
        table
            .iter()
            .filter(|(key, resource)| matches(key) && !resource.is_deleted())
            .map(|(key, resource)| (key.clone(), resource.clone()))
            .collect()
    }
}

impl StateMetadataUpdater for SourceStore {
    fn find_cursor_meta(&self, src: &FileSource) -> Result<Value> {
        self.store.find_cursor_meta(&self.id(src))
    }

    fn update_metadata(&self, src: &FileSource, meta: Value) -> Result<()> {
        self.store.update_metadata(&self.id(src), meta)
    }

    fn remove(&self, src: &FileSource) -> Result<()> {
        self.store.remove(&self.id(src))
    }

    fn reset_cursor(&self, src: &FileSource, cursor: Value) -> Result<()> {
        self.store.reset_cursor(&self.id(src), cursor)
    }
}

/// Split a store key into input type, input ID and identity.
pub(crate) fn split_key(key: &str) -> Option<(&str, &str, &str)> {
    let mut parts = key.splitn(3, IDENTITY_SEP);
    let input_type = parts.next()?;
    let input_id = parts.next()?;
    let identity = parts.next()?;
    if identity.is_empty() {
        return None;
    }
    Some((input_type, input_id, identity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MemoryBackend, load_state};
    use crate::store::testing::HookedBackend;
    use serde_json::json;

    fn store() -> (Arc<MemoryBackend>, Store) {
        let backend = Arc::new(MemoryBackend::new());
        let store = Store::open("filestream", backend.clone()).unwrap();
        (backend, store)
    }

    fn meta(source: &str) -> Value {
        json!({"source": source, "identifier_name": "native"})
    }

    #[test]
    fn test_split_key() {
        assert_eq!(
            Some(("filestream", "my-id", "path::/var/log/a::b.log")),
            split_key("filestream::my-id::path::/var/log/a::b.log")
        );
        assert_eq!(None, split_key("filestream::my-id"));
    }

    #[test]
    fn test_clean_if_skips_locked_and_foreign() {
        let (_, store) = store();
        let own = SourceStore::new(store.clone(), SourceIdentifier::new("filestream", Some("a")));

        store.update_metadata("filestream::a::native::1-1", meta("/x.log")).unwrap();
        store.update_metadata("filestream::a::native::2-1", meta("/y.log")).unwrap();
        store.update_metadata("filestream::b::native::3-1", meta("/z.log")).unwrap();

        let busy = store.find("filestream::a::native::2-1", false).unwrap();
        let _guard = busy.try_lock().unwrap();

        let removed = own.clean_if(|_, _| true);
        assert_eq!(1, removed);
        assert!(store.find("filestream::a::native::1-1", false).is_none());
        assert!(store.find("filestream::a::native::2-1", false).is_some());
        assert!(store.find("filestream::b::native::3-1", false).is_some());
    }

    #[test]
    fn test_update_identifiers_moves_state() {
        let (backend, store) = store();
        let own = SourceStore::new(store.clone(), SourceIdentifier::new("filestream", Some("a")));
        store.update_metadata("filestream::a::native::1-1", meta("/x.log")).unwrap();
        store
            .reset_cursor("filestream::a::native::1-1", json!({"offset": 99}))
            .unwrap();

        let migrated = own.update_identifiers(|key, meta| {
            assert_eq!("filestream::a::native::1-1", key);
            let mut meta = meta.cloned()?;
            meta["identifier_name"] = json!("fingerprint");
            Some(("filestream::a::fingerprint::abc".to_string(), meta))
        });
        assert_eq!(1, migrated);

        assert!(store.find("filestream::a::native::1-1", false).is_none());
        let moved = load_state(backend.as_ref(), "filestream::a::fingerprint::abc")
            .unwrap()
            .unwrap();
        assert_eq!(Some(json!({"offset": 99})), moved.cursor);
        assert_eq!(json!("fingerprint"), moved.meta.unwrap()["identifier_name"]);
    }

    #[test]
    fn test_take_over_keeps_identity() {
        let (_, store) = store();
        let own = SourceStore::new(store.clone(), SourceIdentifier::new("filestream", Some("new")));
        store.update_metadata("filestream::old::native::1-1", meta("/x.log")).unwrap();
        store.update_metadata("filestream::other::native::2-1", meta("/y.log")).unwrap();

        let migrated = own.take_over(&["old".to_string()], |_, _| None);
        assert_eq!(1, migrated);
        assert!(store.find("filestream::new::native::1-1", false).is_some());
        assert!(store.find("filestream::old::native::1-1", false).is_none());
        assert!(store.find("filestream::other::native::2-1", false).is_some());
    }

    #[test]
    fn test_backend_is_written_without_table_lock() {
        let locked_writes = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = locked_writes.clone();
        let (backend, store) = HookedBackend::open(move |store, _, _| {
            if !store.table_is_free() {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        });
        let own = SourceStore::new(store.clone(), SourceIdentifier::new("filestream", Some("a")));
        store.update_metadata("filestream::a::native::1-1", meta("/x.log")).unwrap();
        store.update_metadata("filestream::a::native::2-1", meta("/y.log")).unwrap();

        let migrated = own.update_identifiers(|key, meta| {
            (key == "filestream::a::native::1-1")
                .then(|| ("filestream::a::path::/x.log".to_string(), meta.cloned().unwrap_or_default()))
        });
        assert_eq!(1, migrated);
        assert_eq!(1, own.clean_if(|key, _| key == "filestream::a::native::2-1"));

        assert_eq!(0, locked_writes.load(std::sync::atomic::Ordering::SeqCst));
        assert!(load_state(backend.as_ref(), "filestream::a::path::/x.log").unwrap().is_some());
        assert!(store.find("filestream::a::native::2-1", false).is_none());
    }

    #[test]
    fn test_migration_never_overwrites() {
        let (_, store) = store();
        let own = SourceStore::new(store.clone(), SourceIdentifier::new("filestream", Some("a")));
        store.update_metadata("filestream::a::path::/x.log", meta("/x.log")).unwrap();
        store.update_metadata("filestream::a::native::1-1", meta("/x.log")).unwrap();

        let migrated = own.update_identifiers(|key, meta| {
            (key == "filestream::a::path::/x.log")
                .then(|| ("filestream::a::native::1-1".to_string(), meta.cloned().unwrap_or_default()))
        });
        assert_eq!(0, migrated);
        assert!(store.find("filestream::a::path::/x.log", false).is_some());
    }
}
