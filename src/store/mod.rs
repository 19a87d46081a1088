// SPDX-License-Identifier: Apache-2.0

//! Resource store: the in-memory table of per-source states backed by a
//! persistent [`StateBackend`].
//!
//! Keys have the form `<input-type>::<input-id or .global>::<identity>`.
//! Every resource carries an owner count, a harvester lock and a cursor.
//! Cursor updates are applied only after the events carrying them are
//! acknowledged, see [`UpdateOp`].

mod cursor;
mod resource;
mod source_store;

pub use cursor::{Cursor, UpdateOp, merge_cursor};
pub use resource::{Resource, ResourceLease};
pub use source_store::{SourceStore, StateMetadataUpdater};

pub(crate) use resource::ResourceState;
pub(crate) use source_store::split_key;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::identity::IDENTITY_SEP;
use crate::persistence::{FIRST_START_KEY, PersistedState, StateBackend};

pub(crate) type ResourceTable = HashMap<String, Arc<Resource>>;

/// Shared handle on the resource table of one input type.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    input_type: String,
    backend: Arc<dyn StateBackend>,
    table: Mutex<ResourceTable>,
    first_start: DateTime<Utc>,
    started: DateTime<Utc>,
}

impl Store {
    /// Open the store, loading every persisted state of `input_type`.
    pub fn open(input_type: &str, backend: Arc<dyn StateBackend>) -> Result<Self> {
        let started = Utc::now();
        let first_start = load_first_start(backend.as_ref(), started)?;

        let prefix = format!("{}{}", input_type, IDENTITY_SEP);
        let mut table = ResourceTable::new();
        backend.each(&mut |key, value| {
            if !key.starts_with(&prefix) {
                return;
            }
            match serde_json::from_value::<PersistedState>(value.clone()) {
                Ok(state) => {
                    let resource = Resource::new(key.to_string(), ResourceState::from_persisted(state));
                    table.insert(key.to_string(), Arc::new(resource));
                }
                Err(e) => warn!(key, error = %e, "Skipping unreadable registry entry"),
            }
        })?;
        debug!(input_type, entries = table.len(), "Loaded registry states");

        Ok(Self {
            inner: Arc::new(StoreInner {
                input_type: input_type.to_string(),
                backend,
                table: Mutex::new(table),
                first_start,
                started,
            }),
        })
    }

    pub fn input_type(&self) -> &str {
        &self.inner.input_type
    }

    /// Time the registry was used for the first time.
    pub fn first_start(&self) -> DateTime<Utc> {
        self.inner.first_start
    }

    /// Time this process opened the store.
    pub fn started(&self) -> DateTime<Utc> {
        self.inner.started
    }

    pub fn backend(&self) -> &Arc<dyn StateBackend> {
        &self.inner.backend
    }

    pub(crate) fn lock_table(&self) -> MutexGuard<'_, ResourceTable> {
        match self.inner.table.lock() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Look up a resource and take ownership of it. A deleted resource is
    /// treated as absent; with `create` it is replaced by a fresh one.
    pub fn find(&self, key: &str, create: bool) -> Option<ResourceLease> {
        let mut table = self.lock_table();
        Self::find_in(&mut table, key, create)
    }

    pub(crate) fn find_in(table: &mut ResourceTable, key: &str, create: bool) -> Option<ResourceLease> {
        if let Some(resource) = table.get(key) {
            if !resource.is_deleted() {
                resource.retain();
                return Some(ResourceLease::new(resource.clone()));
            }
        }
        if !create {
            return None;
        }

        let resource = Arc::new(Resource::new(key.to_string(), ResourceState::default()));
        resource.retain();
        table.insert(key.to_string(), resource.clone());
        Some(ResourceLease::new(resource))
    }

    /// Persist the durable part of `state` unless the resource was removed.
    pub(crate) fn write_state(&self, key: &str, state: &mut ResourceState) {
        if state.invalid {
            return;
        }
        let result = serde_json::to_value(state.in_sync_snapshot())
            .map_err(Error::from)
            .and_then(|value| self.inner.backend.set(key, value));
        match result {
            Ok(()) => state.stored = true,
            Err(e) => {
                error!(key, error = %e, "Failed to persist resource state");
                state.stored = false;
            }
        }
    }

    /// Set the time-to-live of a resource. A zero TTL removes the resource:
    /// it is persisted once more, then ignored by lookups and never written
    /// again.
    pub fn update_ttl(&self, resource: &Resource, ttl: Option<Duration>) {
        let mut state = resource.state();
        if state.stored && state.ttl == ttl {
            return;
        }
        state.ttl = ttl;
        if state.updated.is_none() {
            state.updated = Some(Utc::now());
        }
        self.write_state(resource.key(), &mut state);

        if state.is_deleted() {
            // In-flight updates must not resurrect the entry
            state.version += 1;
            state.active_cursor_operations = 0;
            state.invalid = true;
        }
    }

    /// Mark the resource under `key` as removed.
    pub fn remove(&self, key: &str) -> Result<()> {
        let lease = self
            .find(key, false)
            .ok_or_else(|| Error::ResourceNotFound(key.to_string()))?;
        self.update_ttl(&lease, Some(Duration::ZERO));
        Ok(())
    }

    /// Replace the cursor of `key`. Update operations still in flight are
    /// ignored from now on.
    pub fn reset_cursor(&self, key: &str, cursor: serde_json::Value) -> Result<()> {
        let lease = self
            .find(key, false)
            .ok_or_else(|| Error::ResourceNotFound(key.to_string()))?;
        self.replace_cursor(&lease, cursor);
        Ok(())
    }

    pub(crate) fn replace_cursor(&self, resource: &Resource, cursor: serde_json::Value) {
        let mut state = resource.state();
        state.version += 1;
        state.active_cursor_operations = 0;
        state.pending_cursor_value = None;
        state.pending_update = None;
        state.cursor = Some(cursor);
        self.write_state(resource.key(), &mut state);
    }

    /// Set the metadata of `key`, creating the resource if needed.
    pub fn update_metadata(&self, key: &str, meta: serde_json::Value) -> Result<()> {
        let lease = self
            .find(key, true)
            .ok_or_else(|| Error::ResourceNotFound(key.to_string()))?;
        let mut state = lease.state();
        state.meta = Some(meta);
        self.write_state(key, &mut state);
        Ok(())
    }

    pub fn find_cursor_meta(&self, key: &str) -> Result<serde_json::Value> {
        let lease = self
            .find(key, false)
            .ok_or_else(|| Error::ResourceNotFound(key.to_string()))?;
        let meta = lease.state().meta.clone();
        Ok(meta.unwrap_or(serde_json::Value::Null))
    }

    /// Current durable view of `key`, deleted resources included.
    pub fn snapshot(&self, key: &str) -> Option<PersistedState> {
        let table = self.lock_table();
        table.get(key).map(|r| r.state().in_sync_snapshot())
    }

    /// Owner count of `key`, zero when unknown.
    pub fn pending(&self, key: &str) -> u64 {
        self.lock_table().get(key).map(|r| r.pending()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock_table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn table_is_free(&self) -> bool {
        self.inner.table.try_lock().is_ok()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock_table().keys().cloned().collect();
        keys.sort();
        keys
    }
}

fn load_first_start(backend: &dyn StateBackend, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    if let Some(value) = backend.get(FIRST_START_KEY)? {
        match serde_json::from_value::<DateTime<Utc>>(value) {
            Ok(ts) => return Ok(ts),
            Err(e) => warn!(error = %e, "Invalid first start time in registry, resetting"),
        }
    }
    backend.set(FIRST_START_KEY, serde_json::to_value(now)?)?;
    Ok(now)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::OnceLock;

    use super::*;
    use crate::persistence::MemoryBackend;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Call {
        Set,
        Remove,
    }

    type Hook = Box<dyn Fn(&Store, Call, &str) + Send + Sync>;

    /// Memory backend calling a hook with the store before every write
    /// and removal.
    pub struct HookedBackend {
        inner: MemoryBackend,
        store: OnceLock<Store>,
        hook: Hook,
    }

    impl HookedBackend {
        pub fn open(hook: impl Fn(&Store, Call, &str) + Send + Sync + 'static) -> (Arc<Self>, Store) {
            let backend = Arc::new(Self {
                inner: MemoryBackend::new(),
                store: OnceLock::new(),
                hook: Box::new(hook),
            });
            let store = Store::open("filestream", backend.clone()).unwrap();
            assert!(backend.store.set(store.clone()).is_ok());
            (backend, store)
        }

        fn call(&self, call: Call, key: &str) {
            if let Some(store) = self.store.get() {
                (self.hook)(store, call, key);
            }
        }
    }

    impl StateBackend for HookedBackend {
        fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: serde_json::Value) -> Result<()> {
            self.call(Call::Set, key);
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> Result<()> {
            self.call(Call::Remove, key);
            self.inner.remove(key)
        }

        fn each(&self, f: &mut dyn FnMut(&str, &serde_json::Value)) -> Result<()> {
            self.inner.each(f)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MemoryBackend, load_state};
    use serde_json::json;
    use std::collections::BTreeMap;

    const KEY: &str = "filestream::my-input::native::1-2";

    fn open(backend: &Arc<MemoryBackend>) -> Store {
        Store::open("filestream", backend.clone()).unwrap()
    }

    #[test]
    fn test_find_and_create() {
        let backend = Arc::new(MemoryBackend::new());
        let store = open(&backend);

        assert!(store.find(KEY, false).is_none());
        let lease = store.find(KEY, true).unwrap();
        assert_eq!(KEY, lease.key());
        assert_eq!(1, store.pending(KEY));

        let second = store.find(KEY, false).unwrap();
        assert_eq!(2, store.pending(KEY));
        drop(second);
        drop(lease);
        assert_eq!(0, store.pending(KEY));
    }

    #[test]
    fn test_update_coalescing() {
        let backend = Arc::new(MemoryBackend::new());
        let store = open(&backend);

        let lease = store.find(KEY, true).unwrap();
        lease.mark_locked();
        let cursor = Cursor::new(lease.resource().clone());
        assert!(cursor.is_new());

        let first = UpdateOp::new(&cursor, json!({"offset": 10}));
        let second = UpdateOp::new(&cursor, json!({"offset": 20}));
        assert_eq!(3, store.pending(KEY));
        assert_eq!(20, cursor.offset());
        // Nothing is durable before the acknowledgement
        assert!(store.snapshot(KEY).unwrap().cursor.is_none());

        first.absorb();
        second.execute(&store, 2);
        assert_eq!(1, store.pending(KEY));
        assert_eq!(Some(json!({"offset": 20})), store.snapshot(KEY).unwrap().cursor);
        assert!(cursor.all_events_published());

        let persisted = load_state(backend.as_ref(), KEY).unwrap().unwrap();
        assert_eq!(Some(json!({"offset": 20})), persisted.cursor);
    }

    #[test]
    fn test_partial_acknowledgement_merges_delta() {
        let backend = Arc::new(MemoryBackend::new());
        let store = open(&backend);

        let lease = store.find(KEY, true).unwrap();
        lease.mark_locked();
        let cursor = Cursor::new(lease.resource().clone());

        let first = UpdateOp::new(&cursor, json!({"offset": 10}));
        let _second = UpdateOp::new(&cursor, json!({"offset": 20, "eof": true}));
        first.execute(&store, 1);

        assert_eq!(Some(json!({"offset": 10})), store.snapshot(KEY).unwrap().cursor);
        assert_eq!(2, store.pending(KEY));
        assert!(!cursor.all_events_published());
        // The harvester still resumes from the latest pending cursor
        assert_eq!(20, cursor.offset());
    }

    #[test]
    fn test_reset_cursor_invalidates_updates() {
        let backend = Arc::new(MemoryBackend::new());
        let store = open(&backend);

        let lease = store.find(KEY, true).unwrap();
        lease.mark_locked();
        let cursor = Cursor::new(lease.resource().clone());
        let op = UpdateOp::new(&cursor, json!({"offset": 50}));

        store.reset_cursor(KEY, json!({"offset": 0})).unwrap();
        op.execute(&store, 1);

        assert_eq!(Some(json!({"offset": 0})), store.snapshot(KEY).unwrap().cursor);
        assert_eq!(1, store.pending(KEY));

        assert!(matches!(
            store.reset_cursor("filestream::x::native::9-9", json!({})),
            Err(Error::ResourceNotFound(_))
        ));
    }

    #[test]
    fn test_remove_marks_deleted() {
        let backend = Arc::new(MemoryBackend::new());
        let store = open(&backend);

        store
            .update_metadata(KEY, json!({"source": "/var/log/app.log", "identifier_name": "native"}))
            .unwrap();
        assert_eq!(
            json!("/var/log/app.log"),
            store.find_cursor_meta(KEY).unwrap()["source"]
        );

        store.remove(KEY).unwrap();
        assert!(store.find(KEY, false).is_none());
        assert!(matches!(store.find_cursor_meta(KEY), Err(Error::ResourceNotFound(_))));
        let persisted = load_state(backend.as_ref(), KEY).unwrap().unwrap();
        assert_eq!(Some(Duration::ZERO), persisted.ttl);

        // A later write never reaches the backend again
        let writes = backend.write_count();
        let resource = store.lock_table().get(KEY).cloned().unwrap();
        store.write_state(KEY, &mut resource.state());
        assert_eq!(writes, backend.write_count());

        // Creating again yields a fresh resource
        let lease = store.find(KEY, true).unwrap();
        assert!(lease.state().is_new());
    }

    #[test]
    fn test_failed_write_clears_stored() {
        let backend = Arc::new(MemoryBackend::new());
        let store = open(&backend);
        let lease = store.find(KEY, true).unwrap();

        backend.set_fail_writes(true);
        store.update_ttl(&lease, Some(Duration::from_secs(60)));
        assert!(!lease.state().stored);

        backend.set_fail_writes(false);
        // Same TTL, but not stored yet, so it is written again
        store.update_ttl(&lease, Some(Duration::from_secs(60)));
        assert!(lease.state().stored);
        assert!(load_state(backend.as_ref(), KEY).unwrap().is_some());
    }

    #[test]
    fn test_reopen_restores_states() {
        let backend = Arc::new(MemoryBackend::new());
        let removed = "filestream::my-input::native::9-9";
        let (first_start, expected) = {
            let store = open(&backend);
            let mut expected = BTreeMap::new();
            for i in 1..=5u64 {
                let key = format!("filestream::my-input::native::{}-2", i);
                let lease = store.find(&key, true).unwrap();
                lease.mark_locked();
                store.update_ttl(&lease, (i % 2 == 0).then(|| Duration::from_secs(60 * i)));
                let cursor = Cursor::new(lease.resource().clone());
                UpdateOp::new(&cursor, json!({"offset": 10 * i, "eof": i == 3})).execute(&store, 1);
                let meta = json!({"source": format!("/var/log/{}.log", i), "identifier_name": "native"});
                store.update_metadata(&key, meta).unwrap();
                expected.insert(key.clone(), store.snapshot(&key).unwrap());
            }

            store.update_metadata(removed, json!({"source": "/var/log/gone.log"})).unwrap();
            store.remove(removed).unwrap();
            (store.first_start(), expected)
        };
        backend.set("other::x::native::1", json!({"TTL": -1})).unwrap();
        backend.set("filestream::broken", json!("not a state")).unwrap();

        let store = open(&backend);
        assert_eq!(first_start, store.first_start());
        for (key, state) in &expected {
            assert!(state.updated.is_some());
            assert_eq!(Some(state), store.snapshot(key).as_ref(), "{}", key);
        }

        // A removed entry is either gone or still marked as removed
        assert!(store.find(removed, false).is_none());
        if let Some(state) = store.snapshot(removed) {
            assert_eq!(Some(Duration::ZERO), state.ttl);
        }
        assert!(!store.keys().iter().any(|k| k.starts_with("other::") || k == "filestream::broken"));

        let lease = store.find(KEY, false).unwrap();
        assert!(lease.state().stored);
        let cursor = Cursor::new(lease.resource().clone());
        assert!(!cursor.is_new());
        #[derive(serde::Deserialize)]
        struct State {
            offset: u64,
        }
        assert_eq!(10, cursor.unpack::<State>().unwrap().unwrap().offset);
    }
}
