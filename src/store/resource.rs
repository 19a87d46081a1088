// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use portable_atomic::{AtomicU64, Ordering};
use tokio::sync::OwnedMutexGuard;

use super::cursor::merge_cursor;
use crate::persistence::PersistedState;

/// In-memory state of one registry key.
///
/// `pending` counts harvesters holding the key plus update operations not yet
/// applied. A resource with pending owners is never garbage collected.
#[derive(Debug)]
pub struct Resource {
    key: String,
    pending: AtomicU64,
    /// Held by the harvester reading the source for its whole run
    lock: Arc<tokio::sync::Mutex<()>>,
    state: Mutex<ResourceState>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ResourceState {
    /// Bumped whenever in-flight update operations must be ignored
    pub(crate) version: u64,
    /// Version observed when the current harvester acquired the lock
    pub(crate) locked_version: u64,
    /// Whether the last write reached the backend
    pub(crate) stored: bool,
    /// Removed, must never be written again
    pub(crate) invalid: bool,
    /// `None` never expires, zero marks the entry as removed
    pub(crate) ttl: Option<Duration>,
    pub(crate) updated: Option<DateTime<Utc>>,
    /// Last value known to be persisted
    pub(crate) cursor: Option<serde_json::Value>,
    pub(crate) pending_cursor_value: Option<serde_json::Value>,
    pub(crate) pending_update: Option<serde_json::Value>,
    pub(crate) active_cursor_operations: u64,
    pub(crate) meta: Option<serde_json::Value>,
}

impl ResourceState {
    pub(crate) fn from_persisted(state: PersistedState) -> Self {
        Self {
            stored: true,
            ttl: state.ttl,
            updated: state.updated,
            cursor: state.cursor,
            meta: state.meta,
            ..Default::default()
        }
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.updated.is_some() && self.ttl == Some(Duration::ZERO)
    }

    pub(crate) fn is_new(&self) -> bool {
        self.cursor.is_none() && self.pending_cursor_value.is_none() && self.pending_update.is_none()
    }

    /// Cursor including every update that has not been acknowledged yet.
    pub(crate) fn pending_cursor(&mut self) -> Option<serde_json::Value> {
        if let Some(update) = self.pending_update.take() {
            let base = self
                .pending_cursor_value
                .take()
                .or_else(|| self.cursor.clone());
            self.pending_cursor_value = Some(match base {
                Some(base) => merge_cursor(base, update),
                None => update,
            });
        }
        self.pending_cursor_value.clone().or_else(|| self.cursor.clone())
    }

    /// The cursor a harvester should resume from.
    pub(crate) fn active_cursor(&mut self) -> Option<serde_json::Value> {
        if self.active_cursor_operations == 0 {
            return self.cursor.clone();
        }
        self.pending_cursor()
    }

    /// Snapshot of the durable part of the state
    pub(crate) fn in_sync_snapshot(&self) -> PersistedState {
        PersistedState {
            ttl: self.ttl,
            updated: self.updated,
            cursor: self.cursor.clone(),
            meta: self.meta.clone(),
        }
    }
}

impl Resource {
    pub(crate) fn new(key: String, state: ResourceState) -> Self {
        Self {
            key,
            pending: AtomicU64::new(0),
            lock: Arc::new(tokio::sync::Mutex::new(())),
            state: Mutex::new(state),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn retain(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn release(&self) {
        self.release_n(1);
    }

    pub(crate) fn release_n(&self, n: u64) {
        let _ = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(n)));
    }

    /// Number of owners: active harvesters, leases and update operations
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::SeqCst)
    }

    /// No harvester and no unapplied update holds the resource
    pub fn finished(&self) -> bool {
        self.pending() == 0
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, ResourceState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.state().is_deleted()
    }

    /// Wait for exclusive harvesting rights on this resource.
    pub async fn lock(&self) -> OwnedMutexGuard<()> {
        self.lock.clone().lock_owned().await
    }

    pub fn try_lock(&self) -> Option<OwnedMutexGuard<()>> {
        self.lock.clone().try_lock_owned().ok()
    }

    /// Record that a new harvester owns the lock; update operations of
    /// earlier generations are ignored from now on.
    pub(crate) fn mark_locked(&self) {
        let mut state = self.state();
        state.locked_version = state.version;
    }

    /// Copy of the state under a new key, used when an entry migrates.
    pub(crate) fn copy_with_new_key(&self, key: String) -> Resource {
        let state = self.state().clone();
        Resource::new(key, state)
    }
}

/// Ownership of a resource, released when dropped.
#[derive(Debug)]
pub struct ResourceLease {
    resource: Arc<Resource>,
}

impl ResourceLease {
    /// Takes an already retained resource.
    pub(crate) fn new(resource: Arc<Resource>) -> Self {
        Self { resource }
    }

    pub fn resource(&self) -> &Arc<Resource> {
        &self.resource
    }

    pub fn key(&self) -> &str {
        self.resource.key()
    }
}

impl std::ops::Deref for ResourceLease {
    type Target = Resource;

    fn deref(&self) -> &Resource {
        &self.resource
    }
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        self.resource.release();
    }
}
