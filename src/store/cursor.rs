// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::Store;
use super::resource::Resource;
use crate::error::Result;

/// Merge `update` into `base`. Objects are merged key by key, everything
/// else is replaced.
pub fn merge_cursor(base: Value, update: Value) -> Value {
    match (base, update) {
        (Value::Object(mut base), Value::Object(update)) => {
            for (key, value) in update {
                let merged = match base.remove(&key) {
                    Some(existing) => merge_cursor(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, update) => update,
    }
}

/// Read access to the cursor of the resource a harvester owns.
#[derive(Debug, Clone)]
pub struct Cursor {
    resource: Arc<Resource>,
}

impl Cursor {
    pub(crate) fn new(resource: Arc<Resource>) -> Self {
        Self { resource }
    }

    /// No cursor was ever recorded for the source.
    pub fn is_new(&self) -> bool {
        self.resource.state().is_new()
    }

    /// Decode the latest cursor, including updates still waiting for
    /// acknowledgement. Returns `None` for a new source.
    pub fn unpack<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        let value = self.resource.state().active_cursor();
        match value {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Offset field of the latest cursor, zero when absent.
    pub fn offset(&self) -> u64 {
        self.resource
            .state()
            .active_cursor()
            .and_then(|c| c.get("offset").and_then(Value::as_u64))
            .unwrap_or_default()
    }

    /// Whether every event published for this source was acknowledged.
    ///
    /// Approximated by the owner count: at most the running harvester
    /// remains once all update operations were applied.
    pub fn all_events_published(&self) -> bool {
        self.resource.pending() <= 1
    }

    pub fn key(&self) -> &str {
        self.resource.key()
    }

    pub(crate) fn resource(&self) -> &Arc<Resource> {
        &self.resource
    }
}

/// A cursor update attached to a published event, applied once the event
/// is acknowledged.
///
/// An operation dropped without being executed or absorbed belongs to an
/// event that will never be acknowledged; its owner reference is released
/// and its pending delta discarded.
#[derive(Debug)]
pub struct UpdateOp {
    resource: Arc<Resource>,
    generation: u64,
    timestamp: DateTime<Utc>,
    delta: Value,
    done: bool,
}

impl UpdateOp {
    /// Register a pending update on the cursor's resource. The operation
    /// owns one reference to the resource until it is executed.
    pub fn new(cursor: &Cursor, delta: Value) -> Self {
        let resource = cursor.resource().clone();
        let generation = {
            let mut state = resource.state();
            // Fold the previous update before queueing this one
            if state.pending_update.is_some() {
                state.pending_cursor();
            }
            state.pending_update = Some(delta.clone());
            state.active_cursor_operations += 1;
            state.locked_version
        };
        resource.retain();

        Self {
            resource,
            generation,
            timestamp: Utc::now(),
            delta,
            done: false,
        }
    }

    pub fn key(&self) -> &str {
        self.resource.key()
    }

    pub fn delta(&self) -> &Value {
        &self.delta
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Drop an acknowledged operation superseded by a newer one of the same
    /// key. Its owner reference is released by the newer operation's `n`.
    pub(crate) fn absorb(mut self) {
        self.done = true;
    }

    /// Apply the update on behalf of `n` acknowledged operations, the last of
    /// which is `self`. Releases the `n` resource references in every case.
    pub fn execute(mut self, store: &Store, n: u64) {
        self.done = true;
        {
            let mut state = self.resource.state();
            if self.generation != state.version || state.is_deleted() {
                tracing::debug!(
                    key = self.resource.key(),
                    generation = self.generation,
                    version = state.version,
                    "Dropping stale cursor update"
                );
            } else {
                state.active_cursor_operations =
                    state.active_cursor_operations.saturating_sub(n);
                if state.active_cursor_operations == 0 {
                    state.cursor = state.pending_cursor();
                    state.pending_cursor_value = None;
                    state.pending_update = None;
                } else {
                    let delta = std::mem::take(&mut self.delta);
                    let merged = match state.cursor.take() {
                        Some(cursor) => merge_cursor(cursor, delta),
                        None => delta,
                    };
                    state.cursor = Some(merged);
                }

                if state.updated.is_none_or(|u| u < self.timestamp) {
                    state.updated = Some(self.timestamp);
                }
                store.write_state(self.resource.key(), &mut state);
            }
        }
        self.resource.release_n(n);
    }
}

impl Drop for UpdateOp {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        {
            let mut state = self.resource.state();
            if self.generation == state.version && state.active_cursor_operations > 0 {
                state.active_cursor_operations -= 1;
                if state.active_cursor_operations == 0 {
                    state.pending_cursor_value = None;
                    state.pending_update = None;
                }
            }
        }
        self.resource.release();
    }
}
