// SPDX-License-Identifier: Apache-2.0

//! Persistent key/value layer beneath the resource store.
//!
//! Values are JSON documents. The JSON file backend writes the whole
//! database atomically on every change; the memory backend is used by tests
//! and can be told to fail writes.

mod json_file;
mod memory;
mod schema;

pub use json_file::{JsonFileDatabase, JsonFileStore};
pub use memory::MemoryBackend;
pub use schema::{FIRST_START_KEY, PersistedState, load_state};

use crate::error::Result;

/// Access to the persisted states of one scope.
pub trait StateBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;

    fn set(&self, key: &str, value: serde_json::Value) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    /// Visit every stored entry.
    fn each(&self, f: &mut dyn FnMut(&str, &serde_json::Value)) -> Result<()>;
}
