// SPDX-License-Identifier: Apache-2.0

//! Persisted form of a resource.
//!
//! ```json
//! {"TTL": 1800000000000, "Updated": "2024-05-01T10:00:00Z",
//!  "Cursor": {"offset": 1024}, "Meta": {"source": "/var/log/app.log", "identifier_name": "fingerprint"}}
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::StateBackend;
use crate::error::Result;

/// Reserved key holding the time the registry was first used.
pub const FIRST_START_KEY: &str = "_logharvest::first_start";

/// State stored for one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Time-to-live in nanoseconds, `-1` never expires
    #[serde(rename = "TTL", with = "ttl_nanos")]
    pub ttl: Option<Duration>,

    #[serde(rename = "Updated", default)]
    pub updated: Option<DateTime<Utc>>,

    #[serde(rename = "Cursor", default)]
    pub cursor: Option<serde_json::Value>,

    #[serde(rename = "Meta", default)]
    pub meta: Option<serde_json::Value>,
}

/// Read and decode the state stored under `key`.
pub fn load_state(backend: &dyn StateBackend, key: &str) -> Result<Option<PersistedState>> {
    match backend.get(key)? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

mod ttl_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ttl: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match ttl {
            Some(d) => s.serialize_i64(i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)),
            None => s.serialize_i64(-1),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let nanos = i64::deserialize(d)?;
        Ok(u64::try_from(nanos).ok().map(Duration::from_nanos))
    }
}
