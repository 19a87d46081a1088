// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::store::{Resource, Store};

/// Periodically removes expired entries from the store.
pub struct Cleaner {
    store: Store,
    interval: Duration,
}

impl Cleaner {
    pub fn new(store: Store, interval: Duration) -> Self {
        Self { store, interval }
    }

    pub async fn run(self, cancel_token: CancellationToken) {
        let started = Utc::now();
        let mut interval = tokio::time::interval(self.interval);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            select! {
                biased;

                _ = cancel_token.cancelled() => break,

                _ = interval.tick() => {
                    let store = self.store.clone();
                    let result = tokio::task::spawn_blocking(move || {
                        gc_store(&store, started, Utc::now())
                    })
                    .await;
                    match result {
                        Ok(0) => {}
                        Ok(removed) => debug!(removed, "Removed expired registry entries"),
                        Err(e) => warn!(error = %e, "Registry cleanup did not complete"),
                    }
                }
            }
        }
        debug!("Cleaner stopped");
    }
}

/// Remove every resource eligible for collection, returning how many were removed.
///
/// The persisted entry is deleted first; if that fails the resource stays in
/// the table and is retried on the next pass. The table is not locked while
/// the backend is written. A resource taken or replaced in the meantime stays
/// in the table and is persisted again.
pub fn gc_store(store: &Store, started: DateTime<Utc>, now: DateTime<Utc>) -> usize {
    let expired: Vec<(String, Arc<Resource>)> = store
        .lock_table()
        .iter()
        .filter(|(_, resource)| is_expired(resource, started, now))
        .map(|(key, resource)| (key.clone(), resource.clone()))
        .collect();

    let mut removed = 0;
    for (key, resource) in expired {
        if let Err(e) = store.backend().remove(&key) {
            warn!(key, error = %e, "Failed to remove registry entry");
            continue;
        }

        let revived = {
            let mut table = store.lock_table();
            let unchanged = table.get(&key).is_some_and(|current| {
                Arc::ptr_eq(current, &resource) && is_expired(current, started, now)
            });
            if unchanged {
                table.remove(&key);
                removed += 1;
                None
            } else {
                table.get(&key).cloned()
            }
        };
        if let Some(current) = revived {
            debug!(key, "Registry entry in use again, keeping it");
            store.write_state(&key, &mut current.state());
        }
    }
    removed
}

fn is_expired(resource: &Resource, started: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    if !resource.finished() {
        return false;
    }
    let state = resource.state();
    let Some(ttl) = state.ttl else {
        return false;
    };
    if !state.stored {
        return false;
    }
    let Ok(ttl) = chrono::Duration::from_std(ttl) else {
        return false;
    };

    let reference = match state.updated {
        Some(updated) if updated > started => updated,
        _ => started,
    };
    reference + ttl < now
}
