// SPDX-License-Identifier: Apache-2.0

//! Asynchronous writer for acknowledged cursor updates.
//!
//! Acknowledgement handlers schedule update operations through an
//! [`UpdateScheduler`]; the [`UpdateWriter`] task applies them to the store.
//! Updates for the same key are coalesced while they wait: only the newest
//! operation is executed, releasing the accumulated owner count.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::select;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::{Store, UpdateOp};

/// Configuration for the update writer
#[derive(Debug, Clone)]
pub struct UpdateWriterConfig {
    /// Maximum time spent writing remaining updates on shutdown
    pub flush_timeout: Duration,
}

impl Default for UpdateWriterConfig {
    fn default() -> Self {
        Self {
            flush_timeout: Duration::from_secs(2),
        }
    }
}

struct ScheduledUpdate {
    op: UpdateOp,
    n: u64,
}

#[derive(Default)]
struct PendingUpdates {
    /// Keys in the order their first update was scheduled
    order: Vec<String>,
    updates: HashMap<String, ScheduledUpdate>,
}

impl PendingUpdates {
    fn push(&mut self, op: UpdateOp, n: u64) {
        match self.updates.get_mut(op.key()) {
            Some(scheduled) => {
                std::mem::replace(&mut scheduled.op, op).absorb();
                scheduled.n += n;
            }
            None => {
                let key = op.key().to_string();
                self.order.push(key.clone());
                self.updates.insert(key, ScheduledUpdate { op, n });
            }
        }
    }

    fn take(&mut self) -> Vec<ScheduledUpdate> {
        let mut updates = std::mem::take(&mut self.updates);
        std::mem::take(&mut self.order)
            .into_iter()
            .filter_map(|key| updates.remove(&key))
            .collect()
    }

    fn len(&self) -> usize {
        self.updates.len()
    }
}

struct Shared {
    pending: Mutex<PendingUpdates>,
    notify: Notify,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingUpdates> {
        match self.pending.lock() {
            Ok(pending) => pending,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Handle used to hand acknowledged updates to the writer.
#[derive(Clone)]
pub struct UpdateScheduler {
    shared: Arc<Shared>,
}

impl UpdateScheduler {
    /// Schedule `op` on behalf of `n` acknowledged operations of its key.
    pub fn schedule(&self, op: UpdateOp, n: u64) {
        self.shared.pending().push(op, n);
        self.shared.notify.notify_one();
    }

    /// Number of keys waiting to be written
    pub fn pending(&self) -> usize {
        self.shared.pending().len()
    }
}

/// Applies scheduled cursor updates to the store.
pub struct UpdateWriter {
    store: Store,
    shared: Arc<Shared>,
    config: UpdateWriterConfig,
}

impl UpdateWriter {
    pub fn new(store: Store, config: UpdateWriterConfig) -> (Self, UpdateScheduler) {
        let shared = Arc::new(Shared {
            pending: Mutex::new(PendingUpdates::default()),
            notify: Notify::new(),
        });
        let scheduler = UpdateScheduler {
            shared: shared.clone(),
        };
        (
            Self {
                store,
                shared,
                config,
            },
            scheduler,
        )
    }

    /// Run until cancelled, then write what is left within the flush timeout.
    pub async fn run(self, cancel_token: CancellationToken) {
        debug!("Update writer started");

        loop {
            select! {
                biased;

                _ = cancel_token.cancelled() => {
                    debug!("Update writer cancelled, flushing scheduled updates");
                    break;
                }

                _ = self.shared.notify.notified() => {
                    self.write_pending().await;
                }
            }
        }

        match tokio::time::timeout(self.config.flush_timeout, self.flush()).await {
            Ok(0) => {}
            Ok(n) => info!(updates = n, "Flushed scheduled updates on shutdown"),
            Err(_) => warn!(
                remaining = self.shared.pending().len(),
                timeout = ?self.config.flush_timeout,
                "Timed out flushing scheduled updates"
            ),
        }
    }

    async fn flush(&self) -> usize {
        let mut written = 0;
        loop {
            let n = self.write_pending().await;
            if n == 0 {
                return written;
            }
            written += n;
        }
    }

    /// Execute every scheduled update, returning how many keys were written.
    async fn write_pending(&self) -> usize {
        let batch = self.shared.pending().take();
        if batch.is_empty() {
            return 0;
        }
        let count = batch.len();

        // Backend writes are blocking file I/O
        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || {
            for ScheduledUpdate { op, n } in batch {
                op.execute(&store, n);
            }
        })
        .await;
        if let Err(e) = result {
            warn!(error = %e, "Update batch did not complete");
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MemoryBackend, load_state};
    use crate::store::Cursor;
    use serde_json::json;

    const KEY: &str = "filestream::in::native::1-1";

    fn setup() -> (Arc<MemoryBackend>, Store) {
        let backend = Arc::new(MemoryBackend::new());
        let store = Store::open("filestream", backend.clone()).unwrap();
        (backend, store)
    }

    fn cursor(store: &Store, key: &str) -> (crate::store::ResourceLease, Cursor) {
        let lease = store.find(key, true).unwrap();
        lease.mark_locked();
        let cursor = Cursor::new(lease.resource().clone());
        (lease, cursor)
    }

    #[test]
    fn test_schedule_coalesces_per_key() {
        let (_, store) = setup();
        let (_writer, scheduler) = UpdateWriter::new(store.clone(), UpdateWriterConfig::default());
        let (_lease, cursor) = cursor(&store, KEY);

        scheduler.schedule(UpdateOp::new(&cursor, json!({"offset": 1})), 1);
        scheduler.schedule(UpdateOp::new(&cursor, json!({"offset": 2})), 1);
        assert_eq!(1, scheduler.pending());

        let batch = scheduler.shared.pending().take();
        assert_eq!(1, batch.len());
        assert_eq!(2, batch[0].n);
        assert_eq!(&json!({"offset": 2}), batch[0].op.delta());
    }

    #[tokio::test]
    async fn test_writes_acknowledged_updates() {
        let (backend, store) = setup();
        let (writer, scheduler) = UpdateWriter::new(store.clone(), UpdateWriterConfig::default());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(writer.run(cancel.clone()));

        let (_lease, cursor) = cursor(&store, KEY);
        let first = UpdateOp::new(&cursor, json!({"offset": 10}));
        let second = UpdateOp::new(&cursor, json!({"offset": 25}));
        first.absorb();
        scheduler.schedule(second, 2);

        let mut persisted = None;
        for _ in 0..100 {
            persisted = load_state(backend.as_ref(), KEY).unwrap().and_then(|s| s.cursor);
            if persisted.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(Some(json!({"offset": 25})), persisted);
        assert_eq!(1, store.pending(KEY));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_flushes_on_shutdown() {
        let (_, store) = setup();
        let (writer, scheduler) = UpdateWriter::new(store.clone(), UpdateWriterConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (_a_lease, a) = cursor(&store, "filestream::in::native::1-1");
        let (_b_lease, b) = cursor(&store, "filestream::in::native::2-1");
        scheduler.schedule(UpdateOp::new(&a, json!({"offset": 3})), 1);
        scheduler.schedule(UpdateOp::new(&b, json!({"offset": 4})), 1);

        writer.run(cancel).await;

        assert_eq!(0, scheduler.pending());
        assert_eq!(
            Some(json!({"offset": 3})),
            store.snapshot("filestream::in::native::1-1").unwrap().cursor
        );
        assert_eq!(
            Some(json!({"offset": 4})),
            store.snapshot("filestream::in::native::2-1").unwrap().cursor
        );
    }
}
