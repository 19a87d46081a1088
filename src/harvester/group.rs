// SPDX-License-Identifier: Apache-2.0

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::select;
use tokio::sync::{OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use super::pipeline::{AckHandler, ClientConfig, Pipeline};
use super::publisher::Publisher;
use super::{Harvester, HarvesterContext};
use crate::bounded_channel::BoundedSender;
use crate::error::Error;
use crate::identity::FileSource;
use crate::store::{Cursor, ResourceLease, SourceStore};
use crate::watcher::HarvesterStatus;

/// Decisions the prospector takes about harvesters.
pub trait HarvesterGroup: Send + Sync {
    /// Start a harvester for `src` unless one is already running.
    fn start(&self, src: FileSource);

    /// Stop the running harvester of `src`, if any, and start a new one.
    fn restart(&self, src: FileSource);

    /// Carry the cursor of `previous` over to `next` and start harvesting
    /// `next`. If `previous` was restarted since its last start, the cursor
    /// it had before the restart is carried.
    fn continue_from(&self, previous: FileSource, next: FileSource);

    fn stop(&self, src: &FileSource);

    /// Receive a [`HarvesterStatus`] every time a harvester exits.
    fn set_observer(&self, tx: BoundedSender<HarvesterStatus>);

    /// Cancel every harvester and wait for all of them to exit.
    fn stop_harvesters(&self) -> BoxFuture<'_, ()>;
}

struct ReaderEntry {
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct ReaderTable {
    generation: u64,
    entries: HashMap<String, ReaderEntry>,
}

/// Bookkeeping of running harvesters by source key.
#[derive(Default)]
pub struct ReaderGroup {
    table: Mutex<ReaderTable>,
}

impl ReaderGroup {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ReaderTable> {
        match self.table.lock() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a harvester for `id`, returning its cancellation token and
    /// generation. Returns `None` if a harvester is already registered.
    pub fn new_context(&self, id: &str, parent: &CancellationToken) -> Option<(CancellationToken, u64)> {
        let mut table = self.lock();
        if table.entries.contains_key(id) {
            return None;
        }
        table.generation += 1;
        let generation = table.generation;
        let cancel = parent.child_token();
        table.entries.insert(
            id.to_string(),
            ReaderEntry {
                generation,
                cancel: cancel.clone(),
            },
        );
        Some((cancel, generation))
    }

    /// Cancel and forget the harvester of `id`.
    pub fn remove(&self, id: &str) {
        if let Some(entry) = self.lock().entries.remove(id) {
            entry.cancel.cancel();
        }
    }

    /// Forget the harvester of `id` if it is still the one of `generation`.
    fn remove_generation(&self, id: &str, generation: u64) {
        let mut table = self.lock();
        if table.entries.get(id).is_some_and(|e| e.generation == generation) {
            if let Some(entry) = table.entries.remove(id) {
                entry.cancel.cancel();
            }
        }
    }

    pub fn has_id(&self, id: &str) -> bool {
        self.lock().entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Settings of a [`HarvesterCoordinator`]
#[derive(Debug, Clone, Default)]
pub struct CoordinatorSettings {
    pub input_id: String,
    /// TTL set on resources when a harvester starts, `None` never expires
    pub clean_inactive: Option<Duration>,
    /// Maximum number of concurrently running harvesters, 0 is unlimited
    pub harvester_limit: usize,
}

/// Runs harvesters, at most one per source.
#[derive(Clone)]
pub struct HarvesterCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    settings: CoordinatorSettings,
    readers: ReaderGroup,
    harvester: Arc<dyn Harvester>,
    pipeline: Arc<dyn Pipeline>,
    store: SourceStore,
    ack_handler: AckHandler,
    limiter: Option<Arc<Semaphore>>,
    tasks: TaskTracker,
    cancel: CancellationToken,
    observer: Mutex<Option<BoundedSender<HarvesterStatus>>>,
    /// Cursor of every restarted source as it was before the restart
    restarted: Mutex<HashMap<String, Value>>,
}

impl HarvesterCoordinator {
    pub fn new(
        settings: CoordinatorSettings,
        harvester: Arc<dyn Harvester>,
        pipeline: Arc<dyn Pipeline>,
        store: SourceStore,
        ack_handler: AckHandler,
        parent: &CancellationToken,
    ) -> Self {
        let limiter = (settings.harvester_limit > 0)
            .then(|| Arc::new(Semaphore::new(settings.harvester_limit)));
        Self {
            inner: Arc::new(Inner {
                settings,
                readers: ReaderGroup::new(),
                harvester,
                pipeline,
                store,
                ack_handler,
                limiter,
                tasks: TaskTracker::new(),
                cancel: parent.child_token(),
                observer: Mutex::new(None),
                restarted: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn readers(&self) -> &ReaderGroup {
        &self.inner.readers
    }

    pub fn harvester_name(&self) -> &str {
        self.inner.harvester.name()
    }

    fn spawn_harvester(&self, src: FileSource, restart: bool) {
        let inner = self.inner.clone();
        self.inner.tasks.spawn(async move {
            inner.run_harvester(src, restart).await;
        });
    }
}

impl HarvesterGroup for HarvesterCoordinator {
    fn start(&self, src: FileSource) {
        let key = self.inner.store.id(&src);
        debug!(source_file = %key, "Starting harvester for file");
        self.inner.restarted().remove(&key);
        self.spawn_harvester(src, false);
    }

    fn restart(&self, src: FileSource) {
        let key = self.inner.store.id(&src);
        debug!(source_file = %key, "Restarting harvester for file");
        match self.inner.active_cursor(&src) {
            Some(cursor) => self.inner.restarted().insert(key, cursor),
            None => self.inner.restarted().remove(&key),
        };
        self.spawn_harvester(src, true);
    }

    fn continue_from(&self, previous: FileSource, next: FileSource) {
        let prev_key = self.inner.store.id(&previous);
        let next_key = self.inner.store.id(&next);
        let restarted = self.inner.restarted().remove(&prev_key);
        let cursor = restarted.or_else(|| self.inner.active_cursor(&previous));
        if self.inner.seed_cursor(&next, cursor) {
            info!(from = %prev_key, to = %next_key, "Continuing harvesting of rotated file");
        }
        self.start(next);
    }

    fn stop(&self, src: &FileSource) {
        let key = self.inner.store.id(src);
        debug!(source_file = %key, "Stopping harvester for file");
        self.inner.restarted().remove(&key);
        self.inner.readers.remove(&key);
    }

    fn set_observer(&self, tx: BoundedSender<HarvesterStatus>) {
        if let Ok(mut observer) = self.inner.observer.lock() {
            *observer = Some(tx);
        }
    }

    fn stop_harvesters(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.inner.cancel.cancel();
            self.inner.tasks.close();
            self.inner.tasks.wait().await;
        })
    }
}

impl Inner {
    async fn run_harvester(&self, src: FileSource, restart: bool) {
        let key = self.store.id(&src);
        if restart {
            self.readers.remove(&key);
        }
        let Some((cancel, generation)) = self.readers.new_context(&key, &self.cancel) else {
            debug!(source_file = %key, "Harvester already running");
            return;
        };

        let Some(_permit) = self.acquire_slot(&cancel).await else {
            self.readers.remove_generation(&key, generation);
            return;
        };

        let Some(lease) = self.store.find(&src, true) else {
            self.readers.remove_generation(&key, generation);
            return;
        };
        let Some(guard) = lock(&lease, &cancel).await else {
            debug!(source_file = %key, "Cancelled while waiting for resource lock");
            self.readers.remove_generation(&key, generation);
            return;
        };

        let client = match self.pipeline.connect(ClientConfig {
            cancel: cancel.clone(),
            ack_handler: self.ack_handler.clone(),
        }) {
            Ok(client) => client,
            Err(e) => {
                error!(source_file = %key, error = %e, "Error while connecting to output pipeline");
                self.readers.remove_generation(&key, generation);
                return;
            }
        };

        self.store.store().update_ttl(&lease, self.settings.clean_inactive);
        let cursor = Cursor::new(lease.resource().clone());
        let publisher = Publisher::new(client, cursor.clone());
        let ctx = HarvesterContext {
            id: key.clone(),
            input_id: self.settings.input_id.clone(),
            cancel: cancel.clone(),
        };

        let run = self.harvester.run(ctx, src, cursor.clone(), &publisher);
        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(Ok(())) | Ok(Err(Error::Cancelled)) => {}
            Ok(Err(e)) => error!(source_file = %key, error = %e, "Harvester failed"),
            Err(panic) => error!(
                source_file = %key,
                panic = %panic_message(panic.as_ref()),
                "Harvester panicked"
            ),
        }

        publisher.close();
        let size = cursor.offset();
        drop(guard);
        drop(lease);
        self.readers.remove_generation(&key, generation);
        self.notify_closed(HarvesterStatus { id: key.clone(), size });
        debug!(source_file = %key, "Stopped harvester for file");
    }

    async fn acquire_slot(&self, cancel: &CancellationToken) -> Option<Option<OwnedSemaphorePermit>> {
        let Some(limiter) = &self.limiter else {
            return Some(None);
        };
        select! {
            biased;

            _ = cancel.cancelled() => None,
            permit = limiter.clone().acquire_owned() => permit.ok().map(Some),
        }
    }

    /// Cursor of `src` including updates not acknowledged yet. Never waits
    /// for the harvester of `src`.
    fn active_cursor(&self, src: &FileSource) -> Option<Value> {
        let lease = self.store.find(src, false)?;
        let cursor = lease.state().active_cursor();
        cursor
    }

    /// Give `src` the cursor `cursor` unless it already has a state of its
    /// own or a harvester is reading it. Returns true if the cursor was set.
    fn seed_cursor(&self, src: &FileSource, cursor: Option<Value>) -> bool {
        let key = self.store.id(src);
        let Some(cursor) = cursor else {
            return false;
        };
        let Some(lease) = self.store.find(src, true) else {
            return false;
        };
        let Some(_guard) = lease.try_lock() else {
            debug!(source_file = %key, "Harvester already running, keeping its cursor");
            return false;
        };
        if !lease.state().is_new() {
            debug!(source_file = %key, "Rotated file already has a state, keeping it");
            return false;
        }

        let store = self.store.store();
        store.update_ttl(&lease, self.settings.clean_inactive);
        store.replace_cursor(&lease, cursor);
        true
    }

    fn restarted(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        match self.restarted.lock() {
            Ok(restarted) => restarted,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn notify_closed(&self, status: HarvesterStatus) {
        let observer = match self.observer.lock() {
            Ok(observer) => observer.clone(),
            Err(_) => None,
        };
        if let Some(tx) = observer {
            if let Err(e) = tx.try_send(status) {
                debug!(error = %e, "Could not report closed harvester");
            }
        }
    }
}

async fn lock(lease: &ResourceLease, cancel: &CancellationToken) -> Option<OwnedMutexGuard<()>> {
    select! {
        biased;

        _ = cancel.cancelled() => None,
        guard = lease.lock() => {
            lease.mark_locked();
            Some(guard)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
