// SPDX-License-Identifier: Apache-2.0

//! Snapshot-diff file watcher.
//!
//! Every scan is compared against the previous one. A path that vanished is
//! paired with a new path of the same file identity to produce a single
//! rename, never a delete followed by a create.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::event::{FileDescriptor, FsEvent, HarvesterStatus, Operation, same_file};
use super::native::NativeTrigger;
use super::scanner::Scanner;
use crate::bounded_channel::{self, BoundedReceiver, BoundedSender};

/// Capacity of the harvester status channel
const STATUS_CHANNEL_SIZE: usize = 5;

/// Maps an event to the store key of its source
pub type SourceIdFn = Arc<dyn Fn(&FsEvent) -> String + Send + Sync>;

/// Configuration of the scan loop
#[derive(Debug, Clone)]
pub struct FileWatcherConfig {
    /// Interval between two scans
    pub interval: Duration,
    /// A touched file with unchanged size is reported as truncated
    pub resend_on_touch: bool,
    /// Emit `NotChanged` for files without changes
    pub send_not_changed: bool,
}

impl Default for FileWatcherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            resend_on_touch: false,
            send_not_changed: false,
        }
    }
}

pub struct FileWatcher {
    scanner: Scanner,
    config: FileWatcherConfig,
    source_id: SourceIdFn,
    prev: BTreeMap<PathBuf, FileDescriptor>,
    /// Bytes ingested by harvesters that closed, keyed by source ID
    closed_harvesters: Arc<Mutex<HashMap<String, u64>>>,
    status_tx: BoundedSender<HarvesterStatus>,
    status_rx: Option<BoundedReceiver<HarvesterStatus>>,
    trigger: Option<NativeTrigger>,
}

impl FileWatcher {
    pub fn new(scanner: Scanner, config: FileWatcherConfig, source_id: SourceIdFn) -> Self {
        let (status_tx, status_rx) = bounded_channel::bounded(STATUS_CHANNEL_SIZE);
        Self {
            scanner,
            config,
            source_id,
            prev: BTreeMap::new(),
            closed_harvesters: Arc::new(Mutex::new(HashMap::new())),
            status_tx,
            status_rx: Some(status_rx),
            trigger: None,
        }
    }

    /// Rescan early whenever the trigger fires.
    pub fn with_trigger(mut self, trigger: Option<NativeTrigger>) -> Self {
        self.trigger = trigger;
        self
    }

    /// Channel on which harvesters report the size they reached when closing.
    pub fn status_sender(&self) -> BoundedSender<HarvesterStatus> {
        self.status_tx.clone()
    }

    pub fn patterns(&self) -> &[String] {
        self.scanner.patterns()
    }

    pub fn scanner(&self) -> &Scanner {
        &self.scanner
    }

    /// Files currently matching the configured paths, without touching the
    /// snapshot used for diffing.
    pub fn get_files(&self) -> BTreeMap<PathBuf, FileDescriptor> {
        self.scanner.scan()
    }

    /// Record the number of bytes a closed harvester ingested.
    pub fn record_closed(&self, status: HarvesterStatus) {
        record(&self.closed_harvesters, status);
    }

    /// Emit events on `events` until `cancel` fires.
    ///
    /// The event channel is expected to be unbuffered: the scan loop stalls
    /// until the consumer takes each event.
    pub async fn run(mut self, cancel: CancellationToken, events: BoundedSender<FsEvent>) {
        info!(patterns = ?self.scanner.patterns(), interval = ?self.config.interval, "File watcher started");

        if let Some(mut status_rx) = self.status_rx.take() {
            let closed = self.closed_harvesters.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    select! {
                        _ = cancel.cancelled() => return,
                        status = status_rx.next() => match status {
                            Some(status) => record(&closed, status),
                            None => return,
                        },
                    }
                }
            });
        }

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let scan = {
                let changed = async {
                    match &self.trigger {
                        Some(trigger) => trigger.changed().await,
                        None => std::future::pending().await,
                    }
                };
                select! {
                    biased;
                    _ = cancel.cancelled() => false,
                    _ = interval.tick() => true,
                    _ = changed => true,
                }
            };
            if !scan {
                break;
            }

            for event in self.scan() {
                select! {
                    _ = cancel.cancelled() => {
                        debug!("File watcher cancelled while sending events");
                        return;
                    }
                    res = events.send(event) => {
                        if res.is_err() {
                            debug!("Event channel closed, stopping file watcher");
                            return;
                        }
                    }
                }
            }
        }

        debug!("File watcher stopped");
    }

    /// Take a new snapshot and diff it against the previous one.
    ///
    /// Events come out as in-place changes, then deletes, then renames, then creates.
    pub fn scan(&mut self) -> Vec<FsEvent> {
        let mut paths = self.scanner.scan();
        self.diff(&mut paths)
    }

    fn diff(&mut self, paths: &mut BTreeMap<PathBuf, FileDescriptor>) -> Vec<FsEvent> {
        let mut in_place = Vec::new();
        let mut new_by_name: BTreeMap<PathBuf, FileDescriptor> = BTreeMap::new();
        let mut new_by_id: HashMap<String, PathBuf> = HashMap::new();

        let mut closed = match self.closed_harvesters.lock() {
            Ok(closed) => closed,
            Err(poisoned) => poisoned.into_inner(),
        };

        for (path, fd) in paths.iter() {
            let Some(mut prev) = self.prev.remove(path) else {
                new_by_name.insert(path.clone(), fd.clone());
                new_by_id.insert(fd.file_id(), path.clone());
                continue;
            };
            if !same_file(&prev, fd) {
                // Another file took the path, the old one is handled as leftover
                self.prev.insert(path.clone(), prev);
                new_by_name.insert(path.clone(), fd.clone());
                new_by_id.insert(fd.file_id(), path.clone());
                continue;
            }

            let src_id = (self.source_id)(&FsEvent::from_descriptor(path, fd.clone()));
            if let Some(size) = closed.get(&src_id) {
                prev.set_bytes_ingested(*size);
            }

            let op = if prev.info.size > fd.info.size {
                Some(Operation::Truncate)
            } else if prev.info.size == fd.info.size && prev.info.mod_time != fd.info.mod_time {
                self.config.resend_on_touch.then_some(Operation::Truncate)
            } else if prev.size_or_bytes_ingested() < fd.info.size {
                Some(Operation::Write)
            } else if self.config.send_not_changed {
                Some(Operation::NotChanged)
            } else {
                None
            };

            let event = match op {
                Some(Operation::Truncate) => FsEvent::truncate(path, fd.clone(), src_id),
                Some(Operation::Write) => FsEvent::write(path, fd.clone(), src_id),
                Some(Operation::NotChanged) => FsEvent::not_changed(path, fd.clone(), src_id),
                _ => continue,
            };
            // The harvester restarts from its cursor, no need to remember the close
            closed.remove(&event.src_id);
            in_place.push(event);
        }

        let mut deletes = Vec::new();
        let mut renames = Vec::new();
        for (old_path, prev) in std::mem::take(&mut self.prev) {
            let id = prev.file_id();
            match new_by_id.remove(&id) {
                Some(new_path) => {
                    let Some(fd) = new_by_name.remove(&new_path) else {
                        continue;
                    };
                    let mut event = FsEvent::rename(&old_path, &new_path, fd, String::new());
                    event.src_id = (self.source_id)(&event);
                    renames.push(event);
                }
                None => {
                    let mut event = FsEvent::delete(&old_path, prev, String::new());
                    event.src_id = (self.source_id)(&event);
                    closed.remove(&event.src_id);
                    deletes.push(event);
                }
            }
        }

        let mut creates = Vec::new();
        for (path, fd) in new_by_name {
            if fd.info.size == 0 {
                warn!(path = ?path, "File has no content yet, skipping");
                paths.remove(&path);
                continue;
            }
            let mut event = FsEvent::create(&path, fd, String::new());
            event.src_id = (self.source_id)(&event);
            creates.push(event);
        }
        drop(closed);

        debug!(
            changed = in_place.len(),
            removed = deletes.len(),
            renamed = renames.len(),
            created = creates.len(),
            "File scan complete"
        );

        self.prev = paths.clone();

        let mut events = in_place;
        events.extend(deletes);
        events.extend(renames);
        events.extend(creates);
        events
    }
}

fn record(closed: &Mutex<HashMap<String, u64>>, status: HarvesterStatus) {
    let mut closed = match closed.lock() {
        Ok(closed) => closed,
        Err(poisoned) => poisoned.into_inner(),
    };
    debug!(source_file = %status.id, size = status.size, "Harvester closed");
    closed.insert(status.id, status.size);
}
