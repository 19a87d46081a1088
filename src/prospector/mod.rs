// SPDX-License-Identifier: Apache-2.0

//! Prospectors turn file watcher events into harvester decisions.
//!
//! The plain [`FileProspector`] starts a harvester for every new or growing
//! file. The [`CopyTruncateProspector`] additionally recognizes files rotated
//! by copying and truncating the original, and continues the original's
//! cursor on the rotated copy.

mod copytruncate;
mod file;
mod sorter;

pub use copytruncate::{CopyTruncateProspector, RotatedFile, RotatedFiles};
pub use file::FileProspector;
pub use sorter::{DateSorter, NumericSorter, RotatedFileSorter, build_sorter};

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bounded_channel;
use crate::config::{IgnoreInactive, InputConfig, TakeOverConfig};
use crate::error::Result;
use crate::harvester::HarvesterGroup;
use crate::identity::{FileIdentifier, IdentifierRegistry};
use crate::store::{SourceStore, StateMetadataUpdater};
use crate::watcher::{FileWatcher, FsEvent, Operation};

/// Metadata stored next to the cursor of every source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Last known path of the file
    pub source: String,
    /// Name of the file identity that produced the registry key
    pub identifier_name: String,
}

impl FileMeta {
    pub fn new(source: impl Into<String>, identifier_name: &str) -> Self {
        Self {
            source: source.into(),
            identifier_name: identifier_name.to_string(),
        }
    }

    /// Decode metadata read from the store. `None` for missing or malformed entries.
    pub fn from_value(value: Option<&Value>) -> Option<Self> {
        serde_json::from_value(value?.clone()).ok()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

pub trait Prospector: Send {
    /// Reconcile the registry with the files currently on disk before
    /// any harvester runs.
    fn init(&mut self, store: &SourceStore, global: &SourceStore) -> Result<()>;

    /// Process watcher events until cancelled, then stop all harvesters.
    fn run(
        self: Box<Self>,
        cancel: CancellationToken,
        updater: Arc<dyn StateMetadataUpdater>,
        group: Arc<dyn HarvesterGroup>,
    ) -> BoxFuture<'static, ()>;

    /// Check the prospector can run with its configuration.
    fn test(&self) -> Result<()>;
}

/// Behaviour shared by the plain and copy-truncate prospectors
#[derive(Clone)]
pub struct ProspectorSettings {
    pub identifier: Arc<dyn FileIdentifier>,
    /// Used to recompute keys of previous file identities
    pub identifiers: IdentifierRegistry,
    pub ignore_older: Option<Duration>,
    pub ignore_inactive: Option<IgnoreInactive>,
    pub clean_removed: bool,
    pub close_removed: bool,
    pub close_renamed: bool,
    pub take_over: TakeOverConfig,
}

impl ProspectorSettings {
    pub fn from_config(
        cfg: &InputConfig,
        identifier: Arc<dyn FileIdentifier>,
        identifiers: IdentifierRegistry,
    ) -> Self {
        Self {
            identifier,
            identifiers,
            ignore_older: cfg.ignore_older(),
            ignore_inactive: cfg.ignore_inactive,
            clean_removed: cfg.clean_removed,
            close_removed: cfg.close.on_state_change.removed,
            close_renamed: cfg.close.on_state_change.renamed,
            take_over: cfg.take_over.clone(),
        }
    }
}

/// Build the prospector matching `cfg`: copy-truncate aware when rotation
/// is configured, plain otherwise.
pub fn build(
    cfg: &InputConfig,
    settings: ProspectorSettings,
    watcher: FileWatcher,
) -> Result<Box<dyn Prospector>> {
    match &cfg.rotation {
        Some(rotation) => Ok(Box::new(CopyTruncateProspector::new(
            FileProspector::new(settings, watcher),
            rotation,
        )?)),
        None => Ok(Box::new(FileProspector::new(settings, watcher))),
    }
}

/// Reacts to single watcher events.
pub(crate) trait EventHandler: Send {
    fn on_event(
        &mut self,
        event: FsEvent,
        updater: &dyn StateMetadataUpdater,
        group: &dyn HarvesterGroup,
    );
}

/// Drive `handler` with the events of `watcher` until cancelled.
pub(crate) async fn run_events<H: EventHandler>(
    handler: &mut H,
    watcher: FileWatcher,
    cancel: CancellationToken,
    updater: Arc<dyn StateMetadataUpdater>,
    group: Arc<dyn HarvesterGroup>,
) {
    debug!("Starting prospector");

    // Harvesters notify the watcher when they close
    group.set_observer(watcher.status_sender());

    let (events_tx, mut events_rx) = bounded_channel::bounded(0);
    let watcher_cancel = cancel.child_token();
    let watcher_task = tokio::spawn(watcher.run(watcher_cancel.clone(), events_tx));

    loop {
        let event = select! {
            biased;

            _ = cancel.cancelled() => break,
            event = events_rx.next() => match event {
                Some(event) => event,
                // The watcher is gone, nothing else will arrive
                None => FsEvent::done(),
            },
        };
        if event.op == Operation::Done {
            break;
        }
        handler.on_event(event, updater.as_ref(), group.as_ref());
    }

    watcher_cancel.cancel();
    group.stop_harvesters().await;
    if let Err(e) = watcher_task.await {
        warn!(error = %e, "File watcher task failed");
    }
    debug!("Prospector has stopped");
}
