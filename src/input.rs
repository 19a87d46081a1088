// SPDX-License-Identifier: Apache-2.0

//! Wires the configured inputs to one shared registry.
//!
//! Every input gets its own scanner, watcher, prospector and harvester
//! coordinator. The registry [`Store`], the [`UpdateWriter`] and the
//! [`Cleaner`] are shared by all inputs so states can move between them.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::cleaner::Cleaner;
use crate::config::{Config, InputConfig, ensure_unique_ids};
use crate::error::{Error, Result};
use crate::harvester::{
    AckHandler, CoordinatorSettings, HarvesterCoordinator, HarvesterGroup, HarvesterSettings,
    LogFileHarvester, Pipeline,
};
use crate::identity::{FileIdentifier, IdentifierRegistry, SourceIdentifier};
use crate::persistence::JsonFileDatabase;
use crate::prospector::{self, Prospector, ProspectorSettings};
use crate::store::{SourceStore, StateMetadataUpdater, Store};
use crate::update_writer::{UpdateWriter, UpdateWriterConfig};
use crate::watcher::{
    FileWatcher, FileWatcherConfig, FsEvent, Scanner, ScannerSettings, SourceIdFn, create_trigger,
};

/// Input type prefixing every registry key
pub const INPUT_TYPE: &str = "filestream";

/// A fully wired input, ready to run
struct Input {
    id: String,
    prospector: Box<dyn Prospector>,
    store: SourceStore,
    coordinator: HarvesterCoordinator,
}

pub struct InputManager {
    config: Config,
    identifiers: IdentifierRegistry,
    pipeline: Arc<dyn Pipeline>,
}

impl InputManager {
    /// Validate `config` and prepare its inputs. Events are published to `pipeline`.
    pub fn new(config: Config, pipeline: Arc<dyn Pipeline>) -> Result<Self> {
        config.validate().map_err(Error::Config)?;
        ensure_unique_ids(&config.inputs)?;
        Ok(Self {
            config,
            identifiers: IdentifierRegistry::with_defaults(),
            pipeline,
        })
    }

    /// Replace the file identities available to inputs.
    pub fn with_identifiers(mut self, identifiers: IdentifierRegistry) -> Self {
        self.identifiers = identifiers;
        self
    }

    /// Check that every input can be built and run with its configuration.
    pub fn test(&self) -> Result<()> {
        for cfg in &self.config.inputs {
            let identifier = self.identifiers.build(&cfg.file_identity)?;
            let own = SourceStore::new(
                Store::open(INPUT_TYPE, Arc::new(JsonFileDatabase::open_memory().store(INPUT_TYPE)))?,
                SourceIdentifier::new(INPUT_TYPE, cfg.id.as_deref()),
            );
            let watcher = self.build_watcher(cfg, &own, identifier.clone(), false)?;
            let settings = ProspectorSettings::from_config(cfg, identifier, self.identifiers.clone());
            prospector::build(cfg, settings, watcher)?.test()?;
        }
        Ok(())
    }

    /// Run every input until `cancel` fires.
    ///
    /// Harvesters are stopped before the update writer, which then flushes the
    /// acknowledged updates that are still scheduled.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let registry = &self.config.registry;
        let db = JsonFileDatabase::open(&registry.path)?;
        let store = Store::open(INPUT_TYPE, Arc::new(db.store(INPUT_TYPE)))?;
        info!(path = ?registry.path, entries = store.len(), "Opened registry");

        let (writer, scheduler) = UpdateWriter::new(
            store.clone(),
            UpdateWriterConfig {
                flush_timeout: registry.flush_timeout(),
            },
        );
        let ack_handler = AckHandler::new(scheduler);

        let inputs_cancel = cancel.child_token();
        let mut inputs = Vec::with_capacity(self.config.inputs.len());
        for cfg in &self.config.inputs {
            let mut input = self.build_input(cfg, &store, ack_handler.clone(), &inputs_cancel)?;
            let global = SourceStore::new(store.clone(), SourceIdentifier::new(INPUT_TYPE, None));
            input.prospector.init(&input.store, &global)?;
            inputs.push(input);
        }

        // Writer and cleaner outlive the inputs
        let background_cancel = CancellationToken::new();
        let mut background = JoinSet::new();
        background.spawn(writer.run(background_cancel.clone()));
        background.spawn(
            Cleaner::new(store.clone(), registry.cleanup_interval()).run(background_cancel.clone()),
        );

        let mut running = JoinSet::new();
        for input in inputs {
            info!(input = %input.id, harvester = input.coordinator.harvester_name(), "Starting input");
            let updater: Arc<dyn StateMetadataUpdater> = Arc::new(input.store);
            let group: Arc<dyn HarvesterGroup> = Arc::new(input.coordinator);
            let id = input.id;
            let fut = input.prospector.run(inputs_cancel.clone(), updater, group);
            running.spawn(async move {
                fut.await;
                debug!(input = %id, "Input stopped");
            });
        }

        while let Some(res) = running.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "Input task failed");
                inputs_cancel.cancel();
            }
        }

        background_cancel.cancel();
        while let Some(res) = background.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "Registry task failed");
            }
        }

        if let Err(e) = db.flush() {
            error!(error = %e, "Failed to flush registry on shutdown");
        }
        info!("All inputs stopped");
        Ok(())
    }

    fn build_input(
        &self,
        cfg: &InputConfig,
        store: &Store,
        ack_handler: AckHandler,
        cancel: &CancellationToken,
    ) -> Result<Input> {
        let identifier = self.identifiers.build(&cfg.file_identity)?;
        let own = SourceStore::new(store.clone(), SourceIdentifier::new(INPUT_TYPE, cfg.id.as_deref()));

        let watcher = self.build_watcher(cfg, &own, identifier.clone(), true)?;
        let settings = ProspectorSettings::from_config(cfg, identifier, self.identifiers.clone());
        let prospector = prospector::build(cfg, settings, watcher)?;

        let harvester = Arc::new(LogFileHarvester::new(HarvesterSettings::from_config(cfg)));
        let coordinator = HarvesterCoordinator::new(
            CoordinatorSettings {
                input_id: cfg.display_id().to_string(),
                clean_inactive: cfg.clean_inactive(),
                harvester_limit: cfg.harvester_limit,
            },
            harvester,
            self.pipeline.clone(),
            own.clone(),
            ack_handler,
            cancel,
        );

        Ok(Input {
            id: cfg.display_id().to_string(),
            prospector,
            store: own,
            coordinator,
        })
    }

    fn build_watcher(
        &self,
        cfg: &InputConfig,
        own: &SourceStore,
        identifier: Arc<dyn FileIdentifier>,
        notifications: bool,
    ) -> Result<FileWatcher> {
        let scanner = Scanner::new(
            &cfg.paths,
            ScannerSettings::from_config(&cfg.scanner, cfg.compression)?,
        )?;
        let trigger = if notifications {
            create_trigger(cfg.scanner.watch_mode, scanner.patterns())?
        } else {
            None
        };

        let source_store = own.clone();
        let source_id: SourceIdFn = Arc::new(move |event: &FsEvent| source_store.id(&identifier.get_source(event)));

        let watcher_config = FileWatcherConfig {
            interval: cfg.scanner.check_interval(),
            resend_on_touch: cfg.scanner.resend_on_touch,
            // Idle files must be revisited to be deleted once fully acknowledged
            send_not_changed: cfg.delete.enabled,
        };
        Ok(FileWatcher::new(scanner, watcher_config, source_id).with_trigger(trigger))
    }
}
