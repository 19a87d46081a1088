// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use futures::future::BoxFuture;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{EventHandler, FileMeta, Prospector, ProspectorSettings, run_events};
use crate::config::IgnoreInactive;
use crate::error::{Error, Result};
use crate::harvester::HarvesterGroup;
use crate::identity::{Capability, FINGERPRINT, FileSource, NATIVE, PATH};
use crate::store::{SourceStore, StateMetadataUpdater, split_key};
use crate::watcher::{FileDescriptor, FileWatcher, FsEvent, Operation};

type Files = BTreeMap<PathBuf, FileDescriptor>;

/// Starts one harvester per new or growing file.
pub struct FileProspector {
    settings: ProspectorSettings,
    watcher: Option<FileWatcher>,
    /// Files modified before this instant are not harvested
    ignore_since: Option<SystemTime>,
}

impl FileProspector {
    pub fn new(settings: ProspectorSettings, watcher: FileWatcher) -> Self {
        Self {
            settings,
            watcher: Some(watcher),
            ignore_since: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(settings: ProspectorSettings) -> Self {
        Self {
            settings,
            watcher: None,
            ignore_since: None,
        }
    }

    pub fn settings(&self) -> &ProspectorSettings {
        &self.settings
    }

    pub(crate) fn watcher(&self) -> Option<&FileWatcher> {
        self.watcher.as_ref()
    }

    pub(crate) fn take_watcher(&mut self) -> Option<FileWatcher> {
        self.watcher.take()
    }

    #[cfg(test)]
    fn set_ignore_since(&mut self, since: Option<SystemTime>) {
        self.ignore_since = since;
    }

    /// Source of the file at `path` as seen by the configured identity.
    pub(crate) fn source_for(&self, path: &Path, fd: &FileDescriptor) -> FileSource {
        self.settings
            .identifier
            .get_source(&FsEvent::from_descriptor(path, fd.clone()))
    }

    fn meta_for(&self, path: &Path) -> serde_json::Value {
        FileMeta::new(path.display().to_string(), self.settings.identifier.name()).to_value()
    }

    pub(crate) fn init_registry(&mut self, files: &Files, store: &SourceStore, global: &SourceStore) {
        self.ignore_since = match self.settings.ignore_inactive {
            Some(IgnoreInactive::SinceFirstStart) => Some(store.store().first_start().into()),
            Some(IgnoreInactive::SinceLastStart) => Some(store.store().started().into()),
            None => None,
        };

        // Entries written while this input had no ID move under the input's own prefix
        if global.identifier() != store.identifier() {
            let moved = global.update_identifiers(|_key, meta| {
                let mut fm = FileMeta::from_value(meta)?;
                let fd = files.get(Path::new(&fm.source))?;
                let key = store.id(&self.source_for(Path::new(&fm.source), fd));
                fm.identifier_name = self.settings.identifier.name().to_string();
                Some((key, fm.to_value()))
            });
            if moved > 0 {
                info!(moved, "Adopted registry entries of input without ID");
            }
        }

        if self.settings.clean_removed {
            let removed = store.clean_if(|_key, meta| match FileMeta::from_value(meta) {
                Some(fm) => !files.contains_key(Path::new(&fm.source)),
                // Faulty entries go as well
                None => true,
            });
            debug!(removed, "Cleaned registry entries of removed files");
        }

        let identifier_name = self.settings.identifier.name();
        if identifier_name != FINGERPRINT {
            debug!(identity = identifier_name, "Not migrating registry to fingerprint identity");
        } else {
            let migrated = store.update_identifiers(|key, meta| {
                let mut fm = FileMeta::from_value(meta)?;
                let fd = files.get(Path::new(&fm.source))?;
                let old = fm.identifier_name.as_str();
                if old == identifier_name || (old != NATIVE && old != PATH) {
                    return None;
                }
                let Some(old_identifier) = self.settings.identifiers.build_by_name(old) else {
                    error!(
                        old_identity = old,
                        "Previous file identity not available, the file will be read again"
                    );
                    return None;
                };

                // The path may point to another file by now, the old key must match
                let path = Path::new(&fm.source);
                let previous_key =
                    store.id(&old_identifier.get_source(&FsEvent::from_descriptor(path, fd.clone())));
                if previous_key != key {
                    return None;
                }
                let new_key = store.id(&self.source_for(path, fd));
                info!(from = key, to = %new_key, source = %fm.source, "Migrating registry entry to fingerprint identity");
                fm.identifier_name = identifier_name.to_string();
                Some((new_key, fm.to_value()))
            });
            debug!(migrated, "Registry migration to fingerprint identity complete");
        }

        if !self.settings.take_over.enabled {
            return;
        }
        let from_ids = self.settings.take_over.from_ids.clone();
        let taken = store.take_over(&from_ids, |key, meta| {
            let mut fm = FileMeta::from_value(meta)?;
            let fd = files.get(Path::new(&fm.source))?;
            let old = fm.identifier_name.as_str();
            if old != NATIVE && old != PATH && old != FINGERPRINT {
                return None;
            }
            let old_identifier = self.settings.identifiers.build_by_name(old)?;
            let path = Path::new(&fm.source);
            let Some((_, _, identity)) = split_key(key) else {
                error!(key, "Registry key has an unexpected format, cannot take it over");
                return None;
            };
            let previous = old_identifier.get_source(&FsEvent::from_descriptor(path, fd.clone()));
            if previous.name() != identity {
                return None;
            }
            let new_key = store.id(&self.source_for(path, fd));
            info!(from = key, to = %new_key, "Taking over state");
            fm.identifier_name = identifier_name.to_string();
            Some((new_key, fm.to_value()))
        });
        debug!(taken, "Take over complete");
    }

    pub(crate) fn handle(
        &self,
        event: FsEvent,
        src: FileSource,
        updater: &dyn StateMetadataUpdater,
        group: &dyn HarvesterGroup,
    ) {
        let source_file = event.src_id.as_str();
        match event.op {
            Operation::Create
            | Operation::Archived
            | Operation::Write
            | Operation::NotChanged => {
                let path = event.new_path.clone().unwrap_or_default();
                match event.op {
                    Operation::Create | Operation::Archived => {
                        debug!(source_file, path = ?path, "A new file has been found");
                        if let Err(e) = updater.update_metadata(&src, self.meta_for(&path)) {
                            error!(source_file, error = %e, "Failed to set cursor metadata");
                        }
                    }
                    Operation::Write => debug!(source_file, path = ?path, "File has been updated"),
                    _ => debug!(source_file, path = ?path, "File has not changed, trying to start a harvester"),
                }

                if self.is_ignored(&event) {
                    let size = event.descriptor.info.size;
                    if let Err(e) = updater.reset_cursor(&src, json!({"offset": size})) {
                        error!(source_file, error = %e, "Failed to set cursor of ignored file");
                    }
                    return;
                }
                group.start(src);
            }
            Operation::Truncate => {
                debug!(source_file, path = ?event.new_path, "File has been truncated, setting offset to 0");
                if let Err(e) = updater.reset_cursor(&src, json!({"offset": 0})) {
                    error!(source_file, error = %e, "Failed to reset cursor of truncated file");
                }
                group.restart(src);
            }
            Operation::Delete => {
                debug!(source_file, path = ?event.old_path, "File has been removed");
                self.on_remove(&event, &src, updater, group);
            }
            Operation::Rename => {
                debug!(source_file, from = ?event.old_path, to = ?event.new_path, "File has been renamed");
                self.on_rename(&event, src, updater, group);
            }
            Operation::Done => {}
        }
    }

    fn is_ignored(&self, event: &FsEvent) -> bool {
        let mod_time = event.descriptor.info.mod_time;
        if let Some(ignore_older) = self.settings.ignore_older {
            let age = SystemTime::now()
                .duration_since(mod_time)
                .unwrap_or_default();
            if age > ignore_older {
                debug!(path = ?event.new_path, "Ignoring file, ignore_older reached");
                return true;
            }
        }
        if let Some(since) = self.ignore_since {
            if mod_time <= since {
                debug!(path = ?event.new_path, "Ignoring file, not modified since ignore_inactive start");
                return true;
            }
        }
        false
    }

    fn on_remove(
        &self,
        event: &FsEvent,
        src: &FileSource,
        updater: &dyn StateMetadataUpdater,
        group: &dyn HarvesterGroup,
    ) {
        if self.settings.close_removed {
            debug!(source_file = %event.src_id, "Stopping harvester of removed file");
            group.stop(src);
        }
        if self.settings.clean_removed {
            debug!(source_file = %event.src_id, "Removing state of removed file");
            if let Err(e) = updater.remove(src) {
                error!(source_file = %event.src_id, error = %e, "Failed to remove state of removed file");
            }
        }
    }

    fn on_rename(
        &self,
        event: &FsEvent,
        src: FileSource,
        updater: &dyn StateMetadataUpdater,
        group: &dyn HarvesterGroup,
    ) {
        let identifier = &self.settings.identifier;
        let new_path = event.new_path.clone().unwrap_or_default();

        if !identifier.supports(Capability::TrackRename) {
            // The identity is tied to the path, the renamed file is a new source
            let old_path = event.old_path.clone().unwrap_or_default();
            let previous = self.source_for(&old_path, &event.descriptor);
            group.stop(&previous);
            debug!(path = ?old_path, "Removing state of renamed file");
            if let Err(e) = updater.remove(&previous) {
                error!(path = ?old_path, error = %e, "Failed to remove old state of renamed file");
            }
            if let Err(e) = updater.update_metadata(&src, self.meta_for(&new_path)) {
                error!(source_file = %event.src_id, error = %e, "Failed to set cursor metadata");
            }
            group.start(src);
            return;
        }

        let identifier_name = match updater.find_cursor_meta(&src).map(|v| FileMeta::from_value(Some(&v))) {
            Ok(Some(meta)) => meta.identifier_name,
            Ok(None) | Err(_) => {
                warn!(
                    source_file = %event.src_id,
                    identity = identifier.name(),
                    "Cursor metadata not found, using the prospector's file identity"
                );
                identifier.name().to_string()
            }
        };
        let meta = FileMeta::new(new_path.display().to_string(), &identifier_name);
        if let Err(e) = updater.update_metadata(&src, meta.to_value()) {
            error!(source_file = %event.src_id, error = %e, "Failed to update cursor metadata");
        }

        if self.settings.close_renamed {
            debug!(source_file = %event.src_id, "Stopping harvester of renamed file");
            group.stop(&src);
        }
    }
}

impl EventHandler for FileProspector {
    fn on_event(
        &mut self,
        event: FsEvent,
        updater: &dyn StateMetadataUpdater,
        group: &dyn HarvesterGroup,
    ) {
        let src = self.settings.identifier.get_source(&event);
        self.handle(event, src, updater, group);
    }
}

impl Prospector for FileProspector {
    fn init(&mut self, store: &SourceStore, global: &SourceStore) -> Result<()> {
        let files = match &self.watcher {
            Some(watcher) => watcher.get_files(),
            None => Files::new(),
        };
        self.init_registry(&files, store, global);
        Ok(())
    }

    fn run(
        mut self: Box<Self>,
        cancel: CancellationToken,
        updater: Arc<dyn StateMetadataUpdater>,
        group: Arc<dyn HarvesterGroup>,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let Some(watcher) = self.take_watcher() else {
                error!("Prospector started without a file watcher");
                return;
            };
            run_events(self.as_mut(), watcher, cancel, updater, group).await;
        })
    }

    fn test(&self) -> Result<()> {
        match &self.watcher {
            Some(watcher) if !watcher.patterns().is_empty() => Ok(()),
            _ => Err(Error::Config("no paths configured".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InputConfig, TakeOverConfig};
    use crate::identity::{FileId, IdentifierRegistry, SourceIdentifier};
    use crate::persistence::MemoryBackend;
    use crate::prospector::testing::{RecordingGroup, RecordingUpdater, Transition, Update};
    use crate::store::Store;
    use crate::watcher::FileInfo;
    use serde_json::Value;
    use std::time::Duration;

    fn settings(kind: &str) -> ProspectorSettings {
        let identifiers = IdentifierRegistry::with_defaults();
        let identifier = identifiers.build_by_name(kind).unwrap();
        ProspectorSettings::from_config(&InputConfig::default(), identifier, identifiers)
    }

    fn fd(path: &str, ino: u64, size: u64) -> FileDescriptor {
        FileDescriptor::new(path, FileInfo::new(size, SystemTime::now(), FileId::new(1, ino)))
    }

    fn create(path: &str, ino: u64) -> FsEvent {
        FsEvent::create(Path::new(path), fd(path, ino, 10), String::new())
    }

    fn feed(p: &mut FileProspector, events: Vec<FsEvent>) -> (Vec<Transition>, Vec<Update>) {
        let group = RecordingGroup::default();
        let updater = RecordingUpdater::default();
        for event in events {
            p.on_event(event, &updater, &group);
        }
        (group.take(), updater.take())
    }

    #[test]
    fn test_create_starts_harvester_and_records_meta() {
        let mut p = FileProspector::detached(settings(NATIVE));
        let (transitions, updates) = feed(&mut p, vec![create("/var/log/app.log", 7)]);

        assert_eq!(vec![Transition::Start("native::7-1".to_string())], transitions);
        assert_eq!(
            vec![Update::Meta(
                "native::7-1".to_string(),
                FileMeta::new("/var/log/app.log", NATIVE).to_value()
            )],
            updates
        );
    }

    #[test]
    fn test_truncate_resets_cursor_and_restarts() {
        let mut p = FileProspector::detached(settings(NATIVE));
        let event = FsEvent::truncate(Path::new("/var/log/app.log"), fd("/var/log/app.log", 7, 3), String::new());
        let (transitions, updates) = feed(&mut p, vec![event]);

        assert_eq!(vec![Transition::Restart("native::7-1".to_string())], transitions);
        assert_eq!(
            vec![Update::Reset("native::7-1".to_string(), json!({"offset": 0}))],
            updates
        );
    }

    #[test]
    fn test_ignore_older_sets_cursor_to_size() {
        let mut s = settings(NATIVE);
        s.ignore_older = Some(Duration::from_secs(60));
        let mut p = FileProspector::detached(s);

        let mut old = fd("/var/log/old.log", 3, 42);
        old.info.mod_time = SystemTime::now() - Duration::from_secs(3600);
        let event = FsEvent::write(Path::new("/var/log/old.log"), old, String::new());
        let (transitions, updates) = feed(&mut p, vec![event]);

        assert!(transitions.is_empty());
        assert_eq!(
            vec![Update::Reset("native::3-1".to_string(), json!({"offset": 42}))],
            updates
        );
    }

    #[test]
    fn test_ignore_inactive_skips_files_not_modified_since_start() {
        let mut p = FileProspector::detached(settings(NATIVE));
        p.set_ignore_since(Some(SystemTime::now()));

        let mut stale = fd("/var/log/app.log", 7, 5);
        stale.info.mod_time = SystemTime::now() - Duration::from_secs(10);
        let event = FsEvent::not_changed(Path::new("/var/log/app.log"), stale, String::new());
        let (transitions, _) = feed(&mut p, vec![event]);
        assert!(transitions.is_empty());
    }

    #[test]
    fn test_delete_stops_and_removes() {
        let mut p = FileProspector::detached(settings(NATIVE));
        let event = FsEvent::delete(Path::new("/var/log/app.log"), fd("/var/log/app.log", 7, 3), String::new());
        let (transitions, updates) = feed(&mut p, vec![event.clone()]);
        assert_eq!(vec![Transition::Stop("native::7-1".to_string())], transitions);
        assert_eq!(vec![Update::Remove("native::7-1".to_string())], updates);

        let mut s = settings(NATIVE);
        s.clean_removed = false;
        s.close_removed = false;
        let mut p = FileProspector::detached(s);
        let (transitions, updates) = feed(&mut p, vec![event]);
        assert!(transitions.is_empty());
        assert!(updates.is_empty());
    }

    #[test]
    fn test_rename_with_native_identity_updates_meta_only() {
        let mut p = FileProspector::detached(settings(NATIVE));
        let event = FsEvent::rename(
            Path::new("/var/log/app.log"),
            Path::new("/var/log/app.log.1"),
            fd("/var/log/app.log.1", 7, 3),
            String::new(),
        );
        let (transitions, updates) = feed(&mut p, vec![event]);

        assert!(transitions.is_empty());
        assert_eq!(
            vec![Update::Meta(
                "native::7-1".to_string(),
                FileMeta::new("/var/log/app.log.1", NATIVE).to_value()
            )],
            updates
        );
    }

    #[test]
    fn test_rename_with_path_identity_starts_new_source() {
        let mut p = FileProspector::detached(settings(PATH));
        let event = FsEvent::rename(
            Path::new("/var/log/app.log"),
            Path::new("/var/log/app.log.1"),
            fd("/var/log/app.log.1", 7, 3),
            String::new(),
        );
        let (transitions, updates) = feed(&mut p, vec![event]);

        assert_eq!(
            vec![
                Transition::Stop("path::/var/log/app.log".to_string()),
                Transition::Start("path::/var/log/app.log.1".to_string()),
            ],
            transitions
        );
        assert_eq!(Update::Remove("path::/var/log/app.log".to_string()), updates[0]);
    }

    #[test]
    fn test_rename_closes_harvester_when_configured() {
        let mut s = settings(NATIVE);
        s.close_renamed = true;
        let mut p = FileProspector::detached(s);
        let event = FsEvent::rename(
            Path::new("/var/log/a.log"),
            Path::new("/var/log/b.log"),
            fd("/var/log/b.log", 7, 3),
            String::new(),
        );
        let (transitions, _) = feed(&mut p, vec![event]);
        assert_eq!(vec![Transition::Stop("native::7-1".to_string())], transitions);
    }

    fn registry() -> (Store, SourceStore, SourceStore) {
        let store = Store::open("filestream", Arc::new(MemoryBackend::new())).unwrap();
        let own = SourceStore::new(store.clone(), SourceIdentifier::new("filestream", Some("app")));
        let global = SourceStore::new(store.clone(), SourceIdentifier::new("filestream", None));
        (store, own, global)
    }

    fn files(entries: &[(&str, u64, Option<&str>)]) -> Files {
        entries
            .iter()
            .map(|(path, ino, fp)| {
                let mut d = fd(path, *ino, 100);
                if let Some(fp) = fp {
                    d = d.with_fingerprint(*fp);
                }
                (PathBuf::from(path), d)
            })
            .collect()
    }

    fn meta(store: &Store, key: &str) -> Option<Value> {
        store.snapshot(key).and_then(|s| s.meta)
    }

    #[test]
    fn test_init_adopts_entries_of_input_without_id() {
        let (store, own, global) = registry();
        let old_key = "filestream::.global::native::7-1";
        store
            .update_metadata(old_key, FileMeta::new("/var/log/app.log", NATIVE).to_value())
            .unwrap();
        store.reset_cursor(old_key, json!({"offset": 10})).unwrap();

        let mut p = FileProspector::detached(settings(NATIVE));
        p.init_registry(&files(&[("/var/log/app.log", 7, None)]), &own, &global);

        let new_key = "filestream::app::native::7-1";
        assert!(store.find(old_key, false).is_none());
        assert_eq!(Some(json!({"offset": 10})), store.snapshot(new_key).unwrap().cursor);
    }

    #[test]
    fn test_init_cleans_removed_files() {
        let (store, own, global) = registry();
        let gone = "filestream::app::native::8-1";
        let kept = "filestream::app::native::7-1";
        let faulty = "filestream::app::native::9-1";
        store
            .update_metadata(gone, FileMeta::new("/var/log/gone.log", NATIVE).to_value())
            .unwrap();
        store
            .update_metadata(kept, FileMeta::new("/var/log/app.log", NATIVE).to_value())
            .unwrap();
        store.update_metadata(faulty, json!("garbage")).unwrap();

        let mut p = FileProspector::detached(settings(NATIVE));
        p.init_registry(&files(&[("/var/log/app.log", 7, None)]), &own, &global);

        assert!(store.find(gone, false).is_none());
        assert!(store.find(faulty, false).is_none());
        assert!(store.find(kept, false).is_some());
    }

    #[test]
    fn test_init_migrates_native_to_fingerprint() {
        let (store, own, global) = registry();
        let native_key = "filestream::app::native::7-1";
        let stale_key = "filestream::app::native::5-1";
        store
            .update_metadata(native_key, FileMeta::new("/var/log/app.log", NATIVE).to_value())
            .unwrap();
        store.reset_cursor(native_key, json!({"offset": 33})).unwrap();
        // The path now points at another inode, this entry must not move
        store
            .update_metadata(stale_key, FileMeta::new("/var/log/other.log", NATIVE).to_value())
            .unwrap();

        let mut p = FileProspector::detached(settings(FINGERPRINT));
        p.init_registry(
            &files(&[("/var/log/app.log", 7, Some("abc")), ("/var/log/other.log", 6, Some("def"))]),
            &own,
            &global,
        );

        let fp_key = "filestream::app::fingerprint::abc";
        assert_eq!(Some(json!({"offset": 33})), store.snapshot(fp_key).unwrap().cursor);
        assert_eq!(
            Some(FileMeta::new("/var/log/app.log", FINGERPRINT).to_value()),
            meta(&store, fp_key)
        );
        assert!(store.find(native_key, false).is_none());
        assert!(store.find(stale_key, false).is_some());
        assert!(store.find("filestream::app::fingerprint::def", false).is_none());
    }

    #[test]
    fn test_init_takes_over_states() {
        let (store, own, global) = registry();
        let foreign = "filestream::legacy::native::7-1";
        store
            .update_metadata(foreign, FileMeta::new("/var/log/app.log", NATIVE).to_value())
            .unwrap();
        store.reset_cursor(foreign, json!({"offset": 5})).unwrap();

        let mut s = settings(NATIVE);
        s.take_over = TakeOverConfig {
            enabled: true,
            from_ids: vec!["legacy".to_string()],
        };
        let mut p = FileProspector::detached(s);
        p.init_registry(&files(&[("/var/log/app.log", 7, None)]), &own, &global);

        assert!(store.find(foreign, false).is_none());
        assert_eq!(
            Some(json!({"offset": 5})),
            store.snapshot("filestream::app::native::7-1").unwrap().cursor
        );
    }
}
