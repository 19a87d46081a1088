// SPDX-License-Identifier: Apache-2.0

//! Prospector aware of copy-truncate rotation.
//!
//! A rotation tool copies `app.log` to `app.log.1` and truncates `app.log`.
//! The copy holds the bytes the harvester of `app.log` was reading, so the
//! cursor of `app.log` is continued on the copy instead of reading the copy
//! from the start. The truncate of `app.log` restarts its harvester from
//! offset zero. A scan reports the truncate before the copy; the copy then
//! continues from the cursor `app.log` had before the restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::file::FileProspector;
use super::sorter::{RotatedFileSorter, build_sorter};
use super::{EventHandler, FileMeta, Prospector, run_events};
use crate::config::RotationConfig;
use crate::error::{Error, Result};
use crate::harvester::HarvesterGroup;
use crate::identity::FileSource;
use crate::store::{SourceStore, StateMetadataUpdater};
use crate::watcher::{FsEvent, Operation, Scanner};

/// A rotated copy of an original file
#[derive(Debug, Clone)]
pub struct RotatedFile {
    pub path: PathBuf,
    pub src: FileSource,
    /// Position among the other copies, smaller is older
    pub sort_key: Option<i64>,
}

#[derive(Debug, Clone)]
struct OriginalFile {
    src: FileSource,
    /// Oldest first
    rotated: Vec<RotatedFile>,
}

/// Bookkeeping of original files and their rotated copies, keyed by the
/// path of the original.
#[derive(Debug, Default)]
pub struct RotatedFiles {
    table: HashMap<PathBuf, OriginalFile>,
}

impl RotatedFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `path` as an original. Returns false if it was already tracked,
    /// in which case its source is refreshed.
    pub fn add_original(&mut self, path: &Path, src: FileSource) -> bool {
        match self.table.get_mut(path) {
            Some(original) => {
                original.src = src;
                false
            }
            None => {
                self.table.insert(
                    path.to_path_buf(),
                    OriginalFile {
                        src,
                        rotated: Vec::new(),
                    },
                );
                true
            }
        }
    }

    /// Track a rotated copy of `original`. Returns false if the copy was
    /// already known or the original is not tracked.
    pub fn add_rotated(
        &mut self,
        original: &Path,
        file: RotatedFile,
        sorter: &dyn RotatedFileSorter,
    ) -> bool {
        let Some(entry) = self.table.get_mut(original) else {
            return false;
        };
        if let Some(known) = entry.rotated.iter_mut().find(|r| r.path == file.path) {
            known.src = file.src;
            return false;
        }
        entry.rotated.push(file);
        sorter.sort(&mut entry.rotated);
        true
    }

    pub fn original_source(&self, original: &Path) -> Option<&FileSource> {
        self.table.get(original).map(|o| &o.src)
    }

    /// Paths of the copies of `original`, oldest first.
    pub fn rotated_paths(&self, original: &Path) -> Vec<PathBuf> {
        self.table
            .get(original)
            .map(|o| o.rotated.iter().map(|r| r.path.clone()).collect())
            .unwrap_or_default()
    }

    pub fn is_original(&self, path: &Path) -> bool {
        self.table.contains_key(path)
    }

    pub fn remove_original(&mut self, original: &Path) {
        self.table.remove(original);
    }

    pub fn remove_rotated(&mut self, original: &Path, rotated: &Path) {
        if let Some(entry) = self.table.get_mut(original) {
            entry.rotated.retain(|r| r.path != rotated);
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

pub struct CopyTruncateProspector {
    plain: FileProspector,
    /// Describes originals that were never seen by the watcher
    scanner: Option<Scanner>,
    suffix: Regex,
    sorter: Box<dyn RotatedFileSorter>,
    rotated: RotatedFiles,
}

impl CopyTruncateProspector {
    pub fn new(plain: FileProspector, rotation: &RotationConfig) -> Result<Self> {
        let suffix = Regex::new(&rotation.suffix_regex)?;
        let sorter = build_sorter(&rotation.sort)?;
        let scanner = plain.watcher().map(|w| w.scanner().clone());
        debug!(suffix = %suffix, sort = sorter.name(), "Copy-truncate rotation enabled");
        Ok(Self {
            plain,
            scanner,
            suffix,
            sorter,
            rotated: RotatedFiles::new(),
        })
    }

    pub fn rotated_files(&self) -> &RotatedFiles {
        &self.rotated
    }

    #[cfg(test)]
    fn with_scanner(mut self, scanner: Scanner) -> Self {
        self.scanner = Some(scanner);
        self
    }

    /// Split a rotated path into the path of its original and the suffix.
    fn split_rotated(&self, path: &Path) -> Option<(PathBuf, String)> {
        let name = path.to_str()?;
        let found = self.suffix.find(name)?;
        if found.start() == 0 {
            return None;
        }
        Some((
            PathBuf::from(&name[..found.start()]),
            found.as_str().to_string(),
        ))
    }

    /// Source of an original file only known by its path.
    fn stat_original(&self, path: &Path) -> Result<FileSource> {
        let scanner = self
            .scanner
            .as_ref()
            .ok_or_else(|| Error::ResourceNotFound(path.display().to_string()))?;
        let fd = scanner.describe_file(path)?;
        Ok(self.plain.source_for(path, &fd))
    }

    fn on_rotated(
        &mut self,
        event: FsEvent,
        src: FileSource,
        original: PathBuf,
        suffix: String,
        updater: &dyn StateMetadataUpdater,
        group: &dyn HarvesterGroup,
    ) {
        let path = event.new_path.clone().unwrap_or_default();
        let source_file = event.src_id.as_str();

        let original_src = match self.rotated.original_source(&original) {
            Some(known) => known.clone(),
            None => match self.stat_original(&original) {
                Ok(original_src) => {
                    self.rotated.add_original(&original, original_src.clone());
                    original_src
                }
                Err(e) => {
                    warn!(
                        source_file,
                        original = ?original,
                        error = %e,
                        "Original of rotated file not found, harvesting it as a new file"
                    );
                    self.plain.handle(event, src, updater, group);
                    return;
                }
            },
        };

        if matches!(event.op, Operation::Create | Operation::Archived) {
            let meta = FileMeta::new(path.display().to_string(), self.plain.settings().identifier.name());
            if let Err(e) = updater.update_metadata(&src, meta.to_value()) {
                error!(source_file, error = %e, "Failed to set cursor metadata");
            }
        }

        let rotated = RotatedFile {
            path: path.clone(),
            src: src.clone(),
            sort_key: self.sorter.key(&suffix),
        };
        if self.rotated.add_rotated(&original, rotated, self.sorter.as_ref()) {
            debug!(source_file, original = ?original, rotated = ?path, "Continuing original file on rotated copy");
            group.continue_from(original_src, src);
        } else {
            group.start(src);
        }
    }

    fn on_original_truncated(&self, event: &FsEvent, src: FileSource, group: &dyn HarvesterGroup) {
        // A truncated source is read from offset 0 anyway. The stored offset
        // stays, the group carries it to a copy reported after the restart.
        debug!(source_file = %event.src_id, path = ?event.new_path, "Original file truncated, restarting from the beginning");
        group.restart(src);
    }
}

impl EventHandler for CopyTruncateProspector {
    fn on_event(
        &mut self,
        event: FsEvent,
        updater: &dyn StateMetadataUpdater,
        group: &dyn HarvesterGroup,
    ) {
        let src = self.plain.settings().identifier.get_source(&event);
        match event.op {
            Operation::Create | Operation::Archived | Operation::Write | Operation::NotChanged => {
                let path = event.new_path.clone().unwrap_or_default();
                match self.split_rotated(&path) {
                    Some((original, suffix)) => {
                        self.on_rotated(event, src, original, suffix, updater, group)
                    }
                    None => {
                        self.rotated.add_original(&path, src.clone());
                        self.plain.handle(event, src, updater, group);
                    }
                }
            }
            Operation::Truncate => {
                let path = event.new_path.clone().unwrap_or_default();
                if self.rotated.is_original(&path) {
                    self.on_original_truncated(&event, src, group);
                } else {
                    self.plain.handle(event, src, updater, group);
                }
            }
            Operation::Delete => {
                let path = event.old_path.clone().unwrap_or_default();
                match self.split_rotated(&path) {
                    Some((original, _)) => self.rotated.remove_rotated(&original, &path),
                    None => self.rotated.remove_original(&path),
                }
                self.plain.handle(event, src, updater, group);
            }
            Operation::Rename | Operation::Done => self.plain.handle(event, src, updater, group),
        }
    }
}

impl Prospector for CopyTruncateProspector {
    fn init(&mut self, store: &SourceStore, global: &SourceStore) -> Result<()> {
        self.plain.init(store, global)
    }

    fn run(
        mut self: Box<Self>,
        cancel: CancellationToken,
        updater: Arc<dyn StateMetadataUpdater>,
        group: Arc<dyn HarvesterGroup>,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let Some(watcher) = self.plain.take_watcher() else {
                error!("Prospector started without a file watcher");
                return;
            };
            run_events(self.as_mut(), watcher, cancel, updater, group).await;
        })
    }

    fn test(&self) -> Result<()> {
        self.plain.test()
    }
}
