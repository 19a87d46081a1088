// SPDX-License-Identifier: Apache-2.0

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use tracing::warn;

use super::{Capability, FileIdentifier, FileSource, INODE_MARKER};
use crate::error::{Error, Result};
use crate::watcher::FsEvent;

#[derive(Debug, Default)]
struct MarkerCache {
    content: String,
    mod_time: Option<SystemTime>,
}

/// Identity made of the inode and the content of a marker file.
///
/// Inodes are reused across container or VM boundaries, the marker content
/// (typically a volume or host ID) tells them apart. The marker is re-read
/// only when its modification time moves forward.
#[derive(Debug)]
pub struct InodeMarkerIdentifier {
    marker_path: PathBuf,
    cache: Mutex<MarkerCache>,
}

impl InodeMarkerIdentifier {
    pub fn new(marker_path: PathBuf) -> Result<Self> {
        if !cfg!(unix) {
            return Err(Error::Config(
                "file_identity inode_marker is only supported on Unix".to_string(),
            ));
        }

        let identifier = Self {
            marker_path,
            cache: Mutex::new(MarkerCache::default()),
        };
        // Fail at construction if the marker cannot be read at all
        let (content, mod_time) = read_marker(&identifier.marker_path).map_err(|e| {
            Error::Config(format!(
                "cannot read inode marker {:?}: {}",
                identifier.marker_path, e
            ))
        })?;
        if let Ok(mut cache) = identifier.cache.lock() {
            cache.content = content;
            cache.mod_time = Some(mod_time);
        }
        Ok(identifier)
    }

    fn marker_content(&self) -> String {
        let mut cache = match self.cache.lock() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mod_time = match fs::metadata(&self.marker_path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(e) => {
                warn!(path = ?self.marker_path, error = %e, "Failed to stat inode marker, using cached value");
                return cache.content.clone();
            }
        };

        if cache.mod_time.is_none_or(|cached| mod_time > cached) {
            match read_marker(&self.marker_path) {
                Ok((content, t)) => {
                    cache.content = content;
                    cache.mod_time = Some(t);
                }
                Err(e) => {
                    warn!(path = ?self.marker_path, error = %e, "Failed to read inode marker, using cached value");
                }
            }
        }

        cache.content.clone()
    }
}

fn read_marker(path: &Path) -> std::io::Result<(String, SystemTime)> {
    let mod_time = fs::metadata(path)?.modified()?;
    let content = fs::read_to_string(path)?;
    Ok((content.trim().to_string(), mod_time))
}

impl FileIdentifier for InodeMarkerIdentifier {
    fn get_source(&self, event: &FsEvent) -> FileSource {
        let identity = format!(
            "{}-{}",
            event.descriptor.info.file_id.ino(),
            self.marker_content()
        );
        FileSource::from_event(INODE_MARKER, &identity, event)
    }

    fn name(&self) -> &'static str {
        INODE_MARKER
    }

    fn supports(&self, capability: Capability) -> bool {
        matches!(capability, Capability::TrackRename)
    }
}
