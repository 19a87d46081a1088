// SPDX-License-Identifier: Apache-2.0

//! OS notifications used to trigger an early rescan.
//!
//! Events only wake the scan loop; the snapshot diff stays the single source
//! of truth for what changed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::Notify;

use super::WatcherError;

/// Native file system watcher that signals "something changed".
pub struct NativeTrigger {
    // Kept alive for as long as notifications are wanted
    _watcher: RecommendedWatcher,
    notify: Arc<Notify>,
    watched: Vec<PathBuf>,
}

impl NativeTrigger {
    /// Watch the static directory prefix of every glob pattern.
    pub fn new(patterns: &[String]) -> Result<Self, WatcherError> {
        let notify = Arc::new(Notify::new());
        let signal = notify.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) if is_relevant(&event) => signal.notify_one(),
                Ok(_) => {}
                Err(e) => tracing::warn!("File watcher error: {}", e),
            },
            Config::default(),
        )
        .map_err(|e| WatcherError::Init(e.to_string()))?;

        // A directory is watched recursively if any pattern below it descends
        let mut dirs: BTreeMap<PathBuf, bool> = BTreeMap::new();
        for pattern in patterns {
            let recursive = pattern.contains("**") || has_glob_dir(pattern);
            *dirs.entry(static_prefix(pattern)).or_default() |= recursive;
        }

        let mut watched = Vec::new();
        for (dir, recursive) in dirs {
            if !dir.is_dir() {
                tracing::debug!(path = ?dir, "Directory does not exist yet, relying on scans");
                continue;
            }
            let mode = if recursive {
                RecursiveMode::Recursive
            } else {
                RecursiveMode::NonRecursive
            };
            watcher
                .watch(&dir, mode)
                .map_err(|e| WatcherError::Watch(format!("{}: {}", dir.display(), e)))?;
            watched.push(dir);
        }

        Ok(Self {
            _watcher: watcher,
            notify,
            watched,
        })
    }

    /// Resolves once a change was observed since the last call.
    pub async fn changed(&self) {
        self.notify.notified().await
    }

    pub fn watched(&self) -> &[PathBuf] {
        &self.watched
    }

    /// Get the name of the notification backend for logging.
    pub fn backend_name(&self) -> &'static str {
        #[cfg(target_os = "linux")]
        {
            "inotify"
        }
        #[cfg(target_os = "macos")]
        {
            "FSEvents"
        }
        #[cfg(target_os = "windows")]
        {
            "ReadDirectoryChangesW"
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        {
            "native"
        }
    }
}

fn is_relevant(event: &Event) -> bool {
    !matches!(event.kind, EventKind::Access(_)) && !event.paths.is_empty()
}

fn is_glob(part: &str) -> bool {
    part.chars().any(|c| matches!(c, '*' | '?' | '['))
}

/// Whether a glob metacharacter appears in a directory component.
fn has_glob_dir(pattern: &str) -> bool {
    let path = Path::new(pattern);
    path.parent()
        .map(|dir| dir.components().any(|c| is_glob(&c.as_os_str().to_string_lossy())))
        .unwrap_or(false)
}

/// Longest leading directory of `pattern` without glob metacharacters.
fn static_prefix(pattern: &str) -> PathBuf {
    let mut prefix = PathBuf::new();
    for component in Path::new(pattern).components() {
        if is_glob(&component.as_os_str().to_string_lossy()) {
            return prefix;
        }
        prefix.push(component);
    }
    // No glob at all: watch the parent of the file
    prefix
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_static_prefix() {
        assert_eq!(PathBuf::from("/var/log"), static_prefix("/var/log/*.log"));
        assert_eq!(PathBuf::from("/var/log"), static_prefix("/var/log/**/app.log"));
        assert_eq!(PathBuf::from("/var/log"), static_prefix("/var/log/app.log"));
        assert_eq!(PathBuf::from("/var"), static_prefix("/var/*/app.log"));
    }

    #[tokio::test]
    async fn test_trigger_fires_on_create() {
        let dir = TempDir::new().unwrap();
        let pattern = format!("{}/*.log", dir.path().display());
        let trigger = NativeTrigger::new(&[pattern]).unwrap();
        assert_eq!(1, trigger.watched().len());

        std::fs::write(dir.path().join("new.log"), b"hello\n").unwrap();

        let fired = tokio::time::timeout(Duration::from_secs(5), trigger.changed()).await;
        assert!(fired.is_ok(), "Should observe file creation");
    }

    #[test]
    fn test_missing_directory_is_skipped() {
        let trigger = NativeTrigger::new(&["/does/not/exist/*.log".to_string()]).unwrap();
        assert!(trigger.watched().is_empty());
    }
}
