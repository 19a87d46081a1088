// SPDX-License-Identifier: Apache-2.0

//! File discovery and change detection.
//!
//! The [`Scanner`] produces a snapshot of all files matching the configured
//! globs. The [`FileWatcher`] diffs consecutive snapshots and emits one
//! [`FsEvent`] per changed path. Scans run on a fixed interval; in native
//! mode OS notifications additionally trigger an early rescan:
//! - **Native**: inotify on Linux, FSEvents on macOS, ReadDirectoryChangesW on Windows.
//! - **Poll**: interval only. Use this for network file systems (NFS).
//!
//! `auto` tries native notifications first and falls back to polling.

mod event;
mod file_watcher;
mod native;
mod scanner;

pub use event::{FileDescriptor, FileInfo, FsEvent, HarvesterStatus, Operation, same_file};
pub use file_watcher::{FileWatcher, FileWatcherConfig, SourceIdFn};
pub use native::NativeTrigger;
pub use scanner::{Scanner, ScannerSettings};

use std::fmt;

use serde::Deserialize;

/// Error type for watcher operations
#[derive(Debug)]
pub enum WatcherError {
    /// Failed to initialize the notification backend
    Init(String),
    /// Failed to watch a path
    Watch(String),
    /// IO error
    Io(std::io::Error),
}

impl fmt::Display for WatcherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatcherError::Init(msg) => write!(f, "watcher initialization failed: {}", msg),
            WatcherError::Watch(msg) => write!(f, "watch failed: {}", msg),
            WatcherError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for WatcherError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatcherError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for WatcherError {
    fn from(e: std::io::Error) -> Self {
        WatcherError::Io(e)
    }
}

/// Watch mode configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    /// Tries native notifications first, falls back to polling on failure.
    #[default]
    Auto,
    /// Force native notifications. Fails if they are not supported.
    Native,
    /// Scan on the check interval only.
    #[serde(alias = "polling")]
    Poll,
}

impl std::str::FromStr for WatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(WatchMode::Auto),
            "native" => Ok(WatchMode::Native),
            "poll" | "polling" => Ok(WatchMode::Poll),
            _ => Err(format!(
                "Invalid watch mode '{}'. Valid options: auto, native, poll",
                s
            )),
        }
    }
}

/// Build the early-rescan trigger for `mode`.
///
/// Returns `None` in poll mode, or in auto mode when native notifications
/// cannot be set up.
pub fn create_trigger(
    mode: WatchMode,
    patterns: &[String],
) -> Result<Option<NativeTrigger>, WatcherError> {
    match mode {
        WatchMode::Poll => Ok(None),
        WatchMode::Native => NativeTrigger::new(patterns).map(Some),
        WatchMode::Auto => match NativeTrigger::new(patterns) {
            Ok(trigger) => {
                tracing::info!(backend = trigger.backend_name(), "Using native file system notifications");
                Ok(Some(trigger))
            }
            Err(e) => {
                tracing::warn!(
                    "Native file watching unavailable ({}), falling back to polling",
                    e
                );
                Ok(None)
            }
        },
    }
}
