// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use thiserror::Error;

use crate::watcher::WatcherError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Duplicate input ID '{0}', every input must have a unique ID")]
    DuplicateInputId(String),

    #[error("Unknown file identity '{0}'")]
    UnknownIdentifier(String),

    #[error("Unknown watcher kind '{0}'")]
    UnknownWatcher(String),

    #[error("Invalid glob pattern: {0}")]
    InvalidGlob(String),

    #[error("Regex error: {0}")]
    Regex(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Watcher error: {0}")]
    Watcher(#[from] WatcherError),

    #[error("Channel send error")]
    ChannelSend,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("File {path:?} was truncated: size {size} is smaller than offset {offset}")]
    FileTruncated {
        path: PathBuf,
        size: u64,
        offset: u64,
    },

    #[error("File {path:?} is {size} bytes, at least {min_size} bytes are required for fingerprinting")]
    FileTooSmall {
        path: PathBuf,
        size: u64,
        min_size: u64,
    },

    #[error("Harvester error: {0}")]
    Harvester(String),
}

impl From<regex::Error> for Error {
    fn from(e: regex::Error) -> Self {
        Error::Regex(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
