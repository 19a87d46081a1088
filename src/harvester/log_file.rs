// SPDX-License-Identifier: Apache-2.0

//! Default harvester: tails a plain or gzip compressed log file line by line.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{Map, Value, json};
use tokio::select;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::pipeline::Event;
use super::publisher::Publisher;
use super::reader::LineReader;
use super::{FileState, Harvester, HarvesterContext};
use crate::config::InputConfig;
use crate::error::{Error, Result};
use crate::identity::FileSource;
use crate::store::Cursor;

// Attribute key constants to avoid per-line allocations
const ATTR_MESSAGE: &str = "message";
const ATTR_LOG_OFFSET: &str = "log.offset";
const ATTR_LOG_FILE_PATH: &str = "log.file.path";
const ATTR_LOG_FLAGS: &str = "log.flags";
const ATTR_INPUT_ID: &str = "input.id";

/// Maximum number of lines read in one blocking call
const READ_BATCH_LINES: usize = 512;

const REMOVE_ATTEMPTS: usize = 5;
const REMOVE_BACKOFF: Duration = Duration::from_secs(2);

/// Settings of the [`LogFileHarvester`]
#[derive(Debug, Clone)]
pub struct HarvesterSettings {
    pub input_id: String,
    /// Lines longer than this are cut
    pub max_bytes: usize,
    pub backoff_init: Duration,
    pub backoff_max: Duration,
    /// Close when nothing was read for this long
    pub close_inactive: Option<Duration>,
    /// Close when the end of the file is reached
    pub close_on_eof: bool,
    /// Close after running this long
    pub close_after_interval: Option<Duration>,
    /// Grace period before deleting a completely read file, `None` never deletes
    pub delete_grace_period: Option<Duration>,
    /// How often the file is checked while waiting to delete it
    pub check_interval: Duration,
}

impl Default for HarvesterSettings {
    fn default() -> Self {
        Self::from_config(&InputConfig::default())
    }
}

impl HarvesterSettings {
    pub fn from_config(cfg: &InputConfig) -> Self {
        let close = &cfg.close;
        let non_zero = |ms: u64| (ms > 0).then(|| Duration::from_millis(ms));
        Self {
            input_id: cfg.display_id().to_string(),
            max_bytes: cfg.max_bytes,
            backoff_init: Duration::from_millis(cfg.backoff.init_ms),
            backoff_max: Duration::from_millis(cfg.backoff.max_ms),
            close_inactive: non_zero(close.on_state_change.inactive_ms),
            close_on_eof: close.reader.on_eof,
            close_after_interval: non_zero(close.reader.after_interval_ms),
            delete_grace_period: cfg
                .delete
                .enabled
                .then(|| Duration::from_millis(cfg.delete.grace_period_ms)),
            check_interval: cfg.scanner.check_interval(),
        }
    }
}

/// Why reading stopped at the end of the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EofOutcome {
    Done,
    Inactive,
}

pub struct LogFileHarvester {
    settings: HarvesterSettings,
}

impl LogFileHarvester {
    pub fn new(settings: HarvesterSettings) -> Self {
        Self { settings }
    }

    async fn harvest(
        &self,
        ctx: HarvesterContext,
        src: FileSource,
        cursor: Cursor,
        publisher: &Publisher,
    ) -> Result<()> {
        let path = source_path(&src)?;
        let gzip = src.descriptor.gzip;

        let state = if cursor.is_new() || src.truncated {
            FileState::default()
        } else {
            match cursor.unpack::<FileState>() {
                Ok(state) => state.unwrap_or_default(),
                Err(e) => {
                    warn!(source_file = %ctx.id, error = %e, "Failed to decode cursor, reading from start");
                    FileState::default()
                }
            }
        };
        if state.eof {
            info!(source_file = %ctx.id, path = ?path, "File was already read completely");
            return Ok(());
        }

        let max_bytes = self.settings.max_bytes;
        let open_path = path.clone();
        let (mut reader, truncated) = tokio::task::spawn_blocking(move || {
            LineReader::open(open_path, state.offset, gzip, max_bytes)
        })
        .await
        .map_err(|e| Error::Harvester(e.to_string()))??;
        if truncated {
            info!(source_file = %ctx.id, path = ?path, offset = state.offset, "File is smaller than the stored offset, reading from start");
        }
        debug!(source_file = %ctx.id, path = ?path, offset = reader.offset(), "Started reading file");

        let started = Instant::now();
        let mut last_data = Instant::now();
        let mut backoff = self.settings.backoff_init;

        loop {
            if ctx.cancel.is_cancelled() {
                return Ok(());
            }
            if let Some(after) = self.settings.close_after_interval {
                if started.elapsed() >= after {
                    info!(source_file = %ctx.id, "Reader closed after configured interval");
                    return Ok(());
                }
            }

            let (returned, result) = tokio::task::spawn_blocking(move || {
                let result = reader.read_batch(READ_BATCH_LINES);
                (reader, result)
            })
            .await
            .map_err(|e| Error::Harvester(e.to_string()))?;
            reader = returned;

            let batch = match result {
                Ok(batch) => batch,
                Err(Error::FileTruncated { size, offset, .. }) => {
                    info!(source_file = %ctx.id, path = ?path, size, offset, "File was truncated");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            if !batch.lines.is_empty() {
                last_data = Instant::now();
                backoff = self.settings.backoff_init;

                let count = batch.lines.len();
                let mut offset = reader.offset() - batch.lines.iter().map(|l| l.bytes).sum::<u64>();
                for (i, line) in batch.lines.into_iter().enumerate() {
                    let start = offset;
                    offset += line.bytes;
                    let eof = gzip && batch.eof && i + 1 == count;

                    let mut fields = Map::new();
                    fields.insert(ATTR_MESSAGE.to_string(), Value::String(line.content));
                    fields.insert(ATTR_LOG_OFFSET.to_string(), json!(start));
                    fields.insert(
                        ATTR_LOG_FILE_PATH.to_string(),
                        Value::String(path.display().to_string()),
                    );
                    if line.truncated {
                        fields.insert(ATTR_LOG_FLAGS.to_string(), json!(["truncated"]));
                    }
                    fields.insert(ATTR_INPUT_ID.to_string(), Value::String(ctx.input_id.clone()));

                    publisher
                        .publish(Event::new(fields), Some(json!({"offset": offset, "eof": eof})))
                        .await?;
                }
            }

            if !batch.eof {
                continue;
            }

            let outcome = if src.archived || gzip || self.settings.close_on_eof {
                Some(EofOutcome::Done)
            } else if self
                .settings
                .close_inactive
                .is_some_and(|inactive| last_data.elapsed() >= inactive)
            {
                Some(EofOutcome::Inactive)
            } else {
                None
            };

            if let Some(outcome) = outcome {
                debug!(source_file = %ctx.id, ?outcome, offset = reader.offset(), "Reached end of file");
                if let Some(grace) = self.settings.delete_grace_period {
                    self.delete_when_done(&ctx, &path, &cursor, gzip, grace).await?;
                }
                return Ok(());
            }

            select! {
                biased;

                _ = ctx.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.settings.backoff_max);
        }
    }

    /// Remove `path` once every event was acknowledged and the file did not
    /// change for the grace period.
    async fn delete_when_done(
        &self,
        ctx: &HarvesterContext,
        path: &Path,
        cursor: &Cursor,
        gzip: bool,
        grace: Duration,
    ) -> Result<()> {
        let check_interval = self.settings.check_interval;

        while !cursor.all_events_published() {
            select! {
                biased;

                _ = ctx.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(check_interval) => {}
            }
        }

        // A compressed file is read in decompressed bytes, compare against its size on disk instead
        let expected = if gzip {
            match file_size(path).await? {
                Some(size) => size,
                None => return Ok(()),
            }
        } else {
            cursor.offset()
        };

        let deadline = Instant::now() + grace;
        loop {
            match file_size(path).await? {
                None => {
                    debug!(source_file = %ctx.id, path = ?path, "File is already gone");
                    return Ok(());
                }
                Some(size) if size != expected => {
                    info!(source_file = %ctx.id, path = ?path, size, expected, "File changed during grace period, not removing it");
                    return Ok(());
                }
                Some(_) => {}
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            select! {
                biased;

                _ = ctx.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(check_interval.min(deadline - now)) => {}
            }
        }

        for attempt in 1..=REMOVE_ATTEMPTS {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {
                    info!(source_file = %ctx.id, path = ?path, "Removed file after reading it completely");
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) => {
                    warn!(source_file = %ctx.id, path = ?path, attempt, error = %e, "Failed to remove file");
                }
            }
            if attempt < REMOVE_ATTEMPTS {
                select! {
                    biased;

                    _ = ctx.cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(REMOVE_BACKOFF) => {}
                }
            }
        }
        Err(Error::Harvester(format!(
            "could not remove {} after {} attempts",
            path.display(),
            REMOVE_ATTEMPTS
        )))
    }
}

impl Harvester for LogFileHarvester {
    fn name(&self) -> &str {
        "filestream"
    }

    fn test(&self, src: &FileSource) -> Result<()> {
        let path = source_path(src)?;
        std::fs::File::open(path)?;
        Ok(())
    }

    fn run<'a>(
        &'a self,
        ctx: HarvesterContext,
        src: FileSource,
        cursor: Cursor,
        publisher: &'a Publisher,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.harvest(ctx, src, cursor, publisher))
    }
}

fn source_path(src: &FileSource) -> Result<PathBuf> {
    src.path()
        .cloned()
        .ok_or_else(|| Error::Harvester(format!("source {} has no path", src)))
}

async fn file_size(path: &Path) -> Result<Option<u64>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
