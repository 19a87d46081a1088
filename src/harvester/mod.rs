// SPDX-License-Identifier: Apache-2.0

//! Harvesters read sources and publish their content.
//!
//! The [`HarvesterCoordinator`] guarantees that at most one harvester runs per
//! source, owns the source's resource for the harvester's lifetime and hands
//! it a [`Cursor`] and a [`Publisher`].

mod group;
mod log_file;
mod pipeline;
mod publisher;
mod reader;

pub use group::{CoordinatorSettings, HarvesterCoordinator, HarvesterGroup, ReaderGroup};
pub use log_file::{HarvesterSettings, LogFileHarvester};
pub use pipeline::{AckHandler, ChannelPipeline, Client, ClientConfig, Delivery, Event, Pipeline};
pub use publisher::Publisher;
pub use reader::{Batch, Line, LineReader};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::identity::FileSource;
use crate::store::Cursor;

/// Cursor of a file source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    #[serde(default)]
    pub offset: u64,
    /// A compressed file was read completely
    #[serde(default)]
    pub eof: bool,
}

/// Per-run context handed to a harvester.
#[derive(Debug, Clone)]
pub struct HarvesterContext {
    /// Store key of the source
    pub id: String,
    pub input_id: String,
    /// Cancelled when the harvester must stop
    pub cancel: CancellationToken,
}

pub trait Harvester: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Check that `src` can be harvested.
    fn test(&self, src: &FileSource) -> Result<()>;

    /// Read `src` until done or cancelled.
    fn run<'a>(
        &'a self,
        ctx: HarvesterContext,
        src: FileSource,
        cursor: Cursor,
        publisher: &'a Publisher,
    ) -> BoxFuture<'a, Result<()>>;
}
