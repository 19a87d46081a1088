// SPDX-License-Identifier: Apache-2.0

use serde_json::Value;

use super::pipeline::{Client, Event};
use crate::error::Result;
use crate::store::{Cursor, UpdateOp};

/// Publishes events of one harvester, attaching cursor updates to them.
pub struct Publisher {
    client: Box<dyn Client>,
    cursor: Cursor,
}

impl Publisher {
    pub fn new(client: Box<dyn Client>, cursor: Cursor) -> Self {
        Self { client, cursor }
    }

    /// Publish `event`. When `cursor_update` is set, it is applied to the
    /// source's cursor after the output acknowledged the event.
    pub async fn publish(&self, mut event: Event, cursor_update: Option<Value>) -> Result<()> {
        if let Some(update) = cursor_update {
            event.private = Some(UpdateOp::new(&self.cursor, update));
        }
        self.client.publish(event).await
    }

    pub(crate) fn close(&self) {
        self.client.close();
    }
}
