// SPDX-License-Identifier: Apache-2.0

//! Output pipeline contract.
//!
//! Harvesters publish [`Event`]s through a [`Client`]. Each event may carry
//! a cursor update that must only become durable once the output has
//! acknowledged the event; acknowledgements flow back through an
//! [`AckHandler`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::select;
use tokio_util::sync::CancellationToken;

use crate::bounded_channel::{BoundedReceiver, BoundedSender, bounded};
use crate::error::{Error, Result};
use crate::store::UpdateOp;
use crate::update_writer::UpdateScheduler;

/// A record produced by a harvester.
#[derive(Debug)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub fields: Map<String, Value>,
    /// Cursor update applied once the event is acknowledged
    pub private: Option<UpdateOp>,
}

impl Event {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self {
            timestamp: Utc::now(),
            fields,
            private: None,
        }
    }

    /// The event as a single JSON document with an `@timestamp` field.
    pub fn to_json(&self) -> Value {
        let mut doc = Map::with_capacity(self.fields.len() + 1);
        doc.insert(
            "@timestamp".to_string(),
            Value::String(self.timestamp.to_rfc3339()),
        );
        for (k, v) in &self.fields {
            doc.insert(k.clone(), v.clone());
        }
        Value::Object(doc)
    }
}

/// Turns acknowledged events into scheduled cursor updates.
#[derive(Clone)]
pub struct AckHandler {
    scheduler: UpdateScheduler,
}

impl AckHandler {
    pub fn new(scheduler: UpdateScheduler) -> Self {
        Self { scheduler }
    }

    /// Handle the update operations of a batch of acknowledged events, in
    /// publish order. Operations of the same key are folded into the last one.
    pub fn ack(&self, ops: impl IntoIterator<Item = UpdateOp>) {
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut batch: Vec<(UpdateOp, u64)> = Vec::new();
        for op in ops {
            match index.get(op.key()) {
                Some(&i) => {
                    std::mem::replace(&mut batch[i].0, op).absorb();
                    batch[i].1 += 1;
                }
                None => {
                    index.insert(op.key().to_string(), batch.len());
                    batch.push((op, 1));
                }
            }
        }
        for (op, n) in batch {
            self.scheduler.schedule(op, n);
        }
    }
}

pub struct ClientConfig {
    /// Publishing gives up once this token is cancelled
    pub cancel: CancellationToken,
    pub ack_handler: AckHandler,
}

/// Connection of one harvester to the output.
pub trait Client: Send + Sync {
    fn publish(&self, event: Event) -> BoxFuture<'_, Result<()>>;

    fn close(&self);
}

pub trait Pipeline: Send + Sync {
    fn connect(&self, config: ClientConfig) -> Result<Box<dyn Client>>;
}

/// An event handed to the consumer of a [`ChannelPipeline`].
pub struct Delivery {
    pub event: Event,
    ack_handler: AckHandler,
}

impl Delivery {
    /// Acknowledge this event.
    pub fn ack(self) {
        let Delivery { event, ack_handler } = self;
        ack_handler.ack(event.private);
    }

    /// Acknowledge a batch of events at once.
    pub fn ack_all(deliveries: impl IntoIterator<Item = Delivery>) {
        let mut handler = None;
        let mut ops = Vec::new();
        for delivery in deliveries {
            if let Some(op) = delivery.event.private {
                ops.push(op);
            }
            handler.get_or_insert(delivery.ack_handler);
        }
        if let Some(handler) = handler {
            handler.ack(ops);
        }
    }
}

/// In-process pipeline delivering events over a bounded channel.
#[derive(Clone)]
pub struct ChannelPipeline {
    tx: BoundedSender<Delivery>,
}

impl ChannelPipeline {
    pub fn new(capacity: usize) -> (Self, BoundedReceiver<Delivery>) {
        let (tx, rx) = bounded(capacity);
        (Self { tx }, rx)
    }
}

impl Pipeline for ChannelPipeline {
    fn connect(&self, config: ClientConfig) -> Result<Box<dyn Client>> {
        if self.tx.is_disconnected() {
            return Err(Error::ChannelSend);
        }
        Ok(Box::new(ChannelClient {
            tx: self.tx.clone(),
            config,
            closed: AtomicBool::new(false),
        }))
    }
}

struct ChannelClient {
    tx: BoundedSender<Delivery>,
    config: ClientConfig,
    closed: AtomicBool,
}

impl Client for ChannelClient {
    fn publish(&self, event: Event) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::ChannelSend);
            }
            let delivery = Delivery {
                event,
                ack_handler: self.config.ack_handler.clone(),
            };
            select! {
                biased;

                _ = self.config.cancel.cancelled() => Err(Error::Cancelled),
                res = self.tx.send(delivery) => res.map_err(|_| Error::ChannelSend),
            }
        })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
