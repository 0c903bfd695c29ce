//! Broadcast collaborator: fire-and-forget domain events

use caryatid_sdk::Context;
use dexwatch_common::{messages::Message, DexEvent};
use std::sync::{Arc, Mutex};
use tracing::warn;

pub trait Broadcaster: Send + Sync {
    /// Must never block or fail the caller
    fn publish(&self, event: DexEvent);
}

/// Publishes events on the message bus from a detached task
pub struct BusBroadcaster {
    context: Arc<Context<Message>>,
    topic: String,
}

impl BusBroadcaster {
    pub fn new(context: Arc<Context<Message>>, topic: impl Into<String>) -> Self {
        Self {
            context,
            topic: topic.into(),
        }
    }
}

impl Broadcaster for BusBroadcaster {
    fn publish(&self, event: DexEvent) {
        let context = self.context.clone();
        let topic = self.topic.clone();
        tokio::spawn(async move {
            if let Err(e) = context.publish(&topic, Arc::new(Message::DexEvent(event))).await {
                warn!("Failed to publish DEX event on {topic}: {e:#}");
            }
        });
    }
}

pub struct NullBroadcaster;

impl Broadcaster for NullBroadcaster {
    fn publish(&self, _event: DexEvent) {}
}

/// Keeps every published event, for inspection
#[derive(Default)]
pub struct RecordingBroadcaster {
    events: Mutex<Vec<DexEvent>>,
}

impl RecordingBroadcaster {
    pub fn events(&self) -> Vec<DexEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }
}

impl Broadcaster for RecordingBroadcaster {
    fn publish(&self, event: DexEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
