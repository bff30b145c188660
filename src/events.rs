//! Topic-scoped event broadcast.
//!
//! Ingestion progress fans out per area; chat streaming events fan out per
//! chat. Delivery is at-most-once to currently-subscribed listeners: there
//! is no persistence, no replay, and publishing to a topic nobody listens on
//! is a no-op. A slow subscriber that lags past the channel capacity loses
//! the oldest events, never blocks the publisher.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::Message;

/// A broadcast scope. Ingestion events go to the owning area's topic; chat
/// turn events go to the chat's topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Area(String),
    Chat(String),
}

/// An event as delivered to subscribers (and serialized verbatim onto
/// WebSocket connections).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Ingestion progress for one document, scoped to its area.
    DocumentProgress {
        document_id: String,
        status: String,
        progress: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A user message was persisted.
    UserMessage { message: Message },
    /// One readable fragment of an in-flight assistant answer.
    AssistantToken { chat_id: String, text: String },
    /// The assistant answer was finalized and persisted.
    AssistantMessage { message: Message },
    /// A chat turn failed; no assistant message was persisted.
    StreamError { chat_id: String, error: String },
}

pub struct EventHub {
    topics: Mutex<HashMap<Topic, broadcast::Sender<Event>>>,
    capacity: usize,
}

impl EventHub {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            topics: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        })
    }

    /// Publish an event to a topic. Fire-and-forget: never blocks, never
    /// fails the caller. Topics whose last subscriber has gone away are
    /// pruned on the next publish.
    pub fn publish(&self, topic: &Topic, event: Event) {
        let mut topics = self.topics.lock().expect("event hub lock poisoned");
        if let Some(sender) = topics.get(topic) {
            if sender.send(event).is_err() {
                topics.remove(topic);
            }
        }
    }

    /// Subscribe to a topic, creating it on first use.
    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<Event> {
        let mut topics = self.topics.lock().expect("event hub lock poisoned");
        topics
            .entry(topic)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }
}
