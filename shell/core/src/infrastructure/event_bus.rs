// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Sandbox Events
//
// In-memory fan-out of sandbox audit events using tokio broadcast channels.
// Subscribers are the CLI (`lhtml serve --events`) and tests; events are not
// persisted and slow receivers lose the oldest events.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::chroot_fs::EventPublisher;
use crate::domain::document::DocumentId;
use crate::domain::events::SandboxEvent;

/// A sandbox event tagged with the document it happened in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentEvent {
    pub document_id: DocumentId,
    pub event: SandboxEvent,
}

/// Event bus for publishing and subscribing to sandbox events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<DocumentEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    /// Capacity determines how many events can be buffered before dropping old ones
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish(&self, document_id: DocumentId, event: SandboxEvent) {
        debug!(document_id = %document_id, kind = event.kind(), "Publishing sandbox event");

        let receiver_count = self
            .sender
            .send(DocumentEvent { document_id, event })
            .unwrap_or(0);
        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to events from every document
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
            document_id: None,
        }
    }

    /// Subscribe to the events of a single document
    pub fn subscribe_document(&self, document_id: DocumentId) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
            document_id: Some(document_id),
        }
    }

    /// Publisher handle that tags every event with `document_id`
    pub fn publisher_for(&self, document_id: DocumentId) -> Arc<dyn EventPublisher> {
        Arc::new(EventBusPublisher {
            bus: self.clone(),
            document_id,
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Receiver for sandbox events, optionally filtered to one document
pub struct EventReceiver {
    receiver: broadcast::Receiver<DocumentEvent>,
    document_id: Option<DocumentId>,
}

impl EventReceiver {
    /// Receive the next matching event
    pub async fn recv(&mut self) -> Result<DocumentEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(|e| match e {
                broadcast::error::RecvError::Closed => EventBusError::Closed,
                broadcast::error::RecvError::Lagged(n) => {
                    warn!("Event receiver lagged by {} events", n);
                    EventBusError::Lagged(n)
                }
            })?;

            if self.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// Try to receive a matching event without blocking
    pub fn try_recv(&mut self) -> Result<DocumentEvent, EventBusError> {
        loop {
            let event = self.receiver.try_recv().map_err(|e| match e {
                broadcast::error::TryRecvError::Empty => EventBusError::Empty,
                broadcast::error::TryRecvError::Closed => EventBusError::Closed,
                broadcast::error::TryRecvError::Lagged(n) => {
                    warn!("Event receiver lagged by {} events", n);
                    EventBusError::Lagged(n)
                }
            })?;

            if self.matches(&event) {
                return Ok(event);
            }
        }
    }

    fn matches(&self, event: &DocumentEvent) -> bool {
        self.document_id.is_none_or(|id| id == event.document_id)
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

struct EventBusPublisher {
    bus: EventBus,
    document_id: DocumentId,
}

#[async_trait]
impl EventPublisher for EventBusPublisher {
    async fn publish_sandbox_event(&self, event: SandboxEvent) {
        self.bus.publish(self.document_id, event);
    }
}
