//! In-process observer bus for collection outcomes.
//!
//! The dispatcher publishes; the progress reporter, tests, and any future
//! metric shippers subscribe. Delivery is lossy by design: a lagging
//! subscriber is skipped rather than ever blocking collection.

use std::fmt;

use lexcrawl_model::DocumentId;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::classify::Verdict;
use crate::gates::FailureReason;

/// One observable moment in a collection run.
#[derive(Debug, Clone)]
pub enum CollectEvent {
    DocumentSucceeded {
        document_id: DocumentId,
        correlation_id: Uuid,
        byte_size: u64,
        version: i32,
    },
    DocumentDuplicate {
        document_id: DocumentId,
        correlation_id: Uuid,
    },
    DocumentSkipped {
        document_id: DocumentId,
        verdict: Verdict,
    },
    DocumentFailed {
        document_id: DocumentId,
        correlation_id: Uuid,
        reason: FailureReason,
        attempts: u32,
    },
    CheckpointWritten {
        processed: u64,
    },
    RunPaused {
        free_bytes: u64,
        min_free_bytes: u64,
    },
}

/// Broadcast fan-out of [`CollectEvent`]s to in-process observers.
pub struct CollectEventBus {
    sender: broadcast::Sender<CollectEvent>,
    capacity: usize,
}

impl fmt::Debug for CollectEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl CollectEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CollectEvent> {
        self.sender.subscribe()
    }

    /// Fire-and-forget: an event with no subscribers is simply dropped.
    pub fn publish(&self, event: CollectEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for CollectEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_fan_out_to_subscribers() {
        let bus = CollectEventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(CollectEvent::CheckpointWritten { processed: 42 });

        match rx.recv().await.unwrap() {
            CollectEvent::CheckpointWritten { processed } => {
                assert_eq!(processed, 42);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_a_no_op() {
        let bus = CollectEventBus::new(8);
        bus.publish(CollectEvent::RunPaused {
            free_bytes: 1,
            min_free_bytes: 2,
        });
    }
}
