//! Coordination event stream
//!
//! The shared context can report what happens to the tree on an unbounded
//! channel. Sending never blocks and never fails an operation: once the
//! stream is dropped, events are discarded.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use crate::context::ContextScope;
use crate::task::TaskState;

/// Something that changed in the shared context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinationEvent {
    AgentRegistered {
        agent_id: String,
        parent_id: Option<String>,
    },
    AgentUnregistered {
        agent_id: String,
        /// Every removed agent, descendants first
        removed: Vec<String>,
        purged_entries: usize,
    },
    ContextUpdated {
        key: String,
        owner_id: String,
        scope: ContextScope,
        created: bool,
    },
    ContextDeleted {
        key: String,
        owner_id: String,
    },
    MessageSent {
        sender_id: String,
        receiver_id: Option<String>,
        message_type: String,
    },
    TaskCreated {
        task_id: String,
        context_id: String,
    },
    TaskUpdated {
        task_id: String,
        from: TaskState,
        to: TaskState,
    },
}

/// Sending half held by the shared context
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: mpsc::UnboundedSender<CoordinationEvent>,
}

impl EventSink {
    pub(crate) fn emit(&self, event: CoordinationEvent) {
        // A closed stream just means nobody is listening
        let _ = self.tx.send(event);
    }
}

/// Receiving half handed to the host.
///
/// Events arrive in the order their changes were applied to the shared
/// context, across all threads.
#[derive(Debug, Clone)]
pub struct EventStream {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<CoordinationEvent>>>,
}

impl EventStream {
    pub(crate) fn new() -> (EventSink, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            EventSink { tx },
            Self {
                rx: Arc::new(Mutex::new(rx)),
            },
        )
    }

    /// Try to receive an event (non-blocking)
    pub fn try_recv(&self) -> Option<CoordinationEvent> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    /// Wait for the next event. `None` once the shared context is gone.
    pub async fn recv(&self) -> Option<CoordinationEvent> {
        self.rx.lock().await.recv().await
    }

    /// Everything buffered right now
    pub fn drain(&self) -> Vec<CoordinationEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_and_try_recv() {
        let (sink, stream) = EventStream::new();
        sink.emit(CoordinationEvent::TaskCreated {
            task_id: "t".into(),
            context_id: "c".into(),
        });

        assert!(matches!(
            stream.try_recv(),
            Some(CoordinationEvent::TaskCreated { .. })
        ));
        assert!(stream.try_recv().is_none());
    }

    #[test]
    fn test_emit_after_stream_dropped() {
        let (sink, stream) = EventStream::new();
        drop(stream);
        sink.emit(CoordinationEvent::ContextDeleted {
            key: "k".into(),
            owner_id: "a".into(),
        });
    }

    #[tokio::test]
    async fn test_recv_ends_when_sink_dropped() {
        let (sink, stream) = EventStream::new();
        sink.emit(CoordinationEvent::AgentRegistered {
            agent_id: "a".into(),
            parent_id: None,
        });
        drop(sink);

        assert!(stream.recv().await.is_some());
        assert!(stream.recv().await.is_none());
    }

    #[test]
    fn test_event_serialization_tag() {
        let event = CoordinationEvent::TaskUpdated {
            task_id: "t".into(),
            from: TaskState::Pending,
            to: TaskState::InProgress,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "task_updated");
        assert_eq!(json["to"], "in-progress");
    }
}
