//! Typed publish/subscribe for client and stream events.

use std::fmt;

use tokio::sync::broadcast;

use crate::model::{Flow, User};
use crate::stream::StreamMessage;

const DEFAULT_CAPACITY: usize = 1024;

/// Broadcast emitter. `emit` never waits; lagging receivers skip events.
#[derive(Debug)]
pub struct EventEmitter<E: Clone> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone> EventEmitter<E> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Returns the number of receivers that got the event.
    pub fn emit(&self, event: E) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<E: Clone> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Background task that reported a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSource {
    FlowUpdater,
    UserUpdater,
    Stream,
}

impl fmt::Display for TaskSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::FlowUpdater => "flow-updater",
            Self::UserUpdater => "user-updater",
            Self::Stream => "stream",
        })
    }
}

/// Events published by [`crate::FlowdockClient`]. Entity payloads are
/// snapshots taken at emission time.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    JoinedFlow(Flow),
    JoinedFlows(Vec<Flow>),
    LeftFlow(Flow),
    LeftFlows(Vec<Flow>),
    FlowsRefreshed,
    UsersRefreshed,
    NewUsers(Vec<User>),
    Message(StreamMessage),
    Error { source: TaskSource, message: String },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinedFlow(_) => "joined-flow",
            Self::JoinedFlows(_) => "joined-flows",
            Self::LeftFlow(_) => "left-flow",
            Self::LeftFlows(_) => "left-flows",
            Self::FlowsRefreshed => "flows-refreshed",
            Self::UsersRefreshed => "users-refreshed",
            Self::NewUsers(_) => "new-users",
            Self::Message(_) => "message",
            Self::Error { .. } => "error",
        }
    }

    pub fn error(source: TaskSource, error: impl fmt::Display) -> Self {
        Self::Error {
            source,
            message: error.to_string(),
        }
    }
}
