//! Live event stream bound to a set of flows.
//!
//! A [`StreamSession`] owns at most one open connection. Frames are turned
//! into [`Message`]s against the entity cache and broadcast as
//! [`StreamEvent`]s. When the connection fails the session emits an error
//! and reconnects with the same binding right away; if re-opening fails it
//! keeps trying every `reconnect_delay` (never less than
//! [`MIN_PERIOD`](crate::periodic::MIN_PERIOD))
//! until it succeeds or is told to disconnect.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::cache::EntityCache;
use crate::error::ClientResult;
use crate::events::EventEmitter;
use crate::ids::FlowId;
use crate::model::{Message, MessageKind};
use crate::periodic::at_least_min;
use crate::transport::{ConnectionHandle, StreamFrame, StreamTransport, TransportError};

/// A decoded frame: the resolved message alongside the raw payload.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    pub kind: MessageKind,
    pub message: Message,
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Message(StreamMessage),
    Error(String),
}

/// Subscription that only yields messages of one kind.
#[derive(Debug)]
pub struct KindSubscription {
    kind: MessageKind,
    receiver: broadcast::Receiver<StreamEvent>,
}

impl KindSubscription {
    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    /// Next matching message, or `None` once the session is gone.
    pub async fn recv(&mut self) -> Option<StreamMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(StreamEvent::Message(message)) if message.kind == self.kind => {
                    return Some(message)
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, kind = %self.kind, "stream subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

struct ActiveConnection {
    pump: JoinHandle<()>,
    handle: ConnectionHandle,
}

impl ActiveConnection {
    fn close(self) {
        self.pump.abort();
        self.handle.end();
    }
}

#[derive(Default)]
struct SessionState {
    /// Explicit flow ids, or `None` for every cached flow at connect time
    binding: Option<Vec<FlowId>>,
    /// Ids the current connection was opened with
    bound: Vec<FlowId>,
    /// Whether the session should be connected at all
    desired: bool,
    /// Bumped on every connect, reconnect and disconnect. Tasks from an
    /// older generation stand down.
    generation: u64,
    active: Option<ActiveConnection>,
    healer: Option<JoinHandle<()>>,
}

impl SessionState {
    fn teardown(&mut self) {
        if let Some(healer) = self.healer.take() {
            healer.abort();
        }
        if let Some(active) = self.active.take() {
            active.close();
        }
    }
}

struct StreamInner {
    transport: Arc<dyn StreamTransport>,
    cache: Arc<RwLock<EntityCache>>,
    events: EventEmitter<StreamEvent>,
    reconnect_delay: Duration,
    state: Mutex<SessionState>,
}

#[derive(Clone)]
pub struct StreamSession {
    inner: Arc<StreamInner>,
}

impl StreamSession {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        cache: Arc<RwLock<EntityCache>>,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                transport,
                cache,
                events: EventEmitter::new(),
                reconnect_delay: at_least_min("stream-reconnect", reconnect_delay),
                state: Mutex::new(SessionState::default()),
            }),
        }
    }

    /// Every message and error.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.inner.events.subscribe()
    }

    pub fn subscribe_kind(&self, kind: MessageKind) -> KindSubscription {
        KindSubscription {
            kind,
            receiver: self.inner.events.subscribe(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().active.is_some()
    }

    pub fn bound_flows(&self) -> Vec<FlowId> {
        self.inner.lock().bound.clone()
    }

    /// Replace any existing connection with one bound to `flows`, or to all
    /// cached flows when `None`. Returns the ids actually bound.
    pub async fn connect(&self, flows: Option<Vec<FlowId>>) -> ClientResult<Vec<FlowId>> {
        let generation = {
            let mut state = self.inner.lock();
            state.teardown();
            state.generation += 1;
            state.desired = true;
            state.binding = flows;
            state.generation
        };
        StreamInner::attach(&self.inner, generation).await
    }

    /// Drop the current connection and open a fresh one in the background
    /// with the same binding.
    pub fn reconnect(&self) {
        let mut state = self.inner.lock();
        state.teardown();
        state.generation += 1;
        state.desired = true;
        let generation = state.generation;
        state.healer = Some(tokio::spawn(heal(Arc::downgrade(&self.inner), generation)));
        debug!(generation, "stream reconnect scheduled");
    }

    /// Close the connection and stop any pending reconnect. Safe to call
    /// when nothing is open.
    pub fn disconnect(&self) {
        let mut state = self.inner.lock();
        state.desired = false;
        state.generation += 1;
        if state.active.is_some() {
            info!("stream disconnected");
        }
        state.teardown();
    }
}

impl StreamInner {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        let state = self.lock();
        state.desired && state.generation == generation
    }

    async fn attach(inner: &Arc<Self>, generation: u64) -> ClientResult<Vec<FlowId>> {
        let binding = inner.lock().binding.clone();
        let flows = match binding {
            Some(flows) => flows,
            None => inner.cache.read().await.flow_ids(),
        };

        let connection = inner.transport.open(&flows).await?;
        let (frames, handle) = connection.into_parts();

        let mut state = inner.lock();
        if !state.desired || state.generation != generation {
            drop(state);
            handle.end();
            debug!(generation, "discarding superseded stream connection");
            return Ok(flows);
        }

        if let Some(previous) = state.active.take() {
            previous.close();
        }
        let pump = tokio::spawn(pump(Arc::downgrade(inner), generation, frames));
        state.active = Some(ActiveConnection { pump, handle });
        state.bound = flows.clone();
        info!(flows = flows.len(), generation, "stream connected");
        Ok(flows)
    }

    /// Called by the pump when its connection died.
    fn connection_lost(self: &Arc<Self>, generation: u64, error: &TransportError) {
        warn!(%error, "stream connection failed, reconnecting");
        self.events.emit(StreamEvent::Error(error.to_string()));

        let mut state = self.lock();
        if !state.desired || state.generation != generation {
            return;
        }
        // The pump is the caller and is about to return; only the
        // connection needs closing.
        if let Some(active) = state.active.take() {
            active.handle.end();
        }
        if let Some(previous) = state.healer.take() {
            previous.abort();
        }
        state.healer = Some(tokio::spawn(heal(Arc::downgrade(self), generation)));
    }

    async fn dispatch(&self, raw: Value) {
        let decoded = {
            let cache = self.cache.read().await;
            Message::from_frame(&cache, &raw)
        };

        match decoded {
            Ok(message) => {
                debug!(kind = %message.kind, flow = ?message.flow_id, "stream frame");
                self.events.emit(StreamEvent::Message(StreamMessage {
                    kind: message.kind.clone(),
                    message,
                    raw,
                }));
            }
            Err(error) => {
                warn!(%error, "ignoring malformed stream frame");
                self.events
                    .emit(StreamEvent::Error(format!("malformed stream frame: {error}")));
            }
        }
    }
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        self.state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .teardown();
    }
}

async fn pump(session: Weak<StreamInner>, generation: u64, mut frames: mpsc::Receiver<StreamFrame>) {
    while let Some(frame) = frames.recv().await {
        let Some(inner) = session.upgrade() else {
            return;
        };
        match frame {
            Ok(raw) => inner.dispatch(raw).await,
            Err(error) => {
                inner.connection_lost(generation, &error);
                return;
            }
        }
    }

    if let Some(inner) = session.upgrade() {
        inner.connection_lost(generation, &TransportError::StreamClosed);
    }
}

async fn heal(session: Weak<StreamInner>, generation: u64) {
    loop {
        let Some(inner) = session.upgrade() else {
            return;
        };
        if !inner.is_current(generation) {
            return;
        }

        let attached = StreamInner::attach(&inner, generation).await;
        match attached {
            Ok(flows) => {
                debug!(flows = flows.len(), generation, "stream reconnected");
                return;
            }
            Err(error) => {
                warn!(%error, delay_secs = inner.reconnect_delay.as_secs(), "stream reconnect failed");
                inner.events.emit(StreamEvent::Error(error.to_string()));
                let delay = inner.reconnect_delay;
                drop(inner);
                time::sleep(delay).await;
            }
        }
    }
}
