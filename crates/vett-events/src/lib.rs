//! Structured run-event emission for the Vett engine.
//!
//! Every phase transition, step, budget mutation, and breaker change is
//! reported as a [`RunEvent`] and delivered to a pluggable [`EventSink`]
//! through a bounded, fire-and-forget emitter.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use vett_core::{current_unix_timestamp_ms, new_event_id};

/// Default bound for the emitter mailbox.
pub const DEFAULT_EVENT_MAILBOX: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// One structured event in a run's timeline.
pub struct RunEvent {
    pub event_id: String,
    pub unix_ms: u64,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_number: Option<u32>,
    pub state: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl RunEvent {
    pub fn new(
        run_id: impl Into<String>,
        step_number: Option<u32>,
        state: impl Into<String>,
        message: impl Into<String>,
        metadata: Value,
    ) -> Self {
        Self {
            event_id: new_event_id(),
            unix_ms: current_unix_timestamp_ms(),
            run_id: run_id.into(),
            step_number,
            state: state.into(),
            message: message.into(),
            metadata,
        }
    }
}

#[async_trait]
/// Opaque transport the engine emits events into.
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: RunEvent);
}

/// In-memory sink used by tests and local inspection.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<RunEvent>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    pub fn events_for_state(&self, state: &str) -> Vec<RunEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.state == state)
            .collect()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn deliver(&self, event: RunEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Sink that forwards events to the tracing subscriber.
#[derive(Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn deliver(&self, event: RunEvent) {
        debug!(
            target: "vett::events",
            run_id = %event.run_id,
            step = ?event.step_number,
            state = %event.state,
            "{}",
            event.message
        );
    }
}

/// Bounded fire-and-forget event emitter.
///
/// Events are queued onto an mpsc channel drained by a background task; when
/// the mailbox is full the oldest queued event is dropped with a warning so
/// the pipeline never blocks on observability.
#[derive(Clone)]
pub struct EventEmitter {
    queue: Arc<Mutex<VecDeque<RunEvent>>>,
    notify: mpsc::Sender<()>,
    capacity: usize,
}

impl EventEmitter {
    pub fn new(sink: Arc<dyn EventSink>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let queue: Arc<Mutex<VecDeque<RunEvent>>> = Arc::new(Mutex::new(VecDeque::new()));
        let (notify, mut wake) = mpsc::channel::<()>(capacity);
        let drain_queue = Arc::clone(&queue);
        tokio::spawn(async move {
            while wake.recv().await.is_some() {
                loop {
                    let next = drain_queue.lock().ok().and_then(|mut queue| queue.pop_front());
                    match next {
                        Some(event) => sink.deliver(event).await,
                        None => break,
                    }
                }
            }
        });
        Self { queue, notify, capacity }
    }

    pub fn with_default_capacity(sink: Arc<dyn EventSink>) -> Self {
        Self::new(sink, DEFAULT_EVENT_MAILBOX)
    }

    /// Enqueues an event without awaiting delivery.
    pub fn emit(&self, event: RunEvent) {
        if let Ok(mut queue) = self.queue.lock() {
            if queue.len() >= self.capacity {
                let dropped = queue.pop_front();
                warn!(
                    target: "vett::events",
                    dropped_event = ?dropped.map(|event| event.event_id),
                    "event mailbox full, dropping oldest"
                );
            }
            queue.push_back(event);
        }
        let _ = self.notify.try_send(());
    }

    /// Emits a phase/state event with JSON metadata.
    pub fn emit_state(
        &self,
        run_id: &str,
        step_number: Option<u32>,
        state: &str,
        message: impl Into<String>,
        metadata: Value,
    ) {
        self.emit(RunEvent::new(run_id, step_number, state, message, metadata));
    }
}
