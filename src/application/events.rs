//! Typed notifications for presentation collaborators.
//!
//! Handlers run synchronously on the emitting task, so once `emit` returns
//! the event has been fully delivered.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::mpsc;

use crate::domain::playback::PlaybackState;
use crate::domain::recording::{RecordingId, SessionId};

/// Discriminant used to subscribe to one kind of event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StartRecording,
    Encoded,
    EncodeHalted,
    PlaybackState,
    DurationChanged,
}

/// Notifications emitted by capture and playback
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    StartRecording {
        encoder_id: SessionId,
        recording_id: RecordingId,
        sample_rate: u32,
        frame_size: usize,
        channels: u16,
    },
    Encoded {
        encoder_id: SessionId,
        sequence_index: u64,
        duration_ms: f64,
        size: usize,
        payload: Vec<u8>,
    },
    EncodeHalted {
        encoder_id: SessionId,
        diagnostics: Vec<String>,
    },
    PlaybackState {
        state: PlaybackState,
    },
    DurationChanged {
        recording_id: RecordingId,
        /// Played position in seconds
        duration: f64,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::StartRecording { .. } => EventKind::StartRecording,
            Self::Encoded { .. } => EventKind::Encoded,
            Self::EncodeHalted { .. } => EventKind::EncodeHalted,
            Self::PlaybackState { .. } => EventKind::PlaybackState,
            Self::DurationChanged { .. } => EventKind::DurationChanged,
        }
    }
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

struct Registration {
    id: u64,
    kind: EventKind,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    handlers: StdMutex<Vec<Registration>>,
}

/// Observer registry. Cloning shares the same set of subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `kind`.
    /// The handler stays registered until the returned subscription is dropped.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut handlers) = self.registry.handlers.lock() {
            handlers.push(Registration {
                id,
                kind,
                handler: Arc::new(handler),
            });
        }
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Subscribe and forward events of `kind` into an unbounded channel
    pub fn channel(&self, kind: EventKind) -> (Subscription, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(kind, move |event| {
            let _ = tx.send(event.clone());
        });
        (subscription, rx)
    }

    /// Deliver `event` to every matching handler
    pub fn emit(&self, event: Event) {
        let kind = event.kind();
        // Handlers are called outside the lock so they may subscribe or unsubscribe.
        let matching: Vec<Handler> = match self.registry.handlers.lock() {
            Ok(handlers) => handlers
                .iter()
                .filter(|r| r.kind == kind)
                .map(|r| Arc::clone(&r.handler))
                .collect(),
            Err(_) => return,
        };
        for handler in matching {
            handler(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry
            .handlers
            .lock()
            .map(|handlers| handlers.len())
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Handle returned by [`EventBus::subscribe`]; unsubscribes on drop
pub struct Subscription {
    id: u64,
    registry: std::sync::Weak<Registry>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if let Ok(mut handlers) = registry.handlers.lock() {
                handlers.retain(|r| r.id != self.id);
            }
        }
    }
}
