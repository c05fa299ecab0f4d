//! Typed session events and the subscription bus.
//!
//! The event taxonomy is closed: every observable session occurrence is one
//! variant of [`Event`]. Subscribers register through [`EventBus::subscribe`]
//! and hold a [`Subscription`] guard; dropping the guard deregisters the
//! handler, so a leaked listener cannot outlive its owner.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::protocol::{ServerContent, ToolCall, ToolCallCancellation};

/// Why a session closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CloseReason {
    /// `disconnect()` was called.
    Requested,
    /// The transport dropped unexpectedly.
    TransportError,
}

#[derive(Debug, Clone)]
pub enum Event {
    /// The transport opened and the setup frame is on its way.
    Open,
    /// The session tore down. Emitted exactly once per teardown.
    Close { reason: CloseReason },
    /// A log entry; emitted for every inbound and outbound frame.
    Log(StreamingLog),
    /// The server acknowledged the setup frame.
    SetupComplete,
    /// Model content other than audio.
    Content(ServerContent),
    /// Raw PCM bytes extracted from an audio inline-data part.
    Audio(Bytes),
    /// Server-initiated barge-in: playback must be cancelled immediately.
    Interrupted,
    /// The model finished its turn.
    TurnComplete,
    /// The model requests one or more function invocations.
    ToolCall(ToolCall),
    /// Previously issued calls should be abandoned.
    ToolCallCancellation(ToolCallCancellation),
}

pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &Event);
}

struct FnHandler<F>(F);

impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&Event) + Send + Sync,
{
    fn handle_event(&self, event: &Event) {
        (self.0)(event)
    }
}

#[derive(Default, Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    handlers: RwLock<Vec<(u64, Arc<dyn EventHandler>)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler and returns its guard. The handler is removed
    /// when the guard drops.
    pub fn subscribe(&self, handler: Arc<dyn EventHandler>) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .write()
            .expect("RwLock should not be poisoned")
            .push((id, handler));
        Subscription {
            id,
            bus: self.clone(),
        }
    }

    /// Closure convenience over [`EventBus::subscribe`].
    pub fn subscribe_fn<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(FnHandler(handler)))
    }

    /// Returns true if there are any event handlers registered.
    /// Useful for skipping expensive work when no one is listening.
    pub fn has_handlers(&self) -> bool {
        !self
            .inner
            .handlers
            .read()
            .expect("RwLock should not be poisoned")
            .is_empty()
    }

    pub fn dispatch(&self, event: &Event) {
        for (_, handler) in self
            .inner
            .handlers
            .read()
            .expect("RwLock should not be poisoned")
            .iter()
        {
            handler.handle_event(event);
        }
    }

    fn remove(&self, id: u64) {
        self.inner
            .handlers
            .write()
            .expect("RwLock should not be poisoned")
            .retain(|(handler_id, _)| *handler_id != id);
    }
}

/// Guard for a registered handler; deregisters on drop.
pub struct Subscription {
    id: u64,
    bus: EventBus,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.remove(self.id);
    }
}

/// One entry of the streaming log: a timestamped, tagged record of a frame
/// or a free-text note, with a repeat counter maintained by the log sink.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StreamingLog {
    pub timestamp: DateTime<Utc>,
    pub tag: LogTag,
    pub payload: LogPayload,
    pub count: u32,
}

impl StreamingLog {
    pub fn new(tag: LogTag, payload: LogPayload) -> Self {
        Self {
            timestamp: Utc::now(),
            tag,
            payload,
            count: 1,
        }
    }
}

/// Direction and kind of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LogTag {
    ClientSetup,
    ClientContent,
    ClientRealtimeInput,
    ClientToolResponse,
    ServerSetupComplete,
    ServerContent,
    ServerAudio,
    ServerToolCall,
    ServerToolCallCancellation,
    ConnectionOpen,
    ConnectionClose,
    Error,
}

impl fmt::Display for LogTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogTag::ClientSetup => "client.setup",
            LogTag::ClientContent => "client.content",
            LogTag::ClientRealtimeInput => "client.realtimeInput",
            LogTag::ClientToolResponse => "client.toolResponse",
            LogTag::ServerSetupComplete => "server.setupComplete",
            LogTag::ServerContent => "server.content",
            LogTag::ServerAudio => "server.audio",
            LogTag::ServerToolCall => "server.toolCall",
            LogTag::ServerToolCallCancellation => "server.toolCallCancellation",
            LogTag::ConnectionOpen => "connection.open",
            LogTag::ConnectionClose => "connection.close",
            LogTag::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum LogPayload {
    Frame(serde_json::Value),
    Text(String),
}

impl fmt::Display for LogPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogPayload::Frame(value) => write!(f, "{value}"),
            LogPayload::Text(text) => f.write_str(text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn counting(bus: &EventBus, counter: Arc<Mutex<u32>>) -> Subscription {
        bus.subscribe_fn(move |_| {
            *counter.lock().unwrap() += 1;
        })
    }

    #[test]
    fn dropping_subscription_removes_handler() {
        let bus = EventBus::new();
        let counter = Arc::new(Mutex::new(0));

        let subscription = counting(&bus, counter.clone());
        bus.dispatch(&Event::Open);
        assert_eq!(*counter.lock().unwrap(), 1);

        drop(subscription);
        bus.dispatch(&Event::Open);
        assert_eq!(*counter.lock().unwrap(), 1);
        assert!(!bus.has_handlers());
    }

    #[test]
    fn dispatch_reaches_all_subscribers() {
        let bus = EventBus::new();
        let first = Arc::new(Mutex::new(0));
        let second = Arc::new(Mutex::new(0));

        let _a = counting(&bus, first.clone());
        let _b = counting(&bus, second.clone());
        bus.dispatch(&Event::TurnComplete);

        assert_eq!(*first.lock().unwrap(), 1);
        assert_eq!(*second.lock().unwrap(), 1);
    }

    #[test]
    fn log_tags_render_dotted_names() {
        assert_eq!(LogTag::ServerContent.to_string(), "server.content");
        assert_eq!(
            LogTag::ClientRealtimeInput.to_string(),
            "client.realtimeInput"
        );
    }
}
