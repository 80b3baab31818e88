//! Progress event stream
//!
//! Point-in-time reports emitted by the agent loop. Delivery is best-effort:
//! events go through a bounded queue and are dropped when it is full, so an
//! observer can never stall a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::trace;

/// Phase of a run an event reports on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Thinking,
    ToolCall,
    ToolResult,
    PartialText,
    Complete,
    Error,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Thinking => "thinking",
            EventType::ToolCall => "tool_call",
            EventType::ToolResult => "tool_result",
            EventType::PartialText => "partial_text",
            EventType::Complete => "complete",
            EventType::Error => "error",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A progress report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Serialized as RFC3339
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
}

impl Event {
    pub fn new(event_type: EventType, data: Value) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            data,
        }
    }
}

pub type EventReceiver = mpsc::Receiver<Event>;

/// Non-blocking sender side of the event stream.
///
/// A disabled emitter (no observer) turns every emit into a no-op.
#[derive(Debug, Clone, Default)]
pub struct EventEmitter {
    sender: Option<mpsc::Sender<Event>>,
    dropped: Arc<AtomicU64>,
}

impl EventEmitter {
    /// Emitter without an observer
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Wrap an existing bounded sender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self {
            sender: Some(sender),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create an emitter and its receiving end. Capacity is at least one.
    pub fn channel(capacity: usize) -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    /// Queue an event without waiting. Returns whether it was queued.
    pub fn emit(&self, event: Event) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };

        match sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!("◆ Event queue full, dropped {}", event.event_type);
                false
            }
            Err(TrySendError::Closed(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!("◆ Event observer gone, dropped {}", event.event_type);
                false
            }
        }
    }

    pub fn emit_kind(&self, event_type: EventType, data: Value) -> bool {
        if !self.is_enabled() {
            return false;
        }
        self.emit(Event::new(event_type, data))
    }

    /// Events lost to a full or closed queue since creation
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
