//! Status notifications for the dashboard and logs.
//!
//! The core only talks to a [`StatusSink`]; [`StatusHub`] is the sink the daemon
//! uses, fanning each event out to live subscribers as a JSON frame.

use crate::connection::ConnectionState;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

/// Connection status as shown to the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub status: ConnectionState,
    pub qr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub session_id: String,
}

/// Message traffic seen by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "direction", rename_all = "lowercase")]
pub enum MessageNotice {
    #[serde(rename_all = "camelCase")]
    Inbound {
        id: String,
        chat_id: String,
        from: String,
        sender_name: Option<String>,
        text: String,
        is_group: bool,
        timestamp: String,
    },
    #[serde(rename_all = "camelCase")]
    Outbound {
        id: String,
        to: String,
        text: String,
        quoted_msg_id: Option<String>,
        timestamp: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub chat_id: Option<String>,
    pub message_id: Option<String>,
    pub message: String,
}

/// One notification: `{kind: status|qr|message|error|toggle, payload}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "lowercase")]
pub enum StatusEvent {
    Status(StatusPayload),
    Qr {
        qr: String,
    },
    Message(MessageNotice),
    Error(ErrorPayload),
    Toggle {
        #[serde(rename = "aiEnabled")]
        ai_enabled: bool,
    },
}

impl StatusEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::Qr { .. } => "qr",
            Self::Message(_) => "message",
            Self::Error(_) => "error",
            Self::Toggle { .. } => "toggle",
        }
    }
}

/// Receives notifications. Must return quickly and never fail the caller.
pub trait StatusSink: Send + Sync {
    fn notify(&self, event: StatusEvent);
}

/// Sink that drops everything.
pub struct NullSink;

impl StatusSink for NullSink {
    fn notify(&self, _event: StatusEvent) {}
}

type SubscriberMap = HashMap<u64, UnboundedSender<String>>;

/// Fans events out to subscribers as `{kind, payload, timestamp}` JSON frames.
#[derive(Default)]
pub struct StatusHub {
    subscribers: Mutex<SubscriberMap>,
    next_subscriber_id: AtomicU64,
}

impl StatusHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> (u64, UnboundedReceiver<String>) {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = unbounded_channel::<String>();
        self.subscribers.lock().insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Serialize `event` into the frame subscribers receive.
    pub fn frame(event: &StatusEvent) -> String {
        let mut value = serde_json::to_value(event).unwrap_or_else(|e| {
            serde_json::json!({
                "kind": "error",
                "payload": { "message": format!("failed to serialize {} event: {e}", event.kind()) },
            })
        });
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "timestamp".into(),
                serde_json::Value::String(Utc::now().to_rfc3339()),
            );
        }
        value.to_string()
    }

    fn emit(&self, frame: String) {
        let mut stale: Vec<u64> = Vec::new();
        {
            let guard = self.subscribers.lock();
            for (id, tx) in guard.iter() {
                if tx.send(frame.clone()).is_err() {
                    stale.push(*id);
                }
            }
        }
        if !stale.is_empty() {
            let mut guard = self.subscribers.lock();
            for id in stale {
                guard.remove(&id);
            }
        }
    }
}

impl StatusSink for StatusHub {
    fn notify(&self, event: StatusEvent) {
        tracing::debug!(kind = event.kind(), "status event");
        self.emit(Self::frame(&event));
    }
}
