//! Typed pub/sub fan-out bus (spec §4.5, §6 "WebSocket message kinds").
//!
//! Delivery is best-effort and fire-and-forget: a subscriber gets a bounded
//! outbound queue, and a full or closed queue never blocks the publisher —
//! matching spec §9's "Broadcast back-pressure" note. A subscriber callback
//! panicking, or a subscriber channel filling up, must never prevent other
//! subscribers from receiving the same message (spec §4.5).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Opaque id identifying one subscriber (a UI client, typically).
pub type ClientId = String;

/// Depth of each subscriber's outbound queue before messages are dropped for
/// that subscriber. Measurement deltas are the highest-rate message kind, so
/// this is sized generously relative to `poll_interval_ms`.
const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

/// The closed set of message kinds emitted by the core (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Message {
    /// `measurement{deviceId, update{timestamp, measurements}}`
    #[serde(rename = "measurement")]
    Measurement {
        device_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
        measurements: HashMap<String, f64>,
    },

    /// `field{deviceId, field, value}`
    #[serde(rename = "field")]
    Field {
        device_id: String,
        field: FieldName,
        value: serde_json::Value,
    },

    /// `error{deviceId, code, message}`
    #[serde(rename = "error")]
    Error {
        device_id: String,
        code: String,
        message: String,
    },

    #[serde(rename = "sequenceStarted")]
    SequenceStarted { sequence_id: String, state: serde_json::Value },
    #[serde(rename = "sequenceProgress")]
    SequenceProgress { sequence_id: String, state: serde_json::Value },
    #[serde(rename = "sequenceCompleted")]
    SequenceCompleted { sequence_id: String },
    #[serde(rename = "sequenceAborted")]
    SequenceAborted { sequence_id: String },
    #[serde(rename = "sequenceError")]
    SequenceError { sequence_id: String, error: String },

    #[serde(rename = "triggerScriptStarted")]
    TriggerScriptStarted { script_id: String },
    #[serde(rename = "triggerScriptPaused")]
    TriggerScriptPaused { script_id: String },
    #[serde(rename = "triggerScriptResumed")]
    TriggerScriptResumed { script_id: String },
    #[serde(rename = "triggerScriptStopped")]
    TriggerScriptStopped { script_id: String },
    #[serde(rename = "triggerScriptProgress")]
    TriggerScriptProgress { script_id: String, state: serde_json::Value },
    #[serde(rename = "triggerFired")]
    TriggerFired {
        script_id: String,
        trigger_id: String,
        trigger_state: serde_json::Value,
    },
    #[serde(rename = "triggerActionFailed")]
    TriggerActionFailed {
        script_id: String,
        trigger_id: String,
        action_type: String,
        error: String,
    },
}

/// `field` values that `setMode`/`setOutput`/`setValue`/polling broadcast.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FieldName {
    Mode,
    OutputEnabled,
    Setpoints,
    ConnectionStatus,
}

/// A fan-out bus keyed by opaque client id. One bus instance per
/// `DeviceSession`/`SequenceController`/`TriggerEngine`; `SessionManager`
/// routes subscribe/unsubscribe calls to the right session's bus.
#[derive(Default)]
pub struct Bus {
    subscribers: parking_lot::Mutex<HashMap<ClientId, mpsc::Sender<Arc<Message>>>>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: re-subscribing with the same `client_id` replaces the
    /// previous sender (spec §8 "Subscribe idempotence").
    pub fn subscribe(&self, client_id: ClientId) -> mpsc::Receiver<Arc<Message>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        self.subscribers.lock().insert(client_id, tx);
        rx
    }

    pub fn unsubscribe(&self, client_id: &str) {
        self.subscribers.lock().remove(client_id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Drops every subscriber, used by `stop()` on the owning
    /// session/controller/engine (spec §4.1 "clear subscribers").
    pub fn clear(&self) {
        self.subscribers.lock().clear();
    }

    /// Publish to every subscriber. Never blocks: a full queue just drops
    /// the message for that one subscriber (logged), a closed queue removes
    /// it. Other subscribers are unaffected either way.
    pub fn publish(&self, message: Message) {
        let message = Arc::new(message);
        let mut dead = Vec::new();
        {
            let subscribers = self.subscribers.lock();
            for (client_id, tx) in subscribers.iter() {
                match tx.try_send(message.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(client_id, "subscriber queue full, dropping message");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dead.push(client_id.clone());
                    }
                }
            }
        }
        if !dead.is_empty() {
            let mut subscribers = self.subscribers.lock();
            for client_id in dead {
                subscribers.remove(&client_id);
            }
        }
    }
}
