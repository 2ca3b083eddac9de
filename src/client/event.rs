//! The public, subscribe-only event surface (SPEC_FULL.md §6).

use std::rc::Rc;

/// Everything the client layer ever emits. Applications subscribe via
/// `AuthenticatedPeerClient::events()` (an [`crate::events::EventBus<Event>`]).
#[derive(Debug, Clone)]
pub enum Event {
    MqttConnected,
    MqttMessage { subtopic: String, data: serde_json::Value, sender: String, timestamp: i64 },
    ConnectedToPeer { peer: String },
    DisconnectedFromPeer { peer: String },
    RtcMessage { channel: String, data: Vec<u8>, sender: String },
    Chat { message: String, sender: String },
    Dm { message: String, sender: String },
    Ping { sender: String },
    Validation { peer: String, trusted: bool },
    ValidationFailure { peer: String, message: Option<String> },
    NameChange { old: String, new: String },
    CallConnected { peer: String, local_stream: Rc<dyn std::any::Any>, remote_stream: Rc<dyn std::any::Any> },
    CallEnded { peer: String },
    /// Stats-poll update for an active call (SPEC_FULL.md §4.11).
    MetricsUpdated { peer: String, metrics: CallMetrics },
    /// A call never connected within the call timeout (SPEC_FULL.md §4.11,
    /// scenario S6). Mesh-initiated outbound attempts that time out are
    /// suppressed before reaching the event bus.
    CallTimeout { peer: String, direction: CallDirection },
    /// Media capture or track negotiation failed for a call attempt.
    CallError { peer: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CallMetrics {
    pub rtt_ms: Option<f64>,
    pub packet_loss_percent: Option<f64>,
    pub jitter_ms: Option<f64>,
}
