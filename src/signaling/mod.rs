//! # Signaling transport
//!
//! MQTT-over-WebSockets, used only for presence and WebRTC offer/answer/ICE
//! relay (SPEC_FULL.md §4.5). The wire format, compression fallback, and
//! burst-announcement schedule live in [`transport`]; the underlying
//! pub/sub contract is [`Bus`].

mod bus;
mod compression;
mod envelope;
#[cfg(not(target_arch = "wasm32"))]
mod mqtt_native;
#[cfg(target_arch = "wasm32")]
mod mqtt_wasm;
mod transport;

pub use bus::{Bus, MemoryBroker, MemoryBus};
pub use envelope::{
    AnswerPayload, Envelope, IceCandidate, NameChangePayload, OfferPayload, RtcOfferPayload,
    SessionDescription, Subtopic,
};
#[cfg(not(target_arch = "wasm32"))]
pub use mqtt_native::RumqttBus;
#[cfg(target_arch = "wasm32")]
pub use mqtt_wasm::MqttBus;
pub use transport::{HistoryEntry, SignalingTransport};
