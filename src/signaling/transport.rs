//! The signaling transport (SPEC_FULL.md §4.5): connects to the bus,
//! subscribes to the room topic, runs the presence-announcement burst
//! schedule, and maintains the local history ring.

use super::compression;
use super::envelope::{Envelope, Subtopic};
use super::Bus;
use crate::error::Result;
use crate::platform;
use crate::time::now_timestamp_millis;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

/// Burst-announcement state machine (SPEC_FULL.md §9): five announcements
/// at 3s spacing, then one every 30s, each suppressed while at least one
/// healthy peer connection already exists. A single timer with a
/// transition on the counter, rather than two nested timers.
const BURST_COUNT: u32 = 5;
const BURST_INTERVAL_MS: u32 = 3_000;
const SETTLED_INTERVAL_MS: u32 = 30_000;

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub envelope: Envelope,
    pub sent: bool,
    pub received_at: i64,
}

pub struct SignalingTransport<B: Bus> {
    bus: Rc<B>,
    full_topic: String,
    compression_enabled: bool,
    compression_threshold: usize,
    history: RefCell<VecDeque<HistoryEntry>>,
    history_cap: usize,
    history_enabled: bool,
    sender_name: RefCell<String>,
    user_info: RefCell<serde_json::Value>,
    on_envelope: RefCell<Option<Rc<dyn Fn(&Envelope)>>>,
    has_healthy_connection: RefCell<Option<Rc<dyn Fn() -> bool>>>,
    burst_cancelled: Rc<Cell<bool>>,
}

impl<B: Bus + 'static> SignalingTransport<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Rc<B>,
        full_topic: String,
        sender_name: String,
        user_info: serde_json::Value,
        compression_enabled: bool,
        compression_threshold: usize,
        history_enabled: bool,
        history_cap: usize,
    ) -> Rc<Self> {
        Rc::new(SignalingTransport {
            bus,
            full_topic,
            compression_enabled,
            compression_threshold,
            history: RefCell::new(VecDeque::new()),
            history_cap,
            history_enabled,
            sender_name: RefCell::new(sender_name),
            user_info: RefCell::new(user_info),
            on_envelope: RefCell::new(None),
            has_healthy_connection: RefCell::new(None),
            burst_cancelled: Rc::new(Cell::new(false)),
        })
    }

    pub fn set_sender_name(&self, name: String) {
        *self.sender_name.borrow_mut() = name;
    }

    /// The `user_info` payload this client announces over `connect`/offer
    /// envelopes — normally `{"identity": keystore.identity_string(name)}`
    /// (SPEC_FULL.md §4.8), so peers can bind a name to a key before
    /// trusting it.
    pub fn user_info(&self) -> serde_json::Value {
        self.user_info.borrow().clone()
    }

    pub fn set_user_info(&self, value: serde_json::Value) {
        *self.user_info.borrow_mut() = value;
    }

    /// Called once with every inbound, fully-decoded envelope.
    pub fn on_envelope(&self, f: impl Fn(&Envelope) + 'static) {
        *self.on_envelope.borrow_mut() = Some(Rc::new(f));
    }

    /// Supplies the "is at least one peer connection already healthy"
    /// predicate that suppresses announcements during the burst.
    pub fn set_healthy_connection_probe(&self, f: impl Fn() -> bool + 'static) {
        *self.has_healthy_connection.borrow_mut() = Some(Rc::new(f));
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.borrow().iter().cloned().collect()
    }

    pub async fn connect(self: &Rc<Self>) -> Result<()> {
        self.bus.connect().await?;

        let weak_self = Rc::downgrade(self);
        self.bus.on_message(move |_topic, payload| {
            let Some(this) = weak_self.upgrade() else { return };
            this.handle_raw_message(payload);
        });

        self.bus.subscribe(&self.full_topic).await?;

        self.publish(Subtopic::Connect(self.user_info())).await?;
        self.start_presence_burst();
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.burst_cancelled.set(true);
        self.publish(Subtopic::Unload).await?;
        self.bus.disconnect().await
    }

    pub async fn publish(&self, body: Subtopic) -> Result<()> {
        let envelope = Envelope::new(self.sender_name.borrow().clone(), now_timestamp_millis(), body);
        let json = serde_json::to_string(&envelope)?;
        let bytes = compression::encode(&json, self.compression_enabled, self.compression_threshold);
        self.bus.publish(&self.full_topic, bytes).await?;
        self.push_history(envelope, true);
        Ok(())
    }

    fn handle_raw_message(&self, payload: &[u8]) {
        let Some(json) = compression::decode(payload) else {
            tracing::error!("signaling payload could not be decoded as JSON or compressed JSON");
            return;
        };
        let envelope: Envelope = match serde_json::from_str(&json) {
            Ok(e) => e,
            Err(err) => {
                tracing::error!(error = %err, "dropping malformed envelope");
                return;
            }
        };
        self.push_history(envelope.clone(), false);
        if let Some(handler) = self.on_envelope.borrow().as_ref() {
            handler(&envelope);
        }
    }

    fn push_history(&self, envelope: Envelope, sent: bool) {
        if !self.history_enabled {
            return;
        }
        let mut history = self.history.borrow_mut();
        if history.len() >= self.history_cap {
            history.pop_front();
        }
        history.push_back(HistoryEntry { envelope, sent, received_at: now_timestamp_millis() });
    }

    fn start_presence_burst(self: &Rc<Self>) {
        self.burst_cancelled.set(false);
        let this = self.clone();
        let cancelled = self.burst_cancelled.clone();
        platform::spawn_local(async move {
            let mut count = 0u32;
            loop {
                let interval = if count < BURST_COUNT { BURST_INTERVAL_MS } else { SETTLED_INTERVAL_MS };
                platform::sleep(interval).await;
                if cancelled.get() {
                    return;
                }
                count += 1;
                let healthy = this
                    .has_healthy_connection
                    .borrow()
                    .as_ref()
                    .map(|f| f())
                    .unwrap_or(false);
                if healthy {
                    continue;
                }
                if let Err(err) = this.publish(Subtopic::Connect(this.user_info())).await {
                    tracing::error!(error = %err, "presence announcement failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{MemoryBroker, MemoryBus};

    fn make(broker: Rc<MemoryBroker>, name: &str) -> Rc<SignalingTransport<MemoryBus>> {
        let bus = Rc::new(MemoryBus::new(broker));
        SignalingTransport::new(
            bus,
            "room/1".to_string(),
            name.to_string(),
            serde_json::Value::Null,
            true,
            1024,
            true,
            10,
        )
    }

    #[tokio::test]
    async fn connect_publishes_a_connect_announcement_and_it_round_trips() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let broker = MemoryBroker::new();
                let alice = make(broker.clone(), "alice(0)");
                let bob = make(broker, "bob(0)");

                let received = Rc::new(RefCell::new(Vec::new()));
                let received2 = received.clone();
                bob.on_envelope(move |env| received2.borrow_mut().push(env.clone()));

                bob.connect().await.unwrap();
                alice.connect().await.unwrap();

                assert!(received.borrow().iter().any(|e| e.sender == "alice(0)" && e.body.tag() == "connect"));
            })
            .await;
    }

    #[tokio::test]
    async fn published_envelope_is_recorded_in_sender_history() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let broker = MemoryBroker::new();
                let alice = make(broker, "alice(0)");
                alice.connect().await.unwrap();
                let before = alice.history().len();
                alice.publish(Subtopic::Unload).await.unwrap();
                assert_eq!(alice.history().len(), before + 1);
                assert!(alice.history().last().unwrap().sent);
            })
            .await;
    }

    #[tokio::test]
    async fn history_respects_its_cap() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let broker = MemoryBroker::new();
                let bus = Rc::new(MemoryBus::new(broker));
                let transport = SignalingTransport::new(
                    bus,
                    "room/1".to_string(),
                    "alice(0)".to_string(),
                    serde_json::Value::Null,
                    false,
                    1024,
                    true,
                    3,
                );
                transport.connect().await.unwrap();
                for _ in 0..5 {
                    transport.publish(Subtopic::Unload).await.unwrap();
                }
                assert_eq!(transport.history().len(), 3);
            })
            .await;
    }

    #[tokio::test]
    async fn large_payload_round_trips_through_compression() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let broker = MemoryBroker::new();
                let alice = make(broker.clone(), "alice(0)");
                let bob = make(broker, "bob(0)");
                let received = Rc::new(RefCell::new(Vec::new()));
                let received2 = received.clone();
                bob.on_envelope(move |env| received2.borrow_mut().push(env.clone()));
                bob.connect().await.unwrap();
                alice.connect().await.unwrap();

                let big_user_info = serde_json::json!({"blob": "x".repeat(2000)});
                alice.publish(Subtopic::Connect(big_user_info.clone())).await.unwrap();

                let got = received.borrow();
                let matching = got.iter().find(|e| matches!(&e.body, Subtopic::Connect(v) if v == &big_user_info));
                assert!(matching.is_some());
            })
            .await;
    }

    #[tokio::test]
    async fn connect_announces_the_configured_user_info() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let broker = MemoryBroker::new();
                let bus = Rc::new(MemoryBus::new(broker.clone()));
                let identity = serde_json::json!({"identity": "alice|pubkey"});
                let alice = SignalingTransport::new(
                    bus,
                    "room/1".to_string(),
                    "alice(0)".to_string(),
                    identity.clone(),
                    true,
                    1024,
                    true,
                    10,
                );
                let bob = make(broker, "bob(0)");

                let received = Rc::new(RefCell::new(Vec::new()));
                let received2 = received.clone();
                bob.on_envelope(move |env| received2.borrow_mut().push(env.clone()));

                bob.connect().await.unwrap();
                alice.connect().await.unwrap();

                let got = received.borrow();
                assert!(got.iter().any(|e| matches!(&e.body, Subtopic::Connect(v) if v == &identity)));
            })
            .await;
    }
}
