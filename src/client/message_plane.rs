//! # Message plane (SPEC_FULL.md §4.10)
//!
//! A fixed handler table on top of the named data channels: chat, dm,
//! ping/pong, and question/answer. Talks to whatever can move bytes to a
//! named peer through [`PeerSender`] — [`super::base::BaseClient`] in
//! production, a direct loopback in tests — so this module never touches
//! signaling or RTC plumbing directly.

use super::event::Event;
use crate::error::{Error, Result};
use crate::events::EventBus;
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use tokio::sync::oneshot;

/// Moves bytes to a named peer on a named channel. Implemented by
/// [`super::base::BaseClient`]; abstracted so the message plane's protocol
/// logic (serialization, sequence numbers, deferred resolution) can be
/// tested without standing up a full signaling/RTC stack.
#[async_trait(?Send)]
pub trait PeerSender {
    async fn send_to(&self, peer: &str, channel: &str, data: &[u8]) -> Result<()>;
    /// Peers considered reachable right now (used by `ping_everyone`).
    fn connected_peers(&self) -> Vec<String>;
}

#[async_trait(?Send)]
impl<B: crate::signaling::Bus + 'static> PeerSender for super::base::BaseClient<B> {
    async fn send_to(&self, peer: &str, channel: &str, data: &[u8]) -> Result<()> {
        self.send(peer, channel, data).await
    }

    fn connected_peers(&self) -> Vec<String> {
        self.connected_peer_names()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatPayload {
    message: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct DmPayload {
    message: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct QuestionBody {
    topic: String,
    content: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct QuestionPayload {
    n: u64,
    question: QuestionBody,
}

#[derive(Debug, Serialize, Deserialize)]
struct AnswerPayload {
    n: u64,
    answer: serde_json::Value,
    question: QuestionBody,
}

pub type QuestionFuture = Pin<Box<dyn Future<Output = serde_json::Value>>>;
pub type QuestionHandler = Rc<dyn Fn(serde_json::Value) -> QuestionFuture>;

/// Wraps a plain (non-async) handler so it can be registered the same way
/// as an async one.
pub fn sync_handler(f: impl Fn(serde_json::Value) -> serde_json::Value + 'static) -> QuestionHandler {
    Rc::new(move |content| Box::pin(futures::future::ready(f(content))))
}

pub struct MessagePlane<S: PeerSender + 'static> {
    sender: Rc<S>,
    events: Rc<EventBus<Event>>,
    verified: RefCell<HashSet<String>>,
    next_sequence: Cell<u64>,
    question_handlers: RefCell<HashMap<String, QuestionHandler>>,
    pending_answers: RefCell<HashMap<u64, oneshot::Sender<serde_json::Value>>>,
    pending_pings: RefCell<HashMap<String, Vec<oneshot::Sender<()>>>>,
}

impl<S: PeerSender + 'static> MessagePlane<S> {
    pub fn new(sender: Rc<S>, events: Rc<EventBus<Event>>) -> Rc<Self> {
        Rc::new(MessagePlane {
            sender,
            events,
            verified: RefCell::new(HashSet::new()),
            next_sequence: Cell::new(0),
            question_handlers: RefCell::new(HashMap::new()),
            pending_answers: RefCell::new(HashMap::new()),
            pending_pings: RefCell::new(HashMap::new()),
        })
    }

    pub fn mark_verified(&self, peer: &str) {
        self.verified.borrow_mut().insert(peer.to_string());
    }

    pub fn mark_unverified(&self, peer: &str) {
        self.verified.borrow_mut().remove(peer);
    }

    pub fn verified_peers(&self) -> Vec<String> {
        self.verified.borrow().iter().cloned().collect()
    }

    fn next_n(&self) -> u64 {
        let n = self.next_sequence.get();
        self.next_sequence.set(n + 1);
        n
    }

    /// Dispatches an inbound message on a named channel. Called by
    /// [`super::auth::AuthenticatedPeerClient`] once the sender has cleared
    /// the handshake gate for anything other than `identify`/`challenge`.
    pub fn handle_channel_message(self: &Rc<Self>, peer: &str, channel: &str, data: Vec<u8>) {
        self.events.emit(&Event::RtcMessage { channel: channel.to_string(), data: data.clone(), sender: peer.to_string() });
        match channel {
            "chat" => self.handle_chat(peer, &data),
            "dm" => self.handle_dm(peer, &data),
            "ping" => self.handle_ping(peer),
            "pong" => self.handle_pong(peer),
            "question" => self.handle_question(peer, &data),
            "answer" => self.handle_answer(&data),
            _ => {}
        }
    }

    fn handle_chat(&self, peer: &str, data: &[u8]) {
        let Ok(payload) = serde_json::from_slice::<ChatPayload>(data) else {
            tracing::error!(peer = %peer, "malformed chat payload");
            return;
        };
        self.events.emit(&Event::Chat { message: payload.message, sender: peer.to_string() });
    }

    fn handle_dm(&self, peer: &str, data: &[u8]) {
        let Ok(payload) = serde_json::from_slice::<DmPayload>(data) else {
            tracing::error!(peer = %peer, "malformed dm payload");
            return;
        };
        self.events.emit(&Event::Dm { message: payload.message, sender: peer.to_string() });
    }

    fn handle_ping(self: &Rc<Self>, peer: &str) {
        self.events.emit(&Event::Ping { sender: peer.to_string() });
        let this = self.clone();
        let peer = peer.to_string();
        crate::platform::spawn_local(async move {
            if let Err(err) = this.sender.send_to(&peer, "pong", b"null").await {
                tracing::error!(error = %err, peer = %peer, "failed to send pong");
            }
        });
    }

    fn handle_pong(&self, peer: &str) {
        if let Some(waiters) = self.pending_pings.borrow_mut().remove(peer) {
            for tx in waiters {
                let _ = tx.send(());
            }
        }
    }

    fn handle_question(self: &Rc<Self>, peer: &str, data: &[u8]) {
        let Ok(payload) = serde_json::from_slice::<QuestionPayload>(data) else {
            tracing::error!(peer = %peer, "malformed question payload");
            return;
        };
        let handler = self.question_handlers.borrow().get(&payload.question.topic).cloned();
        let Some(handler) = handler else {
            tracing::error!(peer = %peer, topic = %payload.question.topic, "no handler registered for question topic");
            return;
        };
        let this = self.clone();
        let peer = peer.to_string();
        crate::platform::spawn_local(async move {
            let answer = handler(payload.question.content.clone()).await;
            let response = AnswerPayload { n: payload.n, answer, question: payload.question };
            let Ok(bytes) = serde_json::to_vec(&response) else { return };
            if let Err(err) = this.sender.send_to(&peer, "answer", &bytes).await {
                tracing::error!(error = %err, peer = %peer, "failed to send answer");
            }
        });
    }

    fn handle_answer(&self, data: &[u8]) {
        let Ok(payload) = serde_json::from_slice::<AnswerPayload>(data) else {
            tracing::error!("malformed answer payload");
            return;
        };
        if let Some(tx) = self.pending_answers.borrow_mut().remove(&payload.n) {
            let _ = tx.send(payload.answer);
        }
    }

    /// Broadcasts to every peer that has cleared the handshake.
    pub async fn send_chat(&self, message: &str) -> Result<()> {
        let bytes = serde_json::to_vec(&ChatPayload { message: message.to_string() })?;
        for peer in self.verified_peers() {
            if let Err(err) = self.sender.send_to(&peer, "chat", &bytes).await {
                tracing::error!(error = %err, peer = %peer, "chat send failed");
            }
        }
        Ok(())
    }

    pub async fn send_dm(&self, target: &str, message: &str) -> Result<()> {
        let bytes = serde_json::to_vec(&DmPayload { message: message.to_string() })?;
        self.sender.send_to(target, "dm", &bytes).await
    }

    pub async fn send_question(&self, topic: &str, content: serde_json::Value, target: &str) -> Result<serde_json::Value> {
        let n = self.next_n();
        let (tx, rx) = oneshot::channel();
        self.pending_answers.borrow_mut().insert(n, tx);

        let payload = QuestionPayload { n, question: QuestionBody { topic: topic.to_string(), content } };
        let bytes = serde_json::to_vec(&payload)?;
        if let Err(err) = self.sender.send_to(target, "question", &bytes).await {
            self.pending_answers.borrow_mut().remove(&n);
            return Err(err);
        }

        rx.await.map_err(|_| Error::Other("question answer was never delivered".into()))
    }

    pub fn add_question_handler(&self, topic: impl Into<String>, handler: QuestionHandler) {
        self.question_handlers.borrow_mut().insert(topic.into(), handler);
    }

    /// Resolves once `target`'s `pong` arrives.
    pub async fn ping(&self, target: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.pending_pings.borrow_mut().entry(target.to_string()).or_default().push(tx);
        if let Err(err) = self.sender.send_to(target, "ping", b"null").await {
            if let Some(waiters) = self.pending_pings.borrow_mut().get_mut(target) {
                waiters.pop();
            }
            return Err(err);
        }
        rx.await.map_err(|_| Error::Other("ping deferred was dropped".into()))
    }

    /// Fans out to every currently-connected peer (SPEC_FULL.md §9 Open
    /// Question (a): the explicit connected-peer set at call time, not a
    /// stale room roster) and resolves once every reply has arrived.
    pub async fn ping_everyone(self: &Rc<Self>) -> Result<()> {
        let targets = self.sender.connected_peers();
        let futures = targets.iter().map(|peer| self.ping(peer));
        let results = join_all(futures).await;
        for result in results {
            result?;
        }
        Ok(())
    }

    /// Awaits the next event for which `filter` returns `true`. Backs the
    /// `nextChat`/`nextDM`/.../`nextMQTTMessage` deferreds (SPEC_FULL.md
    /// §4.10): each named helper below is this with a canned filter.
    pub fn next_event(&self, filter: impl Fn(&Event) -> bool + 'static) -> impl Future<Output = Event> {
        let (tx, rx) = oneshot::channel();
        let tx = Rc::new(RefCell::new(Some(tx)));
        let sub_holder: Rc<RefCell<Option<crate::events::Subscriber<Event>>>> = Rc::new(RefCell::new(None));
        let sub_holder2 = sub_holder.clone();
        let sub = self.events.on(move |event| {
            if filter(event) {
                if let Some(tx) = tx.borrow_mut().take() {
                    let _ = tx.send(event.clone());
                }
                if let Some(sub) = sub_holder2.borrow_mut().take() {
                    sub.unsubscribe();
                }
            }
            Ok(())
        });
        *sub_holder.borrow_mut() = Some(sub);
        async move { rx.await.expect("event bus dropped before a matching event arrived") }
    }

    pub async fn next_chat(&self) -> (String, String) {
        match self.next_event(|e| matches!(e, Event::Chat { .. })).await {
            Event::Chat { message, sender } => (message, sender),
            _ => unreachable!(),
        }
    }

    pub async fn next_dm(&self) -> (String, String) {
        match self.next_event(|e| matches!(e, Event::Dm { .. })).await {
            Event::Dm { message, sender } => (message, sender),
            _ => unreachable!(),
        }
    }

    pub async fn next_ping(&self) -> String {
        match self.next_event(|e| matches!(e, Event::Ping { .. })).await {
            Event::Ping { sender } => sender,
            _ => unreachable!(),
        }
    }

    pub async fn next_user_connection(&self) -> String {
        match self.next_event(|e| matches!(e, Event::ConnectedToPeer { .. })).await {
            Event::ConnectedToPeer { peer } => peer,
            _ => unreachable!(),
        }
    }

    pub async fn next_user_disconnection(&self) -> String {
        match self.next_event(|e| matches!(e, Event::DisconnectedFromPeer { .. })).await {
            Event::DisconnectedFromPeer { peer } => peer,
            _ => unreachable!(),
        }
    }

    pub async fn next_mqtt_message(&self) -> (String, serde_json::Value, String, i64) {
        match self.next_event(|e| matches!(e, Event::MqttMessage { .. })).await {
            Event::MqttMessage { subtopic, data, sender, timestamp } => (subtopic, data, sender, timestamp),
            _ => unreachable!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A direct in-process link between two [`MessagePlane`]s, standing in
    /// for a pair of connected, handshake-verified `BaseClient`s — the same
    /// role `MemoryBus`/`MockRtcBackend` play for the layers below this one.
    struct LoopbackSender {
        peer_name: String,
        peer_plane: RefCell<Option<Rc<MessagePlane<LoopbackSender>>>>,
    }

    #[async_trait(?Send)]
    impl PeerSender for LoopbackSender {
        async fn send_to(&self, peer: &str, channel: &str, data: &[u8]) -> Result<()> {
            assert_eq!(peer, self.peer_name, "test harness only links exactly two peers");
            let plane = self.peer_plane.borrow().clone().expect("peer plane not linked yet");
            plane.handle_channel_message("me", channel, data.to_vec());
            Ok(())
        }

        fn connected_peers(&self) -> Vec<String> {
            if self.peer_plane.borrow().is_some() {
                vec![self.peer_name.clone()]
            } else {
                vec![]
            }
        }
    }

    fn link(a_name: &str, b_name: &str) -> (Rc<MessagePlane<LoopbackSender>>, Rc<MessagePlane<LoopbackSender>>) {
        let a_sender = Rc::new(LoopbackSender { peer_name: b_name.to_string(), peer_plane: RefCell::new(None) });
        let b_sender = Rc::new(LoopbackSender { peer_name: a_name.to_string(), peer_plane: RefCell::new(None) });
        let a = MessagePlane::new(a_sender.clone(), EventBus::new());
        let b = MessagePlane::new(b_sender.clone(), EventBus::new());
        *a_sender.peer_plane.borrow_mut() = Some(b.clone());
        *b_sender.peer_plane.borrow_mut() = Some(a.clone());
        a.mark_verified(b_name);
        b.mark_verified(a_name);
        (a, b)
    }

    #[tokio::test]
    async fn chat_round_trips_exactly_once() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (alice, bob) = link("alice", "bob");
                let count = Rc::new(Cell::new(0));
                let count2 = count.clone();
                bob.events.on(move |event| {
                    if matches!(event, Event::Chat { message, sender } if message == "hi" && sender == "me") {
                        count2.set(count2.get() + 1);
                    }
                    Ok(())
                });
                alice.send_chat("hi").await.unwrap();
                assert_eq!(count.get(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn question_answer_round_trip_resolves_to_the_computed_sum() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (alice, bob) = link("alice", "bob");
                bob.add_question_handler(
                    "sum",
                    sync_handler(|content| {
                        let a = content["a"].as_i64().unwrap_or(0);
                        let b = content["b"].as_i64().unwrap_or(0);
                        serde_json::json!(a + b)
                    }),
                );
                let answer = alice.send_question("sum", serde_json::json!({"a": 2, "b": 3}), "bob").await.unwrap();
                assert_eq!(answer, serde_json::json!(5));
            })
            .await;
    }

    #[tokio::test]
    async fn ping_resolves_once_pong_arrives() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (alice, bob) = link("alice", "bob");
                let pinged = Rc::new(Cell::new(false));
                let pinged2 = pinged.clone();
                bob.events.on(move |event| {
                    if matches!(event, Event::Ping { .. }) {
                        pinged2.set(true);
                    }
                    Ok(())
                });
                alice.ping("bob").await.unwrap();
                assert!(pinged.get());
            })
            .await;
    }

    #[tokio::test]
    async fn ping_everyone_settles_once_every_reply_arrives() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (alice, _bob) = link("alice", "bob");
                alice.ping_everyone().await.unwrap();
            })
            .await;
    }

    #[tokio::test]
    async fn next_chat_resolves_with_the_matching_event() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (alice, bob) = link("alice", "bob");
                let waiter = bob.next_chat();
                alice.send_chat("hello").await.unwrap();
                let (message, sender) = waiter.await;
                assert_eq!(message, "hello");
                assert_eq!(sender, "me");
            })
            .await;
    }

    #[tokio::test]
    async fn dm_is_not_observed_as_chat() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (alice, bob) = link("alice", "bob");
                let saw_chat = Rc::new(Cell::new(false));
                let saw_chat2 = saw_chat.clone();
                bob.events.on(move |event| {
                    if matches!(event, Event::Chat { .. }) {
                        saw_chat2.set(true);
                    }
                    Ok(())
                });
                alice.send_dm("bob", "secret").await.unwrap();
                assert!(!saw_chat.get());
            })
            .await;
    }
}
