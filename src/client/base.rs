//! # Base peer client — presence and signaling state machine
//!
//! Implements SPEC_FULL.md §4.6 exactly: the five envelope handlers
//! (`connect`/`unload`/`nameChange`/`RTCOffer`/`RTCAnswer`/
//! `RTCIceCandidate`) and the `shouldConnectTo` hook, which here defaults
//! to "always yes" — [`crate::client::auth::AuthenticatedPeerClient`]
//! replaces it with the trust-policy-driven variant.

use super::event::Event;
use crate::config::IceServer;
use crate::error::Result;
use crate::events::EventBus;
use crate::platform;
use crate::rtc::{ConnectionState, PeerSession, RtcBackend};
use crate::signaling::{
    AnswerPayload, Bus, Envelope, IceCandidate, NameChangePayload, OfferPayload, RtcOfferPayload,
    SignalingTransport, Subtopic,
};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

/// Every data channel created up front when a peer connection is
/// established. `identify`/`challenge` back the auth handshake;
/// `streamoffer`/`streamanswer`/`streamice` are opened later, lazily, by
/// the call manager on top of this same data session.
pub const DATA_CHANNELS: &[&str] = &["chat", "dm", "question", "answer", "ping", "pong", "identify", "challenge"];

pub type ShouldConnectTo = Rc<dyn Fn(&str, &serde_json::Value) -> bool>;

pub struct BaseClient<B: Bus + 'static> {
    transport: Rc<SignalingTransport<B>>,
    rtc_backend: Rc<dyn RtcBackend>,
    ice_servers: Vec<IceServer>,
    local_name: RefCell<String>,
    sessions: RefCell<HashMap<String, Rc<PeerSession>>>,
    presence: RefCell<HashMap<String, serde_json::Value>>,
    pending_ice: RefCell<HashMap<String, Vec<IceCandidate>>>,
    offer_sent_to: RefCell<HashSet<String>>,
    opened_channels: RefCell<HashMap<String, HashSet<String>>>,
    connected_peers: RefCell<HashSet<String>>,
    should_connect_to: RefCell<ShouldConnectTo>,
    pub(crate) on_channel_message: RefCell<Option<Rc<dyn Fn(&str, &str, Vec<u8>)>>>,
    pub(crate) events: Rc<EventBus<Event>>,
}

impl<B: Bus + 'static> BaseClient<B> {
    pub fn new(
        transport: Rc<SignalingTransport<B>>,
        rtc_backend: Rc<dyn RtcBackend>,
        ice_servers: Vec<IceServer>,
        local_name: String,
        events: Rc<EventBus<Event>>,
    ) -> Rc<Self> {
        let client = Rc::new(BaseClient {
            transport: transport.clone(),
            rtc_backend,
            ice_servers,
            local_name: RefCell::new(local_name),
            sessions: RefCell::new(HashMap::new()),
            presence: RefCell::new(HashMap::new()),
            pending_ice: RefCell::new(HashMap::new()),
            offer_sent_to: RefCell::new(HashSet::new()),
            opened_channels: RefCell::new(HashMap::new()),
            connected_peers: RefCell::new(HashSet::new()),
            should_connect_to: RefCell::new(Rc::new(|_, _| true)),
            on_channel_message: RefCell::new(None),
            events,
        });

        let weak = Rc::downgrade(&client);
        transport.on_envelope(move |envelope| {
            if let Some(client) = weak.upgrade() {
                client.handle_envelope(envelope);
            }
        });

        let weak = Rc::downgrade(&client);
        transport.set_healthy_connection_probe(move || weak.upgrade().map(|c| c.has_healthy_connection()).unwrap_or(false));

        client
    }

    pub fn local_name(&self) -> String {
        self.local_name.borrow().clone()
    }

    pub fn set_should_connect_to(&self, predicate: ShouldConnectTo) {
        *self.should_connect_to.borrow_mut() = predicate;
    }

    pub fn events(&self) -> Rc<EventBus<Event>> {
        self.events.clone()
    }

    pub fn session(&self, peer: &str) -> Option<Rc<PeerSession>> {
        self.sessions.borrow().get(peer).cloned()
    }

    pub fn connected_peer_names(&self) -> Vec<String> {
        self.connected_peers.borrow().iter().cloned().collect()
    }

    pub fn presence_for(&self, peer: &str) -> Option<serde_json::Value> {
        self.presence.borrow().get(peer).cloned()
    }

    /// Every peer currently announced in the room, connected or not — used
    /// by the call manager's group-call upgrade rule (SPEC_FULL.md §4.11).
    pub fn known_peer_names(&self) -> Vec<String> {
        self.presence.borrow().keys().cloned().collect()
    }

    /// Connects the underlying signaling transport and starts the
    /// presence-announcement burst (SPEC_FULL.md §6 `load`).
    pub async fn connect(&self) -> Result<()> {
        self.transport.connect().await
    }

    /// Tears down a single peer connection on purpose — used by the auth
    /// layer when a handshake fails (SPEC_FULL.md §4.9).
    pub fn disconnect_peer(&self, peer: &str) {
        self.teardown(peer);
    }

    /// Renames the local peer: updates the signaling transport's announced
    /// sender name and tells every room member so they can migrate their
    /// own bookkeeping (SPEC_FULL.md §4.6 `nameChange`).
    pub async fn change_name(&self, new_name: &str) -> Result<()> {
        let old_name = self.local_name();
        *self.local_name.borrow_mut() = new_name.to_string();
        self.transport.set_sender_name(new_name.to_string());
        self.transport
            .publish(Subtopic::NameChange(NameChangePayload { old_name, new_name: new_name.to_string() }))
            .await
    }

    fn has_healthy_connection(&self) -> bool {
        self.sessions.borrow().values().any(|s| s.connection_state() == ConnectionState::Connected)
    }

    /// `true` for a peer connection whose ICE has reached a terminal
    /// failure state (SPEC_FULL.md §4.6 `connect` handler).
    fn is_terminal(session: &PeerSession) -> bool {
        matches!(session.connection_state(), ConnectionState::Failed | ConnectionState::Closed)
    }

    fn is_healthy(session: &PeerSession) -> bool {
        session.connection_state() == ConnectionState::Connected
    }

    fn teardown(&self, peer: &str) {
        if let Some(session) = self.sessions.borrow_mut().remove(peer) {
            session.close();
        }
        self.offer_sent_to.borrow_mut().remove(peer);
        self.opened_channels.borrow_mut().remove(peer);
        if self.connected_peers.borrow_mut().remove(peer) {
            self.events.emit(&Event::DisconnectedFromPeer { peer: peer.to_string() });
        }
    }

    fn new_session(self: &Rc<Self>, peer: &str) -> Result<Rc<PeerSession>> {
        let conn = self.rtc_backend.create_peer_connection(&self.ice_servers)?;
        let session = PeerSession::new(peer.to_string(), conn);
        self.wire_session(peer, &session);
        self.sessions.borrow_mut().insert(peer.to_string(), session.clone());
        Ok(session)
    }

    fn wire_session(self: &Rc<Self>, peer: &str, session: &Rc<PeerSession>) {
        let weak = Rc::downgrade(self);
        let peer_name = peer.to_string();
        let transport = self.transport.clone();
        session.on_local_ice_candidate(Rc::new(move |candidate| {
            let Some(candidate) = candidate else { return };
            if weak.upgrade().is_none() {
                return;
            }
            let transport = transport.clone();
            let peer_name = peer_name.clone();
            platform::spawn_local(async move {
                if let Err(err) = transport.publish(Subtopic::RtcIceCandidate(candidate)).await {
                    tracing::error!(error = %err, peer = %peer_name, "failed to publish ICE candidate");
                }
            });
        }));

        let weak = Rc::downgrade(self);
        let peer_name = peer.to_string();
        session.on_connection_state_change(Rc::new(move |state| {
            let Some(client) = weak.upgrade() else { return };
            if matches!(state, ConnectionState::Failed | ConnectionState::Closed | ConnectionState::Disconnected) {
                client.teardown(&peer_name);
            }
        }));

        let weak = Rc::downgrade(self);
        let peer_name = peer.to_string();
        session.on_channel_open(Rc::new(move |label| {
            let Some(client) = weak.upgrade() else { return };
            client.note_channel_open(&peer_name, label);
        }));

        let weak = Rc::downgrade(self);
        let peer_name = peer.to_string();
        session.on_message(Rc::new(move |channel, data| {
            let Some(client) = weak.upgrade() else { return };
            if let Some(handler) = client.on_channel_message.borrow().as_ref() {
                handler(&peer_name, channel, data);
            }
        }));
    }

    fn note_channel_open(&self, peer: &str, label: &str) {
        if !DATA_CHANNELS.contains(&label) {
            return;
        }
        let mut opened = self.opened_channels.borrow_mut();
        let set = opened.entry(peer.to_string()).or_default();
        set.insert(label.to_string());
        let all_open = set.len() == DATA_CHANNELS.len();
        drop(opened);

        if all_open && self.connected_peers.borrow_mut().insert(peer.to_string()) {
            self.events.emit(&Event::ConnectedToPeer { peer: peer.to_string() });
        }
    }

    fn open_fixed_channels(session: &Rc<PeerSession>) {
        for label in DATA_CHANNELS {
            let _ = session.open_channel(label);
        }
    }

    fn handle_envelope(self: &Rc<Self>, envelope: &Envelope) {
        let from = envelope.sender.clone();
        if from == self.local_name() {
            return;
        }
        match envelope.body.clone() {
            Subtopic::Connect(user_info) => self.handle_connect(from, user_info),
            Subtopic::Unload => self.handle_unload(&from),
            Subtopic::NameChange(payload) => self.handle_name_change(&from, payload),
            Subtopic::RtcOffer(payload) => self.handle_rtc_offer(from, payload),
            Subtopic::RtcAnswer(payload) => self.handle_rtc_answer(from, payload),
            Subtopic::RtcIceCandidate(candidate) => self.handle_rtc_ice_candidate(from, candidate),
        }
    }

    fn handle_connect(self: &Rc<Self>, from: String, user_info: serde_json::Value) {
        self.presence.borrow_mut().insert(from.clone(), user_info.clone());

        if let Some(session) = self.session(&from) {
            if Self::is_healthy(&session) {
                return;
            }
            if Self::is_terminal(&session) {
                self.teardown(&from);
            } else {
                return; // connection in progress
            }
        }

        if !(self.should_connect_to.borrow())(&from, &user_info) {
            return;
        }

        let this = self.clone();
        platform::spawn_local(async move {
            let Ok(session) = this.new_session(&from) else { return };
            Self::open_fixed_channels(&session);
            let offer = match session.create_offer().await {
                Ok(offer) => offer,
                Err(err) => {
                    tracing::error!(error = %err, peer = %from, "failed to create offer");
                    return;
                }
            };
            this.offer_sent_to.borrow_mut().insert(from.clone());
            let payload = RtcOfferPayload {
                user_info: this.transport.user_info(),
                offer: OfferPayload { local_description: offer, target: from.clone() },
            };
            if let Err(err) = this.transport.publish(Subtopic::RtcOffer(payload)).await {
                tracing::error!(error = %err, peer = %from, "failed to publish offer");
            }
        });
    }

    fn handle_unload(&self, from: &str) {
        self.teardown(from);
        self.presence.borrow_mut().remove(from);
    }

    fn handle_name_change(&self, from: &str, payload: NameChangePayload) {
        if payload.old_name != from {
            return;
        }
        if let Some(presence) = self.presence.borrow_mut().remove(&payload.old_name) {
            self.presence.borrow_mut().insert(payload.new_name.clone(), presence);
        }
        if let Some(session) = self.sessions.borrow_mut().remove(&payload.old_name) {
            session.set_peer_name(payload.new_name.clone());
            self.sessions.borrow_mut().insert(payload.new_name.clone(), session);
        }
        if let Some(opened) = self.opened_channels.borrow_mut().remove(&payload.old_name) {
            self.opened_channels.borrow_mut().insert(payload.new_name.clone(), opened);
        }
        if self.connected_peers.borrow_mut().remove(&payload.old_name) {
            self.connected_peers.borrow_mut().insert(payload.new_name.clone());
        }
        self.events.emit(&Event::NameChange { old: payload.old_name, new: payload.new_name });
    }

    fn handle_rtc_offer(self: &Rc<Self>, from: String, payload: RtcOfferPayload) {
        if payload.offer.target != self.local_name() {
            return;
        }
        if !(self.should_connect_to.borrow())(&from, &payload.user_info) {
            return;
        }
        self.teardown(&from);

        let this = self.clone();
        platform::spawn_local(async move {
            let Ok(session) = this.new_session(&from) else { return };
            Self::open_fixed_channels(&session);
            let answer = match session.create_answer(payload.offer.local_description).await {
                Ok(answer) => answer,
                Err(err) => {
                    tracing::error!(error = %err, peer = %from, "failed to create answer");
                    return;
                }
            };
            if let Some(buffered) = this.pending_ice.borrow_mut().remove(&from) {
                for candidate in buffered {
                    let _ = session.add_remote_ice_candidate(candidate).await;
                }
            }
            let answer_payload = AnswerPayload { local_description: answer, target: from.clone() };
            if let Err(err) = this.transport.publish(Subtopic::RtcAnswer(answer_payload)).await {
                tracing::error!(error = %err, peer = %from, "failed to publish answer");
            }
        });
    }

    fn handle_rtc_answer(self: &Rc<Self>, from: String, payload: AnswerPayload) {
        if payload.target != self.local_name() {
            return;
        }
        if !self.offer_sent_to.borrow_mut().remove(&from) {
            return; // not in have-local-offer state
        }
        let Some(session) = self.session(&from) else { return };
        let this = self.clone();
        platform::spawn_local(async move {
            if let Err(err) = session.set_remote_description(payload.local_description).await {
                tracing::error!(error = %err, peer = %from, "failed to apply answer");
                return;
            }
            if let Some(buffered) = this.pending_ice.borrow_mut().remove(&from) {
                for candidate in buffered {
                    let _ = session.add_remote_ice_candidate(candidate).await;
                }
            }
        });
    }

    fn handle_rtc_ice_candidate(self: &Rc<Self>, from: String, candidate: IceCandidate) {
        if let Some(session) = self.session(&from) {
            platform::spawn_local(async move {
                if let Err(err) = session.add_remote_ice_candidate(candidate).await {
                    tracing::error!(error = %err, peer = %from, "failed to apply buffered ICE candidate");
                }
            });
        } else {
            self.pending_ice.borrow_mut().entry(from).or_default().push(candidate);
        }
    }

    pub async fn send(&self, peer: &str, channel: &str, data: &[u8]) -> Result<()> {
        let session = self
            .session(peer)
            .ok_or_else(|| crate::error::Error::UnknownPeer { peer: peer.to_string() })?;
        session.send(channel, data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtc::MockRtcBackend;
    use crate::signaling::{MemoryBroker, MemoryBus};

    fn make_client(broker: Rc<MemoryBroker>, name: &str) -> Rc<BaseClient<MemoryBus>> {
        let bus = Rc::new(MemoryBus::new(broker));
        let transport = SignalingTransport::new(
            bus,
            "room/1".to_string(),
            name.to_string(),
            serde_json::Value::Null,
            false,
            1024,
            true,
            10,
        );
        BaseClient::new(transport, Rc::new(MockRtcBackend), vec![], name.to_string(), EventBus::new())
    }

    async fn settle() {
        // Lets the single-threaded executor drain the `spawn_local` tasks
        // each handler kicks off before asserting on their effects.
        for _ in 0..20 {
            crate::platform::sleep(0).await;
        }
    }

    #[tokio::test]
    async fn offer_answer_exchange_creates_a_session_on_both_sides() {
        // Two independent `MockPeerConnection`s are not wired together
        // (that requires the test-only `pair_with`, which production code
        // never calls), so this only exercises the envelope exchange: both
        // peers end up with a session for each other and the local-offer
        // side clears `offer_sent_to` once the answer lands.
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let broker = MemoryBroker::new();
                let alice = make_client(broker.clone(), "alice(0)");
                let bob = make_client(broker, "bob(0)");

                alice.transport.connect().await.unwrap();
                bob.transport.connect().await.unwrap();
                settle().await;
                settle().await;

                assert!(alice.session("bob(0)").is_some());
                assert!(bob.session("alice(0)").is_some());
                assert!(!alice.offer_sent_to.borrow().contains("bob(0)"));
            })
            .await;
    }

    #[tokio::test]
    async fn answer_is_dropped_without_a_prior_local_offer() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let broker = MemoryBroker::new();
                let alice = make_client(broker, "alice(0)");

                let bogus = AnswerPayload {
                    local_description: crate::signaling::SessionDescription {
                        sdp_type: "answer".into(),
                        sdp: "v=0".into(),
                    },
                    target: "alice(0)".into(),
                };
                alice.handle_rtc_answer("mallory(0)".to_string(), bogus);
                settle().await;
                assert!(alice.session("mallory(0)").is_none());
            })
            .await;
    }

    #[tokio::test]
    async fn should_connect_to_false_blocks_the_connect_handshake() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let broker = MemoryBroker::new();
                let alice = make_client(broker.clone(), "alice(0)");
                let bob = make_client(broker, "bob(0)");
                alice.set_should_connect_to(Rc::new(|_, _| false));

                alice.transport.connect().await.unwrap();
                bob.transport.connect().await.unwrap();
                settle().await;
                settle().await;

                assert!(alice.session("bob(0)").is_none());
            })
            .await;
    }

    #[tokio::test]
    async fn connectedtopeer_fires_once_every_named_channel_has_opened() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let broker = MemoryBroker::new();
                let alice = make_client(broker, "alice(0)");

                let seen = Rc::new(RefCell::new(0));
                let seen2 = seen.clone();
                alice.events().on(move |event| {
                    if matches!(event, Event::ConnectedToPeer { peer } if peer == "bob(0)") {
                        *seen2.borrow_mut() += 1;
                    }
                    Ok(())
                });

                for label in &DATA_CHANNELS[..DATA_CHANNELS.len() - 1] {
                    alice.note_channel_open("bob(0)", *label);
                }
                assert_eq!(*seen.borrow(), 0);
                assert!(!alice.connected_peer_names().contains(&"bob(0)".to_string()));

                alice.note_channel_open("bob(0)", DATA_CHANNELS[DATA_CHANNELS.len() - 1]);
                assert_eq!(*seen.borrow(), 1);
                assert!(alice.connected_peer_names().contains(&"bob(0)".to_string()));

                // A channel re-opening afterwards must not re-fire the event.
                alice.note_channel_open("bob(0)", DATA_CHANNELS[0]);
                assert_eq!(*seen.borrow(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn unload_tears_down_the_session_and_emits_disconnected() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let broker = MemoryBroker::new();
                let alice = make_client(broker.clone(), "alice(0)");
                let bob = make_client(broker, "bob(0)");

                alice.transport.connect().await.unwrap();
                bob.transport.connect().await.unwrap();
                settle().await;
                settle().await;
                assert!(alice.session("bob(0)").is_some());

                for label in DATA_CHANNELS {
                    alice.note_channel_open("bob(0)", *label);
                }
                assert!(alice.connected_peer_names().contains(&"bob(0)".to_string()));

                let seen = Rc::new(RefCell::new(false));
                let seen2 = seen.clone();
                alice.events().on(move |event| {
                    if let Event::DisconnectedFromPeer { peer } = event {
                        if peer == "bob(0)" {
                            *seen2.borrow_mut() = true;
                        }
                    }
                    Ok(())
                });

                bob.transport.disconnect().await.unwrap();
                settle().await;

                assert!(alice.session("bob(0)").is_none());
                assert!(*seen.borrow());
            })
            .await;
    }
}
