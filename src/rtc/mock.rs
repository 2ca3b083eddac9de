//! In-memory `RtcBackend` used by every test in this crate (and by any
//! native tooling that wants to exercise the peer/client/call layers
//! without a browser). Two [`MockPeerConnection`]s can be linked together
//! with [`MockPeerConnection::pair_with`] so that offer/answer/ICE and
//! data-channel traffic on one side is visible to the other, the same way
//! `MemoryBus` stands in for a real broker in the signaling tests.

use super::backend::{ConnectionState, DataChannelState, RtcBackend, RtcConnection, RtcDataChannel};
use crate::config::IceServer;
use crate::error::Result;
use crate::signaling::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

pub struct MockRtcBackend;

impl MockRtcBackend {
    pub fn new() -> Rc<Self> {
        Rc::new(MockRtcBackend)
    }
}

impl RtcBackend for MockRtcBackend {
    fn create_peer_connection(&self, _ice_servers: &[IceServer]) -> Result<Rc<dyn RtcConnection>> {
        Ok(MockPeerConnection::new())
    }
}

impl MockRtcBackend {
    /// Like [`RtcBackend::create_peer_connection`] but returns the concrete
    /// type so tests can call [`MockPeerConnection::pair_with`] on it.
    pub fn new_connection(&self) -> Rc<MockPeerConnection> {
        MockPeerConnection::new()
    }
}

struct MockChannelState {
    ready_state: Cell<DataChannelState>,
    peer: RefCell<Weak<MockDataChannel>>,
    on_open: RefCell<Option<Rc<dyn Fn()>>>,
    on_message: RefCell<Option<Rc<dyn Fn(Vec<u8>)>>>,
    on_close: RefCell<Option<Rc<dyn Fn()>>>,
}

pub struct MockDataChannel {
    label: String,
    state: MockChannelState,
}

impl MockDataChannel {
    fn new(label: &str) -> Rc<Self> {
        Rc::new(MockDataChannel {
            label: label.to_string(),
            state: MockChannelState {
                ready_state: Cell::new(DataChannelState::Connecting),
                peer: RefCell::new(Weak::new()),
                on_open: RefCell::new(None),
                on_message: RefCell::new(None),
                on_close: RefCell::new(None),
            },
        })
    }

    /// Links two data channels (one per side) so each one's `send` is
    /// delivered to the other's `on_message`, and opens both.
    pub fn pair(a: &Rc<MockDataChannel>, b: &Rc<MockDataChannel>) {
        *a.state.peer.borrow_mut() = Rc::downgrade(b);
        *b.state.peer.borrow_mut() = Rc::downgrade(a);
        for side in [a, b] {
            side.state.ready_state.set(DataChannelState::Open);
            if let Some(handler) = side.state.on_open.borrow().as_ref() {
                handler();
            }
        }
    }
}

impl RtcDataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn send(&self, data: &[u8]) -> Result<()> {
        if self.state.ready_state.get() != DataChannelState::Open {
            return Err(crate::error::Error::ChannelClosed { channel: self.label.clone() });
        }
        if let Some(peer) = self.state.peer.borrow().upgrade() {
            if let Some(handler) = peer.state.on_message.borrow().as_ref() {
                handler(data.to_vec());
            }
        }
        Ok(())
    }

    fn ready_state(&self) -> DataChannelState {
        self.state.ready_state.get()
    }

    fn on_open(&self, handler: Rc<dyn Fn()>) {
        if self.state.ready_state.get() == DataChannelState::Open {
            handler();
        }
        *self.state.on_open.borrow_mut() = Some(handler);
    }

    fn on_message(&self, handler: Rc<dyn Fn(Vec<u8>)>) {
        *self.state.on_message.borrow_mut() = Some(handler);
    }

    fn on_close(&self, handler: Rc<dyn Fn()>) {
        *self.state.on_close.borrow_mut() = Some(handler);
    }
}

pub struct MockPeerConnection {
    channels: RefCell<HashMap<String, Rc<MockDataChannel>>>,
    on_data_channel: RefCell<Option<Rc<dyn Fn(Rc<dyn RtcDataChannel>)>>>,
    on_ice_candidate: RefCell<Option<Rc<dyn Fn(Option<IceCandidate>)>>>,
    on_state_change: RefCell<Option<Rc<dyn Fn(ConnectionState)>>>,
    state: Cell<ConnectionState>,
    remote: RefCell<Weak<MockPeerConnection>>,
    offer_counter: Cell<u64>,
}

impl MockPeerConnection {
    fn new() -> Rc<Self> {
        Rc::new(MockPeerConnection {
            channels: RefCell::new(HashMap::new()),
            on_data_channel: RefCell::new(None),
            on_ice_candidate: RefCell::new(None),
            on_state_change: RefCell::new(None),
            state: Cell::new(ConnectionState::New),
            remote: RefCell::new(Weak::new()),
            offer_counter: Cell::new(0),
        })
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.set(state);
        if let Some(handler) = self.on_state_change.borrow().as_ref() {
            handler(state);
        }
    }

    /// Links two mock connections so that data channels created by one
    /// side with the same label are wired together, and both transition
    /// to `Connected`. Intended for tests that drive the full
    /// offer/answer/ICE flow through real [`super::session::PeerSession`]
    /// logic and then assert on delivered messages.
    pub fn pair_with(self: &Rc<Self>, other: &Rc<MockPeerConnection>) {
        *self.remote.borrow_mut() = Rc::downgrade(other);
        *other.remote.borrow_mut() = Rc::downgrade(self);

        for (label, channel) in self.channels.borrow().iter() {
            if let Some(peer_channel) = other.channels.borrow().get(label) {
                MockDataChannel::pair(channel, peer_channel);
            }
        }
        self.set_state(ConnectionState::Connected);
        other.set_state(ConnectionState::Connected);
    }
}

#[async_trait(?Send)]
impl RtcConnection for MockPeerConnection {
    fn create_data_channel(&self, label: &str) -> Result<Rc<dyn RtcDataChannel>> {
        let channel = MockDataChannel::new(label);
        self.channels.borrow_mut().insert(label.to_string(), channel.clone());
        Ok(channel)
    }

    fn on_data_channel(&self, handler: Rc<dyn Fn(Rc<dyn RtcDataChannel>)>) {
        *self.on_data_channel.borrow_mut() = Some(handler);
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let n = self.offer_counter.get() + 1;
        self.offer_counter.set(n);
        Ok(SessionDescription { sdp_type: "offer".to_string(), sdp: format!("mock-offer-{n}") })
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription { sdp_type: "answer".to_string(), sdp: "mock-answer".to_string() })
    }

    async fn set_local_description(&self, _description: SessionDescription) -> Result<()> {
        self.set_state(ConnectionState::Connecting);
        Ok(())
    }

    async fn set_remote_description(&self, _description: SessionDescription) -> Result<()> {
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<()> {
        Ok(())
    }

    fn on_ice_candidate(&self, handler: Rc<dyn Fn(Option<IceCandidate>)>) {
        *self.on_ice_candidate.borrow_mut() = Some(handler);
    }

    fn on_connection_state_change(&self, handler: Rc<dyn Fn(ConnectionState)>) {
        *self.on_state_change.borrow_mut() = Some(handler);
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.get()
    }

    fn add_local_track(&self, _track: Rc<dyn Any>) -> Result<()> {
        Ok(())
    }

    fn on_track(&self, _handler: Rc<dyn Fn(Rc<dyn Any>)>) {}

    async fn get_stats(&self) -> Result<serde_json::Value> {
        Ok(serde_json::json!({ "mock": true }))
    }

    fn close(&self) {
        self.set_state(ConnectionState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpaired_channel_send_is_a_silent_no_op() {
        let backend = MockRtcBackend::new();
        let a = backend.new_connection();
        let chan_a = a.create_data_channel("data").unwrap();
        assert!(chan_a.send(b"hello").is_ok());
    }

    #[test]
    fn paired_channels_deliver_messages_both_ways() {
        let backend = MockRtcBackend::new();
        let a = backend.new_connection();
        let b = backend.new_connection();

        let chan_a = a.create_data_channel("data").unwrap();
        let chan_b = b.create_data_channel("data").unwrap();

        let received_by_b: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        let recv = received_by_b.clone();
        chan_b.on_message(Rc::new(move |data: Vec<u8>| *recv.borrow_mut() = data));

        a.pair_with(&b);
        assert_eq!(a.connection_state(), ConnectionState::Connected);
        assert_eq!(b.connection_state(), ConnectionState::Connected);

        chan_a.send(b"hello").unwrap();
        assert_eq!(&*received_by_b.borrow(), b"hello");
    }
}
