//! The `RtcBackend` seam (SPEC_FULL.md §4.7): everything above this trait
//! boundary is plain state-machine logic exercised in tests against
//! [`super::mock::MockRtcBackend`]; everything below it is a thin wrapper
//! around `web_sys::RtcPeerConnection` ([`super::websys::WebSysRtcBackend`]).

use crate::error::Result;
use crate::signaling::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Produces raw peer connections. One implementation per platform plus a
/// mock for tests.
pub trait RtcBackend {
    fn create_peer_connection(&self, ice_servers: &[crate::config::IceServer]) -> Result<Rc<dyn RtcConnection>>;
}

/// One underlying RTCPeerConnection. Media tracks are accepted and exposed
/// opaquely — this crate never negotiates codecs, it only shuttles the
/// `MediaStreamTrack` handles the browser already negotiated.
#[async_trait(?Send)]
pub trait RtcConnection {
    fn create_data_channel(&self, label: &str) -> Result<Rc<dyn RtcDataChannel>>;
    fn on_data_channel(&self, handler: Rc<dyn Fn(Rc<dyn RtcDataChannel>)>);

    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    fn on_ice_candidate(&self, handler: Rc<dyn Fn(Option<IceCandidate>)>);
    fn on_connection_state_change(&self, handler: Rc<dyn Fn(ConnectionState)>);
    fn connection_state(&self) -> ConnectionState;

    /// Attaches an outgoing local media track (opaque handle on wasm32:
    /// a `web_sys::MediaStreamTrack`). A no-op on backends without media
    /// support (the mock).
    fn add_local_track(&self, track: Rc<dyn std::any::Any>) -> Result<()>;
    fn on_track(&self, handler: Rc<dyn Fn(Rc<dyn std::any::Any>)>);

    async fn get_stats(&self) -> Result<serde_json::Value>;
    fn close(&self);
}

/// One RTCDataChannel.
pub trait RtcDataChannel {
    fn label(&self) -> &str;
    fn send(&self, data: &[u8]) -> Result<()>;
    fn ready_state(&self) -> DataChannelState;
    fn on_open(&self, handler: Rc<dyn Fn()>);
    fn on_message(&self, handler: Rc<dyn Fn(Vec<u8>)>);
    fn on_close(&self, handler: Rc<dyn Fn()>);
}
