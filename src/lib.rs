//! # rtchat-core
//!
//! Browser-resident WebRTC mesh networking: MQTT-over-WebSockets presence
//! and signaling, an RSA-PSS trust handshake, a chat/dm/question/ping
//! message plane over data channels, and a call manager that keeps every
//! member of a group call connected to every other (the "mesh invariant").
//! See `SPEC_FULL.md` for the full design.
//!
//! ## Module Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  config          validated, defaulted Options → Config          │
//! │  storage         localStorage / in-memory key-value contract    │
//! │  events          per-object typed pub/sub                       │
//! │  tabs            per-tab id disambiguation ("name(id)")         │
//! │  signaling       MQTT bus + envelope transport + burst presence │
//! │  keystore        RSA-PSS identity, known-hosts table             │
//! │  rtc             RTCPeerConnection wrapper + data channels       │
//! │  trust           connect-decision policy table                  │
//! │  client          presence/handshake/message-plane composition   │
//! │  call            the mesh invariant over data-channel signaling │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency
//!
//! Everything here runs on one cooperative event loop — the browser's, or
//! a `tokio::task::LocalSet` off-browser for tests — so interior state uses
//! `Rc<RefCell<_>>` throughout rather than `Arc<Mutex<_>>`. See
//! [`platform`] for the two task-spawning backends this relies on.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod call;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod keystore;
/// Platform-aware task spawning and sleeping for native and WASM targets.
pub mod platform;
pub mod rtc;
pub mod signaling;
pub mod storage;
pub mod tabs;
/// Platform-aware time utilities for native and WASM targets.
pub mod time;
pub mod trust;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use call::{CallKind, CallManager, CallStatus, MediaSource, NullMediaSource};
pub use client::{AuthenticatedPeerClient, CallDirection, CallMetrics, Event};
pub use config::{Config, Options};
pub use error::{Error, Result};
pub use trust::TrustPolicy;

use std::rc::Rc;

/// The storage backend a [`RtChat`] built with [`RtChat::new`] uses:
/// `localStorage` in the browser, an in-process map everywhere else.
#[cfg(target_arch = "wasm32")]
pub type DefaultStorage = storage::BrowserStorage;
#[cfg(not(target_arch = "wasm32"))]
pub type DefaultStorage = storage::MemoryStorage;

/// The signaling bus a [`RtChat`] built with [`RtChat::new`] uses: a
/// hand-rolled MQTT-over-WebSocket client in the browser (there is no
/// `wasm32-unknown-unknown` MQTT crate), `rumqttc` everywhere else. Off-
/// browser is test/tooling only — this crate ships to a browser.
#[cfg(target_arch = "wasm32")]
pub type DefaultBus = signaling::MqttBus;
#[cfg(not(target_arch = "wasm32"))]
pub type DefaultBus = signaling::RumqttBus;

/// The RTC backend a [`RtChat`] built with [`RtChat::new`] uses.
/// Off-browser there is no real `RTCPeerConnection`, so the mock backend
/// stands in; every behavior test exercises it instead.
#[cfg(target_arch = "wasm32")]
fn default_rtc_backend() -> Rc<dyn rtc::RtcBackend> {
    rtc::WebSysRtcBackend::new()
}
#[cfg(not(target_arch = "wasm32"))]
fn default_rtc_backend() -> Rc<dyn rtc::RtcBackend> {
    rtc::MockRtcBackend::new()
}

fn trust_policy_for_mode(mode: &str) -> TrustPolicy {
    match mode {
        "alwaysprompt" => TrustPolicy::alwaysprompt(),
        "strictandquiet" => TrustPolicy::strictandquiet(),
        "moderate" => TrustPolicy::moderate(),
        "moderateandquiet" => TrustPolicy::moderateandquiet(),
        "lax" => TrustPolicy::lax(),
        "unsafe" => TrustPolicy::unsafe_(),
        "rejectall" => TrustPolicy::rejectall(),
        _ => TrustPolicy::strict(),
    }
}

/// Splits a `scheme://host:port[/path]` broker URL into `(host, port)` for
/// `rumqttc::MqttOptions::new`, which wants them apart. The browser bus
/// takes the URL whole, since `web_sys::WebSocket::new` does too.
#[cfg(not(target_arch = "wasm32"))]
fn split_broker_host_port(url: &str) -> Result<(String, u16)> {
    let without_scheme = url.splitn(2, "://").nth(1).unwrap_or(url);
    let host_port = without_scheme.split('/').next().unwrap_or(without_scheme);
    let (host, port) = host_port
        .rsplit_once(':')
        .ok_or_else(|| Error::MalformedBusUrl { url: url.to_string() })?;
    let port: u16 = port.parse().map_err(|_| Error::MalformedBusUrl { url: url.to_string() })?;
    Ok((host.to_string(), port))
}

/// The top-level handle an embedding application holds (SPEC_FULL.md §6):
/// one per room join, composing every layer behind the public operations
/// an application actually calls.
pub struct RtChat {
    config: Config,
    #[allow(dead_code)]
    storage: Rc<DefaultStorage>,
    tabs: Option<tabs::TabRegistry<DefaultStorage>>,
    peer: Rc<AuthenticatedPeerClient<DefaultBus>>,
    calls: Rc<CallManager<DefaultBus>>,
}

impl RtChat {
    /// Builds every layer from a partial options bag and returns a handle
    /// ready for [`Self::load`]. `default_name`/`default_room` supply
    /// dynamic defaults (e.g. a random name, the room in the page URL) that
    /// this crate has no way to compute on its own.
    pub fn new(
        options: Options,
        default_name: impl FnOnce() -> String,
        default_room: impl FnOnce() -> String,
    ) -> Result<Rc<RtChat>> {
        let config = Config::build(options, default_name, default_room)?;

        #[cfg(target_arch = "wasm32")]
        let storage = Rc::new(DefaultStorage::new()?);
        #[cfg(not(target_arch = "wasm32"))]
        let storage = Rc::new(DefaultStorage::new());

        let tabs = if config.tabs.enabled {
            Some(tabs::TabRegistry::new(storage.clone(), config.tabs.poll_interval_ms, config.tabs.timeout_s))
        } else {
            None
        };
        let public_name = tabs.as_ref().map(|t| t.public_name(&config.name)).unwrap_or_else(|| config.name.clone());

        let keystore = keystore::Keystore::load(storage.as_ref(), config.generate)?;

        #[cfg(target_arch = "wasm32")]
        let bus = Rc::new(DefaultBus::new(config.broker().to_string(), public_name.clone(), 30));
        #[cfg(not(target_arch = "wasm32"))]
        let bus = {
            let (host, port) = split_broker_host_port(config.broker())?;
            Rc::new(DefaultBus::new(&host, port, &public_name, 30))
        };

        let identity_user_info = serde_json::json!({ "identity": keystore.identity_string(&public_name) });
        let transport = signaling::SignalingTransport::new(
            bus,
            config.full_topic(),
            public_name.clone(),
            identity_user_info,
            config.compression.enabled,
            config.compression.threshold_bytes,
            config.history.enabled,
            config.history.max_length,
        );

        let rtc_backend = default_rtc_backend();
        let event_bus = events::EventBus::new();
        let base =
            client::BaseClient::new(transport, rtc_backend, config.webrtc.ice_servers.clone(), public_name, event_bus);
        let message_plane = client::MessagePlane::new(base.clone(), events::EventBus::new());
        let storage_dyn: Rc<dyn storage::Storage> = storage.clone();
        let trust_policy = trust_policy_for_mode(&config.trust_mode);
        let peer = AuthenticatedPeerClient::new(base, message_plane, keystore, storage_dyn, trust_policy);
        let calls = CallManager::new(peer.clone(), Rc::new(NullMediaSource), config.connection.connection_timeout_ms, 2_000);

        Ok(Rc::new(RtChat { config, storage, tabs, peer, calls }))
    }

    /// The frozen, validated configuration this client was built from.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The per-tab id this client claimed, if tab disambiguation is
    /// enabled (SPEC_FULL.md §4.4).
    pub fn tab_id(&self) -> Option<u32> {
        self.tabs.as_ref().map(|t| t.id())
    }

    /// Subscribe-only surface for every event named in SPEC_FULL.md §6.
    pub fn events(&self) -> Rc<events::EventBus<Event>> {
        self.peer.events()
    }

    /// Connects to the signaling bus and starts the presence burst.
    pub async fn load(&self) -> Result<()> {
        self.peer.load().await
    }

    /// Tears down every peer connection.
    pub async fn disconnect(&self) -> Result<()> {
        self.peer.disconnect().await
    }

    /// Renames the local peer and announces the change to the room.
    pub async fn change_name(&self, new_name: &str) -> Result<()> {
        let public_name = self.tabs.as_ref().map(|t| t.public_name(new_name)).unwrap_or_else(|| new_name.to_string());
        self.peer.change_name(&public_name).await
    }

    /// Broadcasts a chat message to every connected, validated peer.
    pub async fn send_rtc_chat(&self, message: &str) -> Result<()> {
        self.peer.send_rtc_chat(message).await
    }

    /// Sends a direct message to one validated peer.
    pub async fn send_rtc_dm(&self, target: &str, message: &str) -> Result<()> {
        self.peer.send_rtc_dm(target, message).await
    }

    /// Sends a question to `target` and awaits its answer.
    pub async fn send_rtc_question(&self, topic: &str, content: serde_json::Value, target: &str) -> Result<serde_json::Value> {
        self.peer.send_rtc_question(topic, content, target).await
    }

    /// Registers a handler that answers incoming questions on `topic`.
    pub fn add_question_handler(&self, topic: impl Into<String>, handler: client::QuestionHandler) {
        self.peer.add_question_handler(topic, handler);
    }

    /// Pings one validated peer.
    pub async fn ping(&self, target: &str) -> Result<()> {
        self.peer.ping(target).await
    }

    /// Pings every connected peer.
    pub async fn ping_everyone(&self) -> Result<()> {
        self.peer.ping_everyone().await
    }

    /// Starts (or joins the mesh for) a call with `peer`.
    pub async fn call_user(&self, peer: &str, kind: CallKind) -> Result<()> {
        self.calls.call_user(peer, kind).await
    }

    /// Ends the call with `peer`, if one is pending or active.
    pub fn end_call_with_user(&self, peer: &str) {
        self.calls.end_call_with_user(peer);
    }

    /// Lets an application accept a call left pending by
    /// [`CallManager::pending_incoming_calls`] when no auto-accept hook is
    /// installed.
    pub fn accept_incoming_call(&self, peer: &str) -> Result<()> {
        self.calls.accept_incoming_call(peer)
    }

    /// Declines a call left pending in the same way.
    pub fn decline_incoming_call(&self, peer: &str) {
        self.calls.decline_incoming_call(peer);
    }

    /// Every call this client has not yet accepted or declined.
    pub fn pending_incoming_calls(&self) -> Vec<String> {
        self.calls.pending_incoming_calls()
    }

    /// The last known presence payload for `name`, if any.
    pub fn get_peer(&self, name: &str) -> Option<serde_json::Value> {
        self.peer.get_peer(name)
    }

    /// Vouches for `peer`, bypassing the trust policy table on its next
    /// connection attempt.
    pub fn trust(&self, peer: &str) {
        self.peer.trust(peer);
    }

    /// Re-triggers the identify/challenge handshake against an
    /// already-connected peer.
    pub fn challenge(&self, peer: &str) -> Result<()> {
        self.peer.challenge(peer)
    }

    /// Pre-binds an identity string into the known-hosts table.
    pub fn register(&self, identity: &str) -> Result<()> {
        self.peer.register(identity)
    }

    /// Forgets a single peer's stored trust decision.
    pub fn untrust(&self, peer: &str) -> Result<()> {
        self.peer.untrust(peer)
    }

    /// Forgets every stored trust decision.
    pub fn reset(&self) -> Result<()> {
        self.peer.reset()
    }
}

/// Returns the version of rtchat-core.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }

    #[tokio::test]
    async fn builds_a_client_against_the_mock_backend() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mut options = Options::default();
                options.mqtt = Some(config::MqttOptionsPartial { broker: Some("mqtt://localhost:1883".into()), ..Default::default() });
                options.tabs = Some(config::TabOptionsPartial { enabled: Some(false), ..Default::default() });
                let rtchat = RtChat::new(options, || "alice".to_string(), || "lobby".to_string()).unwrap();
                assert_eq!(rtchat.config().room(), "lobby");
                assert!(rtchat.tab_id().is_none());
                assert!(rtchat.get_peer("nobody").is_none());
            })
            .await;
    }
}
