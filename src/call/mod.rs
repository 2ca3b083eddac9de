//! Call manager — the mesh invariant (SPEC_FULL.md §4.11)
//!
//! Sits beside [`crate::client::auth::AuthenticatedPeerClient`]: tracks
//! per-peer call state, negotiates media over the `streamoffer`/
//! `streamanswer`/`streamice`/`endcall` channels the client layer already
//! opened a data session for, and keeps every mesh participant connected to
//! every other as members join and leave.
//!
//! ICE candidates generated while renegotiating a call still flow over the
//! signaling bus through the same `on_local_ice_candidate` wiring the base
//! client installed for the original connection — `streamice` is accepted
//! here for symmetry with `streamoffer`/`streamanswer` but this crate never
//! originates traffic on it, since a peer connection has exactly one ICE
//! transport regardless of how many times it is renegotiated.

use crate::client::auth::AuthenticatedPeerClient;
use crate::client::event::{CallDirection, CallMetrics, Event};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::platform;
use crate::signaling::{Bus, IceCandidate, SessionDescription};
use futures::future::{select, Either};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Inactive,
    Pending,
    Active,
}

#[derive(Debug, Clone, Copy)]
struct CallState {
    status: CallStatus,
    kind: CallKind,
}

#[derive(Debug, Serialize, Deserialize)]
struct OfferSignal {
    description: SessionDescription,
    kind: CallKind,
}

/// Produces and releases opaque local media track handles. This crate
/// never negotiates codecs or provisions capture devices itself — it only
/// asks for and hands around whatever the platform gives it.
pub trait MediaSource {
    fn capture(&self, kind: CallKind) -> Result<Rc<dyn Any>>;
}

/// A `MediaSource` that hands out an inert placeholder handle — the call
/// manager's RTC-facing logic is exercised against [`crate::rtc::MockRtcBackend`],
/// which treats every track handle as opaque anyway.
pub struct NullMediaSource;

impl MediaSource for NullMediaSource {
    fn capture(&self, _kind: CallKind) -> Result<Rc<dyn Any>> {
        Ok(Rc::new(()))
    }
}

pub struct CallManager<B: Bus + 'static> {
    client: Rc<AuthenticatedPeerClient<B>>,
    media: Rc<dyn MediaSource>,
    events: Rc<EventBus<Event>>,
    call_timeout_ms: u32,
    stats_poll_interval_ms: u32,
    calls: RefCell<HashMap<String, CallState>>,
    pending_incoming: RefCell<HashSet<String>>,
    pending_offers: RefCell<HashMap<String, OfferSignal>>,
    outgoing_dialing: RefCell<HashSet<String>>,
    connect_waiters: RefCell<HashMap<String, oneshot::Sender<()>>>,
    active_local_track: RefCell<Option<(CallKind, Rc<dyn Any>)>>,
    remote_tracks: RefCell<HashMap<String, Rc<dyn Any>>>,
    mesh: RefCell<HashSet<String>>,
    mesh_kind: RefCell<Option<CallKind>>,
    auto_accept_hook: RefCell<Option<Rc<dyn Fn(&str, CallKind) -> bool>>>,
    cached_metrics: RefCell<HashMap<String, CallMetrics>>,
    polling_active: Cell<bool>,
    stats_handle: RefCell<Option<platform::IntervalHandle>>,
}

impl<B: Bus + 'static> CallManager<B> {
    pub fn new(
        client: Rc<AuthenticatedPeerClient<B>>,
        media: Rc<dyn MediaSource>,
        call_timeout_ms: u32,
        stats_poll_interval_ms: u32,
    ) -> Rc<Self> {
        let events = client.events();
        let manager = Rc::new(CallManager {
            client: client.clone(),
            media,
            events,
            call_timeout_ms,
            stats_poll_interval_ms,
            calls: RefCell::new(HashMap::new()),
            pending_incoming: RefCell::new(HashSet::new()),
            pending_offers: RefCell::new(HashMap::new()),
            outgoing_dialing: RefCell::new(HashSet::new()),
            connect_waiters: RefCell::new(HashMap::new()),
            active_local_track: RefCell::new(None),
            remote_tracks: RefCell::new(HashMap::new()),
            mesh: RefCell::new(HashSet::new()),
            mesh_kind: RefCell::new(None),
            auto_accept_hook: RefCell::new(None),
            cached_metrics: RefCell::new(HashMap::new()),
            polling_active: Cell::new(false),
            stats_handle: RefCell::new(None),
        });

        let weak = Rc::downgrade(&manager);
        client.set_call_channel_handler(Rc::new(move |peer, channel, data| {
            if let Some(manager) = weak.upgrade() {
                manager.handle_call_channel(peer, channel, data);
            }
        }));

        let weak = Rc::downgrade(&manager);
        client.events().on(move |event| {
            if let Event::DisconnectedFromPeer { peer } = event {
                if let Some(manager) = weak.upgrade() {
                    manager.end_call_with_user(peer);
                }
            }
            Ok(())
        });

        manager
    }

    /// Lets an application decide whether to surface an incoming call it
    /// would not otherwise auto-accept (no mesh yet, no active call). Absent
    /// a hook, such calls are left in [`Self::pending_incoming_calls`] for
    /// the application to accept or decline explicitly.
    pub fn set_auto_accept_hook(&self, hook: Rc<dyn Fn(&str, CallKind) -> bool>) {
        *self.auto_accept_hook.borrow_mut() = Some(hook);
    }

    pub fn call_status(&self, peer: &str) -> CallStatus {
        self.calls.borrow().get(peer).map(|s| s.status).unwrap_or(CallStatus::Inactive)
    }

    pub fn mesh_members(&self) -> Vec<String> {
        self.mesh.borrow().iter().cloned().collect()
    }

    /// Stops the stats-poll interval immediately, regardless of whether any
    /// call is still active — used when tearing down the whole client.
    pub fn stop_stats_polling(&self) {
        if let Some(handle) = self.stats_handle.borrow_mut().take() {
            handle.cancel();
        }
        self.polling_active.set(false);
    }

    pub fn pending_incoming_calls(&self) -> Vec<String> {
        self.pending_incoming.borrow().iter().cloned().collect()
    }

    pub fn decline_incoming_call(&self, peer: &str) {
        self.pending_incoming.borrow_mut().remove(peer);
        self.pending_offers.borrow_mut().remove(peer);
    }

    pub fn accept_incoming_call(self: &Rc<Self>, peer: &str) -> Result<()> {
        let Some(payload) = self.pending_offers.borrow_mut().remove(peer) else {
            return Err(Error::UnknownPeer { peer: peer.to_string() });
        };
        self.pending_incoming.borrow_mut().remove(peer);
        self.accept_offer(peer.to_string(), payload);
        Ok(())
    }

    /// Starts (or no-ops onto, if one is already pending/active) a call to
    /// `peer`, resolving once the answer lands or rejecting on timeout
    /// (SPEC_FULL.md §4.11 `startCall`).
    pub async fn call_user(self: &Rc<Self>, peer: &str, kind: CallKind) -> Result<()> {
        if !matches!(self.call_status(peer), CallStatus::Inactive) {
            return Ok(());
        }
        self.clear_stale(peer);
        self.outgoing_dialing.borrow_mut().insert(peer.to_string());
        self.calls.borrow_mut().insert(peer.to_string(), CallState { status: CallStatus::Pending, kind });

        let (tx, rx) = oneshot::channel();
        self.connect_waiters.borrow_mut().insert(peer.to_string(), tx);

        if let Err(err) = self.send_offer(peer, kind).await {
            self.connect_waiters.borrow_mut().remove(peer);
            self.calls.borrow_mut().insert(peer.to_string(), CallState { status: CallStatus::Inactive, kind });
            return Err(err);
        }

        self.await_connect_or_timeout(peer, rx, CallDirection::Outgoing).await
    }

    /// Races the answer/pong side of a dial against `call_timeout_ms`,
    /// reporting a missed call on loss (SPEC_FULL.md §4.11 "Timeouts").
    async fn await_connect_or_timeout(&self, peer: &str, rx: oneshot::Receiver<()>, direction: CallDirection) -> Result<()> {
        let timeout = platform::sleep(self.call_timeout_ms);
        let recv: Pin<Box<dyn Future<Output = _>>> = Box::pin(rx);
        let timeout: Pin<Box<dyn Future<Output = ()>>> = Box::pin(timeout);
        match select(recv, timeout).await {
            Either::Left((Ok(()), _)) => Ok(()),
            _ => {
                let mesh_initiated = self.mesh.borrow().contains(peer);
                self.timeout_call(peer, direction, mesh_initiated);
                Err(Error::Other(format!("call to {peer} timed out")))
            }
        }
    }

    /// Ends a call with `peer` if one is pending or active. Safe to call
    /// more than once or on a peer with no call at all — only the
    /// transition away from pending/active emits `callended` (SPEC_FULL.md
    /// §8, invariant 6). Tells the remote side over the `endcall` channel so
    /// it tears down its own media session too, without touching the data
    /// session either side still has open (SPEC_FULL.md §4.11/§9).
    pub fn end_call_with_user(self: &Rc<Self>, peer: &str) {
        let was_live = !matches!(self.call_status(peer), CallStatus::Inactive);
        if was_live {
            self.notify_peer_endcall(peer);
        }
        self.teardown_call_state(peer, was_live);
    }

    fn notify_peer_endcall(self: &Rc<Self>, peer: &str) {
        let client = self.client.clone();
        let peer = peer.to_string();
        platform::spawn_local(async move {
            if let Err(err) = client.send_raw(&peer, "endcall", &[]).await {
                tracing::error!(error = %err, peer = %peer, "failed to notify peer of call end");
            }
        });
    }

    /// Local-only teardown shared by [`Self::end_call_with_user`] and an
    /// incoming `endcall` (which must not echo another `endcall` back).
    fn teardown_call_state(&self, peer: &str, was_live: bool) {
        let kind = self.calls.borrow().get(peer).map(|s| s.kind).unwrap_or(CallKind::Audio);
        self.calls.borrow_mut().insert(peer.to_string(), CallState { status: CallStatus::Inactive, kind });
        self.clear_stale(peer);
        self.shrink_mesh(peer);
        self.remote_tracks.borrow_mut().remove(peer);
        if let Some(tx) = self.connect_waiters.borrow_mut().remove(peer) {
            let _ = tx.send(());
        }
        if was_live {
            self.events.emit(&Event::CallEnded { peer: peer.to_string() });
        }
    }

    fn clear_stale(&self, peer: &str) {
        self.pending_incoming.borrow_mut().remove(peer);
        self.pending_offers.borrow_mut().remove(peer);
        self.outgoing_dialing.borrow_mut().remove(peer);
    }

    fn capture_track(&self, kind: CallKind) -> Result<Rc<dyn Any>> {
        if let Some((cached_kind, track)) = self.active_local_track.borrow().as_ref() {
            if *cached_kind == kind {
                return Ok(track.clone());
            }
        }
        let track = self.media.capture(kind)?;
        *self.active_local_track.borrow_mut() = Some((kind, track.clone()));
        Ok(track)
    }

    fn wire_remote_track(self: &Rc<Self>, peer: &str, session: &Rc<crate::rtc::PeerSession>) {
        let weak = Rc::downgrade(self);
        let peer_name = peer.to_string();
        session.on_track(Rc::new(move |track| {
            if let Some(this) = weak.upgrade() {
                this.remote_tracks.borrow_mut().insert(peer_name.clone(), track);
            }
        }));
    }

    async fn send_offer(self: &Rc<Self>, peer: &str, kind: CallKind) -> Result<()> {
        let session = self.client.peer_session(peer).ok_or_else(|| Error::UnknownPeer { peer: peer.to_string() })?;
        session.open_channel("streamoffer")?;
        session.open_channel("streamanswer")?;
        session.open_channel("streamice")?;
        session.open_channel("endcall")?;
        self.wire_remote_track(peer, &session);

        let track = self.capture_track(kind)?;
        session.add_local_track(track)?;
        let description = session.create_offer().await?;
        let bytes = serde_json::to_vec(&OfferSignal { description, kind })?;
        self.client.send_raw(peer, "streamoffer", &bytes).await
    }

    fn handle_call_channel(self: &Rc<Self>, peer: &str, channel: &str, data: Vec<u8>) {
        match channel {
            "streamoffer" => self.handle_offer(peer, &data),
            "streamanswer" => self.handle_answer(peer, &data),
            "streamice" => self.handle_ice(peer, &data),
            "endcall" => self.handle_endcall(peer),
            _ => {}
        }
    }

    /// A remote-initiated hangup: tears down the media session only, the
    /// same as a local [`Self::end_call_with_user`] minus the outbound
    /// notification (this peer didn't ask to end the call, it's being told).
    fn handle_endcall(&self, peer: &str) {
        let was_live = !matches!(self.call_status(peer), CallStatus::Inactive);
        self.teardown_call_state(peer, was_live);
    }

    fn handle_offer(self: &Rc<Self>, peer: &str, data: &[u8]) {
        let Ok(payload) = serde_json::from_slice::<OfferSignal>(data) else {
            tracing::error!(peer = %peer, "malformed stream offer");
            return;
        };
        if self.should_auto_accept(peer, payload.kind) {
            self.accept_offer(peer.to_string(), payload);
            return;
        }

        self.pending_incoming.borrow_mut().insert(peer.to_string());
        self.pending_offers.borrow_mut().insert(peer.to_string(), payload);

        let this = self.clone();
        let peer = peer.to_string();
        platform::spawn_local(async move {
            platform::sleep(this.call_timeout_ms).await;
            if this.pending_incoming.borrow_mut().remove(&peer) {
                this.pending_offers.borrow_mut().remove(&peer);
                this.events.emit(&Event::CallTimeout { peer, direction: CallDirection::Incoming });
            }
        });
    }

    fn should_auto_accept(&self, peer: &str, kind: CallKind) -> bool {
        if !self.mesh.borrow().is_empty() {
            return true;
        }
        if self.calls.borrow().values().any(|s| s.status == CallStatus::Active) {
            return true;
        }
        match self.auto_accept_hook.borrow().as_ref() {
            Some(hook) => hook(peer, kind),
            None => false,
        }
    }

    fn accept_offer(self: &Rc<Self>, peer: String, payload: OfferSignal) {
        self.clear_stale(&peer);
        self.calls.borrow_mut().insert(peer.clone(), CallState { status: CallStatus::Pending, kind: payload.kind });

        let this = self.clone();
        platform::spawn_local(async move {
            let Some(session) = this.client.peer_session(&peer) else { return };
            let _ = session.open_channel("streamoffer");
            let _ = session.open_channel("streamanswer");
            let _ = session.open_channel("streamice");
            let _ = session.open_channel("endcall");
            this.wire_remote_track(&peer, &session);

            let track = match this.capture_track(payload.kind) {
                Ok(track) => track,
                Err(err) => {
                    this.events.emit(&Event::CallError { peer, message: err.to_string() });
                    return;
                }
            };
            let _ = session.add_local_track(track);

            let answer = match session.create_answer(payload.description).await {
                Ok(answer) => answer,
                Err(err) => {
                    this.events.emit(&Event::CallError { peer, message: err.to_string() });
                    return;
                }
            };
            let Ok(bytes) = serde_json::to_vec(&answer) else { return };
            if this.client.send_raw(&peer, "streamanswer", &bytes).await.is_err() {
                return;
            }
            this.promote_active(&peer, payload.kind);
        });
    }

    fn handle_answer(self: &Rc<Self>, peer: &str, data: &[u8]) {
        let Ok(description) = serde_json::from_slice::<SessionDescription>(data) else {
            tracing::error!(peer = %peer, "malformed stream answer");
            return;
        };
        let Some(session) = self.client.peer_session(peer) else { return };
        let kind = self.calls.borrow().get(peer).map(|s| s.kind).unwrap_or(CallKind::Audio);
        let this = self.clone();
        let peer = peer.to_string();
        platform::spawn_local(async move {
            if session.set_remote_description(description).await.is_err() {
                return;
            }
            this.promote_active(&peer, kind);
        });
    }

    fn handle_ice(self: &Rc<Self>, peer: &str, data: &[u8]) {
        let Ok(candidate) = serde_json::from_slice::<IceCandidate>(data) else {
            tracing::error!(peer = %peer, "malformed stream ICE candidate");
            return;
        };
        let Some(session) = self.client.peer_session(peer) else { return };
        platform::spawn_local(async move {
            if let Err(err) = session.add_remote_ice_candidate(candidate).await {
                tracing::error!(error = %err, peer = %peer, "failed to apply call-channel ICE candidate");
            }
        });
    }

    fn promote_active(self: &Rc<Self>, peer: &str, kind: CallKind) {
        self.outgoing_dialing.borrow_mut().remove(peer);
        self.calls.borrow_mut().insert(peer.to_string(), CallState { status: CallStatus::Active, kind });
        if let Some(tx) = self.connect_waiters.borrow_mut().remove(peer) {
            let _ = tx.send(());
        }

        let local = self.active_local_track.borrow().as_ref().map(|(_, t)| t.clone()).unwrap_or_else(|| Rc::new(()));
        let remote = self.remote_tracks.borrow().get(peer).cloned().unwrap_or_else(|| Rc::new(()));
        self.events.emit(&Event::CallConnected { peer: peer.to_string(), local_stream: local, remote_stream: remote });

        self.grow_mesh(peer, kind);
        self.maybe_start_stats_polling();
    }

    /// SPEC_FULL.md §4.11 "Mesh growth": extends an already-nonempty mesh,
    /// or upgrades a plain 1:1 call into one once the group-call threshold
    /// is met.
    fn grow_mesh(self: &Rc<Self>, peer: &str, kind: CallKind) {
        let already_meshed = !self.mesh.borrow().is_empty();
        if already_meshed {
            let mut mesh = self.mesh.borrow_mut();
            mesh.insert(peer.to_string());
            mesh.insert(self.client.local_name());
            let targets: Vec<String> = mesh.iter().filter(|p| p.as_str() != peer && **p != self.client.local_name()).cloned().collect();
            drop(mesh);
            self.dial_missing(targets, kind);
            return;
        }

        let active_count = self.calls.borrow().values().filter(|s| s.status == CallStatus::Active).count();
        let room_count = self.client.known_peer_names().len();
        if active_count < 2 && room_count < 2 {
            return;
        }

        let mut seed: HashSet<String> = HashSet::new();
        seed.insert(self.client.local_name());
        for (p, s) in self.calls.borrow().iter() {
            if s.status == CallStatus::Active {
                seed.insert(p.clone());
            }
        }
        for p in self.client.known_peer_names() {
            seed.insert(p);
        }
        *self.mesh.borrow_mut() = seed.clone();
        *self.mesh_kind.borrow_mut() = Some(kind);

        let local = self.client.local_name();
        let targets: Vec<String> = seed.into_iter().filter(|p| *p != local).collect();
        self.dial_missing(targets, kind);
    }

    fn dial_missing(self: &Rc<Self>, targets: Vec<String>, kind: CallKind) {
        for target in targets {
            self.clear_stale(&target);
            if !matches!(self.call_status(&target), CallStatus::Inactive) {
                continue;
            }
            let this = self.clone();
            platform::spawn_local(async move {
                if let Err(err) = this.call_user(&target, kind).await {
                    tracing::error!(error = %err, peer = %target, "mesh fan-out call failed");
                }
            });
        }
    }

    /// SPEC_FULL.md §4.11 "Mesh shrink": drops `peer` from the mesh;
    /// collapses it once at most one member remains.
    fn shrink_mesh(&self, peer: &str) {
        let mut mesh = self.mesh.borrow_mut();
        mesh.remove(peer);
        if mesh.len() <= 1 {
            mesh.clear();
            *self.mesh_kind.borrow_mut() = None;
        }
    }

    fn timeout_call(&self, peer: &str, direction: CallDirection, mesh_initiated: bool) {
        let kind = self.calls.borrow().get(peer).map(|s| s.kind).unwrap_or(CallKind::Audio);
        self.calls.borrow_mut().insert(peer.to_string(), CallState { status: CallStatus::Inactive, kind });
        self.clear_stale(peer);
        // Mesh-initiated outbound attempts time out silently (SPEC_FULL.md
        // §4.11): the application only cares about calls it asked for.
        if !mesh_initiated {
            self.events.emit(&Event::CallTimeout { peer: peer.to_string(), direction });
        }
    }

    /// Starts the stats-poll interval the first time a call becomes active;
    /// the tick itself stops the interval once no call is active anymore
    /// (SPEC_FULL.md §4.11 "Stats polling").
    fn maybe_start_stats_polling(self: &Rc<Self>) {
        if self.polling_active.get() {
            return;
        }
        self.polling_active.set(true);
        let this = self.clone();
        let handle = platform::run_interval(self.stats_poll_interval_ms, move || {
            let active: Vec<String> =
                this.calls.borrow().iter().filter(|(_, s)| s.status == CallStatus::Active).map(|(p, _)| p.clone()).collect();
            if active.is_empty() {
                this.polling_active.set(false);
                return false;
            }
            for peer in active {
                let this = this.clone();
                platform::spawn_local(async move { this.poll_one_peer_stats(&peer).await });
            }
            true
        });
        *self.stats_handle.borrow_mut() = Some(handle);
    }

    async fn poll_one_peer_stats(self: &Rc<Self>, peer: &str) {
        let Some(session) = self.client.peer_session(peer) else { return };
        let Ok(stats) = session.get_stats().await else { return };

        let mut metrics = self.cached_metrics.borrow().get(peer).copied().unwrap_or_default();
        if let Some(v) = stats.get("rttMs").and_then(|v| v.as_f64()) {
            metrics.rtt_ms = Some(v);
        }
        if let Some(v) = stats.get("packetLossPercent").and_then(|v| v.as_f64()) {
            metrics.packet_loss_percent = Some(v);
        }
        if let Some(v) = stats.get("jitterMs").and_then(|v| v.as_f64()) {
            metrics.jitter_ms = Some(v);
        }
        self.cached_metrics.borrow_mut().insert(peer.to_string(), metrics);
        self.events.emit(&Event::MetricsUpdated { peer: peer.to_string(), metrics });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::base::BaseClient;
    use crate::client::message_plane::MessagePlane;
    use crate::events::EventBus;
    use crate::rtc::MockRtcBackend;
    use crate::signaling::{MemoryBroker, MemoryBus, SignalingTransport};
    use crate::storage::MemoryStorage;
    use crate::trust::TrustPolicy;

    fn make_manager(broker: Rc<MemoryBroker>, name: &str) -> Rc<CallManager<MemoryBus>> {
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
        let base = BaseClient::new(transport, Rc::new(MockRtcBackend), vec![], name.to_string(), EventBus::new());
        let message_plane = MessagePlane::new(base.clone(), EventBus::new());
        let storage = Rc::new(MemoryStorage::new());
        let keystore = crate::keystore::Keystore::generate(storage.as_ref()).unwrap();
        let client = AuthenticatedPeerClient::new(base, message_plane, keystore, storage, TrustPolicy::unsafe_());
        CallManager::new(client, Rc::new(NullMediaSource), 50, 25)
    }

    async fn settle() {
        for _ in 0..60 {
            crate::platform::sleep(0).await;
        }
    }

    #[tokio::test]
    async fn idempotent_end_call_emits_callended_exactly_once() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let broker = MemoryBroker::new();
                let manager = make_manager(broker, "alice(0)");
                manager.calls.borrow_mut().insert("bob(0)".to_string(), CallState { status: CallStatus::Active, kind: CallKind::Audio });

                let ended = Rc::new(RefCell::new(0));
                let ended2 = ended.clone();
                manager.client.events().on(move |event| {
                    if matches!(event, Event::CallEnded { peer } if peer == "bob(0)") {
                        *ended2.borrow_mut() += 1;
                    }
                    Ok(())
                });

                manager.end_call_with_user("bob(0)");
                manager.end_call_with_user("bob(0)");

                assert_eq!(*ended.borrow(), 1);
                assert_eq!(manager.call_status("bob(0)"), CallStatus::Inactive);
            })
            .await;
    }

    #[tokio::test]
    async fn incoming_endcall_tears_down_the_call_without_echoing_another_endcall() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let broker = MemoryBroker::new();
                let manager = make_manager(broker, "alice(0)");
                manager.calls.borrow_mut().insert("bob(0)".to_string(), CallState { status: CallStatus::Active, kind: CallKind::Audio });

                let ended = Rc::new(RefCell::new(0));
                let ended2 = ended.clone();
                manager.client.events().on(move |event| {
                    if matches!(event, Event::CallEnded { peer } if peer == "bob(0)") {
                        *ended2.borrow_mut() += 1;
                    }
                    Ok(())
                });

                manager.handle_call_channel("bob(0)", "endcall", vec![]);
                settle().await;

                assert_eq!(manager.call_status("bob(0)"), CallStatus::Inactive);
                assert_eq!(*ended.borrow(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn mesh_collapses_once_it_shrinks_to_one_member() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let broker = MemoryBroker::new();
                let manager = make_manager(broker, "alice(0)");
                *manager.mesh.borrow_mut() = ["alice(0)", "bob(0)", "carol(0)"].iter().map(|s| s.to_string()).collect();
                *manager.mesh_kind.borrow_mut() = Some(CallKind::Audio);

                manager.shrink_mesh("carol(0)");
                assert_eq!(manager.mesh_members().len(), 2);
                assert!(manager.mesh_kind.borrow().is_some());

                manager.shrink_mesh("bob(0)");
                assert!(manager.mesh_members().is_empty());
                assert!(manager.mesh_kind.borrow().is_none());
            })
            .await;
    }

    #[tokio::test]
    async fn nonempty_mesh_auto_accepts_incoming_calls() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let broker = MemoryBroker::new();
                let manager = make_manager(broker, "alice(0)");
                assert!(!manager.should_auto_accept("carol(0)", CallKind::Audio));

                manager.mesh.borrow_mut().insert("bob(0)".to_string());
                assert!(manager.should_auto_accept("carol(0)", CallKind::Audio));
            })
            .await;
    }

    #[tokio::test]
    async fn missed_call_times_out_on_both_sides_with_correct_direction() {
        // Drives the timeout machinery directly on each side rather than
        // through a real two-party session: dialing requires the
        // `streamoffer` data channel to actually open, which the mock RTC
        // backend here never pairs (see the base-client tests for why) —
        // the behavior under test is the timeout/direction bookkeeping, not
        // the channel handshake itself (already covered by `PeerSession`'s
        // own tests).
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let broker = MemoryBroker::new();
                let alice = make_manager(broker.clone(), "alice(0)");
                let bob = make_manager(broker, "bob(0)");

                let alice_timeout = Rc::new(RefCell::new(None));
                let a2 = alice_timeout.clone();
                alice.client.events().on(move |event| {
                    if let Event::CallTimeout { peer, direction } = event {
                        *a2.borrow_mut() = Some((peer.clone(), *direction));
                    }
                    Ok(())
                });

                let bob_timeout = Rc::new(RefCell::new(None));
                let b2 = bob_timeout.clone();
                bob.client.events().on(move |event| {
                    if let Event::CallTimeout { peer, direction } = event {
                        *b2.borrow_mut() = Some((peer.clone(), *direction));
                    }
                    Ok(())
                });

                alice.calls.borrow_mut().insert("bob(0)".to_string(), CallState { status: CallStatus::Pending, kind: CallKind::Audio });
                let (tx, rx) = oneshot::channel();
                alice.connect_waiters.borrow_mut().insert("bob(0)".to_string(), tx);
                let _ = alice.await_connect_or_timeout("bob(0)", rx, CallDirection::Outgoing).await;

                let offer = OfferSignal {
                    description: SessionDescription { sdp_type: "offer".into(), sdp: "mock".into() },
                    kind: CallKind::Audio,
                };
                bob.handle_offer("alice(0)", &serde_json::to_vec(&offer).unwrap());
                settle().await;
                platform::sleep(60).await;
                settle().await;

                assert_eq!(*alice_timeout.borrow(), Some(("bob(0)".to_string(), CallDirection::Outgoing)));
                assert_eq!(*bob_timeout.borrow(), Some(("alice(0)".to_string(), CallDirection::Incoming)));
                assert_eq!(alice.call_status("bob(0)"), CallStatus::Inactive);
                assert_eq!(bob.call_status("alice(0)"), CallStatus::Inactive);
            })
            .await;
    }
}
