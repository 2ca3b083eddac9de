//! `web_sys::RtcPeerConnection` backed implementation of [`RtcConnection`].
//! Callback wiring follows the same "keep the `Closure` alive in a struct
//! field instead of `.forget()`-ing it" pattern the teacher uses for its
//! `RtcDataChannel` wrapper, adapted from `Arc<Mutex<_>>` to `Rc<RefCell<_>>`
//! since everything here runs on the single browser event loop thread.

#![cfg(target_arch = "wasm32")]

use super::backend::{ConnectionState, DataChannelState, RtcBackend, RtcConnection, RtcDataChannel};
use crate::config::IceServer as ConfigIceServer;
use crate::error::{Error, Result};
use crate::signaling::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use js_sys::{Array, ArrayBuffer, Reflect, Uint8Array};
use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use wasm_bindgen::closure::Closure;
use wasm_bindgen::{JsCast, JsValue};
use wasm_bindgen_futures::JsFuture;
use web_sys::{
    RtcConfiguration, RtcDataChannelInit, RtcDataChannelState, RtcIceCandidateInit, RtcIceServer,
    RtcPeerConnection, RtcPeerConnectionState, RtcSdpType, RtcSessionDescriptionInit,
};

pub struct WebSysRtcBackend;

impl WebSysRtcBackend {
    pub fn new() -> Rc<Self> {
        Rc::new(WebSysRtcBackend)
    }
}

impl RtcBackend for WebSysRtcBackend {
    fn create_peer_connection(&self, ice_servers: &[ConfigIceServer]) -> Result<Rc<dyn RtcConnection>> {
        let config = RtcConfiguration::new();
        let servers = Array::new();
        for server in ice_servers {
            let entry = RtcIceServer::new();
            let urls = Array::new();
            for url in &server.urls {
                urls.push(&JsValue::from_str(url));
            }
            entry.set_urls(&urls.into());
            if let Some(username) = &server.username {
                entry.set_username(username);
            }
            if let Some(credential) = &server.credential {
                entry.set_credential(credential);
            }
            servers.push(&entry);
        }
        config.set_ice_servers(&servers);

        let pc = RtcPeerConnection::new_with_configuration(&config)
            .map_err(|_| Error::Transport("RTCPeerConnection constructor threw".into()))?;
        Ok(WebSysConnection::new(pc))
    }
}

fn rtc_state_to_connection_state(state: RtcPeerConnectionState) -> ConnectionState {
    match state {
        RtcPeerConnectionState::New => ConnectionState::New,
        RtcPeerConnectionState::Connecting => ConnectionState::Connecting,
        RtcPeerConnectionState::Connected => ConnectionState::Connected,
        RtcPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RtcPeerConnectionState::Failed => ConnectionState::Failed,
        RtcPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

struct WebSysConnection {
    pc: RtcPeerConnection,
    _on_ice_candidate: RefCell<Option<Closure<dyn FnMut(web_sys::RtcPeerConnectionIceEvent)>>>,
    _on_connection_state_change: RefCell<Option<Closure<dyn FnMut()>>>,
    _on_data_channel: RefCell<Option<Closure<dyn FnMut(web_sys::RtcDataChannelEvent)>>>,
    _on_track: RefCell<Option<Closure<dyn FnMut(web_sys::RtcTrackEvent)>>>,
}

impl WebSysConnection {
    fn new(pc: RtcPeerConnection) -> Rc<dyn RtcConnection> {
        Rc::new(WebSysConnection {
            pc,
            _on_ice_candidate: RefCell::new(None),
            _on_connection_state_change: RefCell::new(None),
            _on_data_channel: RefCell::new(None),
            _on_track: RefCell::new(None),
        })
    }
}

#[async_trait(?Send)]
impl RtcConnection for WebSysConnection {
    fn create_data_channel(&self, label: &str) -> Result<Rc<dyn RtcDataChannel>> {
        let init = RtcDataChannelInit::new();
        let channel = self.pc.create_data_channel_with_data_channel_dict(label, &init);
        Ok(WebSysDataChannel::new(channel))
    }

    fn on_data_channel(&self, handler: Rc<dyn Fn(Rc<dyn RtcDataChannel>)>) {
        let closure = Closure::<dyn FnMut(web_sys::RtcDataChannelEvent)>::new(move |event: web_sys::RtcDataChannelEvent| {
            handler(WebSysDataChannel::new(event.channel()));
        });
        self.pc.set_ondatachannel(Some(closure.as_ref().unchecked_ref()));
        *self._on_data_channel.borrow_mut() = Some(closure);
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let promise = self.pc.create_offer();
        let value = JsFuture::from(promise).await.map_err(|_| Error::Transport("createOffer rejected".into()))?;
        description_from_js(&value)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let promise = self.pc.create_answer();
        let value = JsFuture::from(promise).await.map_err(|_| Error::Transport("createAnswer rejected".into()))?;
        description_from_js(&value)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let init = description_to_init(&description)?;
        JsFuture::from(self.pc.set_local_description(&init))
            .await
            .map_err(|_| Error::Transport("setLocalDescription rejected".into()))?;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let init = description_to_init(&description)?;
        JsFuture::from(self.pc.set_remote_description(&init))
            .await
            .map_err(|_| Error::Transport("setRemoteDescription rejected".into()))?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RtcIceCandidateInit::new(&candidate.candidate);
        if let Some(mid) = &candidate.sdp_mid {
            init.set_sdp_mid(Some(mid));
        }
        if let Some(index) = candidate.sdp_m_line_index {
            init.set_sdp_m_line_index(Some(index));
        }
        let rtc_candidate = web_sys::RtcIceCandidate::new(&init)
            .map_err(|_| Error::Transport("RTCIceCandidate constructor threw".into()))?;
        JsFuture::from(self.pc.add_ice_candidate_with_opt_rtc_ice_candidate(Some(&rtc_candidate)))
            .await
            .map_err(|_| Error::Transport("addIceCandidate rejected".into()))?;
        Ok(())
    }

    fn on_ice_candidate(&self, handler: Rc<dyn Fn(Option<IceCandidate>)>) {
        let closure = Closure::<dyn FnMut(web_sys::RtcPeerConnectionIceEvent)>::new(
            move |event: web_sys::RtcPeerConnectionIceEvent| {
                let candidate = event.candidate().map(|c| IceCandidate {
                    candidate: c.candidate(),
                    sdp_mid: c.sdp_mid(),
                    sdp_m_line_index: c.sdp_m_line_index(),
                });
                handler(candidate);
            },
        );
        self.pc.set_onicecandidate(Some(closure.as_ref().unchecked_ref()));
        *self._on_ice_candidate.borrow_mut() = Some(closure);
    }

    fn on_connection_state_change(&self, handler: Rc<dyn Fn(ConnectionState)>) {
        let pc = self.pc.clone();
        let closure = Closure::<dyn FnMut()>::new(move || {
            handler(rtc_state_to_connection_state(pc.connection_state()));
        });
        self.pc.set_onconnectionstatechange(Some(closure.as_ref().unchecked_ref()));
        *self._on_connection_state_change.borrow_mut() = Some(closure);
    }

    fn connection_state(&self) -> ConnectionState {
        rtc_state_to_connection_state(self.pc.connection_state())
    }

    fn add_local_track(&self, track: Rc<dyn Any>) -> Result<()> {
        let track = track
            .downcast::<web_sys::MediaStreamTrack>()
            .map_err(|_| Error::Media("add_local_track given a non-MediaStreamTrack handle".into()))?;
        self.pc.add_track_0(&track, &Array::new());
        Ok(())
    }

    fn on_track(&self, handler: Rc<dyn Fn(Rc<dyn Any>)>) {
        let closure = Closure::<dyn FnMut(web_sys::RtcTrackEvent)>::new(move |event: web_sys::RtcTrackEvent| {
            handler(Rc::new(event.track()) as Rc<dyn Any>);
        });
        self.pc.set_ontrack(Some(closure.as_ref().unchecked_ref()));
        *self._on_track.borrow_mut() = Some(closure);
    }

    async fn get_stats(&self) -> Result<serde_json::Value> {
        let value = JsFuture::from(self.pc.get_stats()).await.map_err(|_| Error::Transport("getStats rejected".into()))?;
        serde_wasm_bindgen_to_json(&value)
    }

    fn close(&self) {
        self.pc.close();
    }
}

fn description_to_init(description: &SessionDescription) -> Result<RtcSessionDescriptionInit> {
    let sdp_type = match description.sdp_type.as_str() {
        "offer" => RtcSdpType::Offer,
        "answer" => RtcSdpType::Answer,
        "pranswer" => RtcSdpType::Pranswer,
        "rollback" => RtcSdpType::Rollback,
        other => return Err(Error::Media(format!("unknown sdp type: {other}"))),
    };
    let init = RtcSessionDescriptionInit::new(sdp_type);
    init.set_sdp(&description.sdp);
    Ok(init)
}

fn description_from_js(value: &JsValue) -> Result<SessionDescription> {
    let sdp_type = Reflect::get(value, &JsValue::from_str("type"))
        .ok()
        .and_then(|v| v.as_string())
        .ok_or_else(|| Error::Media("session description missing type".into()))?;
    let sdp = Reflect::get(value, &JsValue::from_str("sdp"))
        .ok()
        .and_then(|v| v.as_string())
        .ok_or_else(|| Error::Media("session description missing sdp".into()))?;
    Ok(SessionDescription { sdp_type, sdp })
}

/// `RTCStatsReport` is a JS `Map`; flatten it into a plain JSON object.
fn serde_wasm_bindgen_to_json(value: &JsValue) -> Result<serde_json::Value> {
    let mut out = serde_json::Map::new();
    let entries = js_sys::try_iter(value).ok().flatten();
    if let Some(entries) = entries {
        for entry in entries.flatten() {
            let pair: Array = entry.unchecked_into();
            let key = pair.get(0).as_string().unwrap_or_default();
            let val = pair.get(1);
            let as_text = js_sys::JSON::stringify(&val).ok().and_then(|s| s.as_string()).unwrap_or_else(|| "null".into());
            let parsed = serde_json::from_str(&as_text).unwrap_or(serde_json::Value::Null);
            out.insert(key, parsed);
        }
    }
    Ok(serde_json::Value::Object(out))
}

struct WebSysDataChannel {
    channel: web_sys::RtcDataChannel,
    label: String,
    _on_open: RefCell<Option<Closure<dyn FnMut()>>>,
    _on_message: RefCell<Option<Closure<dyn FnMut(web_sys::MessageEvent)>>>,
    _on_close: RefCell<Option<Closure<dyn FnMut()>>>,
}

impl WebSysDataChannel {
    fn new(channel: web_sys::RtcDataChannel) -> Rc<dyn RtcDataChannel> {
        channel.set_binary_type(web_sys::RtcDataChannelType::Arraybuffer);
        let label = channel.label();
        Rc::new(WebSysDataChannel {
            channel,
            label,
            _on_open: RefCell::new(None),
            _on_message: RefCell::new(None),
            _on_close: RefCell::new(None),
        })
    }
}

impl RtcDataChannel for WebSysDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn send(&self, data: &[u8]) -> Result<()> {
        self.channel
            .send_with_u8_array(data)
            .map_err(|_| Error::ChannelClosed { channel: self.label.clone() })
    }

    fn ready_state(&self) -> DataChannelState {
        match self.channel.ready_state() {
            RtcDataChannelState::Connecting => DataChannelState::Connecting,
            RtcDataChannelState::Open => DataChannelState::Open,
            RtcDataChannelState::Closing => DataChannelState::Closing,
            RtcDataChannelState::Closed => DataChannelState::Closed,
            _ => DataChannelState::Closed,
        }
    }

    fn on_open(&self, handler: Rc<dyn Fn()>) {
        let closure = Closure::<dyn FnMut()>::new(move || handler());
        self.channel.set_onopen(Some(closure.as_ref().unchecked_ref()));
        *self._on_open.borrow_mut() = Some(closure);
    }

    fn on_message(&self, handler: Rc<dyn Fn(Vec<u8>)>) {
        let closure = Closure::<dyn FnMut(web_sys::MessageEvent)>::new(move |event: web_sys::MessageEvent| {
            if let Ok(buffer) = event.data().dyn_into::<ArrayBuffer>() {
                let array = Uint8Array::new(&buffer);
                handler(array.to_vec());
            }
        });
        self.channel.set_onmessage(Some(closure.as_ref().unchecked_ref()));
        *self._on_message.borrow_mut() = Some(closure);
    }

    fn on_close(&self, handler: Rc<dyn Fn()>) {
        let closure = Closure::<dyn FnMut()>::new(move || handler());
        self.channel.set_onclose(Some(closure.as_ref().unchecked_ref()));
        *self._on_close.borrow_mut() = Some(closure);
    }
}
