//! # Configuration
//!
//! Validates and normalizes a partial options bag into a frozen, fully
//! defaulted [`Config`] record. See SPEC_FULL.md §4.1.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Options (partial, user-supplied)                            │
//! │        │                                                     │
//! │        ▼ deep-merge over defaults                            │
//! │  Config::build()                                              │
//! │        │                                                     │
//! │        ├──► validate name (no "(", ")", "|", no surrounding   │
//! │        │    whitespace)                                       │
//! │        ├──► validate/normalize broker URL                     │
//! │        ├──► coerce ICE servers into [{urls}]                  │
//! │        └──► normalize bare `topic` string to {room}           │
//! │        ▼                                                     │
//! │  Config (immutable)                                          │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod presets;

pub use presets::{development, performance, privacy, production};

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// MQTT connection options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttOptions {
    pub broker: String,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub reconnect_period_ms: u32,
    pub connect_timeout_ms: u32,
}

impl Default for MqttOptions {
    fn default() -> Self {
        MqttOptions {
            broker: "wss://test.mosquitto.org:8081".to_string(),
            client_id: None,
            username: None,
            password: None,
            reconnect_period_ms: 2_000,
            connect_timeout_ms: 10_000,
        }
    }
}

/// A single ICE server entry, as accepted by `RTCPeerConnection`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// WebRTC connection-level options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebrtcOptions {
    pub ice_servers: Vec<IceServer>,
    pub ice_transport_policy: IceTransportPolicy,
    pub bundle_policy: BundlePolicy,
    pub rtcp_mux_policy: RtcpMuxPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceTransportPolicy {
    All,
    Relay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundlePolicy {
    Balanced,
    MaxCompat,
    MaxBundle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RtcpMuxPolicy {
    Negotiate,
    Require,
}

impl Default for WebrtcOptions {
    fn default() -> Self {
        WebrtcOptions {
            ice_servers: vec![IceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                username: None,
                credential: None,
            }],
            ice_transport_policy: IceTransportPolicy::All,
            bundle_policy: BundlePolicy::Balanced,
            rtcp_mux_policy: RtcpMuxPolicy::Require,
        }
    }
}

/// Topic (room) addressing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicOptions {
    pub base: String,
    pub room: String,
    pub separator: String,
}

impl Default for TopicOptions {
    fn default() -> Self {
        TopicOptions {
            base: "rtchat".to_string(),
            room: "default".to_string(),
            separator: "/".to_string(),
        }
    }
}

impl TopicOptions {
    pub fn full(&self) -> String {
        format!("{}{}{}", self.base, self.separator, self.room)
    }
}

/// Optional LZ compression of bus payloads above a byte threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionOptions {
    pub enabled: bool,
    pub library: String,
    pub threshold_bytes: usize,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        CompressionOptions {
            enabled: true,
            library: "miniz_oxide".to_string(),
            threshold_bytes: 1024,
        }
    }
}

/// Connection lifecycle behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionOptions {
    pub auto_connect: bool,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u32,
    pub connection_timeout_ms: u32,
    pub auto_accept_connections: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            auto_connect: true,
            auto_reconnect: true,
            max_reconnect_attempts: 10,
            reconnect_delay_ms: 2_000,
            connection_timeout_ms: 10_000,
            auto_accept_connections: false,
        }
    }
}

/// Bounded local message history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryOptions {
    pub enabled: bool,
    pub max_length: usize,
}

impl Default for HistoryOptions {
    fn default() -> Self {
        HistoryOptions { enabled: true, max_length: 200 }
    }
}

/// Per-tab registry options (see SPEC_FULL.md §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabOptions {
    pub enabled: bool,
    pub poll_interval_ms: u32,
    pub timeout_s: u32,
}

impl Default for TabOptions {
    fn default() -> Self {
        TabOptions { enabled: true, poll_interval_ms: 5_000, timeout_s: 15 }
    }
}

/// The fully validated, defaulted, immutable configuration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub name: String,
    pub user_info: serde_json::Value,
    pub mqtt: MqttOptions,
    pub webrtc: WebrtcOptions,
    pub topic: TopicOptions,
    pub compression: CompressionOptions,
    pub connection: ConnectionOptions,
    pub history: HistoryOptions,
    pub tabs: TabOptions,
    pub debug: bool,
    pub trust_mode: String,
    pub generate: bool,
}

/// Partial options bag accepted from the caller. Every field is optional;
/// anything left `None` falls back to [`Config`]'s defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Options {
    pub name: Option<String>,
    pub user_info: Option<serde_json::Value>,
    pub mqtt: Option<MqttOptionsPartial>,
    pub webrtc: Option<WebrtcOptionsPartial>,
    /// A bare `topic` string is normalized to `{room: string}` per
    /// SPEC_FULL.md §4.1.
    pub topic: Option<TopicValue>,
    pub compression: Option<CompressionOptionsPartial>,
    pub connection: Option<ConnectionOptionsPartial>,
    pub history: Option<HistoryOptionsPartial>,
    pub tabs: Option<TabOptionsPartial>,
    pub debug: Option<bool>,
    pub trust_mode: Option<String>,
    pub generate: Option<bool>,
}

/// Accepts either a bare room string or a full `{base, room, separator}`
/// object, matching the "unknown top-level topic string is normalized"
/// rule in SPEC_FULL.md §4.1.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TopicValue {
    Room(String),
    Full(TopicOptionsPartial),
}

macro_rules! partial {
    ($name:ident { $($field:ident : $ty:ty),* $(,)? }) => {
        #[derive(Debug, Clone, Default, Serialize, Deserialize)]
        pub struct $name {
            $(pub $field: Option<$ty>,)*
        }
    };
}

partial!(MqttOptionsPartial {
    broker: String,
    client_id: String,
    username: String,
    password: String,
    reconnect_period_ms: u32,
    connect_timeout_ms: u32,
});

/// Accepts either a bare ICE server URL string or a full list, matching
/// the "a single ICE server string is coerced into `[{urls:\"...\"}]`"
/// rule in SPEC_FULL.md §4.1 — the same string-or-object shape `topic`
/// solves above via [`TopicValue`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IceServersValue {
    Single(String),
    List(Vec<IceServer>),
}

partial!(WebrtcOptionsPartial {
    ice_servers: IceServersValue,
    ice_transport_policy: IceTransportPolicy,
    bundle_policy: BundlePolicy,
    rtcp_mux_policy: RtcpMuxPolicy,
});

partial!(TopicOptionsPartial {
    base: String,
    room: String,
    separator: String,
});

partial!(CompressionOptionsPartial {
    enabled: bool,
    library: String,
    threshold_bytes: usize,
});

partial!(ConnectionOptionsPartial {
    auto_connect: bool,
    auto_reconnect: bool,
    max_reconnect_attempts: u32,
    reconnect_delay_ms: u32,
    connection_timeout_ms: u32,
    auto_accept_connections: bool,
});

partial!(HistoryOptionsPartial {
    enabled: bool,
    max_length: usize,
});

partial!(TabOptionsPartial {
    enabled: bool,
    poll_interval_ms: u32,
    timeout_s: u32,
});

impl Config {
    /// Deep-merge `options` over the defaults, validate, and return a
    /// frozen record. Dynamic defaults (random name, room from context)
    /// are supplied via `default_name`/`default_room` since the core
    /// itself has no access to `window.location` or stored tab state.
    pub fn build(
        options: Options,
        default_name: impl FnOnce() -> String,
        default_room: impl FnOnce() -> String,
    ) -> Result<Config> {
        let name = options.name.unwrap_or_else(default_name);
        validate_name(&name)?;

        let mut mqtt = MqttOptions::default();
        if let Some(p) = options.mqtt {
            if let Some(v) = p.broker { mqtt.broker = v; }
            if let Some(v) = p.client_id { mqtt.client_id = Some(v); }
            if let Some(v) = p.username { mqtt.username = Some(v); }
            if let Some(v) = p.password { mqtt.password = Some(v); }
            if let Some(v) = p.reconnect_period_ms { mqtt.reconnect_period_ms = v; }
            if let Some(v) = p.connect_timeout_ms { mqtt.connect_timeout_ms = v; }
        }
        validate_broker_url(&mqtt.broker)?;

        let mut webrtc = WebrtcOptions::default();
        if let Some(p) = options.webrtc {
            if let Some(v) = p.ice_servers {
                let v = match v {
                    IceServersValue::Single(url) => {
                        vec![IceServer { urls: vec![url], username: None, credential: None }]
                    }
                    IceServersValue::List(list) => list,
                };
                if v.is_empty() {
                    return Err(Error::MalformedIceServer {
                        reason: "at least one ICE server is required".into(),
                    });
                }
                for server in &v {
                    if server.urls.is_empty() {
                        return Err(Error::MalformedIceServer {
                            reason: "ice server entry has no urls".into(),
                        });
                    }
                }
                webrtc.ice_servers = v;
            }
            if let Some(v) = p.ice_transport_policy { webrtc.ice_transport_policy = v; }
            if let Some(v) = p.bundle_policy { webrtc.bundle_policy = v; }
            if let Some(v) = p.rtcp_mux_policy { webrtc.rtcp_mux_policy = v; }
        }

        let mut topic = TopicOptions::default();
        topic.room = default_room_placeholder(&default_room, &topic.room);
        match options.topic {
            Some(TopicValue::Room(room)) => topic.room = room,
            Some(TopicValue::Full(p)) => {
                if let Some(v) = p.base { topic.base = v; }
                if let Some(v) = p.room { topic.room = v; }
                if let Some(v) = p.separator { topic.separator = v; }
            }
            None => {}
        }

        let mut compression = CompressionOptions::default();
        if let Some(p) = options.compression {
            if let Some(v) = p.enabled { compression.enabled = v; }
            if let Some(v) = p.library { compression.library = v; }
            if let Some(v) = p.threshold_bytes { compression.threshold_bytes = v; }
        }

        let mut connection = ConnectionOptions::default();
        if let Some(p) = options.connection {
            if let Some(v) = p.auto_connect { connection.auto_connect = v; }
            if let Some(v) = p.auto_reconnect { connection.auto_reconnect = v; }
            if let Some(v) = p.max_reconnect_attempts { connection.max_reconnect_attempts = v; }
            if let Some(v) = p.reconnect_delay_ms { connection.reconnect_delay_ms = v; }
            if let Some(v) = p.connection_timeout_ms { connection.connection_timeout_ms = v; }
            if let Some(v) = p.auto_accept_connections { connection.auto_accept_connections = v; }
        }

        let mut history = HistoryOptions::default();
        if let Some(p) = options.history {
            if let Some(v) = p.enabled { history.enabled = v; }
            if let Some(v) = p.max_length { history.max_length = v; }
        }

        let mut tabs = TabOptions::default();
        if let Some(p) = options.tabs {
            if let Some(v) = p.enabled { tabs.enabled = v; }
            if let Some(v) = p.poll_interval_ms { tabs.poll_interval_ms = v; }
            if let Some(v) = p.timeout_s { tabs.timeout_s = v; }
        }

        Ok(Config {
            name,
            user_info: options.user_info.unwrap_or(serde_json::Value::Null),
            mqtt,
            webrtc,
            topic,
            compression,
            connection,
            history,
            tabs,
            debug: options.debug.unwrap_or(false),
            trust_mode: options.trust_mode.unwrap_or_else(|| "strict".to_string()),
            generate: options.generate.unwrap_or(true),
        })
    }

    pub fn broker(&self) -> &str {
        &self.mqtt.broker
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.webrtc.ice_servers
    }

    pub fn full_topic(&self) -> String {
        self.topic.full()
    }

    pub fn base_topic(&self) -> &str {
        &self.topic.base
    }

    pub fn room(&self) -> &str {
        &self.topic.room
    }
}

fn default_room_placeholder(default_room: &impl Fn() -> String, fallback: &str) -> String {
    let room = default_room();
    if room.is_empty() { fallback.to_string() } else { room }
}

/// Reject names containing `(`, `)`, `|`, or leading/trailing whitespace
/// (invariant 1 in SPEC_FULL.md §8).
pub fn validate_name(name: &str) -> Result<()> {
    if name != name.trim() {
        return Err(Error::InvalidName { name: name.to_string(), reason: "leading or trailing whitespace" });
    }
    if name.contains('(') || name.contains(')') {
        return Err(Error::InvalidName { name: name.to_string(), reason: "parentheses are reserved for the tab id" });
    }
    if name.contains('|') {
        return Err(Error::InvalidName { name: name.to_string(), reason: "pipe is reserved for the identity string separator" });
    }
    if name.is_empty() {
        return Err(Error::InvalidName { name: name.to_string(), reason: "name must not be empty" });
    }
    Ok(())
}

fn validate_broker_url(url: &str) -> Result<()> {
    let looks_valid = url.starts_with("ws://") || url.starts_with("wss://") || url.starts_with("mqtt://") || url.starts_with("mqtts://");
    if !looks_valid {
        return Err(Error::MalformedBusUrl { url: url.to_string() });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(options: Options) -> Result<Config> {
        Config::build(options, || "anon".to_string(), || "default".to_string())
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = build(Options::default()).unwrap();
        assert_eq!(cfg.name, "anon");
        assert_eq!(cfg.full_topic(), "rtchat/default");
        assert_eq!(cfg.ice_servers().len(), 1);
    }

    #[test]
    fn rejects_names_with_parens_or_pipes() {
        for bad in ["alice(1)", "al|ice", " alice", "alice ", ""] {
            let mut options = Options::default();
            options.name = Some(bad.to_string());
            assert!(build(options).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn bare_topic_string_normalizes_to_room() {
        let mut options = Options::default();
        options.topic = Some(TopicValue::Room("lobby".to_string()));
        let cfg = build(options).unwrap();
        assert_eq!(cfg.room(), "lobby");
        assert_eq!(cfg.full_topic(), "rtchat/lobby");
    }

    #[test]
    fn rejects_malformed_broker_url() {
        let mut options = Options::default();
        options.mqtt = Some(MqttOptionsPartial { broker: Some("ftp://nope".into()), ..Default::default() });
        assert!(build(options).is_err());
    }

    #[test]
    fn rejects_empty_ice_server_list() {
        let mut options = Options::default();
        options.webrtc =
            Some(WebrtcOptionsPartial { ice_servers: Some(IceServersValue::List(vec![])), ..Default::default() });
        assert!(build(options).is_err());
    }

    #[test]
    fn single_ice_server_string_is_coerced_into_list() {
        let mut options = Options::default();
        options.webrtc = Some(WebrtcOptionsPartial {
            ice_servers: Some(IceServersValue::Single("stun:example.org".into())),
            ..Default::default()
        });
        let cfg = build(options).unwrap();
        assert_eq!(cfg.ice_servers().len(), 1);
        assert_eq!(cfg.ice_servers()[0].urls[0], "stun:example.org");
    }

    #[test]
    fn ice_server_list_form_is_accepted_unchanged() {
        let mut options = Options::default();
        options.webrtc = Some(WebrtcOptionsPartial {
            ice_servers: Some(IceServersValue::List(vec![IceServer {
                urls: vec!["stun:example.org".into()],
                username: None,
                credential: None,
            }])),
            ..Default::default()
        });
        let cfg = build(options).unwrap();
        assert_eq!(cfg.ice_servers()[0].urls[0], "stun:example.org");
    }
}
