//! The bus wire format (SPEC_FULL.md §3, §6): `{sender, timestamp, subtopic,
//! data}`, with `data` shaped per-subtopic.

use serde::{Deserialize, Serialize};

/// An RTCSessionDescriptionInit-shaped payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

/// An RTCIceCandidateInit-shaped payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferPayload {
    pub local_description: SessionDescription,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub local_description: SessionDescription,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameChangePayload {
    pub old_name: String,
    pub new_name: String,
}

/// The tagged union of envelope bodies. `subtopic` is the tag field on the
/// wire (see [`Envelope`]); the payload itself rides in `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subtopic", content = "data")]
pub enum Subtopic {
    #[serde(rename = "connect")]
    Connect(serde_json::Value),
    #[serde(rename = "unload")]
    Unload,
    #[serde(rename = "nameChange")]
    NameChange(NameChangePayload),
    #[serde(rename = "RTCOffer")]
    RtcOffer(RtcOfferPayload),
    #[serde(rename = "RTCAnswer")]
    RtcAnswer(AnswerPayload),
    #[serde(rename = "RTCIceCandidate")]
    RtcIceCandidate(IceCandidate),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtcOfferPayload {
    pub user_info: serde_json::Value,
    pub offer: OfferPayload,
}

impl Subtopic {
    pub fn tag(&self) -> &'static str {
        match self {
            Subtopic::Connect(_) => "connect",
            Subtopic::Unload => "unload",
            Subtopic::NameChange(_) => "nameChange",
            Subtopic::RtcOffer(_) => "RTCOffer",
            Subtopic::RtcAnswer(_) => "RTCAnswer",
            Subtopic::RtcIceCandidate(_) => "RTCIceCandidate",
        }
    }
}

/// A single envelope on the bus, stamped with sender/timestamp and
/// appended to the local history ring on both send and receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: String,
    pub timestamp: i64,
    #[serde(flatten)]
    pub body: Subtopic,
}

impl Envelope {
    pub fn new(sender: impl Into<String>, timestamp: i64, body: Subtopic) -> Self {
        Envelope { sender: sender.into(), timestamp, body }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_envelope_round_trips_through_json() {
        let env = Envelope::new(
            "alice(0)",
            1234,
            Subtopic::Connect(serde_json::json!({"color": "red"})),
        );
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(env, back);
        assert_eq!(back.body.tag(), "connect");
    }

    #[test]
    fn offer_envelope_round_trips() {
        let env = Envelope::new(
            "alice(0)",
            1,
            Subtopic::RtcOffer(RtcOfferPayload {
                user_info: serde_json::Value::Null,
                offer: OfferPayload {
                    local_description: SessionDescription { sdp_type: "offer".into(), sdp: "v=0".into() },
                    target: "bob(0)".into(),
                },
            }),
        );
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn ice_candidate_envelope_round_trips() {
        let env = Envelope::new(
            "bob(1)",
            2,
            Subtopic::RtcIceCandidate(IceCandidate {
                candidate: "candidate:1 1 udp".into(),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
            }),
        );
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn unload_envelope_has_no_data_field_but_still_round_trips() {
        let env = Envelope::new("alice(0)", 3, Subtopic::Unload);
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(env, back);
    }
}
