//! Wire format of the signaling socket: `{"op": <int>, "t": <int, omitted when 0>, "d": <payload>}`.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, FromRepr};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::{
    error::{Error, SignalingErrorKind},
    utils::id::string_or_number,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, Display)]
#[repr(u8)]
pub enum Op {
    Heartbeat = 1,
    Rtc = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, Display)]
#[repr(u8)]
pub enum RtcType {
    Join = 1,
    Offer = 2,
    Answer = 3,
    Candidate = 4,
    MuteSelf = 5,
    MuteUser = 6,
    ServerMuteUser = 7,
    ServerDeafenUser = 8,
    ServerKickUser = 9,
    ServerBlockUser = 10,
    Moved = 11,
    Leave = 12,
    Error = 13,
}

/// What an envelope is, decided from `(op, t)` alone. The payload stays undecoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Heartbeat,
    Rtc(RtcType),
    Unknown { op: u8, t: u8 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub op: u8,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub t: u8,
    #[serde(default)]
    pub d: Value,
}

fn is_zero(t: &u8) -> bool {
    *t == 0
}

impl Envelope {
    pub fn parse(text: &str) -> Result<Self, Error> {
        serde_json::from_str(text).map_err(|err| {
            Error::new_signaling(
                format!("failed to parse envelope: {}", err),
                SignalingErrorKind::MalformedEnvelope,
            )
        })
    }

    pub fn kind(&self) -> MessageKind {
        match Op::from_repr(self.op) {
            Some(Op::Heartbeat) => MessageKind::Heartbeat,
            Some(Op::Rtc) => match RtcType::from_repr(self.t) {
                Some(t) => MessageKind::Rtc(t),
                None => MessageKind::Unknown {
                    op: self.op,
                    t: self.t,
                },
            },
            None => MessageKind::Unknown {
                op: self.op,
                t: self.t,
            },
        }
    }

    /// Decodes `d` once the caller knows which payload to expect.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, Error> {
        T::deserialize(&self.d).map_err(|err| {
            Error::new_signaling(
                format!("invalid payload for op={} t={}: {}", self.op, self.t, err),
                SignalingErrorKind::MalformedEnvelope,
            )
        })
    }

    pub fn rtc<T: Serialize>(t: RtcType, payload: &T) -> Self {
        let d = serde_json::to_value(payload).unwrap_or_else(|err| {
            tracing::error!("failed to encode {} payload: {}", t, err);
            Value::Null
        });
        Self {
            op: Op::Rtc as u8,
            t: t as u8,
            d,
        }
    }

    pub fn error(message: &str) -> Self {
        Self::rtc(
            RtcType::Error,
            &ErrorPayload {
                error: message.to_string(),
            },
        )
    }

    pub fn pong(heartbeat: HeartbeatPayload) -> Self {
        let payload = PongPayload {
            pong: true,
            server_ts: chrono::Utc::now().timestamp_millis(),
            nonce: heartbeat.nonce,
            ts: heartbeat.ts,
        };
        Self {
            op: Op::Heartbeat as u8,
            t: 0,
            d: serde_json::to_value(payload).unwrap_or(Value::Null),
        }
    }

    pub fn to_text(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JoinPayload {
    #[serde(deserialize_with = "string_or_number")]
    pub channel: String,
    pub token: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JoinAck {
    pub ok: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SdpPayload {
    pub sdp: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl From<RTCIceCandidateInit> for CandidatePayload {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<CandidatePayload> for RTCIceCandidateInit {
    fn from(payload: CandidatePayload) -> Self {
        Self {
            candidate: payload.candidate,
            sdp_mid: payload.sdp_mid,
            sdp_mline_index: payload.sdp_mline_index,
            username_fragment: payload.username_fragment,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MuteSelfPayload {
    pub muted: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MuteUserPayload {
    #[serde(deserialize_with = "string_or_number")]
    pub user: String,
    pub muted: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerMutePayload {
    #[serde(deserialize_with = "string_or_number")]
    pub user: String,
    pub muted: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerDeafenPayload {
    #[serde(deserialize_with = "string_or_number")]
    pub user: String,
    pub deafened: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KickPayload {
    #[serde(deserialize_with = "string_or_number")]
    pub user: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockPayload {
    #[serde(deserialize_with = "string_or_number")]
    pub user: String,
    pub block: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MovePayload {
    #[serde(deserialize_with = "string_or_number")]
    pub user: String,
    #[serde(deserialize_with = "string_or_number")]
    pub channel: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MovedPayload {
    pub channel: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(default)]
    pub nonce: Option<Value>,
    #[serde(default)]
    pub ts: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PongPayload {
    pub pong: bool,
    pub server_ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorPayload {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_with_numeric_channel() {
        let envelope =
            Envelope::parse(r#"{"op":2,"t":1,"d":{"channel":42,"token":"abc"}}"#).unwrap();
        assert_eq!(envelope.kind(), MessageKind::Rtc(RtcType::Join));
        let join: JoinPayload = envelope.payload().unwrap();
        assert_eq!(join.channel, "42");
        assert_eq!(join.token, "abc");
    }

    #[test]
    fn test_heartbeat_omits_t() {
        let pong = Envelope::pong(HeartbeatPayload {
            nonce: Some(json!("n-1")),
            ts: None,
        });
        let text = pong.to_text().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["op"], json!(1));
        assert!(value.get("t").is_none());
        assert_eq!(value["d"]["pong"], json!(true));
        assert_eq!(value["d"]["nonce"], json!("n-1"));
        assert!(value["d"].get("ts").is_none());
        assert!(value["d"]["server_ts"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_unknown_pairs_are_not_decoded() {
        let envelope = Envelope::parse(r#"{"op":2,"t":99,"d":[1,2,3]}"#).unwrap();
        assert_eq!(envelope.kind(), MessageKind::Unknown { op: 2, t: 99 });

        let envelope = Envelope::parse(r#"{"op":7,"d":"whatever"}"#).unwrap();
        assert_eq!(envelope.kind(), MessageKind::Unknown { op: 7, t: 0 });
    }

    #[test]
    fn test_candidate_field_names() {
        let envelope = Envelope::parse(
            r#"{"op":2,"t":4,"d":{"candidate":"candidate:1 1 udp 1 10.0.0.1 9 typ host","sdpMid":"0","sdpMLineIndex":0}}"#,
        )
        .unwrap();
        let candidate: CandidatePayload = envelope.payload().unwrap();
        let init: RTCIceCandidateInit = candidate.into();
        assert_eq!(init.sdp_mid.as_deref(), Some("0"));
        assert_eq!(init.sdp_mline_index, Some(0));

        let out = Envelope::rtc(RtcType::Candidate, &CandidatePayload::from(init));
        assert_eq!(out.d["sdpMLineIndex"], json!(0));
        assert!(out.d.get("usernameFragment").is_none());
    }

    #[test]
    fn test_missing_payload_fields_are_rejected() {
        let envelope = Envelope::parse(r#"{"op":2,"t":6,"d":{"muted":true}}"#).unwrap();
        assert!(envelope.payload::<MuteUserPayload>().is_err());
        assert!(Envelope::parse("{not json").is_err());
    }

    #[test]
    fn test_error_envelope() {
        let envelope = Envelope::error("blocked");
        assert_eq!(envelope.kind(), MessageKind::Rtc(RtcType::Error));
        assert_eq!(envelope.d, json!({"error": "blocked"}));
    }
}
