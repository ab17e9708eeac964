//! Signaling message codec: JSON envelopes <-> typed events.
//!
//! Decode order for the inner `signal` object mirrors the Go predecessor's
//! `NewPayloadFromMap`: a `candidate` key wins first, then a `renegotiate`
//! key, then `type`+`sdp`. `pranswer`/`rollback` session description types
//! are rejected; this SFU only ever exchanges `offer`/`answer`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::id_types::UserId;

#[derive(Debug)]
pub enum CodecError {
    UnknownEnvelopeType(String),
    MissingField(&'static str),
    WrongFieldType(&'static str),
    UnsupportedSdpType(String),
    Malformed(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::UnknownEnvelopeType(t) => write!(f, "unknown envelope type '{}'", t),
            CodecError::MissingField(field) => write!(f, "missing field '{}'", field),
            CodecError::WrongFieldType(field) => write!(f, "field '{}' has the wrong type", field),
            CodecError::UnsupportedSdpType(t) => {
                write!(f, "unsupported session description type '{}'", t)
            }
            CodecError::Malformed(msg) => write!(f, "malformed envelope: {}", msg),
        }
    }
}

impl std::error::Error for CodecError {}

/// The outer frame carried on the signaling WebSocket, both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub room: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    fn as_str(self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

/// One decoded `signal` payload (the tagged union from spec.md §3/§4.6).
#[derive(Debug, Clone)]
pub enum SignalPayload {
    Description { kind: SdpKind, sdp: String },
    Candidate {
        candidate: String,
        sdp_mline_index: u16,
        sdp_mid: Option<String>,
    },
    Renegotiate,
}

impl SignalPayload {
    /// Decode order: `candidate` key first, then `renegotiate`, then `type`/`sdp`.
    pub fn decode(value: &Value) -> Result<Self, CodecError> {
        let obj = value
            .as_object()
            .ok_or_else(|| CodecError::Malformed("signal payload is not an object".into()))?;

        if obj.contains_key("candidate") {
            let candidate_obj = obj
                .get("candidate")
                .and_then(Value::as_object)
                .ok_or(CodecError::WrongFieldType("candidate"))?;
            let candidate = candidate_obj
                .get("candidate")
                .and_then(Value::as_str)
                .ok_or(CodecError::MissingField("candidate.candidate"))?
                .to_string();
            let sdp_mline_index = candidate_obj
                .get("sdpMLineIndex")
                .and_then(Value::as_u64)
                .ok_or(CodecError::MissingField("candidate.sdpMLineIndex"))?;
            let sdp_mline_index = u16::try_from(sdp_mline_index)
                .map_err(|_| CodecError::WrongFieldType("candidate.sdpMLineIndex"))?;
            let sdp_mid = candidate_obj
                .get("sdpMid")
                .and_then(Value::as_str)
                .map(str::to_string);
            return Ok(SignalPayload::Candidate {
                candidate,
                sdp_mline_index,
                sdp_mid,
            });
        }

        if obj.get("renegotiate").and_then(Value::as_bool) == Some(true) {
            return Ok(SignalPayload::Renegotiate);
        }

        if let Some(type_str) = obj.get("type").and_then(Value::as_str) {
            let sdp = obj
                .get("sdp")
                .and_then(Value::as_str)
                .ok_or(CodecError::MissingField("sdp"))?
                .to_string();
            let kind = match type_str {
                "offer" => SdpKind::Offer,
                "answer" => SdpKind::Answer,
                other => return Err(CodecError::UnsupportedSdpType(other.to_string())),
            };
            return Ok(SignalPayload::Description { kind, sdp });
        }

        Err(CodecError::Malformed(
            "signal payload matched none of candidate/renegotiate/type+sdp".into(),
        ))
    }

    pub fn encode(&self) -> Value {
        match self {
            SignalPayload::Description { kind, sdp } => serde_json::json!({
                "type": kind.as_str(),
                "sdp": sdp,
            }),
            SignalPayload::Candidate {
                candidate,
                sdp_mline_index,
                sdp_mid,
            } => serde_json::json!({
                "candidate": {
                    "candidate": candidate,
                    "sdpMLineIndex": sdp_mline_index,
                    "sdpMid": sdp_mid,
                }
            }),
            SignalPayload::Renegotiate => serde_json::json!({ "renegotiate": true }),
        }
    }
}

/// The `signal` envelope payload: originator id, which session it targets,
/// and the decoded signal itself.
#[derive(Debug, Clone)]
pub struct SignalEnvelope {
    pub client_id: UserId,
    pub renegotiate: bool,
    pub signal: SignalPayload,
}

impl SignalEnvelope {
    pub fn decode(value: &Value) -> Result<Self, CodecError> {
        let obj = value
            .as_object()
            .ok_or_else(|| CodecError::Malformed("signal envelope is not an object".into()))?;
        let client_id = obj
            .get("clientId")
            .and_then(Value::as_str)
            .ok_or(CodecError::MissingField("clientId"))?;
        let renegotiate = obj
            .get("renegotiate")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let signal = obj
            .get("signal")
            .ok_or(CodecError::MissingField("signal"))?;
        Ok(SignalEnvelope {
            client_id: UserId::from(client_id),
            renegotiate,
            signal: SignalPayload::decode(signal)?,
        })
    }

    pub fn encode(&self) -> Value {
        serde_json::json!({
            "clientId": self.client_id.as_ref(),
            "renegotiate": self.renegotiate,
            "signal": self.signal.encode(),
        })
    }
}

/// Client-to-server events, decoded from the outer `Envelope`.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Ready { nickname: String },
    Signal(SignalEnvelope),
    HangUp { user_id: UserId },
    Ping,
}

impl ClientEvent {
    pub fn decode(envelope: &Envelope) -> Result<Self, CodecError> {
        match envelope.event_type.as_str() {
            "ready" => {
                let nickname = envelope
                    .payload
                    .get("nickname")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                Ok(ClientEvent::Ready { nickname })
            }
            "signal" => Ok(ClientEvent::Signal(SignalEnvelope::decode(
                &envelope.payload,
            )?)),
            "hangUp" => {
                let user_id = envelope
                    .payload
                    .get("userId")
                    .and_then(Value::as_str)
                    .ok_or(CodecError::MissingField("userId"))?;
                Ok(ClientEvent::HangUp {
                    user_id: UserId::from(user_id),
                })
            }
            "ping" => Ok(ClientEvent::Ping),
            other => Err(CodecError::UnknownEnvelopeType(other.to_string())),
        }
    }
}

/// Server-to-client events, encoded into the outer `Envelope`.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Signal(SignalEnvelope),
    RoomJoin { client_id: UserId, metadata: String },
    Users { nicknames: Vec<(UserId, String)> },
    HangUp { user_id: UserId },
}

impl ServerEvent {
    pub fn encode(&self, room: &str) -> Envelope {
        let (event_type, payload) = match self {
            ServerEvent::Signal(env) => ("signal", env.encode()),
            ServerEvent::RoomJoin { client_id, metadata } => (
                "room_join",
                serde_json::json!({ "clientID": client_id.as_ref(), "metadata": metadata }),
            ),
            ServerEvent::Users { nicknames } => {
                let map: serde_json::Map<String, Value> = nicknames
                    .iter()
                    .map(|(id, meta)| (id.as_ref().to_string(), Value::String(meta.clone())))
                    .collect();
                (
                    "users",
                    serde_json::json!({
                        "initiator": "__SERVER__",
                        "peerIds": ["__SERVER__"],
                        "nicknames": map,
                    }),
                )
            }
            ServerEvent::HangUp { user_id } => {
                ("hangUp", serde_json::json!({ "userId": user_id.as_ref() }))
            }
        };
        Envelope {
            event_type: event_type.to_string(),
            room: room.to_string(),
            payload,
        }
    }
}
