//! Signaling wire format and negotiation value types.
//!
//! JSON shapes match what browser peers put on the channel: a `type`
//! discriminator plus the one payload field that type needs.

use serde::{Deserialize, Serialize};

use crate::media::TrackKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Browsers signal the end of gathering with an empty candidate line.
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    Join {
        #[serde(rename = "participantId")]
        participant_id: String,
    },
    Offer {
        offer: SessionDescription,
    },
    Answer {
        answer: SessionDescription,
    },
    Candidate {
        #[serde(default)]
        candidate: Option<IceCandidate>,
    },
    PeerLeft,
    SessionEnded,
}

impl SignalMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Join { .. } => "join",
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::Candidate { .. } => "candidate",
            SignalMessage::PeerLeft => "peer-left",
            SignalMessage::SessionEnded => "session-ended",
        }
    }
}

/// Lifecycle of the one peer connection a controller owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerState {
    New,
    Negotiating,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PeerState::Disconnected | PeerState::Failed | PeerState::Closed)
    }
}

/// Connection state as reported by the peer-connection black box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

/// The remote participant's media as seen by this end, for display.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<RemoteTrack>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_uses_camel_case_participant_id() {
        let msg = SignalMessage::Join {
            participant_id: "p1".into(),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "join", "participantId": "p1"})
        );
    }

    #[test]
    fn parses_browser_offer_and_candidate() {
        let offer: SignalMessage = serde_json::from_value(json!({
            "type": "offer",
            "offer": {"type": "offer", "sdp": "v=0\r\n"}
        }))
        .unwrap();
        assert_eq!(
            offer,
            SignalMessage::Offer {
                offer: SessionDescription::offer("v=0\r\n")
            }
        );

        let candidate: SignalMessage = serde_json::from_value(json!({
            "type": "candidate",
            "candidate": {
                "candidate": "candidate:1 1 udp 2122260223 192.168.1.2 54321 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0,
                "usernameFragment": "abcd"
            }
        }))
        .unwrap();
        match candidate {
            SignalMessage::Candidate { candidate: Some(c) } => {
                assert_eq!(c.sdp_mid.as_deref(), Some("0"));
                assert_eq!(c.sdp_mline_index, Some(0));
                assert!(!c.is_end_of_candidates());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn null_or_missing_candidate_is_none() {
        let null: SignalMessage =
            serde_json::from_value(json!({"type": "candidate", "candidate": null})).unwrap();
        assert_eq!(null, SignalMessage::Candidate { candidate: None });

        let missing: SignalMessage = serde_json::from_value(json!({"type": "candidate"})).unwrap();
        assert_eq!(missing, SignalMessage::Candidate { candidate: None });
    }

    #[test]
    fn payloadless_messages_round_trip_as_bare_type() {
        assert_eq!(
            serde_json::to_string(&SignalMessage::SessionEnded).unwrap(),
            r#"{"type":"session-ended"}"#
        );
        let left: SignalMessage = serde_json::from_str(r#"{"type":"peer-left"}"#).unwrap();
        assert_eq!(left, SignalMessage::PeerLeft);
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(serde_json::from_str::<SignalMessage>(r#"{"type":"chat","text":"hi"}"#).is_err());
    }
}
