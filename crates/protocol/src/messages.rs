use serde::{Deserialize, Serialize};

/// Envelope types the agent understands. Anything else is discarded.
const KNOWN_TYPES: [&str; 5] = ["requestShare", "offer", "answer", "candidate", "stopShare"];

/// Signaling messages exchanged between the device and the signaling server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SignalingEnvelope {
    /// A viewer asked this device to start sharing
    RequestShare,
    /// SDP offer from the device
    Offer {
        device_id: String,
        sdp: SessionDescription,
    },
    /// SDP answer from the viewer
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
        sdp: SessionDescription,
    },
    /// ICE candidate, in either direction
    Candidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
        candidate: IceCandidateRecord,
    },
    /// The viewer or server ended the share
    StopShare,
}

impl SignalingEnvelope {
    /// Parse one inbound text frame.
    ///
    /// Distinguishes frames without a `type`, frames with a `type` this agent
    /// does not handle, and frames whose payload does not match their type, so
    /// callers can log each case precisely before discarding it.
    pub fn decode(text: &str) -> Result<Self, EnvelopeError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(EnvelopeError::Malformed)?;
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(EnvelopeError::MissingType)?;
        if !KNOWN_TYPES.contains(&kind) {
            return Err(EnvelopeError::UnknownType(kind.to_string()));
        }
        serde_json::from_value(value).map_err(EnvelopeError::Malformed)
    }

    pub fn encode(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(EnvelopeError::Malformed)
    }

    /// Wire name of the envelope type, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RequestShare => "requestShare",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
            Self::StopShare => "stopShare",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One ICE candidate as carried on the wire. Opaque to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateRecord {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Device,
}

/// First frame sent after the socket opens. Untagged on the wire:
/// `{"role":"device","deviceId":"<id>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub role: PeerRole,
    pub device_id: String,
}

impl Registration {
    pub fn device(device_id: impl Into<String>) -> Self {
        Self {
            role: PeerRole::Device,
            device_id: device_id.into(),
        }
    }

    pub fn encode(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(EnvelopeError::Malformed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("envelope has no \"type\" field")]
    MissingType,
    #[error("unknown envelope type: {0:?}")]
    UnknownType(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_wire_format() {
        let json = Registration::device("acme-phone-1700000000000").encode().unwrap();
        assert_eq!(json, r#"{"role":"device","deviceId":"acme-phone-1700000000000"}"#);
    }

    #[test]
    fn offer_wire_format() {
        let msg = SignalingEnvelope::Offer {
            device_id: "dev-1".to_string(),
            sdp: SessionDescription::offer("v=0\r\n"),
        };
        let json = msg.encode().unwrap();
        assert_eq!(
            json,
            r#"{"type":"offer","deviceId":"dev-1","sdp":{"type":"offer","sdp":"v=0\r\n"}}"#
        );
    }

    #[test]
    fn outbound_candidate_wire_format() {
        let msg = SignalingEnvelope::Candidate {
            device_id: Some("dev-1".to_string()),
            candidate: IceCandidateRecord {
                candidate: "candidate:1 1 UDP 2130706431 10.0.0.2 50000 typ host".to_string(),
                sdp_mid: "0".to_string(),
                sdp_mline_index: 0,
            },
        };
        let json = msg.encode().unwrap();
        assert!(json.starts_with(r#"{"type":"candidate","deviceId":"dev-1","candidate":{"#));
        assert!(json.contains(r#""sdpMid":"0""#));
        assert!(json.contains(r#""sdpMLineIndex":0"#));
        // Must be camelCase, NOT snake_case
        assert!(!json.contains("sdp_mid"));
    }

    #[test]
    fn answer_from_server() {
        let msg = SignalingEnvelope::decode(
            r#"{"type":"answer","sdp":{"type":"answer","sdp":"v=0\r\nanswer"}}"#,
        )
        .unwrap();
        match msg {
            SignalingEnvelope::Answer { device_id, sdp } => {
                assert!(device_id.is_none());
                assert_eq!(sdp.kind, SdpType::Answer);
                assert_eq!(sdp.sdp, "v=0\r\nanswer");
            }
            other => panic!("Expected Answer, got {other:?}"),
        }
    }

    #[test]
    fn inbound_candidate_without_device_id() {
        let msg = SignalingEnvelope::decode(
            r#"{
                "type": "candidate",
                "candidate": {
                    "candidate": "candidate:2 1 UDP 1686052607 203.0.113.7 61000 typ srflx",
                    "sdpMid": "0",
                    "sdpMLineIndex": 0
                }
            }"#,
        )
        .unwrap();
        match msg {
            SignalingEnvelope::Candidate {
                device_id,
                candidate,
            } => {
                assert!(device_id.is_none());
                assert!(candidate.candidate.contains("srflx"));
                assert_eq!(candidate.sdp_mid, "0");
            }
            other => panic!("Expected Candidate, got {other:?}"),
        }
    }

    #[test]
    fn unit_envelopes_ignore_extra_fields() {
        assert_eq!(
            SignalingEnvelope::decode(r#"{"type":"requestShare","viewer":"dash-7"}"#).unwrap(),
            SignalingEnvelope::RequestShare
        );
        assert_eq!(
            SignalingEnvelope::decode(r#"{"type":"stopShare"}"#).unwrap(),
            SignalingEnvelope::StopShare
        );
    }

    #[test]
    fn unknown_type_is_reported() {
        let err = SignalingEnvelope::decode(r#"{"type":"ping"}"#).unwrap_err();
        assert!(matches!(err, EnvelopeError::UnknownType(ref t) if t == "ping"));
    }

    #[test]
    fn missing_type_is_reported() {
        let err = SignalingEnvelope::decode(r#"{"sdp":"v=0"}"#).unwrap_err();
        assert!(matches!(err, EnvelopeError::MissingType));

        let err = SignalingEnvelope::decode(r#"{"type":7}"#).unwrap_err();
        assert!(matches!(err, EnvelopeError::MissingType));
    }

    #[test]
    fn malformed_payloads_are_reported() {
        let err = SignalingEnvelope::decode("not json").unwrap_err();
        assert!(matches!(err, EnvelopeError::Malformed(_)));

        // Known type, wrong payload shape
        let err = SignalingEnvelope::decode(r#"{"type":"answer","sdp":"v=0"}"#).unwrap_err();
        assert!(matches!(err, EnvelopeError::Malformed(_)));

        let err = SignalingEnvelope::decode(
            r#"{"type":"candidate","candidate":{"candidate":"c","sdpMid":"0"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, EnvelopeError::Malformed(_)));
    }

    #[test]
    fn kind_matches_wire_tag() {
        let envelopes = [
            SignalingEnvelope::RequestShare,
            SignalingEnvelope::StopShare,
            SignalingEnvelope::Offer {
                device_id: "d".to_string(),
                sdp: SessionDescription::offer("x"),
            },
        ];
        for env in envelopes {
            let json = env.encode().unwrap();
            assert!(json.contains(&format!(r#""type":"{}""#, env.kind())));
        }
    }
}
