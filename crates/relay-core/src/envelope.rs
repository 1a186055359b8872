//! Wire shapes exchanged over the socket. One JSON document per text frame.
//!
//! Hub to peer: `{"data": {...}, "clientID": "<peer>", "roundID": 3}`
//! Peer to hub: `{"type": "ack", "clientID": "<peer>", "roundID": 3}`

use serde::{Deserialize, Serialize};

use crate::errors::RelayError;
use crate::ids::{PeerId, RoundId};
use crate::payload::Payload;

/// Payload addressed to one peer for one round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub data: Payload,
    #[serde(rename = "clientID")]
    pub client_id: PeerId,
    /// Absent when talking to a hub that does not number its rounds.
    #[serde(rename = "roundID", default, skip_serializing_if = "Option::is_none")]
    pub round_id: Option<RoundId>,
}

impl Envelope {
    pub fn new(data: Payload, client_id: PeerId, round_id: RoundId) -> Self {
        Self {
            data,
            client_id,
            round_id: Some(round_id),
        }
    }

    /// The acknowledgment a subscriber sends back for this envelope.
    pub fn ack(&self) -> AckMessage {
        AckMessage {
            client_id: self.client_id.clone(),
            round_id: self.round_id,
        }
    }

    pub fn encode(&self) -> Result<String, RelayError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, RelayError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Receipt for an [`Envelope`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMessage {
    #[serde(rename = "clientID")]
    pub client_id: PeerId,
    /// Legacy peers omit this; such an ack covers every outstanding round.
    #[serde(rename = "roundID", default, skip_serializing_if = "Option::is_none")]
    pub round_id: Option<RoundId>,
}

impl AckMessage {
    pub fn encode(&self) -> Result<String, RelayError> {
        Ok(serde_json::to_string(&PeerMessage::Ack(self.clone()))?)
    }
}

/// Messages a peer may send to the hub.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PeerMessage {
    #[serde(rename = "ack")]
    Ack(AckMessage),
}

impl PeerMessage {
    /// Decode a frame received by the hub.
    ///
    /// Invalid JSON is an error. Well-formed JSON that is not a known message
    /// yields `Ok(None)` and is ignored by the caller.
    pub fn decode(text: &str) -> Result<Option<Self>, RelayError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        Ok(serde_json::from_value(value).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_wire_shape() {
        let env = Envelope::new(
            Payload::new().with("roomID", "r1"),
            PeerId::from_raw("host-42"),
            RoundId::new(1),
        );
        let value: serde_json::Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"data": {"roomID": "r1"}, "clientID": "host-42", "roundID": 1})
        );
    }

    #[test]
    fn envelope_without_round_decodes() {
        let env = Envelope::decode(r#"{"data":{"x":1},"clientID":"p"}"#).unwrap();
        assert_eq!(env.round_id, None);
        assert_eq!(env.data.get("x"), Some(&json!(1)));
    }

    #[test]
    fn envelope_missing_data_is_codec_error() {
        let err = Envelope::decode(r#"{"clientID":"p"}"#).unwrap_err();
        assert_eq!(err.error_kind(), "codec");
    }

    #[test]
    fn ack_echoes_envelope_identity() {
        let env = Envelope::new(Payload::new(), PeerId::from_raw("host-42"), RoundId::new(9));
        let ack = env.ack();
        let value: serde_json::Value = serde_json::from_str(&ack.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "ack", "clientID": "host-42", "roundID": 9}));
    }

    #[test]
    fn ack_without_round_omits_field() {
        let ack = AckMessage {
            client_id: PeerId::from_raw("p"),
            round_id: None,
        };
        let value: serde_json::Value = serde_json::from_str(&ack.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "ack", "clientID": "p"}));
    }

    #[test]
    fn decode_ack() {
        let msg = PeerMessage::decode(r#"{"type":"ack","clientID":"p","roundID":4}"#)
            .unwrap()
            .unwrap();
        let PeerMessage::Ack(ack) = msg;
        assert_eq!(ack.client_id.as_str(), "p");
        assert_eq!(ack.round_id, Some(RoundId::new(4)));
    }

    #[test]
    fn decode_unknown_type_is_ignored() {
        assert!(PeerMessage::decode(r#"{"type":"hello"}"#).unwrap().is_none());
        assert!(PeerMessage::decode(r#"{"clientID":"p"}"#).unwrap().is_none());
    }

    #[test]
    fn decode_garbage_is_error() {
        assert!(PeerMessage::decode("not json").is_err());
    }
}
