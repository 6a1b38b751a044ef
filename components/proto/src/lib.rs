//! Wire types exchanged with clients and across the Redis bus.
//!
//! Everything that crosses a process boundary is defined here: the
//! end-to-end message envelope, the internal pub/sub frame, the framed
//! websocket request/response pair and the group message bodies. Binary
//! frames use bincode; group notifications arriving from Redis are JSON.

pub mod envelope;
pub mod friend;
pub mod group;
pub mod multi_device;
pub mod pubsub;
pub mod websocket;

use serde::{de::DeserializeOwned, Serialize};

pub fn to_wire<T: Serialize>(value: &T) -> Option<Vec<u8>> {
    bincode::serialize(value).ok()
}

pub fn from_wire<T: DeserializeOwned>(bytes: &[u8]) -> Option<T> {
    bincode::deserialize(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, EnvelopeType};
    use crate::pubsub::{PubSubMessage, PubSubType};

    #[test]
    fn envelope_round_trip() {
        let envelope = Envelope {
            msg_type: EnvelopeType::Ciphertext,
            source: "u1".to_string(),
            source_device: 1,
            source_registration: 42,
            source_extra: String::new(),
            timestamp: 1_000,
            relay: String::new(),
            content: b"payload".to_vec(),
            push: 0,
        };
        let bytes = to_wire(&envelope).unwrap();
        let decoded: Envelope = from_wire(&bytes).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn pubsub_frame_round_trip() {
        let frame = PubSubMessage {
            msg_type: PubSubType::Deliver,
            content: vec![1, 2, 3],
        };
        let decoded: PubSubMessage = from_wire(&to_wire(&frame).unwrap()).unwrap();
        assert_eq!(decoded.msg_type, PubSubType::Deliver);
        assert_eq!(decoded.content, vec![1, 2, 3]);
    }

    #[test]
    fn from_wire_rejects_garbage() {
        assert!(from_wire::<Envelope>(&[0xff; 3]).is_none());
    }
}
