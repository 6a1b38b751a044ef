use proto::envelope::{Envelope, EnvelopeType};
use serde::{Deserialize, Serialize};

/// Durable mirror of an undelivered envelope, keyed
/// `(destination, destination_device_id, id)`. Rows are FIFO by `id` per
/// destination device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: u64,
    pub destination: String,
    pub destination_device_id: u32,
    pub destination_registration_id: u32,
    pub msg_type: EnvelopeType,
    pub source: String,
    pub source_device_id: u32,
    pub source_registration_id: u32,
    pub source_extra: String,
    pub relay: String,
    pub timestamp: u64,
    pub content: Vec<u8>,
    pub push: i32,
}

impl StoredMessage {
    pub fn from_envelope(
        destination: &str,
        destination_device_id: u32,
        destination_registration_id: u32,
        envelope: &Envelope,
    ) -> Self {
        StoredMessage {
            id: 0,
            destination: destination.to_string(),
            destination_device_id,
            destination_registration_id,
            msg_type: envelope.msg_type,
            source: envelope.source.clone(),
            source_device_id: envelope.source_device,
            source_registration_id: envelope.source_registration,
            source_extra: envelope.source_extra.clone(),
            relay: envelope.relay.clone(),
            timestamp: envelope.timestamp,
            content: envelope.content.clone(),
            push: envelope.push,
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        Envelope {
            msg_type: self.msg_type,
            source: self.source.clone(),
            source_device: self.source_device_id,
            source_registration: self.source_registration_id,
            source_extra: self.source_extra.clone(),
            timestamp: self.timestamp,
            relay: self.relay.clone(),
            content: self.content.clone(),
            push: self.push,
        }
    }
}
