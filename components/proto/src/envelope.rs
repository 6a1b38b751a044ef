use serde::{Deserialize, Serialize};

/// One end-to-end encrypted message from a source device to a destination
/// device. The `content` bytes are opaque to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub msg_type: EnvelopeType,
    pub source: String,
    pub source_device: u32,
    pub source_registration: u32,
    pub source_extra: String,
    pub timestamp: u64,
    pub relay: String,
    pub content: Vec<u8>,
    pub push: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeType {
    Unknown,
    Ciphertext,
    KeyExchange,
    PrekeyBundle,
    Receipt,
    Noise,
}

/// Push classes carried in `Envelope::push`. `Silent` suppresses the
/// offline notification fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushClass {
    Normal,
    Silent,
}

impl From<i32> for PushClass {
    fn from(value: i32) -> Self {
        if value == 1 {
            PushClass::Silent
        } else {
            PushClass::Normal
        }
    }
}

impl Envelope {
    pub fn push_class(&self) -> PushClass {
        PushClass::from(self.push)
    }
}

/// A batch of envelopes drained from storage and delivered in a single
/// `PUT /api/v1/messages` request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Mailbox {
    pub envelopes: Vec<Envelope>,
}
