use serde::{Deserialize, Serialize};

/// Internal frame published on per-address Redis channels. The `content`
/// bytes are the nested, type-specific payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubSubMessage {
    pub msg_type: PubSubType,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PubSubType {
    Unknown,
    QueryDb,
    Deliver,
    Connected,
    MultiDevice,
    Close,
    KeepAlive,
    Check,
    QueryOnline,
    Friend,
    Notification,
}

impl PubSubMessage {
    pub fn new(msg_type: PubSubType, content: Vec<u8>) -> Self {
        PubSubMessage { msg_type, content }
    }

    /// The connected notify carries the new channel's identity as decimal
    /// text so that peers can compare it against their own.
    pub fn connected(identity: u64) -> Self {
        PubSubMessage {
            msg_type: PubSubType::Connected,
            content: identity.to_string().into_bytes(),
        }
    }

    pub fn connected_identity(&self) -> Option<u64> {
        std::str::from_utf8(&self.content)
            .ok()
            .and_then(|s| s.parse().ok())
    }
}
