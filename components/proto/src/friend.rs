use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendRequest {
    pub proposer: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendReply {
    pub proposer: String,
    pub approved: bool,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteFriend {
    pub uid: String,
    pub payload: Vec<u8>,
}

/// Batch of friend events forwarded to the client as
/// `PUT /api/v1/friends`. Entries that cannot be delivered are persisted
/// per kind for replay at the next login.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendMessage {
    pub requests: Vec<FriendRequest>,
    pub replies: Vec<FriendReply>,
    pub deletes: Vec<DeleteFriend>,
}

impl FriendMessage {
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.replies.is_empty() && self.deletes.is_empty()
    }
}
