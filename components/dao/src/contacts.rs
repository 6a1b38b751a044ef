use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FriendEventType {
    FriendRequest,
    FriendReply,
    DeleteFriend,
}

/// One undelivered friend event, replayed to the master device at login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendEvent {
    pub id: i64,
    pub data: Vec<u8>,
}
