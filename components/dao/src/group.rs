use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GroupRole {
    Undefined,
    Owner,
    Administrator,
    Member,
    Subscriber,
}

impl GroupRole {
    /// Regular members receive group fan-out; subscribers do not.
    pub fn is_regular_member(&self) -> bool {
        matches!(
            self,
            GroupRole::Owner | GroupRole::Administrator | GroupRole::Member
        )
    }
}

/// A user's membership in one group, as returned by the joined-groups
/// queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinedGroup {
    pub gid: u64,
    pub role: GroupRole,
    pub muted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupKeysMode {
    OneForEach,
    AllTheSame,
}

/// Versioned opaque key material for one group. Inserts are accepted only
/// when the version is strictly greater than the latest stored one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupKeys {
    pub gid: u64,
    pub version: i64,
    pub mode: GroupKeysMode,
    pub creator: String,
    pub keys: Vec<u8>,
}
