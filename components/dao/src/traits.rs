use std::collections::HashMap;

use crate::account::Account;
use crate::contacts::{FriendEvent, FriendEventType};
use crate::group::{GroupKeys, GroupRole, JoinedGroup};
use crate::message::StoredMessage;
use crate::Result;

pub trait Accounts: Send + Sync {
    fn get(&self, uid: &str) -> Result<Account>;

    /// Batch fetch; uids that do not exist are reported in `missed`
    /// instead of failing the call.
    fn get_batch(&self, uids: &[String], missed: &mut Vec<String>) -> Result<Vec<Account>>;
}

pub trait StoredMessages: Send + Sync {
    /// Stores one message, assigning its id, and returns the unread count
    /// for the destination device.
    fn set(&self, message: StoredMessage) -> Result<u32>;

    /// Fetches up to `max_count` messages in FIFO order; `has_more` is set
    /// when further rows remain.
    fn get(
        &self,
        destination: &str,
        destination_device_id: u32,
        max_count: usize,
        has_more: &mut bool,
    ) -> Result<Vec<StoredMessage>>;

    fn del(&self, destination: &str, ids: &[u64]) -> Result<()>;

    /// Removes every device's queue for the destination.
    fn clear(&self, destination: &str) -> Result<()>;

    fn clear_device(&self, destination: &str, destination_device_id: u32) -> Result<()>;
}

pub trait GroupUsers: Send + Sync {
    fn get_joined_groups(&self, uid: &str) -> Result<Vec<u64>>;

    fn get_joined_group_list(&self, uid: &str) -> Result<Vec<JoinedGroup>>;

    fn get_group_detail(&self, gid: u64, uid: &str) -> Result<JoinedGroup>;

    /// Members of one group with their mute flag.
    fn get_group_members(&self, gid: u64) -> Result<Vec<(String, GroupRole, bool)>>;

    /// Roles for the queried uids; absent uids come back as
    /// `GroupRole::Undefined`.
    fn get_member_roles(
        &self,
        gid: u64,
        uids: &[String],
    ) -> Result<HashMap<String, GroupRole>>;
}

pub trait GroupKeysDao: Send + Sync {
    /// Accepts the insert only if `keys.version` is strictly greater than
    /// the latest stored version for the group.
    fn insert(&self, keys: GroupKeys) -> Result<()>;

    fn get(&self, gid: u64, versions: &[i64]) -> Result<Vec<GroupKeys>>;

    fn get_latest(&self, gid: u64) -> Result<GroupKeys>;

    fn latest_version(&self, gid: u64) -> Result<i64>;

    fn clear(&self, gid: u64) -> Result<()>;
}

pub trait Contacts: Send + Sync {
    fn add_friend_event(
        &self,
        uid: &str,
        event_type: FriendEventType,
        data: Vec<u8>,
    ) -> Result<i64>;

    fn get_friend_events(
        &self,
        uid: &str,
        event_type: FriendEventType,
        max_count: usize,
    ) -> Result<Vec<FriendEvent>>;

    fn del_friend_events(
        &self,
        uid: &str,
        event_type: FriendEventType,
        ids: &[i64],
    ) -> Result<()>;
}
