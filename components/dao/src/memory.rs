use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::account::Account;
use crate::contacts::{FriendEvent, FriendEventType};
use crate::group::{GroupKeys, GroupRole, JoinedGroup};
use crate::message::StoredMessage;
use crate::traits::{Accounts, Contacts, GroupKeysDao, GroupUsers, StoredMessages};
use crate::{DaoError, Result};

/// In-process backend implementing every DAO trait. Used by the test
/// suites and by single-node deployments that do not carry an external
/// storage service.
#[derive(Default)]
pub struct MemoryDao {
    accounts: Mutex<HashMap<String, Account>>,
    messages: Mutex<HashMap<(String, u32), BTreeMap<u64, StoredMessage>>>,
    message_id: AtomicU64,
    group_users: Mutex<HashMap<u64, HashMap<String, (GroupRole, bool)>>>,
    group_keys: Mutex<HashMap<u64, BTreeMap<i64, GroupKeys>>>,
    friend_events: Mutex<HashMap<(String, FriendEventType), BTreeMap<i64, Vec<u8>>>>,
    friend_event_id: AtomicI64,
}

impl MemoryDao {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_account(&self, account: Account) {
        self.accounts.lock().insert(account.uid.clone(), account);
    }

    pub fn put_group_user(&self, gid: u64, uid: &str, role: GroupRole, muted: bool) {
        self.group_users
            .lock()
            .entry(gid)
            .or_default()
            .insert(uid.to_string(), (role, muted));
    }

    pub fn remove_group_user(&self, gid: u64, uid: &str) {
        if let Some(members) = self.group_users.lock().get_mut(&gid) {
            members.remove(uid);
        }
    }

    pub fn set_group_user_muted(&self, gid: u64, uid: &str, muted: bool) {
        if let Some((_, flag)) = self
            .group_users
            .lock()
            .get_mut(&gid)
            .and_then(|members| members.get_mut(uid))
        {
            *flag = muted;
        }
    }
}

impl Accounts for MemoryDao {
    fn get(&self, uid: &str) -> Result<Account> {
        self.accounts.lock().get(uid).cloned().ok_or(DaoError::NotFound)
    }

    fn get_batch(&self, uids: &[String], missed: &mut Vec<String>) -> Result<Vec<Account>> {
        let accounts = self.accounts.lock();
        let mut found = Vec::with_capacity(uids.len());
        for uid in uids {
            match accounts.get(uid) {
                Some(account) => found.push(account.clone()),
                None => missed.push(uid.clone()),
            }
        }
        Ok(found)
    }
}

impl StoredMessages for MemoryDao {
    fn set(&self, mut message: StoredMessage) -> Result<u32> {
        let key = (message.destination.clone(), message.destination_device_id);
        message.id = self.message_id.fetch_add(1, Ordering::SeqCst) + 1;

        let mut messages = self.messages.lock();
        let queue = messages.entry(key).or_default();
        queue.insert(message.id, message);
        Ok(queue.len() as u32)
    }

    fn get(
        &self,
        destination: &str,
        destination_device_id: u32,
        max_count: usize,
        has_more: &mut bool,
    ) -> Result<Vec<StoredMessage>> {
        let messages = self.messages.lock();
        let Some(queue) = messages.get(&(destination.to_string(), destination_device_id)) else {
            *has_more = false;
            return Ok(Vec::new());
        };
        // A full page means the caller should come back for more.
        *has_more = max_count > 0 && queue.len() >= max_count;
        Ok(queue.values().take(max_count).cloned().collect())
    }

    fn del(&self, destination: &str, ids: &[u64]) -> Result<()> {
        let mut messages = self.messages.lock();
        for queue in messages
            .iter_mut()
            .filter(|((uid, _), _)| uid == destination)
            .map(|(_, queue)| queue)
        {
            for id in ids {
                queue.remove(id);
            }
        }
        Ok(())
    }

    fn clear(&self, destination: &str) -> Result<()> {
        self.messages
            .lock()
            .retain(|(uid, _), _| uid != destination);
        Ok(())
    }

    fn clear_device(&self, destination: &str, destination_device_id: u32) -> Result<()> {
        self.messages
            .lock()
            .remove(&(destination.to_string(), destination_device_id));
        Ok(())
    }
}

impl GroupUsers for MemoryDao {
    fn get_joined_groups(&self, uid: &str) -> Result<Vec<u64>> {
        Ok(self
            .group_users
            .lock()
            .iter()
            .filter(|(_, members)| members.contains_key(uid))
            .map(|(gid, _)| *gid)
            .collect())
    }

    fn get_joined_group_list(&self, uid: &str) -> Result<Vec<JoinedGroup>> {
        Ok(self
            .group_users
            .lock()
            .iter()
            .filter_map(|(gid, members)| {
                members.get(uid).map(|(role, muted)| JoinedGroup {
                    gid: *gid,
                    role: *role,
                    muted: *muted,
                })
            })
            .collect())
    }

    fn get_group_detail(&self, gid: u64, uid: &str) -> Result<JoinedGroup> {
        self.group_users
            .lock()
            .get(&gid)
            .and_then(|members| members.get(uid))
            .map(|(role, muted)| JoinedGroup {
                gid,
                role: *role,
                muted: *muted,
            })
            .ok_or(DaoError::NotFound)
    }

    fn get_group_members(&self, gid: u64) -> Result<Vec<(String, GroupRole, bool)>> {
        self.group_users
            .lock()
            .get(&gid)
            .map(|members| {
                members
                    .iter()
                    .map(|(uid, (role, muted))| (uid.clone(), *role, *muted))
                    .collect()
            })
            .ok_or(DaoError::NotFound)
    }

    fn get_member_roles(&self, gid: u64, uids: &[String]) -> Result<HashMap<String, GroupRole>> {
        let group_users = self.group_users.lock();
        let members = group_users.get(&gid);
        Ok(uids
            .iter()
            .map(|uid| {
                let role = members
                    .and_then(|m| m.get(uid))
                    .map(|(role, _)| *role)
                    .unwrap_or(GroupRole::Undefined);
                (uid.clone(), role)
            })
            .collect())
    }
}

impl GroupKeysDao for MemoryDao {
    fn insert(&self, keys: GroupKeys) -> Result<()> {
        let mut group_keys = self.group_keys.lock();
        let versions = group_keys.entry(keys.gid).or_default();
        if let Some((latest, _)) = versions.iter().next_back() {
            if keys.version <= *latest {
                return Err(DaoError::Conflict);
            }
        }
        versions.insert(keys.version, keys);
        Ok(())
    }

    fn get(&self, gid: u64, versions: &[i64]) -> Result<Vec<GroupKeys>> {
        let group_keys = self.group_keys.lock();
        let Some(stored) = group_keys.get(&gid) else {
            return Ok(Vec::new());
        };
        Ok(versions
            .iter()
            .filter_map(|version| stored.get(version).cloned())
            .collect())
    }

    fn get_latest(&self, gid: u64) -> Result<GroupKeys> {
        self.group_keys
            .lock()
            .get(&gid)
            .and_then(|versions| versions.values().next_back().cloned())
            .ok_or(DaoError::NotFound)
    }

    fn latest_version(&self, gid: u64) -> Result<i64> {
        self.group_keys
            .lock()
            .get(&gid)
            .and_then(|versions| versions.keys().next_back().copied())
            .ok_or(DaoError::NotFound)
    }

    fn clear(&self, gid: u64) -> Result<()> {
        self.group_keys.lock().remove(&gid);
        Ok(())
    }
}

impl Contacts for MemoryDao {
    fn add_friend_event(
        &self,
        uid: &str,
        event_type: FriendEventType,
        data: Vec<u8>,
    ) -> Result<i64> {
        let id = self.friend_event_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.friend_events
            .lock()
            .entry((uid.to_string(), event_type))
            .or_default()
            .insert(id, data);
        Ok(id)
    }

    fn get_friend_events(
        &self,
        uid: &str,
        event_type: FriendEventType,
        max_count: usize,
    ) -> Result<Vec<FriendEvent>> {
        let events = self.friend_events.lock();
        let Some(stored) = events.get(&(uid.to_string(), event_type)) else {
            return Err(DaoError::NotFound);
        };
        Ok(stored
            .iter()
            .take(max_count)
            .map(|(id, data)| FriendEvent {
                id: *id,
                data: data.clone(),
            })
            .collect())
    }

    fn del_friend_events(
        &self,
        uid: &str,
        event_type: FriendEventType,
        ids: &[i64],
    ) -> Result<()> {
        if let Some(stored) = self
            .friend_events
            .lock()
            .get_mut(&(uid.to_string(), event_type))
        {
            for id in ids {
                stored.remove(id);
            }
        }
        Ok(())
    }
}
