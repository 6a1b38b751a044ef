use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Weak};

use dao::{GroupUsers, OsType};
use parking_lot::RwLock;
use tracing::{error, trace};

use crate::dispatch::{DispatchAddress, DispatchManager, UserStatusListener};
use crate::group::executor::KeyedExecutor;
use crate::group::subscriber::GroupMessageSubscriber;
use crate::group::GroupEventListener;

/// Per-process index of who is online and which groups they belong to.
///
/// `uid → addresses` is an ordered map because the noise sweep walks it
/// with a cursor. All mutations are serialized per key through the keyed
/// executor; reads take the shared lock.
pub struct OnlineMemberManager {
    group_users: Arc<dyn GroupUsers>,
    executor: Arc<KeyedExecutor>,
    online_users: RwLock<BTreeMap<String, BTreeSet<DispatchAddress>>>,
    group_members: RwLock<HashMap<u64, HashSet<DispatchAddress>>>,
    subscriber: RwLock<Option<Arc<GroupMessageSubscriber>>>,
    weak_self: Weak<Self>,
}

impl OnlineMemberManager {
    pub fn new(group_users: Arc<dyn GroupUsers>, executor: Arc<KeyedExecutor>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| OnlineMemberManager {
            group_users,
            executor,
            online_users: RwLock::new(BTreeMap::new()),
            group_members: RwLock::new(HashMap::new()),
            subscriber: RwLock::new(None),
            weak_self: weak_self.clone(),
        })
    }

    pub fn set_subscriber(&self, subscriber: Arc<GroupMessageSubscriber>) {
        *self.subscriber.write() = Some(subscriber);
    }

    pub fn get_group_members(&self, gid: u64) -> HashSet<DispatchAddress> {
        self.group_members
            .read()
            .get(&gid)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_online_sessions(&self, uid: &str) -> Vec<DispatchAddress> {
        self.online_users
            .read()
            .get(uid)
            .map(|addresses| addresses.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn online_user_count(&self) -> usize {
        self.online_users.read().len()
    }

    fn subscribe_gids(&self, gids: &[u64]) {
        if gids.is_empty() {
            return;
        }
        if let Some(subscriber) = self.subscriber.read().clone() {
            subscriber.subscribe_gids(gids);
        }
    }

    fn unsubscribe_gids(&self, gids: &[u64]) {
        if gids.is_empty() {
            return;
        }
        if let Some(subscriber) = self.subscriber.read().clone() {
            subscriber.unsubscribe_gids(gids);
        }
    }

    fn do_handle_user_online(&self, address: &DispatchAddress) {
        trace!("user {} is online", address);
        {
            let mut online_users = self.online_users.write();
            let addresses = online_users.entry(address.uid().to_string()).or_default();
            if !addresses.insert(address.clone()) {
                return;
            }
        }

        let details = match self.group_users.get_joined_group_list(address.uid()) {
            Ok(details) => details,
            Err(err) => {
                error!("get joined groups error: {}: {}", err, address);
                return;
            }
        };

        let mut subscribe = Vec::new();
        {
            let mut group_members = self.group_members.write();
            for detail in &details {
                if !detail.role.is_regular_member() {
                    continue;
                }
                let members = group_members.entry(detail.gid).or_default();
                if members.is_empty() {
                    subscribe.push(detail.gid);
                }
                members.insert(address.clone());
            }
        }
        self.subscribe_gids(&subscribe);
    }

    fn do_handle_user_offline(&self, address: &DispatchAddress) {
        trace!("user {} is offline", address);
        {
            let mut online_users = self.online_users.write();
            if let Some(addresses) = online_users.get_mut(address.uid()) {
                addresses.remove(address);
                if addresses.is_empty() {
                    online_users.remove(address.uid());
                }
            }
        }

        let gids = match self.group_users.get_joined_groups(address.uid()) {
            Ok(gids) => gids,
            Err(err) => {
                error!("get joined groups error: {}: {}", err, address);
                return;
            }
        };

        let mut unsubscribe = Vec::new();
        {
            let mut group_members = self.group_members.write();
            for gid in &gids {
                if let Some(members) = group_members.get_mut(gid) {
                    members.remove(address);
                    if members.is_empty() {
                        group_members.remove(gid);
                        unsubscribe.push(*gid);
                    }
                }
            }
        }
        self.unsubscribe_gids(&unsubscribe);
    }

    fn do_handle_user_enter_group(&self, uid: &str, gid: u64) {
        let sessions = self.get_online_sessions(uid);
        if sessions.is_empty() {
            trace!("could not find user {} in online uid set", uid);
            return;
        }

        let detail = match self.group_users.get_group_detail(gid, uid) {
            Ok(detail) => detail,
            Err(err) => {
                error!("get group detail error: {}, gid: {}, uid: {}", err, gid, uid);
                return;
            }
        };
        if !detail.role.is_regular_member() {
            return;
        }

        let mut subscribe = Vec::new();
        {
            let mut group_members = self.group_members.write();
            let members = group_members.entry(gid).or_default();
            if members.is_empty() {
                subscribe.push(gid);
            }
            for session in sessions {
                members.insert(session);
            }
        }
        self.subscribe_gids(&subscribe);
    }

    fn do_handle_user_leave_group(&self, uid: &str, gid: u64) {
        let sessions = self.get_online_sessions(uid);
        if sessions.is_empty() {
            trace!("could not find user {} in online uid set", uid);
            return;
        }

        let mut unsubscribe = Vec::new();
        {
            let mut group_members = self.group_members.write();
            if let Some(members) = group_members.get_mut(&gid) {
                for session in &sessions {
                    members.remove(session);
                }
                if members.is_empty() {
                    group_members.remove(&gid);
                    unsubscribe.push(gid);
                }
            }
        }
        self.unsubscribe_gids(&unsubscribe);
    }

    /// Mute state does not affect online fan-out, but a role change can
    /// ride the same event, so reload the record and re-apply it.
    fn do_handle_user_group_changed(&self, uid: &str, gid: u64) {
        match self.group_users.get_group_detail(gid, uid) {
            Ok(detail) if detail.role.is_regular_member() => {
                self.do_handle_user_enter_group(uid, gid)
            }
            Ok(_) | Err(dao::DaoError::NotFound) => self.do_handle_user_leave_group(uid, gid),
            Err(err) => {
                error!("get group detail error: {}, gid: {}, uid: {}", err, gid, uid);
            }
        }
    }

    /// Cursor sweep over the online uid map used to synthesize decoy
    /// recipients: returns up to `count` addresses of non-members of
    /// `excluded_gid` whose live session satisfies the version gate,
    /// together with the advanced cursor.
    pub fn get_online_users_for_noise(
        &self,
        start: &str,
        excluded_gid: u64,
        ios_supported: u64,
        android_supported: u64,
        count: usize,
        dispatch_manager: &Arc<DispatchManager>,
    ) -> (BTreeSet<DispatchAddress>, String) {
        let mut result = BTreeSet::new();
        let mut last_noise_uid = start.to_string();
        if count == 0 {
            return (result, last_noise_uid);
        }

        let excluded = self.get_group_members(excluded_gid);
        let mut pos = start.to_string();
        let mut started_over = false;

        // A second pass ending at or past the start cursor means every
        // online user has been considered once.
        while !(started_over && pos.as_str() >= start) {
            let mut batch = Vec::new();
            {
                let online_users = self.online_users.read();
                if online_users.is_empty() {
                    return (BTreeSet::new(), last_noise_uid);
                }
                let mut wanted = count;
                for (uid, addresses) in
                    online_users.range::<String, _>((
                        std::ops::Bound::Excluded(pos.clone()),
                        std::ops::Bound::Unbounded,
                    ))
                {
                    for address in addresses {
                        if excluded.contains(address) {
                            continue;
                        }
                        batch.push(address.clone());
                        wanted -= 1;
                        if wanted == 0 {
                            break;
                        }
                    }
                    pos = uid.clone();
                    if wanted == 0 {
                        break;
                    }
                }
            }

            if batch.is_empty() {
                pos.clear();
                started_over = true;
                continue;
            }

            for address in batch {
                if !session_supports_noise(
                    dispatch_manager,
                    &address,
                    ios_supported,
                    android_supported,
                ) {
                    continue;
                }
                if !result.insert(address.clone()) {
                    // Wrapped around onto an already-picked receiver.
                    return (result, last_noise_uid);
                }
                last_noise_uid = address.uid().to_string();
                if result.len() >= count {
                    return (result, last_noise_uid);
                }
            }
        }

        (result, last_noise_uid)
    }
}

fn session_supports_noise(
    dispatch_manager: &Arc<DispatchManager>,
    address: &DispatchAddress,
    ios_supported: u64,
    android_supported: u64,
) -> bool {
    let Some(channel) = dispatch_manager.get_channel(address) else {
        return false;
    };
    let Some(account) = channel.session().authenticated(false) else {
        return false;
    };
    let Some(device) = account.auth_device() else {
        return false;
    };
    match device.client_version.os_type {
        OsType::Ios => device.client_version.build_code >= ios_supported,
        OsType::Android => device.client_version.build_code >= android_supported,
        OsType::Unknown => false,
    }
}

impl UserStatusListener for OnlineMemberManager {
    fn on_user_online(&self, address: &DispatchAddress) {
        let Some(manager) = self.weak_self.upgrade() else {
            return;
        };
        let address = address.clone();
        let uid = address.uid().to_string();
        self.executor.post_by_uid(&uid, async move {
            manager.do_handle_user_online(&address);
        });
    }

    fn on_user_offline(&self, address: &DispatchAddress) {
        let Some(manager) = self.weak_self.upgrade() else {
            return;
        };
        let address = address.clone();
        let uid = address.uid().to_string();
        self.executor.post_by_uid(&uid, async move {
            manager.do_handle_user_offline(&address);
        });
    }
}

impl GroupEventListener for OnlineMemberManager {
    fn on_user_enter_group(&self, uid: &str, gid: u64) {
        let Some(manager) = self.weak_self.upgrade() else {
            return;
        };
        let uid = uid.to_string();
        self.executor.post_by_gid(gid, async move {
            manager.do_handle_user_enter_group(&uid, gid);
        });
    }

    fn on_user_leave_group(&self, uid: &str, gid: u64) {
        let Some(manager) = self.weak_self.upgrade() else {
            return;
        };
        let uid = uid.to_string();
        self.executor.post_by_gid(gid, async move {
            manager.do_handle_user_leave_group(&uid, gid);
        });
    }

    fn on_user_mute_group(&self, uid: &str, gid: u64) {
        let Some(manager) = self.weak_self.upgrade() else {
            return;
        };
        let uid = uid.to_string();
        self.executor.post_by_gid(gid, async move {
            manager.do_handle_user_group_changed(&uid, gid);
        });
    }

    fn on_user_unmute_group(&self, uid: &str, gid: u64) {
        let Some(manager) = self.weak_self.upgrade() else {
            return;
        };
        let uid = uid.to_string();
        self.executor.post_by_gid(gid, async move {
            manager.do_handle_user_group_changed(&uid, gid);
        });
    }
}

impl std::fmt::Debug for OnlineMemberManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnlineMemberManager")
            .field("online_users", &self.online_users.read().len())
            .field("groups", &self.group_members.read().len())
            .finish()
    }
}

// Used by tests to install state without going through the executor.
#[cfg(test)]
impl OnlineMemberManager {
    pub fn insert_online_user_sync(&self, address: &DispatchAddress) {
        self.do_handle_user_online(address);
    }

    pub fn remove_online_user_sync(&self, address: &DispatchAddress) {
        self.do_handle_user_offline(address);
    }

    pub fn debug_subscribed_groups(&self) -> Vec<u64> {
        self.group_members.read().keys().copied().collect()
    }
}
