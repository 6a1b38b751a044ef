use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dao::{DaoError, GroupRole, GroupUsers};
use parking_lot::{Mutex, RwLock};
use tracing::{error, trace};

use crate::group::executor::KeyedExecutor;
use crate::group::GroupEventListener;

#[derive(Debug, Clone, Copy)]
struct MemberState {
    role: GroupRole,
    muted: bool,
}

/// Group membership as the offline round sees it: loaded from the DAO on
/// demand with a reload-coalescing window, then kept current by the
/// group-user event subscription.
pub struct GroupMemberMgr {
    group_users: Arc<dyn GroupUsers>,
    executor: Arc<KeyedExecutor>,
    members: RwLock<HashMap<u64, HashMap<String, MemberState>>>,
    last_load: Mutex<HashMap<u64, Instant>>,
    weak_self: Weak<Self>,
}

/// Reloads for the same group within this window coalesce into the
/// already-loaded state.
const RELOAD_COALESCE: Duration = Duration::from_secs(10);

impl GroupMemberMgr {
    pub fn new(group_users: Arc<dyn GroupUsers>, executor: Arc<KeyedExecutor>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| GroupMemberMgr {
            group_users,
            executor,
            members: RwLock::new(HashMap::new()),
            last_load: Mutex::new(HashMap::new()),
            weak_self: weak_self.clone(),
        })
    }

    /// Ensures the group is loaded; false when the DAO has no such group.
    pub fn load_group_members(&self, gid: u64) -> bool {
        {
            let last_load = self.last_load.lock();
            if let Some(loaded_at) = last_load.get(&gid) {
                if loaded_at.elapsed() < RELOAD_COALESCE {
                    return self.members.read().contains_key(&gid);
                }
            }
        }
        self.sync_reload_group_members(gid)
    }

    pub fn sync_reload_group_members(&self, gid: u64) -> bool {
        let rows = match self.group_users.get_group_members(gid) {
            Ok(rows) => rows,
            Err(DaoError::NotFound) => {
                self.members.write().remove(&gid);
                self.last_load.lock().insert(gid, Instant::now());
                return false;
            }
            Err(err) => {
                error!("load group members error, gid: {}: {}", gid, err);
                return false;
            }
        };

        let mut loaded = HashMap::with_capacity(rows.len());
        for (uid, role, muted) in rows {
            loaded.insert(uid, MemberState { role, muted });
        }
        self.members.write().insert(gid, loaded);
        self.last_load.lock().insert(gid, Instant::now());
        true
    }

    pub fn is_group_exist(&self, gid: u64) -> bool {
        self.members.read().contains_key(&gid)
    }

    pub fn is_member_exists(&self, uid: &str, gid: u64) -> bool {
        self.members
            .read()
            .get(&gid)
            .map(|members| members.contains_key(uid))
            .unwrap_or(false)
    }

    pub fn get_unmuted_members(&self, gid: u64) -> HashSet<String> {
        self.members
            .read()
            .get(&gid)
            .map(|members| {
                members
                    .iter()
                    .filter(|(_, state)| !state.muted && state.role.is_regular_member())
                    .map(|(uid, _)| uid.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn do_enter(&self, uid: &str, gid: u64) {
        let detail = match self.group_users.get_group_detail(gid, uid) {
            Ok(detail) => detail,
            Err(DaoError::NotFound) => {
                self.do_leave(uid, gid);
                return;
            }
            Err(err) => {
                error!("get group detail error: {}, gid: {}, uid: {}", err, gid, uid);
                return;
            }
        };
        if let Some(members) = self.members.write().get_mut(&gid) {
            members.insert(
                uid.to_string(),
                MemberState {
                    role: detail.role,
                    muted: detail.muted,
                },
            );
        }
    }

    fn do_leave(&self, uid: &str, gid: u64) {
        if let Some(members) = self.members.write().get_mut(&gid) {
            members.remove(uid);
        }
    }

    fn do_set_muted(&self, uid: &str, gid: u64, muted: bool) {
        if let Some(state) = self
            .members
            .write()
            .get_mut(&gid)
            .and_then(|members| members.get_mut(uid))
        {
            state.muted = muted;
        }
    }
}

impl GroupEventListener for GroupMemberMgr {
    fn on_user_enter_group(&self, uid: &str, gid: u64) {
        let Some(mgr) = self.weak_self.upgrade() else {
            return;
        };
        if !mgr.is_group_exist(gid) {
            trace!("group {} not loaded, skipping enter event", gid);
            return;
        }
        let uid = uid.to_string();
        self.executor.post_by_gid(gid, async move {
            mgr.do_enter(&uid, gid);
        });
    }

    fn on_user_leave_group(&self, uid: &str, gid: u64) {
        let Some(mgr) = self.weak_self.upgrade() else {
            return;
        };
        if !mgr.is_group_exist(gid) {
            return;
        }
        let uid = uid.to_string();
        self.executor.post_by_gid(gid, async move {
            mgr.do_leave(&uid, gid);
        });
    }

    fn on_user_mute_group(&self, uid: &str, gid: u64) {
        let Some(mgr) = self.weak_self.upgrade() else {
            return;
        };
        let uid = uid.to_string();
        self.executor.post_by_gid(gid, async move {
            mgr.do_set_muted(&uid, gid, true);
        });
    }

    fn on_user_unmute_group(&self, uid: &str, gid: u64) {
        let Some(mgr) = self.weak_self.upgrade() else {
            return;
        };
        let uid = uid.to_string();
        self.executor.post_by_gid(gid, async move {
            mgr.do_set_muted(&uid, gid, false);
        });
    }
}
