use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use dao::{GroupRole, GroupUsers, MASTER_DEVICE_ID};
use online_redis::ShardedStore;
use proto::group::PushGroupMsgRequest;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::accounts::AccountsManager;
use crate::config::OfflineConfig;
use crate::dispatch::DispatchAddress;
use crate::offline::lease::MasterLeaseAgent;
use crate::offline::member_mgr::GroupMemberMgr;
use crate::offline::peers::PeerPoster;
use crate::offline::registry::OfflineServerRegistry;
use crate::offline::watermark::RoundWatermarks;
use crate::push::{Notification, PushService};
use crate::store_format::{
    group_user_info_key, CursorConfigFlag, GroupMsgRow, GroupUserCursor, MulticastMembers,
    PushPeopleType, ACCOUNT_FETCH_BATCH, KEY_GROUP_ACTIVE, KEY_GROUP_MSG_LIST,
    KEY_GROUP_MULTI_MSG_LIST, OFFLINE_MSG_DELAY_SECS, OFFLINE_MSG_EXPIRE_SECS,
    OFFLINE_MSG_SCAN_SIZE, OFFLINE_USER_SCAN_SIZE,
};

/// One pending message inside a per-gid task.
#[derive(Debug, Clone)]
struct PendingMessage {
    last_mid: u64,
    push_type: PushPeopleType,
    enqueue_ts: i64,
    db_key: String,
    shard: i32,
    multicast: Option<MulticastMembers>,
}

#[derive(Debug, Default)]
struct GroupTask {
    pre_round_mid: u64,
    broadcast_count: usize,
    multicast_count: usize,
    messages: Vec<PendingMessage>,
    multicast_members: HashSet<String>,
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// The leader-elected batch that drains the offline group-message queue,
/// resolves push tokens and dispatches to the owning vendor, locally or
/// through a peer offline server.
pub struct OfflinePushService {
    config: OfflineConfig,
    db_pool: Arc<dyn ShardedStore>,
    accounts: Arc<AccountsManager>,
    group_users: Arc<dyn GroupUsers>,
    member_mgr: Arc<GroupMemberMgr>,
    push_service: Arc<PushService>,
    registry: Arc<OfflineServerRegistry>,
    poster: Arc<dyn PeerPoster>,
    lease: Arc<MasterLeaseAgent>,
    watermarks: RoundWatermarks,
    task_count: AtomicI64,
    round_start_ms: AtomicU64,
    push_permits: Arc<Semaphore>,
}

impl OfflinePushService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OfflineConfig,
        db_pool: Arc<dyn ShardedStore>,
        accounts: Arc<AccountsManager>,
        group_users: Arc<dyn GroupUsers>,
        member_mgr: Arc<GroupMemberMgr>,
        push_service: Arc<PushService>,
        registry: Arc<OfflineServerRegistry>,
        poster: Arc<dyn PeerPoster>,
        lease: Arc<MasterLeaseAgent>,
    ) -> Arc<Self> {
        let push_permits = Arc::new(Semaphore::new(config.push_threads.max(1)));
        Arc::new(OfflinePushService {
            config,
            db_pool,
            accounts,
            group_users,
            member_mgr,
            push_service,
            registry,
            poster,
            lease,
            watermarks: RoundWatermarks::new(),
            task_count: AtomicI64::new(0),
            round_start_ms: AtomicU64::new(0),
            push_permits,
        })
    }

    pub fn lease(&self) -> &Arc<MasterLeaseAgent> {
        &self.lease
    }

    pub fn is_last_round_finished(&self) -> bool {
        self.task_count.load(Ordering::SeqCst) == 0
    }

    /// Spawns the fixed-interval round driver.
    pub fn start(self: &Arc<Self>) {
        let service = self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(service.config.interval_ms.max(100)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;

                if !service.lease.is_master() {
                    debug!("offline service is not master, time: {}", now_secs());
                    continue;
                }
                if !service.is_last_round_finished() {
                    let now_ms = SystemTime::now()
                        .duration_since(SystemTime::UNIX_EPOCH)
                        .map(|d| d.as_millis() as u64)
                        .unwrap_or(0);
                    error!(
                        "offline round is not finished, running for {} ms",
                        now_ms.saturating_sub(service.round_start_ms.load(Ordering::Relaxed))
                    );
                    continue;
                }
                service.run_round().await;
            }
        });
    }

    /// One pass: scan every active shard, group the pending rows by gid,
    /// then fan the per-gid tasks out to the worker pool.
    pub async fn run_round(self: &Arc<Self>) {
        let started = Instant::now();
        let mut tasks: BTreeMap<u64, GroupTask> = BTreeMap::new();
        let mut active_shards = Vec::new();

        for shard in self.db_pool.shard_ids() {
            match self.db_pool.get(shard, KEY_GROUP_ACTIVE).await {
                Ok(Some(value)) if !value.is_empty() => {
                    if self.scan_shard(shard, &mut tasks).await {
                        active_shards.push(shard);
                    }
                }
                Ok(_) => {}
                Err(err) => warn!("group_active read failed on shard {}: {}", shard, err),
            }
        }

        self.task_count.store(tasks.len() as i64, Ordering::SeqCst);
        self.round_start_ms.store(
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            Ordering::Relaxed,
        );

        info!(
            "start offline push round, gid count: {}, active shards: {:?}",
            tasks.len(),
            active_shards
        );

        for (gid, task) in tasks {
            // Lease loss is cooperative: in-flight tasks finish, no new
            // ones are posted.
            if !self.lease.is_master() {
                self.task_count.fetch_sub(1, Ordering::SeqCst);
                continue;
            }
            let service = self.clone();
            let shards = active_shards.clone();
            tokio::spawn(async move {
                let _permit = service.push_permits.acquire().await;
                service.handle_group_task(&shards, gid, task).await;
                service.task_count.fetch_sub(1, Ordering::SeqCst);
            });
        }

        info!(
            "offline push round posted in {} ms",
            started.elapsed().as_millis()
        );
    }

    /// Drains `group_msg_list` on one shard into the task map; true when
    /// the shard contributed at least one usable row.
    async fn scan_shard(&self, shard: i32, tasks: &mut BTreeMap<u64, GroupTask>) -> bool {
        let max_ts = now_secs() - OFFLINE_MSG_DELAY_SECS;
        let mut found_data = false;

        loop {
            let rows = match self
                .db_pool
                .zrangebyscore_limit(shard, KEY_GROUP_MSG_LIST, 0, max_ts, 0, OFFLINE_MSG_SCAN_SIZE)
                .await
            {
                Ok(rows) => rows,
                Err(err) => {
                    error!("scan of {} failed on shard {}: {}", KEY_GROUP_MSG_LIST, shard, err);
                    break;
                }
            };

            let mut clean = Vec::new();
            let mut multicast_fetch = Vec::new();

            for (member, score) in &rows {
                let Some(parsed) = GroupMsgRow::parse(member) else {
                    error!(
                        "group list format error, shard {}: member {}, tm {}",
                        shard, member, score
                    );
                    clean.push(member.clone());
                    continue;
                };

                found_data = true;

                if now_secs() - score > OFFLINE_MSG_EXPIRE_SECS {
                    clean.push(member.clone());
                    continue;
                }

                let mut pre_round_mid = 0;
                if let Some(seq) = self.watermarks.get(parsed.gid) {
                    pre_round_mid = seq.last_mid;
                    if seq.last_mid > parsed.mid {
                        error!(
                            "expired group message, shard {}: member {}, surpassed by mid {}",
                            shard, member, seq.last_mid
                        );
                        clean.push(member.clone());
                        continue;
                    }
                }

                let task = tasks.entry(parsed.gid).or_default();
                if task.messages.is_empty() {
                    task.pre_round_mid = pre_round_mid;
                }
                match parsed.push_type {
                    PushPeopleType::Multicast => {
                        task.multicast_count += 1;
                        multicast_fetch.push(member.clone());
                    }
                    PushPeopleType::Broadcast => task.broadcast_count += 1,
                }
                task.messages.push(PendingMessage {
                    last_mid: parsed.mid,
                    push_type: parsed.push_type,
                    enqueue_ts: *score,
                    db_key: member.clone(),
                    shard,
                    multicast: None,
                });
                clean.push(member.clone());
            }

            if !clean.is_empty()
                && self
                    .db_pool
                    .zrem(shard, KEY_GROUP_MSG_LIST, &clean)
                    .await
                    .is_err()
            {
                break;
            }

            if !multicast_fetch.is_empty() {
                self.fetch_multicast_members(shard, &multicast_fetch, tasks).await;
            }

            if rows.len() < OFFLINE_MSG_SCAN_SIZE as usize {
                break;
            }
        }

        found_data
    }

    /// Recovers the explicit recipient sets of multicast rows and deletes
    /// the companion hash fields.
    async fn fetch_multicast_members(
        &self,
        shard: i32,
        members: &[String],
        tasks: &mut BTreeMap<u64, GroupTask>,
    ) {
        let values = match self
            .db_pool
            .hmget(shard, KEY_GROUP_MULTI_MSG_LIST, members)
            .await
        {
            Ok(values) => values,
            Err(err) => {
                error!(
                    "hmget of {} failed on shard {}: {}",
                    KEY_GROUP_MULTI_MSG_LIST, shard, err
                );
                return;
            }
        };

        for (field, value) in &values {
            let Some(row) = GroupMsgRow::parse(field) else {
                error!("multicast field format error, shard {}: {}", shard, field);
                continue;
            };
            let Some(task) = tasks.get_mut(&row.gid) else {
                error!("multicast row without task, shard {}: {}", shard, field);
                continue;
            };
            let Some(recipients) = MulticastMembers::from_json(value) else {
                error!(
                    "multicast member format error, shard {}: {} -> {}",
                    shard, field, value
                );
                continue;
            };
            for message in task
                .messages
                .iter_mut()
                .filter(|message| message.last_mid == row.mid)
            {
                message.multicast = Some(recipients.clone());
            }
            task.multicast_members.extend(recipients.members);
        }

        self.db_pool
            .hdel(shard, KEY_GROUP_MULTI_MSG_LIST, members)
            .await
            .ok();
    }

    async fn handle_group_task(&self, shards: &[i32], gid: u64, task: GroupTask) {
        if !self.member_mgr.load_group_members(gid) {
            return;
        }
        let member_uids = self.member_mgr.get_unmuted_members(gid);
        if member_uids.is_empty() {
            info!("group {} has no member", gid);
            return;
        }

        info!(
            "group {}: members {}, broadcast {}, multicast {}, preRoundMid {}, msg count {}",
            gid,
            member_uids.len(),
            task.broadcast_count,
            task.multicast_count,
            task.pre_round_mid,
            task.messages.len()
        );

        // Cursor source: full scan when any broadcast row exists, targeted
        // hmget when the task is purely multicast.
        let mut cursors: HashMap<String, GroupUserCursor> = HashMap::new();
        if task.broadcast_count > 0 {
            self.scan_group_cursors(shards, gid, &mut cursors).await;
        } else {
            let uids: Vec<String> = task.multicast_members.iter().cloned().collect();
            self.hmget_group_cursors(shards, gid, &uids, &mut cursors).await;
        }

        let mut messages = task.messages;
        messages.sort_by_key(|message| message.last_mid);

        for message in &messages {
            match message.push_type {
                PushPeopleType::Multicast => {
                    self.handle_multicast_message(shards, gid, message, &mut cursors).await;
                }
                PushPeopleType::Broadcast => {
                    self.handle_broadcast_message(shards, gid, message, &member_uids, &mut cursors)
                        .await;
                }
            }
            self.watermarks
                .update_mid(gid, message.enqueue_ts as u32, message.last_mid);
        }

        self.reconcile_members(shards, gid, &member_uids, &cursors).await;
    }

    async fn scan_group_cursors(
        &self,
        shards: &[i32],
        gid: u64,
        cursors: &mut HashMap<String, GroupUserCursor>,
    ) {
        let key = group_user_info_key(gid);
        for shard in shards {
            let mut cursor = "0".to_string();
            loop {
                let (next, page) = match self
                    .db_pool
                    .hscan_page(*shard, &key, &cursor, OFFLINE_USER_SCAN_SIZE)
                    .await
                {
                    Ok(result) => result,
                    Err(err) => {
                        warn!("group_user scan failed, shard {} gid {}: {}", shard, gid, err);
                        break;
                    }
                };

                for (uid, value) in page {
                    let Some(parsed) = GroupUserCursor::from_json(&value) else {
                        error!(
                            "group_user format error, shard {} gid {} uid {}",
                            shard, gid, uid
                        );
                        continue;
                    };
                    match cursors.get(&uid) {
                        Some(existing) if existing.last_mid >= parsed.last_mid => {}
                        _ => {
                            cursors.insert(uid, parsed);
                        }
                    }
                }

                if next == "0" {
                    break;
                }
                cursor = next;
            }
        }
    }

    async fn hmget_group_cursors(
        &self,
        shards: &[i32],
        gid: u64,
        uids: &[String],
        cursors: &mut HashMap<String, GroupUserCursor>,
    ) {
        if uids.is_empty() {
            return;
        }
        let key = group_user_info_key(gid);
        for shard in shards {
            let values = match self.db_pool.hmget(*shard, &key, uids).await {
                Ok(values) => values,
                Err(err) => {
                    warn!("group_user hmget failed, shard {} gid {}: {}", shard, gid, err);
                    continue;
                }
            };
            for (uid, value) in values {
                let Some(parsed) = GroupUserCursor::from_json(&value) else {
                    error!(
                        "group_user format error, shard {} gid {} uid {}",
                        shard, gid, uid
                    );
                    continue;
                };
                match cursors.get(&uid) {
                    Some(existing) if existing.last_mid >= parsed.last_mid => {}
                    _ => {
                        cursors.insert(uid, parsed);
                    }
                }
            }
        }
    }

    async fn handle_multicast_message(
        &self,
        shards: &[i32],
        gid: u64,
        message: &PendingMessage,
        cursors: &mut HashMap<String, GroupUserCursor>,
    ) {
        let Some(recipients) = &message.multicast else {
            warn!(
                "multicast message without member list, gid {} mid {}",
                gid, message.last_mid
            );
            return;
        };

        let targets: HashSet<String> = recipients.members.iter().cloned().collect();
        let Some(mut offline) = self
            .resolve_offline_recipients(&targets, gid, message, cursors)
            .await
        else {
            return;
        };
        offline.remove(&recipients.from_uid);
        if offline.is_empty() {
            info!(
                "all multicast members of group {} are currently online, mid {}",
                gid, message.last_mid
            );
            return;
        }

        self.push_offline(shards, gid, message, offline).await;
    }

    async fn handle_broadcast_message(
        &self,
        shards: &[i32],
        gid: u64,
        message: &PendingMessage,
        member_uids: &HashSet<String>,
        cursors: &mut HashMap<String, GroupUserCursor>,
    ) {
        let Some(offline) = self
            .resolve_offline_recipients(member_uids, gid, message, cursors)
            .await
        else {
            return;
        };
        self.push_offline(shards, gid, message, offline).await;
    }

    /// Filters the recipient set down to users whose cursor is behind the
    /// message, resolving missing push tokens through the accounts DAO in
    /// batches. Stale hash entries of vanished accounts are deleted.
    async fn resolve_offline_recipients(
        &self,
        recipients: &HashSet<String>,
        gid: u64,
        message: &PendingMessage,
        cursors: &mut HashMap<String, GroupUserCursor>,
    ) -> Option<HashMap<String, GroupUserCursor>> {
        let mut offline: HashMap<String, GroupUserCursor> = HashMap::new();
        let mut unresolved: Vec<String> = Vec::new();

        for uid in recipients {
            match cursors.get(uid) {
                Some(cursor) => {
                    if cursor.last_mid >= message.last_mid {
                        continue;
                    }
                    if cursor.cfg_flag == CursorConfigFlag::NoConfig {
                        warn!(
                            "user not configured for push, gid {} uid {} mid {}",
                            gid, uid, message.last_mid
                        );
                        continue;
                    }
                    offline.insert(uid.clone(), cursor.clone());
                    if !cursor.has_push_token()
                        || (!cursor.apns_id.is_empty() && cursor.os_version.is_empty())
                    {
                        unresolved.push(uid.clone());
                    }
                }
                None => {
                    offline.insert(
                        uid.clone(),
                        GroupUserCursor {
                            last_mid: message.last_mid,
                            ..Default::default()
                        },
                    );
                    unresolved.push(uid.clone());
                }
            }
        }

        if offline.is_empty() {
            info!(
                "all members of group {} are currently online, mid {} db_key {}",
                gid, message.last_mid, message.db_key
            );
            return None;
        }

        let mut missed = Vec::new();
        for chunk in unresolved.chunks(ACCOUNT_FETCH_BATCH) {
            if !self.fill_push_tokens(chunk, &mut offline, &mut missed) {
                return None;
            }
        }

        if !missed.is_empty() {
            self.db_pool
                .hdel(message.shard, &group_user_info_key(gid), &missed)
                .await
                .ok();
        }

        for uid in &unresolved {
            if let Some(resolved) = offline.get(uid) {
                cursors.insert(uid.clone(), resolved.clone());
            }
        }

        Some(offline)
    }

    fn fill_push_tokens(
        &self,
        uids: &[String],
        offline: &mut HashMap<String, GroupUserCursor>,
        missed: &mut Vec<String>,
    ) -> bool {
        let mut batch_missed = Vec::new();
        let accounts = match self.accounts.get_batch(uids, &mut batch_missed) {
            Ok(accounts) => accounts,
            Err(err) => {
                error!("account batch fetch failed: {}", err);
                return false;
            }
        };

        for uid in &batch_missed {
            if let Some(cursor) = offline.get_mut(uid) {
                cursor.cfg_flag = CursorConfigFlag::NoConfig;
            }
            missed.push(uid.clone());
        }

        for account in &accounts {
            let Some(device) = account.master_device() else {
                warn!("account {} does not have a master device", account.uid);
                continue;
            };
            let Some(cursor) = offline.get_mut(&account.uid) else {
                continue;
            };
            if !device.is_pushable() {
                cursor.cfg_flag = CursorConfigFlag::NoConfig;
                continue;
            }
            cursor.cfg_flag = CursorConfigFlag::Normal;
            cursor.apns_id = device.apns_id.clone();
            cursor.apns_type = device.apns_type.clone();
            cursor.voip_apns_id = device.voip_apns_id.clone();
            cursor.fcm_id = device.fcm_id.clone();
            cursor.umeng_id = device.umeng_id.clone();
            cursor.os_type = device.client_version.os_type.code();
            cursor.os_version = device.client_version.os_version.clone();
            cursor.phone_model = device.client_version.phone_model.clone();
            cursor.build_code = device.client_version.build_code;
            cursor.target_address =
                DispatchAddress::new(account.uid.clone(), MASTER_DEVICE_ID).serialized();
        }
        true
    }

    /// Vendor dispatch plus cursor write-back for one message.
    async fn push_offline(
        &self,
        shards: &[i32],
        gid: u64,
        message: &PendingMessage,
        mut offline: HashMap<String, GroupUserCursor>,
    ) {
        let mut write_back: Vec<(String, String)> = Vec::new();
        let mut peer_routed: HashMap<crate::push::PushType, HashMap<String, String>> =
            HashMap::new();

        for (uid, cursor) in offline.iter_mut() {
            cursor.last_mid = message.last_mid;
            let notification = Notification::from_group_cursor(gid, message.last_mid, cursor);

            if let Some(push_type) = notification.push_type() {
                if self.push_service.handles(push_type) {
                    if self.config.is_push {
                        self.push_service.send(push_type, &notification).await;
                    }
                } else {
                    peer_routed
                        .entry(push_type)
                        .or_default()
                        .insert(uid.clone(), cursor.to_json());
                }
            }
            write_back.push((uid.clone(), cursor.to_json()));
        }

        for (push_type, destinations) in peer_routed {
            let server = self.registry.random_server(push_type).await;
            match server {
                Some(addr) if self.config.is_push => {
                    let request = PushGroupMsgRequest {
                        gid: gid.to_string(),
                        mid: message.last_mid.to_string(),
                        destinations,
                    };
                    info!(
                        "posting group push to peer {}: gid {} mid {}",
                        addr, gid, message.last_mid
                    );
                    if !self.poster.post_group_msg(&addr, &request).await {
                        error!(
                            "peer group push failed, host {} gid {} mid {}",
                            addr, gid, message.last_mid
                        );
                    }
                }
                _ => {
                    error!(
                        "no offline server for push type {:?}, gid {} mid {}",
                        push_type, gid, message.last_mid
                    );
                }
            }
        }

        let key = group_user_info_key(gid);
        for shard in shards {
            if self.db_pool.hmset(*shard, &key, &write_back).await.is_ok() {
                break;
            }
        }
    }

    /// Drops hash entries of users that truly left; forces a member
    /// reload when the DAO knows someone the in-memory set does not.
    async fn reconcile_members(
        &self,
        shards: &[i32],
        gid: u64,
        member_uids: &HashSet<String>,
        cursors: &HashMap<String, GroupUserCursor>,
    ) {
        let missing: Vec<String> = cursors
            .keys()
            .filter(|uid| !member_uids.contains(*uid))
            .cloned()
            .collect();
        if missing.is_empty() {
            return;
        }

        let roles = match self.group_users.get_member_roles(gid, &missing) {
            Ok(roles) => roles,
            Err(err) => {
                error!("get member roles error, gid {}: {}", gid, err);
                return;
            }
        };

        let mut reload = false;
        let mut departed = Vec::new();
        for (uid, role) in &roles {
            if *role != GroupRole::Undefined {
                if !self.member_mgr.is_member_exists(uid, gid) {
                    reload = true;
                }
            } else {
                departed.push(uid.clone());
            }
        }

        if !departed.is_empty() {
            let key = group_user_info_key(gid);
            for shard in shards {
                self.db_pool.hdel(*shard, &key, &departed).await.ok();
            }
        }
        if reload {
            self.member_mgr.sync_reload_group_members(gid);
        }

        info!(
            "reconciled group {}: reload {}, departed {:?}",
            gid, reload, departed
        );
    }
}
