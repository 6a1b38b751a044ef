use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dao::memory::MemoryDao;
use dao::{Account, AccountState, ClientVersion, Device, OsType};
use online_redis::hash::hash_key;
use online_redis::{
    OnlineRedisError, PubSubService, ShardedStore, SubscriptionHandler,
};
use parking_lot::Mutex;
use proto::group::PushGroupMsgRequest;

use crate::config::{DispatcherConfig, EncryptSenderConfig};
use crate::dispatch::{crypto, DispatchManager};
use crate::messages::MessagesManager;
use crate::metrics::Metrics;
use crate::offline::peers::PeerPoster;
use crate::push::{Notification, OfflineDispatcher, PushType, PushVendor};

pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(80)).await;
}

/// A cluster of in-process buses: each simulated process gets its own
/// bus (its own retained subscriptions), publishes reach every process,
/// and subscribe acks fire immediately.
#[derive(Default)]
pub struct BusNetwork {
    buses: Mutex<Vec<Weak<InMemoryBus>>>,
}

impl BusNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(BusNetwork::default())
    }

    pub fn create_bus(self: &Arc<Self>) -> Arc<InMemoryBus> {
        let bus = Arc::new(InMemoryBus {
            network: self.clone(),
            subs: Mutex::new(HashMap::new()),
        });
        self.buses.lock().push(Arc::downgrade(&bus));
        bus
    }

    fn deliver(&self, channel: &str, payload: &[u8]) -> i64 {
        let mut delivered = 0;
        for bus in self.buses.lock().iter().filter_map(|bus| bus.upgrade()) {
            let handlers: Vec<_> = bus
                .subs
                .lock()
                .iter()
                .filter(|(subscribed, _)| {
                    *subscribed == channel
                        || subscribed
                            .strip_suffix('*')
                            .map(|prefix| channel.starts_with(prefix))
                            .unwrap_or(false)
                })
                .map(|(_, handler)| handler.clone())
                .collect();
            for handler in handlers {
                handler.on_message(channel, payload);
                delivered += 1;
            }
        }
        delivered
    }
}

pub struct InMemoryBus {
    network: Arc<BusNetwork>,
    subs: Mutex<HashMap<String, Arc<dyn SubscriptionHandler>>>,
}

#[async_trait]
impl PubSubService for InMemoryBus {
    fn subscribe(
        &self,
        _hash_key: &str,
        channel: &str,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> bool {
        self.subs.lock().insert(channel.to_string(), handler.clone());
        handler.on_subscribe(channel);
        true
    }

    fn psubscribe(
        &self,
        _hash_key: &str,
        pattern: &str,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> bool {
        self.subs.lock().insert(pattern.to_string(), handler.clone());
        handler.on_subscribe(pattern);
        true
    }

    fn unsubscribe(&self, _hash_key: &str, channel: &str) -> bool {
        self.subs.lock().remove(channel);
        true
    }

    fn punsubscribe(&self, _hash_key: &str, pattern: &str) -> bool {
        self.subs.lock().remove(pattern);
        true
    }

    fn is_subscribed(&self, _hash_key: &str, channel: &str) -> bool {
        self.subs.lock().contains_key(channel)
    }

    async fn publish(
        &self,
        _hash_key: &str,
        channel: &str,
        payload: Vec<u8>,
    ) -> online_redis::Result<i64> {
        Ok(self.network.deliver(channel, &payload))
    }
}

/// Sharded store over plain maps, with enough expiry support for the
/// lease and registry paths.
pub struct MemoryShards {
    shard_ids: Vec<i32>,
    strings: Mutex<HashMap<(i32, String), (String, Option<Instant>)>>,
    hashes: Mutex<HashMap<(i32, String), HashMap<String, String>>>,
    zsets: Mutex<HashMap<(i32, String), BTreeMap<String, i64>>>,
}

impl MemoryShards {
    pub fn new(shard_count: usize) -> Arc<Self> {
        Arc::new(MemoryShards {
            shard_ids: (0..shard_count as i32).collect(),
            strings: Mutex::new(HashMap::new()),
            hashes: Mutex::new(HashMap::new()),
            zsets: Mutex::new(HashMap::new()),
        })
    }

    pub fn zadd(&self, shard: i32, key: &str, member: &str, score: i64) {
        self.zsets
            .lock()
            .entry((shard, key.to_string()))
            .or_default()
            .insert(member.to_string(), score);
    }

    pub fn zcard(&self, shard: i32, key: &str) -> usize {
        self.zsets
            .lock()
            .get(&(shard, key.to_string()))
            .map(|zset| zset.len())
            .unwrap_or(0)
    }

    pub fn hset(&self, shard: i32, key: &str, field: &str, value: &str) {
        self.hashes
            .lock()
            .entry((shard, key.to_string()))
            .or_default()
            .insert(field.to_string(), value.to_string());
    }

    pub fn hget(&self, shard: i32, key: &str, field: &str) -> Option<String> {
        self.hashes
            .lock()
            .get(&(shard, key.to_string()))
            .and_then(|hash| hash.get(field).cloned())
    }

    pub fn has_key(&self, shard: i32, key: &str) -> bool {
        let entry = (shard, key.to_string());
        self.strings
            .lock()
            .get(&entry)
            .map(|(_, expiry)| expiry.map(|at| at > Instant::now()).unwrap_or(true))
            .unwrap_or(false)
    }

    fn live_string(&self, shard: i32, key: &str) -> Option<String> {
        let entry = (shard, key.to_string());
        let mut strings = self.strings.lock();
        match strings.get(&entry) {
            Some((value, expiry)) => {
                if expiry.map(|at| at <= Instant::now()).unwrap_or(false) {
                    strings.remove(&entry);
                    None
                } else {
                    Some(value.clone())
                }
            }
            None => None,
        }
    }
}

#[async_trait]
impl ShardedStore for MemoryShards {
    fn shard_ids(&self) -> Vec<i32> {
        self.shard_ids.clone()
    }

    fn shard_for_key(&self, key: &str) -> i32 {
        self.shard_ids[hash_key(key) as usize % self.shard_ids.len()]
    }

    async fn get(&self, shard: i32, key: &str) -> online_redis::Result<Option<String>> {
        Ok(self.live_string(shard, key))
    }

    async fn set(&self, shard: i32, key: &str, value: &str) -> online_redis::Result<()> {
        self.strings
            .lock()
            .insert((shard, key.to_string()), (value.to_string(), None));
        Ok(())
    }

    async fn set_px(
        &self,
        shard: i32,
        key: &str,
        value: &str,
        ttl_ms: u64,
    ) -> online_redis::Result<()> {
        self.strings.lock().insert(
            (shard, key.to_string()),
            (
                value.to_string(),
                Some(Instant::now() + Duration::from_millis(ttl_ms)),
            ),
        );
        Ok(())
    }

    async fn set_nx_px(
        &self,
        shard: i32,
        key: &str,
        value: &str,
        ttl_ms: u64,
    ) -> online_redis::Result<bool> {
        if self.live_string(shard, key).is_some() {
            return Ok(false);
        }
        self.set_px(shard, key, value, ttl_ms).await?;
        Ok(true)
    }

    async fn pexpire(&self, shard: i32, key: &str, ttl_ms: u64) -> online_redis::Result<bool> {
        let entry = (shard, key.to_string());
        let mut strings = self.strings.lock();
        match strings.get_mut(&entry) {
            Some((_, expiry)) => {
                *expiry = Some(Instant::now() + Duration::from_millis(ttl_ms));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn del(&self, shard: i32, key: &str) -> online_redis::Result<()> {
        let entry = (shard, key.to_string());
        self.strings.lock().remove(&entry);
        self.hashes.lock().remove(&entry);
        self.zsets.lock().remove(&entry);
        Ok(())
    }

    async fn incr(&self, shard: i32, key: &str) -> online_redis::Result<i64> {
        let entry = (shard, key.to_string());
        let mut strings = self.strings.lock();
        let next = strings
            .get(&entry)
            .and_then(|(value, _)| value.parse::<i64>().ok())
            .unwrap_or(0)
            + 1;
        strings.insert(entry, (next.to_string(), None));
        Ok(next)
    }

    async fn hmset(
        &self,
        shard: i32,
        key: &str,
        fields: &[(String, String)],
    ) -> online_redis::Result<()> {
        let mut hashes = self.hashes.lock();
        let stored = hashes.entry((shard, key.to_string())).or_default();
        for (field, value) in fields {
            stored.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hmget(
        &self,
        shard: i32,
        key: &str,
        fields: &[String],
    ) -> online_redis::Result<HashMap<String, String>> {
        let hashes = self.hashes.lock();
        let Some(hash) = hashes.get(&(shard, key.to_string())) else {
            return Ok(HashMap::new());
        };
        Ok(fields
            .iter()
            .filter_map(|field| hash.get(field).map(|value| (field.clone(), value.clone())))
            .collect())
    }

    async fn hdel(&self, shard: i32, key: &str, fields: &[String]) -> online_redis::Result<()> {
        if let Some(hash) = self.hashes.lock().get_mut(&(shard, key.to_string())) {
            for field in fields {
                hash.remove(field);
            }
        }
        Ok(())
    }

    async fn hscan_page(
        &self,
        shard: i32,
        key: &str,
        _cursor: &str,
        _count: usize,
    ) -> online_redis::Result<(String, Vec<(String, String)>)> {
        let hashes = self.hashes.lock();
        let page = hashes
            .get(&(shard, key.to_string()))
            .map(|hash| {
                hash.iter()
                    .map(|(field, value)| (field.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(("0".to_string(), page))
    }

    async fn zrangebyscore_limit(
        &self,
        shard: i32,
        key: &str,
        min: i64,
        max: i64,
        offset: isize,
        count: isize,
    ) -> online_redis::Result<Vec<(String, i64)>> {
        let zsets = self.zsets.lock();
        let Some(zset) = zsets.get(&(shard, key.to_string())) else {
            return Ok(Vec::new());
        };
        let mut rows: Vec<(String, i64)> = zset
            .iter()
            .filter(|(_, score)| **score >= min && **score <= max)
            .map(|(member, score)| (member.clone(), *score))
            .collect();
        rows.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(rows
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(count.max(0) as usize)
            .collect())
    }

    async fn zrem(&self, shard: i32, key: &str, members: &[String]) -> online_redis::Result<()> {
        if let Some(zset) = self.zsets.lock().get_mut(&(shard, key.to_string())) {
            for member in members {
                zset.remove(member);
            }
        }
        Ok(())
    }

    async fn scan_keys(&self, shard: i32, pattern: &str) -> online_redis::Result<Vec<String>> {
        let Some(prefix) = pattern.strip_suffix('*') else {
            return Err(OnlineRedisError::Redis(format!(
                "unsupported pattern {}",
                pattern
            )));
        };
        let now = Instant::now();
        Ok(self
            .strings
            .lock()
            .iter()
            .filter(|((key_shard, key), (_, expiry))| {
                *key_shard == shard
                    && key.starts_with(prefix)
                    && expiry.map(|at| at > now).unwrap_or(true)
            })
            .map(|((_, key), _)| key.clone())
            .collect())
    }
}

#[derive(Default)]
pub struct RecordingDispatcher {
    pub dispatched: Mutex<Vec<(PushType, Notification)>>,
}

impl RecordingDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingDispatcher::default())
    }

    pub fn take(&self) -> Vec<(PushType, Notification)> {
        std::mem::take(&mut self.dispatched.lock())
    }
}

#[async_trait]
impl OfflineDispatcher for RecordingDispatcher {
    async fn dispatch(&self, push_type: PushType, notification: Notification) {
        self.dispatched.lock().push((push_type, notification));
    }
}

#[derive(Default)]
pub struct RecordingPoster {
    pub group_posts: Mutex<Vec<(String, PushGroupMsgRequest)>>,
    pub notification_posts: Mutex<Vec<(String, Notification)>>,
}

impl RecordingPoster {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingPoster::default())
    }
}

#[async_trait]
impl PeerPoster for RecordingPoster {
    async fn post_group_msg(&self, addr: &str, request: &PushGroupMsgRequest) -> bool {
        self.group_posts
            .lock()
            .push((addr.to_string(), request.clone()));
        true
    }

    async fn post_notification(&self, addr: &str, notification: &Notification) -> bool {
        self.notification_posts
            .lock()
            .push((addr.to_string(), notification.clone()));
        true
    }
}

#[derive(Default)]
pub struct RecordingVendor {
    pub sent: Mutex<Vec<Notification>>,
}

impl RecordingVendor {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingVendor::default())
    }
}

#[async_trait]
impl PushVendor for RecordingVendor {
    async fn send(&self, notification: &Notification) -> bool {
        self.sent.lock().push(notification.clone());
        true
    }
}

pub fn test_device(id: u32, os_type: OsType, build_code: u64) -> Device {
    Device {
        id,
        signaling_key: crypto::test_signaling_key(),
        registration_id: 7,
        apns_id: String::new(),
        apns_type: String::new(),
        voip_apns_id: String::new(),
        fcm_id: String::new(),
        umeng_id: String::new(),
        client_version: ClientVersion {
            os_type,
            os_version: "14.2".to_string(),
            phone_model: "test".to_string(),
            build_code,
        },
        pushable: false,
    }
}

pub fn test_account(uid: &str) -> Account {
    Account {
        uid: uid.to_string(),
        state: AccountState::Normal,
        auth_device_id: 1,
        devices: vec![test_device(1, OsType::Ios, 1300)],
    }
}

pub struct TestProcess {
    pub dao: Arc<MemoryDao>,
    pub bus: Arc<InMemoryBus>,
    pub shards: Arc<MemoryShards>,
    pub manager: Arc<DispatchManager>,
    pub offline: Arc<RecordingDispatcher>,
    pub metrics: Arc<Metrics>,
}

/// One simulated server process sharing `network` and `dao`/`shards`
/// with its peers.
pub fn test_process(
    network: &Arc<BusNetwork>,
    dao: Arc<MemoryDao>,
    shards: Arc<MemoryShards>,
    encrypt_sender: EncryptSenderConfig,
) -> TestProcess {
    let bus = network.create_bus();
    let offline = RecordingDispatcher::new();
    let metrics = Arc::new(Metrics::new());
    let manager = DispatchManager::new(
        DispatcherConfig::default(),
        encrypt_sender,
        bus.clone(),
        shards.clone(),
        MessagesManager::new(dao.clone()),
        dao.clone(),
        offline.clone(),
        metrics.clone(),
    );
    manager.start();
    TestProcess {
        dao,
        bus,
        shards,
        manager,
        offline,
        metrics,
    }
}
