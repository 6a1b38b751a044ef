use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use dao::memory::MemoryDao;
use dao::GroupRole;
use online_redis::ShardedStore;

use crate::accounts::AccountsManager;
use crate::config::OfflineConfig;
use crate::group::KeyedExecutor;
use crate::offline::lease::MasterLeaseAgent;
use crate::offline::member_mgr::GroupMemberMgr;
use crate::offline::registry::OfflineServerRegistry;
use crate::offline::round::OfflinePushService;
use crate::push::{PushService, PushType, PushVendor};
use crate::store_format::{
    group_user_info_key, GroupUserCursor, KEY_GROUP_ACTIVE, KEY_GROUP_MSG_LIST,
};
use crate::tests::util::{test_account, MemoryShards, RecordingPoster, RecordingVendor};

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

struct OfflineFixture {
    shards: Arc<MemoryShards>,
    service: Arc<OfflinePushService>,
    lease: Arc<MasterLeaseAgent>,
    poster: Arc<RecordingPoster>,
    vendor: Arc<RecordingVendor>,
}

async fn offline_fixture(
    dao: Arc<MemoryDao>,
    shards: Arc<MemoryShards>,
    local_vendors: &[PushType],
    lease_ttl_ms: u64,
) -> OfflineFixture {
    let mut vendors: HashMap<PushType, Arc<dyn PushVendor>> = HashMap::new();
    let vendor = RecordingVendor::new();
    for push_type in local_vendors {
        vendors.insert(*push_type, vendor.clone());
    }
    let push_service = PushService::new(vendors, shards.clone());

    let executor = Arc::new(KeyedExecutor::new(2));
    let member_mgr = GroupMemberMgr::new(dao.clone(), executor);
    let registry = OfflineServerRegistry::new(shards.clone());
    let poster = RecordingPoster::new();
    let lease = MasterLeaseAgent::new(
        shards.clone(),
        "offline_redis_test".to_string(),
        lease_ttl_ms,
        None,
    );
    lease.start();

    let service = OfflinePushService::new(
        OfflineConfig {
            interval_ms: 3_600_000,
            ..Default::default()
        },
        shards.clone(),
        AccountsManager::new(dao.clone()),
        dao.clone(),
        member_mgr,
        push_service,
        registry,
        poster.clone(),
        lease.clone(),
    );

    wait_for(|| lease.is_master(), 3000).await;

    OfflineFixture {
        shards,
        service,
        lease,
        poster,
        vendor,
    }
}

async fn wait_for(mut predicate: impl FnMut() -> bool, timeout_ms: u64) {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    while !predicate() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn run_round_to_completion(service: &Arc<OfflinePushService>) {
    service.run_round().await;
    let service = service.clone();
    wait_for(move || service.is_last_round_finished(), 3000).await;
    // Give the last spawned task a beat to finish its writes.
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn seed_group_with_offline_user(dao: &MemoryDao, gid: u64, uid: &str) {
    let mut account = test_account(uid);
    account.devices[0].pushable = true;
    account.devices[0].apns_id = format!("{}-apns", uid);
    dao.put_account(account);
    dao.put_group_user(gid, uid, GroupRole::Member, false);
}

#[tokio::test]
async fn round_routes_unhandled_vendor_to_peer_server() {
    let dao = Arc::new(MemoryDao::new());
    let shards = MemoryShards::new(2);
    seed_group_with_offline_user(&dao, 100, "u5");

    shards.set(0, KEY_GROUP_ACTIVE, "1").await.unwrap();
    shards.zadd(0, KEY_GROUP_MSG_LIST, "100_500_0", now_secs() - 60);
    // A peer advertises APNS; this process handles nothing locally.
    shards
        .set_px(0, "offline_svr:apns:10.0.0.2:8200", "1", 60_000)
        .await
        .unwrap();

    let fixture = offline_fixture(dao, shards.clone(), &[], 10_000).await;
    run_round_to_completion(&fixture.service).await;

    let posts = fixture.poster.group_posts.lock().clone();
    assert_eq!(posts.len(), 1);
    let (addr, request) = &posts[0];
    assert_eq!(addr, "10.0.0.2:8200");
    assert_eq!(request.gid, "100");
    assert_eq!(request.mid, "500");
    assert!(request.destinations.contains_key("u5"));

    // Cursor write-back advanced the recipient to the pushed mid.
    let raw = shards
        .hget(0, &group_user_info_key(100), "u5")
        .expect("cursor written back");
    let cursor = GroupUserCursor::from_json(&raw).unwrap();
    assert_eq!(cursor.last_mid, 500);
    assert_eq!(cursor.apns_id, "u5-apns");

    // The queue row was consumed.
    assert_eq!(shards.zcard(0, KEY_GROUP_MSG_LIST), 0);
}

#[tokio::test]
async fn round_pushes_locally_handled_vendor_and_bumps_badge() {
    let dao = Arc::new(MemoryDao::new());
    let shards = MemoryShards::new(1);
    seed_group_with_offline_user(&dao, 200, "u6");

    shards.set(0, KEY_GROUP_ACTIVE, "1").await.unwrap();
    shards.zadd(0, KEY_GROUP_MSG_LIST, "200_7_0", now_secs() - 60);

    let fixture = offline_fixture(dao, shards.clone(), &[PushType::Apns], 10_000).await;
    run_round_to_completion(&fixture.service).await;

    let sent = fixture.vendor.sent.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].badge, 1);
    assert_eq!(sent[0].target_address, "u6:1");
    assert!(fixture.poster.group_posts.lock().is_empty());

    // The APNS badge counter was bumped for the recipient.
    assert_eq!(
        fixture
            .shards
            .get(fixture.shards.shard_for_key("u6"), "apns_uid_badge:u6")
            .await
            .unwrap(),
        Some("1".to_string())
    );
}

#[tokio::test]
async fn round_drops_rows_older_than_expiry_window() {
    let dao = Arc::new(MemoryDao::new());
    let shards = MemoryShards::new(1);
    seed_group_with_offline_user(&dao, 300, "u7");

    shards.set(0, KEY_GROUP_ACTIVE, "1").await.unwrap();
    shards.zadd(0, KEY_GROUP_MSG_LIST, "300_9_0", now_secs() - 3600);

    let fixture = offline_fixture(dao, shards.clone(), &[PushType::Apns], 10_000).await;
    run_round_to_completion(&fixture.service).await;

    assert!(fixture.vendor.sent.lock().is_empty());
    assert!(fixture.poster.group_posts.lock().is_empty());
    assert_eq!(shards.zcard(0, KEY_GROUP_MSG_LIST), 0);
}

#[tokio::test]
async fn round_skips_recipients_whose_cursor_already_passed() {
    let dao = Arc::new(MemoryDao::new());
    let shards = MemoryShards::new(1);
    seed_group_with_offline_user(&dao, 400, "u8");

    let mut cursor = GroupUserCursor {
        last_mid: 600,
        apns_id: "u8-apns".to_string(),
        os_version: "14.2".to_string(),
        target_address: "u8:1".to_string(),
        ..Default::default()
    };
    cursor.os_type = 1;
    shards.hset(0, &group_user_info_key(400), "u8", &cursor.to_json());

    shards.set(0, KEY_GROUP_ACTIVE, "1").await.unwrap();
    shards.zadd(0, KEY_GROUP_MSG_LIST, "400_500_0", now_secs() - 60);

    let fixture = offline_fixture(dao, shards.clone(), &[PushType::Apns], 10_000).await;
    run_round_to_completion(&fixture.service).await;

    // Already delivered or in flight: nothing sent, cursor untouched.
    assert!(fixture.vendor.sent.lock().is_empty());
    let raw = shards.hget(0, &group_user_info_key(400), "u8").unwrap();
    assert_eq!(GroupUserCursor::from_json(&raw).unwrap().last_mid, 600);
    assert_eq!(shards.zcard(0, KEY_GROUP_MSG_LIST), 0);
}

#[tokio::test]
async fn lease_loss_stops_new_tasks_until_regained() {
    let dao = Arc::new(MemoryDao::new());
    let shards = MemoryShards::new(1);
    seed_group_with_offline_user(&dao, 500, "u9");

    shards.set(0, KEY_GROUP_ACTIVE, "1").await.unwrap();
    shards.zadd(0, KEY_GROUP_MSG_LIST, "500_10_0", now_secs() - 60);

    let fixture = offline_fixture(dao, shards.clone(), &[PushType::Apns], 300).await;

    // Another process steals the lease; the renewal fails and this
    // process demotes itself.
    shards.set(0, "offline_redis_test", "someone-else").await.unwrap();
    wait_for(|| !fixture.lease.is_master(), 2000).await;

    run_round_to_completion(&fixture.service).await;
    assert!(fixture.vendor.sent.lock().is_empty());

    // The lease frees up, the agent re-acquires and the next round runs
    // normally.
    shards.del(0, "offline_redis_test").await.unwrap();
    let lease = fixture.lease.clone();
    wait_for(move || lease.is_master(), 4000).await;

    shards.zadd(0, KEY_GROUP_MSG_LIST, "500_11_0", now_secs() - 60);
    run_round_to_completion(&fixture.service).await;

    let sent = fixture.vendor.sent.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].target_address, "u9:1");
}

#[tokio::test]
async fn registry_round_trips_advertisements() {
    let shards = MemoryShards::new(1);
    let registry = OfflineServerRegistry::new(shards.clone());

    assert!(registry.random_server(PushType::Fcm).await.is_none());

    shards
        .set_px(0, "offline_svr:fcm:10.0.0.9:8200", "1", 60_000)
        .await
        .unwrap();
    assert_eq!(
        registry.random_server(PushType::Fcm).await,
        Some("10.0.0.9:8200".to_string())
    );
    assert!(registry.random_server(PushType::Umeng).await.is_none());
}

#[tokio::test]
async fn second_agent_takes_over_after_release() {
    let shards = MemoryShards::new(1);
    let first = MasterLeaseAgent::new(shards.clone(), "lease_a".to_string(), 400, None);
    first.start();
    let lease = first.clone();
    wait_for(move || lease.is_master(), 2000).await;

    let second = MasterLeaseAgent::new(shards.clone(), "lease_a".to_string(), 400, None);
    second.start();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!second.is_master());

    first.stop().await;
    let lease = second.clone();
    wait_for(move || lease.is_master(), 4000).await;
    assert!(second.is_master());
    assert!(!first.is_master());
}

#[tokio::test]
async fn multicast_rows_only_reach_the_supplied_recipients() {
    let dao = Arc::new(MemoryDao::new());
    let shards = MemoryShards::new(1);
    seed_group_with_offline_user(&dao, 600, "a1");
    seed_group_with_offline_user(&dao, 600, "a2");
    seed_group_with_offline_user(&dao, 600, "a3");

    shards.set(0, KEY_GROUP_ACTIVE, "1").await.unwrap();
    shards.zadd(0, KEY_GROUP_MSG_LIST, "600_20_1", now_secs() - 60);
    shards.hset(
        0,
        "group_multi_msg_list",
        "600_20_1",
        &serde_json::json!({"from_uid": "a1", "members": ["a1", "a2"]}).to_string(),
    );

    let fixture = offline_fixture(dao, shards.clone(), &[PushType::Apns], 10_000).await;
    run_round_to_completion(&fixture.service).await;

    // The sender is excluded, the absent member untouched.
    let sent = fixture.vendor.sent.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].target_address, "a2:1");

    // The companion hash entry was consumed.
    assert!(shards.hget(0, "group_multi_msg_list", "600_20_1").is_none());
}
