use std::sync::Arc;

use dao::memory::MemoryDao;
use dao::GroupRole;
use online_redis::{PubSubService, ShardedStore};
use proto::from_wire;
use proto::group::{GroupMessageOut, GroupMsgType};

use crate::config::{EncryptSenderConfig, NoiseConfig};
use crate::dispatch::DispatchAddress;
use crate::group::events::GroupUserEventSubscription;
use crate::group::{
    GroupMessageSubscriber, KeyedExecutor, OnlineMemberManager, OnlineMessageHandler,
};
use crate::session::mock::MockSession;
use crate::store_format::{group_user_info_key, GroupUserCursor};
use crate::tests::util::{
    settle, test_account, test_process, BusNetwork, MemoryShards, TestProcess,
};

struct GroupFixture {
    proc: TestProcess,
    members: Arc<OnlineMemberManager>,
}

fn group_fixture(dao: Arc<MemoryDao>, shards: Arc<MemoryShards>, noise: NoiseConfig) -> GroupFixture {
    let network = BusNetwork::new();
    let proc = test_process(&network, dao, shards, EncryptSenderConfig::default());

    let executor = Arc::new(KeyedExecutor::new(2));
    let members = OnlineMemberManager::new(proc.dao.clone(), executor.clone());
    let subscriber = GroupMessageSubscriber::new(proc.bus.clone());
    members.set_subscriber(subscriber.clone());
    proc.manager.register_user_status_listener(members.clone());

    let handler = OnlineMessageHandler::new(
        proc.manager.clone(),
        members.clone(),
        noise,
        proc.shards.clone(),
        executor.clone(),
    );
    subscriber.add_handler(handler);
    subscriber.start();

    let events = GroupUserEventSubscription::new(proc.bus.clone());
    events.add_listener(members.clone());
    events.start();

    GroupFixture { proc, members }
}

fn chat_json(gid: u64, mid: u64, from_uid: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "type": 1,
        "gid": gid,
        "mid": mid,
        "from_uid": from_uid,
        "text": "opaque ciphertext",
        "status": 1,
        "create_time": 1_700_000,
        "at_all": 0,
        "at_list": ""
    }))
    .unwrap()
}

fn decode_out(body: &[u8]) -> GroupMessageOut {
    from_wire(body).expect("group message payload")
}

#[tokio::test]
async fn chat_fan_out_with_noise_and_cursor_update() {
    let dao = Arc::new(MemoryDao::new());
    let shards = MemoryShards::new(2);
    for uid in ["u1", "u2", "u3", "u4"] {
        dao.put_account(test_account(uid));
    }
    for uid in ["u1", "u2", "u3"] {
        dao.put_group_user(100, uid, GroupRole::Member, false);
    }

    let noise = NoiseConfig {
        enabled: true,
        percentage: 0.5,
        ios_supported_version: 1200,
        android_supported_version: 1100,
    };
    let fixture = group_fixture(dao.clone(), shards.clone(), noise);

    let mut sessions = Vec::new();
    for uid in ["u1", "u2", "u3", "u4"] {
        let session = MockSession::new(test_account(uid));
        fixture
            .proc
            .manager
            .subscribe(DispatchAddress::new(uid, 1), session.clone())
            .await;
        sessions.push((uid, session));
    }
    settle().await;

    // Three online members crossed the group from empty to non-empty.
    assert!(fixture.proc.bus.is_subscribed("group_100", "group_100"));

    fixture
        .proc
        .bus
        .publish("group_100", "group_100", chat_json(100, 42, "u1"))
        .await
        .unwrap();
    settle().await;

    for (uid, session) in &sessions[..3] {
        let puts = session.requests_for("/api/v1/group_message");
        assert_eq!(puts.len(), 1, "member {} should get one payload", uid);
        assert_eq!(decode_out(&puts[0].body).msg_type, GroupMsgType::Chat);
    }

    // The non-member decoy got the same shape wrapped as noise.
    let noise_puts = sessions[3].1.requests_for("/api/v1/group_message");
    assert_eq!(noise_puts.len(), 1);
    assert_eq!(decode_out(&noise_puts[0].body).msg_type, GroupMsgType::Noise);

    // Master-device cursors advanced to the fanned-out mid.
    let shard = shards.shard_for_key("100");
    for uid in ["u1", "u2", "u3"] {
        let raw = shards
            .hget(shard, &group_user_info_key(100), uid)
            .unwrap_or_else(|| panic!("missing cursor for {}", uid));
        assert_eq!(GroupUserCursor::from_json(&raw).unwrap().last_mid, 42);
    }
    assert!(shards.hget(shard, &group_user_info_key(100), "u4").is_none());
}

#[tokio::test]
async fn member_update_reaches_mentioned_users_outside_member_set() {
    let dao = Arc::new(MemoryDao::new());
    let shards = MemoryShards::new(1);
    dao.put_account(test_account("u1"));
    dao.put_account(test_account("u9"));
    dao.put_group_user(7, "u1", GroupRole::Member, false);

    let fixture = group_fixture(dao.clone(), shards, NoiseConfig::default());

    let member_session = MockSession::new(test_account("u1"));
    fixture
        .proc
        .manager
        .subscribe(DispatchAddress::new("u1", 1), member_session.clone())
        .await;
    // u9 was just added to the group; the membership index has not caught
    // up, but the session is online.
    let added_session = MockSession::new(test_account("u9"));
    fixture
        .proc
        .manager
        .subscribe(DispatchAddress::new("u9", 1), added_session.clone())
        .await;
    settle().await;

    let text = serde_json::json!({
        "action": 1,
        "members": [{"uid": "u9", "nick": "nine", "role": 3}]
    })
    .to_string();
    let payload = serde_json::to_vec(&serde_json::json!({
        "type": 4,
        "gid": 7,
        "mid": 9,
        "from_uid": "u1",
        "text": text,
    }))
    .unwrap();
    fixture
        .proc
        .bus
        .publish("group_7", "group_7", payload)
        .await
        .unwrap();
    settle().await;

    for session in [&member_session, &added_session] {
        let puts = session.requests_for("/api/v1/group_message");
        assert_eq!(puts.len(), 1);
        assert_eq!(
            decode_out(&puts[0].body).msg_type,
            GroupMsgType::MemberUpdate
        );
    }
}

#[tokio::test]
async fn membership_subscribes_and_unsubscribes_on_empty_crossings() {
    let dao = Arc::new(MemoryDao::new());
    let shards = MemoryShards::new(1);
    dao.put_account(test_account("u1"));
    dao.put_account(test_account("u2"));
    dao.put_group_user(55, "u1", GroupRole::Member, false);
    dao.put_group_user(55, "u2", GroupRole::Member, false);
    // Subscriber roles never join the fan-out set.
    dao.put_account(test_account("u3"));
    dao.put_group_user(55, "u3", GroupRole::Subscriber, false);

    let fixture = group_fixture(dao.clone(), shards, NoiseConfig::default());

    let address_1 = DispatchAddress::new("u1", 1);
    let address_2 = DispatchAddress::new("u2", 1);
    fixture
        .proc
        .manager
        .subscribe(address_1.clone(), MockSession::new(test_account("u1")))
        .await;
    fixture
        .proc
        .manager
        .subscribe(address_2.clone(), MockSession::new(test_account("u2")))
        .await;
    settle().await;

    assert!(fixture.proc.bus.is_subscribed("group_55", "group_55"));
    assert_eq!(fixture.members.get_group_members(55).len(), 2);

    fixture.proc.manager.kick(&address_1);
    settle().await;
    assert!(fixture.proc.bus.is_subscribed("group_55", "group_55"));

    fixture.proc.manager.kick(&address_2);
    settle().await;
    assert!(!fixture.proc.bus.is_subscribed("group_55", "group_55"));
    assert!(fixture.members.get_group_members(55).is_empty());
}

#[tokio::test]
async fn group_events_update_membership_index() {
    let dao = Arc::new(MemoryDao::new());
    let shards = MemoryShards::new(1);
    dao.put_account(test_account("u1"));
    dao.put_group_user(70, "u1", GroupRole::Member, false);

    let fixture = group_fixture(dao.clone(), shards, NoiseConfig::default());
    fixture
        .proc
        .manager
        .subscribe(DispatchAddress::new("u1", 1), MockSession::new(test_account("u1")))
        .await;
    settle().await;
    assert_eq!(fixture.members.get_group_members(70).len(), 1);

    // The user leaves the group: the DAO row disappears and the event
    // arrives on the bus.
    dao.remove_group_user(70, "u1");
    let event = serde_json::to_vec(&serde_json::json!({
        "type": 2,
        "uid": "u1",
        "gid": 70
    }))
    .unwrap();
    fixture
        .proc
        .bus
        .publish("groupEvent_70", "groupEvent_70", event)
        .await
        .unwrap();
    settle().await;

    assert!(fixture.members.get_group_members(70).is_empty());
    assert!(!fixture.proc.bus.is_subscribed("group_70", "group_70"));

    // And joins back.
    dao.put_group_user(70, "u1", GroupRole::Member, false);
    let event = serde_json::to_vec(&serde_json::json!({
        "type": 1,
        "uid": "u1",
        "gid": 70
    }))
    .unwrap();
    fixture
        .proc
        .bus
        .publish("groupEvent_70", "groupEvent_70", event)
        .await
        .unwrap();
    settle().await;

    assert_eq!(fixture.members.get_group_members(70).len(), 1);
    assert!(fixture.proc.bus.is_subscribed("group_70", "group_70"));
}

#[tokio::test]
async fn noise_sweep_excludes_group_members_and_respects_version_gate() {
    let dao = Arc::new(MemoryDao::new());
    let shards = MemoryShards::new(1);
    dao.put_account(test_account("member"));
    dao.put_group_user(3, "member", GroupRole::Member, false);
    dao.put_account(test_account("decoy"));
    let mut old_client = test_account("oldclient");
    old_client.devices[0].client_version.build_code = 100;
    dao.put_account(old_client.clone());

    let fixture = group_fixture(
        dao.clone(),
        shards,
        NoiseConfig {
            enabled: true,
            percentage: 1.0,
            ios_supported_version: 1200,
            android_supported_version: 1100,
        },
    );

    for (uid, account) in [
        ("member", test_account("member")),
        ("decoy", test_account("decoy")),
        ("oldclient", old_client),
    ] {
        fixture
            .proc
            .manager
            .subscribe(DispatchAddress::new(uid, 1), MockSession::new(account))
            .await;
    }
    settle().await;

    let (targets, cursor) = fixture.members.get_online_users_for_noise(
        "",
        3,
        1200,
        1100,
        5,
        &fixture.proc.manager,
    );
    assert_eq!(targets.len(), 1);
    assert!(targets.contains(&DispatchAddress::new("decoy", 1)));
    assert_eq!(cursor, "decoy");
}
