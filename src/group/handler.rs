use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use online_redis::ShardedStore;
use parking_lot::Mutex;
use proto::group::{
    GroupChatBody, GroupInfoUpdateBody, GroupMemberUpdateBody, GroupMessageOut, GroupMsgType,
    GroupNotification, GroupRecallBody, GroupSwitchKeysBody, GroupUpdateKeysRequestBody,
    InfoUpdateText, MemberUpdateText, RecallText, SwitchKeysText, UpdateKeysRequestText,
};
use proto::to_wire;
use tracing::{debug, error};

use crate::config::NoiseConfig;
use crate::dispatch::{DispatchAddress, DispatchManager};
use crate::group::executor::KeyedExecutor;
use crate::group::membership::OnlineMemberManager;
use crate::group::subscriber::{GroupMessageHandler, GroupMessageSubscriber};
use crate::store_format::{group_user_info_key, GroupUserCursor};

/// Turns `"group_<gid>"` notifications into client-bound payloads,
/// computes the recipient set from the membership index, synthesizes the
/// noise batch, advances the per-user cursors and hands everything to the
/// dispatch manager.
pub struct OnlineMessageHandler {
    dispatch_manager: Arc<DispatchManager>,
    members: Arc<OnlineMemberManager>,
    noise: NoiseConfig,
    db_pool: Arc<dyn ShardedStore>,
    executor: Arc<KeyedExecutor>,
    // One fan-out runs per gid at a time, so a plain cursor suffices.
    last_noise_uid: Mutex<String>,
    weak_self: Weak<Self>,
}

impl OnlineMessageHandler {
    pub fn new(
        dispatch_manager: Arc<DispatchManager>,
        members: Arc<OnlineMemberManager>,
        noise: NoiseConfig,
        db_pool: Arc<dyn ShardedStore>,
        executor: Arc<KeyedExecutor>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| OnlineMessageHandler {
            dispatch_manager,
            members,
            noise,
            db_pool,
            executor,
            last_noise_uid: Mutex::new(String::new()),
            weak_self: weak_self.clone(),
        })
    }

    pub async fn process(&self, channel: &str, notification: GroupNotification) {
        let gid = notification.gid;
        let mid = notification.mid;

        let mut batches: Vec<(Vec<DispatchAddress>, Arc<Vec<u8>>)> = Vec::new();

        let Some((payload, targets)) = self.build_group_message(channel, &notification) else {
            return;
        };

        if !targets.is_empty() {
            // Offline push only covers master devices, so only their
            // cursors advance here.
            let cursor = GroupUserCursor {
                last_mid: mid,
                ..Default::default()
            };
            let value = cursor.to_json();
            let fields: Vec<(String, String)> = targets
                .iter()
                .filter(|address| address.is_master())
                .map(|address| (address.uid().to_string(), value.clone()))
                .collect();
            if !fields.is_empty() {
                let key = group_user_info_key(gid);
                let shard = self.db_pool.shard_for_key(&gid.to_string());
                if let Err(err) = self.db_pool.hmset(shard, &key, &fields).await {
                    error!(
                        "failed to hmset users' mid to redis db, gid {} mid {}: {}",
                        gid, mid, err
                    );
                }
            }
            batches.push((targets.iter().cloned().collect(), Arc::new(payload)));
        }

        if self.noise.enabled && self.noise.percentage > 0.0 {
            match self.generate_noise(&notification, &targets) {
                Some((noise_payload, noise_targets)) if !noise_targets.is_empty() => {
                    batches.push((
                        noise_targets.into_iter().collect(),
                        Arc::new(noise_payload),
                    ));
                }
                _ => {}
            }
        }

        self.dispatch_manager.send_group_message(batches);
    }

    /// Builds the outbound payload and the real recipient set.
    fn build_group_message(
        &self,
        channel: &str,
        notification: &GroupNotification,
    ) -> Option<(Vec<u8>, BTreeSet<DispatchAddress>)> {
        let payload = build_payload(notification, false)?;
        let mut targets: BTreeSet<DispatchAddress> = self
            .members
            .get_group_members(notification.gid)
            .into_iter()
            .collect();

        // Mentioned users may have been added a moment ago and not be in
        // the in-memory member set yet; their live sessions still count.
        if GroupMsgType::from_code(notification.msg_type) == Some(GroupMsgType::MemberUpdate) {
            match serde_json::from_str::<MemberUpdateText>(&notification.text) {
                Ok(text) => {
                    for member in &text.members {
                        for address in self.members.get_online_sessions(&member.uid) {
                            targets.insert(address);
                        }
                    }
                }
                Err(err) => {
                    error!(
                        "handle message json false, from channel: {}, error: {}",
                        channel, err
                    );
                }
            }
        }

        Some((payload, targets))
    }

    fn generate_noise(
        &self,
        notification: &GroupNotification,
        online_targets: &BTreeSet<DispatchAddress>,
    ) -> Option<(Vec<u8>, BTreeSet<DispatchAddress>)> {
        let payload = build_noise_payload(notification)?;

        let receivers =
            (self.noise.percentage * online_targets.len() as f64).ceil() as usize;
        let receivers = if receivers == 0 && !online_targets.is_empty() {
            1
        } else {
            receivers
        };
        if receivers == 0 {
            return None;
        }

        let start = self.last_noise_uid.lock().clone();
        let (targets, cursor) = self.members.get_online_users_for_noise(
            &start,
            notification.gid,
            self.noise.ios_supported_version,
            self.noise.android_supported_version,
            receivers,
            &self.dispatch_manager,
        );
        if !targets.is_empty() {
            *self.last_noise_uid.lock() = cursor;
        }
        Some((payload, targets))
    }
}

impl GroupMessageHandler for OnlineMessageHandler {
    fn handle_message(&self, channel: &str, notification: GroupNotification) {
        if !GroupMessageSubscriber::is_group_message_channel(channel) {
            return;
        }
        let Some(handler) = self.weak_self.upgrade() else {
            return;
        };
        let channel = channel.to_string();
        self.executor.post_by_gid(notification.gid, async move {
            handler.process(&channel, notification).await;
        });
    }
}

fn build_out(msg_type: GroupMsgType, body: Vec<u8>, noise: bool) -> Option<Vec<u8>> {
    to_wire(&GroupMessageOut {
        msg_type: if noise { GroupMsgType::Noise } else { msg_type },
        body,
    })
}

fn build_chat_body(notification: &GroupNotification) -> Option<Vec<u8>> {
    let at_list: Vec<String> = if notification.at_list.is_empty() {
        Vec::new()
    } else {
        serde_json::from_str(&notification.at_list).ok()?
    };
    to_wire(&GroupChatBody {
        gid: notification.gid,
        mid: notification.mid,
        from_uid: notification.display_uid().to_string(),
        text: notification.text.clone(),
        status: notification.status,
        create_time: notification.create_time,
        at_all: notification.at_all == 1,
        at_list,
        source_extra: notification.source_extra.clone().unwrap_or_default(),
    })
}

fn build_payload(notification: &GroupNotification, noise: bool) -> Option<Vec<u8>> {
    let msg_type = match GroupMsgType::from_code(notification.msg_type) {
        Some(msg_type) => msg_type,
        None => {
            error!("received unknown message type {}", notification.msg_type);
            return None;
        }
    };

    match msg_type {
        GroupMsgType::Chat | GroupMsgType::Channel => {
            build_out(msg_type, build_chat_body(notification)?, noise)
        }
        GroupMsgType::InfoUpdate => {
            if notification.text.is_empty() {
                error!("text is empty");
                return None;
            }
            let text: InfoUpdateText = serde_json::from_str(&notification.text).ok()?;
            let body = to_wire(&GroupInfoUpdateBody {
                gid: notification.gid,
                mid: notification.mid,
                from_uid: notification.from_uid.clone(),
                last_mid: text.last_mid,
                intro: text.intro,
                broadcast: text.broadcast,
                create_time: text.create_time,
                update_time: text.update_time,
                channel: text.channel,
                encrypted_name: text.encrypted_name,
                encrypted_icon: text.encrypted_icon,
            })?;
            build_out(msg_type, body, noise)
        }
        GroupMsgType::MemberUpdate => {
            if notification.text.is_empty() {
                error!("text is empty");
                return None;
            }
            let text: MemberUpdateText = serde_json::from_str(&notification.text).ok()?;
            let body = to_wire(&GroupMemberUpdateBody {
                gid: notification.gid,
                mid: notification.mid,
                from_uid: notification.from_uid.clone(),
                action: text.action,
                members: text.members,
            })?;
            build_out(msg_type, body, noise)
        }
        GroupMsgType::Recall => {
            if notification.text.is_empty() {
                error!("text is empty");
                return None;
            }
            let text: RecallText = serde_json::from_str(&notification.text).ok()?;
            let body = to_wire(&GroupRecallBody {
                gid: notification.gid,
                mid: notification.mid,
                from_uid: notification.display_uid().to_string(),
                recalled_mid: text.recalled_mid,
                source_extra: notification.source_extra.clone().unwrap_or_default(),
            })?;
            build_out(msg_type, body, noise)
        }
        GroupMsgType::SwitchGroupKeys => {
            if notification.text.is_empty() {
                error!("text is empty");
                return None;
            }
            let text: SwitchKeysText = serde_json::from_str(&notification.text).ok()?;
            let body = to_wire(&GroupSwitchKeysBody {
                gid: notification.gid,
                mid: notification.mid,
                from_uid: notification.from_uid.clone(),
                version: text.version,
            })?;
            build_out(msg_type, body, noise)
        }
        GroupMsgType::UpdateGroupKeysRequest => {
            if notification.text.is_empty() {
                error!("text is empty");
                return None;
            }
            let text: UpdateKeysRequestText = serde_json::from_str(&notification.text).ok()?;
            let body = to_wire(&GroupUpdateKeysRequestBody {
                gid: notification.gid,
                mid: notification.mid,
                from_uid: notification.from_uid.clone(),
                keys_mode: text.group_keys_mode,
            })?;
            build_out(msg_type, body, noise)
        }
        GroupMsgType::Noise => None,
    }
}

/// Key-change messages are never replicated as noise.
fn build_noise_payload(notification: &GroupNotification) -> Option<Vec<u8>> {
    match GroupMsgType::from_code(notification.msg_type)? {
        GroupMsgType::Chat
        | GroupMsgType::Channel
        | GroupMsgType::InfoUpdate
        | GroupMsgType::MemberUpdate
        | GroupMsgType::Recall => build_payload(notification, true),
        _ => {
            debug!(
                "noise not generated for message type {}",
                notification.msg_type
            );
            None
        }
    }
}
