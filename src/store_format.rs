//! Redis key layout and row formats shared by the online fan-out path and
//! the offline push round. Cursor values are stored as JSON so that peer
//! processes written against the same keys interoperate.

use serde::{Deserialize, Serialize};

/// Sorted set of pending offline group messages; member
/// `"gid_mid_pushType"`, score = enqueue time in seconds.
pub const KEY_GROUP_MSG_LIST: &str = "group_msg_list";
/// Hash of explicit recipient sets for multicast rows.
pub const KEY_GROUP_MULTI_MSG_LIST: &str = "group_multi_msg_list";
/// Per-group hash of per-user cursors; field = uid.
pub const KEY_PREFIX_GROUP_USER_INFO: &str = "group_user_info:";
/// Shard enable marker; an absent/empty value disables the shard.
pub const KEY_GROUP_ACTIVE: &str = "group_active";
/// Per-user push badge counter, reset on (re)subscribe.
pub const KEY_PREFIX_APNS_BADGE: &str = "apns_uid_badge:";

pub fn group_user_info_key(gid: u64) -> String {
    format!("{}{}", KEY_PREFIX_GROUP_USER_INFO, gid)
}

pub fn apns_badge_key(uid: &str) -> String {
    format!("{}{}", KEY_PREFIX_APNS_BADGE, uid)
}

/// Rows older than this are dropped from the queue unprocessed.
pub const OFFLINE_MSG_EXPIRE_SECS: i64 = 30 * 60;
/// Rows younger than this are left for a later round.
pub const OFFLINE_MSG_DELAY_SECS: i64 = 30;
pub const OFFLINE_MSG_SCAN_SIZE: isize = 100;
pub const OFFLINE_USER_SCAN_SIZE: usize = 200;
pub const ACCOUNT_FETCH_BATCH: usize = 20;

/// Recipient scope of one queued group message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushPeopleType {
    Broadcast,
    Multicast,
}

impl PushPeopleType {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(PushPeopleType::Broadcast),
            1 => Some(PushPeopleType::Multicast),
            _ => None,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            PushPeopleType::Broadcast => 0,
            PushPeopleType::Multicast => 1,
        }
    }
}

/// Parsed member of `group_msg_list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMsgRow {
    pub gid: u64,
    pub mid: u64,
    pub push_type: PushPeopleType,
}

impl GroupMsgRow {
    pub fn parse(member: &str) -> Option<Self> {
        let mut parts = member.split('_');
        let gid = parts.next()?.parse().ok()?;
        let mid = parts.next()?.parse().ok()?;
        let push_type = PushPeopleType::from_code(parts.next()?.parse().ok()?)?;
        if parts.next().is_some() {
            return None;
        }
        Some(GroupMsgRow {
            gid,
            mid,
            push_type,
        })
    }

    pub fn member(&self) -> String {
        format!("{}_{}_{}", self.gid, self.mid, self.push_type.code())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CursorConfigFlag {
    #[default]
    Normal,
    NoConfig,
}

/// Per-user delivery cursor with a snapshot of the user's push tokens,
/// stored in `group_user_info:{gid}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupUserCursor {
    pub last_mid: u64,
    #[serde(default)]
    pub cfg_flag: CursorConfigFlag,
    #[serde(default)]
    pub apns_id: String,
    #[serde(default)]
    pub apns_type: String,
    #[serde(default)]
    pub voip_apns_id: String,
    #[serde(default)]
    pub fcm_id: String,
    #[serde(default)]
    pub umeng_id: String,
    #[serde(default)]
    pub os_type: i32,
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub phone_model: String,
    #[serde(default)]
    pub build_code: u64,
    #[serde(default)]
    pub target_address: String,
}

impl GroupUserCursor {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }

    pub fn has_push_token(&self) -> bool {
        !self.apns_id.is_empty() || !self.fcm_id.is_empty() || !self.umeng_id.is_empty()
    }
}

/// Value of a `group_multi_msg_list` field: sender plus the explicit
/// recipient set of one multicast message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MulticastMembers {
    pub from_uid: String,
    pub members: Vec<String>,
}

impl MulticastMembers {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_msg_row_round_trip() {
        let row = GroupMsgRow {
            gid: 100,
            mid: 500,
            push_type: PushPeopleType::Broadcast,
        };
        assert_eq!(row.member(), "100_500_0");
        assert_eq!(GroupMsgRow::parse("100_500_0").unwrap(), row);
    }

    #[test]
    fn malformed_rows_are_rejected() {
        for member in ["", "100", "100_500", "100_500_9", "a_b_c", "1_2_0_3"] {
            assert!(GroupMsgRow::parse(member).is_none(), "{}", member);
        }
    }

    #[test]
    fn cursor_json_round_trip() {
        let cursor = GroupUserCursor {
            last_mid: 42,
            apns_id: "tok".to_string(),
            os_type: 1,
            ..Default::default()
        };
        let decoded = GroupUserCursor::from_json(&cursor.to_json()).unwrap();
        assert_eq!(decoded, cursor);
        assert!(decoded.has_push_token());
    }

    #[test]
    fn cursor_tolerates_missing_fields() {
        let decoded = GroupUserCursor::from_json(r#"{"last_mid": 7}"#).unwrap();
        assert_eq!(decoded.last_mid, 7);
        assert!(!decoded.has_push_token());
    }
}
