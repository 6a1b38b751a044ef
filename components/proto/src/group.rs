use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Outbound group message frame, forwarded to clients as the body of
/// `PUT /api/v1/group_message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMessageOut {
    pub msg_type: GroupMsgType,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupMsgType {
    Chat,
    Channel,
    InfoUpdate,
    MemberUpdate,
    Recall,
    SwitchGroupKeys,
    UpdateGroupKeysRequest,
    Noise,
}

impl GroupMsgType {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(GroupMsgType::Chat),
            2 => Some(GroupMsgType::Channel),
            3 => Some(GroupMsgType::InfoUpdate),
            4 => Some(GroupMsgType::MemberUpdate),
            5 => Some(GroupMsgType::Recall),
            6 => Some(GroupMsgType::SwitchGroupKeys),
            7 => Some(GroupMsgType::UpdateGroupKeysRequest),
            _ => None,
        }
    }
}

/// Notification as it arrives on a `"group_<gid>"` channel. The `text`
/// field nests a second JSON document whose shape depends on `msg_type`.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupNotification {
    #[serde(rename = "type")]
    pub msg_type: i32,
    pub gid: u64,
    pub mid: u64,
    pub from_uid: String,
    #[serde(default)]
    pub from_uid_extra: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub status: i32,
    #[serde(default)]
    pub create_time: u64,
    #[serde(default)]
    pub at_all: i32,
    #[serde(default)]
    pub at_list: String,
    #[serde(default)]
    pub source_extra: Option<String>,
}

impl GroupNotification {
    /// Sender uid as shown to recipients; the extra form wins when present.
    pub fn display_uid(&self) -> &str {
        self.from_uid_extra.as_deref().unwrap_or(&self.from_uid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupChatBody {
    pub gid: u64,
    pub mid: u64,
    pub from_uid: String,
    pub text: String,
    pub status: i32,
    pub create_time: u64,
    pub at_all: bool,
    pub at_list: Vec<String>,
    pub source_extra: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfoUpdateBody {
    pub gid: u64,
    pub mid: u64,
    pub from_uid: String,
    pub last_mid: u64,
    pub intro: String,
    pub broadcast: i32,
    pub create_time: u64,
    pub update_time: u64,
    pub channel: String,
    pub encrypted_name: String,
    pub encrypted_icon: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMemberEntry {
    pub uid: String,
    pub nick: String,
    pub role: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMemberUpdateBody {
    pub gid: u64,
    pub mid: u64,
    pub from_uid: String,
    pub action: i32,
    pub members: Vec<GroupMemberEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecallBody {
    pub gid: u64,
    pub mid: u64,
    pub from_uid: String,
    pub recalled_mid: u64,
    pub source_extra: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSwitchKeysBody {
    pub gid: u64,
    pub mid: u64,
    pub from_uid: String,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupUpdateKeysRequestBody {
    pub gid: u64,
    pub mid: u64,
    pub from_uid: String,
    pub keys_mode: i32,
}

// Nested documents carried in `GroupNotification::text`.

#[derive(Debug, Clone, Deserialize)]
pub struct InfoUpdateText {
    pub last_mid: u64,
    pub intro: String,
    pub broadcast: i32,
    pub create_time: u64,
    pub update_time: u64,
    pub channel: String,
    #[serde(default)]
    pub encrypted_name: String,
    #[serde(default)]
    pub encrypted_icon: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemberUpdateText {
    pub action: i32,
    pub members: Vec<GroupMemberEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecallText {
    pub recalled_mid: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwitchKeysText {
    pub version: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateKeysRequestText {
    pub group_keys_mode: i32,
}

/// Membership change event published on the `"groupEvent_<gid>"` and
/// `"user_*"` channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupUserEvent {
    #[serde(rename = "type")]
    pub event_type: i32,
    pub uid: String,
    pub gid: u64,
}

pub const GROUP_EVENT_USER_ENTER: i32 = 1;
pub const GROUP_EVENT_USER_QUIT: i32 = 2;
pub const GROUP_EVENT_USER_MUTE: i32 = 3;
pub const GROUP_EVENT_USER_UNMUTE: i32 = 4;

/// Body of the inter-server `POST /internal/pushGroupMsg` call. The
/// numeric fields travel as decimal strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushGroupMsgRequest {
    pub gid: String,
    pub mid: String,
    pub destinations: HashMap<String, String>,
}
