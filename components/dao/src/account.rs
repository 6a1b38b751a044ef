use serde::{Deserialize, Serialize};

use crate::MASTER_DEVICE_ID;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub uid: String,
    pub state: AccountState,
    pub auth_device_id: u32,
    pub devices: Vec<Device>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountState {
    Normal,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: u32,
    /// Base64 of at least 52 bytes: 32-byte cipher key || 20-byte mac key.
    pub signaling_key: String,
    pub registration_id: u32,
    pub apns_id: String,
    pub apns_type: String,
    pub voip_apns_id: String,
    pub fcm_id: String,
    pub umeng_id: String,
    pub client_version: ClientVersion,
    pub pushable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientVersion {
    pub os_type: OsType,
    pub os_version: String,
    pub phone_model: String,
    pub build_code: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OsType {
    #[default]
    Unknown,
    Ios,
    Android,
}

impl Account {
    pub fn device(&self, device_id: u32) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == device_id)
    }

    /// The device this session authenticated as.
    pub fn auth_device(&self) -> Option<&Device> {
        self.device(self.auth_device_id)
    }

    pub fn master_device(&self) -> Option<&Device> {
        self.device(MASTER_DEVICE_ID)
    }
}

impl Device {
    pub fn is_master(&self) -> bool {
        self.id == MASTER_DEVICE_ID
    }

    pub fn is_pushable(&self) -> bool {
        self.pushable
            && (!self.apns_id.is_empty() || !self.fcm_id.is_empty() || !self.umeng_id.is_empty())
    }
}

impl OsType {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => OsType::Ios,
            2 => OsType::Android,
            _ => OsType::Unknown,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            OsType::Unknown => 0,
            OsType::Ios => 1,
            OsType::Android => 2,
        }
    }
}
