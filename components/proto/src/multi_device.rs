use serde::{Deserialize, Serialize};

/// Multi-device coordination event forwarded to the client as
/// `PUT /api/v1/devices`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiDeviceMessage {
    pub event: MultiDeviceEvent,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MultiDeviceEvent {
    DeviceLogin,
    DeviceLogout,
    DeviceAvatarSync,
    DeviceAuth,
    DeviceKickedByOther,
    DeviceKickedByMaster,
    MasterLogout,
}

impl MultiDeviceEvent {
    /// Events after which the forwarding session is terminated.
    pub fn ends_session(&self) -> bool {
        matches!(
            self,
            MultiDeviceEvent::DeviceAuth
                | MultiDeviceEvent::DeviceKickedByOther
                | MultiDeviceEvent::DeviceKickedByMaster
                | MultiDeviceEvent::MasterLogout
        )
    }
}
