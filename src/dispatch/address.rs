use std::fmt::Display;

use dao::MASTER_DEVICE_ID;

/// The pair `(uid, deviceId)` identifying one logged-in device. The
/// canonical serialization `"uid:deviceId"` names the per-address Redis
/// channel; the `"on:"`-prefixed form names the online-notify channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DispatchAddress {
    uid: String,
    device_id: u32,
}

impl DispatchAddress {
    pub fn new(uid: impl Into<String>, device_id: u32) -> Self {
        DispatchAddress {
            uid: uid.into(),
            device_id,
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn is_master(&self) -> bool {
        self.device_id == MASTER_DEVICE_ID
    }

    pub fn serialized(&self) -> String {
        format!("{}:{}", self.uid, self.device_id)
    }

    pub fn serialized_for_online_notify(&self) -> String {
        format!("on:{}:{}", self.uid, self.device_id)
    }

    /// Parses the canonical form. Channel names that are not dispatch
    /// addresses (group channels, patterns) simply yield `None`.
    pub fn deserialize(serialized: &str) -> Option<Self> {
        let (uid, device) = serialized.rsplit_once(':')?;
        if uid.is_empty() || uid.starts_with("on:") {
            return None;
        }
        Some(DispatchAddress {
            uid: uid.to_string(),
            device_id: device.parse().ok()?,
        })
    }
}

impl Display for DispatchAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.uid, self.device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let address = DispatchAddress::new("u1", 1);
        assert_eq!(address.serialized(), "u1:1");
        assert_eq!(
            DispatchAddress::deserialize("u1:1").unwrap(),
            address
        );
        assert!(address.is_master());
        assert!(!DispatchAddress::new("u1", 2).is_master());
    }

    #[test]
    fn online_notify_form() {
        assert_eq!(
            DispatchAddress::new("u1", 2).serialized_for_online_notify(),
            "on:u1:2"
        );
    }

    #[test]
    fn rejects_non_addresses() {
        assert!(DispatchAddress::deserialize("").is_none());
        assert!(DispatchAddress::deserialize("group_42").is_none());
        assert!(DispatchAddress::deserialize("u1:notanumber").is_none());
        assert!(DispatchAddress::deserialize(":1").is_none());
    }
}
