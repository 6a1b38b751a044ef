//! Push notification model and vendor adapters. Vendor wire protocols are
//! out of scope; each adapter is an opaque `send(notification)` sink.

pub mod router;
pub mod vendors;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dao::{ClientVersion, Device};
use online_redis::ShardedStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dispatch::DispatchAddress;
use crate::store_format::apns_badge_key;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PushType {
    Apns,
    Fcm,
    Umeng,
}

impl PushType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PushType::Apns => "apns",
            PushType::Fcm => "fcm",
            PushType::Umeng => "umeng",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "apns" => Some(PushType::Apns),
            "fcm" => Some(PushType::Fcm),
            "umeng" => Some(PushType::Umeng),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationContent {
    /// P2P chat notification; `source` is the sender as shown to the
    /// recipient.
    Chat { source: String },
    /// Group notification carrying the decimal gid/mid pair.
    Group { gid: String, mid: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub content: NotificationContent,
    pub badge: u32,
    pub target_address: String,
    pub apns_id: String,
    pub apns_type: String,
    pub voip_apns_id: String,
    pub fcm_id: String,
    pub umeng_id: String,
    pub client_version: ClientVersion,
    /// Envelope push class; silent classes never reach a vendor.
    pub class: i32,
}

impl Notification {
    pub fn chat(source: String) -> Self {
        Notification {
            content: NotificationContent::Chat { source },
            badge: 0,
            target_address: String::new(),
            apns_id: String::new(),
            apns_type: String::new(),
            voip_apns_id: String::new(),
            fcm_id: String::new(),
            umeng_id: String::new(),
            client_version: ClientVersion::default(),
            class: 0,
        }
    }

    pub fn group(gid: u64, mid: u64) -> Self {
        let mut notification = Notification::chat(String::new());
        notification.content = NotificationContent::Group {
            gid: gid.to_string(),
            mid: mid.to_string(),
        };
        notification.badge = 1;
        notification
    }

    pub fn set_target_address(&mut self, address: &DispatchAddress) {
        self.target_address = address.serialized();
    }

    pub fn set_device_info(&mut self, device: &Device) {
        self.apns_id = device.apns_id.clone();
        self.apns_type = device.apns_type.clone();
        self.voip_apns_id = device.voip_apns_id.clone();
        self.fcm_id = device.fcm_id.clone();
        self.umeng_id = device.umeng_id.clone();
        self.client_version = device.client_version.clone();
    }

    /// Vendor derived from the token fields; APNS wins over FCM, FCM over
    /// Umeng.
    pub fn push_type(&self) -> Option<PushType> {
        if !self.apns_id.is_empty() {
            Some(PushType::Apns)
        } else if !self.fcm_id.is_empty() {
            Some(PushType::Fcm)
        } else if !self.umeng_id.is_empty() {
            Some(PushType::Umeng)
        } else {
            None
        }
    }

    pub fn target_uid(&self) -> Option<String> {
        DispatchAddress::deserialize(&self.target_address).map(|a| a.uid().to_string())
    }

    /// Group notification built from a per-user cursor's token snapshot,
    /// as the offline round and the peer endpoint both do.
    pub fn from_group_cursor(
        gid: u64,
        mid: u64,
        cursor: &crate::store_format::GroupUserCursor,
    ) -> Self {
        let mut notification = Notification::group(gid, mid);
        notification.apns_id = cursor.apns_id.clone();
        notification.apns_type = cursor.apns_type.clone();
        notification.voip_apns_id = cursor.voip_apns_id.clone();
        notification.fcm_id = cursor.fcm_id.clone();
        notification.umeng_id = cursor.umeng_id.clone();
        notification.client_version = ClientVersion {
            os_type: dao::OsType::from_code(cursor.os_type),
            os_version: cursor.os_version.clone(),
            phone_model: cursor.phone_model.clone(),
            build_code: cursor.build_code,
        };
        notification.target_address = cursor.target_address.clone();
        notification
    }
}

#[async_trait]
pub trait PushVendor: Send + Sync {
    async fn send(&self, notification: &Notification) -> bool;
}

/// Local vendor registry. Only the vendors named in
/// `offline.push_types` are served by this process; everything else is
/// routed to a peer through the offline-server registry.
pub struct PushService {
    vendors: HashMap<PushType, Arc<dyn PushVendor>>,
    db_pool: Arc<dyn ShardedStore>,
}

impl PushService {
    pub fn new(
        vendors: HashMap<PushType, Arc<dyn PushVendor>>,
        db_pool: Arc<dyn ShardedStore>,
    ) -> Arc<Self> {
        Arc::new(PushService { vendors, db_pool })
    }

    pub fn handles(&self, push_type: PushType) -> bool {
        self.vendors.contains_key(&push_type)
    }

    pub fn handled_types(&self) -> Vec<PushType> {
        self.vendors.keys().copied().collect()
    }

    pub async fn send(&self, push_type: PushType, notification: &Notification) {
        let Some(vendor) = self.vendors.get(&push_type) else {
            warn!("no local vendor for push type {}", push_type.as_str());
            return;
        };

        if !vendor.send(notification).await {
            warn!(
                "push to {} failed for {}",
                push_type.as_str(),
                notification.target_address
            );
            return;
        }

        debug!(
            "pushed {} notification to {}",
            push_type.as_str(),
            notification.target_address
        );

        if push_type == PushType::Apns {
            if let Some(uid) = notification.target_uid() {
                let key = apns_badge_key(&uid);
                let shard = self.db_pool.shard_for_key(&uid);
                if let Err(err) = self.db_pool.incr(shard, &key).await {
                    warn!("failed to bump badge counter for {}: {}", uid, err);
                }
            }
        }
    }
}

/// Sink the dispatch channel hands failed-delivery notifications to; the
/// router behind it decides between the local vendors and a peer server.
#[async_trait]
pub trait OfflineDispatcher: Send + Sync {
    async fn dispatch(&self, push_type: PushType, notification: Notification);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_type_precedence() {
        let mut notification = Notification::chat("u0".to_string());
        assert_eq!(notification.push_type(), None);

        notification.umeng_id = "um".to_string();
        assert_eq!(notification.push_type(), Some(PushType::Umeng));
        notification.fcm_id = "fcm".to_string();
        assert_eq!(notification.push_type(), Some(PushType::Fcm));
        notification.apns_id = "apns".to_string();
        assert_eq!(notification.push_type(), Some(PushType::Apns));
    }

    #[test]
    fn group_notification_defaults() {
        let notification = Notification::group(100, 500);
        assert_eq!(notification.badge, 1);
        assert_eq!(
            notification.content,
            NotificationContent::Group {
                gid: "100".to_string(),
                mid: "500".to_string()
            }
        );
    }
}
