use std::sync::Arc;

use online_redis::{PubSubService, SubscriptionHandler};
use parking_lot::RwLock;
use proto::group::GroupNotification;
use tracing::{debug, error, trace};

/// Consumers of decoded group notifications.
pub trait GroupMessageHandler: Send + Sync {
    fn handle_message(&self, channel: &str, notification: GroupNotification);
}

/// Owns the `"group_<gid>"` subscriptions on the group bus, driven by the
/// membership index's empty-crossings, and fans decoded notifications out
/// to the registered handlers.
pub struct GroupMessageSubscriber {
    group_bus: Arc<dyn PubSubService>,
    handlers: RwLock<Vec<Arc<dyn GroupMessageHandler>>>,
}

const GROUP_EVENT_CHANNEL: &str = "group_event_msg";

impl GroupMessageSubscriber {
    pub fn new(group_bus: Arc<dyn PubSubService>) -> Arc<Self> {
        Arc::new(GroupMessageSubscriber {
            group_bus,
            handlers: RwLock::new(Vec::new()),
        })
    }

    /// Subscribes the process-wide group event channel.
    pub fn start(self: &Arc<Self>) {
        self.group_bus.subscribe(
            GROUP_EVENT_CHANNEL,
            GROUP_EVENT_CHANNEL,
            self.clone() as Arc<dyn SubscriptionHandler>,
        );
    }

    pub fn add_handler(&self, handler: Arc<dyn GroupMessageHandler>) {
        self.handlers.write().push(handler);
    }

    pub fn channel_for(gid: u64) -> String {
        format!("group_{}", gid)
    }

    pub fn is_group_message_channel(channel: &str) -> bool {
        channel.starts_with("group_") || channel.starts_with("instant_")
    }

    pub fn subscribe_gids(self: &Arc<Self>, gids: &[u64]) {
        for gid in gids {
            let channel = Self::channel_for(*gid);
            self.group_bus.subscribe(
                &channel,
                &channel,
                self.clone() as Arc<dyn SubscriptionHandler>,
            );
        }
    }

    pub fn unsubscribe_gids(&self, gids: &[u64]) {
        for gid in gids {
            let channel = Self::channel_for(*gid);
            self.group_bus.unsubscribe(&channel, &channel);
        }
    }
}

impl SubscriptionHandler for GroupMessageSubscriber {
    fn on_subscribe(&self, channel: &str) {
        trace!("subscribed to channel {}", channel);
    }

    fn on_unsubscribe(&self, channel: &str) {
        trace!("unsubscribed from channel {}", channel);
    }

    fn on_message(&self, channel: &str, payload: &[u8]) {
        if !Self::is_group_message_channel(channel) {
            return;
        }
        let notification: GroupNotification = match serde_json::from_slice(payload) {
            Ok(notification) => notification,
            Err(err) => {
                error!(
                    "bad group message json on channel {}: {}",
                    channel, err
                );
                return;
            }
        };
        debug!(
            "group notification on {}: gid {} mid {}",
            channel, notification.gid, notification.mid
        );
        for handler in self.handlers.read().iter() {
            handler.handle_message(channel, notification.clone());
        }
    }

    fn on_error(&self, code: i32) {
        error!("group subscription redis error: {}", code);
    }
}
