use std::sync::Arc;

use online_redis::{PubSubService, SubscriptionHandler};
use parking_lot::RwLock;
use proto::group::{
    GroupUserEvent, GROUP_EVENT_USER_ENTER, GROUP_EVENT_USER_MUTE, GROUP_EVENT_USER_QUIT,
    GROUP_EVENT_USER_UNMUTE,
};
use tracing::{debug, error, info};

use crate::group::GroupEventListener;

/// Subscribes the group-membership change channels
/// (`"groupEvent_<gid>"` patterns and `"user_*"` events) and forwards
/// each decoded event to the registered listeners.
pub struct GroupUserEventSubscription {
    group_bus: Arc<dyn PubSubService>,
    listeners: RwLock<Vec<Arc<dyn GroupEventListener>>>,
}

const GROUP_EVENT_PATTERN: &str = "groupEvent_*";
const USER_EVENT_PATTERN: &str = "user_*";

impl GroupUserEventSubscription {
    pub fn new(group_bus: Arc<dyn PubSubService>) -> Arc<Self> {
        Arc::new(GroupUserEventSubscription {
            group_bus,
            listeners: RwLock::new(Vec::new()),
        })
    }

    pub fn start(self: &Arc<Self>) {
        self.group_bus.psubscribe(
            GROUP_EVENT_PATTERN,
            GROUP_EVENT_PATTERN,
            self.clone() as Arc<dyn SubscriptionHandler>,
        );
        self.group_bus.psubscribe(
            USER_EVENT_PATTERN,
            USER_EVENT_PATTERN,
            self.clone() as Arc<dyn SubscriptionHandler>,
        );
    }

    pub fn add_listener(&self, listener: Arc<dyn GroupEventListener>) {
        self.listeners.write().push(listener);
    }

    fn handle_event(&self, event: &GroupUserEvent) {
        for listener in self.listeners.read().iter() {
            match event.event_type {
                GROUP_EVENT_USER_ENTER => listener.on_user_enter_group(&event.uid, event.gid),
                GROUP_EVENT_USER_QUIT => listener.on_user_leave_group(&event.uid, event.gid),
                GROUP_EVENT_USER_MUTE => listener.on_user_mute_group(&event.uid, event.gid),
                GROUP_EVENT_USER_UNMUTE => listener.on_user_unmute_group(&event.uid, event.gid),
                other => {
                    info!(
                        "group event type not processed, gid: {}, type: {}, uid: {}",
                        event.gid, other, event.uid
                    );
                }
            }
        }
    }
}

impl SubscriptionHandler for GroupUserEventSubscription {
    fn on_subscribe(&self, channel: &str) {
        debug!("subscribed group event channel {}", channel);
    }

    fn on_unsubscribe(&self, channel: &str) {
        debug!("unsubscribed group event channel {}", channel);
    }

    fn on_message(&self, channel: &str, payload: &[u8]) {
        match serde_json::from_slice::<GroupUserEvent>(payload) {
            Ok(event) => self.handle_event(&event),
            Err(err) => {
                error!(
                    "json format error, channel: {}, when handle group event: {}",
                    channel, err
                );
            }
        }
    }

    fn on_error(&self, code: i32) {
        error!("group event subscription redis error: {}", code);
    }
}
