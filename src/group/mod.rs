//! Online group fan-out: the per-process membership index, the
//! `"group_<gid>"` subscription multiplexer and the notification handler
//! that turns bus JSON into client-bound payloads.

pub mod events;
pub mod executor;
pub mod handler;
pub mod im_server;
pub mod membership;
pub mod subscriber;

pub use executor::KeyedExecutor;
pub use handler::OnlineMessageHandler;
pub use im_server::ImServerManager;
pub use membership::OnlineMemberManager;
pub use subscriber::{GroupMessageHandler, GroupMessageSubscriber};

/// Membership change callbacks fed by the group-event subscription.
pub trait GroupEventListener: Send + Sync {
    fn on_user_enter_group(&self, uid: &str, gid: u64);
    fn on_user_leave_group(&self, uid: &str, gid: u64);
    fn on_user_mute_group(&self, uid: &str, gid: u64);
    fn on_user_unmute_group(&self, uid: &str, gid: u64);
}
