//! The per-process routing fabric: the manager owning the
//! `address → channel` map and the per-session channel state machines.

pub mod address;
pub mod channel;
pub mod crypto;
pub mod manager;

pub use address::DispatchAddress;
pub use channel::DispatchChannel;
pub use manager::DispatchManager;

/// Events drained by the dispatch manager's single-threaded loop. They
/// originate from the partitioner callbacks and the group fan-out and are
/// routed to the target channel by address lookup.
#[derive(Debug)]
pub enum Event {
    RedisConnected,
    RedisDisconnected,
    RedisSubscribed {
        address: DispatchAddress,
    },
    RedisUnsubscribed {
        address: DispatchAddress,
    },
    RedisMessage {
        address: DispatchAddress,
        payload: Vec<u8>,
    },
    GroupMessage {
        address: DispatchAddress,
        payload: std::sync::Arc<Vec<u8>>,
    },
}

/// Notified on every first-subscribe and last-unsubscribe of an address;
/// drives the online group-membership index.
pub trait UserStatusListener: Send + Sync {
    fn on_user_online(&self, address: &DispatchAddress);
    fn on_user_offline(&self, address: &DispatchAddress);
}
