//! Redis plumbing for the dispatch core: the partitioned, replicated
//! pub/sub bus used for online delivery and the sharded storage pool used
//! for offline queues, cursors and counters.

pub mod db_pool;
pub mod hash;
pub mod manager;
pub mod partition;

pub use db_pool::{RedisDbPool, ShardedStore};
pub use manager::{OnlineRedisManager, PubSubService};
pub use partition::SubscriptionHandler;

use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// One Redis node inside a partition; the first node of a partition is
/// the publish primary, the rest are ordered replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisNode {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub password: String,
}

impl RedisNode {
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/", self.host, self.port)
        } else {
            format!("redis://:{}@{}:{}/", self.password, self.host, self.port)
        }
    }
}

#[derive(Debug, Clone)]
pub enum OnlineRedisError {
    NoPartition(String),
    NoAvailableNode(String),
    Redis(String),
}

impl Display for OnlineRedisError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OnlineRedisError::NoPartition(key) => {
                write!(f, "no partition for hash key '{}'", key)
            }
            OnlineRedisError::NoAvailableNode(partition) => {
                write!(f, "partition '{}' has no available node", partition)
            }
            OnlineRedisError::Redis(err) => write!(f, "redis error: {}", err),
        }
    }
}

impl From<redis::RedisError> for OnlineRedisError {
    fn from(err: redis::RedisError) -> Self {
        OnlineRedisError::Redis(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OnlineRedisError>;

/// Sink for the `mark(service, topic, duration, code)` style metrics the
/// bus emits; the server installs its in-process recorder here.
pub trait MetricsSink: Send + Sync {
    fn mark(&self, service: &str, topic: &str, duration_us: i64, code: i32);
}

pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn mark(&self, _service: &str, _topic: &str, _duration_us: i64, _code: i32) {}
}

pub const METRICS_SERVICE: &str = "OnlineRedisService";
pub const METRICS_TOPIC: &str = "onlineRedis";
/// Availability code recorded when a partition has no usable node.
pub const CODE_NO_AVAILABLE_NODE: i32 = 10001;

pub const KEEP_ALIVE_CHANNEL: &str = "onlineRedis:keepAlive";
pub const KEEP_ALIVE_INTERVAL_SECS: u64 = 30;
pub const RECONNECT_DELAY_MS: u64 = 500;
