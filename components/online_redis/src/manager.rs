use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::error;

use crate::hash::HashRing;
use crate::partition::{RedisPartition, SubscriptionHandler};
use crate::{
    MetricsSink, OnlineRedisError, RedisNode, Result, KEEP_ALIVE_INTERVAL_SECS,
};

/// The logical pub/sub bus consumed by the dispatch core. Abstracted as a
/// trait so tests can substitute an in-process bus for the Redis-backed
/// implementation.
#[async_trait]
pub trait PubSubService: Send + Sync {
    fn subscribe(&self, hash_key: &str, channel: &str, handler: Arc<dyn SubscriptionHandler>)
        -> bool;
    fn psubscribe(
        &self,
        hash_key: &str,
        pattern: &str,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> bool;
    fn unsubscribe(&self, hash_key: &str, channel: &str) -> bool;
    fn punsubscribe(&self, hash_key: &str, pattern: &str) -> bool;
    fn is_subscribed(&self, hash_key: &str, channel: &str) -> bool;

    /// Returns the number of subscribers that received the payload.
    async fn publish(&self, hash_key: &str, channel: &str, payload: Vec<u8>) -> Result<i64>;
}

/// Routes every call to the partition selected by consistent-hashing the
/// caller-supplied key. One instance is created per topology: the online
/// presence pool and the group pool are never merged.
pub struct OnlineRedisManager {
    partitions: HashMap<String, Arc<RedisPartition>>,
    ring: HashRing,
}

impl OnlineRedisManager {
    pub fn new(
        topology: &BTreeMap<String, Vec<RedisNode>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        if topology.is_empty() {
            return Err(OnlineRedisError::NoPartition("<empty topology>".to_string()));
        }

        let mut partitions = HashMap::new();
        let mut ring = HashRing::new();
        for (name, nodes) in topology {
            if nodes.is_empty() {
                return Err(OnlineRedisError::NoPartition(name.clone()));
            }
            partitions.insert(
                name.clone(),
                RedisPartition::new(name.clone(), nodes, metrics.clone()),
            );
            ring.add_server(name);
        }

        Ok(OnlineRedisManager { partitions, ring })
    }

    /// Spawns the 30 second keep-alive over every partition.
    pub fn start(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(KEEP_ALIVE_INTERVAL_SECS));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                for partition in manager.partitions.values() {
                    partition.keep_alive();
                }
            }
        });
    }

    fn partition_for(&self, hash_key: &str) -> Option<&Arc<RedisPartition>> {
        self.ring
            .get_server(hash_key)
            .and_then(|name| self.partitions.get(name))
    }

    /// Variant used for channels that are their own routing key.
    pub fn subscribe_chan(&self, channel: &str, handler: Arc<dyn SubscriptionHandler>) -> bool {
        self.subscribe(channel, channel, handler)
    }

    pub fn unsubscribe_chan(&self, channel: &str) -> bool {
        self.unsubscribe(channel, channel)
    }
}

#[async_trait]
impl PubSubService for OnlineRedisManager {
    fn subscribe(
        &self,
        hash_key: &str,
        channel: &str,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> bool {
        match self.partition_for(hash_key) {
            Some(partition) => partition.subscribe(channel, handler),
            None => {
                error!("no partition for hash key '{}', subscribe '{}'", hash_key, channel);
                false
            }
        }
    }

    fn psubscribe(
        &self,
        hash_key: &str,
        pattern: &str,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> bool {
        match self.partition_for(hash_key) {
            Some(partition) => partition.psubscribe(pattern, handler),
            None => {
                error!("no partition for hash key '{}', psubscribe '{}'", hash_key, pattern);
                false
            }
        }
    }

    fn unsubscribe(&self, hash_key: &str, channel: &str) -> bool {
        match self.partition_for(hash_key) {
            Some(partition) => partition.unsubscribe(channel),
            None => false,
        }
    }

    fn punsubscribe(&self, hash_key: &str, pattern: &str) -> bool {
        match self.partition_for(hash_key) {
            Some(partition) => partition.punsubscribe(pattern),
            None => false,
        }
    }

    fn is_subscribed(&self, hash_key: &str, channel: &str) -> bool {
        self.partition_for(hash_key)
            .map(|partition| partition.is_subscribed(channel))
            .unwrap_or(false)
    }

    async fn publish(&self, hash_key: &str, channel: &str, payload: Vec<u8>) -> Result<i64> {
        match self.partition_for(hash_key) {
            Some(partition) => partition.publish(channel, &payload).await,
            None => {
                error!("no partition for hash key '{}', publish '{}'", hash_key, channel);
                Err(OnlineRedisError::NoPartition(hash_key.to_string()))
            }
        }
    }
}
