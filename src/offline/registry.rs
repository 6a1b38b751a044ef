use std::sync::Arc;
use std::time::Duration;

use online_redis::ShardedStore;
use rand::seq::SliceRandom;
use tracing::warn;

use crate::push::PushType;

const KEY_PREFIX: &str = "offline_svr:";
const ADVERTISE_TTL_MS: u64 = 15 * 1000;
const ADVERTISE_REFRESH_SECS: u64 = 5;

/// Registry of offline-capable servers keyed by the push vendors they
/// handle. Each process advertises `offline_svr:<type>:<addr>` with a TTL
/// and refreshes it; lookups scan the live keys and pick a random peer.
pub struct OfflineServerRegistry {
    store: Arc<dyn ShardedStore>,
    shard: i32,
}

impl OfflineServerRegistry {
    pub fn new(store: Arc<dyn ShardedStore>) -> Arc<Self> {
        let shard = store.shard_ids().first().copied().unwrap_or(0);
        Arc::new(OfflineServerRegistry { store, shard })
    }

    fn key(push_type: PushType, addr: &str) -> String {
        format!("{}{}:{}", KEY_PREFIX, push_type.as_str(), addr)
    }

    /// Starts advertising this server for the given vendors until the
    /// process exits.
    pub fn advertise(self: &Arc<Self>, addr: String, push_types: Vec<PushType>) {
        if addr.is_empty() || push_types.is_empty() {
            return;
        }
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(ADVERTISE_REFRESH_SECS));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                for push_type in &push_types {
                    let key = Self::key(*push_type, &addr);
                    if let Err(err) = registry
                        .store
                        .set_px(registry.shard, &key, "1", ADVERTISE_TTL_MS)
                        .await
                    {
                        warn!("failed to advertise {}: {}", key, err);
                    }
                }
            }
        });
    }

    pub async fn random_server(&self, push_type: PushType) -> Option<String> {
        let pattern = format!("{}{}:*", KEY_PREFIX, push_type.as_str());
        let keys = match self.store.scan_keys(self.shard, &pattern).await {
            Ok(keys) => keys,
            Err(err) => {
                warn!("registry scan for {} failed: {}", pattern, err);
                return None;
            }
        };

        let prefix = format!("{}{}:", KEY_PREFIX, push_type.as_str());
        let servers: Vec<String> = keys
            .iter()
            .filter_map(|key| key.strip_prefix(&prefix))
            .map(|addr| addr.to_string())
            .collect();
        servers.choose(&mut rand::thread_rng()).cloned()
    }
}
