use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use online_redis::ShardedStore;
use tracing::{error, info, warn};

type LeaseLostCallback = Box<dyn Fn() + Send + Sync>;

/// Redis-held mutual exclusion with a TTL: `SET key <uuid> NX PX ttl` to
/// acquire, re-renewed at half the TTL. Losing a renewal demotes the
/// process to standby and fires the callback; acquisition is retried
/// forever in the background.
pub struct MasterLeaseAgent {
    store: Arc<dyn ShardedStore>,
    shard: i32,
    key: String,
    holder: String,
    ttl_ms: u64,
    master: AtomicBool,
    running: AtomicBool,
    lost_callback: Option<LeaseLostCallback>,
}

pub const DEFAULT_LEASE_TTL_MS: u64 = 10 * 1000;

impl MasterLeaseAgent {
    pub fn new(
        store: Arc<dyn ShardedStore>,
        key: String,
        ttl_ms: u64,
        lost_callback: Option<LeaseLostCallback>,
    ) -> Arc<Self> {
        let shard = store.shard_for_key(&key);
        Arc::new(MasterLeaseAgent {
            store,
            shard,
            key,
            holder: uuid::Uuid::new_v4().to_string(),
            ttl_ms,
            master: AtomicBool::new(false),
            running: AtomicBool::new(true),
            lost_callback,
        })
    }

    pub fn is_master(&self) -> bool {
        self.master.load(Ordering::Acquire)
    }

    pub fn start(self: &Arc<Self>) {
        let agent = self.clone();
        tokio::spawn(async move {
            agent.run().await;
        });
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if self.master.swap(false, Ordering::AcqRel) {
            self.release().await;
        }
    }

    async fn run(&self) {
        let renew_interval = Duration::from_millis(self.ttl_ms / 2);

        while self.running.load(Ordering::Acquire) {
            // Acquire, retrying until the current holder lets go.
            loop {
                if !self.running.load(Ordering::Acquire) {
                    return;
                }
                match self
                    .store
                    .set_nx_px(self.shard, &self.key, &self.holder, self.ttl_ms)
                    .await
                {
                    Ok(true) => break,
                    Ok(false) | Err(_) => {
                        tokio::time::sleep(Duration::from_millis(1000)).await;
                    }
                }
            }

            self.master.store(true, Ordering::Release);
            info!("promote to [MASTER] mode, lease key {}", self.key);
            tokio::time::sleep(renew_interval).await;

            loop {
                if !self.running.load(Ordering::Acquire) {
                    self.release().await;
                    return;
                }
                if self.renew().await {
                    tokio::time::sleep(renew_interval).await;
                } else {
                    error!("downgrade to [SLAVE] mode, lease key {}", self.key);
                    self.master.store(false, Ordering::Release);
                    if let Some(callback) = &self.lost_callback {
                        callback();
                    }
                    tokio::time::sleep(Duration::from_millis(1000)).await;
                    break;
                }
            }
        }
    }

    /// Renewal succeeds only while this process still holds the key.
    async fn renew(&self) -> bool {
        match self.store.get(self.shard, &self.key).await {
            Ok(Some(holder)) if holder == self.holder => self
                .store
                .pexpire(self.shard, &self.key, self.ttl_ms)
                .await
                .unwrap_or(false),
            Ok(_) => false,
            Err(err) => {
                warn!("lease renewal read failed for {}: {}", self.key, err);
                false
            }
        }
    }

    async fn release(&self) {
        if let Ok(Some(holder)) = self.store.get(self.shard, &self.key).await {
            if holder == self.holder {
                self.store.del(self.shard, &self.key).await.ok();
            }
        }
    }
}
