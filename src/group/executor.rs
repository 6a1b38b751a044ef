use futures::future::BoxFuture;
use online_redis::hash::hash_key;
use tokio::sync::mpsc;

/// Pool of single-consumer workers addressed by key hash. Work posted for
/// the same key always lands on the same worker, which serializes every
/// mutation of one uid's or one gid's state without locks around the
/// await points.
pub struct KeyedExecutor {
    workers: Vec<mpsc::UnboundedSender<BoxFuture<'static, ()>>>,
}

impl KeyedExecutor {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let mut workers = Vec::with_capacity(size);
        for _ in 0..size {
            let (tx, mut rx) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
            tokio::spawn(async move {
                while let Some(work) = rx.recv().await {
                    work.await;
                }
            });
            workers.push(tx);
        }
        KeyedExecutor { workers }
    }

    pub fn post<F>(&self, key: u64, work: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let index = (key % self.workers.len() as u64) as usize;
        self.workers[index].send(Box::pin(work)).ok();
    }

    pub fn post_by_uid<F>(&self, uid: &str, work: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.post(hash_key(uid), work);
    }

    pub fn post_by_gid<F>(&self, gid: u64, work: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.post(gid, work);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn same_key_work_is_serialized() {
        let executor = KeyedExecutor::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        for _ in 0..64 {
            let counter = counter.clone();
            let max_seen = max_seen.clone();
            executor.post_by_gid(7, async move {
                let running = counter.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(running, Ordering::SeqCst);
                tokio::task::yield_now().await;
                counter.fetch_sub(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_keys_spread_over_workers() {
        let executor = KeyedExecutor::new(4);
        let done = Arc::new(AtomicUsize::new(0));
        for gid in 0..16u64 {
            let done = done.clone();
            executor.post_by_gid(gid, async move {
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(done.load(Ordering::SeqCst), 16);
    }
}
