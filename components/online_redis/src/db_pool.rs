use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;

use crate::hash::hash_key;
use crate::{OnlineRedisError, RedisNode, Result};

/// The sharded Redis storage pool behind the offline queues, per-user
/// cursors, badge counters, the master lease and the offline-server
/// registry. Keyed writes are routed by a deterministic hash so that every
/// process agrees on the owning shard.
#[async_trait]
pub trait ShardedStore: Send + Sync {
    fn shard_ids(&self) -> Vec<i32>;
    fn shard_for_key(&self, key: &str) -> i32;

    async fn get(&self, shard: i32, key: &str) -> Result<Option<String>>;
    async fn set(&self, shard: i32, key: &str, value: &str) -> Result<()>;
    async fn set_px(&self, shard: i32, key: &str, value: &str, ttl_ms: u64) -> Result<()>;
    /// `SET key value NX PX ttl`; true when the key was acquired.
    async fn set_nx_px(&self, shard: i32, key: &str, value: &str, ttl_ms: u64) -> Result<bool>;
    async fn pexpire(&self, shard: i32, key: &str, ttl_ms: u64) -> Result<bool>;
    async fn del(&self, shard: i32, key: &str) -> Result<()>;
    async fn incr(&self, shard: i32, key: &str) -> Result<i64>;

    async fn hmset(&self, shard: i32, key: &str, fields: &[(String, String)]) -> Result<()>;
    /// Returns only the fields that exist.
    async fn hmget(
        &self,
        shard: i32,
        key: &str,
        fields: &[String],
    ) -> Result<HashMap<String, String>>;
    async fn hdel(&self, shard: i32, key: &str, fields: &[String]) -> Result<()>;
    async fn hscan_page(
        &self,
        shard: i32,
        key: &str,
        cursor: &str,
        count: usize,
    ) -> Result<(String, Vec<(String, String)>)>;

    async fn zrangebyscore_limit(
        &self,
        shard: i32,
        key: &str,
        min: i64,
        max: i64,
        offset: isize,
        count: isize,
    ) -> Result<Vec<(String, i64)>>;
    async fn zrem(&self, shard: i32, key: &str, members: &[String]) -> Result<()>;

    async fn scan_keys(&self, shard: i32, pattern: &str) -> Result<Vec<String>>;
}

pub struct RedisDbPool {
    shards: Vec<(i32, RedisNode)>,
    connections: tokio::sync::Mutex<HashMap<i32, ConnectionManager>>,
}

impl RedisDbPool {
    pub fn new(nodes: &[RedisNode]) -> Arc<Self> {
        Arc::new(RedisDbPool {
            shards: nodes
                .iter()
                .enumerate()
                .map(|(id, node)| (id as i32, node.clone()))
                .collect(),
            connections: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    async fn connection(&self, shard: i32) -> Result<ConnectionManager> {
        let mut connections = self.connections.lock().await;
        if let Some(conn) = connections.get(&shard) {
            return Ok(conn.clone());
        }

        let node = self
            .shards
            .iter()
            .find(|(id, _)| *id == shard)
            .map(|(_, node)| node)
            .ok_or_else(|| OnlineRedisError::NoPartition(format!("shard {}", shard)))?;
        let client = redis::Client::open(node.url())?;
        let conn = ConnectionManager::new(client).await?;
        connections.insert(shard, conn.clone());
        Ok(conn)
    }

    async fn invalidate(&self, shard: i32) {
        self.connections.lock().await.remove(&shard);
    }
}

macro_rules! run_on_shard {
    ($self:expr, $shard:expr, $conn:ident, $body:expr) => {{
        let mut $conn = $self.connection($shard).await?;
        match $body {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!("redis shard {} command failed: {}", $shard, err);
                $self.invalidate($shard).await;
                Err(OnlineRedisError::from(err))
            }
        }
    }};
}

#[async_trait]
impl ShardedStore for RedisDbPool {
    fn shard_ids(&self) -> Vec<i32> {
        self.shards.iter().map(|(id, _)| *id).collect()
    }

    fn shard_for_key(&self, key: &str) -> i32 {
        let index = hash_key(key) as usize % self.shards.len();
        self.shards[index].0
    }

    async fn get(&self, shard: i32, key: &str) -> Result<Option<String>> {
        run_on_shard!(self, shard, conn, conn.get::<_, Option<String>>(key).await)
    }

    async fn set(&self, shard: i32, key: &str, value: &str) -> Result<()> {
        run_on_shard!(self, shard, conn, conn.set::<_, _, ()>(key, value).await)
    }

    async fn set_px(&self, shard: i32, key: &str, value: &str, ttl_ms: u64) -> Result<()> {
        run_on_shard!(
            self,
            shard,
            conn,
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(ttl_ms)
                .query_async::<_, ()>(&mut conn)
                .await
        )
    }

    async fn set_nx_px(&self, shard: i32, key: &str, value: &str, ttl_ms: u64) -> Result<bool> {
        let reply: Option<String> = run_on_shard!(
            self,
            shard,
            conn,
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async::<_, Option<String>>(&mut conn)
                .await
        )?;
        Ok(reply.is_some())
    }

    async fn pexpire(&self, shard: i32, key: &str, ttl_ms: u64) -> Result<bool> {
        let updated: i64 = run_on_shard!(
            self,
            shard,
            conn,
            redis::cmd("PEXPIRE")
                .arg(key)
                .arg(ttl_ms)
                .query_async::<_, i64>(&mut conn)
                .await
        )?;
        Ok(updated == 1)
    }

    async fn del(&self, shard: i32, key: &str) -> Result<()> {
        run_on_shard!(self, shard, conn, conn.del::<_, ()>(key).await)
    }

    async fn incr(&self, shard: i32, key: &str) -> Result<i64> {
        run_on_shard!(self, shard, conn, conn.incr::<_, _, i64>(key, 1).await)
    }

    async fn hmset(&self, shard: i32, key: &str, fields: &[(String, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        run_on_shard!(
            self,
            shard,
            conn,
            conn.hset_multiple::<_, _, _, ()>(key, fields).await
        )
    }

    async fn hmget(
        &self,
        shard: i32,
        key: &str,
        fields: &[String],
    ) -> Result<HashMap<String, String>> {
        if fields.is_empty() {
            return Ok(HashMap::new());
        }
        let values: Vec<Option<String>> = run_on_shard!(
            self,
            shard,
            conn,
            conn.hget::<_, _, Vec<Option<String>>>(key, fields).await
        )?;
        Ok(fields
            .iter()
            .zip(values)
            .filter_map(|(field, value)| value.map(|v| (field.clone(), v)))
            .collect())
    }

    async fn hdel(&self, shard: i32, key: &str, fields: &[String]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        run_on_shard!(self, shard, conn, conn.hdel::<_, _, ()>(key, fields).await)
    }

    async fn hscan_page(
        &self,
        shard: i32,
        key: &str,
        cursor: &str,
        count: usize,
    ) -> Result<(String, Vec<(String, String)>)> {
        run_on_shard!(
            self,
            shard,
            conn,
            redis::cmd("HSCAN")
                .arg(key)
                .arg(cursor)
                .arg("COUNT")
                .arg(count)
                .query_async::<_, (String, Vec<(String, String)>)>(&mut conn)
                .await
        )
    }

    async fn zrangebyscore_limit(
        &self,
        shard: i32,
        key: &str,
        min: i64,
        max: i64,
        offset: isize,
        count: isize,
    ) -> Result<Vec<(String, i64)>> {
        run_on_shard!(
            self,
            shard,
            conn,
            redis::cmd("ZRANGEBYSCORE")
                .arg(key)
                .arg(min)
                .arg(max)
                .arg("WITHSCORES")
                .arg("LIMIT")
                .arg(offset)
                .arg(count)
                .query_async::<_, Vec<(String, i64)>>(&mut conn)
                .await
        )
    }

    async fn zrem(&self, shard: i32, key: &str, members: &[String]) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        run_on_shard!(self, shard, conn, conn.zrem::<_, _, ()>(key, members).await)
    }

    async fn scan_keys(&self, shard: i32, pattern: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor = "0".to_string();
        loop {
            let (next, page): (String, Vec<String>) = run_on_shard!(
                self,
                shard,
                conn,
                redis::cmd("SCAN")
                    .arg(&cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(100)
                    .query_async::<_, (String, Vec<String>)>(&mut conn)
                    .await
            )?;
            keys.extend(page);
            if next == "0" {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }
}
