use std::sync::Arc;
use std::time::Duration;

use online_redis::hash::HashRing;
use online_redis::RedisNode;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use tracing::{debug, error, info, warn};

const TICK_INTERVAL_SECS: u64 = 5;
const PRESENCE_PREFIX: &str = "imserver_";

/// Tracks the set of live dispatch servers. Each server holds a
/// subscription on its own `"imserver_<ip>:<port>"` channel as a presence
/// beacon; peers discover each other with `PUBSUB CHANNELS imserver_*`
/// and route groups over a consistent hash of the discovered list.
pub struct ImServerManager {
    node: RedisNode,
    self_addr: String,
    servers: RwLock<Vec<String>>,
    ring: RwLock<HashRing>,
}

impl ImServerManager {
    pub fn new(node: RedisNode, self_addr: String) -> Arc<Self> {
        Arc::new(ImServerManager {
            node,
            self_addr,
            servers: RwLock::new(Vec::new()),
            ring: RwLock::new(HashRing::new()),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.presence_loop().await;
        });

        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(TICK_INTERVAL_SECS));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                manager.update_server_list().await;
            }
        });
    }

    /// Holds the presence subscription open; the subscription itself is
    /// the advertisement, no payload is ever published.
    async fn presence_loop(&self) {
        let channel = format!("{}{}", PRESENCE_PREFIX, self.self_addr);
        loop {
            let client = match redis::Client::open(self.node.url()) {
                Ok(client) => client,
                Err(err) => {
                    error!("bad im-server redis config: {}", err);
                    return;
                }
            };
            match client.get_async_connection().await {
                Ok(conn) => {
                    let mut pubsub = conn.into_pubsub();
                    if let Err(err) = pubsub.subscribe(&channel).await {
                        warn!("presence subscribe failed: {}", err);
                    } else {
                        info!("advertising im server presence on {}", channel);
                        use futures_util::StreamExt;
                        let mut stream = pubsub.on_message();
                        while stream.next().await.is_some() {}
                    }
                }
                Err(err) => {
                    debug!("presence connect failed: {}", err);
                }
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn update_server_list(&self) {
        let client = match redis::Client::open(self.node.url()) {
            Ok(client) => client,
            Err(_) => return,
        };
        let mut conn = match client.get_async_connection().await {
            Ok(conn) => conn,
            Err(err) => {
                debug!("im-server list connect failed: {}", err);
                return;
            }
        };

        let channels: Vec<String> = match redis::cmd("PUBSUB")
            .arg("CHANNELS")
            .arg(format!("{}*", PRESENCE_PREFIX))
            .query_async(&mut conn)
            .await
        {
            Ok(channels) => channels,
            Err(err) => {
                error!("get im server list from redis error: {}", err);
                return;
            }
        };

        let mut servers = Vec::with_capacity(channels.len());
        let mut ring = HashRing::new();
        for channel in &channels {
            match channel.strip_prefix(PRESENCE_PREFIX) {
                Some(addr) if !addr.is_empty() => {
                    if !servers.contains(&addr.to_string()) {
                        servers.push(addr.to_string());
                        ring.add_server(addr);
                    }
                }
                _ => error!("invalid server descriptor format: {}", channel),
            }
        }

        debug!("found {} im server(s)", servers.len());
        *self.servers.write() = servers;
        *self.ring.write() = ring;
    }

    pub fn get_server_by_group(&self, gid: u64) -> Option<String> {
        self.ring
            .read()
            .get_server(&gid.to_string())
            .map(|s| s.to_string())
    }

    /// Whether this process owns the group in the current server list.
    pub fn should_handle_group(&self, gid: u64) -> bool {
        match self.get_server_by_group(gid) {
            Some(addr) => addr == self.self_addr,
            None => {
                warn!("could not find im server by group id: {}", gid);
                false
            }
        }
    }

    pub fn get_server_randomly(&self) -> Option<String> {
        self.servers
            .read()
            .choose(&mut rand::thread_rng())
            .cloned()
    }

    pub fn servers(&self) -> Vec<String> {
        self.servers.read().clone()
    }
}
