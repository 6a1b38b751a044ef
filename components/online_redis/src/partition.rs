use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    MetricsSink, OnlineRedisError, RedisNode, Result, CODE_NO_AVAILABLE_NODE,
    KEEP_ALIVE_CHANNEL, METRICS_SERVICE, METRICS_TOPIC, RECONNECT_DELAY_MS,
};

/// Callbacks invoked by the bus. Implementations must not block: the
/// convention is to enqueue an event and return.
pub trait SubscriptionHandler: Send + Sync {
    fn on_subscribe(&self, channel: &str);
    fn on_unsubscribe(&self, channel: &str);
    fn on_message(&self, channel: &str, payload: &[u8]);
    fn on_error(&self, code: i32);
}

type HandlerMap = Arc<RwLock<HashMap<String, Arc<dyn SubscriptionHandler>>>>;

enum NodeCmd {
    Subscribe(String),
    PSubscribe(String),
    Unsubscribe(String),
    PUnsubscribe(String),
    KeepAlive,
}

struct NodeState {
    node: RedisNode,
    priority: u32,
    cmd_tx: mpsc::UnboundedSender<NodeCmd>,
    sub_available: Arc<AtomicBool>,
    pub_conn: tokio::sync::Mutex<Option<ConnectionManager>>,
}

/// One partition of the online bus: an ordered list of replicated Redis
/// nodes. Subscriptions are replicated to every connected node and
/// replayed on reconnect; publishes go to the highest-priority node that
/// currently has a usable connection.
pub struct RedisPartition {
    name: String,
    nodes: Vec<Arc<NodeState>>,
    subs: HandlerMap,
    psubs: HandlerMap,
    metrics: Arc<dyn MetricsSink>,
}

impl RedisPartition {
    pub fn new(name: String, nodes: &[RedisNode], metrics: Arc<dyn MetricsSink>) -> Arc<Self> {
        let subs: HandlerMap = Arc::new(RwLock::new(HashMap::new()));
        let psubs: HandlerMap = Arc::new(RwLock::new(HashMap::new()));
        let mut states = Vec::with_capacity(nodes.len());

        for (priority, node) in nodes.iter().enumerate() {
            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            let state = Arc::new(NodeState {
                node: node.clone(),
                priority: priority as u32,
                cmd_tx,
                sub_available: Arc::new(AtomicBool::new(false)),
                pub_conn: tokio::sync::Mutex::new(None),
            });
            tokio::spawn(subscriber_loop(
                name.clone(),
                state.clone(),
                cmd_rx,
                subs.clone(),
                psubs.clone(),
            ));
            states.push(state);
        }

        Arc::new(RedisPartition {
            name,
            nodes: states,
            subs,
            psubs,
            metrics,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn broadcast(&self, make: impl Fn() -> NodeCmd) -> bool {
        if !self.nodes.iter().any(|n| n.sub_available.load(Ordering::Acquire)) {
            error!(
                "partition '{}' has no available subscriber connection",
                self.name
            );
            self.metrics
                .mark(METRICS_SERVICE, METRICS_TOPIC, 0, CODE_NO_AVAILABLE_NODE);
            return false;
        }
        for node in &self.nodes {
            node.cmd_tx.send(make()).ok();
        }
        true
    }

    pub fn subscribe(&self, channel: &str, handler: Arc<dyn SubscriptionHandler>) -> bool {
        self.subs.write().insert(channel.to_string(), handler);
        let channel = channel.to_string();
        self.broadcast(|| NodeCmd::Subscribe(channel.clone()))
    }

    pub fn psubscribe(&self, pattern: &str, handler: Arc<dyn SubscriptionHandler>) -> bool {
        self.psubs.write().insert(pattern.to_string(), handler);
        let pattern = pattern.to_string();
        self.broadcast(|| NodeCmd::PSubscribe(pattern.clone()))
    }

    pub fn unsubscribe(&self, channel: &str) -> bool {
        if channel == KEEP_ALIVE_CHANNEL {
            return true;
        }
        self.subs.write().remove(channel);
        let channel = channel.to_string();
        self.broadcast(|| NodeCmd::Unsubscribe(channel.clone()))
    }

    pub fn punsubscribe(&self, pattern: &str) -> bool {
        self.psubs.write().remove(pattern);
        let pattern = pattern.to_string();
        self.broadcast(|| NodeCmd::PUnsubscribe(pattern.clone()))
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subs.read().contains_key(channel)
    }

    pub fn keep_alive(&self) {
        for node in &self.nodes {
            if node.sub_available.load(Ordering::Acquire) {
                node.cmd_tx.send(NodeCmd::KeepAlive).ok();
            }
        }
    }

    /// Publishes on the highest-priority node with a working connection
    /// and returns the subscriber count from the integer reply.
    pub async fn publish(&self, channel: &str, payload: &[u8]) -> Result<i64> {
        for node in &self.nodes {
            let conn = {
                let mut slot = node.pub_conn.lock().await;
                match slot.as_ref() {
                    Some(conn) => Some(conn.clone()),
                    None => match redis::Client::open(node.node.url())
                        .map_err(OnlineRedisError::from)
                    {
                        Ok(client) => match ConnectionManager::new(client).await {
                            Ok(conn) => {
                                *slot = Some(conn.clone());
                                Some(conn)
                            }
                            Err(err) => {
                                debug!(
                                    "partition '{}' publish connect to {}:{} failed: {}",
                                    self.name, node.node.host, node.node.port, err
                                );
                                None
                            }
                        },
                        Err(_) => None,
                    },
                }
            };

            let Some(mut conn) = conn else { continue };
            match redis::cmd("PUBLISH")
                .arg(channel)
                .arg(payload)
                .query_async::<_, i64>(&mut conn)
                .await
            {
                Ok(subscribers) => return Ok(subscribers),
                Err(err) => {
                    warn!(
                        "partition '{}' publish on priority {} failed: {}",
                        self.name, node.priority, err
                    );
                    *node.pub_conn.lock().await = None;
                }
            }
        }

        error!("partition '{}' has no available node for publish", self.name);
        self.metrics
            .mark(METRICS_SERVICE, METRICS_TOPIC, 0, CODE_NO_AVAILABLE_NODE);
        Err(OnlineRedisError::NoAvailableNode(self.name.clone()))
    }
}

enum Step {
    Message(Option<redis::Msg>),
    Command(Option<NodeCmd>),
}

async fn subscriber_loop(
    partition: String,
    state: Arc<NodeState>,
    mut cmd_rx: mpsc::UnboundedReceiver<NodeCmd>,
    subs: HandlerMap,
    psubs: HandlerMap,
) {
    loop {
        let client = match redis::Client::open(state.node.url()) {
            Ok(client) => client,
            Err(err) => {
                error!(
                    "partition '{}' bad node config {}:{}: {}",
                    partition, state.node.host, state.node.port, err
                );
                return;
            }
        };

        let mut pubsub = match client.get_async_connection().await {
            Ok(conn) => conn.into_pubsub(),
            Err(err) => {
                debug!(
                    "partition '{}' subscriber connect to {}:{} failed: {}",
                    partition, state.node.host, state.node.port, err
                );
                // AUTH failures are terminal for this node.
                if err.kind() == redis::ErrorKind::AuthenticationFailed {
                    error!(
                        "partition '{}' node {}:{} authentication failed, giving up",
                        partition, state.node.host, state.node.port
                    );
                    return;
                }
                tokio::time::sleep(Duration::from_millis(RECONNECT_DELAY_MS)).await;
                continue;
            }
        };

        state.sub_available.store(true, Ordering::Release);
        info!(
            "partition '{}' subscriber connected to {}:{} (priority {})",
            partition, state.node.host, state.node.port, state.priority
        );

        // Replay every retained subscription on the fresh connection. The
        // maps are snapshotted so no lock is held across the awaits.
        let retained: Vec<(String, Arc<dyn SubscriptionHandler>)> = subs
            .read()
            .iter()
            .map(|(channel, handler)| (channel.clone(), handler.clone()))
            .collect();
        let retained_patterns: Vec<(String, Arc<dyn SubscriptionHandler>)> = psubs
            .read()
            .iter()
            .map(|(pattern, handler)| (pattern.clone(), handler.clone()))
            .collect();

        let mut replay_failed = false;
        for (channel, handler) in retained {
            if let Err(err) = pubsub.subscribe(&channel).await {
                warn!("partition '{}' replay subscribe failed: {}", partition, err);
                handler.on_error(1);
                replay_failed = true;
                break;
            }
            handler.on_subscribe(&channel);
        }
        if !replay_failed {
            for (pattern, handler) in retained_patterns {
                if let Err(err) = pubsub.psubscribe(&pattern).await {
                    warn!("partition '{}' replay psubscribe failed: {}", partition, err);
                    handler.on_error(1);
                    replay_failed = true;
                    break;
                }
                handler.on_subscribe(&pattern);
            }
        }

        while !replay_failed {
            let step = {
                let mut stream = pubsub.on_message();
                tokio::select! {
                    message = stream.next() => Step::Message(message),
                    command = cmd_rx.recv() => Step::Command(command),
                }
            };

            match step {
                Step::Message(Some(message)) => {
                    dispatch_message(&message, &subs, &psubs);
                }
                Step::Message(None) => break,
                Step::Command(Some(command)) => {
                    if apply_command(&partition, &mut pubsub, command, &subs, &psubs)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Step::Command(None) => {
                    state.sub_available.store(false, Ordering::Release);
                    return;
                }
            }
        }

        state.sub_available.store(false, Ordering::Release);
        warn!(
            "partition '{}' subscriber to {}:{} disconnected, retrying in {}ms",
            partition, state.node.host, state.node.port, RECONNECT_DELAY_MS
        );
        tokio::time::sleep(Duration::from_millis(RECONNECT_DELAY_MS)).await;
    }
}

async fn apply_command(
    partition: &str,
    pubsub: &mut redis::aio::PubSub,
    command: NodeCmd,
    subs: &HandlerMap,
    psubs: &HandlerMap,
) -> std::result::Result<(), ()> {
    let outcome = match command {
        NodeCmd::Subscribe(channel) => {
            let result = pubsub.subscribe(&channel).await;
            if result.is_ok() {
                if let Some(handler) = subs.read().get(&channel).cloned() {
                    handler.on_subscribe(&channel);
                }
            } else if let Some(handler) = subs.read().get(&channel).cloned() {
                handler.on_error(1);
            }
            result
        }
        NodeCmd::PSubscribe(pattern) => {
            let result = pubsub.psubscribe(&pattern).await;
            if result.is_ok() {
                if let Some(handler) = psubs.read().get(&pattern).cloned() {
                    handler.on_subscribe(&pattern);
                }
            } else if let Some(handler) = psubs.read().get(&pattern).cloned() {
                handler.on_error(1);
            }
            result
        }
        NodeCmd::Unsubscribe(channel) => pubsub.unsubscribe(&channel).await,
        NodeCmd::PUnsubscribe(pattern) => pubsub.punsubscribe(&pattern).await,
        // A no-op command that doubles as a liveness probe.
        NodeCmd::KeepAlive => pubsub.unsubscribe(KEEP_ALIVE_CHANNEL).await,
    };

    outcome.map_err(|err| {
        warn!("partition '{}' subscriber command failed: {}", partition, err);
    })
}

fn dispatch_message(message: &redis::Msg, subs: &HandlerMap, psubs: &HandlerMap) {
    let channel = message.get_channel_name().to_string();
    let payload = message.get_payload_bytes().to_vec();

    if let Some(handler) = subs.read().get(&channel).cloned() {
        handler.on_message(&channel, &payload);
        return;
    }

    if let Ok(Some(pattern)) = message.get_pattern::<Option<String>>() {
        if let Some(handler) = psubs.read().get(&pattern).cloned() {
            handler.on_message(&channel, &payload);
            return;
        }
    }

    debug!("dropping message on channel '{}' with no retained handler", channel);
}
