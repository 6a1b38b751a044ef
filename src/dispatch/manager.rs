use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use online_redis::{PubSubService, ShardedStore, SubscriptionHandler};
use parking_lot::{Mutex, RwLock};
use proto::pubsub::PubSubMessage;
use proto::to_wire;
use tokio::sync::mpsc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::{DispatcherConfig, EncryptSenderConfig};
use crate::dispatch::channel::DispatchChannel;
use crate::dispatch::{DispatchAddress, Event, UserStatusListener};
use crate::messages::MessagesManager;
use crate::metrics::Metrics;
use crate::push::OfflineDispatcher;
use crate::session::ClientSession;
use crate::store_format::apns_badge_key;

/// Per-process authority over the `address → channel` map. All channel
/// bound events are funneled through a single loop; the partitioner
/// callbacks only enqueue.
pub struct DispatchManager {
    channels: Mutex<HashMap<DispatchAddress, Arc<DispatchChannel>>>,
    event_tx: mpsc::UnboundedSender<Event>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    listeners: RwLock<Vec<Arc<dyn UserStatusListener>>>,

    online_bus: Arc<dyn PubSubService>,
    db_pool: Arc<dyn ShardedStore>,
    messages: Arc<MessagesManager>,
    contacts: Arc<dyn dao::Contacts>,
    offline_dispatcher: Arc<dyn OfflineDispatcher>,
    metrics: Arc<Metrics>,

    config: DispatcherConfig,
    encrypt_sender: EncryptSenderConfig,
    identity_seq: AtomicU64,
    worker_permits: Arc<Semaphore>,
}

impl DispatchManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DispatcherConfig,
        encrypt_sender: EncryptSenderConfig,
        online_bus: Arc<dyn PubSubService>,
        db_pool: Arc<dyn ShardedStore>,
        messages: Arc<MessagesManager>,
        contacts: Arc<dyn dao::Contacts>,
        offline_dispatcher: Arc<dyn OfflineDispatcher>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let worker_permits = Arc::new(Semaphore::new(config.concurrency.max(1)));

        Arc::new(DispatchManager {
            channels: Mutex::new(HashMap::new()),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            listeners: RwLock::new(Vec::new()),
            online_bus,
            db_pool,
            messages,
            contacts,
            offline_dispatcher,
            metrics,
            config,
            encrypt_sender,
            identity_seq: AtomicU64::new(0),
            worker_permits,
        })
    }

    /// Spawns the dispatch loop. Must be called once before the first
    /// subscribe.
    pub fn start(self: &Arc<Self>) {
        let Some(mut event_rx) = self.event_rx.lock().take() else {
            return;
        };
        let manager = self.clone();
        tokio::spawn(async move {
            debug!("dispatch loop started");
            while let Some(event) = event_rx.recv().await {
                manager.route_event(event);
            }
            debug!("dispatch loop exited");
        });
    }

    fn route_event(&self, event: Event) {
        match event {
            Event::RedisConnected | Event::RedisDisconnected => {}
            Event::RedisSubscribed { address } => match self.get_channel(&address) {
                Some(channel) => channel.notify_subscribed(),
                None => warn!("no target channel for {}", address),
            },
            Event::RedisUnsubscribed { address } => match self.get_channel(&address) {
                Some(channel) => channel.on_dispatch_unsubscribed(false),
                None => warn!("no target channel for {}", address),
            },
            Event::RedisMessage { address, payload } => match self.get_channel(&address) {
                Some(channel) => channel.notify_redis_message(payload),
                None => warn!("no target channel for {}", address),
            },
            Event::GroupMessage { address, payload } => match self.get_channel(&address) {
                Some(channel) => channel.notify_group_message(payload),
                None => debug!("no target channel for group message to {}", address),
            },
        }
    }

    /// Installs a new channel for the address and returns its identity.
    ///
    /// The connected notify is published before the partitioner subscribe
    /// so that a peer process holding the previous session observes it,
    /// disconnects, and stops publishing to the address by the time our
    /// subscribe ack arrives.
    pub async fn subscribe(
        self: &Arc<Self>,
        address: DispatchAddress,
        session: Arc<dyn ClientSession>,
    ) -> u64 {
        info!("receive request to subscribe channel ({})", address);

        let identity = self.identity_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let channel = DispatchChannel::new(
            address.clone(),
            session,
            identity,
            Arc::downgrade(self),
            self.worker_permits.clone(),
        );

        let old_channel = self.channels.lock().insert(address.clone(), channel);

        let connect_notify = to_wire(&PubSubMessage::connected(identity)).unwrap_or_default();
        self.publish_raw(&address, connect_notify.clone()).await;

        // The push badge counter resets on reconnection.
        let badge_key = apns_badge_key(address.uid());
        let badge_shard = self.db_pool.shard_for_key(address.uid());
        if let Err(err) = self.db_pool.del(badge_shard, &badge_key).await {
            error!("failed to delete push counter for {}: {}", address.uid(), err);
        }

        if self
            .online_bus
            .publish(
                address.uid(),
                &address.serialized_for_online_notify(),
                connect_notify,
            )
            .await
            .is_err()
        {
            warn!(
                "failed to publish connect notify to address {}",
                address.serialized_for_online_notify()
            );
        }

        if self.online_bus.subscribe(
            address.uid(),
            &address.serialized(),
            self.clone() as Arc<dyn SubscriptionHandler>,
        ) {
            info!("success to subscribe dispatch channel ({} {})", address, identity);
        } else {
            // The retained subscription is replayed once a node connects.
            error!("failed to subscribe dispatch channel ({} {})", address, identity);
        }

        self.on_user_status_change(&address, true);

        if let Some(old_channel) = old_channel {
            info!("unsubscribe old dispatch channel ({})", address);
            old_channel.on_dispatch_unsubscribed(true);
        }

        identity
    }

    /// Removes the channel only when `identity` still matches; a stale
    /// session's teardown must not remove its successor.
    pub fn unsubscribe(&self, address: &DispatchAddress, identity: u64) {
        info!("receive request to unsubscribe channel ({})", address);

        let channel = {
            let mut channels = self.channels.lock();
            match channels.get(address) {
                Some(channel) if channel.identity() == identity => channels.remove(address),
                _ => None,
            }
        };
        let Some(channel) = channel else {
            return;
        };

        self.online_bus.unsubscribe(address.uid(), &address.serialized());
        channel.on_dispatch_unsubscribed(false);
        self.on_user_status_change(address, false);

        info!("unsubscribe dispatch channel ({})", address);
    }

    /// Unconditional teardown, identity not checked.
    pub fn kick(&self, address: &DispatchAddress) {
        self.online_bus.unsubscribe(address.uid(), &address.serialized());

        let Some(channel) = self.channels.lock().remove(address) else {
            warn!("not unsubscribe since not found ({})", address);
            return;
        };

        channel.on_dispatch_unsubscribed(true);
        self.on_user_status_change(address, false);

        info!("kicked dispatch channel ({})", address);
    }

    /// Publishes on the address channel; true when at least one subscriber
    /// received the payload.
    pub async fn publish(&self, address: &DispatchAddress, payload: Vec<u8>) -> bool {
        self.publish_raw(address, payload).await
    }

    async fn publish_raw(&self, address: &DispatchAddress, payload: Vec<u8>) -> bool {
        match self
            .online_bus
            .publish(address.uid(), &address.serialized(), payload)
            .await
        {
            Ok(subscribers) => subscribers > 0,
            Err(err) => {
                error!("dispatch manager publish failed for {}: {}", address, err);
                false
            }
        }
    }

    /// Enqueues one fan-out payload per destination; the dispatch loop
    /// delivers them through the target channels.
    pub fn send_group_message(&self, batches: Vec<(Vec<DispatchAddress>, Arc<Vec<u8>>)>) {
        let mut enqueued = false;
        for (destinations, payload) in batches {
            if payload.is_empty() {
                continue;
            }
            for address in destinations {
                self.event_tx
                    .send(Event::GroupMessage {
                        address,
                        payload: payload.clone(),
                    })
                    .ok();
                enqueued = true;
            }
        }
        if !enqueued {
            warn!("miss to send group message, since message or destination empty");
        }
    }

    pub fn has_local_subscription(&self, address: &DispatchAddress) -> bool {
        self.online_bus
            .is_subscribed(address.uid(), &address.serialized())
    }

    pub fn register_user_status_listener(&self, listener: Arc<dyn UserStatusListener>) {
        self.listeners.write().push(listener);
    }

    fn on_user_status_change(&self, address: &DispatchAddress, online: bool) {
        for listener in self.listeners.read().iter() {
            if online {
                listener.on_user_online(address);
            } else {
                listener.on_user_offline(address);
            }
        }
    }

    pub fn get_channel(&self, address: &DispatchAddress) -> Option<Arc<DispatchChannel>> {
        self.channels.lock().get(address).cloned()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn messages(&self) -> &Arc<MessagesManager> {
        &self.messages
    }

    pub fn contacts(&self) -> &Arc<dyn dao::Contacts> {
        &self.contacts
    }

    pub fn offline_dispatcher(&self) -> &Arc<dyn OfflineDispatcher> {
        &self.offline_dispatcher
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn dispatcher_config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn encrypt_sender_config(&self) -> &EncryptSenderConfig {
        &self.encrypt_sender
    }
}

/// Partitioner callbacks: parse the channel name back into an address and
/// enqueue; never call into channels directly.
impl SubscriptionHandler for DispatchManager {
    fn on_subscribe(&self, channel: &str) {
        let Some(address) = DispatchAddress::deserialize(channel) else {
            debug!("not a dispatch address {}", channel);
            return;
        };
        info!("success to subscribe {} from redis and dispatch handled", channel);
        self.event_tx.send(Event::RedisSubscribed { address }).ok();
    }

    fn on_unsubscribe(&self, channel: &str) {
        info!("success to unsubscribe {} from redis", channel);
    }

    fn on_message(&self, channel: &str, payload: &[u8]) {
        if channel.is_empty() || payload.is_empty() {
            return;
        }
        let Some(address) = DispatchAddress::deserialize(channel) else {
            debug!("not a dispatch address {}, message size: {}", channel, payload.len());
            return;
        };
        self.event_tx
            .send(Event::RedisMessage {
                address,
                payload: payload.to_vec(),
            })
            .ok();
    }

    fn on_error(&self, code: i32) {
        error!("dispatcher redis subscribe error, status: {}", code);
    }
}
