use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use dao::{DaoError, Device, FriendEventType, OsType, StoredMessage};
use proto::envelope::{Envelope, EnvelopeType, Mailbox, PushClass};
use proto::friend::FriendMessage;
use proto::multi_device::MultiDeviceMessage;
use proto::pubsub::{PubSubMessage, PubSubType};
use proto::websocket::WsRequest;
use proto::{from_wire, to_wire};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use crate::config::{DispatcherConfig, EncryptSenderConfig};
use crate::dispatch::crypto;
use crate::dispatch::manager::DispatchManager;
use crate::dispatch::DispatchAddress;
use crate::metrics::{CODE_FAILURE, CODE_SUCCESS};
use crate::push::Notification;
use crate::session::ClientSession;

const METRICS_SERVICE: &str = "websocket";
const MAX_DISPATCH_ONCE: usize = 50;
const MAX_FRIEND_EVENTS: usize = 100;

pub enum ChannelEvent {
    Subscribed,
    QueryDb,
    RedisMessage(Vec<u8>),
    GroupMessage(Arc<Vec<u8>>),
    Stop,
}

/// Per-session state machine. Installed by the manager at subscribe time;
/// `available` turns true once this process observes its own subscription
/// confirmed on Redis, and false forever on arbitration loss, kick or
/// unsubscribe.
pub struct DispatchChannel {
    address: DispatchAddress,
    session: Arc<dyn ClientSession>,
    identity: u64,
    available: AtomicBool,
    manager: Weak<DispatchManager>,
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl DispatchChannel {
    pub fn new(
        address: DispatchAddress,
        session: Arc<dyn ClientSession>,
        identity: u64,
        manager: Weak<DispatchManager>,
        worker_permits: Arc<Semaphore>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(DispatchChannel {
            address,
            session,
            identity,
            available: AtomicBool::new(false),
            manager,
            tx,
        });
        tokio::spawn(channel_task(Arc::downgrade(&channel), rx, worker_permits));
        channel
    }

    pub fn identity(&self) -> u64 {
        self.identity
    }

    pub fn address(&self) -> &DispatchAddress {
        &self.address
    }

    pub fn session(&self) -> &Arc<dyn ClientSession> {
        &self.session
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn notify_subscribed(&self) {
        self.tx.send(ChannelEvent::Subscribed).ok();
    }

    pub fn notify_redis_message(&self, payload: Vec<u8>) {
        self.tx.send(ChannelEvent::RedisMessage(payload)).ok();
    }

    pub fn notify_group_message(&self, payload: Arc<Vec<u8>>) {
        self.tx.send(ChannelEvent::GroupMessage(payload)).ok();
    }

    fn request_drain(&self) {
        self.tx.send(ChannelEvent::QueryDb).ok();
    }

    /// Runs on the manager's thread, not the channel actor: availability
    /// must drop before any queued event is processed.
    pub fn on_dispatch_unsubscribed(&self, kicking: bool) {
        info!(
            "unsubscribe response ({} kick {} available {})",
            self.address,
            kicking,
            self.is_available()
        );
        self.available.store(false, Ordering::Release);
        if kicking {
            info!("disconnect session ({})", self.address);
            self.session.disconnect();
            self.tx.send(ChannelEvent::Stop).ok();
        }
    }

    pub async fn handle_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Subscribed => self.on_dispatch_subscribed().await,
            ChannelEvent::QueryDb => self.run_stored_drain().await,
            ChannelEvent::RedisMessage(payload) => self.on_redis_message(&payload).await,
            ChannelEvent::GroupMessage(payload) => self.on_group_message(&payload).await,
            ChannelEvent::Stop => {}
        }
    }

    async fn on_dispatch_subscribed(&self) {
        info!(
            "success to subscribe response ({}), available: {}",
            self.address,
            self.is_available()
        );
        if self.available.swap(true, Ordering::AcqRel) {
            return;
        }

        self.run_stored_drain().await;

        // Slave devices do not receive friend events.
        if !self.address.is_master() {
            return;
        }
        self.drain_stored_friend_events(BTreeSet::from([
            FriendEventType::FriendRequest,
            FriendEventType::FriendReply,
            FriendEventType::DeleteFriend,
        ]))
        .await;
    }

    async fn on_redis_message(&self, payload: &[u8]) {
        if !self.is_available() {
            return;
        }

        let Some(frame) = from_wire::<PubSubMessage>(payload) else {
            error!("failed to parse pubsub redis message ({})", self.address);
            return;
        };
        debug!(
            "success to parse pubsub redis message ({} {})",
            self.address,
            payload.len()
        );

        match frame.msg_type {
            PubSubType::QueryDb => self.run_stored_drain().await,
            PubSubType::Deliver => {
                let Some(envelope) = from_wire::<Envelope>(&frame.content) else {
                    error!("failed to parse im message ({})", self.address);
                    return;
                };
                self.send_p2p_message(envelope, None, false).await;
            }
            PubSubType::Connected => {
                if let Some(identity) = frame.connected_identity() {
                    if identity != self.identity {
                        error!(
                            "a new connection coming on another server for {}",
                            self.address
                        );
                        self.available.store(false, Ordering::Release);
                        self.session.disconnect();
                    }
                }
            }
            PubSubType::MultiDevice => {
                let Some(message) = from_wire::<MultiDeviceMessage>(&frame.content) else {
                    error!("failed to parse multi_device message ({})", self.address);
                    return;
                };
                self.send_multi_device_message(message).await;
            }
            PubSubType::Friend => {
                let Some(message) = from_wire::<FriendMessage>(&frame.content) else {
                    error!("failed to parse friend message ({})", self.address);
                    return;
                };
                self.send_friend_event_message(message).await;
            }
            PubSubType::Notification => self.on_group_message(&frame.content).await,
            PubSubType::Close
            | PubSubType::KeepAlive
            | PubSubType::Check
            | PubSubType::QueryOnline => {}
            PubSubType::Unknown => {
                error!("unknown pubsub redis message type ({})", self.address);
            }
        }
    }

    async fn on_group_message(&self, payload: &[u8]) {
        if !self.is_available() {
            return;
        }
        let Some(manager) = self.manager.upgrade() else {
            error!("dispatch manager is destroyed");
            return;
        };

        let start = Instant::now();
        let response = self
            .session
            .send_request(WsRequest::put("/api/v1/group_message", payload.to_vec()))
            .await;

        let code = if response.is_success() {
            info!("success to dispatch online group message for {}", self.address);
            CODE_SUCCESS
        } else {
            error!("failed to dispatch online group message for {}", self.address);
            CODE_FAILURE
        };
        manager.metrics().mark(
            METRICS_SERVICE,
            "onDispatchGroupMessage",
            start.elapsed().as_micros() as i64,
            code,
        );
    }

    /// Delivers one envelope over the live session, falling back to the
    /// republish / storage / offline-push ladder on failure.
    pub async fn send_p2p_message(
        &self,
        envelope: Envelope,
        storage_id: Option<u64>,
        remain: bool,
    ) {
        let Some(manager) = self.manager.upgrade() else {
            error!("dispatch manager is destroyed");
            return;
        };

        let refresh = !self.address.is_master();
        let Some(account) = self.session.authenticated(refresh) else {
            return;
        };
        let Some(device) = account.auth_device().cloned() else {
            return;
        };

        let start = Instant::now();
        let Some(plaintext) = to_wire(&envelope) else {
            return;
        };
        let payload = match crypto::encrypt(&device.signaling_key, &plaintext) {
            Ok(payload) => payload,
            Err(err) => {
                error!("encrypt failed for {}: {}", self.address, err);
                return;
            }
        };

        let response = self
            .session
            .send_request(WsRequest::put("/api/v1/message", payload))
            .await;

        if response.is_success() {
            if let Some(id) = storage_id {
                manager.messages().del_one(&account.uid, id).ok();
            }
            manager.metrics().mark(
                METRICS_SERVICE,
                "sendP2pMessage",
                start.elapsed().as_micros() as i64,
                CODE_SUCCESS,
            );
            debug!(
                "success to dispatch online message from {}.{} to {}.{}, status: {}",
                envelope.source, envelope.source_device, account.uid, device.id, response.status
            );
            if remain {
                self.request_drain();
            }
            return;
        }

        if envelope.msg_type == EnvelopeType::Noise {
            return;
        }

        manager.metrics().mark(
            METRICS_SERVICE,
            "sendP2pMessage",
            start.elapsed().as_micros() as i64,
            CODE_FAILURE,
        );
        error!(
            "failed to dispatch online p2p message, status: {}, {}",
            response.status, self.address
        );

        if storage_id.is_some() {
            // Replayed rows stay in storage for the next drain.
            return;
        }

        if response.is_connection_closed() {
            let frame = PubSubMessage::new(
                PubSubType::Deliver,
                to_wire(&envelope).unwrap_or_default(),
            );
            if manager
                .publish(&self.address, to_wire(&frame).unwrap_or_default())
                .await
            {
                debug!("republished message to a new channel: {}", self.address);
                return;
            }
        }

        let unread_count = match manager.messages().store(
            &account.uid,
            device.id,
            device.registration_id,
            &envelope,
        ) {
            Ok(count) => count,
            Err(err) => {
                error!("failed to store message for {}: {}", self.address, err);
                return;
            }
        };

        // Offline push is keyed to the master device only.
        if !device.is_master() {
            return;
        }
        if envelope.msg_type == EnvelopeType::Receipt
            || envelope.push_class() == PushClass::Silent
            || !device.is_pushable()
        {
            return;
        }

        let mut notification = Notification::chat(source_in_push_service(
            &device,
            &envelope,
            manager.encrypt_sender_config(),
        ));
        notification.badge = unread_count;
        notification.set_target_address(&self.address);
        notification.set_device_info(&device);
        notification.class = envelope.push;

        if let Some(push_type) = notification.push_type() {
            manager
                .offline_dispatcher()
                .dispatch(push_type, notification)
                .await;
        }
    }

    /// Entry point of the stored-message drain; loops while batches keep
    /// succeeding and more rows remain.
    async fn run_stored_drain(&self) {
        loop {
            let more = if self.supports_batch_dispatch() {
                self.batch_drain_round().await
            } else {
                self.legacy_drain_round().await
            };
            if !more {
                break;
            }
        }
    }

    async fn batch_drain_round(&self) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            warn!("dispatch manager is destroyed");
            return false;
        };
        let Some(account) = self.session.authenticated(false) else {
            return false;
        };
        let Some(device) = account.auth_device().cloned() else {
            return false;
        };

        let start = Instant::now();
        debug!("prepare stored messages for {}", self.address);

        let mut has_more = false;
        let messages = match manager.messages().get(
            &account.uid,
            account.auth_device_id,
            MAX_DISPATCH_ONCE,
            &mut has_more,
        ) {
            Ok(messages) => messages,
            Err(_) => return false,
        };
        if messages.is_empty() {
            self.send_empty().await;
            return false;
        }

        let mut mailbox = Mailbox::default();
        let mut stale_ids = Vec::new();
        let mut fresh_ids = Vec::new();
        for message in &messages {
            let envelope = message.to_envelope();
            if self.is_message_stale_and_client_obsolete(message, &device) {
                if self.send_receipt(&envelope, b"STALE").await {
                    stale_ids.push(message.id);
                }
                continue;
            }
            fresh_ids.push(message.id);
            mailbox.envelopes.push(envelope);
        }

        if !stale_ids.is_empty() {
            manager.messages().del(&account.uid, &stale_ids).ok();
        }

        if mailbox.envelopes.is_empty() {
            info!("no fresh stored message to push for {}", self.address);
            self.send_empty().await;
            return false;
        }

        let Some(plaintext) = to_wire(&mailbox) else {
            return false;
        };
        let payload = match crypto::encrypt(&device.signaling_key, &plaintext) {
            Ok(payload) => payload,
            Err(err) => {
                error!("encrypt failed for {}: {}", self.address, err);
                return false;
            }
        };

        debug!(
            "prepared {} stored messages for {}",
            mailbox.envelopes.len(),
            self.address
        );
        let response = self
            .session
            .send_request(WsRequest::put("/api/v1/messages", payload))
            .await;

        if response.is_success() {
            manager.messages().del(&account.uid, &fresh_ids).ok();
            manager.metrics().mark(
                METRICS_SERVICE,
                "sendStoredMessages",
                start.elapsed().as_micros() as i64,
                CODE_SUCCESS,
            );
            if has_more {
                true
            } else {
                self.send_empty().await;
                false
            }
        } else {
            manager.metrics().mark(
                METRICS_SERVICE,
                "sendStoredMessages",
                start.elapsed().as_micros() as i64,
                CODE_FAILURE,
            );
            debug!(
                "failed to dispatch offline messages to {}.{}, status: {}",
                account.uid, device.id, response.status
            );
            false
        }
    }

    /// Per-message fallback for clients below the batch version gate.
    async fn legacy_drain_round(&self) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            warn!("dispatch manager is destroyed");
            return false;
        };
        let Some(account) = self.session.authenticated(false) else {
            return false;
        };
        let Some(device) = account.auth_device().cloned() else {
            return false;
        };

        debug!("legacy read stored messages for {}", self.address);

        let mut has_more = false;
        let messages = match manager.messages().get(
            &account.uid,
            account.auth_device_id,
            MAX_DISPATCH_ONCE,
            &mut has_more,
        ) {
            Ok(messages) => messages,
            Err(_) => return false,
        };
        if messages.is_empty() {
            return false;
        }

        let mut stale_ids = Vec::new();
        let mut remaining = messages.len();
        for message in &messages {
            remaining -= 1;
            let envelope = message.to_envelope();
            if self.is_message_stale_and_client_obsolete(message, &device) {
                if self.send_receipt(&envelope, b"STALE").await {
                    stale_ids.push(message.id);
                }
                continue;
            }
            self.send_p2p_message(envelope, Some(message.id), remaining == 0 && has_more)
                .await;
        }

        if !stale_ids.is_empty() {
            manager.messages().del(&account.uid, &stale_ids).ok();
        }
        if !has_more {
            self.send_empty().await;
        }

        debug!(
            "finished posting {} offline messages for {}",
            messages.len(),
            self.address
        );
        false
    }

    /// Builds an inverse-routed receipt toward the message's source and
    /// publishes it, storing it when the source is offline. Receipts never
    /// produce further receipts.
    async fn send_receipt(&self, envelope: &Envelope, payload: &[u8]) -> bool {
        if envelope.msg_type == EnvelopeType::Receipt {
            return true;
        }

        let Some(manager) = self.manager.upgrade() else {
            warn!("dispatch manager is destroyed");
            return false;
        };
        let refresh = !self.address.is_master();
        let Some(account) = self.session.authenticated(refresh) else {
            return false;
        };
        let Some(device) = account.auth_device() else {
            return false;
        };

        let receipt = Envelope {
            msg_type: EnvelopeType::Receipt,
            source: account.uid.clone(),
            source_device: device.id,
            source_registration: device.registration_id,
            source_extra: String::new(),
            timestamp: envelope.timestamp,
            relay: envelope.relay.clone(),
            content: payload.to_vec(),
            push: 0,
        };
        let frame = PubSubMessage::new(
            PubSubType::Deliver,
            to_wire(&receipt).unwrap_or_default(),
        );

        let destination = DispatchAddress::new(envelope.source.clone(), envelope.source_device);
        if manager
            .publish(&destination, to_wire(&frame).unwrap_or_default())
            .await
        {
            return true;
        }

        if manager
            .messages()
            .store(
                &envelope.source,
                envelope.source_device,
                envelope.source_registration,
                &receipt,
            )
            .is_err()
        {
            error!(
                "save receipt failed, from {} to {}.{}",
                self.address, envelope.source, envelope.source_device
            );
            return false;
        }
        true
    }

    async fn send_empty(&self) {
        self.session
            .send_request(WsRequest::put("/api/v1/queue/empty", Vec::new()))
            .await;
    }

    async fn send_multi_device_message(&self, message: MultiDeviceMessage) {
        let Some(manager) = self.manager.upgrade() else {
            error!("dispatch manager is destroyed");
            return;
        };
        let Some(payload) = to_wire(&message) else {
            error!("serialize multi device message failed");
            return;
        };

        let start = Instant::now();
        let response = self
            .session
            .send_request(WsRequest::put("/api/v1/devices", payload))
            .await;

        if response.is_success() {
            manager.metrics().mark(
                METRICS_SERVICE,
                "sendMultiDeviceMessage",
                start.elapsed().as_micros() as i64,
                CODE_SUCCESS,
            );
            debug!(
                "success to dispatch multi device event message to {}, status: {}",
                self.address, response.status
            );
        } else {
            manager.metrics().mark(
                METRICS_SERVICE,
                "sendMultiDeviceMessage",
                start.elapsed().as_micros() as i64,
                CODE_FAILURE,
            );
            error!(
                "failed to send multi device event message to {}, status: {}",
                self.address, response.status
            );
        }

        // Kick-class events end the session once the client was told.
        if message.event.ends_session() {
            self.available.store(false, Ordering::Release);
            self.session.disconnect();
        }
    }

    async fn send_friend_event_message(&self, message: FriendMessage) {
        let Some(manager) = self.manager.upgrade() else {
            error!("dispatch manager is destroyed");
            return;
        };
        let Some(payload) = to_wire(&message) else {
            error!("serialize friend message failed");
            return;
        };

        let start = Instant::now();
        let response = self
            .session
            .send_request(WsRequest::put("/api/v1/friends", payload))
            .await;

        if response.is_success() {
            manager.metrics().mark(
                METRICS_SERVICE,
                "sendFriendEventMessage",
                start.elapsed().as_micros() as i64,
                CODE_SUCCESS,
            );
            return;
        }

        manager.metrics().mark(
            METRICS_SERVICE,
            "sendFriendEventMessage",
            start.elapsed().as_micros() as i64,
            CODE_FAILURE,
        );
        error!(
            "failed to dispatch friend event message to {}, status: {}",
            self.address, response.status
        );

        if response.is_connection_closed() {
            let frame = PubSubMessage::new(
                PubSubType::Friend,
                to_wire(&message).unwrap_or_default(),
            );
            if manager
                .publish(&self.address, to_wire(&frame).unwrap_or_default())
                .await
            {
                debug!("friend event message re-published to {}", self.address);
                return;
            }
        }

        // Persist every entry so the next login replays them.
        let contacts = manager.contacts();
        for entry in &message.requests {
            if let Some(data) = to_wire(entry) {
                if let Err(err) = contacts.add_friend_event(
                    self.address.uid(),
                    FriendEventType::FriendRequest,
                    data,
                ) {
                    error!(
                        "failed to store friend request for {}: {}",
                        self.address.uid(),
                        err
                    );
                }
            }
        }
        for entry in &message.replies {
            if let Some(data) = to_wire(entry) {
                if let Err(err) = contacts.add_friend_event(
                    self.address.uid(),
                    FriendEventType::FriendReply,
                    data,
                ) {
                    error!(
                        "failed to store friend reply for {}: {}",
                        self.address.uid(),
                        err
                    );
                }
            }
        }
        for entry in &message.deletes {
            if let Some(data) = to_wire(entry) {
                if let Err(err) = contacts.add_friend_event(
                    self.address.uid(),
                    FriendEventType::DeleteFriend,
                    data,
                ) {
                    error!(
                        "failed to store friend deletion for {}: {}",
                        self.address.uid(),
                        err
                    );
                }
            }
        }
    }

    /// Replays stored friend events in pages, per event kind, and keeps
    /// going while any kind returned a full page.
    async fn drain_stored_friend_events(&self, mut types: BTreeSet<FriendEventType>) {
        while !types.is_empty() {
            let Some(manager) = self.manager.upgrade() else {
                error!("dispatch manager is destroyed");
                return;
            };
            let contacts = manager.contacts().clone();

            let mut message = FriendMessage::default();
            let mut ids: Vec<(FriendEventType, Vec<i64>)> = Vec::new();
            let mut more_types = BTreeSet::new();

            for event_type in &types {
                let events = match contacts.get_friend_events(
                    self.address.uid(),
                    *event_type,
                    MAX_FRIEND_EVENTS,
                ) {
                    Ok(events) => events,
                    Err(DaoError::NotFound) => continue,
                    Err(err) => {
                        error!(
                            "failed to get friend events for {}: {}",
                            self.address.uid(),
                            err
                        );
                        return;
                    }
                };
                if events.is_empty() {
                    continue;
                }

                let mut delivered = Vec::new();
                for event in &events {
                    let parsed = match event_type {
                        FriendEventType::FriendRequest => from_wire(&event.data)
                            .map(|entry| message.requests.push(entry))
                            .is_some(),
                        FriendEventType::FriendReply => from_wire(&event.data)
                            .map(|entry| message.replies.push(entry))
                            .is_some(),
                        FriendEventType::DeleteFriend => from_wire(&event.data)
                            .map(|entry| message.deletes.push(entry))
                            .is_some(),
                    };
                    if parsed {
                        delivered.push(event.id);
                    } else {
                        error!(
                            "failed to parse friend event, id: {}, uid: {}",
                            event.id,
                            self.address.uid()
                        );
                    }
                }
                if events.len() >= MAX_FRIEND_EVENTS {
                    more_types.insert(*event_type);
                }
                ids.push((*event_type, delivered));
            }

            if message.is_empty() {
                return;
            }
            let Some(payload) = to_wire(&message) else {
                return;
            };

            let start = Instant::now();
            let response = self
                .session
                .send_request(WsRequest::put("/api/v1/friends", payload))
                .await;
            if !response.is_success() {
                manager.metrics().mark(
                    METRICS_SERVICE,
                    "sendStoredFriendEventMessages",
                    start.elapsed().as_micros() as i64,
                    CODE_FAILURE,
                );
                error!(
                    "failed to dispatch stored friend events to {}, status: {}",
                    self.address, response.status
                );
                return;
            }

            manager.metrics().mark(
                METRICS_SERVICE,
                "sendStoredFriendEventMessages",
                start.elapsed().as_micros() as i64,
                CODE_SUCCESS,
            );

            let mut has_error = false;
            for (event_type, delivered) in ids {
                if delivered.is_empty() {
                    continue;
                }
                match contacts.del_friend_events(self.address.uid(), event_type, &delivered) {
                    Ok(()) | Err(DaoError::NotFound) => {}
                    Err(err) => {
                        error!(
                            "failed to delete friend events for {}: {}",
                            self.address.uid(),
                            err
                        );
                        has_error = true;
                    }
                }
            }

            if has_error {
                return;
            }
            types = more_types;
        }
    }

    fn supports_batch_dispatch(&self) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let refresh = !self.address.is_master();
        let Some(account) = self.session.authenticated(refresh) else {
            return false;
        };
        let Some(device) = account.auth_device() else {
            return false;
        };
        let config: &DispatcherConfig = manager.dispatcher_config();
        match device.client_version.os_type {
            OsType::Ios => device.client_version.build_code >= config.batch_ios_version,
            OsType::Android => device.client_version.build_code >= config.batch_android_version,
            OsType::Unknown => false,
        }
    }

    /// A stored row is stale-and-obsolete when it was encrypted for a
    /// previous registration of this device, carries a plain source, and
    /// the client is too old to recover via the encrypted-sender path.
    fn is_message_stale_and_client_obsolete(
        &self,
        message: &StoredMessage,
        device: &Device,
    ) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        message.destination_registration_id != 0
            && message.destination_registration_id != device.registration_id
            && !message.source.is_empty()
            && !client_supports_encrypt_sender(device, manager.encrypt_sender_config())
    }

}

pub fn client_supports_encrypt_sender(device: &Device, config: &EncryptSenderConfig) -> bool {
    match device.client_version.os_type {
        OsType::Ios => {
            config.ios_version > 0 && device.client_version.build_code >= config.ios_version
        }
        OsType::Android => {
            config.android_version > 0
                && device.client_version.build_code >= config.android_version
        }
        OsType::Unknown => false,
    }
}

/// Sender name shown in the vendor push: clients on the encrypted-sender
/// path (or deployments without plain-uid support) see the extra form.
pub fn source_in_push_service(
    device: &Device,
    envelope: &Envelope,
    config: &EncryptSenderConfig,
) -> String {
    if !envelope.source_extra.is_empty()
        && (client_supports_encrypt_sender(device, config) || !config.plain_uid_support)
    {
        envelope.source_extra.clone()
    } else {
        envelope.source.clone()
    }
}

/// The channel actor: serializes this channel's handlers while the shared
/// semaphore bounds how many channels run at once. Holding only a weak
/// reference lets the channel die once the manager drops it.
async fn channel_task(
    channel: Weak<DispatchChannel>,
    mut rx: mpsc::UnboundedReceiver<ChannelEvent>,
    worker_permits: Arc<Semaphore>,
) {
    while let Some(event) = rx.recv().await {
        if matches!(event, ChannelEvent::Stop) {
            break;
        }
        let Some(channel) = channel.upgrade() else {
            break;
        };
        let Ok(_permit) = worker_permits.acquire().await else {
            break;
        };
        channel.handle_event(event).await;
    }
}
