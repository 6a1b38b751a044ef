use std::sync::Arc;

use dao::{StoredMessage, StoredMessages};
use proto::envelope::Envelope;

/// Gateway over the stored-message DAO: converts envelopes to durable
/// rows and owns the delete batching. One instance is shared by every
/// dispatch channel.
pub struct MessagesManager {
    stored_messages: Arc<dyn StoredMessages>,
}

impl MessagesManager {
    pub fn new(stored_messages: Arc<dyn StoredMessages>) -> Arc<Self> {
        Arc::new(MessagesManager { stored_messages })
    }

    /// Stores an undelivered envelope; returns the unread count for the
    /// destination device, used as the push badge.
    pub fn store(
        &self,
        destination: &str,
        destination_device_id: u32,
        destination_registration_id: u32,
        envelope: &Envelope,
    ) -> dao::Result<u32> {
        self.stored_messages.set(StoredMessage::from_envelope(
            destination,
            destination_device_id,
            destination_registration_id,
            envelope,
        ))
    }

    pub fn get(
        &self,
        destination: &str,
        destination_device_id: u32,
        max_count: usize,
        has_more: &mut bool,
    ) -> dao::Result<Vec<StoredMessage>> {
        self.stored_messages
            .get(destination, destination_device_id, max_count, has_more)
    }

    pub fn del(&self, destination: &str, ids: &[u64]) -> dao::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.stored_messages.del(destination, ids)
    }

    pub fn del_one(&self, destination: &str, id: u64) -> dao::Result<()> {
        self.stored_messages.del(destination, &[id])
    }

    pub fn clear(&self, destination: &str) -> dao::Result<()> {
        self.stored_messages.clear(destination)
    }

    pub fn clear_device(&self, destination: &str, destination_device_id: u32) -> dao::Result<()> {
        self.stored_messages
            .clear_device(destination, destination_device_id)
    }
}
