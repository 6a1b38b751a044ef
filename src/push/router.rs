use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::offline::peers::PeerPoster;
use crate::offline::OfflineServerRegistry;

use super::{Notification, OfflineDispatcher, PushService, PushType};

/// Routes a notification to the local vendor when this process handles
/// the type, otherwise to a peer advertising it.
pub struct PushRouter {
    push_service: Arc<PushService>,
    registry: Arc<OfflineServerRegistry>,
    poster: Arc<dyn PeerPoster>,
}

impl PushRouter {
    pub fn new(
        push_service: Arc<PushService>,
        registry: Arc<OfflineServerRegistry>,
        poster: Arc<dyn PeerPoster>,
    ) -> Arc<Self> {
        Arc::new(PushRouter {
            push_service,
            registry,
            poster,
        })
    }
}

#[async_trait]
impl OfflineDispatcher for PushRouter {
    async fn dispatch(&self, push_type: PushType, notification: Notification) {
        if self.push_service.handles(push_type) {
            self.push_service.send(push_type, &notification).await;
            return;
        }

        match self.registry.random_server(push_type).await {
            Some(addr) => {
                if !self.poster.post_notification(&addr, &notification).await {
                    warn!(
                        "peer {} rejected {} notification for {}",
                        addr,
                        push_type.as_str(),
                        notification.target_address
                    );
                }
            }
            None => warn!(
                "no offline server advertises {} for {}",
                push_type.as_str(),
                notification.target_address
            ),
        }
    }
}
