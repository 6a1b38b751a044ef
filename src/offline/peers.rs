use std::time::Duration;

use async_trait::async_trait;
use proto::group::PushGroupMsgRequest;
use tracing::debug;

use crate::push::Notification;

pub const PUSH_GROUP_MSG_PATH: &str = "/internal/pushGroupMsg";
pub const PUSH_MSG_PATH: &str = "/internal/pushMsg";

const PEER_TIMEOUT_MS: u64 = 10 * 1000;

/// Outbound posts to peer offline servers. Abstracted so the round tests
/// can observe the fan-out without a live peer.
#[async_trait]
pub trait PeerPoster: Send + Sync {
    async fn post_group_msg(&self, addr: &str, request: &PushGroupMsgRequest) -> bool;
    async fn post_notification(&self, addr: &str, notification: &Notification) -> bool;
}

pub struct HttpPeerPoster {
    client: reqwest::Client,
}

impl HttpPeerPoster {
    pub fn new() -> Self {
        HttpPeerPoster {
            client: reqwest::Client::builder()
                .timeout(Duration::from_millis(PEER_TIMEOUT_MS))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for HttpPeerPoster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerPoster for HttpPeerPoster {
    async fn post_group_msg(&self, addr: &str, request: &PushGroupMsgRequest) -> bool {
        let url = format!("http://{}{}", addr, PUSH_GROUP_MSG_PATH);
        match self.client.post(&url).json(request).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!("post to {} failed: {}", url, err);
                false
            }
        }
    }

    async fn post_notification(&self, addr: &str, notification: &Notification) -> bool {
        let url = format!("http://{}{}", addr, PUSH_MSG_PATH);
        match self.client.post(&url).json(notification).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!("post to {} failed: {}", url, err);
                false
            }
        }
    }
}
