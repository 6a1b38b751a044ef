use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{Notification, PushVendor};

const VENDOR_TIMEOUT_MS: u64 = 10 * 1000;

fn vendor_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_millis(VENDOR_TIMEOUT_MS))
        .build()
        .unwrap_or_default()
}

async fn post_notification(
    client: &reqwest::Client,
    endpoint: &str,
    vendor: &str,
    notification: &Notification,
) -> bool {
    match client.post(endpoint).json(notification).send().await {
        Ok(response) => response.status().is_success(),
        Err(err) => {
            debug!("{} post to {} failed: {}", vendor, endpoint, err);
            false
        }
    }
}

pub struct ApnsVendor {
    endpoint: String,
    client: reqwest::Client,
}

impl ApnsVendor {
    pub fn new(endpoint: String) -> Self {
        ApnsVendor {
            endpoint,
            client: vendor_client(),
        }
    }
}

#[async_trait]
impl PushVendor for ApnsVendor {
    async fn send(&self, notification: &Notification) -> bool {
        post_notification(&self.client, &self.endpoint, "apns", notification).await
    }
}

pub struct FcmVendor {
    endpoint: String,
    client: reqwest::Client,
}

impl FcmVendor {
    pub fn new(endpoint: String) -> Self {
        FcmVendor {
            endpoint,
            client: vendor_client(),
        }
    }
}

#[async_trait]
impl PushVendor for FcmVendor {
    async fn send(&self, notification: &Notification) -> bool {
        post_notification(&self.client, &self.endpoint, "fcm", notification).await
    }
}

pub struct UmengVendor {
    endpoint: String,
    client: reqwest::Client,
}

impl UmengVendor {
    pub fn new(endpoint: String) -> Self {
        UmengVendor {
            endpoint,
            client: vendor_client(),
        }
    }
}

#[async_trait]
impl PushVendor for UmengVendor {
    async fn send(&self, notification: &Notification) -> bool {
        post_notification(&self.client, &self.endpoint, "umeng", notification).await
    }
}
