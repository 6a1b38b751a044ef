use serde::{Deserialize, Serialize};

/// Request frame issued by the server over an established client session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsRequest {
    pub verb: String,
    pub path: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Synthetic status reported when the transport closed before the client
/// answered; triggers the channel's republish fallback.
pub const STATUS_CONNECTION_CLOSED: u16 = 444;

impl WsRequest {
    pub fn put(path: &str, body: Vec<u8>) -> Self {
        WsRequest {
            verb: "PUT".to_string(),
            path: path.to_string(),
            body,
        }
    }
}

impl WsResponse {
    pub fn new(status: u16) -> Self {
        WsResponse {
            status,
            body: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_connection_closed(&self) -> bool {
        self.status == STATUS_CONNECTION_CLOSED
    }
}
