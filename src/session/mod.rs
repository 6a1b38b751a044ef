//! Contract between the dispatch core and the transport layer that
//! accepts client connections. The acceptor (TLS, websocket framing,
//! authentication) lives outside the core; the core only issues framed
//! requests and observes the reported status.

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use dao::Account;
use proto::websocket::{WsRequest, WsResponse};

#[async_trait]
pub trait ClientSession: Send + Sync {
    /// Sends one framed request and resolves with the client's response.
    /// A transport that closed before answering resolves with status
    /// [`proto::websocket::STATUS_CONNECTION_CLOSED`].
    async fn send_request(&self, request: WsRequest) -> WsResponse;

    /// The account this session authenticated as. `refresh` forces a
    /// re-read from storage; slave-device paths use it because the master
    /// may have mutated the device list since login.
    fn authenticated(&self, refresh: bool) -> Option<Account>;

    fn disconnect(&self);

    fn is_connected(&self) -> bool;
}
