use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dao::Account;
use parking_lot::Mutex;
use proto::websocket::{WsRequest, WsResponse, STATUS_CONNECTION_CLOSED};

use super::ClientSession;

/// Scripted session for the dispatch tests: requests are recorded,
/// responses come from an explicit queue or fall back to a default
/// status. Disconnecting flips every later response to the closed status.
pub struct MockSession {
    account: Mutex<Option<Account>>,
    default_status: AtomicU16,
    scripted: Mutex<VecDeque<WsResponse>>,
    requests: Mutex<Vec<WsRequest>>,
    connected: AtomicBool,
}

impl MockSession {
    pub fn new(account: Account) -> Arc<Self> {
        Arc::new(MockSession {
            account: Mutex::new(Some(account)),
            default_status: AtomicU16::new(200),
            scripted: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
        })
    }

    pub fn set_default_status(&self, status: u16) {
        self.default_status.store(status, Ordering::SeqCst);
    }

    pub fn push_response(&self, response: WsResponse) {
        self.scripted.lock().push_back(response);
    }

    pub fn requests(&self) -> Vec<WsRequest> {
        self.requests.lock().clone()
    }

    pub fn requests_for(&self, path: &str) -> Vec<WsRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }

    pub fn update_account(&self, account: Account) {
        *self.account.lock() = Some(account);
    }
}

#[async_trait]
impl ClientSession for MockSession {
    async fn send_request(&self, request: WsRequest) -> WsResponse {
        self.requests.lock().push(request);
        if !self.connected.load(Ordering::SeqCst) {
            return WsResponse::new(STATUS_CONNECTION_CLOSED);
        }
        if let Some(response) = self.scripted.lock().pop_front() {
            return response;
        }
        WsResponse::new(self.default_status.load(Ordering::SeqCst))
    }

    fn authenticated(&self, _refresh: bool) -> Option<Account> {
        self.account.lock().clone()
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
