//! Storage contracts consumed by the dispatch core.
//!
//! The traits below are the narrow synchronous interface the rest of the
//! server depends on; remote backends are expected to wrap blocking RPC
//! behind them. The `memory` module provides the complete in-process
//! implementation used by tests and single-node deployments.

pub mod account;
pub mod contacts;
pub mod group;
pub mod keys_cache;
pub mod memory;
pub mod message;
pub mod traits;

pub use account::{Account, AccountState, ClientVersion, Device, OsType};
pub use contacts::{FriendEvent, FriendEventType};
pub use group::{GroupKeys, GroupKeysMode, GroupRole, JoinedGroup};
pub use message::StoredMessage;
pub use traits::{Accounts, Contacts, GroupKeysDao, GroupUsers, StoredMessages};

use std::fmt::Display;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaoError {
    /// The row does not exist; callers branch on this, it is not a fault.
    NotFound,
    /// A conditional write lost its race (e.g. group keys version CAS).
    Conflict,
    Internal(String),
}

impl Display for DaoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaoError::NotFound => write!(f, "no such data"),
            DaoError::Conflict => write!(f, "conditional write conflict"),
            DaoError::Internal(err) => write!(f, "internal error: {}", err),
        }
    }
}

pub type Result<T> = std::result::Result<T, DaoError>;

/// The master device id; all offline push is keyed to it.
pub const MASTER_DEVICE_ID: u32 = 1;
