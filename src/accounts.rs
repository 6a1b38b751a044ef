use std::sync::Arc;
use std::time::Duration;

use dao::{Account, Accounts};
use moka::sync::Cache;

/// Account lookups with a short time-to-idle cache in front of the DAO.
/// The cache absorbs the repeated reads the dispatch channels issue per
/// delivered message; `refresh` bypasses it.
pub struct AccountsManager {
    accounts: Arc<dyn Accounts>,
    cache: Cache<String, Account>,
}

const CACHE_TTI_SECS: u64 = 5;

impl AccountsManager {
    pub fn new(accounts: Arc<dyn Accounts>) -> Arc<Self> {
        Arc::new(AccountsManager {
            accounts,
            cache: Cache::builder()
                .initial_capacity(128)
                .time_to_idle(Duration::from_secs(CACHE_TTI_SECS))
                .build(),
        })
    }

    pub fn get(&self, uid: &str, refresh: bool) -> dao::Result<Account> {
        if !refresh {
            if let Some(account) = self.cache.get(uid) {
                return Ok(account);
            }
        }
        let account = self.accounts.get(uid)?;
        self.cache.insert(uid.to_string(), account.clone());
        Ok(account)
    }

    /// Batch fetch without caching; uids that do not exist are appended
    /// to `missed` instead of failing the call.
    pub fn get_batch(
        &self,
        uids: &[String],
        missed: &mut Vec<String>,
    ) -> dao::Result<Vec<Account>> {
        self.accounts.get_batch(uids, missed)
    }
}
