use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::group::GroupKeys;
use crate::traits::GroupKeysDao;
use crate::{DaoError, Result};

/// In-process cache in front of a [`GroupKeysDao`], keyed `(gid, version)`
/// with FIFO eviction up to a configured capacity.
///
/// The latest version per group is tracked separately so that within one
/// process the newest keys are never served stale; `get_bypassing_cache`
/// exists for the rare caller that must see the backing store directly.
pub struct GroupKeysCache {
    dao: Arc<dyn GroupKeysDao>,
    capacity: u64,
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<(u64, i64), GroupKeys>,
    order: VecDeque<(u64, i64)>,
    latest: HashMap<u64, i64>,
}

impl GroupKeysCache {
    pub fn new(dao: Arc<dyn GroupKeysDao>, capacity: u64) -> Self {
        GroupKeysCache {
            dao,
            capacity,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn insert(&self, keys: GroupKeys) -> Result<()> {
        self.dao.insert(keys.clone())?;

        let mut inner = self.inner.lock();
        inner.latest.insert(keys.gid, keys.version);
        Self::cache_entry(&mut inner, keys, self.capacity);
        Ok(())
    }

    pub fn get(&self, gid: u64, version: i64) -> Result<GroupKeys> {
        {
            let inner = self.inner.lock();
            if let Some(keys) = inner.entries.get(&(gid, version)) {
                return Ok(keys.clone());
            }
        }

        let keys = self
            .dao
            .get(gid, &[version])?
            .into_iter()
            .next()
            .ok_or(DaoError::NotFound)?;

        let mut inner = self.inner.lock();
        Self::cache_entry(&mut inner, keys.clone(), self.capacity);
        Ok(keys)
    }

    pub fn get_latest(&self, gid: u64) -> Result<GroupKeys> {
        let cached_version = self.inner.lock().latest.get(&gid).copied();
        if let Some(version) = cached_version {
            return self.get(gid, version);
        }

        let keys = self.dao.get_latest(gid)?;
        let mut inner = self.inner.lock();
        inner.latest.insert(gid, keys.version);
        Self::cache_entry(&mut inner, keys.clone(), self.capacity);
        Ok(keys)
    }

    pub fn get_bypassing_cache(&self, gid: u64, version: i64) -> Result<GroupKeys> {
        self.dao
            .get(gid, &[version])?
            .into_iter()
            .next()
            .ok_or(DaoError::NotFound)
    }

    pub fn clear_group(&self, gid: u64) -> Result<()> {
        self.dao.clear(gid)?;

        let mut inner = self.inner.lock();
        inner.latest.remove(&gid);
        inner.order.retain(|key| key.0 != gid);
        inner.entries.retain(|key, _| key.0 != gid);
        Ok(())
    }

    fn cache_entry(inner: &mut CacheInner, keys: GroupKeys, capacity: u64) {
        if capacity == 0 {
            return;
        }
        let key = (keys.gid, keys.version);
        if inner.entries.insert(key, keys).is_none() {
            inner.order.push_back(key);
        }
        while inner.order.len() as u64 > capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.entries.remove(&evicted);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::GroupKeysMode;
    use crate::memory::MemoryDao;

    fn keys(gid: u64, version: i64) -> GroupKeys {
        GroupKeys {
            gid,
            version,
            mode: GroupKeysMode::AllTheSame,
            creator: "u1".to_string(),
            keys: version.to_be_bytes().to_vec(),
        }
    }

    #[test]
    fn insert_rejects_stale_versions() {
        let dao = Arc::new(MemoryDao::new());
        let cache = GroupKeysCache::new(dao, 8);

        cache.insert(keys(1, 5)).unwrap();
        assert_eq!(cache.insert(keys(1, 5)), Err(DaoError::Conflict));
        assert_eq!(cache.insert(keys(1, 4)), Err(DaoError::Conflict));
        cache.insert(keys(1, 6)).unwrap();
        assert_eq!(cache.get_latest(1).unwrap().version, 6);
    }

    #[test]
    fn fifo_eviction_keeps_capacity() {
        let dao = Arc::new(MemoryDao::new());
        let cache = GroupKeysCache::new(dao, 2);

        cache.insert(keys(1, 1)).unwrap();
        cache.insert(keys(2, 1)).unwrap();
        cache.insert(keys(3, 1)).unwrap();

        let inner = cache.inner.lock();
        assert_eq!(inner.entries.len(), 2);
        assert!(!inner.entries.contains_key(&(1, 1)));
        assert!(inner.entries.contains_key(&(3, 1)));
    }

    #[test]
    fn latest_is_never_stale_after_insert() {
        let dao = Arc::new(MemoryDao::new());
        let cache = GroupKeysCache::new(dao, 8);

        cache.insert(keys(7, 1)).unwrap();
        assert_eq!(cache.get_latest(7).unwrap().version, 1);
        cache.insert(keys(7, 2)).unwrap();
        assert_eq!(cache.get_latest(7).unwrap().version, 2);
    }
}
