use std::collections::HashMap;

use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupMessageSeq {
    pub timestamp: u32,
    pub last_mid: u64,
}

/// Per-group `(ts, lastMid)` watermark of the last processed round,
/// letting later rounds drop queue rows that were already surpassed.
#[derive(Default)]
pub struct RoundWatermarks {
    groups: RwLock<HashMap<u64, GroupMessageSeq>>,
}

impl RoundWatermarks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_mid(&self, gid: u64, timestamp: u32, last_mid: u64) {
        self.groups.write().insert(
            gid,
            GroupMessageSeq {
                timestamp,
                last_mid,
            },
        );
    }

    pub fn get(&self, gid: u64) -> Option<GroupMessageSeq> {
        self.groups.read().get(&gid).copied()
    }

    pub fn contains(&self, gid: u64) -> bool {
        self.groups.read().contains_key(&gid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_tracks_latest() {
        let watermarks = RoundWatermarks::new();
        assert!(watermarks.get(1).is_none());

        watermarks.update_mid(1, 100, 5);
        watermarks.update_mid(1, 200, 9);
        assert_eq!(
            watermarks.get(1),
            Some(GroupMessageSeq {
                timestamp: 200,
                last_mid: 9
            })
        );
        assert!(watermarks.contains(1));
        assert!(!watermarks.contains(2));
    }
}
