//! In-memory records of leased volumes.
//!
//! Each [`VolumeEntry`] carries its own lock so that concurrent writers
//! contend per volume, never per code mode. [`VolumeSet`] is the concurrent
//! vid-keyed index a code mode selects from.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::clustermgr::AllocVolumeInfo;
use crate::codemode::CodeMode;

/// Unique volume identifier within a cluster
pub type Vid = u32;

/// Outcome of a free-space debit attempt on one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebitResult {
    /// Entry is tombstoned or lacks the requested space
    Rejected,
    /// Space was debited and the entry stays selectable
    Debited,
    /// Space was debited and the leftover fell below the reserve; the
    /// entry is now tombstoned and `remaining_free` must be drained from
    /// the mode's advisory counter.
    Retired { remaining_free: u64 },
}

#[derive(Debug)]
struct VolumeState {
    free: u64,
    used: u64,
    expire_at: u64,
    deleted: bool,
}

/// One leased volume. `capacity` is fixed at insertion; `free + used`
/// never exceeds it, and `deleted` is monotonic.
#[derive(Debug)]
pub struct VolumeEntry {
    vid: Vid,
    code_mode: CodeMode,
    capacity: u64,
    state: RwLock<VolumeState>,
}

impl VolumeEntry {
    pub fn new(info: AllocVolumeInfo) -> Self {
        Self {
            vid: info.vid,
            code_mode: info.code_mode,
            capacity: info.total,
            state: RwLock::new(VolumeState {
                free: info.free,
                used: info.used,
                expire_at: info.expire_at,
                deleted: false,
            }),
        }
    }

    pub fn vid(&self) -> Vid {
        self.vid
    }

    pub fn code_mode(&self) -> CodeMode {
        self.code_mode
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn free(&self) -> u64 {
        self.state.read().free
    }

    pub fn is_deleted(&self) -> bool {
        self.state.read().deleted
    }

    /// Snapshot of the entry in wire form, or `None` once tombstoned
    pub fn info(&self) -> Option<AllocVolumeInfo> {
        let state = self.state.read();
        if state.deleted {
            return None;
        }
        Some(AllocVolumeInfo {
            vid: self.vid,
            code_mode: self.code_mode,
            free: state.free,
            used: state.used,
            total: self.capacity,
            expire_at: state.expire_at,
        })
    }

    /// Try to debit `size` bytes. A debit that drops the leftover below
    /// `reserve_size` retires the entry in the same critical section, so
    /// no later selection can see it writable.
    pub fn try_alloc(&self, size: u64, reserve_size: u64) -> DebitResult {
        let mut state = self.state.write();
        if state.deleted || state.free < size {
            return DebitResult::Rejected;
        }
        state.free -= size;
        state.used += size;
        if state.free < reserve_size {
            state.deleted = true;
            return DebitResult::Retired {
                remaining_free: state.free,
            };
        }
        DebitResult::Debited
    }

    /// Tombstone the entry, returning its remaining free space the first
    /// time. Subsequent calls are no-ops.
    pub fn mark_deleted(&self) -> Option<u64> {
        let mut state = self.state.write();
        if state.deleted {
            return None;
        }
        state.deleted = true;
        Some(state.free)
    }

    /// Extend the lease horizon. Ignored on tombstoned entries.
    pub fn renew(&self, expire_at: u64) {
        let mut state = self.state.write();
        if !state.deleted {
            state.expire_at = expire_at;
        }
    }

    /// Whether the lease expires before `deadline` (unix seconds) and the
    /// entry is still live.
    pub fn expires_within(&self, deadline: u64) -> bool {
        let state = self.state.read();
        !state.deleted && state.expire_at < deadline
    }
}

/// Concurrent vid-keyed set of volume entries
#[derive(Debug, Default)]
pub struct VolumeSet {
    entries: DashMap<Vid, Arc<VolumeEntry>>,
}

impl VolumeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, entry: Arc<VolumeEntry>) {
        self.entries.insert(entry.vid(), entry);
    }

    pub fn get(&self, vid: Vid) -> Option<Arc<VolumeEntry>> {
        self.entries.get(&vid).map(|e| e.value().clone())
    }

    pub fn delete(&self, vid: Vid) -> bool {
        self.entries.remove(&vid).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Point-in-time snapshot ordered by vid. The snapshot is safe to walk
    /// while the set mutates; the entries themselves may still change and
    /// selection revalidates under each entry's lock.
    pub fn list(&self) -> Vec<Arc<VolumeEntry>> {
        let mut vols: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        vols.sort_by_key(|v| v.vid());
        vols
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(vid: Vid, free: u64, total: u64) -> VolumeEntry {
        VolumeEntry::new(AllocVolumeInfo {
            vid,
            code_mode: CodeMode::EC6P6,
            free,
            used: total - free,
            total,
            expire_at: 0,
        })
    }

    #[test]
    fn test_debit_updates_free_and_used() {
        let vol = entry(1, 100, 100);
        assert_eq!(vol.try_alloc(30, 10), DebitResult::Debited);
        let info = vol.info().unwrap();
        assert_eq!(info.free, 70);
        assert_eq!(info.used, 30);
        assert!(info.free + info.used <= vol.capacity());
    }

    #[test]
    fn test_debit_rejects_oversized_request() {
        let vol = entry(1, 20, 100);
        assert_eq!(vol.try_alloc(21, 0), DebitResult::Rejected);
        assert_eq!(vol.free(), 20);
    }

    #[test]
    fn test_debit_below_reserve_retires() {
        let vol = entry(1, 15, 100);
        assert_eq!(
            vol.try_alloc(10, 10),
            DebitResult::Retired { remaining_free: 5 }
        );
        assert!(vol.is_deleted());
        assert_eq!(vol.try_alloc(1, 10), DebitResult::Rejected);
        assert!(vol.info().is_none());
    }

    #[test]
    fn test_mark_deleted_is_idempotent() {
        let vol = entry(1, 80, 100);
        assert_eq!(vol.mark_deleted(), Some(80));
        assert_eq!(vol.mark_deleted(), None);
        assert!(vol.is_deleted());
    }

    #[test]
    fn test_renew_skips_tombstoned_entries() {
        let vol = entry(1, 80, 100);
        vol.renew(500);
        assert!(vol.expires_within(501));
        assert!(!vol.expires_within(500));
        vol.mark_deleted();
        vol.renew(900);
        assert!(!vol.expires_within(1000));
    }

    #[test]
    fn test_set_snapshot_is_sorted_and_stable() {
        let set = VolumeSet::new();
        for vid in [3, 1, 2] {
            set.put(Arc::new(entry(vid, 100, 100)));
        }
        let snapshot = set.list();
        let vids: Vec<Vid> = snapshot.iter().map(|v| v.vid()).collect();
        assert_eq!(vids, vec![1, 2, 3]);

        // mutating the set does not disturb an existing snapshot
        set.delete(2);
        assert_eq!(snapshot.len(), 3);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_set_put_replaces_by_vid() {
        let set = VolumeSet::new();
        set.put(Arc::new(entry(7, 10, 100)));
        set.put(Arc::new(entry(7, 90, 100)));
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(7).unwrap().free(), 90);
    }
}
