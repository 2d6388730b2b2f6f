//! The shared-memory foreign transaction table: a
//! fixed-capacity array of `FxactEntry` slots plus an intrusive
//! index-based free list, protected by the single rwlock in
//! `shmem::FXM_TABLE`.
//!
//! Everything here is plain old data — no pointers, no heap allocation —
//! because it has to be `Copy` to live inside a `PgLwLock<T>` and be
//! meaningful to every backend that maps the same shared memory segment.
//! Position-independence is why the free list and wait-queue links are
//! slot indices (`u32`) rather than pointers.

use pgrx::pg_sys;

use crate::model::{FxactKey, FxactStatus, PrepareId, FXM_SHMEM_CAPACITY, NO_BACKEND};

/// Sentinel meaning "no next slot" in an index-based linked list.
pub const INVALID_INDEX: u32 = u32::MAX;

/// One shared-memory slot: the durable, cross-backend record of a
/// foreign transaction participant. Mirrors `FdwXactData` in
/// `fdwxact.h`.
#[derive(Clone, Copy)]
pub struct FxactEntry {
    pub in_use: bool,
    pub key: FxactKey,
    pub status: FxactStatus,
    /// Backend currently operating on this entry, or `NO_BACKEND`.
    pub owning_backend: i32,
    pub prepare_id: PrepareId,
    /// Set while a backend is inside an FDW callback for this entry; a
    /// crash or error mid-callback leaves this true so the resolver knows
    /// the remote side's state is unknown and must reconnect before
    /// trusting `status`.
    pub changing_state: bool,
    /// Start/end LSN of this entry's WAL INSERT record, set once
    /// `wal::emit_insert` returns. Needed to decide checkpoint
    /// eligibility: an entry can only be spilled once its INSERT record's
    /// `insert_end_lsn` is behind the checkpoint's redo horizon.
    pub insert_start_lsn: u64,
    pub insert_end_lsn: u64,
    /// Set once the INSERT record backing this entry is flushed; an entry
    /// with `valid == false` is still being prepared and must not be
    /// spilled or resolved yet.
    pub valid: bool,
    /// Set once this entry has been written to the on-disk spill store and
    /// its WAL INSERT record is eligible for recycling.
    pub on_disk: bool,
    /// Set on an entry reinstated by `spill::restore` during crash
    /// recovery, before redo has replayed far enough to confirm its
    /// final outcome.
    pub in_redo: bool,
    /// Link to the next free slot, or `INVALID_INDEX`.
    next_free: u32,
}

impl FxactEntry {
    fn empty() -> Self {
        FxactEntry {
            in_use: false,
            key: FxactKey {
                dbid: pg_sys::Oid::from(0u32),
                local_xid: 0,
                server_id: pg_sys::Oid::from(0u32),
                user_id: pg_sys::Oid::from(0u32),
            },
            status: FxactStatus::Initial,
            owning_backend: NO_BACKEND,
            prepare_id: PrepareId { len: 0, bytes: [0u8; crate::model::FXACT_ID_MAX_LEN] },
            changing_state: false,
            insert_start_lsn: 0,
            insert_end_lsn: 0,
            valid: false,
            on_disk: false,
            in_redo: false,
            next_free: INVALID_INDEX,
        }
    }
}

/// The fixed-capacity table itself: `FXM_SHMEM_CAPACITY` slots plus a
/// free-list head, all `Copy` so the whole struct fits in a
/// `PgLwLock<FxactTable>`.
#[derive(Clone, Copy)]
pub struct FxactTable {
    entries: [FxactEntry; FXM_SHMEM_CAPACITY],
    free_head: u32,
    /// Slots actually in use; `<=` the operator-configured
    /// `max_prepared_foreign_transactions` sub-limit.
    used: u32,
}

impl FxactTable {
    /// Build a freshly-initialized table with every slot linked into the
    /// free list. Used as this type's `Default`, which `pg_shmem_init!`
    /// invokes once per postmaster startup.
    pub fn init() -> Self {
        let mut entries = [FxactEntry::empty(); FXM_SHMEM_CAPACITY];
        for (i, entry) in entries.iter_mut().enumerate() {
            entry.next_free = if i + 1 < FXM_SHMEM_CAPACITY { (i + 1) as u32 } else { INVALID_INDEX };
        }
        FxactTable { entries, free_head: 0, used: 0 }
    }

    /// Insert a new entry, honoring the runtime sub-limit configured by
    /// `pg_fxm.max_prepared_foreign_transactions`. Returns the slot index.
    pub fn insert(&mut self, key: FxactKey, runtime_max: u32) -> crate::error::FxmResult<u32> {
        if self.find_index(key).is_some() {
            return Err(crate::error::FxmError::DuplicateKey {
                server_id: key.server_id.to_u32(),
                user_id: key.user_id.to_u32(),
            });
        }
        if self.used >= runtime_max || self.free_head == INVALID_INDEX {
            return Err(crate::error::FxmError::CapacityExhausted { configured_max: runtime_max });
        }
        let idx = self.free_head;
        let slot = &mut self.entries[idx as usize];
        self.free_head = slot.next_free;
        *slot = FxactEntry::empty();
        slot.in_use = true;
        slot.key = key;
        slot.owning_backend = NO_BACKEND;
        self.used += 1;
        Ok(idx)
    }

    /// Release a slot back to the free list.
    pub fn remove(&mut self, idx: u32) {
        let slot = &mut self.entries[idx as usize];
        if !slot.in_use {
            return;
        }
        *slot = FxactEntry::empty();
        slot.next_free = self.free_head;
        self.free_head = idx;
        self.used -= 1;
    }

    pub fn find_index(&self, key: FxactKey) -> Option<u32> {
        self.entries
            .iter()
            .enumerate()
            .find(|(_, e)| e.in_use && e.key == key)
            .map(|(i, _)| i as u32)
    }

    pub fn get(&self, idx: u32) -> &FxactEntry {
        &self.entries[idx as usize]
    }

    pub fn get_mut(&mut self, idx: u32) -> &mut FxactEntry {
        &mut self.entries[idx as usize]
    }

    /// All in-use entries, for `pg_prepared_fdw_xacts()` and the resolver
    /// scan.
    pub fn all_in_use(&self) -> impl Iterator<Item = (u32, &FxactEntry)> {
        self.entries.iter().enumerate().filter(|(_, e)| e.in_use).map(|(i, e)| (i as u32, e))
    }

    /// Entries eligible for checkpoint-time spilling: valid (or still
    /// reinstated mid-redo) but not yet on disk, whose INSERT record's end
    /// LSN is behind `redo_horizon`.
    pub fn spill_eligible(&self, redo_horizon: u64) -> impl Iterator<Item = (u32, &FxactEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter(move |(_, e)| e.in_use && (e.valid || e.in_redo) && !e.on_disk && e.insert_end_lsn <= redo_horizon)
            .map(|(i, e)| (i as u32, e))
    }

    /// Oldest local transaction id among entries belonging to `dbid`,
    /// used to compute the database's effective resolution horizon for
    /// checkpoint eligibility / vacuum-horizon interaction.
    pub fn oldest_local_xid(&self, dbid: pg_sys::Oid) -> Option<pg_sys::TransactionId> {
        self.entries
            .iter()
            .filter(|e| e.in_use && e.key.dbid == dbid)
            .map(|e| e.key.local_xid)
            .min()
    }

    /// Oldest local transaction id across every database, instance-wide.
    /// Mirrors `oldest_local_xid` but unfiltered; cached in
    /// `shmem::GLOBAL_OLDEST_UNRESOLVED_XMIN` so it can be read without
    /// taking the table lock.
    pub fn oldest_local_xid_global(&self) -> Option<pg_sys::TransactionId> {
        self.entries.iter().filter(|e| e.in_use).map(|e| e.key.local_xid).min()
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn capacity(&self) -> usize {
        FXM_SHMEM_CAPACITY
    }
}

impl Default for FxactTable {
    fn default() -> Self {
        FxactTable::init()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FxmError;

    fn key(server: u32, user: u32, xid: u32) -> FxactKey {
        FxactKey {
            dbid: pg_sys::Oid::from(1u32),
            local_xid: xid as pg_sys::TransactionId,
            server_id: pg_sys::Oid::from(server),
            user_id: pg_sys::Oid::from(user),
        }
    }

    #[test]
    fn test_insert_and_find() {
        let mut t = FxactTable::init();
        let idx = t.insert(key(1, 1, 100), 10).unwrap();
        assert_eq!(t.used(), 1);
        assert_eq!(t.find_index(key(1, 1, 100)), Some(idx));
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut t = FxactTable::init();
        t.insert(key(1, 1, 100), 10).unwrap();
        let result = t.insert(key(1, 1, 100), 10);
        assert!(matches!(result, Err(FxmError::DuplicateKey { .. })));
    }

    #[test]
    fn test_capacity_exhausted_at_runtime_max() {
        let mut t = FxactTable::init();
        t.insert(key(1, 1, 100), 1).unwrap();
        let result = t.insert(key(2, 1, 101), 1);
        assert!(matches!(result, Err(FxmError::CapacityExhausted { configured_max: 1 })));
    }

    #[test]
    fn test_remove_returns_slot_to_free_list() {
        let mut t = FxactTable::init();
        let idx = t.insert(key(1, 1, 100), 10).unwrap();
        t.remove(idx);
        assert_eq!(t.used(), 0);
        let idx2 = t.insert(key(2, 1, 101), 10).unwrap();
        assert_eq!(idx2, idx);
    }

    #[test]
    fn test_oldest_local_xid() {
        let mut t = FxactTable::init();
        t.insert(key(1, 1, 500), 10).unwrap();
        t.insert(key(2, 1, 100), 10).unwrap();
        t.insert(key(3, 1, 300), 10).unwrap();
        let dbid = pg_sys::Oid::from(1u32);
        assert_eq!(t.oldest_local_xid(dbid), Some(100));
    }

    #[test]
    fn test_oldest_local_xid_global_spans_databases() {
        let mut t = FxactTable::init();
        t.insert(FxactKey { dbid: pg_sys::Oid::from(1u32), local_xid: 500, server_id: pg_sys::Oid::from(1u32), user_id: pg_sys::Oid::from(1u32) }, 10).unwrap();
        t.insert(FxactKey { dbid: pg_sys::Oid::from(2u32), local_xid: 50, server_id: pg_sys::Oid::from(1u32), user_id: pg_sys::Oid::from(1u32) }, 10).unwrap();
        assert_eq!(t.oldest_local_xid_global(), Some(50));
    }

    #[test]
    fn test_all_in_use_excludes_free_slots() {
        let mut t = FxactTable::init();
        t.insert(key(1, 1, 100), 10).unwrap();
        let idx2 = t.insert(key(2, 1, 101), 10).unwrap();
        t.remove(idx2);
        assert_eq!(t.all_in_use().count(), 1);
    }

    #[test]
    fn test_spill_eligible_requires_valid_not_on_disk_and_horizon() {
        let mut t = FxactTable::init();
        let idx = t.insert(key(1, 1, 100), 10).unwrap();
        t.get_mut(idx).valid = true;
        t.get_mut(idx).insert_end_lsn = 500;
        assert_eq!(t.spill_eligible(1000).count(), 1);
        assert_eq!(t.spill_eligible(100).count(), 0);

        t.get_mut(idx).on_disk = true;
        assert_eq!(t.spill_eligible(1000).count(), 0);
    }

    #[test]
    fn test_spill_eligible_excludes_not_yet_valid() {
        let mut t = FxactTable::init();
        let idx = t.insert(key(1, 1, 100), 10).unwrap();
        t.get_mut(idx).insert_end_lsn = 0;
        assert_eq!(t.spill_eligible(1000).count(), 0);
    }
}
