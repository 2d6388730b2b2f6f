//! The wait queue: backends waiting for their own foreign
//! transactions to be resolved, plus the retry queue of dangling entries
//! a resolver worker has not yet managed to resolve. Both are
//! fixed-capacity, index-linked lists for the same position-independence
//! reason as `shmem::table`.

use pgrx::pg_sys;

use crate::model::FXM_WAIT_QUEUE_CAPACITY;

pub const INVALID_INDEX: u32 = u32::MAX;

/// One backend's latch-wait on a specific local transaction's foreign
/// resolution, mirroring `FdwXactParticipant` waiter linkage in
/// `fdwxact.c`'s proc array walk.
#[derive(Clone, Copy)]
pub struct WaitRecord {
    pub in_use: bool,
    pub local_xid: pg_sys::TransactionId,
    pub backend_id: i32,
    pub is_commit: bool,
    /// Set by the resolver once every participant for `local_xid` has
    /// reached a terminal state; the waiting backend polls this after
    /// waking from its latch.
    pub resolved: bool,
    next_free: u32,
}

impl WaitRecord {
    fn empty() -> Self {
        WaitRecord {
            in_use: false,
            local_xid: 0,
            backend_id: crate::model::NO_BACKEND,
            is_commit: false,
            resolved: false,
            next_free: INVALID_INDEX,
        }
    }
}

#[derive(Clone, Copy)]
pub struct WaitQueue {
    records: [WaitRecord; FXM_WAIT_QUEUE_CAPACITY],
    free_head: u32,
}

impl WaitQueue {
    pub fn init() -> Self {
        let mut records = [WaitRecord::empty(); FXM_WAIT_QUEUE_CAPACITY];
        for (i, r) in records.iter_mut().enumerate() {
            r.next_free = if i + 1 < FXM_WAIT_QUEUE_CAPACITY { (i + 1) as u32 } else { INVALID_INDEX };
        }
        WaitQueue { records, free_head: 0 }
    }

    /// Enqueue a wait for `local_xid`'s resolution. Returns the slot
    /// index, or `None` if the queue is full (the caller falls back to
    /// polling on a timeout rather than blocking indefinitely).
    pub fn enqueue(&mut self, local_xid: pg_sys::TransactionId, backend_id: i32, is_commit: bool) -> Option<u32> {
        if self.free_head == INVALID_INDEX {
            return None;
        }
        let idx = self.free_head;
        let slot = &mut self.records[idx as usize];
        self.free_head = slot.next_free;
        *slot = WaitRecord::empty();
        slot.in_use = true;
        slot.local_xid = local_xid;
        slot.backend_id = backend_id;
        slot.is_commit = is_commit;
        Some(idx)
    }

    pub fn dequeue(&mut self, idx: u32) {
        let slot = &mut self.records[idx as usize];
        if !slot.in_use {
            return;
        }
        *slot = WaitRecord::empty();
        slot.next_free = self.free_head;
        self.free_head = idx;
    }

    /// Mark every waiter on `local_xid` as resolved; the resolver calls
    /// this after driving all of that xid's participants to a terminal
    /// state, then wakes each waiter's latch.
    pub fn mark_resolved(&mut self, local_xid: pg_sys::TransactionId) -> Vec<i32> {
        let mut woken = Vec::new();
        for r in self.records.iter_mut() {
            if r.in_use && r.local_xid == local_xid && !r.resolved {
                r.resolved = true;
                woken.push(r.backend_id);
            }
        }
        woken
    }

    pub fn get(&self, idx: u32) -> &WaitRecord {
        &self.records[idx as usize]
    }

    pub fn waiters_for(&self, local_xid: pg_sys::TransactionId) -> impl Iterator<Item = &WaitRecord> {
        self.records.iter().filter(move |r| r.in_use && r.local_xid == local_xid)
    }

    /// Slot index of this backend's own wait record for `local_xid`, if any.
    pub fn index_of(&self, local_xid: pg_sys::TransactionId, backend_id: i32) -> Option<u32> {
        self.records
            .iter()
            .enumerate()
            .find(|(_, r)| r.in_use && r.local_xid == local_xid && r.backend_id == backend_id)
            .map(|(i, _)| i as u32)
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        WaitQueue::init()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_dequeue_roundtrip() {
        let mut q = WaitQueue::init();
        let idx = q.enqueue(42, 7, true).unwrap();
        assert!(q.get(idx).in_use);
        q.dequeue(idx);
        assert!(!q.get(idx).in_use);
    }

    #[test]
    fn test_mark_resolved_wakes_matching_waiters_only() {
        let mut q = WaitQueue::init();
        q.enqueue(42, 1, true).unwrap();
        q.enqueue(42, 2, true).unwrap();
        q.enqueue(99, 3, true).unwrap();
        let mut woken = q.mark_resolved(42);
        woken.sort();
        assert_eq!(woken, vec![1, 2]);
        assert_eq!(q.waiters_for(99).count(), 1);
    }

    #[test]
    fn test_index_of_finds_own_slot() {
        let mut q = WaitQueue::init();
        let idx = q.enqueue(42, 7, true).unwrap();
        assert_eq!(q.index_of(42, 7), Some(idx));
        assert_eq!(q.index_of(42, 8), None);
        assert_eq!(q.index_of(7, 7), None);
    }

    #[test]
    fn test_queue_full_returns_none() {
        let mut q = WaitQueue::init();
        for i in 0..FXM_WAIT_QUEUE_CAPACITY {
            assert!(q.enqueue(i as u32, i as i32, true).is_some());
        }
        assert!(q.enqueue(99999, 1, true).is_none());
    }
}
