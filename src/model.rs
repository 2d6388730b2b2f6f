//! Shared data-model types used across the foreign transaction manager:
//! transaction status, durability policy, and the small numeric aliases
//! that tie shared-memory entries back to Postgres OIDs and transaction
//! ids.

use pgrx::pg_sys;

/// Maximum length of a prepare id, excluding the NUL terminator. A
/// prepare id longer than this is rejected rather than silently
/// truncated.
pub const FXACT_ID_MAX_LEN: usize = 200;

/// Compile-time ceiling on the number of in-flight/in-doubt foreign
/// transaction entries the shared-memory table can ever hold. The
/// `pg_fxm.max_prepared_foreign_transactions` GUC enforces a runtime
/// sub-limit within this fixed arena.
pub const FXM_SHMEM_CAPACITY: usize = 1024;

/// Compile-time ceiling on the number of backends that may be waiting on
/// foreign-transaction resolution at once.
pub const FXM_WAIT_QUEUE_CAPACITY: usize = 1024;

/// The state of a prepared (or being-prepared) foreign transaction.
///
/// Transitions form a DAG: Initial -> Preparing -> Prepared ->
/// (CommittingPrepared | AbortingPrepared) -> removed.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FxactStatus {
    Initial = 0,
    Preparing = 1,
    Prepared = 2,
    CommittingPrepared = 3,
    AbortingPrepared = 4,
}

impl FxactStatus {
    pub fn as_text(self) -> &'static str {
        match self {
            FxactStatus::Initial => "initial",
            FxactStatus::Preparing => "preparing",
            FxactStatus::Prepared => "prepared",
            FxactStatus::CommittingPrepared => "committing prepared",
            FxactStatus::AbortingPrepared => "aborting prepared",
        }
    }
}

/// `distributed-atomic-commit` GUC values.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityPolicy {
    Disabled = 0,
    Prefer = 1,
    Required = 2,
}

impl DurabilityPolicy {
    pub fn from_guc(v: i32) -> Self {
        match v {
            0 => DurabilityPolicy::Disabled,
            1 => DurabilityPolicy::Prefer,
            _ => DurabilityPolicy::Required,
        }
    }
}

/// A unique key identifying a foreign transaction participant:
/// (dbid, local xid, foreign server, user).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FxactKey {
    pub dbid: pg_sys::Oid,
    pub local_xid: pg_sys::TransactionId,
    pub server_id: pg_sys::Oid,
    pub user_id: pg_sys::Oid,
}

/// No backend currently holds this entry (dangling).
pub const NO_BACKEND: i32 = -1;

/// `prepareId` bytes plus an explicit length; avoids a heap-owning
/// `String` so this fits directly into shared memory.
#[derive(Clone, Copy)]
pub struct PrepareId {
    pub len: u8,
    pub bytes: [u8; FXACT_ID_MAX_LEN],
}

impl PrepareId {
    pub fn empty() -> Self {
        PrepareId { len: 0, bytes: [0u8; FXACT_ID_MAX_LEN] }
    }

    pub fn from_slice(s: &[u8]) -> Option<Self> {
        if s.len() > FXACT_ID_MAX_LEN {
            return None;
        }
        let mut bytes = [0u8; FXACT_ID_MAX_LEN];
        bytes[..s.len()].copy_from_slice(s);
        Some(PrepareId { len: s.len() as u8, bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl std::fmt::Debug for PrepareId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.as_bytes()))
    }
}
