//! Shared memory layout for the foreign transaction manager: one
//! `PgLwLock`-protected table of participant entries, one
//! `PgLwLock`-protected wait queue, and an atomic tracking the oldest
//! unresolved local xid across the whole instance. All three are
//! registered from `_PG_init` via `pg_shmem_init!`, the same way pgrx
//! extensions wire up any shared state that must outlive a single
//! backend.

pub mod queue;
pub mod table;

use pgrx::{pg_shmem_init, PgAtomic, PgLwLock};
use std::sync::atomic::AtomicU32;

pub use queue::WaitQueue;
pub use table::FxactTable;

/// The foreign transaction table: one rwlock guarding the whole
/// fixed-capacity arena. A single lock (rather than per-entry locks)
/// mirrors the original `FdwXactLock` design — contention is expected to
/// be low since it's only held briefly around table mutation, not for
/// the duration of an FDW call.
#[allow(non_upper_case_globals)]
static FXM_TABLE: PgLwLock<FxactTable> = PgLwLock::new();

/// Backends waiting on resolution, and the resolver's retry queue.
#[allow(non_upper_case_globals)]
static FXM_WAIT_QUEUE: PgLwLock<WaitQueue> = PgLwLock::new();

/// Oldest local xid with an unresolved foreign transaction, instance-wide.
/// Read by vacuum-horizon-adjacent code without needing the table lock;
/// written by the resolver whenever it finishes or the table changes.
#[allow(non_upper_case_globals)]
static GLOBAL_OLDEST_UNRESOLVED_XMIN: PgAtomic<AtomicU32> = PgAtomic::new();

/// Register all shared-memory structures. Must be called from
/// `_PG_init()`, before `shmem_startup_hook` fires.
pub fn init() {
    pg_shmem_init!(FXM_TABLE);
    pg_shmem_init!(FXM_WAIT_QUEUE);
    pg_shmem_init!(GLOBAL_OLDEST_UNRESOLVED_XMIN);
}

pub fn table() -> &'static PgLwLock<FxactTable> {
    &FXM_TABLE
}

pub fn wait_queue() -> &'static PgLwLock<WaitQueue> {
    &FXM_WAIT_QUEUE
}

pub fn oldest_unresolved_xmin() -> &'static PgAtomic<AtomicU32> {
    &GLOBAL_OLDEST_UNRESOLVED_XMIN
}

/// Recompute and cache the instance-wide oldest unresolved xid from the
/// current table contents. Called after every insert/remove so readers
/// of `oldest_unresolved_xmin()` don't need the table lock.
///
/// Informational only: nothing in this crate feeds it to Postgres's
/// actual vacuum horizon, since `pgrx` exposes no hook for that (the
/// same category of gap as the checkpoint-trigger substitution in
/// `spill.rs`/`resolver.rs`).
pub fn refresh_oldest_unresolved_xmin() {
    let oldest = table().share().oldest_local_xid_global().unwrap_or(0);
    oldest_unresolved_xmin().get().store(oldest, std::sync::atomic::Ordering::Relaxed);
}
