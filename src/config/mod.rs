//! Configuration: GUC-based settings for the foreign transaction manager.
//!
//! All five options are registered here as PostgreSQL GUCs, following
//! the same `GucRegistry::define_*_guc` pattern used throughout this
//! crate:
//!
//! - `pg_fxm.max_prepared_foreign_transactions` (`PGC_POSTMASTER`): shared
//!   memory table capacity; 0 disables the manager entirely.
//! - `pg_fxm.max_foreign_transaction_resolvers` (`PGC_POSTMASTER`):
//!   resolver worker pool size.
//! - `pg_fxm.foreign_transaction_resolution_retry_interval` (`PGC_SIGHUP`,
//!   milliseconds): delay between retry-queue sweeps.
//! - `pg_fxm.foreign_transaction_resolver_timeout` (`PGC_SIGHUP`,
//!   milliseconds): deadline for an FDW `resolve` call.
//! - `pg_fxm.distributed_atomic_commit` (`PGC_USERSET`, enum): disabled /
//!   prefer / required.

use pgrx::{GucContext, GucFlags, GucRegistry, GucSetting};

use crate::model::DurabilityPolicy;

static MAX_PREPARED_FOREIGN_TRANSACTIONS: GucSetting<i32> = GucSetting::<i32>::new(0);
static MAX_FOREIGN_TRANSACTION_RESOLVERS: GucSetting<i32> = GucSetting::<i32>::new(2);
static FOREIGN_TRANSACTION_RESOLUTION_RETRY_INTERVAL: GucSetting<i32> = GucSetting::<i32>::new(5_000);
static FOREIGN_TRANSACTION_RESOLVER_TIMEOUT: GucSetting<i32> = GucSetting::<i32>::new(30_000);
static DISTRIBUTED_ATOMIC_COMMIT: GucSetting<i32> = GucSetting::<i32>::new(1); // prefer

/// Register all `pg_fxm` GUC variables. Must be called from `_PG_init()`.
pub fn register_gucs() {
    GucRegistry::define_int_guc(
        c"pg_fxm.max_prepared_foreign_transactions",
        c"Maximum number of foreign transactions that can be in prepared state",
        c"Zero disables the foreign transaction manager entirely. Requires restart.",
        &MAX_PREPARED_FOREIGN_TRANSACTIONS,
        0,
        crate::model::FXM_SHMEM_CAPACITY as i32,
        GucContext::Postmaster,
        GucFlags::default(),
    );

    GucRegistry::define_int_guc(
        c"pg_fxm.max_foreign_transaction_resolvers",
        c"Maximum number of foreign transaction resolver background workers",
        c"One dispatcher plus up to this many per-database resolver workers. Requires restart.",
        &MAX_FOREIGN_TRANSACTION_RESOLVERS,
        0,
        64,
        GucContext::Postmaster,
        GucFlags::default(),
    );

    GucRegistry::define_int_guc(
        c"pg_fxm.foreign_transaction_resolution_retry_interval",
        c"Milliseconds between retry-queue sweeps by resolver workers",
        c"Backends whose foreign transaction resolution failed are retried at this interval.",
        &FOREIGN_TRANSACTION_RESOLUTION_RETRY_INTERVAL,
        1,
        3_600_000,
        GucContext::Sighup,
        GucFlags::default(),
    );

    GucRegistry::define_int_guc(
        c"pg_fxm.foreign_transaction_resolver_timeout",
        c"Milliseconds before an FDW resolve() call is treated as timed out",
        c"On timeout the connection is marked unsalvageable and reconnected on the next attempt.",
        &FOREIGN_TRANSACTION_RESOLVER_TIMEOUT,
        1,
        3_600_000,
        GucContext::Sighup,
        GucFlags::default(),
    );

    GucRegistry::define_int_guc(
        c"pg_fxm.distributed_atomic_commit",
        c"Atomic commit level across foreign servers: 0=disabled, 1=prefer, 2=required",
        c"disabled: never use 2PC. prefer: use 2PC where the server supports it. required: error if any modified server lacks 2PC support.",
        &DISTRIBUTED_ATOMIC_COMMIT,
        0,
        2,
        GucContext::Userset,
        GucFlags::default(),
    );
}

/// Table capacity configured by the operator (0 disables the manager).
pub fn max_prepared_foreign_transactions() -> u32 {
    MAX_PREPARED_FOREIGN_TRANSACTIONS.get().max(0) as u32
}

/// Whether the foreign transaction manager is enabled at all.
pub fn fxm_enabled() -> bool {
    max_prepared_foreign_transactions() > 0
}

pub fn max_foreign_transaction_resolvers() -> u32 {
    MAX_FOREIGN_TRANSACTION_RESOLVERS.get().max(0) as u32
}

pub fn resolution_retry_interval_ms() -> u64 {
    FOREIGN_TRANSACTION_RESOLUTION_RETRY_INTERVAL.get().max(1) as u64
}

pub fn resolver_timeout_ms() -> u64 {
    FOREIGN_TRANSACTION_RESOLVER_TIMEOUT.get().max(1) as u64
}

pub fn distributed_atomic_commit() -> DurabilityPolicy {
    DurabilityPolicy::from_guc(DISTRIBUTED_ATOMIC_COMMIT.get())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(max_prepared_foreign_transactions(), 0);
        assert!(!fxm_enabled());
        assert_eq!(max_foreign_transaction_resolvers(), 2);
        assert_eq!(resolution_retry_interval_ms(), 5_000);
        assert_eq!(resolver_timeout_ms(), 30_000);
        assert_eq!(distributed_atomic_commit(), DurabilityPolicy::Prefer);
    }

    #[test]
    fn test_durability_policy_from_guc() {
        assert_eq!(DurabilityPolicy::from_guc(0), DurabilityPolicy::Disabled);
        assert_eq!(DurabilityPolicy::from_guc(1), DurabilityPolicy::Prefer);
        assert_eq!(DurabilityPolicy::from_guc(2), DurabilityPolicy::Required);
    }
}
