//! Management Surface: the three catalogue-style functions operators
//! use to inspect and manually resolve in-doubt foreign transactions.

use pgrx::{pg_extern, iter::TableIterator};

use crate::resolver::{self, RealClogInspector};
use crate::{shmem, spill, wal};

/// `pg_prepared_fdw_xacts() → rows { dbid, xid, serverId, userId,
/// status_text, prepareId }` — enumerate every in-doubt entry.
#[pg_extern]
fn pg_prepared_fdw_xacts() -> TableIterator<
    'static,
    (
        pgrx::name!(dbid, pgrx::pg_sys::Oid),
        pgrx::name!(xid, i64),
        pgrx::name!(server_id, pgrx::pg_sys::Oid),
        pgrx::name!(user_id, pgrx::pg_sys::Oid),
        pgrx::name!(status, String),
        pgrx::name!(prepare_id, String),
    ),
> {
    let rows: Vec<_> = {
        let table = shmem::table().share();
        table
            .all_in_use()
            .map(|(_, e)| {
                (
                    e.key.dbid,
                    e.key.local_xid as i64,
                    e.key.server_id,
                    e.key.user_id,
                    e.status.as_text().to_string(),
                    String::from_utf8_lossy(e.prepare_id.as_bytes()).into_owned(),
                )
            })
            .collect()
    };
    TableIterator::new(rows)
}

/// `pg_resolve_fdw_xact(xid, serverId, userId) → bool` — force
/// resolution of one entry right now, using the same outcome rule as the
/// Resolver worker.
#[pg_extern]
fn pg_resolve_fdw_xact(xid: i64, server_id: pgrx::pg_sys::Oid, user_id: pgrx::pg_sys::Oid) -> bool {
    let dbid = unsafe { pgrx::pg_sys::MyDatabaseId };
    let key = crate::model::FxactKey { dbid, local_xid: xid as pgrx::pg_sys::TransactionId, server_id, user_id };

    let status = {
        let table = shmem::table().share();
        match table.find_index(key) {
            Some(idx) => table.get(idx).status,
            None => return false,
        }
    };

    let inspector = RealClogInspector;
    let outcome = match resolver::decide_outcome(status, key.local_xid, &inspector) {
        Ok(is_commit) => is_commit,
        Err(_) => return false,
    };

    let base_dir = spill::data_dir();
    resolver::resolve_entry(&base_dir, key, outcome).is_ok()
}

/// `pg_remove_fdw_xact(xid, serverId, userId) → void` — forget an entry
/// without resolving it; an operator escape hatch for an entry whose
/// remote side is known (by other means) to already be gone.
///
/// Pairs the table removal with a WAL REMOVE record, the same as
/// `resolver::resolve_entry`: without it, a crash between this call and
/// the next checkpoint would leave the original INSERT uncountered, and
/// replay would resurrect the entry the operator just forgot.
#[pg_extern]
fn pg_remove_fdw_xact(xid: i64, server_id: pgrx::pg_sys::Oid, user_id: pgrx::pg_sys::Oid) {
    let dbid = unsafe { pgrx::pg_sys::MyDatabaseId };
    let key = crate::model::FxactKey { dbid, local_xid: xid as pgrx::pg_sys::TransactionId, server_id, user_id };

    let existed = {
        let mut table = shmem::table().exclusive();
        match table.find_index(key) {
            Some(idx) => {
                table.remove(idx);
                true
            }
            None => false,
        }
    };
    shmem::refresh_oldest_unresolved_xmin();

    if existed {
        let remove_record = wal::RemoveRecord {
            dbid: key.dbid.to_u32(),
            xid: key.local_xid as u64,
            server_id: key.server_id.to_u32(),
            user_id: key.user_id.to_u32(),
        };
        if let Err(e) = wal::emit_remove(&remove_record) {
            pgrx::warning!("pg_fxm: failed to emit REMOVE record for forgotten entry: {e}");
        }
    }

    let base_dir = spill::data_dir();
    let _ = spill::remove_entry(&base_dir, key);
}

#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod tests {
    use super::*;
    use pgrx::prelude::*;

    #[pg_test]
    fn test_pg_prepared_fdw_xacts_empty_by_default() {
        let count = Spi::get_one::<i64>("SELECT count(*) FROM pg_prepared_fdw_xacts()").unwrap().unwrap();
        assert_eq!(count, 0);
    }

    #[pg_test]
    fn test_pg_resolve_fdw_xact_missing_entry_returns_false() {
        let result = Spi::get_one::<bool>("SELECT pg_resolve_fdw_xact(1, 1, 1)").unwrap().unwrap();
        assert!(!result);
    }

    #[pg_test]
    fn test_pg_remove_fdw_xact_missing_entry_is_noop() {
        Spi::run("SELECT pg_remove_fdw_xact(1, 1, 1)").unwrap();
    }
}
