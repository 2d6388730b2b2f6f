//! Transaction-event glue: FXM exposes an `on_event(kind)` dispatcher
//! that PostgreSQL's transaction manager drives through the standard
//! `RegisterXactCallback` FFI, using the same mechanism and event-code
//! mapping as PostgreSQL's own commit/abort hooks elsewhere.

use std::os::raw::c_void;

use pgrx::pg_sys;

use crate::{orchestrator, participant};

/// Mirrors the subset of `pg_sys::XactEvent` this manager cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum XactEvent {
    Start,
    PreCommit,
    Commit,
    Abort,
    Prepare,
}

/// Install the transaction-event callback. Call once from `_PG_init()`.
pub unsafe fn register_xact_callback() {
    pg_sys::RegisterXactCallback(Some(fxm_xact_callback), std::ptr::null_mut());
}

/// # Safety
/// Invoked by PostgreSQL's transaction manager as an `extern "C"`
/// callback; must not panic or unwind across the FFI boundary. Errors
/// from `pre_commit` are intentionally allowed to propagate through
/// `pgrx::error!`-style longjmp so a PRE_COMMIT failure aborts the
/// local transaction.
#[no_mangle]
unsafe extern "C" fn fxm_xact_callback(event: u32, _arg: *mut c_void) {
    let xact_event = match event {
        3 => XactEvent::Start,     // XACT_EVENT_START
        1 => XactEvent::PreCommit, // XACT_EVENT_PRE_COMMIT
        0 => XactEvent::Commit,    // XACT_EVENT_COMMIT
        2 => XactEvent::Abort,     // XACT_EVENT_ABORT
        4 => XactEvent::Prepare,   // XACT_EVENT_PREPARE
        _ => return,
    };

    match xact_event {
        XactEvent::Start => {
            // Defensive: a pooled connection must not inherit a prior
            // session's participant list.
            participant::forget_all();
        }
        XactEvent::PreCommit => {
            if participant::count() == 0 {
                return;
            }
            let local_xid = unsafe { pg_sys::GetCurrentTransactionIdIfAny() };
            let dbid = unsafe { pg_sys::MyDatabaseId };
            if let Err(e) = orchestrator::pre_commit(local_xid, dbid) {
                pgrx::error!("foreign transaction prepare failed: {e}");
            }
        }
        XactEvent::Commit => {
            let local_xid = unsafe { pg_sys::GetCurrentTransactionIdIfAny() };
            let dbid = unsafe { pg_sys::MyDatabaseId };
            if orchestrator::on_local_xact_end(local_xid, dbid, true) {
                wait_then_warn(local_xid);
            }
        }
        XactEvent::Abort => {
            let local_xid = unsafe { pg_sys::GetCurrentTransactionIdIfAny() };
            let dbid = unsafe { pg_sys::MyDatabaseId };
            if orchestrator::on_local_xact_end(local_xid, dbid, false) {
                wait_then_warn(local_xid);
            }
        }
        XactEvent::Prepare => {
            // A foreign-transaction-prepared local xid going through
            // PREPARE TRANSACTION itself (cross-coordinator recovery)
            // is out of scope; nothing to do.
        }
    }
}

/// Block until the Resolver confirms every
/// participant of `local_xid` reached a terminal state. The local
/// commit/abort is already durable by this point, so a cancellation or
/// timeout here is only ever a warning, never an error that could make
/// the client think the transaction didn't go through.
fn wait_then_warn(local_xid: pg_sys::TransactionId) {
    if let Err(e) = orchestrator::wait_for_resolution(local_xid) {
        pgrx::warning!("{e}");
    }
}
