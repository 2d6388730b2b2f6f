//! Participant Registry: the per-transaction, backend-local record of
//! which foreign servers the current local transaction has touched.
//! Modeled as thread-local state, mirroring how other per-transaction
//! state (refresh queues, savepoint depth) is tracked elsewhere in this
//! codebase — each backend is its own OS thread under pgrx, so
//! `thread_local!` gives the transaction-scoped lifetime for free: it's
//! cleared at both commit and abort, never leaking into the next
//! transaction.

use std::cell::RefCell;

use pgrx::pg_sys;
use pgrx::Spi;

use crate::fdw;
use crate::model::{FxactStatus, PrepareId};

/// One foreign server touched by the current transaction.
#[derive(Debug, Clone)]
pub struct Participant {
    pub server_id: pg_sys::Oid,
    pub server_name: String,
    pub user_id: pg_sys::Oid,
    pub user_mapping_id: pg_sys::Oid,
    /// Whether the FDW declared 2PC support for this participant at
    /// registration time.
    pub two_phase_capable: bool,
    /// Set once `prepare` succeeds for this participant.
    pub prepare_id: Option<PrepareId>,
    pub status: FxactStatus,
    /// True once this participant's data has actually been written to in
    /// the current transaction (vs. merely connected-to); drives the
    /// durable-write-flag logic of the `prefer` policy.
    pub modified: bool,
}

thread_local! {
    static PARTICIPANTS: RefCell<Vec<Participant>> = const { RefCell::new(Vec::new()) };
}

/// Register (or find) the participant for `server_id` within the
/// current transaction. Mirrors `GetFdwXactParticipant`; repeated
/// registrations for the same server are no-ops.
pub fn register(
    server_id: pg_sys::Oid,
    server_name: &str,
    user_id: pg_sys::Oid,
    user_mapping_id: pg_sys::Oid,
    two_phase_capable: bool,
) {
    PARTICIPANTS.with(|p| {
        let mut participants = p.borrow_mut();
        if participants.iter().any(|e| e.server_id == server_id && e.user_id == user_id) {
            return;
        }
        participants.push(Participant {
            server_id,
            server_name: server_name.to_string(),
            user_id,
            user_mapping_id,
            two_phase_capable,
            prepare_id: None,
            status: FxactStatus::Initial,
            modified: false,
        });
    });
}

/// `registerByRelation(relationId, modified)`: resolve
/// the relation to its foreign server and user mapping via the
/// catalogue, probe the FDW for 2PC capability, and register (or
/// update) the participant. If the FDW lacks a `prepare` callback the
/// participant is still registered — marked non-2PC-capable — so a
/// single-phase commit remains possible under `prefer`/`disabled`.
pub fn register_by_relation(relation_id: pg_sys::Oid, modified: bool) -> crate::error::FxmResult<()> {
    let query = format!(
        "SELECT ft.ftserver AS server_id, fs.srvname AS server_name, \
                COALESCE(um.umid, 0::oid) AS user_mapping_id \
         FROM pg_foreign_table ft \
         JOIN pg_foreign_server fs ON fs.oid = ft.ftserver \
         LEFT JOIN pg_user_mapping um ON um.srvid = fs.oid AND um.umuser = {} \
         WHERE ft.ftrelid = {}",
        unsafe { pg_sys::GetUserId() }.to_u32(),
        relation_id.to_u32()
    );

    let found: Option<(pg_sys::Oid, String, pg_sys::Oid)> = Spi::connect(|client| {
        let tup_table = client.select(&query, None, None)?;
        for row in tup_table {
            let server_id = row["server_id"].value::<pg_sys::Oid>()?.unwrap_or(pg_sys::Oid::from(0u32));
            let server_name = row["server_name"].value::<String>()?.unwrap_or_default();
            let user_mapping_id = row["user_mapping_id"].value::<pg_sys::Oid>()?.unwrap_or(pg_sys::Oid::from(0u32));
            return Ok(Some((server_id, server_name, user_mapping_id)));
        }
        Ok(None)
    })?;

    let (server_id, server_name, user_mapping_id) = match found {
        Some(t) => t,
        None => return Ok(()), // not a foreign table; nothing to register
    };

    register_by_server(server_id, &server_name, user_mapping_id, modified)
}

/// `registerByServer(serverId, modified)`.
pub fn register_by_server(
    server_id: pg_sys::Oid,
    server_name: &str,
    user_mapping_id: pg_sys::Oid,
    modified: bool,
) -> crate::error::FxmResult<()> {
    let user_id = unsafe { pg_sys::GetUserId() };
    let two_phase_capable = fdw::is_two_phase_capable(server_id);

    register(server_id, server_name, user_id, user_mapping_id, two_phase_capable);
    if modified {
        mark_modified(server_id, user_id);
    }
    Ok(())
}

/// Mark the participant for `server_id` as having been written to.
pub fn mark_modified(server_id: pg_sys::Oid, user_id: pg_sys::Oid) {
    PARTICIPANTS.with(|p| {
        if let Some(e) = p.borrow_mut().iter_mut().find(|e| e.server_id == server_id && e.user_id == user_id) {
            e.modified = true;
        }
    });
}

/// Number of participants registered for the current transaction.
pub fn count() -> usize {
    PARTICIPANTS.with(|p| p.borrow().len())
}

/// Snapshot of all participants registered for the current transaction.
pub fn all() -> Vec<Participant> {
    PARTICIPANTS.with(|p| p.borrow().clone())
}

/// Whether every registered participant declared itself 2PC-capable.
pub fn all_two_phase_capable() -> bool {
    PARTICIPANTS.with(|p| p.borrow().iter().all(|e| e.two_phase_capable))
}

/// Whether any registered participant was actually written to.
pub fn any_modified() -> bool {
    PARTICIPANTS.with(|p| p.borrow().iter().any(|e| e.modified))
}

pub fn update_status(server_id: pg_sys::Oid, user_id: pg_sys::Oid, status: FxactStatus) {
    PARTICIPANTS.with(|p| {
        if let Some(e) = p.borrow_mut().iter_mut().find(|e| e.server_id == server_id && e.user_id == user_id) {
            e.status = status;
        }
    });
}

pub fn set_prepare_id(server_id: pg_sys::Oid, user_id: pg_sys::Oid, prepare_id: PrepareId) {
    PARTICIPANTS.with(|p| {
        if let Some(e) = p.borrow_mut().iter_mut().find(|e| e.server_id == server_id && e.user_id == user_id) {
            e.prepare_id = Some(prepare_id);
        }
    });
}

/// Clear all participants. Called at both local commit and local abort
/// (`forgetAllFdwXactParticipants`) — whichever xact-end path runs, the
/// next transaction starts with an empty registry.
pub fn forget_all() {
    PARTICIPANTS.with(|p| p.borrow_mut().clear());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(v: u32) -> pg_sys::Oid {
        pg_sys::Oid::from(v)
    }

    #[test]
    fn test_register_then_forget() {
        forget_all();
        register(oid(1), "srv1", oid(10), oid(100), true);
        assert_eq!(count(), 1);
        forget_all();
        assert_eq!(count(), 0);
    }

    #[test]
    fn test_duplicate_registration_is_noop() {
        forget_all();
        register(oid(1), "srv1", oid(10), oid(100), true);
        register(oid(1), "srv1", oid(10), oid(100), true);
        assert_eq!(count(), 1);
        forget_all();
    }

    #[test]
    fn test_all_two_phase_capable_mixed() {
        forget_all();
        register(oid(1), "srv1", oid(10), oid(100), true);
        register(oid(2), "srv2", oid(10), oid(100), false);
        assert!(!all_two_phase_capable());
        forget_all();
    }

    #[test]
    fn test_any_modified_tracks_writes() {
        forget_all();
        register(oid(1), "srv1", oid(10), oid(100), true);
        assert!(!any_modified());
        mark_modified(oid(1), oid(10));
        assert!(any_modified());
        forget_all();
    }

    #[test]
    fn test_update_status_and_prepare_id() {
        forget_all();
        register(oid(1), "srv1", oid(10), oid(100), true);
        update_status(oid(1), oid(10), FxactStatus::Preparing);
        set_prepare_id(oid(1), oid(10), PrepareId::from_slice(b"fx_1").unwrap());
        let all_p = all();
        assert_eq!(all_p[0].status, FxactStatus::Preparing);
        assert_eq!(all_p[0].prepare_id.unwrap().as_bytes(), b"fx_1");
        forget_all();
    }
}
