//! The FDW callback contract: the only surface the foreign
//! transaction manager uses to reach a specific remote system. An FDW
//! registers one `FdwXactCallbacks` vtable per foreign server from its own
//! `_PG_init`-time setup; FXM never knows anything about the wire
//! protocol underneath.

use pgrx::pg_sys;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::OnceLock;

use crate::error::{FxmError, FxmResult};
use crate::model::{PrepareId, FXACT_ID_MAX_LEN};

/// Bundle passed to `prepare`/`commit`/`rollback`/`resolve` callbacks.
/// Mirrors `FdwXactState`.
pub struct FdwXactCallState {
    pub server_id: pg_sys::Oid,
    pub user_id: pg_sys::Oid,
    pub user_mapping_id: pg_sys::Oid,
    pub prepare_id: PrepareId,
    /// Opaque FDW-private state, passed back unchanged on every callback
    /// for this participant.
    pub fdw_state: *mut std::ffi::c_void,
}

/// The callback vtable an FDW registers for one foreign server.
///
/// All four required callbacks (`prepare`, `commit`, `rollback`,
/// `resolve`) plus the two capability probes
/// (`is_two_phase_capable`, `get_prepare_id`).
#[derive(Clone, Copy)]
pub struct FdwXactCallbacks {
    pub is_two_phase_capable: fn(pg_sys::Oid) -> bool,
    pub get_prepare_id: Option<fn(pg_sys::TransactionId, pg_sys::Oid, pg_sys::Oid) -> Vec<u8>>,
    pub prepare: Option<fn(&FdwXactCallState) -> bool>,
    pub commit: fn(&FdwXactCallState) -> bool,
    pub rollback: fn(&FdwXactCallState) -> bool,
    pub resolve: fn(&FdwXactCallState, is_commit: bool) -> bool,
}

impl FdwXactCallbacks {
    /// An FDW that never declares itself 2PC-capable and has no `prepare`
    /// callback — the "contains a non-2PC participant" case.
    pub fn one_phase_only(commit: fn(&FdwXactCallState) -> bool, rollback: fn(&FdwXactCallState) -> bool) -> Self {
        FdwXactCallbacks {
            is_two_phase_capable: |_| false,
            get_prepare_id: None,
            prepare: None,
            commit,
            rollback,
            resolve: |_, _| true,
        }
    }
}

static REGISTRY: OnceLock<Mutex<HashMap<u32, FdwXactCallbacks>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<u32, FdwXactCallbacks>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Called by an FDW's own initialization code to declare its callback
/// vtable for a given foreign server oid.
pub fn register_fdw_callbacks(server_id: pg_sys::Oid, callbacks: FdwXactCallbacks) {
    registry()
        .lock()
        .unwrap()
        .insert(server_id.to_u32(), callbacks);
}

/// Look up the callback vtable registered for a foreign server.
pub fn lookup(server_id: pg_sys::Oid) -> Option<FdwXactCallbacks> {
    registry().lock().unwrap().get(&server_id.to_u32()).copied()
}

/// Probe whether a server supports two-phase commit; false if no FDW has
/// registered a vtable for it at all.
pub fn is_two_phase_capable(server_id: pg_sys::Oid) -> bool {
    match lookup(server_id) {
        Some(cb) => (cb.is_two_phase_capable)(server_id),
        None => false,
    }
}

/// Request (or generate) a prepare id for a participant, enforcing the
/// ≤ 200-byte-excluding-terminator bound.
pub fn get_prepare_id(
    server_id: pg_sys::Oid,
    server_name: &str,
    xid: pg_sys::TransactionId,
    user_id: pg_sys::Oid,
) -> FxmResult<PrepareId> {
    let callbacks = lookup(server_id).ok_or_else(|| FxmError::ProtocolViolation {
        server_name: server_name.to_string(),
        reason: "no FDW callback vtable registered for this server".to_string(),
    })?;

    let raw = match callbacks.get_prepare_id {
        Some(f) => f(xid, server_id, user_id),
        None => generate_prepare_id(xid, server_id, user_id),
    };

    PrepareId::from_slice(&raw).ok_or_else(|| FxmError::ProtocolViolation {
        server_name: server_name.to_string(),
        reason: format!(
            "prepare id is {} bytes, exceeds the {}-byte limit",
            raw.len(),
            FXACT_ID_MAX_LEN
        ),
    })
}

/// Default prepare-id generator, used when the FDW doesn't supply one:
/// `fx_<random>_<xid>_<server>_<user>`, mirroring the original
/// `generate_fdw_xact_identifier()` in `fdwxact.c`.
fn generate_prepare_id(xid: pg_sys::TransactionId, server_id: pg_sys::Oid, user_id: pg_sys::Oid) -> Vec<u8> {
    let r: u32 = unsafe { pg_sys::random() as u32 };
    format!("fx_{}_{}_{}_{}", r, xid, server_id.to_u32(), user_id.to_u32()).into_bytes()
}

/// RAII guard implementing a "scope guard acquired at call start and
/// released on success" pattern: a participant whose
/// in-flight FDW call is interrupted by an early return (via `?`) is left
/// marked `changing_state`, forcing a reconnect before its entry is reused.
pub struct FdwCallGuard<'a> {
    changing: &'a mut bool,
    succeeded: bool,
}

impl<'a> FdwCallGuard<'a> {
    pub fn new(changing: &'a mut bool) -> Self {
        *changing = true;
        FdwCallGuard { changing, succeeded: false }
    }

    pub fn succeeded(mut self) {
        self.succeeded = true;
        *self.changing = false;
    }
}

impl Drop for FdwCallGuard<'_> {
    fn drop(&mut self) {
        if !self.succeeded {
            // Leave `changing` set to true: a later error path (`?`) must
            // not silently clear the changingState bit.
        }
    }
}

/// Invoke `prepare`, returning a `FdwFailure` error (never panicking) on
/// a `false`/trap return.
pub fn call_prepare(server_name: &str, callbacks: &FdwXactCallbacks, state: &FdwXactCallState) -> FxmResult<()> {
    let prepare_fn = callbacks.prepare.ok_or_else(|| FxmError::ProtocolViolation {
        server_name: server_name.to_string(),
        reason: "FDW has no prepare callback".to_string(),
    })?;

    if prepare_fn(state) {
        Ok(())
    } else {
        Err(FxmError::FdwFailure {
            server_name: server_name.to_string(),
            callback: "prepare",
            reason: "callback returned false".to_string(),
        })
    }
}

pub fn call_commit(server_name: &str, callbacks: &FdwXactCallbacks, state: &FdwXactCallState) -> FxmResult<()> {
    if (callbacks.commit)(state) {
        Ok(())
    } else {
        Err(FxmError::FdwFailure {
            server_name: server_name.to_string(),
            callback: "commit",
            reason: "callback returned false".to_string(),
        })
    }
}

pub fn call_rollback(server_name: &str, callbacks: &FdwXactCallbacks, state: &FdwXactCallState) -> FxmResult<()> {
    if (callbacks.rollback)(state) {
        Ok(())
    } else {
        Err(FxmError::FdwFailure {
            server_name: server_name.to_string(),
            callback: "rollback",
            reason: "callback returned false".to_string(),
        })
    }
}

/// Invoke `resolve`, enforcing `pg_fxm.foreign_transaction_resolver_timeout`
/// as a deadline. The callback is a plain synchronous function pointer with
/// no cancellation point, so this can only detect an overrun after the call
/// returns, not preempt it mid-flight; a callback that hangs forever still
/// hangs this worker. Still, catching the overrun here means a slow-but-
/// eventually-returning FDW gets its connection flagged unsalvageable
/// instead of silently treated as healthy.
pub fn call_resolve(
    server_name: &str,
    callbacks: &FdwXactCallbacks,
    state: &FdwXactCallState,
    is_commit: bool,
) -> FxmResult<()> {
    let deadline = std::time::Duration::from_millis(crate::config::resolver_timeout_ms());
    let started = std::time::Instant::now();

    let ok = (callbacks.resolve)(state, is_commit);

    let elapsed = started.elapsed();
    if elapsed > deadline {
        return Err(FxmError::ResolverTimeout {
            server_name: server_name.to_string(),
            timeout_ms: elapsed.as_millis() as u64,
        });
    }

    if ok {
        Ok(())
    } else {
        Err(FxmError::FdwFailure {
            server_name: server_name.to_string(),
            callback: "resolve",
            reason: "callback returned false".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn always_true(_: &FdwXactCallState) -> bool {
        true
    }

    fn always_false(_: &FdwXactCallState) -> bool {
        false
    }

    fn dummy_state() -> FdwXactCallState {
        FdwXactCallState {
            server_id: pg_sys::Oid::from(1u32),
            user_id: pg_sys::Oid::from(1u32),
            user_mapping_id: pg_sys::Oid::from(1u32),
            prepare_id: PrepareId::from_slice(b"fx_test").unwrap(),
            fdw_state: std::ptr::null_mut(),
        }
    }

    #[test]
    fn test_prepare_id_length_bound_enforced() {
        let too_long = vec![b'x'; FXACT_ID_MAX_LEN + 1];
        assert!(PrepareId::from_slice(&too_long).is_none());
        let exactly_max = vec![b'x'; FXACT_ID_MAX_LEN];
        assert!(PrepareId::from_slice(&exactly_max).is_some());
    }

    #[test]
    fn test_call_prepare_false_becomes_fdw_failure() {
        let cb = FdwXactCallbacks {
            is_two_phase_capable: |_| true,
            get_prepare_id: None,
            prepare: Some(always_false),
            commit: always_true,
            rollback: always_true,
            resolve: |_, _| true,
        };
        let state = dummy_state();
        let result = call_prepare("srv", &cb, &state);
        assert!(result.is_err());
        match result.unwrap_err() {
            FxmError::FdwFailure { callback, .. } => assert_eq!(callback, "prepare"),
            other => panic!("wrong error: {other:?}"),
        }
    }

    #[test]
    fn test_call_prepare_missing_callback_is_protocol_violation() {
        let cb = FdwXactCallbacks::one_phase_only(always_true, always_true);
        let state = dummy_state();
        let result = call_prepare("srv", &cb, &state);
        assert!(matches!(result, Err(FxmError::ProtocolViolation { .. })));
    }

    #[test]
    fn test_fdw_call_guard_leaves_changing_set_on_early_return() {
        let mut changing = false;
        fn fails() -> FxmResult<()> {
            Err(FxmError::InternalError { message: "x".into(), file: "f", line: 1 })
        }
        {
            let _guard = FdwCallGuard::new(&mut changing);
            let _ = fails();
        }
        assert!(changing);
    }

    #[test]
    fn test_fdw_call_guard_clears_changing_on_success() {
        let mut changing = false;
        {
            let guard = FdwCallGuard::new(&mut changing);
            guard.succeeded();
        }
        assert!(!changing);
    }

    #[test]
    fn test_call_resolve_true_within_deadline_is_ok() {
        let cb = FdwXactCallbacks::one_phase_only(always_true, always_true);
        let state = dummy_state();
        assert!(call_resolve("srv", &cb, &state, true).is_ok());
    }

    #[test]
    fn test_call_resolve_false_within_deadline_is_fdw_failure() {
        let cb = FdwXactCallbacks {
            is_two_phase_capable: |_| true,
            get_prepare_id: None,
            prepare: None,
            commit: always_true,
            rollback: always_true,
            resolve: |_, _| false,
        };
        let state = dummy_state();
        match call_resolve("srv", &cb, &state, true).unwrap_err() {
            FxmError::FdwFailure { callback, .. } => assert_eq!(callback, "resolve"),
            other => panic!("wrong error: {other:?}"),
        }
    }
}
