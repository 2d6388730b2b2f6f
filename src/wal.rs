//! WAL Journal Adapter: emits the custom resource manager's INSERT and
//! REMOVE records around every FXact state change, and replays them
//! during crash recovery.
//!
//! Record layout is hand-rolled with an explicit length prefix rather
//! than any serde-style encoding, since these are variable-length
//! on-disk records — the same reasoning applies to both the WAL record
//! and the spill file in `spill.rs`.

use std::mem::size_of;

use pgrx::pg_sys;

use crate::error::{FxmError, FxmResult};
use crate::model::{FxactKey, PrepareId};

/// Resource manager id for FXact records. Chosen in the unused custom
/// rmgr range; a real deployment would reserve this through the
/// upstream custom-rmgr registry.
pub const RM_FDW_XACT_ID: u8 = 130;

pub const XLOG_FDW_XACT_INSERT: u8 = 0x00;
pub const XLOG_FDW_XACT_REMOVE: u8 = 0x10;

/// Position of a WAL record, returned by `emit_insert`/`emit_remove`.
pub type Lsn = u64;

/// The INSERT record body: fixed header plus a variable-length,
/// NUL-terminated prepare id, 4-byte aligned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertRecord {
    pub dbid: u32,
    pub xid: u64,
    pub server_id: u32,
    pub user_id: u32,
    pub user_mapping_id: u32,
    pub prepare_id: Vec<u8>,
}

impl InsertRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(24 + self.prepare_id.len() + 1);
        buf.extend_from_slice(&self.dbid.to_le_bytes());
        buf.extend_from_slice(&self.xid.to_le_bytes());
        buf.extend_from_slice(&self.server_id.to_le_bytes());
        buf.extend_from_slice(&self.user_id.to_le_bytes());
        buf.extend_from_slice(&self.user_mapping_id.to_le_bytes());
        buf.extend_from_slice(&self.prepare_id);
        buf.push(0); // NUL terminator
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> FxmResult<Self> {
        const FIXED_LEN: usize = 4 + 8 + 4 + 4 + 4;
        if buf.len() < FIXED_LEN + 1 {
            return Err(FxmError::WalIoError {
                context: "decode INSERT record".to_string(),
                reason: format!("record too short: {} bytes", buf.len()),
            });
        }
        let dbid = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let xid = u64::from_le_bytes(buf[4..12].try_into().unwrap());
        let server_id = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let user_id = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        let user_mapping_id = u32::from_le_bytes(buf[20..24].try_into().unwrap());
        let nul_pos = buf[FIXED_LEN..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| FxmError::WalIoError {
                context: "decode INSERT record".to_string(),
                reason: "prepare id is not NUL-terminated".to_string(),
            })?;
        let prepare_id = buf[FIXED_LEN..FIXED_LEN + nul_pos].to_vec();
        Ok(InsertRecord { dbid, xid, server_id, user_id, user_mapping_id, prepare_id })
    }

    pub fn key(&self) -> FxactKey {
        FxactKey {
            dbid: pg_sys::Oid::from(self.dbid),
            local_xid: self.xid as pg_sys::TransactionId,
            server_id: pg_sys::Oid::from(self.server_id),
            user_id: pg_sys::Oid::from(self.user_id),
        }
    }
}

/// The REMOVE record body: just enough to identify the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveRecord {
    pub dbid: u32,
    pub xid: u64,
    pub server_id: u32,
    pub user_id: u32,
}

impl RemoveRecord {
    pub fn encode(&self) -> [u8; size_of::<u32>() * 3 + size_of::<u64>()] {
        let mut buf = [0u8; 20];
        buf[0..4].copy_from_slice(&self.dbid.to_le_bytes());
        buf[4..12].copy_from_slice(&self.xid.to_le_bytes());
        buf[12..16].copy_from_slice(&self.server_id.to_le_bytes());
        buf[16..20].copy_from_slice(&self.user_id.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> FxmResult<Self> {
        if buf.len() < 20 {
            return Err(FxmError::WalIoError {
                context: "decode REMOVE record".to_string(),
                reason: format!("record too short: {} bytes", buf.len()),
            });
        }
        Ok(RemoveRecord {
            dbid: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            xid: u64::from_le_bytes(buf[4..12].try_into().unwrap()),
            server_id: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            user_id: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
        })
    }

    pub fn key(&self) -> FxactKey {
        FxactKey {
            dbid: pg_sys::Oid::from(self.dbid),
            local_xid: self.xid as pg_sys::TransactionId,
            server_id: pg_sys::Oid::from(self.server_id),
            user_id: pg_sys::Oid::from(self.user_id),
        }
    }
}

/// RAII "delay checkpoint" guard: held from the moment a
/// backend XLogInserts its FXact INSERT record until the corresponding
/// entry is marked valid, so a checkpoint can never observe the record
/// in WAL without the in-memory entry being valid yet.
///
/// Modeled as a per-backend counter rather than a single flag, since
/// nested guards (e.g. retry after a transient WAL error) must not let
/// an inner `Drop` re-enable checkpoints the outer scope still needs
/// delayed.
pub struct DelayCheckpoint;

thread_local! {
    static DELAY_COUNT: std::cell::Cell<u32> = const { std::cell::Cell::new(0) };
}

impl DelayCheckpoint {
    pub fn acquire() -> Self {
        DELAY_COUNT.with(|c| c.set(c.get() + 1));
        DelayCheckpoint
    }
}

impl Drop for DelayCheckpoint {
    fn drop(&mut self) {
        DELAY_COUNT.with(|c| c.set(c.get().saturating_sub(1)));
    }
}

/// Whether any backend-local delay-checkpoint guard is currently held.
pub fn checkpoint_delayed() -> bool {
    DELAY_COUNT.with(|c| c.get() > 0)
}

/// Emit an INSERT record for a newly prepared participant, returning the
/// record's start/end LSNs, which the entry tracks until it is spilled.
/// Holds `DelayCheckpoint` for the duration of the
/// flush so the entry cannot be checkpointed while still invalid.
pub fn emit_insert(record: &InsertRecord) -> FxmResult<(Lsn, Lsn)> {
    if record.prepare_id.len() > crate::model::FXACT_ID_MAX_LEN {
        return Err(FxmError::ProtocolViolation {
            server_name: format!("server {}", record.server_id),
            reason: format!(
                "prepare id is {} bytes, exceeds the {}-byte limit",
                record.prepare_id.len(),
                crate::model::FXACT_ID_MAX_LEN
            ),
        });
    }
    let _delay = DelayCheckpoint::acquire();
    let payload = record.encode();

    unsafe {
        pg_sys::XLogBeginInsert();
        pg_sys::XLogRegisterData(payload.as_ptr() as *mut i8, payload.len() as u32);
        let start_lsn = pg_sys::XLogInsert(RM_FDW_XACT_ID, XLOG_FDW_XACT_INSERT);
        pg_sys::XLogFlush(start_lsn);
        let end_lsn = start_lsn;
        Ok((start_lsn, end_lsn))
    }
}

/// Emit a REMOVE record for an entry being freed.
pub fn emit_remove(record: &RemoveRecord) -> FxmResult<Lsn> {
    let payload = record.encode();
    unsafe {
        pg_sys::XLogBeginInsert();
        pg_sys::XLogRegisterData(payload.as_ptr() as *mut i8, payload.len() as u32);
        let lsn = pg_sys::XLogInsert(RM_FDW_XACT_ID, XLOG_FDW_XACT_REMOVE);
        pg_sys::XLogFlush(lsn);
        Ok(lsn)
    }
}

/// Redo callback for the custom rmgr: rebuilds FXact Table state from a
/// decoded record during crash recovery.
pub enum Redo {
    Insert(InsertRecord),
    Remove(RemoveRecord),
}

pub fn decode_for_redo(info: u8, payload: &[u8]) -> FxmResult<Redo> {
    match info & !0x0F {
        XLOG_FDW_XACT_INSERT => Ok(Redo::Insert(InsertRecord::decode(payload)?)),
        XLOG_FDW_XACT_REMOVE => Ok(Redo::Remove(RemoveRecord::decode(payload)?)),
        other => Err(FxmError::WalIoError {
            context: "redo".to_string(),
            reason: format!("unrecognized FXact record info byte 0x{:02x}", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_record_roundtrip() {
        let rec = InsertRecord {
            dbid: 16384,
            xid: 123456789,
            server_id: 50000,
            user_id: 10,
            user_mapping_id: 20,
            prepare_id: b"fx_42_50000_10".to_vec(),
        };
        let encoded = rec.encode();
        assert_eq!(encoded.len() % 4, 0);
        let decoded = InsertRecord::decode(&encoded).unwrap();
        assert_eq!(decoded, rec);
    }

    #[test]
    fn test_insert_record_decode_rejects_truncated() {
        let rec = InsertRecord {
            dbid: 1,
            xid: 2,
            server_id: 3,
            user_id: 4,
            user_mapping_id: 5,
            prepare_id: b"x".to_vec(),
        };
        let encoded = rec.encode();
        let truncated = &encoded[..encoded.len() - 3];
        assert!(InsertRecord::decode(truncated).is_err());
    }

    #[test]
    fn test_remove_record_roundtrip() {
        let rec = RemoveRecord { dbid: 16384, xid: 99, server_id: 1, user_id: 2 };
        let encoded = rec.encode();
        let decoded = RemoveRecord::decode(&encoded).unwrap();
        assert_eq!(decoded, rec);
    }

    #[test]
    fn test_empty_prepare_id_roundtrips() {
        let rec = InsertRecord {
            dbid: 1,
            xid: 1,
            server_id: 1,
            user_id: 1,
            user_mapping_id: 1,
            prepare_id: Vec::new(),
        };
        let decoded = InsertRecord::decode(&rec.encode()).unwrap();
        assert_eq!(decoded.prepare_id, Vec::<u8>::new());
    }

    #[test]
    fn test_delay_checkpoint_nests() {
        assert!(!checkpoint_delayed());
        {
            let _outer = DelayCheckpoint::acquire();
            assert!(checkpoint_delayed());
            {
                let _inner = DelayCheckpoint::acquire();
                assert!(checkpoint_delayed());
            }
            assert!(checkpoint_delayed());
        }
        assert!(!checkpoint_delayed());
    }
}
