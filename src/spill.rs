//! On-disk Spill Store: at checkpoint, long-lived
//! FXact entries are serialized into per-entry files so WAL segments
//! covering their INSERT record can be recycled. Each file is the
//! INSERT payload followed by a little-endian CRC32C — a variable-length
//! on-disk record with an explicit length prefix and CRC tail.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use pgrx::pg_sys;

use crate::error::{FxmError, FxmResult};
use crate::model::FxactKey;
use crate::wal::InsertRecord;

/// Directory (relative to PGDATA) holding spill files.
pub const SPILL_DIR: &str = "pg_fdw_xact";

/// Build the spill file path for a key: `<dbid:08X>_<xid:08X>_<server:08X>_<user:08X>`.
pub fn file_path(base_dir: &Path, key: FxactKey) -> PathBuf {
    base_dir.join(SPILL_DIR).join(format!(
        "{:08X}_{:08X}_{:08X}_{:08X}",
        key.dbid.to_u32(),
        key.local_xid,
        key.server_id.to_u32(),
        key.user_id.to_u32()
    ))
}

/// Ensure the spill directory exists (called once at startup).
pub fn ensure_dir(base_dir: &Path) -> FxmResult<()> {
    let dir = base_dir.join(SPILL_DIR);
    fs::create_dir_all(&dir).map_err(|e| FxmError::SpillIoError {
        path: dir.display().to_string(),
        reason: e.to_string(),
    })
}

/// Write one entry's spill file atomically: write to a temp file, fsync,
/// rename into place, then fsync the containing directory.
pub fn write_entry(base_dir: &Path, record: &InsertRecord) -> FxmResult<()> {
    let key = record.key();
    let path = file_path(base_dir, key);
    let tmp_path = path.with_extension("tmp");

    let payload = record.encode();
    let crc = crc32c::crc32c(&payload);

    let mut file = File::create(&tmp_path).map_err(|e| FxmError::SpillIoError {
        path: tmp_path.display().to_string(),
        reason: e.to_string(),
    })?;
    file.write_all(&payload).map_err(|e| FxmError::SpillIoError {
        path: tmp_path.display().to_string(),
        reason: e.to_string(),
    })?;
    file.write_all(&crc.to_le_bytes()).map_err(|e| FxmError::SpillIoError {
        path: tmp_path.display().to_string(),
        reason: e.to_string(),
    })?;
    file.sync_all().map_err(|e| FxmError::SpillIoError {
        path: tmp_path.display().to_string(),
        reason: e.to_string(),
    })?;
    drop(file);

    fs::rename(&tmp_path, &path).map_err(|e| FxmError::SpillIoError {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    fsync_dir(&base_dir.join(SPILL_DIR))?;
    Ok(())
}

/// Read and CRC-validate one spill file, returning the decoded INSERT
/// payload. `FileCorruption` is returned (never a panic) on a bad CRC,
/// truncated file, or unparsable payload — the caller is responsible for
/// logging a warning and deleting the file.
pub fn read_entry(path: &Path) -> FxmResult<InsertRecord> {
    let mut file = File::open(path).map_err(|e| FxmError::SpillIoError {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).map_err(|e| FxmError::SpillIoError {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    if buf.len() < 4 {
        return Err(FxmError::FileCorruption {
            path: path.display().to_string(),
            reason: "file shorter than a CRC tail".to_string(),
        });
    }
    let (payload, crc_bytes) = buf.split_at(buf.len() - 4);
    let stored_crc = u32::from_le_bytes(crc_bytes.try_into().unwrap());
    let computed_crc = crc32c::crc32c(payload);
    if stored_crc != computed_crc {
        return Err(FxmError::FileCorruption {
            path: path.display().to_string(),
            reason: format!("CRC mismatch: stored {:08x}, computed {:08x}", stored_crc, computed_crc),
        });
    }

    InsertRecord::decode(payload).map_err(|_| FxmError::FileCorruption {
        path: path.display().to_string(),
        reason: "payload failed to decode as an INSERT record".to_string(),
    })
}

/// Delete a spill file by its literal path rather than by key, for files
/// that failed CRC validation or decoding during `restore` and so can't
/// necessarily be addressed through `file_path`.
pub fn discard(path: &Path) -> FxmResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FxmError::SpillIoError { path: path.display().to_string(), reason: e.to_string() }),
    }
}

/// Remove a spill file, if present, and fsync the directory.
pub fn remove_entry(base_dir: &Path, key: FxactKey) -> FxmResult<()> {
    let path = file_path(base_dir, key);
    match fs::remove_file(&path) {
        Ok(()) => fsync_dir(&base_dir.join(SPILL_DIR)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FxmError::SpillIoError { path: path.display().to_string(), reason: e.to_string() }),
    }
}

/// `prescan()`: walk the spill directory once at startup
/// to find the minimum xid present, so the transaction manager does not
/// prematurely advance past transactions this store still references.
pub fn prescan(base_dir: &Path) -> FxmResult<Option<u64>> {
    let dir = base_dir.join(SPILL_DIR);
    let mut min_xid: Option<u64> = None;
    for entry in list_spill_files(&dir)? {
        if let Some(xid) = parse_xid_from_filename(&entry) {
            min_xid = Some(min_xid.map_or(xid, |m: u64| m.min(xid)));
        }
    }
    Ok(min_xid)
}

/// `restore()`: read every spill file; entries whose xid
/// precedes `next_xid` are candidates for reinstatement by the caller
/// (with `inRedo=true, valid=false`); files that fail CRC/decode or that
/// carry a future xid are deleted and a warning logged by the caller.
pub fn restore(base_dir: &Path, next_xid: u64) -> FxmResult<Vec<(PathBuf, FxmResult<InsertRecord>)>> {
    let dir = base_dir.join(SPILL_DIR);
    let mut results = Vec::new();
    for path in list_spill_files(&dir)? {
        let xid = parse_xid_from_filename(&path);
        let outcome = match xid {
            Some(xid) if xid < next_xid => read_entry(&path),
            Some(xid) => Err(FxmError::FileCorruption {
                path: path.display().to_string(),
                reason: format!("spill file xid {} is not older than next xid {}", xid, next_xid),
            }),
            None => Err(FxmError::FileCorruption {
                path: path.display().to_string(),
                reason: "unparseable spill file name".to_string(),
            }),
        };
        results.push((path, outcome));
    }
    Ok(results)
}

fn list_spill_files(dir: &Path) -> FxmResult<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| FxmError::SpillIoError {
        path: dir.display().to_string(),
        reason: e.to_string(),
    })? {
        let entry = entry.map_err(|e| FxmError::SpillIoError {
            path: dir.display().to_string(),
            reason: e.to_string(),
        })?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("tmp") {
            out.push(path);
        }
    }
    Ok(out)
}

fn parse_xid_from_filename(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let parts: Vec<&str> = name.split('_').collect();
    if parts.len() != 4 {
        return None;
    }
    u64::from_str_radix(parts[1], 16).ok()
}

fn fsync_dir(dir: &Path) -> FxmResult<()> {
    let f = File::open(dir).map_err(|e| FxmError::SpillIoError {
        path: dir.display().to_string(),
        reason: e.to_string(),
    })?;
    f.sync_all().map_err(|e| FxmError::SpillIoError {
        path: dir.display().to_string(),
        reason: e.to_string(),
    })
}

/// Directory the spill store lives under: `$PGDATA/pg_fdw_xact`.
pub fn data_dir() -> PathBuf {
    unsafe {
        let c = std::ffi::CStr::from_ptr(pg_sys::DataDir);
        PathBuf::from(c.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_record(xid: u64) -> InsertRecord {
        InsertRecord {
            dbid: 1,
            xid,
            server_id: 2,
            user_id: 3,
            user_mapping_id: 4,
            prepare_id: b"fx_test".to_vec(),
        }
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let dir = tempdir().unwrap();
        ensure_dir(dir.path()).unwrap();
        let rec = sample_record(100);
        write_entry(dir.path(), &rec).unwrap();
        let path = file_path(dir.path(), rec.key());
        let read_back = read_entry(&path).unwrap();
        assert_eq!(read_back, rec);
    }

    #[test]
    fn test_corrupted_file_detected() {
        let dir = tempdir().unwrap();
        ensure_dir(dir.path()).unwrap();
        let rec = sample_record(100);
        write_entry(dir.path(), &rec).unwrap();
        let path = file_path(dir.path(), rec.key());
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();
        assert!(matches!(read_entry(&path), Err(FxmError::FileCorruption { .. })));
    }

    #[test]
    fn test_remove_entry_is_idempotent() {
        let dir = tempdir().unwrap();
        ensure_dir(dir.path()).unwrap();
        let rec = sample_record(100);
        write_entry(dir.path(), &rec).unwrap();
        let key = rec.key();
        remove_entry(dir.path(), key).unwrap();
        remove_entry(dir.path(), key).unwrap();
    }

    #[test]
    fn test_prescan_finds_minimum_xid() {
        let dir = tempdir().unwrap();
        ensure_dir(dir.path()).unwrap();
        write_entry(dir.path(), &sample_record(500)).unwrap();
        write_entry(dir.path(), &sample_record(100)).unwrap();
        write_entry(dir.path(), &sample_record(300)).unwrap();
        assert_eq!(prescan(dir.path()).unwrap(), Some(100));
    }

    #[test]
    fn test_discard_removes_unparseable_file() {
        let dir = tempdir().unwrap();
        ensure_dir(dir.path()).unwrap();
        let junk_path = dir.path().join(SPILL_DIR).join("not_a_spill_file");
        fs::write(&junk_path, b"garbage").unwrap();
        discard(&junk_path).unwrap();
        assert!(!junk_path.exists());
        discard(&junk_path).unwrap(); // idempotent
    }

    #[test]
    fn test_restore_rejects_future_xid() {
        let dir = tempdir().unwrap();
        ensure_dir(dir.path()).unwrap();
        write_entry(dir.path(), &sample_record(100)).unwrap();
        write_entry(dir.path(), &sample_record(9999)).unwrap();
        let results = restore(dir.path(), 1000).unwrap();
        let mut ok = 0;
        let mut bad = 0;
        for (_, outcome) in results {
            match outcome {
                Ok(_) => ok += 1,
                Err(_) => bad += 1,
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(bad, 1);
    }
}
