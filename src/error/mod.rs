use std::fmt;

#[cfg(any(test, feature = "pg_test"))]
pub mod testing;

/// Error type for the foreign transaction manager.
#[derive(Debug, Clone, PartialEq)]
pub enum FxmError {
    // ============ Capacity / table errors ============
    /// No free slot in the shared-memory FXact table.
    CapacityExhausted {
        configured_max: u32,
    },

    /// Insert collision on an existing (dbid, xid, server, user) key.
    /// Indicates a caller bug, not an operator-fixable condition.
    DuplicateKey {
        server_id: u32,
        user_id: u32,
    },

    // ============ Protocol errors ============
    /// FDW is missing a required callback, or supplied a prepare id
    /// longer than `FXACT_ID_MAX_LEN` bytes.
    ProtocolViolation {
        server_name: String,
        reason: String,
    },

    /// `required` durability policy but a participant cannot do 2PC.
    TwoPhaseNotSupported {
        server_name: String,
    },

    // ============ I/O errors ============
    WalIoError {
        context: String,
        reason: String,
    },

    SpillIoError {
        path: String,
        reason: String,
    },

    /// Bad CRC, truncated file, or future xid in a spill file.
    FileCorruption {
        path: String,
        reason: String,
    },

    // ============ FDW callback errors ============
    FdwFailure {
        server_name: String,
        callback: &'static str,
        reason: String,
    },

    // ============ Wait-loop errors ============
    CancelDuringWait {
        local_xid: u32,
    },

    // ============ Resolver errors ============
    ResolverTimeout {
        server_name: String,
        timeout_ms: u64,
    },

    /// A waiter's local transaction appeared to still be in progress when
    /// the resolver inspected it — this must not happen.
    UnexpectedInProgress {
        local_xid: u32,
    },

    // ============ Ambient / SPI / config errors ============
    SpiError {
        query: String,
        error: String,
    },

    ConfigError {
        setting: String,
        value: String,
        reason: String,
    },

    InternalError {
        message: String,
        file: &'static str,
        line: u32,
    },
}

impl FxmError {
    /// PostgreSQL SQLSTATE code for this error.
    pub fn sqlstate(&self) -> &'static str {
        use FxmError::*;
        match self {
            CapacityExhausted { .. } => "53200", // out_of_memory / resource class
            DuplicateKey { .. } => "XX000",
            ProtocolViolation { .. } => "55000", // object not in prerequisite state
            TwoPhaseNotSupported { .. } => "0A000", // feature not supported
            WalIoError { .. } => "58030",
            SpillIoError { .. } => "58030",
            FileCorruption { .. } => "58P02", // corrupted file
            FdwFailure { .. } => "HV000", // FDW error class
            CancelDuringWait { .. } => "57014", // query canceled
            ResolverTimeout { .. } => "57014",
            UnexpectedInProgress { .. } => "XX000",
            SpiError { .. } => "XX000",
            ConfigError { .. } => "22023", // invalid parameter value
            InternalError { .. } => "XX000",
        }
    }

    pub fn internal(message: String, file: &'static str, line: u32) -> Self {
        FxmError::InternalError { message, file, line }
    }
}

impl fmt::Display for FxmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use FxmError::*;
        match self {
            CapacityExhausted { configured_max } => write!(
                f,
                "maximum number of prepared foreign transactions reached ({}); consider raising pg_fxm.max_prepared_foreign_transactions",
                configured_max
            ),
            DuplicateKey { server_id, user_id } => write!(
                f,
                "foreign transaction entry already exists for server {} user {}",
                server_id, user_id
            ),
            ProtocolViolation { server_name, reason } => {
                write!(f, "protocol violation for server '{}': {}", server_name, reason)
            }
            TwoPhaseNotSupported { server_name } => write!(
                f,
                "server '{}' does not support two-phase commit but distributed_atomic_commit=required",
                server_name
            ),
            WalIoError { context, reason } => write!(f, "WAL I/O error during {}: {}", context, reason),
            SpillIoError { path, reason } => write!(f, "spill file I/O error on '{}': {}", path, reason),
            FileCorruption { path, reason } => write!(f, "corrupt foreign transaction state file '{}': {}", path, reason),
            FdwFailure { server_name, callback, reason } => write!(
                f,
                "FDW callback '{}' failed on server '{}': {}",
                callback, server_name, reason
            ),
            CancelDuringWait { local_xid } => write!(
                f,
                "canceled while waiting for foreign transaction resolution (xid {}); local commit already durable",
                local_xid
            ),
            ResolverTimeout { server_name, timeout_ms } => write!(
                f,
                "resolver timed out after {}ms resolving server '{}'",
                timeout_ms, server_name
            ),
            UnexpectedInProgress { local_xid } => write!(
                f,
                "local transaction {} still in progress during resolution; this should not happen",
                local_xid
            ),
            SpiError { query, error } => write!(
                f,
                "SPI query failed: {}\nQuery: {}",
                error,
                if query.len() > 100 { &query[..100] } else { query }
            ),
            ConfigError { setting, value, reason } => {
                write!(f, "configuration error for '{}': {} (value: {})", setting, reason, value)
            }
            InternalError { message, file, line } => {
                write!(f, "internal error at {}:{}: {}\nplease report this bug", file, line, message)
            }
        }
    }
}

impl std::error::Error for FxmError {}

/// Result type used throughout the foreign transaction manager.
pub type FxmResult<T> = Result<T, FxmError>;

impl From<pgrx::spi::Error> for FxmError {
    fn from(e: pgrx::spi::Error) -> Self {
        FxmError::SpiError {
            query: "unknown".to_string(),
            error: e.to_string(),
        }
    }
}

impl From<std::io::Error> for FxmError {
    fn from(e: std::io::Error) -> Self {
        FxmError::SpillIoError {
            path: "unknown".to_string(),
            reason: e.to_string(),
        }
    }
}

/// Helper macro for creating internal errors with automatic file/line.
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::FxmError::internal($msg.to_string(), file!(), line!())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::FxmError::internal(format!($fmt, $($arg)*), file!(), line!())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_exhausted_message() {
        let err = FxmError::CapacityExhausted { configured_max: 8 };
        let msg = err.to_string();
        assert!(msg.contains('8'));
        assert_eq!(err.sqlstate(), "53200");
    }

    #[test]
    fn test_two_phase_not_supported_message() {
        let err = FxmError::TwoPhaseNotSupported { server_name: "srv1".to_string() };
        let msg = err.to_string();
        assert!(msg.contains("srv1"));
        assert_eq!(err.sqlstate(), "0A000");
    }

    #[test]
    fn test_internal_error_macro() {
        let err = internal_error!("test error at {}", "location");
        match err {
            FxmError::InternalError { message, file, line } => {
                assert!(message.contains("test error"));
                assert!(file.ends_with("mod.rs"));
                assert!(line > 0);
            }
            _ => panic!("wrong error type"),
        }
    }

    #[test]
    fn test_sqlstates_present_for_all_variants() {
        let errors = vec![
            FxmError::CapacityExhausted { configured_max: 1 },
            FxmError::DuplicateKey { server_id: 1, user_id: 1 },
            FxmError::ProtocolViolation { server_name: "s".into(), reason: "r".into() },
            FxmError::TwoPhaseNotSupported { server_name: "s".into() },
            FxmError::WalIoError { context: "c".into(), reason: "r".into() },
            FxmError::SpillIoError { path: "p".into(), reason: "r".into() },
            FxmError::FileCorruption { path: "p".into(), reason: "r".into() },
            FxmError::FdwFailure { server_name: "s".into(), callback: "prepare", reason: "r".into() },
            FxmError::CancelDuringWait { local_xid: 1 },
            FxmError::ResolverTimeout { server_name: "s".into(), timeout_ms: 1 },
            FxmError::UnexpectedInProgress { local_xid: 1 },
            FxmError::SpiError { query: "q".into(), error: "e".into() },
            FxmError::ConfigError { setting: "s".into(), value: "v".into(), reason: "r".into() },
            FxmError::InternalError { message: "m".into(), file: "f", line: 1 },
        ];
        for e in &errors {
            assert!(!e.sqlstate().is_empty());
        }
    }
}
