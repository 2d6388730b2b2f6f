//! Standalone binary used by `cargo pgrx schema` to reflect this
//! extension's registered SQL entities without booting a full backend.

fn main() {
    pg_fxm::pg_fxm_version();
}
