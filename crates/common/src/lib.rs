// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
pub mod config;
pub mod error;
pub mod fs;
pub mod paths;
pub mod process_utils;
pub mod types;

pub use error::{ConductorError, ConductorResult, ErrorKind};
pub use types::*;

/// Milliseconds since the Unix epoch, the unit used for every timestamp in
/// the state document and on the wire.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
