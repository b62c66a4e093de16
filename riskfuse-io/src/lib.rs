//! riskfuse I/O Layer
//!
//! Everything that touches the filesystem:
//! - Gold-set CSV and detector registry loading
//! - NDJSON detector output normalization (malformed lines skipped and counted)
//! - Calibration store
//! - Atomic artifact writes (temp file + rename)
//! - Detector readiness probing and the cancellable wait loop

pub mod files;
pub mod gold_set;
pub mod ndjson;
pub mod registry;
pub mod calibration_store;
pub mod readiness;

pub use files::*;
pub use gold_set::*;
pub use ndjson::*;
pub use registry::*;
pub use calibration_store::*;
pub use readiness::*;

/// Malformed-line messages kept per detector for the run report
pub const MAX_ERROR_SAMPLES: usize = 10;
