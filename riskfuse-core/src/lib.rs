//! riskfuse Core - Domain model and statistics for multi-detector risk fusion
//!
//! This crate provides the pure, I/O-free primitives:
//! - Gold-set ground truth and detector detections
//! - Per-detector performance metrics and calibration
//! - Pairwise detector correlation
//! - Unified entity merging
//! - Correlation-aware Bayesian fusion

pub mod error;
pub mod gold;
pub mod detection;
pub mod calibration;
pub mod performance;
pub mod correlation;
pub mod entity;
pub mod fusion;

pub use error::*;
pub use gold::*;
pub use detection::*;
pub use calibration::*;
pub use performance::*;
pub use correlation::*;
pub use entity::*;
pub use fusion::*;

/// Upper bound for any likelihood ratio (keeps odds finite when FPR or TNR is 0)
pub const MAX_LR: f64 = 1000.0;

/// Lower bound for any likelihood ratio
pub const MIN_LR: f64 = 1.0 / MAX_LR;

/// Default prior probability that an entity is a true positive
pub const DEFAULT_PRIOR: f64 = 0.05;

/// Agreement rate above which two detectors are treated as redundant
pub const DEFAULT_CORRELATION_THRESHOLD: f64 = 0.85;

/// Posterior thresholds for confidence buckets
pub const CRITICAL_THRESHOLD: f64 = 0.95;
pub const HIGH_THRESHOLD: f64 = 0.80;
pub const MEDIUM_THRESHOLD: f64 = 0.60;
pub const LOW_THRESHOLD: f64 = 0.25;
pub const MINIMAL_THRESHOLD: f64 = 0.10;
