//! Numeric constants shared across the response pipeline.

/// Bytes per double-precision element, for element-count/byte conversions.
pub const F64_BYTES: usize = 8;

/// Fraction of the advisory memory budget the batch planner is allowed to
/// fill. The remainder absorbs allocator slack and collaborator scratch.
pub const BATCH_MEM_FACTOR: f64 = 0.8;

/// Same-spin coefficient magnitude below which the biorthogonalization
/// transform skips the transpose path.
pub const BIORTH_THRESHOLD: f64 = 1.0e-7;

/// Default CPKS iteration cap.
pub const CPKS_MAX_CYCLE: usize = 100;

/// Default CPKS convergence tolerance.
pub const CPKS_TOL: f64 = 1.0e-9;
