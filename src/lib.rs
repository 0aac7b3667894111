//! Out-of-core tensor pipeline for RI doubly-hybrid response properties.
//!
//! The crate provides the data-lifecycle and scheduling engine of a
//! second-order response calculation: a hybrid memory/disk tensor store
//! ([`HybridStore`]), a memory-budgeted batch planner
//! ([`utilities::calc_batch_size`], [`utilities::gen_batch`]) and the
//! staged pipeline assembling a static polarizability from a
//! density-fitted doubly-hybrid reference ([`RIDHPolar`]). Integrals, the
//! self-consistent field, the CPKS solver and the grid/XC machinery are
//! external collaborators behind the [`ResponseEngine`] trait.

pub mod constants;
pub mod dft;
pub mod engine;
pub mod error;
pub mod polar;
pub mod tensor_store;
pub mod utilities;

pub use crate::dft::{parse_xc_dh, DhFunctional, XcKind};
pub use crate::engine::{ResponseEngine, ScfSummary, XcKernel, XcKernelThird};
pub use crate::error::{PolarError, Result};
pub use crate::polar::{PolarAPI, PolarFlags, PolarFlagsBuilder, RIDHPolar};
pub use crate::tensor_store::{HybridStore, TensorEntry};
