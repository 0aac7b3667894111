//! Error taxonomy of the response core.
//!
//! The store and the batch planner raise immediately; stage preconditions
//! surface as [`PolarError::Precondition`] so that a violation of the fixed
//! pipeline order names both the stage and the missing tensor. Collaborator
//! failures cross the trait boundary as opaque [`anyhow::Error`] values and
//! are tagged with the stage that issued the call.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolarError {
    /// Ambiguous or invalid arguments to a store or planner operation.
    #[error("invalid usage: {0}")]
    Usage(String),

    /// A store key was read or deleted that does not exist.
    #[error("tensor `{0}` not found in store")]
    NotFound(String),

    /// Backing-file or checkpoint I/O failure.
    #[error("storage failure: {0}")]
    Storage(String),

    /// A stage entered without one of its required input tensors.
    /// Indicates a pipeline-ordering bug, not a storage bug.
    #[error("stage `{stage}` requires tensor `{key}` which is absent")]
    Precondition { stage: &'static str, key: String },

    /// An external collaborator call failed.
    #[error("stage `{stage}`: collaborator call failed: {source}")]
    Engine {
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl From<hdf5_metno::Error> for PolarError {
    fn from(err: hdf5_metno::Error) -> Self {
        PolarError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for PolarError {
    fn from(err: std::io::Error) -> Self {
        PolarError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for PolarError {
    fn from(err: serde_json::Error) -> Self {
        PolarError::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PolarError>;
