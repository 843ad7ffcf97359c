//! Error types for lateral_mpc
//!
//! Every variant here is a configuration or input error. Solve-time outcomes
//! (QP failure, iteration cap) are reported through `SolveStatus` instead.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for building and configuring a solver capsule
#[derive(Debug, Error)]
pub enum MpcError {
    /// Caller and external functions disagree on the parameter count
    #[error("trying to set {given} parameters for external functions, external function has {expected} parameters")]
    ParameterCountMismatch { expected: usize, given: usize },

    /// An array or function output does not match the declared dimensions
    #[error("dimension mismatch for {what}: expected {expected}, got {given}")]
    DimensionMismatch {
        what: String,
        expected: usize,
        given: usize,
    },

    /// Shooting node index outside 0..=N
    #[error("stage {stage} out of range (horizon has {horizon} stages)")]
    StageOutOfRange { stage: usize, horizon: usize },

    /// Lower bound above upper bound, bad index set, or unequal equality bound
    #[error("invalid bounds at stage {stage}: {message}")]
    InvalidBounds { stage: usize, message: String },

    /// Weight matrix not symmetric positive semidefinite
    #[error("invalid weight matrix at stage {stage}: {message}")]
    InvalidWeight { stage: usize, message: String },

    /// Non-positive or non-finite shooting interval
    #[error("invalid time step {value} at stage {stage}")]
    InvalidTimeStep { stage: usize, value: f64 },

    /// Runge-Kutta scheme that the integrator does not provide
    #[error("unsupported integrator at stage {stage}: {num_stages} stages, {num_steps} steps")]
    UnsupportedIntegrator {
        stage: usize,
        num_stages: usize,
        num_steps: usize,
    },

    /// Field name that the stage-indexed setter does not know
    #[error("unknown model field: {0}")]
    UnknownField(String),

    /// Field that exists but cannot be set at the given node
    #[error("field {field} is not available at stage {stage}")]
    FieldNotAvailable { field: String, stage: usize },

    /// Structure-dependent setup failed
    #[error("precompute failed: {0}")]
    Precompute(String),

    /// Invalid option value
    #[error("invalid option {name}: {message}")]
    InvalidOption { name: String, message: String },

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for solver configuration
pub type MpcResult<T> = Result<T, MpcError>;

/// What happens when a configuration invariant is violated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisconfigurationPolicy {
    /// Hand the typed error back to the caller
    #[default]
    ReturnError,
    /// Log the error and abort the process (crash-only deployments)
    Abort,
}

impl MisconfigurationPolicy {
    /// Apply the policy to a configuration error.
    ///
    /// Returns the error unchanged under `ReturnError`; never returns under `Abort`.
    pub fn escalate(self, err: MpcError) -> MpcError {
        match self {
            MisconfigurationPolicy::ReturnError => err,
            MisconfigurationPolicy::Abort => {
                log::error!("{}. Exiting.", err);
                std::process::abort()
            }
        }
    }
}
