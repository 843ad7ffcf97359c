//! lateral_mpc - nonlinear model predictive control for lateral path tracking
//!
//! This crate provides a fixed-horizon NMPC core: an SQP driver over a
//! structured QP, explicit Runge-Kutta shooting with forward sensitivities,
//! and a solver capsule that owns the whole problem between control cycles.

// Core modules
pub mod common;
pub mod model;
pub mod ocp;

// Re-export common types for convenience
pub use common::{MisconfigurationPolicy, MpcError, MpcResult, Stage};
pub use common::{ContinuousDynamics, ExternalFunction, LeastSquaresResidual, OcpModel};
pub use model::LateralModel;
pub use ocp::{Capsule, CapsuleBuilder, NlpField, SolveStatus, SolverOptions};
