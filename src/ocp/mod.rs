//! Optimal control problem solver core
//!
//! Layout follows the lifetime of a capsule: `plan` and `dims` fix the
//! structure, `functions`, `nlp_in` and `nlp_out` hold the problem, and
//! `sqp` drives a `qp` backend to solve it.

pub mod capsule;
pub mod dims;
pub mod functions;
pub mod integrator;
pub mod nlp_in;
pub mod nlp_out;
pub mod options;
pub mod plan;
pub mod qp;
pub mod qp_clarabel;
pub mod sqp;
pub mod stats;

pub use capsule::{Capsule, CapsuleBuilder, ProblemData};
pub use dims::OcpDims;
pub use functions::ExternalFunctions;
pub use integrator::{ButcherTableau, ErkIntegrator};
pub use nlp_in::{NlpField, NlpIn};
pub use nlp_out::NlpOut;
pub use options::{HessianApprox, SolverOptions};
pub use plan::{IntegratorPlan, NlpConfig, OcpPlan};
pub use qp::{QpBackend, QpOutcome, QpStatus};
pub use qp_clarabel::ClarabelBackend;
pub use sqp::{SolveStatus, SqpPhase, SqpSolver};
pub use stats::{Residuals, SolveStats};
