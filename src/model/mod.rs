//! Model implementations of the external function interface

pub mod lateral;

pub use lateral::{LateralDynamics, LateralModel, LateralResidual, ResidualKind};
