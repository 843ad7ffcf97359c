//! Common types, traits, and error definitions for lateral_mpc
//!
//! This module provides the building blocks shared by the solver core and
//! the model implementations.

pub mod types;
pub mod traits;
pub mod error;

pub use types::*;
pub use traits::*;
pub use error::*;
