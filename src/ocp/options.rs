//! Solver options
//!
//! Loaded from TOML or built from `Default`. Every field has a serde default,
//! so a config file only needs to name what it changes.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::common::{MisconfigurationPolicy, MpcError, MpcResult};

const fn default_max_iter() -> usize {
    100
}
const fn default_tol() -> f64 {
    1e-6
}
const fn default_step_length() -> f64 {
    1.0
}
const fn default_qp_iter_max() -> u32 {
    50
}
const fn default_qp_tol() -> f64 {
    1e-9
}

/// Hessian used in the QP subproblem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HessianApprox {
    /// `s Jᵀ W J`
    #[default]
    GaussNewton,
    /// Gauss-Newton plus the residual curvature term of the cost
    Exact,
}

/// Tuning of the SQP driver and the QP backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverOptions {
    /// SQP iteration cap
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,

    /// Stationarity tolerance
    #[serde(default = "default_tol")]
    pub tol_stat: f64,

    /// Equality (dynamics and equality bounds) tolerance
    #[serde(default = "default_tol")]
    pub tol_eq: f64,

    /// Inequality tolerance
    #[serde(default = "default_tol")]
    pub tol_ineq: f64,

    /// Complementarity tolerance
    #[serde(default = "default_tol")]
    pub tol_comp: f64,

    /// Fixed step applied to every QP direction, in (0, 1]
    #[serde(default = "default_step_length")]
    pub step_length: f64,

    /// Multiple of the identity added to every stage Hessian
    #[serde(default)]
    pub levenberg_marquardt: f64,

    #[serde(default)]
    pub hessian_approx: HessianApprox,

    /// Interior-point iteration cap of the QP backend
    #[serde(default = "default_qp_iter_max")]
    pub qp_iter_max: u32,

    /// Gap and feasibility tolerance of the QP backend
    #[serde(default = "default_qp_tol")]
    pub qp_tol: f64,

    /// Keep the integrator sensitivities of the first SQP iteration for the
    /// rest of the solve call
    #[serde(default)]
    pub sens_reuse: bool,

    /// 0: silent, >0: print the iteration table after every solve
    #[serde(default)]
    pub print_level: usize,

    #[serde(default)]
    pub on_misconfiguration: MisconfigurationPolicy,
}

impl Default for SolverOptions {
    fn default() -> Self {
        SolverOptions {
            max_iter: default_max_iter(),
            tol_stat: default_tol(),
            tol_eq: default_tol(),
            tol_ineq: default_tol(),
            tol_comp: default_tol(),
            step_length: default_step_length(),
            levenberg_marquardt: 0.0,
            hessian_approx: HessianApprox::default(),
            qp_iter_max: default_qp_iter_max(),
            qp_tol: default_qp_tol(),
            sens_reuse: false,
            print_level: 0,
            on_misconfiguration: MisconfigurationPolicy::default(),
        }
    }
}

fn positive(name: &str, value: f64) -> MpcResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(MpcError::InvalidOption {
            name: name.to_string(),
            message: format!("must be positive and finite, got {}", value),
        })
    }
}

impl SolverOptions {
    /// Parse and validate options from a TOML string
    pub fn from_toml_str(s: &str) -> MpcResult<Self> {
        let opts: SolverOptions = toml::from_str(s)?;
        opts.validate()?;
        Ok(opts)
    }

    /// Parse and validate options from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> MpcResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> MpcResult<()> {
        positive("tol_stat", self.tol_stat)?;
        positive("tol_eq", self.tol_eq)?;
        positive("tol_ineq", self.tol_ineq)?;
        positive("tol_comp", self.tol_comp)?;
        positive("qp_tol", self.qp_tol)?;
        positive("step_length", self.step_length)?;
        if self.step_length > 1.0 {
            return Err(MpcError::InvalidOption {
                name: "step_length".to_string(),
                message: format!("must not exceed 1, got {}", self.step_length),
            });
        }
        if !(self.levenberg_marquardt.is_finite() && self.levenberg_marquardt >= 0.0) {
            return Err(MpcError::InvalidOption {
                name: "levenberg_marquardt".to_string(),
                message: format!("must be non-negative, got {}", self.levenberg_marquardt),
            });
        }
        if self.qp_iter_max == 0 {
            return Err(MpcError::InvalidOption {
                name: "qp_iter_max".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = SolverOptions::default();
        assert_eq!(opts.max_iter, 100);
        assert_eq!(opts.tol_stat, 1e-6);
        assert_eq!(opts.qp_iter_max, 50);
        assert_eq!(opts.step_length, 1.0);
        assert!(!opts.sens_reuse);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let opts = SolverOptions::from_toml_str(
            r#"
            max_iter = 20
            hessian_approx = "exact"
            on_misconfiguration = "abort"
            "#,
        )
        .unwrap();
        assert_eq!(opts.max_iter, 20);
        assert_eq!(opts.hessian_approx, HessianApprox::Exact);
        assert_eq!(opts.on_misconfiguration, MisconfigurationPolicy::Abort);
        assert_eq!(opts.tol_eq, 1e-6);
    }

    #[test]
    fn test_empty_toml_equals_default() {
        assert_eq!(SolverOptions::from_toml_str("").unwrap(), SolverOptions::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            SolverOptions::from_toml_str("tol_stat = -1.0"),
            Err(MpcError::InvalidOption { .. })
        ));
        assert!(SolverOptions::from_toml_str("step_length = 1.5").is_err());
        assert!(SolverOptions::from_toml_str("qp_iter_max = 0").is_err());
        assert!(matches!(
            SolverOptions::from_toml_str("max_iter = \"many\""),
            Err(MpcError::Config(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            SolverOptions::from_file("/nonexistent/lateral_mpc.toml"),
            Err(MpcError::Io(_))
        ));
    }
}
