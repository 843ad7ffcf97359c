//! Solver plan and the module configuration resolved from it
//!
//! The plan records the build-time structural choices (horizon length,
//! integration scheme per stage, which QP backend). `NlpConfig` is what the
//! plan resolves to once validated: ready-to-use per-stage integrators.

use serde::{Deserialize, Serialize};

use crate::common::{MpcError, MpcResult};
use crate::ocp::integrator::{ButcherTableau, ErkIntegrator};

/// Explicit Runge-Kutta settings of one shooting interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegratorPlan {
    /// Runge-Kutta stages (1..=4)
    pub num_stages: usize,
    /// Integration steps per shooting interval
    pub num_steps: usize,
}

impl Default for IntegratorPlan {
    fn default() -> Self {
        // classical RK4, one step per interval
        IntegratorPlan { num_stages: 4, num_steps: 1 }
    }
}

/// Build-time structural choices of the solver
#[derive(Debug, Clone, PartialEq)]
pub struct OcpPlan {
    pub horizon: usize,
    pub integrators: Vec<IntegratorPlan>,
    pub model_name: String,
    pub qp_solver: String,
}

impl OcpPlan {
    pub fn new(horizon: usize, model_name: &str, qp_solver: &str) -> Self {
        OcpPlan {
            horizon,
            integrators: vec![IntegratorPlan::default(); horizon],
            model_name: model_name.to_string(),
            qp_solver: qp_solver.to_string(),
        }
    }

    /// Override the integrator of a single interval
    pub fn set_integrator(&mut self, stage: usize, plan: IntegratorPlan) -> MpcResult<()> {
        let horizon = self.horizon;
        let slot = self
            .integrators
            .get_mut(stage)
            .ok_or(MpcError::StageOutOfRange { stage, horizon })?;
        *slot = plan;
        Ok(())
    }
}

/// Solver modules resolved from an `OcpPlan`
#[derive(Debug, Clone)]
pub struct NlpConfig {
    integrators: Vec<ErkIntegrator>,
}

impl NlpConfig {
    /// Resolve the plan; fails on an integration scheme that does not exist.
    pub fn from_plan(plan: &OcpPlan) -> MpcResult<Self> {
        if plan.integrators.len() != plan.horizon {
            return Err(MpcError::DimensionMismatch {
                what: "integrator plans".to_string(),
                expected: plan.horizon,
                given: plan.integrators.len(),
            });
        }
        let integrators = plan
            .integrators
            .iter()
            .enumerate()
            .map(|(stage, p)| {
                let unsupported = MpcError::UnsupportedIntegrator {
                    stage,
                    num_stages: p.num_stages,
                    num_steps: p.num_steps,
                };
                if p.num_steps == 0 {
                    return Err(unsupported);
                }
                let tableau = ButcherTableau::explicit(p.num_stages).ok_or(unsupported)?;
                Ok(ErkIntegrator::new(tableau, p.num_steps))
            })
            .collect::<MpcResult<Vec<_>>>()?;
        Ok(NlpConfig { integrators })
    }

    /// Integrator of interval `stage` (0..N-1)
    pub fn integrator(&self, stage: usize) -> &ErkIntegrator {
        &self.integrators[stage]
    }

    pub fn integrators(&self) -> &[ErkIntegrator] {
        &self.integrators
    }
}
