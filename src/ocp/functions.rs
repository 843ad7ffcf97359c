//! Per-stage external function table
//!
//! One dynamics instance per interval, one residual instance per node. Node 0
//! and node N use their own residual maps; every instance stores its own
//! parameter vector so stages can be retargeted independently.

use crate::common::{
    ContinuousDynamics, ExternalFunction, LeastSquaresResidual, MpcError, MpcResult, OcpModel,
    Stage, IN_P, IN_U, IN_X,
};
use crate::ocp::dims::OcpDims;

pub struct ExternalFunctions {
    dynamics: Vec<Box<dyn ContinuousDynamics>>,
    cost_initial: Box<dyn LeastSquaresResidual>,
    cost_path: Vec<Box<dyn LeastSquaresResidual>>,
    cost_terminal: Box<dyn LeastSquaresResidual>,
    np: usize,
}

impl ExternalFunctions {
    /// Instantiate all functions of `model` for a horizon of `horizon` intervals
    pub fn from_model(model: &dyn OcpModel, horizon: usize) -> Self {
        let dynamics = (0..horizon).map(|_| model.dynamics()).collect::<Vec<_>>();
        let cost_path = (1..horizon).map(|_| model.path_residual()).collect();
        let np = dynamics.first().map_or(0, |f| f.n_params());
        ExternalFunctions {
            dynamics,
            cost_initial: model.initial_residual(),
            cost_path,
            cost_terminal: model.terminal_residual(),
            np,
        }
    }

    pub fn horizon(&self) -> usize {
        self.dynamics.len()
    }

    /// Parameter count every function of this table was compiled for
    pub fn n_params(&self) -> usize {
        self.np
    }

    /// Dynamics of the interval starting at `stage`; `None` at the terminal node
    pub fn dynamics(&self, stage: Stage) -> Option<&dyn ContinuousDynamics> {
        match stage {
            Stage::Initial => self.dynamics.first().map(|f| f.as_ref()),
            Stage::Intermediate(i) => self.dynamics.get(i).map(|f| f.as_ref()),
            Stage::Terminal => None,
        }
    }

    /// Residual map of the node at `stage`
    pub fn cost(&self, stage: Stage) -> &dyn LeastSquaresResidual {
        match stage {
            Stage::Initial => self.cost_initial.as_ref(),
            Stage::Intermediate(i) => self.cost_path[i - 1].as_ref(),
            Stage::Terminal => self.cost_terminal.as_ref(),
        }
    }

    /// Push `p` into every function instance attached to `stage`.
    ///
    /// The length must already have been checked against `n_params`; the
    /// terminal node has no dynamics, so only its residual is updated.
    pub fn set_params(&mut self, stage: Stage, p: &[f64]) {
        match stage {
            Stage::Initial => {
                self.dynamics[0].set_param(p);
                self.cost_initial.set_param(p);
            }
            Stage::Intermediate(i) => {
                self.dynamics[i].set_param(p);
                self.cost_path[i - 1].set_param(p);
            }
            Stage::Terminal => self.cost_terminal.set_param(p),
        }
    }

    /// Total scratch memory requested by all instances
    pub fn work_size(&self) -> usize {
        let dynamics: usize = self.dynamics.iter().map(|f| f.work_size()).sum();
        let path: usize = self.cost_path.iter().map(|f| f.work_size()).sum();
        dynamics + path + self.cost_initial.work_size() + self.cost_terminal.work_size()
    }

    /// Check every declared input/output shape against `dims`.
    pub fn check_dims(&self, dims: &OcpDims) -> MpcResult<()> {
        if self.horizon() != dims.n {
            return Err(MpcError::DimensionMismatch {
                what: "dynamics instances".to_string(),
                expected: dims.n,
                given: self.horizon(),
            });
        }
        if self.np != dims.np {
            return Err(MpcError::ParameterCountMismatch {
                expected: self.np,
                given: dims.np,
            });
        }
        for stage in Stage::all(dims.n) {
            let i = stage.index(dims.n);
            let (nx, nu) = (dims.nx[i], dims.nu[i]);

            if let Some(f) = self.dynamics(stage) {
                check_function(f, nx, nu, dims.np)?;
                expect_shape(f, "xdot", f.sparsity_out(0).shape(), (nx, 1))?;
                expect_shape(f, "jacobian", f.sparsity_out(1).shape(), (nx, nx + nu))?;
            }

            let cost = self.cost(stage);
            check_function(cost, nx, nu, dims.np)?;
            let ny = dims.ny[i];
            expect_shape(cost, "y", cost.sparsity_out(0).shape(), (ny, 1))?;
            expect_shape(cost, "jacobian", cost.sparsity_out(1).shape(), (nu + nx, ny))?;
            expect_shape(cost, "hessian", cost.sparsity_out(2).shape(), (nu + nx, nu + nx))?;
        }
        Ok(())
    }
}

fn check_function<F>(f: &F, nx: usize, nu: usize, np: usize) -> MpcResult<()>
where
    F: ExternalFunction + ?Sized,
{
    if f.n_params() != np {
        return Err(MpcError::ParameterCountMismatch {
            expected: f.n_params(),
            given: np,
        });
    }
    expect_shape(f, "x", f.sparsity_in(IN_X).shape(), (nx, 1))?;
    expect_shape(f, "u", f.sparsity_in(IN_U).shape(), (nu, 1))?;
    expect_shape(f, "p", f.sparsity_in(IN_P).shape(), (np, 1))
}

fn expect_shape<F: ExternalFunction + ?Sized>(
    f: &F,
    slot: &str,
    given: (usize, usize),
    expected: (usize, usize),
) -> MpcResult<()> {
    if given.0 != expected.0 {
        return Err(MpcError::DimensionMismatch {
            what: format!("rows of {} in {}", slot, f.name()),
            expected: expected.0,
            given: given.0,
        });
    }
    if given.1 != expected.1 {
        return Err(MpcError::DimensionMismatch {
            what: format!("columns of {} in {}", slot, f.name()),
            expected: expected.1,
            given: given.1,
        });
    }
    Ok(())
}
