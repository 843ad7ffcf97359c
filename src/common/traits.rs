//! Common traits defining the external function interface
//!
//! The solver core only depends on these shapes. A model can be generated
//! code behind FFI or hand-written Rust; both plug in the same way.
//!
//! Input slots are `(x, u, p)` in that order. Dynamics outputs are the state
//! derivative and its Jacobian w.r.t. `[x u]`; residual outputs are `y`, the
//! transposed Jacobian w.r.t. `[u; x]` and the residual Hessian contraction.

use nalgebra::{DMatrix, DVector};
use crate::common::types::Sparsity;

/// Input slot of the state vector
pub const IN_X: usize = 0;
/// Input slot of the control vector
pub const IN_U: usize = 1;
/// Input slot of the parameter vector
pub const IN_P: usize = 2;

/// Shape contract shared by every external function
pub trait ExternalFunction: Send {
    /// Name used in diagnostics
    fn name(&self) -> &str;

    /// Number of inputs
    fn n_in(&self) -> usize {
        3
    }

    /// Number of outputs
    fn n_out(&self) -> usize;

    /// Sparsity pattern of input `i`
    fn sparsity_in(&self, i: usize) -> Sparsity;

    /// Sparsity pattern of output `i`
    fn sparsity_out(&self, i: usize) -> Sparsity;

    /// Scratch memory in doubles required by one evaluation
    fn work_size(&self) -> usize {
        0
    }

    /// Number of runtime parameters the function was compiled for
    fn n_params(&self) -> usize {
        self.sparsity_in(IN_P).nrow
    }

    /// Store the parameter vector used by subsequent evaluations.
    ///
    /// Callers check `p.len() == n_params()` beforehand.
    fn set_param(&mut self, p: &[f64]);

    /// Currently stored parameter vector
    fn params(&self) -> &[f64];

    fn nx(&self) -> usize {
        self.sparsity_in(IN_X).nrow
    }

    fn nu(&self) -> usize {
        self.sparsity_in(IN_U).nrow
    }
}

/// Explicit ODE `xdot = f(x, u, p)` with forward sensitivities
pub trait ContinuousDynamics: ExternalFunction {
    /// Evaluate the state derivative
    fn eval_ode(&self, x: &DVector<f64>, u: &DVector<f64>, xdot: &mut DVector<f64>);

    /// Evaluate `df/dx` (nx x nx) and `df/du` (nx x nu)
    fn eval_jacobian(
        &self,
        x: &DVector<f64>,
        u: &DVector<f64>,
        jac_x: &mut DMatrix<f64>,
        jac_u: &mut DMatrix<f64>,
    );

    /// Forward variational equations.
    ///
    /// Given sensitivities `sx = dx/dx0` and `su = dx/du`, returns the state
    /// derivative together with `d(sx)/dt = fx sx` and `d(su)/dt = fx su + fu`.
    #[allow(clippy::too_many_arguments)]
    fn eval_forward_vde(
        &self,
        x: &DVector<f64>,
        u: &DVector<f64>,
        sx: &DMatrix<f64>,
        su: &DMatrix<f64>,
        xdot: &mut DVector<f64>,
        sx_dot: &mut DMatrix<f64>,
        su_dot: &mut DMatrix<f64>,
    ) {
        let nx = x.len();
        let mut jac_x = DMatrix::zeros(nx, nx);
        let mut jac_u = DMatrix::zeros(nx, u.len());
        self.eval_ode(x, u, xdot);
        self.eval_jacobian(x, u, &mut jac_x, &mut jac_u);
        sx_dot.gemm(1.0, &jac_x, sx, 0.0);
        su_dot.copy_from(&jac_u);
        su_dot.gemm(1.0, &jac_x, su, 1.0);
    }
}

/// Nonlinear least-squares residual map `y = r(x, u, p)`
pub trait LeastSquaresResidual: ExternalFunction {
    /// Residual dimension
    fn ny(&self) -> usize {
        self.sparsity_out(0).nrow
    }

    /// Evaluate the residual
    fn eval(&self, x: &DVector<f64>, u: &DVector<f64>, y: &mut DVector<f64>);

    /// Evaluate the residual and its transposed Jacobian, rows ordered `[u; x]`
    fn eval_with_jacobian(
        &self,
        x: &DVector<f64>,
        u: &DVector<f64>,
        y: &mut DVector<f64>,
        jac_t: &mut DMatrix<f64>,
    );

    /// Evaluate `sum_k weights[k] * hess(r_k)` w.r.t. `[u; x]`
    fn eval_hessian(
        &self,
        x: &DVector<f64>,
        u: &DVector<f64>,
        weights: &DVector<f64>,
        hess: &mut DMatrix<f64>,
    );
}

/// Factory for the per-stage external function instances of one model.
///
/// Every call returns a fresh instance with its own parameter storage, so
/// stages can be retargeted independently.
pub trait OcpModel {
    fn name(&self) -> &str;

    fn dynamics(&self) -> Box<dyn ContinuousDynamics>;

    /// Residual map of node 0
    fn initial_residual(&self) -> Box<dyn LeastSquaresResidual>;

    /// Residual map of nodes 1..N-1
    fn path_residual(&self) -> Box<dyn LeastSquaresResidual>;

    /// Residual map of node N (state only)
    fn terminal_residual(&self) -> Box<dyn LeastSquaresResidual>;
}
