//! Lateral kinematic path-tracking model
//!
//! State `[x_ego, y_ego, psi_ego, curv_ego]` relative to the reference path,
//! control `[curv_rate]`, parameters `[v_ego, rotation_radius]`.
//!
//! ```text
//! x'    = v cos(psi) - r sin(psi) curv
//! y'    = v sin(psi) + r cos(psi) curv
//! psi'  = v curv
//! curv' = curv_rate
//! ```
//!
//! The residual penalises lateral offset, heading and curvature rate, the
//! last two scaled with `(v + 5)` so the cost stays comparable across speeds.

use nalgebra::{DMatrix, DVector};

use crate::common::{
    ContinuousDynamics, ExternalFunction, LeastSquaresResidual, OcpModel, Sparsity, IN_P, IN_U,
    IN_X,
};
use crate::ocp::ProblemData;

/// Number of shooting intervals
pub const N: usize = 16;
/// State dimension
pub const NX: usize = 4;
/// Control dimension
pub const NU: usize = 1;
/// Parameter dimension
pub const NP: usize = 2;
/// Residual dimension at node 0
pub const NY0: usize = 3;
/// Residual dimension at nodes 1..N-1
pub const NY: usize = 3;
/// Residual dimension at node N
pub const NYN: usize = 2;

/// Offset added to the speed in the heading and curvature-rate residuals
const SPEED_OFFSET: f64 = 5.0;
/// Gain on the curvature-rate residual
const CURV_RATE_GAIN: f64 = 4.0;

/// Heading bound [rad]
pub const MAX_PSI: f64 = std::f64::consts::FRAC_PI_2;
/// Curvature bound
pub const MAX_CURV: f64 = 0.8726646259971648;

/// Default shooting interval lengths [s]
pub const TIME_STEPS: [f64; N] = [
    0.009765625,
    0.029296875,
    0.048828125,
    0.068359375,
    0.087890625,
    0.107421875,
    0.126953125,
    0.146484375,
    0.166015625,
    0.185546875,
    0.205078125,
    0.224609375,
    0.244140625,
    0.263671875,
    0.283203125,
    0.302734375,
];

/// Nominal parameters `[v_ego, rotation_radius]`
pub const DEFAULT_PARAMS: [f64; NP] = [20.0, 1.4];

/// Default initial state, also used to initialise the iterate
pub const DEFAULT_X0: [f64; NX] = [0.0, -1.0, 0.0, 0.0];

fn speed_factor(p: &[f64]) -> f64 {
    p[0] + SPEED_OFFSET
}

/// Continuous-time lateral dynamics
#[derive(Debug, Clone)]
pub struct LateralDynamics {
    p: Vec<f64>,
}

impl LateralDynamics {
    pub fn new() -> Self {
        LateralDynamics { p: DEFAULT_PARAMS.to_vec() }
    }
}

impl Default for LateralDynamics {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternalFunction for LateralDynamics {
    fn name(&self) -> &str {
        "lat_expl_ode"
    }

    fn n_out(&self) -> usize {
        2
    }

    fn sparsity_in(&self, i: usize) -> Sparsity {
        match i {
            IN_X => Sparsity::dense(NX, 1),
            IN_U => Sparsity::dense(NU, 1),
            IN_P => Sparsity::dense(NP, 1),
            _ => Sparsity::dense(0, 0),
        }
    }

    fn sparsity_out(&self, i: usize) -> Sparsity {
        match i {
            0 => Sparsity::dense(NX, 1),
            // columns [x_ego, y_ego, psi, curv, curv_rate]
            1 => Sparsity::from_entries(
                NX,
                NX + NU,
                &[(0, 2), (0, 3), (1, 2), (1, 3), (2, 3), (3, 4)],
            ),
            _ => Sparsity::dense(0, 0),
        }
    }

    fn set_param(&mut self, p: &[f64]) {
        self.p.clear();
        self.p.extend_from_slice(p);
    }

    fn params(&self) -> &[f64] {
        &self.p
    }
}

impl ContinuousDynamics for LateralDynamics {
    fn eval_ode(&self, x: &DVector<f64>, u: &DVector<f64>, xdot: &mut DVector<f64>) {
        let (v, r) = (self.p[0], self.p[1]);
        let (psi, curv) = (x[2], x[3]);
        let (s, c) = psi.sin_cos();
        xdot[0] = v * c - r * s * curv;
        xdot[1] = v * s + r * c * curv;
        xdot[2] = v * curv;
        xdot[3] = u[0];
    }

    fn eval_jacobian(
        &self,
        x: &DVector<f64>,
        _u: &DVector<f64>,
        jac_x: &mut DMatrix<f64>,
        jac_u: &mut DMatrix<f64>,
    ) {
        let (v, r) = (self.p[0], self.p[1]);
        let (psi, curv) = (x[2], x[3]);
        let (s, c) = psi.sin_cos();
        jac_x.fill(0.0);
        jac_x[(0, 2)] = -v * s - r * c * curv;
        jac_x[(0, 3)] = -r * s;
        jac_x[(1, 2)] = v * c - r * s * curv;
        jac_x[(1, 3)] = r * c;
        jac_x[(2, 3)] = v;
        jac_u.fill(0.0);
        jac_u[(3, 0)] = 1.0;
    }
}

/// Which residual map a `LateralResidual` instance evaluates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidualKind {
    Initial,
    Path,
    Terminal,
}

/// Lateral tracking residual
///
/// Nodes 0..N-1: `[y, (v+5) psi, 4 (v+5) curv_rate]`, node N: `[y, (v+5) psi]`.
#[derive(Debug, Clone)]
pub struct LateralResidual {
    kind: ResidualKind,
    p: Vec<f64>,
}

impl LateralResidual {
    pub fn new(kind: ResidualKind) -> Self {
        LateralResidual { kind, p: DEFAULT_PARAMS.to_vec() }
    }

    pub fn kind(&self) -> ResidualKind {
        self.kind
    }

    fn nu_local(&self) -> usize {
        match self.kind {
            ResidualKind::Terminal => 0,
            _ => NU,
        }
    }

    fn ny_local(&self) -> usize {
        match self.kind {
            ResidualKind::Initial => NY0,
            ResidualKind::Path => NY,
            ResidualKind::Terminal => NYN,
        }
    }
}

impl ExternalFunction for LateralResidual {
    fn name(&self) -> &str {
        match self.kind {
            ResidualKind::Initial => "lat_cost_y_0",
            ResidualKind::Path => "lat_cost_y",
            ResidualKind::Terminal => "lat_cost_y_e",
        }
    }

    fn n_out(&self) -> usize {
        3
    }

    fn sparsity_in(&self, i: usize) -> Sparsity {
        match i {
            IN_X => Sparsity::dense(NX, 1),
            IN_U => Sparsity::dense(self.nu_local(), 1),
            IN_P => Sparsity::dense(NP, 1),
            _ => Sparsity::dense(0, 0),
        }
    }

    fn sparsity_out(&self, i: usize) -> Sparsity {
        let nu = self.nu_local();
        let ny = self.ny_local();
        match i {
            0 => Sparsity::dense(ny, 1),
            1 => {
                // rows [u; x], columns residual components
                let mut entries = vec![(nu + 1, 0), (nu + 2, 1)];
                if nu > 0 {
                    entries.push((0, 2));
                }
                Sparsity::from_entries(nu + NX, ny, &entries)
            }
            // the residual is linear in (u, x)
            2 => Sparsity::from_entries(nu + NX, nu + NX, &[]),
            _ => Sparsity::dense(0, 0),
        }
    }

    fn set_param(&mut self, p: &[f64]) {
        self.p.clear();
        self.p.extend_from_slice(p);
    }

    fn params(&self) -> &[f64] {
        &self.p
    }
}

impl LeastSquaresResidual for LateralResidual {
    fn eval(&self, x: &DVector<f64>, u: &DVector<f64>, y: &mut DVector<f64>) {
        let k = speed_factor(&self.p);
        y[0] = x[1];
        y[1] = k * x[2];
        if self.kind != ResidualKind::Terminal {
            y[2] = k * CURV_RATE_GAIN * u[0];
        }
    }

    fn eval_with_jacobian(
        &self,
        x: &DVector<f64>,
        u: &DVector<f64>,
        y: &mut DVector<f64>,
        jac_t: &mut DMatrix<f64>,
    ) {
        self.eval(x, u, y);
        let k = speed_factor(&self.p);
        let nu = self.nu_local();
        jac_t.fill(0.0);
        jac_t[(nu + 1, 0)] = 1.0;
        jac_t[(nu + 2, 1)] = k;
        if nu > 0 {
            jac_t[(0, 2)] = k * CURV_RATE_GAIN;
        }
    }

    fn eval_hessian(
        &self,
        _x: &DVector<f64>,
        _u: &DVector<f64>,
        _weights: &DVector<f64>,
        hess: &mut DMatrix<f64>,
    ) {
        hess.fill(0.0);
    }
}

/// Factory for the lateral model's external functions
#[derive(Debug, Clone, Copy, Default)]
pub struct LateralModel;

impl LateralModel {
    pub fn new() -> Self {
        LateralModel
    }

    /// Numeric defaults: time steps, weights, references, bounds, iterate and parameters
    pub fn problem_data() -> ProblemData {
        let w = DMatrix::from_diagonal(&DVector::from_vec(vec![1.0, 1.0, 0.1]));
        let w_e = DMatrix::<f64>::identity(NYN, NYN);

        ProblemData {
            time_steps: TIME_STEPS.to_vec(),
            w_0: w.clone(),
            yref_0: DVector::zeros(NY0),
            w,
            yref: DVector::zeros(NY),
            w_e,
            yref_e: DVector::zeros(NYN),
            idxbx_0: vec![0, 1, 2, 3],
            lbx_0: DVector::from_row_slice(&DEFAULT_X0),
            ubx_0: DVector::from_row_slice(&DEFAULT_X0),
            idxbxe_0: vec![0, 1, 2, 3],
            idxbx: vec![2, 3],
            lbx: DVector::from_vec(vec![-MAX_PSI, -MAX_CURV]),
            ubx: DVector::from_vec(vec![MAX_PSI, MAX_CURV]),
            idxbx_e: Vec::new(),
            lbx_e: DVector::zeros(0),
            ubx_e: DVector::zeros(0),
            idxbu: Vec::new(),
            lbu: DVector::zeros(0),
            ubu: DVector::zeros(0),
            x_init: DVector::from_row_slice(&DEFAULT_X0),
            u_init: DVector::zeros(NU),
            params: DVector::from_row_slice(&DEFAULT_PARAMS),
        }
    }
}

impl OcpModel for LateralModel {
    fn name(&self) -> &str {
        "lat"
    }

    fn dynamics(&self) -> Box<dyn ContinuousDynamics> {
        Box::new(LateralDynamics::new())
    }

    fn initial_residual(&self) -> Box<dyn LeastSquaresResidual> {
        Box::new(LateralResidual::new(ResidualKind::Initial))
    }

    fn path_residual(&self) -> Box<dyn LeastSquaresResidual> {
        Box::new(LateralResidual::new(ResidualKind::Path))
    }

    fn terminal_residual(&self) -> Box<dyn LeastSquaresResidual> {
        Box::new(LateralResidual::new(ResidualKind::Terminal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn finite_difference_jacobian(f: &LateralDynamics, x: &DVector<f64>, u: &DVector<f64>) -> DMatrix<f64> {
        let eps = 1e-7;
        let mut jac = DMatrix::zeros(NX, NX + NU);
        let mut f0 = DVector::zeros(NX);
        f.eval_ode(x, u, &mut f0);
        for j in 0..NX + NU {
            let mut xp = x.clone();
            let mut up = u.clone();
            if j < NX {
                xp[j] += eps;
            } else {
                up[j - NX] += eps;
            }
            let mut f1 = DVector::zeros(NX);
            f.eval_ode(&xp, &up, &mut f1);
            jac.set_column(j, &((f1 - &f0) / eps));
        }
        jac
    }

    #[test]
    fn test_dynamics_straight_line() {
        let f = LateralDynamics::new();
        let x = DVector::from_row_slice(&[0.0, 0.0, 0.0, 0.0]);
        let u = DVector::from_row_slice(&[0.0]);
        let mut xdot = DVector::zeros(NX);
        f.eval_ode(&x, &u, &mut xdot);
        assert_relative_eq!(xdot[0], 20.0);
        assert_relative_eq!(xdot[1], 0.0);
    }

    #[test]
    fn test_dynamics_jacobian_matches_finite_difference() {
        let mut f = LateralDynamics::new();
        f.set_param(&[12.0, 1.1]);
        let x = DVector::from_row_slice(&[1.0, -0.3, 0.2, 0.05]);
        let u = DVector::from_row_slice(&[0.1]);
        let mut jac_x = DMatrix::zeros(NX, NX);
        let mut jac_u = DMatrix::zeros(NX, NU);
        f.eval_jacobian(&x, &u, &mut jac_x, &mut jac_u);

        let fd = finite_difference_jacobian(&f, &x, &u);
        for i in 0..NX {
            for j in 0..NX {
                assert_relative_eq!(jac_x[(i, j)], fd[(i, j)], epsilon = 1e-5);
            }
            assert_relative_eq!(jac_u[(i, 0)], fd[(i, NX)], epsilon = 1e-5);
        }
    }

    #[test]
    fn test_jacobian_nonzeros_inside_declared_pattern() {
        let f = LateralDynamics::new();
        let pattern = f.sparsity_out(1);
        let x = DVector::from_row_slice(&[0.3, 0.1, 0.4, 0.2]);
        let u = DVector::from_row_slice(&[0.7]);
        let fd = finite_difference_jacobian(&f, &x, &u);
        for i in 0..NX {
            for j in 0..NX + NU {
                if fd[(i, j)].abs() > 1e-9 {
                    assert!(pattern.contains(i, j), "({}, {}) missing from pattern", i, j);
                }
            }
        }
    }

    #[test]
    fn test_residual_uses_parameters() {
        let mut r = LateralResidual::new(ResidualKind::Path);
        let x = DVector::from_row_slice(&[0.0, 0.5, 0.1, 0.0]);
        let u = DVector::from_row_slice(&[0.2]);
        let mut y = DVector::zeros(NY);
        let mut jac_t = DMatrix::zeros(NU + NX, NY);

        r.eval_with_jacobian(&x, &u, &mut y, &mut jac_t);
        assert_relative_eq!(y[1], 25.0 * 0.1);
        assert_relative_eq!(y[2], 25.0 * 4.0 * 0.2);
        assert_relative_eq!(jac_t[(3, 1)], 25.0);

        r.set_param(&[5.0, 1.4]);
        r.eval_with_jacobian(&x, &u, &mut y, &mut jac_t);
        assert_relative_eq!(y[1], 10.0 * 0.1);
        assert_relative_eq!(jac_t[(0, 2)], 40.0);
    }

    #[test]
    fn test_terminal_residual_has_no_control() {
        let r = LateralResidual::new(ResidualKind::Terminal);
        assert_eq!(r.nu(), 0);
        assert_eq!(r.ny(), NYN);
        let x = DVector::from_row_slice(&[0.0, -1.0, 0.2, 0.0]);
        let u = DVector::zeros(0);
        let mut y = DVector::zeros(NYN);
        let mut jac_t = DMatrix::zeros(NX, NYN);
        r.eval_with_jacobian(&x, &u, &mut y, &mut jac_t);
        assert_relative_eq!(y[0], -1.0);
        assert_relative_eq!(jac_t[(1, 0)], 1.0);
        assert_relative_eq!(jac_t[(2, 1)], 25.0);
    }

    #[test]
    fn test_problem_data_shapes() {
        let data = LateralModel::problem_data();
        assert_eq!(data.time_steps.len(), N);
        assert_relative_eq!(data.time_steps.iter().sum::<f64>(), 2.5, epsilon = 1e-12);
        assert_eq!(data.w.shape(), (NY, NY));
        assert_eq!(data.w_e.shape(), (NYN, NYN));
        assert_eq!(data.idxbx_0.len(), 4);
    }
}
