//! Explicit Runge-Kutta integration over one shooting interval
//!
//! Propagates the state together with the forward sensitivities
//! `A = dx_next/dx` and `B = dx_next/du` by integrating the variational
//! equations with the same tableau as the state.

use nalgebra::{DMatrix, DVector};

use crate::common::ContinuousDynamics;

/// Coefficients of an explicit Runge-Kutta scheme
#[derive(Debug, Clone, PartialEq)]
pub struct ButcherTableau {
    a: Vec<Vec<f64>>,
    b: Vec<f64>,
    c: Vec<f64>,
}

impl ButcherTableau {
    /// Explicit scheme with `num_stages` stages: forward Euler, explicit
    /// midpoint, Kutta's third-order method or classical RK4.
    pub fn explicit(num_stages: usize) -> Option<Self> {
        let (a, b, c) = match num_stages {
            1 => (vec![vec![]], vec![1.0], vec![0.0]),
            2 => (vec![vec![], vec![0.5]], vec![0.0, 1.0], vec![0.0, 0.5]),
            3 => (
                vec![vec![], vec![0.5], vec![-1.0, 2.0]],
                vec![1.0 / 6.0, 2.0 / 3.0, 1.0 / 6.0],
                vec![0.0, 0.5, 1.0],
            ),
            4 => (
                vec![vec![], vec![0.5], vec![0.0, 0.5], vec![0.0, 0.0, 1.0]],
                vec![1.0 / 6.0, 1.0 / 3.0, 1.0 / 3.0, 1.0 / 6.0],
                vec![0.0, 0.5, 0.5, 1.0],
            ),
            _ => return None,
        };
        Some(ButcherTableau { a, b, c })
    }

    pub fn num_stages(&self) -> usize {
        self.b.len()
    }

    /// Stage coefficients `a[s][j]` for `j < s`
    pub fn a(&self, s: usize) -> &[f64] {
        &self.a[s]
    }

    pub fn b(&self) -> &[f64] {
        &self.b
    }

    pub fn c(&self) -> &[f64] {
        &self.c
    }
}

/// Scratch memory of one integrator, allocated once per shooting interval
#[derive(Debug, Clone)]
pub struct ErkWorkspace {
    x_cur: DVector<f64>,
    sx_cur: DMatrix<f64>,
    su_cur: DMatrix<f64>,
    x_stage: DVector<f64>,
    sx_stage: DMatrix<f64>,
    su_stage: DMatrix<f64>,
    k: Vec<DVector<f64>>,
    k_sx: Vec<DMatrix<f64>>,
    k_su: Vec<DMatrix<f64>>,
}

impl ErkWorkspace {
    pub fn new(nx: usize, nu: usize, num_stages: usize) -> Self {
        ErkWorkspace {
            x_cur: DVector::zeros(nx),
            sx_cur: DMatrix::zeros(nx, nx),
            su_cur: DMatrix::zeros(nx, nu),
            x_stage: DVector::zeros(nx),
            sx_stage: DMatrix::zeros(nx, nx),
            su_stage: DMatrix::zeros(nx, nu),
            k: vec![DVector::zeros(nx); num_stages],
            k_sx: vec![DMatrix::zeros(nx, nx); num_stages],
            k_su: vec![DMatrix::zeros(nx, nu); num_stages],
        }
    }
}

/// Discrete transition of one interval and its sensitivities
#[derive(Debug, Clone)]
pub struct SimOut {
    pub x_next: DVector<f64>,
    pub a: DMatrix<f64>,
    pub b: DMatrix<f64>,
}

impl SimOut {
    pub fn new(nx: usize, nu: usize) -> Self {
        SimOut {
            x_next: DVector::zeros(nx),
            a: DMatrix::zeros(nx, nx),
            b: DMatrix::zeros(nx, nu),
        }
    }
}

fn add_scaled(dst: &mut [f64], alpha: f64, src: &[f64]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d += alpha * s;
    }
}

/// Explicit Runge-Kutta integrator with a fixed number of steps
#[derive(Debug, Clone)]
pub struct ErkIntegrator {
    tableau: ButcherTableau,
    num_steps: usize,
}

impl ErkIntegrator {
    pub fn new(tableau: ButcherTableau, num_steps: usize) -> Self {
        ErkIntegrator { tableau, num_steps }
    }

    pub fn num_stages(&self) -> usize {
        self.tableau.num_stages()
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    pub fn workspace(&self, nx: usize, nu: usize) -> ErkWorkspace {
        ErkWorkspace::new(nx, nu, self.num_stages())
    }

    /// Integrate `f` over `ts` seconds from `x` under constant `u`.
    ///
    /// With `sensitivities == false` only `out.x_next` is written and the
    /// previous `out.a`, `out.b` are left untouched.
    #[allow(clippy::too_many_arguments)]
    pub fn integrate(
        &self,
        f: &dyn ContinuousDynamics,
        x: &DVector<f64>,
        u: &DVector<f64>,
        ts: f64,
        sensitivities: bool,
        ws: &mut ErkWorkspace,
        out: &mut SimOut,
    ) {
        let h = ts / self.num_steps as f64;
        let ns = self.num_stages();

        ws.x_cur.copy_from(x);
        if sensitivities {
            ws.sx_cur.fill_with_identity();
            ws.su_cur.fill(0.0);
        }

        for _ in 0..self.num_steps {
            for s in 0..ns {
                ws.x_stage.copy_from(&ws.x_cur);
                if sensitivities {
                    ws.sx_stage.copy_from(&ws.sx_cur);
                    ws.su_stage.copy_from(&ws.su_cur);
                }
                for (j, &a_sj) in self.tableau.a(s).iter().enumerate() {
                    if a_sj == 0.0 {
                        continue;
                    }
                    add_scaled(ws.x_stage.as_mut_slice(), h * a_sj, ws.k[j].as_slice());
                    if sensitivities {
                        add_scaled(ws.sx_stage.as_mut_slice(), h * a_sj, ws.k_sx[j].as_slice());
                        add_scaled(ws.su_stage.as_mut_slice(), h * a_sj, ws.k_su[j].as_slice());
                    }
                }

                if sensitivities {
                    f.eval_forward_vde(
                        &ws.x_stage,
                        u,
                        &ws.sx_stage,
                        &ws.su_stage,
                        &mut ws.k[s],
                        &mut ws.k_sx[s],
                        &mut ws.k_su[s],
                    );
                } else {
                    f.eval_ode(&ws.x_stage, u, &mut ws.k[s]);
                }
            }

            for (s, &b_s) in self.tableau.b().iter().enumerate() {
                if b_s == 0.0 {
                    continue;
                }
                add_scaled(ws.x_cur.as_mut_slice(), h * b_s, ws.k[s].as_slice());
                if sensitivities {
                    add_scaled(ws.sx_cur.as_mut_slice(), h * b_s, ws.k_sx[s].as_slice());
                    add_scaled(ws.su_cur.as_mut_slice(), h * b_s, ws.k_su[s].as_slice());
                }
            }
        }

        out.x_next.copy_from(&ws.x_cur);
        if sensitivities {
            out.a.copy_from(&ws.sx_cur);
            out.b.copy_from(&ws.su_cur);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ContinuousDynamics, ExternalFunction, Sparsity, IN_P, IN_U, IN_X};
    use crate::model::LateralDynamics;
    use approx::assert_relative_eq;
    use rstest::rstest;

    // xdot = -x + u, exact solution known in closed form
    struct LinearDecay {
        p: Vec<f64>,
    }

    impl ExternalFunction for LinearDecay {
        fn name(&self) -> &str {
            "linear_decay"
        }
        fn n_out(&self) -> usize {
            2
        }
        fn sparsity_in(&self, i: usize) -> Sparsity {
            match i {
                IN_X | IN_U => Sparsity::dense(1, 1),
                IN_P => Sparsity::dense(0, 1),
                _ => Sparsity::dense(0, 0),
            }
        }
        fn sparsity_out(&self, i: usize) -> Sparsity {
            if i == 0 {
                Sparsity::dense(1, 1)
            } else {
                Sparsity::dense(1, 2)
            }
        }
        fn set_param(&mut self, p: &[f64]) {
            self.p = p.to_vec();
        }
        fn params(&self) -> &[f64] {
            &self.p
        }
    }

    impl ContinuousDynamics for LinearDecay {
        fn eval_ode(&self, x: &DVector<f64>, u: &DVector<f64>, xdot: &mut DVector<f64>) {
            xdot[0] = -x[0] + u[0];
        }
        fn eval_jacobian(
            &self,
            _x: &DVector<f64>,
            _u: &DVector<f64>,
            jac_x: &mut DMatrix<f64>,
            jac_u: &mut DMatrix<f64>,
        ) {
            jac_x[(0, 0)] = -1.0;
            jac_u[(0, 0)] = 1.0;
        }
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(3)]
    #[case(4)]
    fn test_tableau_consistency(#[case] stages: usize) {
        let t = ButcherTableau::explicit(stages).unwrap();
        assert_relative_eq!(t.b().iter().sum::<f64>(), 1.0, epsilon = 1e-14);
        for s in 0..stages {
            assert_relative_eq!(t.a(s).iter().sum::<f64>(), t.c()[s], epsilon = 1e-14);
        }
    }

    #[rstest]
    #[case(1, 5e-2)]
    #[case(2, 1e-3)]
    #[case(3, 1e-4)]
    #[case(4, 1e-6)]
    fn test_accuracy_on_linear_decay(#[case] stages: usize, #[case] tol: f64) {
        let f = LinearDecay { p: vec![] };
        let integrator = ErkIntegrator::new(ButcherTableau::explicit(stages).unwrap(), 10);
        let mut ws = integrator.workspace(1, 1);
        let mut out = SimOut::new(1, 1);
        let x = DVector::from_element(1, 1.0);
        let u = DVector::from_element(1, 0.0);

        integrator.integrate(&f, &x, &u, 1.0, true, &mut ws, &mut out);

        let exact = (-1.0_f64).exp();
        assert_relative_eq!(out.x_next[0], exact, epsilon = tol);
        // linear system: sensitivity equals the propagated state ratio
        assert_relative_eq!(out.a[(0, 0)], out.x_next[0], epsilon = 1e-12);
        assert_relative_eq!(out.b[(0, 0)], 1.0 - exact, epsilon = tol);
    }

    #[test]
    fn test_sensitivities_match_finite_difference() {
        let f = LateralDynamics::new();
        let integrator = ErkIntegrator::new(ButcherTableau::explicit(4).unwrap(), 1);
        let mut ws = integrator.workspace(4, 1);
        let mut out = SimOut::new(4, 1);
        let x = DVector::from_row_slice(&[0.0, -0.5, 0.3, 0.05]);
        let u = DVector::from_row_slice(&[0.2]);
        let ts = 0.3;

        integrator.integrate(&f, &x, &u, ts, true, &mut ws, &mut out);
        let base = out.x_next.clone();
        let (a, b) = (out.a.clone(), out.b.clone());

        let eps = 1e-7;
        for j in 0..4 {
            let mut xp = x.clone();
            xp[j] += eps;
            integrator.integrate(&f, &xp, &u, ts, false, &mut ws, &mut out);
            for i in 0..4 {
                assert_relative_eq!(a[(i, j)], (out.x_next[i] - base[i]) / eps, epsilon = 1e-5);
            }
        }
        let mut up = u.clone();
        up[0] += eps;
        integrator.integrate(&f, &x, &up, ts, false, &mut ws, &mut out);
        for i in 0..4 {
            assert_relative_eq!(b[(i, 0)], (out.x_next[i] - base[i]) / eps, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_without_sensitivities_keeps_previous_jacobian() {
        let f = LinearDecay { p: vec![] };
        let integrator = ErkIntegrator::new(ButcherTableau::explicit(4).unwrap(), 1);
        let mut ws = integrator.workspace(1, 1);
        let mut out = SimOut::new(1, 1);
        out.a[(0, 0)] = 42.0;
        let x = DVector::from_element(1, 1.0);
        let u = DVector::from_element(1, 0.0);
        integrator.integrate(&f, &x, &u, 0.1, false, &mut ws, &mut out);
        assert_eq!(out.a[(0, 0)], 42.0);
        assert!(out.x_next[0] < 1.0);
    }
}
