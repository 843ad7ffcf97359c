//! SQP driver
//!
//! Fixed-step sequential quadratic programming with a Gauss-Newton Hessian.
//! Every iteration linearizes the NLP around the persisted iterate, checks
//! the KKT residuals, and otherwise solves one structured QP and takes the
//! step.
//!
//! Lagrangian convention (shared with the QP backend):
//!
//! ```text
//! L = f(w) + sum_i pi_iᵀ (x_{i+1} - phi_i(x_i, u_i)) + sum (lam_ub - lam_lb)ᵀ v[idxb]
//! ```

use std::fmt;
use std::time::Instant;

use nalgebra::{DMatrix, DVector};

use crate::common::{MpcError, MpcResult, Stage};
use crate::ocp::dims::OcpDims;
use crate::ocp::functions::ExternalFunctions;
use crate::ocp::integrator::{ErkWorkspace, SimOut};
use crate::ocp::nlp_in::NlpIn;
use crate::ocp::nlp_out::NlpOut;
use crate::ocp::options::{HessianApprox, SolverOptions};
use crate::ocp::plan::NlpConfig;
use crate::ocp::qp::{is_finite_bound, OcpQp, QpBackend, QpOutcome, QpSolution, QpStatus};
use crate::ocp::stats::{Residuals, SolveStats};

/// Outcome of one solve call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    /// All residuals below tolerance
    Success,
    /// A residual or the iterate became non-finite
    NanDetected,
    /// Iteration cap reached; the last iterate is kept
    MaxIter,
    /// The QP backend did not return a usable step
    QpFailure,
}

impl SolveStatus {
    /// Integer status code (0 = success)
    pub fn code(self) -> i32 {
        match self {
            SolveStatus::Success => 0,
            SolveStatus::NanDetected => 1,
            SolveStatus::MaxIter => 2,
            SolveStatus::QpFailure => 4,
        }
    }

    pub fn is_success(self) -> bool {
        self == SolveStatus::Success
    }
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SolveStatus::Success => "success",
            SolveStatus::NanDetected => "nan detected",
            SolveStatus::MaxIter => "maximum iterations reached",
            SolveStatus::QpFailure => "qp failure",
        };
        write!(f, "{} ({})", name, self.code())
    }
}

/// Lifecycle of the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqpPhase {
    Uninitialized,
    Ready,
    Solving,
    Finished(SolveStatus),
}

/// Max that lets NaN through
fn nan_max(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.max(b)
    }
}

fn inf_norm(v: &DVector<f64>) -> f64 {
    v.iter().fold(0.0, |m, e| nan_max(m, e.abs()))
}

pub struct SqpSolver {
    phase: SqpPhase,
    backend: Box<dyn QpBackend>,
    qp: OcpQp,
    qp_sol: QpSolution,
    sim_out: Vec<SimOut>,
    erk_ws: Vec<ErkWorkspace>,
    y: Vec<DVector<f64>>,
    jac_t: Vec<DMatrix<f64>>,
    hess: Vec<DMatrix<f64>>,
    stats: SolveStats,
    residuals: Residuals,
    sqp_iter: usize,
    last_qp: Option<QpOutcome>,
    cost_value: f64,
}

impl SqpSolver {
    /// Allocate the QP and per-node workspaces; bound index sets come from `nlp_in`.
    pub fn new(dims: &OcpDims, nlp_in: &NlpIn, backend: Box<dyn QpBackend>) -> Self {
        let n = dims.n;
        let mut idxb = Vec::with_capacity(n + 1);
        let mut is_eq = Vec::with_capacity(n + 1);
        for i in 0..=n {
            let nu = dims.nu[i];
            let idxbe = nlp_in.idxbxe(i);
            idxb.push(
                nlp_in
                    .idxbu(i)
                    .iter()
                    .copied()
                    .chain(nlp_in.idxbx(i).iter().map(|j| nu + j))
                    .collect::<Vec<_>>(),
            );
            is_eq.push(
                std::iter::repeat(false)
                    .take(dims.nbu[i])
                    .chain((0..dims.nbx[i]).map(|k| idxbe.contains(&k)))
                    .collect::<Vec<_>>(),
            );
        }
        let qp = OcpQp::new(dims, idxb, is_eq);
        let qp_sol = QpSolution::new(&qp);

        SqpSolver {
            phase: SqpPhase::Uninitialized,
            backend,
            qp,
            qp_sol,
            sim_out: (0..n).map(|i| SimOut::new(dims.nx[i + 1], dims.nu[i])).collect(),
            erk_ws: Vec::new(),
            y: (0..=n).map(|i| DVector::zeros(dims.ny[i])).collect(),
            jac_t: (0..=n).map(|i| DMatrix::zeros(dims.nv(i), dims.ny[i])).collect(),
            hess: (0..=n).map(|i| DMatrix::zeros(dims.nv(i), dims.nv(i))).collect(),
            stats: SolveStats::default(),
            residuals: Residuals::default(),
            sqp_iter: 0,
            last_qp: None,
            cost_value: 0.0,
        }
    }

    /// Structure-dependent setup: integrator workspaces and QP backend.
    pub fn precompute(
        &mut self,
        dims: &OcpDims,
        config: &NlpConfig,
        opts: &SolverOptions,
    ) -> MpcResult<()> {
        if config.integrators().len() != dims.n {
            return Err(MpcError::DimensionMismatch {
                what: "integrators".to_string(),
                expected: dims.n,
                given: config.integrators().len(),
            });
        }
        self.erk_ws = (0..dims.n)
            .map(|i| config.integrator(i).workspace(dims.nx[i], dims.nu[i]))
            .collect();
        self.backend.setup(dims, opts)?;
        self.stats = SolveStats::with_capacity(opts.max_iter);
        self.phase = SqpPhase::Ready;
        Ok(())
    }

    pub fn phase(&self) -> SqpPhase {
        self.phase
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn stats(&self) -> &SolveStats {
        &self.stats
    }

    /// Residuals of the last iterate checked
    pub fn residuals(&self) -> Residuals {
        self.residuals
    }

    /// SQP iterations taken by the last solve call
    pub fn sqp_iter(&self) -> usize {
        self.sqp_iter
    }

    pub fn last_qp(&self) -> Option<QpOutcome> {
        self.last_qp
    }

    /// Objective value at the last linearization point
    pub fn cost_value(&self) -> f64 {
        self.cost_value
    }

    /// The QP of the last linearization
    pub fn qp(&self) -> &OcpQp {
        &self.qp
    }

    /// Run SQP iterations from the iterate stored in `nlp_out`.
    pub fn solve(
        &mut self,
        config: &NlpConfig,
        functions: &ExternalFunctions,
        nlp_in: &NlpIn,
        nlp_out: &mut NlpOut,
        opts: &SolverOptions,
    ) -> SolveStatus {
        if self.phase == SqpPhase::Uninitialized {
            log::error!("solve called before precompute");
            return SolveStatus::QpFailure;
        }
        self.phase = SqpPhase::Solving;
        self.stats.clear();
        self.last_qp = None;

        let start = Instant::now();
        let status = self.iterate(config, functions, nlp_in, nlp_out, opts);
        self.stats.timings.total = start.elapsed();

        match status {
            SolveStatus::Success => log::debug!("sqp converged after {} iterations", self.sqp_iter),
            _ => log::warn!("sqp stopped at iteration {}: {}", self.sqp_iter, status),
        }
        self.phase = SqpPhase::Finished(status);
        status
    }

    fn iterate(
        &mut self,
        config: &NlpConfig,
        functions: &ExternalFunctions,
        nlp_in: &NlpIn,
        nlp_out: &mut NlpOut,
        opts: &SolverOptions,
    ) -> SolveStatus {
        for iter in 0..=opts.max_iter {
            self.sqp_iter = iter;

            let t = Instant::now();
            let sensitivities = iter == 0 || !opts.sens_reuse;
            self.linearize(config, functions, nlp_in, nlp_out, opts, sensitivities);
            self.stats.timings.linearization += t.elapsed();

            let t = Instant::now();
            let res = self.compute_residuals(nlp_out);
            self.stats.timings.residuals += t.elapsed();
            self.residuals = res;
            self.stats.push(iter, res);
            log::debug!(
                "sqp iter {}: res_stat {:e} res_eq {:e} res_ineq {:e} res_comp {:e}",
                iter,
                res.stat,
                res.eq,
                res.ineq,
                res.comp
            );

            if !res.is_finite() || !nlp_out.is_finite() {
                return SolveStatus::NanDetected;
            }
            if res.stat < opts.tol_stat
                && res.eq < opts.tol_eq
                && res.ineq < opts.tol_ineq
                && res.comp < opts.tol_comp
            {
                return SolveStatus::Success;
            }
            if iter == opts.max_iter {
                return SolveStatus::MaxIter;
            }

            let t = Instant::now();
            let outcome = self.backend.solve(&self.qp, &mut self.qp_sol);
            self.stats.timings.qp += t.elapsed();
            self.stats.record_qp(outcome.status.code(), outcome.iterations);
            self.last_qp = Some(outcome);
            if outcome.status != QpStatus::Success {
                log::warn!(
                    "{} returned {:?} after {} iterations",
                    self.backend.name(),
                    outcome.status,
                    outcome.iterations
                );
                return SolveStatus::QpFailure;
            }
            if !self.qp_sol.is_finite() {
                log::warn!("{} returned a non-finite step", self.backend.name());
                return SolveStatus::NanDetected;
            }

            self.apply_step(nlp_out, opts.step_length);
        }
        SolveStatus::MaxIter
    }

    /// Build the QP at the current iterate.
    fn linearize(
        &mut self,
        config: &NlpConfig,
        functions: &ExternalFunctions,
        nlp_in: &NlpIn,
        nlp_out: &NlpOut,
        opts: &SolverOptions,
        sensitivities: bool,
    ) {
        let n = self.qp.horizon();
        let mut cost_value = 0.0;

        for i in 0..=n {
            let stage = Stage::from_index(i, n).unwrap_or(Stage::Terminal);
            let (x, u) = (&nlp_out.x[i], &nlp_out.u[i]);
            let qs = &mut self.qp.stages[i];

            // cost: H = s Jᵀ W J, g = s Jᵀ W (r - yref)
            let cost = functions.cost(stage);
            let jac_t = &mut self.jac_t[i];
            cost.eval_with_jacobian(x, u, &mut self.y[i], jac_t);
            let e = &self.y[i] - nlp_in.yref(i);
            let s = nlp_in.scaling(i);
            let w = nlp_in.w(i);
            let we = w * &e;
            cost_value += 0.5 * s * e.dot(&we);

            qs.g.copy_from(&(&*jac_t * &we * s));
            qs.h.copy_from(&(&*jac_t * w * jac_t.transpose() * s));
            if opts.hessian_approx == HessianApprox::Exact {
                let hess = &mut self.hess[i];
                cost.eval_hessian(x, u, &(&we * s), hess);
                qs.h += &*hess;
            }
            if opts.levenberg_marquardt > 0.0 {
                for k in 0..qs.h.nrows() {
                    qs.h[(k, k)] += opts.levenberg_marquardt;
                }
            }

            // dynamics
            if let Some(f) = functions.dynamics(stage) {
                let sim = &mut self.sim_out[i];
                config.integrator(i).integrate(
                    f,
                    x,
                    u,
                    nlp_in.time_step(i),
                    sensitivities,
                    &mut self.erk_ws[i],
                    sim,
                );
                qs.a.copy_from(&sim.a);
                qs.b.copy_from(&sim.b);
                qs.d.copy_from(&(&sim.x_next - &nlp_out.x[i + 1]));
            }

            // bounds, relative to the iterate
            let nbu = nlp_in.idxbu(i).len();
            for (k, &j) in nlp_in.idxbu(i).iter().enumerate() {
                qs.lb[k] = nlp_in.lbu(i)[k] - u[j];
                qs.ub[k] = nlp_in.ubu(i)[k] - u[j];
            }
            for (k, &j) in nlp_in.idxbx(i).iter().enumerate() {
                qs.lb[nbu + k] = nlp_in.lbx(i)[k] - x[j];
                qs.ub[nbu + k] = nlp_in.ubx(i)[k] - x[j];
            }
        }
        self.cost_value = cost_value;
    }

    /// KKT residuals of the iterate with its current multipliers.
    ///
    /// Relies on the QP built by the last `linearize`.
    fn compute_residuals(&self, nlp_out: &NlpOut) -> Residuals {
        let n = self.qp.horizon();
        let mut res = Residuals::default();

        for (i, qs) in self.qp.stages.iter().enumerate() {
            let nu = qs.nu();
            let nx = qs.nv() - nu;
            let nb = qs.nb();
            let lam = &nlp_out.lam[i];

            // stationarity
            let mut grad = qs.g.clone();
            if i < n {
                let pi = &nlp_out.pi[i];
                let mut head = grad.rows_mut(0, nu);
                head -= qs.b.tr_mul(pi);
                let mut tail = grad.rows_mut(nu, nx);
                tail -= qs.a.tr_mul(pi);
            }
            if i > 0 {
                let mut tail = grad.rows_mut(nu, nx);
                tail += &nlp_out.pi[i - 1];
            }
            for k in 0..nb {
                grad[qs.idxb[k]] += lam[nb + k] - lam[k];
            }
            res.stat = nan_max(res.stat, inf_norm(&grad));

            if i < n {
                res.eq = nan_max(res.eq, inf_norm(&qs.d));
            }

            for k in 0..nb {
                // lb, ub are relative: lower violation lb, upper violation -ub
                let violation = nan_max(nan_max(qs.lb[k], -qs.ub[k]), 0.0);
                if qs.is_eq[k] {
                    res.eq = nan_max(res.eq, violation);
                    continue;
                }
                res.ineq = nan_max(res.ineq, violation);
                if is_finite_bound(qs.lb[k]) {
                    res.comp = nan_max(res.comp, (lam[k] * qs.lb[k]).abs());
                }
                if is_finite_bound(qs.ub[k]) {
                    res.comp = nan_max(res.comp, (lam[nb + k] * qs.ub[k]).abs());
                }
            }
        }
        res
    }

    /// `w += alpha dw`, multipliers replaced by the QP multipliers
    fn apply_step(&self, nlp_out: &mut NlpOut, alpha: f64) {
        for (i, dv) in self.qp_sol.dv.iter().enumerate() {
            let nu = nlp_out.u[i].len();
            let nx = nlp_out.x[i].len();
            nlp_out.u[i].axpy(alpha, &dv.rows(0, nu), 1.0);
            nlp_out.x[i].axpy(alpha, &dv.rows(nu, nx), 1.0);
        }
        for (pi, qp_pi) in nlp_out.pi.iter_mut().zip(&self.qp_sol.pi) {
            pi.copy_from(qp_pi);
        }
        for (lam, qp_lam) in nlp_out.lam.iter_mut().zip(&self.qp_sol.lam) {
            lam.copy_from(qp_lam);
        }
    }
}
