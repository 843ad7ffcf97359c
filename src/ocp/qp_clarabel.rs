//! QP backend on top of Clarabel
//!
//! The structured QP is stacked into one sparse conic problem
//!
//! ```text
//! min 0.5 zᵀ P z + qᵀ z   s.t.  A z + s = b,  s in {0}^m_eq x R+^m_ineq
//! ```
//!
//! with the dynamics and equality bounds in the zero cone and the one-sided
//! inequality bound rows in the nonnegative cone. Clarabel's stationarity
//! convention `P z + q + Aᵀ y = 0` matches the Lagrangian used by the SQP
//! driver, so the dual of a dynamics row is the dynamics multiplier as is.

use clarabel::algebra::CscMatrix;
use clarabel::solver::{
    DefaultSettings, DefaultSettingsBuilder, DefaultSolver, IPSolver, SolverStatus,
    SupportedConeT::{self, NonnegativeConeT, ZeroConeT},
};
use nalgebra::{DMatrix, DVector};

use crate::common::{MpcError, MpcResult};
use crate::ocp::dims::OcpDims;
use crate::ocp::options::SolverOptions;
use crate::ocp::qp::{is_finite_bound, OcpQp, QpBackend, QpOutcome, QpSolution, QpStatus};

/// Constraint rows generated for one bound
#[derive(Debug, Clone, Copy, Default)]
struct BoundRows {
    eq: Option<usize>,
    lower: Option<usize>,
    upper: Option<usize>,
}

/// Dense-assembled Clarabel backend, sized for short horizons
pub struct ClarabelBackend {
    settings: DefaultSettings<f64>,
    nv_total: usize,
}

impl ClarabelBackend {
    pub fn new() -> Self {
        ClarabelBackend {
            settings: DefaultSettings::default(),
            nv_total: 0,
        }
    }
}

impl Default for ClarabelBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl QpBackend for ClarabelBackend {
    fn name(&self) -> &str {
        "clarabel"
    }

    fn setup(&mut self, dims: &OcpDims, opts: &SolverOptions) -> MpcResult<()> {
        self.settings = DefaultSettingsBuilder::default()
            .max_iter(opts.qp_iter_max)
            .verbose(false)
            .tol_gap_abs(opts.qp_tol)
            .tol_gap_rel(opts.qp_tol)
            .tol_feas(opts.qp_tol)
            .build()
            .map_err(|e| MpcError::Precompute(format!("clarabel settings: {}", e)))?;
        self.nv_total = dims.total_vars();
        Ok(())
    }

    fn solve(&mut self, qp: &OcpQp, out: &mut QpSolution) -> QpOutcome {
        if qp.nv_total() != self.nv_total {
            log::error!(
                "clarabel backend set up for {} variables, QP has {}",
                self.nv_total,
                qp.nv_total()
            );
            return QpOutcome { status: QpStatus::NumericalError, iterations: 0 };
        }

        let offsets = variable_offsets(qp);
        let (p_mat, q_vec) = build_cost(qp, &offsets, self.nv_total);
        let (a_mat, b_vec, rows, n_eq, n_ineq) = build_constraints(qp, &offsets, self.nv_total);

        let p_csc = dmatrix_to_csc_upper_tri(&p_mat);
        let a_csc = dmatrix_to_csc(&a_mat);

        let mut cones: Vec<SupportedConeT<f64>> = Vec::with_capacity(2);
        if n_eq > 0 {
            cones.push(ZeroConeT(n_eq));
        }
        if n_ineq > 0 {
            cones.push(NonnegativeConeT(n_ineq));
        }

        let q_slice: Vec<f64> = q_vec.iter().copied().collect();
        let b_slice: Vec<f64> = b_vec.iter().copied().collect();

        let mut solver = match DefaultSolver::new(
            &p_csc,
            &q_slice,
            &a_csc,
            &b_slice,
            &cones,
            self.settings.clone(),
        ) {
            Ok(solver) => solver,
            Err(e) => {
                log::warn!("clarabel rejected the QP: {:?}", e);
                return QpOutcome { status: QpStatus::NumericalError, iterations: 0 };
            }
        };
        solver.solve();
        let sol = &solver.solution;

        let status = match sol.status {
            SolverStatus::Solved | SolverStatus::AlmostSolved => QpStatus::Success,
            SolverStatus::MaxIterations | SolverStatus::MaxTime => QpStatus::MaxIter,
            SolverStatus::PrimalInfeasible
            | SolverStatus::DualInfeasible
            | SolverStatus::AlmostPrimalInfeasible
            | SolverStatus::AlmostDualInfeasible => QpStatus::Infeasible,
            _ => QpStatus::NumericalError,
        };
        let iterations = sol.iterations as usize;

        if status == QpStatus::Success {
            extract_solution(qp, &offsets, &rows, &sol.x, &sol.z, out);
        }
        QpOutcome { status, iterations }
    }
}

/// Column offset of every node's `[u; x]` block
fn variable_offsets(qp: &OcpQp) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(qp.stages.len());
    let mut acc = 0;
    for stage in &qp.stages {
        offsets.push(acc);
        acc += stage.nv();
    }
    offsets
}

fn build_cost(qp: &OcpQp, offsets: &[usize], nv: usize) -> (DMatrix<f64>, DVector<f64>) {
    let mut p = DMatrix::zeros(nv, nv);
    let mut q = DVector::zeros(nv);
    for (stage, &off) in qp.stages.iter().zip(offsets) {
        let n = stage.nv();
        p.view_mut((off, off), (n, n)).copy_from(&stage.h);
        q.rows_mut(off, n).copy_from(&stage.g);
    }
    (p, q)
}

/// Stack dynamics, equality bounds, then inequality bounds.
///
/// Returns `(A, b, bound rows per node, n_eq, n_ineq)`.
#[allow(clippy::type_complexity)]
fn build_constraints(
    qp: &OcpQp,
    offsets: &[usize],
    nv: usize,
) -> (DMatrix<f64>, DVector<f64>, Vec<Vec<BoundRows>>, usize, usize) {
    let n = qp.horizon();
    let mut rows: Vec<Vec<BoundRows>> =
        qp.stages.iter().map(|s| vec![BoundRows::default(); s.nb()]).collect();

    let n_dyn: usize = qp.stages[..n].iter().map(|s| s.d.len()).sum();
    let n_eq_bounds: usize = qp
        .stages
        .iter()
        .map(|s| s.is_eq.iter().filter(|&&e| e).count())
        .sum();
    let n_ineq: usize = qp
        .stages
        .iter()
        .map(|s| {
            (0..s.nb())
                .filter(|&k| !s.is_eq[k])
                .map(|k| is_finite_bound(s.lb[k]) as usize + is_finite_bound(s.ub[k]) as usize)
                .sum::<usize>()
        })
        .sum();
    let n_eq = n_dyn + n_eq_bounds;

    let mut a = DMatrix::zeros(n_eq + n_ineq, nv);
    let mut b = DVector::zeros(n_eq + n_ineq);
    let mut row = 0;

    // x_{i+1} - A x_i - B u_i = d_i
    for i in 0..n {
        let stage = &qp.stages[i];
        let nx_next = stage.d.len();
        let (nu, nx) = (stage.nu(), stage.a.ncols());
        let off = offsets[i];
        let off_next = offsets[i + 1] + qp.stages[i + 1].nu();

        a.view_mut((row, off), (nx_next, nu)).copy_from(&(-&stage.b));
        a.view_mut((row, off + nu), (nx_next, nx)).copy_from(&(-&stage.a));
        for k in 0..nx_next {
            a[(row + k, off_next + k)] = 1.0;
        }
        b.rows_mut(row, nx_next).copy_from(&stage.d);
        row += nx_next;
    }

    for (i, stage) in qp.stages.iter().enumerate() {
        for k in 0..stage.nb() {
            if stage.is_eq[k] {
                a[(row, offsets[i] + stage.idxb[k])] = 1.0;
                b[row] = stage.ub[k];
                rows[i][k].eq = Some(row);
                row += 1;
            }
        }
    }

    for (i, stage) in qp.stages.iter().enumerate() {
        for k in 0..stage.nb() {
            if stage.is_eq[k] {
                continue;
            }
            let col = offsets[i] + stage.idxb[k];
            if is_finite_bound(stage.ub[k]) {
                a[(row, col)] = 1.0;
                b[row] = stage.ub[k];
                rows[i][k].upper = Some(row);
                row += 1;
            }
            if is_finite_bound(stage.lb[k]) {
                a[(row, col)] = -1.0;
                b[row] = -stage.lb[k];
                rows[i][k].lower = Some(row);
                row += 1;
            }
        }
    }

    (a, b, rows, n_eq, n_ineq)
}

fn extract_solution(
    qp: &OcpQp,
    offsets: &[usize],
    rows: &[Vec<BoundRows>],
    x: &[f64],
    z: &[f64],
    out: &mut QpSolution,
) {
    for (i, stage) in qp.stages.iter().enumerate() {
        out.dv[i].copy_from_slice(&x[offsets[i]..offsets[i] + stage.nv()]);
    }

    let mut row = 0;
    for pi in &mut out.pi {
        let len = pi.len();
        pi.copy_from_slice(&z[row..row + len]);
        row += len;
    }

    for (i, stage) in qp.stages.iter().enumerate() {
        let nb = stage.nb();
        let lam = &mut out.lam[i];
        lam.fill(0.0);
        for (k, r) in rows[i].iter().enumerate() {
            if let Some(r) = r.eq {
                // signed multiplier split into its one-sided parts
                lam[nb + k] = z[r].max(0.0);
                lam[k] = (-z[r]).max(0.0);
            }
            if let Some(r) = r.upper {
                lam[nb + k] = z[r].max(0.0);
            }
            if let Some(r) = r.lower {
                lam[k] = z[r].max(0.0);
            }
        }
    }
}

/// Convert a nalgebra `DMatrix<f64>` to a Clarabel `CscMatrix<f64>` (full matrix).
fn dmatrix_to_csc(m: &DMatrix<f64>) -> CscMatrix<f64> {
    let (nrows, ncols) = m.shape();
    let mut colptr = vec![0usize; ncols + 1];
    let mut rowval = Vec::new();
    let mut nzval = Vec::new();

    for j in 0..ncols {
        for i in 0..nrows {
            let v = m[(i, j)];
            if v != 0.0 {
                rowval.push(i);
                nzval.push(v);
            }
        }
        colptr[j + 1] = rowval.len();
    }

    CscMatrix::new(nrows, ncols, colptr, rowval, nzval)
}

/// Convert a symmetric nalgebra `DMatrix<f64>` to upper-triangular `CscMatrix<f64>`.
fn dmatrix_to_csc_upper_tri(m: &DMatrix<f64>) -> CscMatrix<f64> {
    let (nrows, ncols) = m.shape();
    let mut colptr = vec![0usize; ncols + 1];
    let mut rowval = Vec::new();
    let mut nzval = Vec::new();

    for j in 0..ncols {
        for i in 0..=j.min(nrows.saturating_sub(1)) {
            let v = m[(i, j)];
            if v != 0.0 {
                rowval.push(i);
                nzval.push(v);
            }
        }
        colptr[j + 1] = rowval.len();
    }

    CscMatrix::new(nrows, ncols, colptr, rowval, nzval)
}
