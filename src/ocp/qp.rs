//! Structured QP subproblem and the backend seam
//!
//! One block per shooting node, variables `[du_i; dx_i]`:
//!
//! ```text
//! min  sum_i 0.5 dv_iᵀ H_i dv_i + g_iᵀ dv_i
//! s.t. dx_{i+1} = A_i dx_i + B_i du_i + d_i          i = 0..N-1
//!      lb_i <= dv_i[idxb_i] <= ub_i                   i = 0..N
//! ```
//!
//! Bounds are relative to the current iterate, so `dv = 0` is the iterate
//! itself. Equality bounds (`is_eq`) have `lb == ub`.

use nalgebra::{DMatrix, DVector};

use crate::common::MpcResult;
use crate::ocp::dims::OcpDims;
use crate::ocp::options::SolverOptions;

/// Bound magnitudes at or above this are treated as absent
pub const INFINITE_BOUND: f64 = 1e20;

/// Whether a bound value actually constrains
pub fn is_finite_bound(v: f64) -> bool {
    v.is_finite() && v.abs() < INFINITE_BOUND
}

/// QP data of one node
#[derive(Debug, Clone)]
pub struct QpStage {
    /// Hessian over `[u; x]`
    pub h: DMatrix<f64>,
    pub g: DVector<f64>,
    /// State sensitivity of the transition to the next node (empty at node N)
    pub a: DMatrix<f64>,
    /// Control sensitivity of the transition to the next node
    pub b: DMatrix<f64>,
    /// Transition defect `phi(x_i, u_i) - x_{i+1}`
    pub d: DVector<f64>,
    /// Bounded positions within `[u; x]`
    pub idxb: Vec<usize>,
    pub lb: DVector<f64>,
    pub ub: DVector<f64>,
    pub is_eq: Vec<bool>,
}

impl QpStage {
    pub fn nu(&self) -> usize {
        self.b.ncols()
    }

    pub fn nv(&self) -> usize {
        self.g.len()
    }

    pub fn nb(&self) -> usize {
        self.idxb.len()
    }
}

/// QP over the whole horizon
#[derive(Debug, Clone)]
pub struct OcpQp {
    pub stages: Vec<QpStage>,
}

impl OcpQp {
    /// Allocate a QP for `dims`. `idxb[i]` are positions in `[u; x]`,
    /// `is_eq[i]` flags the equality bounds among them.
    pub fn new(dims: &OcpDims, idxb: Vec<Vec<usize>>, is_eq: Vec<Vec<bool>>) -> Self {
        let n = dims.n;
        let stages = idxb
            .into_iter()
            .zip(is_eq)
            .enumerate()
            .map(|(i, (idxb, is_eq))| {
                let nv = dims.nv(i);
                let (nx_next, nx, nu) = if i < n {
                    (dims.nx[i + 1], dims.nx[i], dims.nu[i])
                } else {
                    (0, dims.nx[i], dims.nu[i])
                };
                let nb = idxb.len();
                QpStage {
                    h: DMatrix::zeros(nv, nv),
                    g: DVector::zeros(nv),
                    a: DMatrix::zeros(nx_next, nx),
                    b: DMatrix::zeros(nx_next, nu),
                    d: DVector::zeros(nx_next),
                    idxb,
                    lb: DVector::zeros(nb),
                    ub: DVector::zeros(nb),
                    is_eq,
                }
            })
            .collect();
        OcpQp { stages }
    }

    pub fn horizon(&self) -> usize {
        self.stages.len() - 1
    }

    /// Total QP variables
    pub fn nv_total(&self) -> usize {
        self.stages.iter().map(|s| s.nv()).sum()
    }
}

/// Primal-dual solution of an `OcpQp`
#[derive(Debug, Clone)]
pub struct QpSolution {
    /// Step `[du_i; dx_i]` per node
    pub dv: Vec<DVector<f64>>,
    /// Dynamics multipliers per interval
    pub pi: Vec<DVector<f64>>,
    /// Bound multipliers `[lam_lb; lam_ub]` per node, both non-negative
    pub lam: Vec<DVector<f64>>,
}

impl QpSolution {
    pub fn new(qp: &OcpQp) -> Self {
        QpSolution {
            dv: qp.stages.iter().map(|s| DVector::zeros(s.nv())).collect(),
            pi: qp.stages[..qp.horizon()]
                .iter()
                .map(|s| DVector::zeros(s.d.len()))
                .collect(),
            lam: qp.stages.iter().map(|s| DVector::zeros(2 * s.nb())).collect(),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.dv
            .iter()
            .chain(&self.pi)
            .chain(&self.lam)
            .all(|v| v.iter().all(|e| e.is_finite()))
    }
}

/// Exit status of a QP solve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpStatus {
    Success,
    MaxIter,
    Infeasible,
    NumericalError,
}

impl QpStatus {
    /// Integer code shown in the statistics table
    pub fn code(self) -> i32 {
        match self {
            QpStatus::Success => 0,
            QpStatus::MaxIter => 1,
            QpStatus::NumericalError => 3,
            QpStatus::Infeasible => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpOutcome {
    pub status: QpStatus,
    pub iterations: usize,
}

/// Structured QP solver used by the SQP driver
pub trait QpBackend: Send {
    fn name(&self) -> &str;

    /// Structure-dependent setup, run once before the first solve and again
    /// whenever options change.
    fn setup(&mut self, dims: &OcpDims, opts: &SolverOptions) -> MpcResult<()>;

    /// Solve `qp` into `out`. `out` is only meaningful on `QpStatus::Success`.
    fn solve(&mut self, qp: &OcpQp, out: &mut QpSolution) -> QpOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_follows_dims() {
        let dims = OcpDims::new(3, 2, 1, 0).with_state_bounds(2, 2, 1, 0);
        let idxb = vec![vec![1, 2], vec![2], vec![2], vec![]];
        let is_eq = vec![vec![true, true], vec![false], vec![false], vec![]];
        let qp = OcpQp::new(&dims, idxb, is_eq);

        assert_eq!(qp.horizon(), 3);
        assert_eq!(qp.nv_total(), 3 * 3 + 2);
        assert_eq!(qp.stages[0].h.shape(), (3, 3));
        assert_eq!(qp.stages[0].b.shape(), (2, 1));
        assert_eq!(qp.stages[3].a.shape(), (0, 2));
        assert_eq!(qp.stages[3].nu(), 0);

        let sol = QpSolution::new(&qp);
        assert_eq!(sol.pi.len(), 3);
        assert_eq!(sol.lam[0].len(), 4);
        assert_eq!(sol.dv[3].len(), 2);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(QpStatus::Success.code(), 0);
        assert_eq!(QpStatus::MaxIter.code(), 1);
        assert_ne!(QpStatus::Infeasible.code(), QpStatus::NumericalError.code());
    }
}
