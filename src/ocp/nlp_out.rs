//! Primal-dual iterate, persisted across solves for warm starting

use nalgebra::DVector;

use crate::common::{MpcError, MpcResult};
use crate::ocp::dims::OcpDims;

/// States, controls and multipliers of every node.
///
/// Node vectors keep the sizes fixed by the dimensions; outside the crate
/// they are written through the length-checked setters only.
#[derive(Debug, Clone, PartialEq)]
pub struct NlpOut {
    /// States, N+1 nodes
    pub(crate) x: Vec<DVector<f64>>,
    /// Controls, N+1 nodes (empty at node N)
    pub(crate) u: Vec<DVector<f64>>,
    /// Dynamics multipliers, N intervals
    pub(crate) pi: Vec<DVector<f64>>,
    /// Bound multipliers `[lam_lbu; lam_lbx; lam_ubu; lam_ubx]`, N+1 nodes
    pub(crate) lam: Vec<DVector<f64>>,
}

impl NlpOut {
    /// Zero iterate shaped after `dims`
    pub fn new(dims: &OcpDims) -> Self {
        let n = dims.n;
        NlpOut {
            x: (0..=n).map(|i| DVector::zeros(dims.nx[i])).collect(),
            u: (0..=n).map(|i| DVector::zeros(dims.nu[i])).collect(),
            pi: (0..n).map(|i| DVector::zeros(dims.nx[i + 1])).collect(),
            lam: (0..=n).map(|i| DVector::zeros(2 * dims.nb(i))).collect(),
        }
    }

    pub fn horizon(&self) -> usize {
        self.pi.len()
    }

    /// Fill every node with `x_init`, `u_init`, and zero all multipliers.
    pub fn reset(&mut self, x_init: &DVector<f64>, u_init: &DVector<f64>) {
        for x in &mut self.x {
            x.copy_from(x_init);
        }
        for u in self.u.iter_mut().filter(|u| !u.is_empty()) {
            u.copy_from(u_init);
        }
        for pi in &mut self.pi {
            pi.fill(0.0);
        }
        for lam in &mut self.lam {
            lam.fill(0.0);
        }
    }

    pub fn set_x(&mut self, stage: usize, values: &[f64]) -> MpcResult<()> {
        set_checked(&mut self.x, "x", stage, values)
    }

    pub fn set_u(&mut self, stage: usize, values: &[f64]) -> MpcResult<()> {
        set_checked(&mut self.u, "u", stage, values)
    }

    pub fn set_pi(&mut self, stage: usize, values: &[f64]) -> MpcResult<()> {
        set_checked(&mut self.pi, "pi", stage, values)
    }

    pub fn x(&self, stage: usize) -> &DVector<f64> {
        &self.x[stage]
    }

    pub fn u(&self, stage: usize) -> &DVector<f64> {
        &self.u[stage]
    }

    pub fn pi(&self, stage: usize) -> &DVector<f64> {
        &self.pi[stage]
    }

    pub fn lam(&self, stage: usize) -> &DVector<f64> {
        &self.lam[stage]
    }

    /// Whether every entry of the iterate is finite
    pub fn is_finite(&self) -> bool {
        self.x
            .iter()
            .chain(&self.u)
            .chain(&self.pi)
            .chain(&self.lam)
            .all(|v| v.iter().all(|e| e.is_finite()))
    }
}

fn set_checked(
    slots: &mut [DVector<f64>],
    what: &str,
    stage: usize,
    values: &[f64],
) -> MpcResult<()> {
    let horizon = slots.len();
    let slot = slots
        .get_mut(stage)
        .ok_or(MpcError::StageOutOfRange { stage, horizon })?;
    if slot.len() != values.len() {
        return Err(MpcError::DimensionMismatch {
            what: format!("{} at stage {}", what, stage),
            expected: slot.len(),
            given: values.len(),
        });
    }
    slot.copy_from_slice(values);
    Ok(())
}
