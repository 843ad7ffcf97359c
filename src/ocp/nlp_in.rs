//! Numeric problem input: time steps, cost weights and references, bounds
//!
//! Index sets are structural and fixed when the capsule is built. Values are
//! changed between solves through the stage-indexed `set`.

use std::fmt;
use std::str::FromStr;

use nalgebra::{DMatrix, DVector};

use crate::common::{MpcError, MpcResult, Stage};
use crate::ocp::dims::OcpDims;

/// Relative tolerance of the symmetry and PSD checks on weight matrices
const WEIGHT_TOL: f64 = 1e-10;

/// Per-stage quantity settable through `NlpIn::set`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NlpField {
    /// Cost weight, `ny x ny`, column-major
    W,
    Yref,
    Lbx,
    Ubx,
    Lbu,
    Ubu,
    /// Cost scaling factor (the stage time step by default)
    Scaling,
}

impl FromStr for NlpField {
    type Err = MpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "W" => Ok(NlpField::W),
            "yref" => Ok(NlpField::Yref),
            "lbx" => Ok(NlpField::Lbx),
            "ubx" => Ok(NlpField::Ubx),
            "lbu" => Ok(NlpField::Lbu),
            "ubu" => Ok(NlpField::Ubu),
            "scaling" => Ok(NlpField::Scaling),
            _ => Err(MpcError::UnknownField(s.to_string())),
        }
    }
}

impl fmt::Display for NlpField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NlpField::W => "W",
            NlpField::Yref => "yref",
            NlpField::Lbx => "lbx",
            NlpField::Ubx => "ubx",
            NlpField::Lbu => "lbu",
            NlpField::Ubu => "ubu",
            NlpField::Scaling => "scaling",
        };
        write!(f, "{}", name)
    }
}

/// Bound index sets of every node
#[derive(Debug, Clone, Default)]
pub struct BoundIndices {
    /// Bounded state components per node
    pub idxbx: Vec<Vec<usize>>,
    /// Positions within `idxbx` that are equality bounds
    pub idxbxe: Vec<Vec<usize>>,
    /// Bounded control components per node
    pub idxbu: Vec<Vec<usize>>,
}

#[derive(Debug, Clone)]
struct StageCost {
    w: DMatrix<f64>,
    yref: DVector<f64>,
    scaling: f64,
}

#[derive(Debug, Clone)]
struct StageBounds {
    idxbx: Vec<usize>,
    idxbxe: Vec<usize>,
    lbx: DVector<f64>,
    ubx: DVector<f64>,
    idxbu: Vec<usize>,
    lbu: DVector<f64>,
    ubu: DVector<f64>,
}

/// Problem input of all N+1 nodes
#[derive(Debug, Clone)]
pub struct NlpIn {
    n: usize,
    time_steps: Vec<f64>,
    cost: Vec<StageCost>,
    bounds: Vec<StageBounds>,
    params: Vec<DVector<f64>>,
}

fn check_index_set(
    stage: usize,
    what: &str,
    idx: &[usize],
    count: usize,
    limit: usize,
) -> MpcResult<()> {
    if idx.len() != count {
        return Err(MpcError::DimensionMismatch {
            what: format!("{} at stage {}", what, stage),
            expected: count,
            given: idx.len(),
        });
    }
    for (k, &j) in idx.iter().enumerate() {
        if j >= limit {
            return Err(MpcError::InvalidBounds {
                stage,
                message: format!("{} entry {} out of range (limit {})", what, j, limit),
            });
        }
        if idx[..k].contains(&j) {
            return Err(MpcError::InvalidBounds {
                stage,
                message: format!("{} contains {} twice", what, j),
            });
        }
    }
    Ok(())
}

fn check_len(what: NlpField, stage: usize, expected: usize, values: &[f64]) -> MpcResult<()> {
    if values.len() != expected {
        return Err(MpcError::DimensionMismatch {
            what: format!("{} at stage {}", what, stage),
            expected,
            given: values.len(),
        });
    }
    Ok(())
}

/// Symmetric positive semidefinite within `WEIGHT_TOL`
fn check_weight(stage: usize, w: &DMatrix<f64>) -> MpcResult<()> {
    if w.iter().any(|v| !v.is_finite()) {
        return Err(MpcError::InvalidWeight {
            stage,
            message: "non-finite entry".to_string(),
        });
    }
    let scale = w.amax().max(1.0);
    if (w - w.transpose()).amax() > WEIGHT_TOL * scale {
        return Err(MpcError::InvalidWeight {
            stage,
            message: "not symmetric".to_string(),
        });
    }
    if w.nrows() > 0 {
        let min_eig = w.clone().symmetric_eigen().eigenvalues.min();
        if min_eig < -WEIGHT_TOL * scale {
            return Err(MpcError::InvalidWeight {
                stage,
                message: format!("negative eigenvalue {:e}", min_eig),
            });
        }
    }
    Ok(())
}

impl NlpIn {
    /// Zero-initialised input with the given bound index sets.
    ///
    /// Weights start at zero, scaling at one, bounds at zero; the builder
    /// fills them in through `set`.
    pub fn new(dims: &OcpDims, idx: &BoundIndices) -> MpcResult<Self> {
        let n = dims.n;
        for (what, v) in [("idxbx", &idx.idxbx), ("idxbxe", &idx.idxbxe), ("idxbu", &idx.idxbu)] {
            if v.len() != n + 1 {
                return Err(MpcError::DimensionMismatch {
                    what: format!("{} stages", what),
                    expected: n + 1,
                    given: v.len(),
                });
            }
        }

        let mut cost = Vec::with_capacity(n + 1);
        let mut bounds = Vec::with_capacity(n + 1);
        for i in 0..=n {
            check_index_set(i, "idxbx", &idx.idxbx[i], dims.nbx[i], dims.nx[i])?;
            check_index_set(i, "idxbxe", &idx.idxbxe[i], dims.nbxe[i], dims.nbx[i])?;
            check_index_set(i, "idxbu", &idx.idxbu[i], dims.nbu[i], dims.nu[i])?;

            cost.push(StageCost {
                w: DMatrix::zeros(dims.ny[i], dims.ny[i]),
                yref: DVector::zeros(dims.ny[i]),
                scaling: 1.0,
            });
            bounds.push(StageBounds {
                idxbx: idx.idxbx[i].clone(),
                idxbxe: idx.idxbxe[i].clone(),
                lbx: DVector::zeros(dims.nbx[i]),
                ubx: DVector::zeros(dims.nbx[i]),
                idxbu: idx.idxbu[i].clone(),
                lbu: DVector::zeros(dims.nbu[i]),
                ubu: DVector::zeros(dims.nbu[i]),
            });
        }

        Ok(NlpIn {
            n,
            time_steps: vec![0.0; n],
            cost,
            bounds,
            params: vec![DVector::zeros(dims.np); n + 1],
        })
    }

    pub fn horizon(&self) -> usize {
        self.n
    }

    /// Set all shooting interval lengths; each must be positive and finite.
    pub fn set_time_steps(&mut self, time_steps: &[f64]) -> MpcResult<()> {
        if time_steps.len() != self.n {
            return Err(MpcError::DimensionMismatch {
                what: "time steps".to_string(),
                expected: self.n,
                given: time_steps.len(),
            });
        }
        if let Some((stage, &value)) = time_steps
            .iter()
            .enumerate()
            .find(|(_, t)| !(t.is_finite() && **t > 0.0))
        {
            return Err(MpcError::InvalidTimeStep { stage, value });
        }
        self.time_steps.copy_from_slice(time_steps);
        Ok(())
    }

    pub fn time_steps(&self) -> &[f64] {
        &self.time_steps
    }

    pub fn time_step(&self, i: usize) -> f64 {
        self.time_steps[i]
    }

    /// Set `field` at node `stage`. Nothing is written unless `values` is valid.
    pub fn set(&mut self, stage: usize, field: NlpField, values: &[f64]) -> MpcResult<()> {
        if stage > self.n {
            return Err(MpcError::StageOutOfRange { stage, horizon: self.n });
        }
        let cost = &mut self.cost[stage];
        let bounds = &mut self.bounds[stage];
        match field {
            NlpField::W => {
                let ny = cost.yref.len();
                check_len(field, stage, ny * ny, values)?;
                let w = DMatrix::from_column_slice(ny, ny, values);
                check_weight(stage, &w)?;
                cost.w = w;
            }
            NlpField::Yref => {
                check_len(field, stage, cost.yref.len(), values)?;
                cost.yref.copy_from_slice(values);
            }
            NlpField::Scaling => {
                check_len(field, stage, 1, values)?;
                if !(values[0].is_finite() && values[0] >= 0.0) {
                    return Err(MpcError::InvalidWeight {
                        stage,
                        message: format!("cost scaling {} must be non-negative", values[0]),
                    });
                }
                cost.scaling = values[0];
            }
            NlpField::Lbx => {
                check_len(field, stage, bounds.lbx.len(), values)?;
                bounds.lbx.copy_from_slice(values);
            }
            NlpField::Ubx => {
                check_len(field, stage, bounds.ubx.len(), values)?;
                bounds.ubx.copy_from_slice(values);
            }
            NlpField::Lbu | NlpField::Ubu if stage == self.n => {
                return Err(MpcError::FieldNotAvailable {
                    field: field.to_string(),
                    stage,
                });
            }
            NlpField::Lbu => {
                check_len(field, stage, bounds.lbu.len(), values)?;
                bounds.lbu.copy_from_slice(values);
            }
            NlpField::Ubu => {
                check_len(field, stage, bounds.ubu.len(), values)?;
                bounds.ubu.copy_from_slice(values);
            }
        }
        Ok(())
    }

    /// Pin the initial state: lbx = ubx = `x0` on node 0.
    ///
    /// Requires node 0 to bound every state component.
    pub fn set_initial_state(&mut self, x0: &[f64]) -> MpcResult<()> {
        let b = &mut self.bounds[0];
        check_len(NlpField::Lbx, 0, b.idxbx.len(), x0)?;
        if b.idxbx.iter().any(|&j| j >= x0.len()) {
            return Err(MpcError::InvalidBounds {
                stage: 0,
                message: "node 0 does not bound every state".to_string(),
            });
        }
        if x0.iter().any(|v| !v.is_finite()) {
            return Err(MpcError::InvalidBounds {
                stage: 0,
                message: "initial state must be finite".to_string(),
            });
        }
        for (k, &j) in b.idxbx.iter().enumerate() {
            b.lbx[k] = x0[j];
            b.ubx[k] = x0[j];
        }
        Ok(())
    }

    /// Check `lb <= ub` everywhere and `lb == ub` on equality bounds
    pub fn validate_bounds(&self) -> MpcResult<()> {
        for (stage, b) in self.bounds.iter().enumerate() {
            for k in 0..b.idxbx.len() {
                if !(b.lbx[k] <= b.ubx[k]) {
                    return Err(MpcError::InvalidBounds {
                        stage,
                        message: format!(
                            "lbx[{}] = {} above ubx[{}] = {}",
                            k, b.lbx[k], k, b.ubx[k]
                        ),
                    });
                }
            }
            for &k in &b.idxbxe {
                if b.lbx[k] != b.ubx[k] {
                    return Err(MpcError::InvalidBounds {
                        stage,
                        message: format!("equality bound {} has lbx != ubx", k),
                    });
                }
            }
            for k in 0..b.idxbu.len() {
                if !(b.lbu[k] <= b.ubu[k]) {
                    return Err(MpcError::InvalidBounds {
                        stage,
                        message: format!(
                            "lbu[{}] = {} above ubu[{}] = {}",
                            k, b.lbu[k], k, b.ubu[k]
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn w(&self, stage: usize) -> &DMatrix<f64> {
        &self.cost[stage].w
    }

    pub fn yref(&self, stage: usize) -> &DVector<f64> {
        &self.cost[stage].yref
    }

    pub fn scaling(&self, stage: usize) -> f64 {
        self.cost[stage].scaling
    }

    pub fn idxbx(&self, stage: usize) -> &[usize] {
        &self.bounds[stage].idxbx
    }

    pub fn idxbxe(&self, stage: usize) -> &[usize] {
        &self.bounds[stage].idxbxe
    }

    pub fn lbx(&self, stage: usize) -> &DVector<f64> {
        &self.bounds[stage].lbx
    }

    pub fn ubx(&self, stage: usize) -> &DVector<f64> {
        &self.bounds[stage].ubx
    }

    pub fn idxbu(&self, stage: usize) -> &[usize] {
        &self.bounds[stage].idxbu
    }

    pub fn lbu(&self, stage: usize) -> &DVector<f64> {
        &self.bounds[stage].lbu
    }

    pub fn ubu(&self, stage: usize) -> &DVector<f64> {
        &self.bounds[stage].ubu
    }

    /// Last parameter vector pushed to `stage`
    pub fn params(&self, stage: Stage) -> &DVector<f64> {
        &self.params[stage.index(self.n)]
    }

    pub(crate) fn mirror_params(&mut self, stage: Stage, p: &[f64]) {
        self.params[stage.index(self.n)].copy_from_slice(p);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> NlpIn {
        let dims = OcpDims::new(3, 2, 1, 1)
            .with_cost(2, 2, 1)
            .with_state_bounds(2, 2, 1, 0)
            .with_control_bounds(1);
        let idx = BoundIndices {
            idxbx: vec![vec![0, 1], vec![1], vec![1], vec![]],
            idxbxe: vec![vec![0, 1], vec![], vec![], vec![]],
            idxbu: vec![vec![0], vec![0], vec![0], vec![]],
        };
        NlpIn::new(&dims, &idx).unwrap()
    }

    #[test]
    fn test_field_names() {
        assert_eq!("W".parse::<NlpField>().unwrap(), NlpField::W);
        assert_eq!("yref".parse::<NlpField>().unwrap(), NlpField::Yref);
        assert_eq!("scaling".parse::<NlpField>().unwrap(), NlpField::Scaling);
        assert!(matches!("zl".parse::<NlpField>(), Err(MpcError::UnknownField(_))));
        assert_eq!(NlpField::Lbu.to_string(), "lbu");
    }

    #[test]
    fn test_set_weight_checks_psd() {
        let mut nlp_in = small();
        nlp_in.set(1, NlpField::W, &[2.0, 0.5, 0.5, 1.0]).unwrap();
        assert_eq!(nlp_in.w(1)[(0, 1)], 0.5);

        let err = nlp_in.set(1, NlpField::W, &[1.0, 2.0, 2.0, 1.0]);
        assert!(matches!(err, Err(MpcError::InvalidWeight { stage: 1, .. })));
        let err = nlp_in.set(1, NlpField::W, &[1.0, 0.0, 0.3, 1.0]);
        assert!(matches!(err, Err(MpcError::InvalidWeight { .. })));
        // rejected writes leave the previous value in place
        assert_eq!(nlp_in.w(1)[(0, 0)], 2.0);
    }

    #[test]
    fn test_set_wrong_length() {
        let mut nlp_in = small();
        assert!(matches!(
            nlp_in.set(3, NlpField::Yref, &[1.0, 2.0]),
            Err(MpcError::DimensionMismatch { expected: 1, given: 2, .. })
        ));
        assert!(matches!(
            nlp_in.set(4, NlpField::Yref, &[1.0]),
            Err(MpcError::StageOutOfRange { stage: 4, horizon: 3 })
        ));
        assert!(matches!(
            nlp_in.set(3, NlpField::Lbu, &[]),
            Err(MpcError::FieldNotAvailable { stage: 3, .. })
        ));
    }

    #[test]
    fn test_bounds_validation() {
        let mut nlp_in = small();
        nlp_in.set_initial_state(&[1.0, -1.0]).unwrap();
        nlp_in.set(1, NlpField::Lbx, &[-1.0]).unwrap();
        nlp_in.set(1, NlpField::Ubx, &[1.0]).unwrap();
        assert!(nlp_in.validate_bounds().is_ok());

        nlp_in.set(2, NlpField::Lbx, &[0.5]).unwrap();
        assert!(matches!(
            nlp_in.validate_bounds(),
            Err(MpcError::InvalidBounds { stage: 2, .. })
        ));
    }

    #[test]
    fn test_time_steps() {
        let mut nlp_in = small();
        nlp_in.set_time_steps(&[0.1, 0.2, 0.3]).unwrap();
        assert_eq!(nlp_in.time_step(2), 0.3);
        assert!(matches!(
            nlp_in.set_time_steps(&[0.1, 0.0, 0.3]),
            Err(MpcError::InvalidTimeStep { stage: 1, .. })
        ));
    }

    #[test]
    fn test_bad_index_set_rejected() {
        let dims = OcpDims::new(1, 2, 1, 0).with_state_bounds(2, 0, 0, 0);
        let idx = BoundIndices {
            idxbx: vec![vec![0, 0], vec![]],
            idxbxe: vec![vec![], vec![]],
            idxbu: vec![vec![], vec![]],
        };
        assert!(matches!(NlpIn::new(&dims, &idx), Err(MpcError::InvalidBounds { .. })));
    }
}
