//! Dimension metadata of the shooting-node horizon
//!
//! Built once per capsule and never resized. Node 0 and node N are special:
//! node 0 carries the equality-bounded initial state, node N has no control.

use crate::common::{MpcError, MpcResult, Stage};

/// Per-node dimensions of the optimal control problem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcpDims {
    /// Number of shooting intervals N
    pub n: usize,
    /// Parameters per stage
    pub np: usize,
    pub nx: Vec<usize>,
    pub nu: Vec<usize>,
    /// Residual dimension of the least-squares cost
    pub ny: Vec<usize>,
    /// Bounded state components
    pub nbx: Vec<usize>,
    /// Bounded control components
    pub nbu: Vec<usize>,
    /// State bounds marked as equalities
    pub nbxe: Vec<usize>,
}

impl OcpDims {
    /// Uniform state/control sizes; terminal node gets no control.
    pub fn new(n: usize, nx: usize, nu: usize, np: usize) -> Self {
        let mut nu_v = vec![nu; n + 1];
        nu_v[n] = 0;
        OcpDims {
            n,
            np,
            nx: vec![nx; n + 1],
            nu: nu_v,
            ny: vec![0; n + 1],
            nbx: vec![0; n + 1],
            nbu: vec![0; n + 1],
            nbxe: vec![0; n + 1],
        }
    }

    /// Residual sizes for node 0, nodes 1..N-1 and node N
    pub fn with_cost(mut self, ny_0: usize, ny: usize, ny_e: usize) -> Self {
        for i in 0..=self.n {
            self.ny[i] = match Stage::from_index(i, self.n) {
                Some(Stage::Initial) => ny_0,
                Some(Stage::Terminal) => ny_e,
                _ => ny,
            };
        }
        self
    }

    /// State bound counts for node 0 (with equality count), nodes 1..N-1 and node N
    pub fn with_state_bounds(mut self, nbx_0: usize, nbxe_0: usize, nbx: usize, nbx_e: usize) -> Self {
        for i in 0..=self.n {
            self.nbx[i] = match Stage::from_index(i, self.n) {
                Some(Stage::Initial) => nbx_0,
                Some(Stage::Terminal) => nbx_e,
                _ => nbx,
            };
        }
        self.nbxe[0] = nbxe_0;
        self
    }

    /// Control bound count for nodes 0..N-1
    pub fn with_control_bounds(mut self, nbu: usize) -> Self {
        for i in 0..self.n {
            self.nbu[i] = nbu;
        }
        self
    }

    pub fn horizon(&self) -> usize {
        self.n
    }

    /// Optimization variables `[u; x]` at node `i`
    pub fn nv(&self, i: usize) -> usize {
        self.nu[i] + self.nx[i]
    }

    /// Box constraints at node `i`
    pub fn nb(&self, i: usize) -> usize {
        self.nbu[i] + self.nbx[i]
    }

    /// Total optimization variables over the horizon
    pub fn total_vars(&self) -> usize {
        (0..=self.n).map(|i| self.nv(i)).sum()
    }

    pub fn stage(&self, i: usize) -> MpcResult<Stage> {
        Stage::from_index(i, self.n).ok_or(MpcError::StageOutOfRange {
            stage: i,
            horizon: self.n,
        })
    }

    /// Structural checks that do not depend on any numeric data
    pub fn validate(&self) -> MpcResult<()> {
        let expected = self.n + 1;
        for (what, v) in [
            ("nx", &self.nx),
            ("nu", &self.nu),
            ("ny", &self.ny),
            ("nbx", &self.nbx),
            ("nbu", &self.nbu),
            ("nbxe", &self.nbxe),
        ] {
            if v.len() != expected {
                return Err(MpcError::DimensionMismatch {
                    what: format!("{} entries", what),
                    expected,
                    given: v.len(),
                });
            }
        }
        if self.n == 0 {
            return Err(MpcError::Precompute("horizon must have at least one interval".to_string()));
        }
        if self.nu[self.n] != 0 {
            return Err(MpcError::DimensionMismatch {
                what: "terminal nu".to_string(),
                expected: 0,
                given: self.nu[self.n],
            });
        }
        for i in 0..=self.n {
            if self.nbx[i] > self.nx[i] {
                return Err(MpcError::DimensionMismatch {
                    what: format!("nbx at stage {}", i),
                    expected: self.nx[i],
                    given: self.nbx[i],
                });
            }
            if self.nbu[i] > self.nu[i] {
                return Err(MpcError::DimensionMismatch {
                    what: format!("nbu at stage {}", i),
                    expected: self.nu[i],
                    given: self.nbu[i],
                });
            }
            if self.nbxe[i] > self.nbx[i] {
                return Err(MpcError::DimensionMismatch {
                    what: format!("nbxe at stage {}", i),
                    expected: self.nbx[i],
                    given: self.nbxe[i],
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lateral_dims() -> OcpDims {
        OcpDims::new(16, 4, 1, 2)
            .with_cost(3, 3, 2)
            .with_state_bounds(4, 4, 2, 0)
    }

    #[test]
    fn test_special_nodes() {
        let dims = lateral_dims();
        assert_eq!(dims.nu[16], 0);
        assert_eq!(dims.nu[0], 1);
        assert_eq!(dims.ny[0], 3);
        assert_eq!(dims.ny[16], 2);
        assert_eq!(dims.nbx[0], 4);
        assert_eq!(dims.nbxe[0], 4);
        assert_eq!(dims.nbx[8], 2);
        assert_eq!(dims.nbx[16], 0);
        assert!(dims.validate().is_ok());
    }

    #[test]
    fn test_total_vars() {
        let dims = lateral_dims();
        assert_eq!(dims.total_vars(), 16 * 5 + 4);
        assert_eq!(dims.nv(16), 4);
    }

    #[test]
    fn test_validate_rejects_too_many_bounds() {
        let dims = OcpDims::new(4, 2, 1, 0).with_state_bounds(3, 0, 1, 0);
        assert!(matches!(dims.validate(), Err(MpcError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_stage_out_of_range() {
        let dims = lateral_dims();
        assert!(matches!(dims.stage(17), Err(MpcError::StageOutOfRange { stage: 17, .. })));
        assert_eq!(dims.stage(16).unwrap(), Stage::Terminal);
    }
}
