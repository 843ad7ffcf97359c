//! Common types used throughout lateral_mpc

use std::fmt;

/// Role of a shooting node within the horizon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Node 0: initial state pinned by equality bounds, own residual map
    Initial,
    /// Nodes 1..N-1
    Intermediate(usize),
    /// Node N: no control, no dynamics, terminal residual map
    Terminal,
}

impl Stage {
    /// Classify node `index` of a horizon with `horizon` intervals.
    ///
    /// Returns `None` when `index > horizon`.
    pub fn from_index(index: usize, horizon: usize) -> Option<Self> {
        if index == 0 {
            Some(Stage::Initial)
        } else if index < horizon {
            Some(Stage::Intermediate(index))
        } else if index == horizon {
            Some(Stage::Terminal)
        } else {
            None
        }
    }

    /// Node index of this stage for a horizon with `horizon` intervals
    pub fn index(&self, horizon: usize) -> usize {
        match *self {
            Stage::Initial => 0,
            Stage::Intermediate(i) => i,
            Stage::Terminal => horizon,
        }
    }

    /// Whether the node carries dynamics towards the next node
    pub fn has_dynamics(&self) -> bool {
        !matches!(self, Stage::Terminal)
    }

    /// Iterate over all N+1 nodes in order
    pub fn all(horizon: usize) -> impl Iterator<Item = Stage> {
        (0..=horizon).filter_map(move |i| Stage::from_index(i, horizon))
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Initial => write!(f, "initial"),
            Stage::Intermediate(i) => write!(f, "intermediate({})", i),
            Stage::Terminal => write!(f, "terminal"),
        }
    }
}

/// Compressed-column sparsity pattern of an external function input/output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sparsity {
    pub nrow: usize,
    pub ncol: usize,
    /// Column pointers, length `ncol + 1`
    pub colind: Vec<usize>,
    /// Row index of each structural nonzero
    pub row: Vec<usize>,
}

impl Sparsity {
    /// Fully dense pattern
    pub fn dense(nrow: usize, ncol: usize) -> Self {
        let colind = (0..=ncol).map(|c| c * nrow).collect();
        let row = (0..ncol).flat_map(|_| 0..nrow).collect();
        Sparsity { nrow, ncol, colind, row }
    }

    /// Pattern from a list of `(row, col)` nonzero positions (duplicates ignored)
    pub fn from_entries(nrow: usize, ncol: usize, entries: &[(usize, usize)]) -> Self {
        let mut sorted: Vec<(usize, usize)> = entries
            .iter()
            .copied()
            .filter(|&(r, c)| r < nrow && c < ncol)
            .collect();
        sorted.sort_by_key(|&(r, c)| (c, r));
        sorted.dedup();

        let mut colind = vec![0; ncol + 1];
        let mut row = Vec::with_capacity(sorted.len());
        for &(r, c) in &sorted {
            colind[c + 1] += 1;
            row.push(r);
        }
        for c in 0..ncol {
            colind[c + 1] += colind[c];
        }
        Sparsity { nrow, ncol, colind, row }
    }

    /// Number of structural nonzeros
    pub fn nnz(&self) -> usize {
        self.row.len()
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.nrow, self.ncol)
    }

    /// Whether `(r, c)` is a structural nonzero
    pub fn contains(&self, r: usize, c: usize) -> bool {
        if c >= self.ncol {
            return false;
        }
        self.row[self.colind[c]..self.colind[c + 1]].contains(&r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_classification() {
        assert_eq!(Stage::from_index(0, 16), Some(Stage::Initial));
        assert_eq!(Stage::from_index(7, 16), Some(Stage::Intermediate(7)));
        assert_eq!(Stage::from_index(16, 16), Some(Stage::Terminal));
        assert_eq!(Stage::from_index(17, 16), None);
        assert_eq!(Stage::Terminal.index(16), 16);
        assert!(!Stage::Terminal.has_dynamics());
        assert_eq!(Stage::all(16).count(), 17);
    }

    #[test]
    fn test_dense_sparsity() {
        let sp = Sparsity::dense(3, 2);
        assert_eq!(sp.nnz(), 6);
        assert_eq!(sp.colind, vec![0, 3, 6]);
        assert!(sp.contains(2, 1));
    }

    #[test]
    fn test_sparsity_from_entries() {
        let sp = Sparsity::from_entries(4, 4, &[(3, 2), (0, 2), (2, 3), (0, 2)]);
        assert_eq!(sp.nnz(), 3);
        assert_eq!(sp.colind, vec![0, 0, 0, 2, 3]);
        assert_eq!(sp.row, vec![0, 3, 2]);
        assert!(!sp.contains(1, 1));
    }
}
