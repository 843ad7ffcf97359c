//! Per-iteration statistics of the last solve call

use std::io::{self, Write};
use std::time::Duration;

use itertools::Itertools;

/// NLP residuals at one iterate
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Residuals {
    pub stat: f64,
    pub eq: f64,
    pub ineq: f64,
    pub comp: f64,
}

impl Residuals {
    pub fn is_finite(&self) -> bool {
        self.stat.is_finite() && self.eq.is_finite() && self.ineq.is_finite() && self.comp.is_finite()
    }

    /// Largest of the four residuals
    pub fn max(&self) -> f64 {
        self.stat.max(self.eq).max(self.ineq).max(self.comp)
    }
}

/// One row of the statistics table.
///
/// Residuals are those of the iterate entering SQP iteration `iter`; the QP
/// columns describe the subproblem solved from it (zero when none was).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsRow {
    pub iter: usize,
    pub residuals: Residuals,
    pub qp_status: i32,
    pub qp_iter: usize,
}

/// Wall-clock time spent in the phases of a solve call
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Timings {
    pub total: Duration,
    pub linearization: Duration,
    pub residuals: Duration,
    pub qp: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct SolveStats {
    rows: Vec<StatsRow>,
    pub timings: Timings,
}

impl SolveStats {
    pub fn with_capacity(max_iter: usize) -> Self {
        SolveStats {
            rows: Vec::with_capacity(max_iter + 1),
            timings: Timings::default(),
        }
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.timings = Timings::default();
    }

    pub fn push(&mut self, iter: usize, residuals: Residuals) {
        self.rows.push(StatsRow {
            iter,
            residuals,
            qp_status: 0,
            qp_iter: 0,
        });
    }

    /// Attach a QP result to the latest row
    pub fn record_qp(&mut self, status: i32, iterations: usize) {
        if let Some(row) = self.rows.last_mut() {
            row.qp_status = status;
            row.qp_iter = iterations;
        }
    }

    pub fn rows(&self) -> &[StatsRow] {
        &self.rows
    }

    pub fn last(&self) -> Option<&StatsRow> {
        self.rows.last()
    }

    /// Write the iteration table
    pub fn write_table<W: Write>(&self, w: &mut W) -> io::Result<()> {
        writeln!(
            w,
            "{}",
            ["iter", "res_stat", "res_eq", "res_ineq", "res_comp", "qp_stat", "qp_iter"]
                .iter()
                .join("\t")
        )?;
        for row in &self.rows {
            let r = row.residuals;
            let residuals = [r.stat, r.eq, r.ineq, r.comp]
                .iter()
                .map(|v| format!("{:e}", v))
                .join("\t");
            writeln!(w, "{}\t{}\t{}\t{}", row.iter, residuals, row.qp_status, row.qp_iter)?;
        }
        Ok(())
    }

    /// Write the objective value and the phase timings in milliseconds
    pub fn write_summary<W: Write>(&self, w: &mut W, cost: f64) -> io::Result<()> {
        let t = &self.timings;
        let timings = [
            ("time_tot", t.total),
            ("time_lin", t.linearization),
            ("time_res", t.residuals),
            ("time_qp", t.qp),
        ]
        .iter()
        .map(|(name, d)| format!("{} {:.3}", name, d.as_secs_f64() * 1e3))
        .join("\t");
        writeln!(w, "cost {:e}\t{}", cost, timings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_format() {
        let mut stats = SolveStats::with_capacity(4);
        stats.push(0, Residuals { stat: 1.0, eq: 0.5, ineq: 0.0, comp: 0.0 });
        stats.record_qp(0, 7);
        stats.push(1, Residuals { stat: 1e-8, eq: 0.0, ineq: 0.0, comp: 2e-9 });

        let mut buf = Vec::new();
        stats.write_table(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "iter\tres_stat\tres_eq\tres_ineq\tres_comp\tqp_stat\tqp_iter");
        assert_eq!(lines[1], "0\t1e0\t5e-1\t0e0\t0e0\t0\t7");
        assert!(lines[2].ends_with("\t0\t0"));
    }

    #[test]
    fn test_summary_format() {
        let mut stats = SolveStats::default();
        stats.timings = Timings {
            total: Duration::from_millis(5),
            linearization: Duration::from_millis(2),
            residuals: Duration::from_micros(500),
            qp: Duration::from_millis(2),
        };

        let mut buf = Vec::new();
        stats.write_summary(&mut buf, 0.25).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text, "cost 2.5e-1\ttime_tot 5.000\ttime_lin 2.000\ttime_res 0.500\ttime_qp 2.000\n");

        stats.clear();
        assert_eq!(stats.timings, Timings::default());
    }

    #[test]
    fn test_record_qp_on_empty_is_noop() {
        let mut stats = SolveStats::default();
        stats.record_qp(4, 3);
        assert!(stats.rows().is_empty());
        assert!(stats.last().is_none());
    }

    #[test]
    fn test_residual_helpers() {
        let r = Residuals { stat: 1e-3, eq: 2e-3, ineq: 0.0, comp: f64::NAN };
        assert!(!r.is_finite());
        let r = Residuals { stat: 1e-3, eq: 2e-3, ineq: 0.0, comp: 0.0 };
        assert_eq!(r.max(), 2e-3);
    }
}
