//! Solver capsule: one owned aggregate per controller instance
//!
//! `CapsuleBuilder::build` either hands out a fully configured capsule or an
//! error; there is no half-built state. Fields are declared in teardown order,
//! so dropping a capsule releases options first and external functions last.

use std::io::{self, Write};

use nalgebra::{DMatrix, DVector};

use crate::common::{MpcError, MpcResult, OcpModel, Stage};
use crate::model::LateralModel;
use crate::ocp::dims::OcpDims;
use crate::ocp::functions::ExternalFunctions;
use crate::ocp::nlp_in::{BoundIndices, NlpField, NlpIn};
use crate::ocp::nlp_out::NlpOut;
use crate::ocp::options::SolverOptions;
use crate::ocp::plan::{IntegratorPlan, NlpConfig, OcpPlan};
use crate::ocp::qp::QpBackend;
use crate::ocp::qp_clarabel::ClarabelBackend;
use crate::ocp::sqp::{SolveStatus, SqpSolver};
use crate::ocp::stats::{Residuals, SolveStats};

/// Numeric problem data loaded into a capsule at build time
///
/// Suffix `_0` is node 0, `_e` node N, no suffix nodes 1..N-1 (weights and
/// references also nodes 0..N-1 for the control bounds).
#[derive(Debug, Clone, PartialEq)]
pub struct ProblemData {
    /// Shooting interval lengths; its length fixes the horizon N
    pub time_steps: Vec<f64>,
    pub w_0: DMatrix<f64>,
    pub yref_0: DVector<f64>,
    pub w: DMatrix<f64>,
    pub yref: DVector<f64>,
    pub w_e: DMatrix<f64>,
    pub yref_e: DVector<f64>,
    pub idxbx_0: Vec<usize>,
    pub lbx_0: DVector<f64>,
    pub ubx_0: DVector<f64>,
    /// Positions within `idxbx_0` that are equality bounds
    pub idxbxe_0: Vec<usize>,
    pub idxbx: Vec<usize>,
    pub lbx: DVector<f64>,
    pub ubx: DVector<f64>,
    pub idxbx_e: Vec<usize>,
    pub lbx_e: DVector<f64>,
    pub ubx_e: DVector<f64>,
    /// Control bounds, nodes 0..N-1
    pub idxbu: Vec<usize>,
    pub lbu: DVector<f64>,
    pub ubu: DVector<f64>,
    /// Initial iterate, copied to every node
    pub x_init: DVector<f64>,
    pub u_init: DVector<f64>,
    /// Parameters pushed to every stage
    pub params: DVector<f64>,
}

/// Assembles a `Capsule` from a model, its numeric data and options
pub struct CapsuleBuilder {
    model: Box<dyn OcpModel>,
    data: ProblemData,
    opts: SolverOptions,
    integrator: IntegratorPlan,
    backend: Box<dyn QpBackend>,
}

impl CapsuleBuilder {
    pub fn new<M: OcpModel + 'static>(model: M, data: ProblemData, opts: SolverOptions) -> Self {
        CapsuleBuilder {
            model: Box::new(model),
            data,
            opts,
            integrator: IntegratorPlan::default(),
            backend: Box::new(ClarabelBackend::new()),
        }
    }

    /// Lateral tracking problem with its default data and options
    pub fn lateral() -> Self {
        Self::new(LateralModel::new(), LateralModel::problem_data(), SolverOptions::default())
    }

    pub fn options(mut self, opts: SolverOptions) -> Self {
        self.opts = opts;
        self
    }

    pub fn data(mut self, data: ProblemData) -> Self {
        self.data = data;
        self
    }

    /// Runge-Kutta scheme used on every interval
    pub fn integrator(mut self, plan: IntegratorPlan) -> Self {
        self.integrator = plan;
        self
    }

    pub fn backend(mut self, backend: Box<dyn QpBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Build and precompute; configuration errors follow the options' policy.
    pub fn build(self) -> MpcResult<Capsule> {
        let policy = self.opts.on_misconfiguration;
        self.try_build().map_err(|e| policy.escalate(e))
    }

    fn try_build(self) -> MpcResult<Capsule> {
        let CapsuleBuilder { model, data, opts, integrator, backend } = self;
        opts.validate()?;
        let n = data.time_steps.len();

        let mut plan = OcpPlan::new(n, model.name(), backend.name());
        for stage in 0..n {
            plan.set_integrator(stage, integrator)?;
        }
        let config = NlpConfig::from_plan(&plan)?;

        let dims = {
            let f = model.dynamics();
            OcpDims::new(n, f.nx(), f.nu(), f.n_params())
                .with_cost(
                    model.initial_residual().ny(),
                    model.path_residual().ny(),
                    model.terminal_residual().ny(),
                )
                .with_state_bounds(
                    data.idxbx_0.len(),
                    data.idxbxe_0.len(),
                    data.idxbx.len(),
                    data.idxbx_e.len(),
                )
                .with_control_bounds(data.idxbu.len())
        };
        dims.validate()?;

        let functions = ExternalFunctions::from_model(model.as_ref(), n);
        functions.check_dims(&dims)?;

        if data.params.len() != dims.np {
            return Err(MpcError::ParameterCountMismatch {
                expected: dims.np,
                given: data.params.len(),
            });
        }
        for (what, given, expected) in [
            ("x_init", data.x_init.len(), dims.nx[0]),
            ("u_init", data.u_init.len(), dims.nu[0]),
        ] {
            if given != expected {
                return Err(MpcError::DimensionMismatch {
                    what: what.to_string(),
                    expected,
                    given,
                });
            }
        }

        let nlp_in = load_nlp_in(&dims, &data)?;
        let mut nlp_out = NlpOut::new(&dims);
        nlp_out.reset(&data.x_init, &data.u_init);

        let solver = SqpSolver::new(&dims, &nlp_in, backend);

        let mut capsule = Capsule {
            opts,
            nlp_in,
            nlp_out,
            solver,
            dims,
            config,
            plan,
            functions,
            x_init: data.x_init,
            u_init: data.u_init,
        };
        for stage in 0..=n {
            capsule.try_update_params(stage, data.params.as_slice())?;
        }
        capsule
            .solver
            .precompute(&capsule.dims, &capsule.config, &capsule.opts)?;

        log::info!(
            "built {} capsule: N = {}, nx = {}, nu = {}, np = {}, qp backend {}, function work {}",
            capsule.plan.model_name,
            n,
            capsule.dims.nx[0],
            capsule.dims.nu[0],
            capsule.dims.np,
            capsule.solver.backend_name(),
            capsule.functions.work_size()
        );
        Ok(capsule)
    }
}

/// Fill weights, references, scaling and bounds through the stage-indexed setter
fn load_nlp_in(dims: &OcpDims, data: &ProblemData) -> MpcResult<NlpIn> {
    let n = dims.n;
    let idx = BoundIndices {
        idxbx: (0..=n)
            .map(|i| match Stage::from_index(i, n) {
                Some(Stage::Initial) => data.idxbx_0.clone(),
                Some(Stage::Terminal) => data.idxbx_e.clone(),
                _ => data.idxbx.clone(),
            })
            .collect(),
        idxbxe: (0..=n)
            .map(|i| if i == 0 { data.idxbxe_0.clone() } else { Vec::new() })
            .collect(),
        idxbu: (0..=n)
            .map(|i| if i < n { data.idxbu.clone() } else { Vec::new() })
            .collect(),
    };
    let mut nlp_in = NlpIn::new(dims, &idx)?;
    nlp_in.set_time_steps(&data.time_steps)?;

    for stage in Stage::all(n) {
        let i = stage.index(n);
        let (w, yref, lbx, ubx) = match stage {
            Stage::Initial => (&data.w_0, &data.yref_0, &data.lbx_0, &data.ubx_0),
            Stage::Intermediate(_) => (&data.w, &data.yref, &data.lbx, &data.ubx),
            Stage::Terminal => (&data.w_e, &data.yref_e, &data.lbx_e, &data.ubx_e),
        };
        nlp_in.set(i, NlpField::W, w.as_slice())?;
        nlp_in.set(i, NlpField::Yref, yref.as_slice())?;
        nlp_in.set(i, NlpField::Lbx, lbx.as_slice())?;
        nlp_in.set(i, NlpField::Ubx, ubx.as_slice())?;
        if stage.has_dynamics() {
            nlp_in.set(i, NlpField::Lbu, data.lbu.as_slice())?;
            nlp_in.set(i, NlpField::Ubu, data.ubu.as_slice())?;
            nlp_in.set(i, NlpField::Scaling, &[data.time_steps[i]])?;
        } else {
            nlp_in.set(i, NlpField::Scaling, &[1.0])?;
        }
    }
    nlp_in.validate_bounds()?;
    Ok(nlp_in)
}

/// Fully configured solver instance
pub struct Capsule {
    opts: SolverOptions,
    nlp_in: NlpIn,
    nlp_out: NlpOut,
    solver: SqpSolver,
    dims: OcpDims,
    config: NlpConfig,
    plan: OcpPlan,
    functions: ExternalFunctions,
    x_init: DVector<f64>,
    u_init: DVector<f64>,
}

impl Capsule {
    /// Push parameter vector `p` to node `stage`.
    ///
    /// The length is checked before any function is touched. Nodes below N
    /// update dynamics and residual, node N only the terminal residual.
    pub fn update_params(&mut self, stage: usize, p: &[f64]) -> MpcResult<()> {
        let policy = self.opts.on_misconfiguration;
        self.try_update_params(stage, p).map_err(|e| policy.escalate(e))
    }

    fn try_update_params(&mut self, stage: usize, p: &[f64]) -> MpcResult<()> {
        let np = self.functions.n_params();
        if p.len() != np {
            return Err(MpcError::ParameterCountMismatch {
                expected: np,
                given: p.len(),
            });
        }
        let stage = self.dims.stage(stage)?;
        self.functions.set_params(stage, p);
        self.nlp_in.mirror_params(stage, p);
        Ok(())
    }

    /// Set a per-stage quantity (weights, references, bounds, scaling)
    pub fn set(&mut self, stage: usize, field: NlpField, values: &[f64]) -> MpcResult<()> {
        self.nlp_in.set(stage, field, values)
    }

    /// Set a per-stage quantity by its field name (`"W"`, `"yref"`, `"lbx"`, ...)
    pub fn set_field(&mut self, stage: usize, name: &str, values: &[f64]) -> MpcResult<()> {
        let field: NlpField = name.parse()?;
        self.set(stage, field, values)
    }

    /// Pin node 0 to the measured state
    pub fn set_initial_state(&mut self, x0: &[f64]) -> MpcResult<()> {
        self.nlp_in.set_initial_state(x0)
    }

    /// Run the SQP loop from the stored iterate.
    ///
    /// Crossed bounds make the QP infeasible and are reported as `QpFailure`
    /// without touching the iterate. A non-finite QP step is reported as
    /// `NanDetected` and is not applied either. Non-finite values written
    /// into the iterate by the caller persist until `reset`.
    pub fn solve(&mut self) -> SolveStatus {
        if let Err(e) = self.nlp_in.validate_bounds() {
            log::error!("refusing to solve: {}", e);
            return SolveStatus::QpFailure;
        }
        let status = self.solver.solve(
            &self.config,
            &self.functions,
            &self.nlp_in,
            &mut self.nlp_out,
            &self.opts,
        );
        if self.opts.print_level > 0 {
            self.print_stats();
        }
        status
    }

    /// Restore the default iterate for a cold start
    pub fn reset(&mut self) {
        self.nlp_out.reset(&self.x_init, &self.u_init);
    }

    /// Change options; validated and re-applied to the QP backend.
    ///
    /// On error the previous options stay in effect.
    pub fn update_options<F>(&mut self, f: F) -> MpcResult<()>
    where
        F: FnOnce(&mut SolverOptions),
    {
        let mut opts = self.opts.clone();
        f(&mut opts);
        let policy = opts.on_misconfiguration;
        let result = opts
            .validate()
            .and_then(|_| self.solver.precompute(&self.dims, &self.config, &opts));
        match result {
            Ok(()) => {
                self.opts = opts;
                Ok(())
            }
            Err(e) => {
                // backend keeps working with the old settings
                self.solver
                    .precompute(&self.dims, &self.config, &self.opts)
                    .map_err(|e| policy.escalate(e))?;
                Err(policy.escalate(e))
            }
        }
    }

    /// Print the iteration table of the last solve to stdout
    pub fn print_stats(&self) {
        let stdout = io::stdout();
        let mut lock = stdout.lock();
        if let Err(e) = self.write_stats(&mut lock).and_then(|_| self.write_summary(&mut lock)) {
            log::warn!("failed to print stats: {}", e);
        }
    }

    /// Iteration table of the last solve
    pub fn write_stats<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.solver.stats().write_table(w)
    }

    /// Cost and timing line of the last solve
    pub fn write_summary<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.solver.stats().write_summary(w, self.solver.cost_value())
    }

    /// Objective value at the final iterate of the last solve
    pub fn cost_value(&self) -> f64 {
        self.solver.cost_value()
    }

    pub fn stats(&self) -> &SolveStats {
        self.solver.stats()
    }

    /// Residuals of the final iterate of the last solve
    pub fn residuals(&self) -> Residuals {
        self.solver.residuals()
    }

    pub fn sqp_iter(&self) -> usize {
        self.solver.sqp_iter()
    }

    /// First control of the current iterate
    pub fn first_control(&self) -> &DVector<f64> {
        &self.nlp_out.u[0]
    }

    pub fn nlp_in(&self) -> &NlpIn {
        &self.nlp_in
    }

    pub fn nlp_out(&self) -> &NlpOut {
        &self.nlp_out
    }

    /// Mutable iterate, for custom warm starts through the checked setters
    pub fn nlp_out_mut(&mut self) -> &mut NlpOut {
        &mut self.nlp_out
    }

    pub fn solver(&self) -> &SqpSolver {
        &self.solver
    }

    pub fn config(&self) -> &NlpConfig {
        &self.config
    }

    pub fn opts(&self) -> &SolverOptions {
        &self.opts
    }

    pub fn dims(&self) -> &OcpDims {
        &self.dims
    }

    pub fn plan(&self) -> &OcpPlan {
        &self.plan
    }

    pub fn functions(&self) -> &ExternalFunctions {
        &self.functions
    }
}
