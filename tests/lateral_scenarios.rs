use approx::assert_relative_eq;
use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rstest::rstest;

use lateral_mpc::common::{ContinuousDynamics, ExternalFunction, LeastSquaresResidual, Stage};
use lateral_mpc::model::lateral::{DEFAULT_PARAMS, MAX_CURV, MAX_PSI, N, NX};
use lateral_mpc::ocp::{CapsuleBuilder, HessianApprox, NlpField, SolveStatus, SolverOptions};
use lateral_mpc::{Capsule, MpcError};

fn lateral() -> Capsule {
    CapsuleBuilder::lateral().build().unwrap()
}

fn assert_intermediate_bounds(capsule: &Capsule, psi_max: f64, curv_max: f64) {
    for i in 1..N {
        let x = capsule.nlp_out().x(i);
        assert!(x[2].abs() <= psi_max + 1e-6, "psi at node {} = {}", i, x[2]);
        assert!(x[3].abs() <= curv_max + 1e-6, "curv at node {} = {}", i, x[3]);
    }
}

#[test]
fn test_nominal_scenario() {
    let mut capsule = lateral();
    capsule.set_initial_state(&[0.0, -1.0, 0.0, 0.0]).unwrap();

    let status = capsule.solve();

    assert_eq!(status, SolveStatus::Success);
    assert_eq!(status.code(), 0);
    assert!(capsule.first_control()[0].is_finite());
    assert_intermediate_bounds(&capsule, MAX_PSI, MAX_CURV);

    let res = capsule.residuals();
    assert!(res.stat < 1e-6);
    assert!(res.eq < 1e-6);
    assert!(res.ineq < 1e-6);
    assert!(res.comp < 1e-6);

    // node 0 stays pinned to the measured state
    let x0 = capsule.nlp_out().x(0);
    assert_relative_eq!(x0[1], -1.0, epsilon = 1e-6);
    // the controller steers towards the path
    assert!(capsule.nlp_out().x(N)[1] > -1.0);
    assert!(capsule.sqp_iter() <= capsule.opts().max_iter);
}

#[test]
fn test_fresh_capsules_are_deterministic() {
    let mut a = lateral();
    let mut b = lateral();
    for capsule in [&mut a, &mut b] {
        capsule.set_initial_state(&[0.0, 0.4, -0.05, 0.01]).unwrap();
    }
    let sa = a.solve();
    let sb = b.solve();

    assert_eq!(sa, sb);
    assert_eq!(a.sqp_iter(), b.sqp_iter());
    assert_eq!(a.nlp_out(), b.nlp_out());
}

#[test]
fn test_resolve_after_convergence_keeps_iterate() {
    let mut capsule = lateral();
    assert_eq!(capsule.solve(), SolveStatus::Success);
    let converged = capsule.nlp_out().clone();

    assert_eq!(capsule.solve(), SolveStatus::Success);
    assert_eq!(capsule.sqp_iter(), 0);
    assert_eq!(capsule.nlp_out(), &converged);
}

#[test]
fn test_warm_start_needs_no_more_iterations_than_cold() {
    let perturbed = [0.0, -0.95, 0.01, 0.0];

    let mut cold = lateral();
    cold.set_initial_state(&perturbed).unwrap();
    assert_eq!(cold.solve(), SolveStatus::Success);

    let mut warm = lateral();
    assert_eq!(warm.solve(), SolveStatus::Success);
    warm.set_initial_state(&perturbed).unwrap();
    assert_eq!(warm.solve(), SolveStatus::Success);

    assert!(
        warm.sqp_iter() <= cold.sqp_iter(),
        "warm {} > cold {}",
        warm.sqp_iter(),
        cold.sqp_iter()
    );
    for i in 0..=N {
        for k in 0..NX {
            assert_relative_eq!(
                warm.nlp_out().x(i)[k],
                cold.nlp_out().x(i)[k],
                epsilon = 1e-5
            );
        }
    }
}

#[test]
fn test_reset_restores_cold_start() {
    let mut capsule = lateral();
    assert_eq!(capsule.solve(), SolveStatus::Success);
    let cold_iters = capsule.sqp_iter();

    capsule.reset();
    assert_eq!(capsule.nlp_out().x(N).as_slice(), &[0.0, -1.0, 0.0, 0.0]);
    assert_eq!(capsule.solve(), SolveStatus::Success);
    assert_eq!(capsule.sqp_iter(), cold_iters);
}

#[test]
fn test_parameter_update_is_stage_local() {
    let mut capsule = lateral();
    capsule.update_params(5, &[10.0, 1.0]).unwrap();

    let x = DVector::from_row_slice(&[0.0, 0.3, 0.1, 0.02]);
    let u = DVector::from_row_slice(&[0.05]);
    let mut y = DVector::zeros(3);

    let functions = capsule.functions();
    functions.cost(Stage::Intermediate(5)).eval(&x, &u, &mut y);
    assert_relative_eq!(y[1], 15.0 * 0.1);
    functions.cost(Stage::Intermediate(6)).eval(&x, &u, &mut y);
    assert_relative_eq!(y[1], 25.0 * 0.1);

    let mut xdot = DVector::zeros(NX);
    functions
        .dynamics(Stage::Intermediate(5))
        .unwrap()
        .eval_ode(&x, &u, &mut xdot);
    assert_relative_eq!(xdot[2], 10.0 * 0.02);
    functions
        .dynamics(Stage::Intermediate(4))
        .unwrap()
        .eval_ode(&x, &u, &mut xdot);
    assert_relative_eq!(xdot[2], 20.0 * 0.02);

    assert_eq!(capsule.nlp_in().params(Stage::Intermediate(5)).as_slice(), &[10.0, 1.0]);
    assert_eq!(capsule.nlp_in().params(Stage::Initial).as_slice(), &DEFAULT_PARAMS);
}

#[test]
fn test_terminal_update_ignores_dynamics() {
    let mut capsule = lateral();
    capsule.update_params(N, &[0.0, 0.0]).unwrap();

    let functions = capsule.functions();
    assert!(functions.dynamics(Stage::Terminal).is_none());
    assert_eq!(functions.cost(Stage::Terminal).params(), &[0.0, 0.0]);
    for i in 1..N {
        assert_eq!(
            functions.dynamics(Stage::Intermediate(i)).unwrap().params(),
            &DEFAULT_PARAMS
        );
    }
    assert_eq!(capsule.solve(), SolveStatus::Success);
}

#[test]
fn test_wrong_length_update_fails_before_mutation() {
    let mut capsule = lateral();
    assert_eq!(capsule.solve(), SolveStatus::Success);
    let before = capsule.nlp_out().clone();

    for p in [&[][..], &[1.0][..], &[1.0, 2.0, 3.0][..]] {
        let err = capsule.update_params(2, p).unwrap_err();
        assert!(matches!(err, MpcError::ParameterCountMismatch { expected: 2, .. }));
    }
    assert_eq!(capsule.nlp_out(), &before);
    for stage in Stage::all(N) {
        assert_eq!(capsule.functions().cost(stage).params(), &DEFAULT_PARAMS);
    }
    // still solvable and unchanged
    assert_eq!(capsule.solve(), SolveStatus::Success);
    assert_eq!(capsule.sqp_iter(), 0);
}

#[test]
fn test_tight_curvature_bounds_enforced() {
    let tight = 0.001;
    let mut capsule = lateral();
    for i in 1..N {
        capsule.set(i, NlpField::Lbx, &[-MAX_PSI, -tight]).unwrap();
        capsule.set(i, NlpField::Ubx, &[MAX_PSI, tight]).unwrap();
    }

    assert_eq!(capsule.solve(), SolveStatus::Success);
    assert_intermediate_bounds(&capsule, MAX_PSI, tight);
    // the bound is binding: without it the curvature would exceed it
    let max_curv = (1..N)
        .map(|i| capsule.nlp_out().x(i)[3].abs())
        .fold(0.0, f64::max);
    assert_relative_eq!(max_curv, tight, epsilon = 1e-6);
    assert!(capsule.residuals().comp < 1e-6);
}

#[test]
fn test_random_initial_states_converge() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut capsule = lateral();
    for _ in 0..5 {
        let x0 = [
            0.0,
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-0.2..0.2),
            rng.gen_range(-0.02..0.02),
        ];
        capsule.reset();
        capsule.set_initial_state(&x0).unwrap();
        assert_eq!(capsule.solve(), SolveStatus::Success, "x0 = {:?}", x0);
        assert_intermediate_bounds(&capsule, MAX_PSI, MAX_CURV);
    }
}

#[test]
fn test_iteration_cap() {
    let opts = SolverOptions { max_iter: 1, ..SolverOptions::default() };
    let mut capsule = CapsuleBuilder::lateral().options(opts).build().unwrap();

    assert_eq!(capsule.solve(), SolveStatus::MaxIter);
    assert_eq!(capsule.sqp_iter(), 1);
    assert!(capsule.nlp_out().is_finite());
    assert_eq!(capsule.stats().rows().len(), 2);
    assert_eq!(capsule.stats().rows()[1].qp_iter, 0);

    // raising the cap continues from the kept iterate
    capsule.update_options(|o| o.max_iter = 100).unwrap();
    assert_eq!(capsule.solve(), SolveStatus::Success);
}

#[rstest]
#[case(HessianApprox::GaussNewton, 0.0)]
#[case(HessianApprox::Exact, 0.0)]
#[case(HessianApprox::GaussNewton, 1e-4)]
fn test_option_variants_reach_the_same_solution(
    #[case] hessian_approx: HessianApprox,
    #[case] levenberg_marquardt: f64,
) {
    let mut reference = lateral();
    assert_eq!(reference.solve(), SolveStatus::Success);

    let opts = SolverOptions {
        hessian_approx,
        levenberg_marquardt,
        ..SolverOptions::default()
    };
    let mut capsule = CapsuleBuilder::lateral().options(opts).build().unwrap();
    assert_eq!(capsule.solve(), SolveStatus::Success);
    for i in 0..N {
        assert_relative_eq!(
            capsule.nlp_out().u(i)[0],
            reference.nlp_out().u(i)[0],
            epsilon = 1e-5
        );
    }
}

#[test]
fn test_shipped_config_matches_defaults() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/lateral_mpc.toml");
    let opts = SolverOptions::from_file(path).unwrap();
    assert_eq!(opts, SolverOptions::default());
}

#[test]
fn test_sensitivity_reuse_keeps_first_jacobian() {
    let x0 = [0.0, -1.0, 0.0, 0.0];
    let k = 3;

    let mut first = lateral();
    first.set_initial_state(&x0).unwrap();
    first.update_options(|o| o.max_iter = 0).unwrap();
    assert_eq!(first.solve(), SolveStatus::MaxIter);
    let a_first = first.solver().qp().stages[k].a.clone();

    let mut reuse = lateral();
    reuse.set_initial_state(&x0).unwrap();
    reuse.update_options(|o| o.sens_reuse = true).unwrap();
    assert_eq!(reuse.solve(), SolveStatus::Success);
    assert!(reuse.sqp_iter() > 1);
    let a_reuse = &reuse.solver().qp().stages[k].a;
    assert_relative_eq!(*a_reuse, a_first, epsilon = 1e-12);

    // the heading has moved away from zero, so a fresh Jacobian differs
    let mut fresh = lateral();
    fresh.set_initial_state(&x0).unwrap();
    assert_eq!(fresh.solve(), SolveStatus::Success);
    assert!(fresh.nlp_out().x(k)[2].abs() > 1e-3);
    let a_fresh = &fresh.solver().qp().stages[k].a;
    assert!((a_fresh - a_reuse).amax() > 1e-6);

    // defects still use the true dynamics
    assert!(reuse.residuals().eq < 1e-6);
    assert!(reuse.nlp_out().is_finite());
}
