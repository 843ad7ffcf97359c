//
// Closed-loop lateral path tracking with the nonlinear MPC capsule.
//
// The plant is the same kinematic model integrated with RK4, the measured
// state carries Gaussian noise and the speed ramps down over the run.
//
// usage: lateral_sim [options.toml]
//
use std::error::Error;

use gnuplot::{AxesCommon, Caption, Color, Figure};
use itertools::Itertools;
use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use lateral_mpc::common::ExternalFunction;
use lateral_mpc::model::lateral::{DEFAULT_PARAMS, DEFAULT_X0, N, NX};
use lateral_mpc::model::LateralDynamics;
use lateral_mpc::ocp::{ButcherTableau, CapsuleBuilder, ErkIntegrator, SolveStatus, SolverOptions};
use lateral_mpc::ocp::integrator::SimOut;

const DT: f64 = 0.05;
const SIM_STEPS: usize = 120;
const V_START: f64 = 20.0;
const V_END: f64 = 12.0;
const NOISE_STD: f64 = 0.01;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let opts = match std::env::args().nth(1) {
        Some(path) => SolverOptions::from_file(&path)?,
        None => SolverOptions::default(),
    };
    let mut capsule = CapsuleBuilder::lateral().options(opts).build()?;

    let mut plant = LateralDynamics::new();
    let rk4 = ErkIntegrator::new(ButcherTableau::explicit(4).ok_or("no RK4 tableau")?, 4);
    let mut ws = rk4.workspace(NX, 1);
    let mut sim = SimOut::new(NX, 1);

    let mut rng = StdRng::seed_from_u64(7);
    let noise = Normal::new(0.0, NOISE_STD)?;

    let mut x = DVector::from_row_slice(&DEFAULT_X0);
    let mut time = Vec::with_capacity(SIM_STEPS);
    let mut y_hist = Vec::with_capacity(SIM_STEPS);
    let mut psi_hist = Vec::with_capacity(SIM_STEPS);
    let mut curv_hist = Vec::with_capacity(SIM_STEPS);
    let mut statuses = Vec::with_capacity(SIM_STEPS);
    let mut iterations = Vec::with_capacity(SIM_STEPS);

    for k in 0..SIM_STEPS {
        let v = V_START + (V_END - V_START) * k as f64 / SIM_STEPS as f64;
        let p = [v, DEFAULT_PARAMS[1]];
        for stage in 0..=N {
            capsule.update_params(stage, &p)?;
        }
        plant.set_param(&p);

        // path-relative: longitudinal position restarts at zero every cycle
        let measured = [
            0.0,
            x[1] + noise.sample(&mut rng),
            x[2] + noise.sample(&mut rng),
            x[3],
        ];
        capsule.set_initial_state(&measured)?;

        let status = capsule.solve();
        if status != SolveStatus::Success {
            log::warn!("step {}: {}", k, status);
        }
        let u = capsule.first_control().clone();

        rk4.integrate(&plant, &x, &u, DT, false, &mut ws, &mut sim);
        x.copy_from(&sim.x_next);

        time.push(k as f64 * DT);
        y_hist.push(x[1]);
        psi_hist.push(x[2]);
        curv_hist.push(x[3]);
        statuses.push(status.code());
        iterations.push(capsule.sqp_iter());
    }

    let counts = statuses.iter().counts();
    println!(
        "status counts: {}",
        counts
            .iter()
            .sorted()
            .map(|(code, n)| format!("{}: {}", code, n))
            .join(", ")
    );
    println!(
        "sqp iterations: mean {:.2}, max {}",
        iterations.iter().sum::<usize>() as f64 / iterations.len() as f64,
        iterations.iter().max().copied().unwrap_or(0)
    );
    println!(
        "final lateral offset {:.4} m, heading {:.4} rad",
        x[1], x[2]
    );

    std::fs::create_dir_all("img")?;
    let mut fg = Figure::new();
    fg.axes2d()
        .set_title("Lateral MPC tracking", &[])
        .set_x_label("time [s]", &[])
        .lines(&time, &y_hist, &[Caption("lateral offset [m]"), Color("blue")])
        .lines(&time, &psi_hist, &[Caption("heading [rad]"), Color("red")])
        .lines(&time, &curv_hist, &[Caption("curvature [1/m]"), Color("green")]);
    fg.set_terminal("pngcairo", "img/lateral_mpc.png");
    if let Err(e) = fg.show() {
        log::warn!("plot not written: {}", e);
    }

    Ok(())
}
