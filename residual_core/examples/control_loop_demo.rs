//! Control Loop Demo - learning an unmodelled drag term online
//!
//! A 1-D cart follows `v' = u - c·v·|v|`; the nominal model ignores the drag.
//! The residual model learns `v' - u` from the state `[position, velocity, u]`
//! (position masked out) and its Jacobian is what an MPC linearization would
//! use. A second model logs the same stream to disk for offline retraining.
//!
//! Run with: cargo run --example control_loop_demo

use ndarray::{array, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use residual_core::{
    load_data, ExactGp, FeatureMask, FeatureSelector, GpHyperparameters, GpPredictor,
    OnlineLearningStrategy, RecordDataStrategy, ResidualModel, ResidualResult,
};

const DRAG: f64 = 0.35;
const DT: f64 = 0.05;
const STEPS: usize = 200;

fn true_residual(velocity: f64) -> f64 {
    -DRAG * velocity * velocity.abs()
}

fn build_model(strategy: Box<dyn residual_core::DataProcessingStrategy>) -> ResidualResult<ResidualModel> {
    let selector = FeatureSelector::new(Some(FeatureMask::new(vec![false, true, true])), 3)?;
    let mut gp = ExactGp::new(2, 1, GpHyperparameters::isotropic(1, 0.8, 0.5, 1e-3))?;
    gp.eval();
    ResidualModel::new(gp, selector, strategy)
}

fn main() -> ResidualResult<()> {
    println!("Residual Control Loop Demo");
    println!("==========================\n");

    let logs = tempfile::tempdir()?;
    let x_path = logs.path().join("x.txt");
    let y_path = logs.path().join("y.txt");

    let mut online = build_model(Box::new(OnlineLearningStrategy::new(60)?))?;
    let mut recorder = build_model(Box::new(RecordDataStrategy::new(&x_path, &y_path)?))?;

    let mut rng = StdRng::seed_from_u64(42);
    let (mut position, mut velocity) = (0.0_f64, 0.0_f64);

    for step in 0..STEPS {
        let u = 1.5 * (step as f64 * 0.07).sin() + rng.gen_range(-0.2..0.2);
        let state = array![position, velocity, u];

        let predicted = online.value_and_jacobian(state.view().insert_axis(ndarray::Axis(0)))?;
        let actual = true_residual(velocity);

        let observed = array![actual + rng.gen_range(-0.01..0.01)];
        online.record_datapoint(state.view(), observed.view())?;
        recorder.record_datapoint(state.view(), observed.view())?;

        if (step + 1) % 40 == 0 {
            println!("Step {:>3}/{STEPS}:", step + 1);
            println!("   velocity:        {velocity:+.3}");
            println!("   true residual:   {actual:+.4}");
            println!("   predicted:       {:+.4}", predicted.value[[0, 0]]);
            println!(
                "   d/dv (learned):  {:+.4}   (analytic {:+.4})",
                predicted.jacobian[[0, 0, 1]],
                -2.0 * DRAG * velocity.abs()
            );
            println!("   window size:     {}\n", online.gp().training_set().len());
        }

        velocity += DT * (u + actual);
        position += DT * velocity;
    }

    recorder.flush()?;
    let (logged_x, logged_y) = load_data(&x_path, &y_path)?;
    println!("Recorded {} raw rows ({} state columns)", logged_x.nrows(), logged_x.ncols());

    let grid = Array2::from_shape_fn((5, 3), |(i, col)| match col {
        1 => -1.0 + 0.5 * i as f64,
        _ => 0.0,
    });
    let sweep = online.value_and_jacobian(grid.view())?;
    println!("\nLearned residual across velocity:");
    for (row, value) in grid.outer_iter().zip(sweep.value.column(0)) {
        println!(
            "   v={:+.2}  learned {:+.4}  true {:+.4}",
            row[1],
            value,
            true_residual(row[1])
        );
    }
    println!("\nMean logged residual: {:+.4}", logged_y.mean().unwrap_or(0.0));

    Ok(())
}
