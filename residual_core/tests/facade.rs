use ndarray::{array, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use residual_core::{
    ExactGp, FeatureMask, FeatureSelector, GpHyperparameters, GpPredictor,
    OnlineLearningStrategy, ResidualConfig, ResidualError, ResidualModel,
};

fn trained_model(mask: Vec<bool>) -> ResidualModel {
    let state_dimension = mask.len();
    let selector = FeatureSelector::new(Some(FeatureMask::new(mask)), state_dimension).unwrap();
    let input_dimension = selector.input_dimension();

    let mut rng = StdRng::seed_from_u64(3);
    let train_x: Array2<f64> = Array2::from_shape_fn((25, input_dimension), |_| rng.gen_range(-2.0..2.0));
    let train_y = Array2::from_shape_fn((25, 2), |(i, t)| {
        let row = train_x.row(i);
        if t == 0 {
            row.sum().sin()
        } else {
            row.mapv(|v| v * v).sum() * 0.1
        }
    });

    let mut hyper = GpHyperparameters::isotropic(2, 0.9, 1.2, 1e-3);
    hyper.means = array![0.0, 0.2];
    let mut gp = ExactGp::with_training_data(train_x.view(), train_y.view(), hyper).unwrap();
    gp.eval();
    ResidualModel::new(gp, selector, Box::new(OnlineLearningStrategy::new(100).unwrap())).unwrap()
}

#[test]
fn output_shapes_follow_batch_size() {
    let mut model = trained_model(vec![true, false, true, true, false]);
    let mut rng = StdRng::seed_from_u64(11);
    for n in [1, 2, 9, 32] {
        let query = Array2::from_shape_fn((n, 5), |_| rng.gen_range(-1.0..1.0));
        let out = model.value_and_jacobian(query.view()).unwrap();
        assert_eq!(out.value.dim(), (n, 2));
        assert_eq!(out.jacobian.dim(), (2, n, 5));
        for col in [1, 4] {
            assert!(out.jacobian.index_axis(Axis(2), col).iter().all(|v| *v == 0.0));
        }
    }
}

#[test]
fn jacobian_matches_finite_differences_on_raw_state() {
    let mut model = trained_model(vec![true, false, true]);
    let query = array![[0.4, 3.0, -0.7], [-1.1, -5.0, 0.2]];
    let out = model.value_and_jacobian(query.view()).unwrap();

    let h = 1e-5;
    for n in 0..query.nrows() {
        for d in 0..3 {
            let mut plus = query.clone();
            let mut minus = query.clone();
            plus[[n, d]] += h;
            minus[[n, d]] -= h;
            let up = model.value_and_jacobian(plus.view()).unwrap().value;
            let down = model.value_and_jacobian(minus.view()).unwrap().value;
            for r in 0..2 {
                let numeric = (up[[n, r]] - down[[n, r]]) / (2.0 * h);
                let analytic = out.jacobian[[r, n, d]];
                assert!(
                    (numeric - analytic).abs() < 1e-4,
                    "r={r} n={n} d={d}: numeric {numeric} vs analytic {analytic}"
                );
            }
        }
    }
}

#[test]
fn repeated_queries_are_stateless() {
    let mut model = trained_model(vec![true, true, false]);
    let query = array![[0.1, 0.2, 0.3]];
    let first = model.value_and_jacobian(query.view()).unwrap();
    let _ = model
        .value_and_jacobian(Array2::zeros((7, 3)).view())
        .unwrap();
    let again = model.value_and_jacobian(query.view()).unwrap();
    assert_eq!(first, again);
}

#[test]
fn malformed_queries_are_shape_errors() {
    let mut model = trained_model(vec![true, false, true]);
    let wide = Array2::<f64>::zeros((1, 4));
    match model.value_and_jacobian(wide.view()) {
        Err(ResidualError::Shape { expected, got, .. }) => {
            assert_eq!(expected, 3);
            assert_eq!(got, 4);
        }
        other => panic!("expected shape error, got {other:?}"),
    }
    assert!(model
        .value_and_jacobian(Array2::<f64>::zeros((0, 3)).view())
        .unwrap_err()
        .is_shape());
}

#[test]
fn mask_boundaries_fail_at_construction() {
    let err = FeatureSelector::new(Some(FeatureMask::new(vec![false, false])), 2).unwrap_err();
    assert!(err.is_configuration());
    let err = FeatureSelector::new(Some(FeatureMask::new(vec![true, false])), 3).unwrap_err();
    assert!(err.is_shape());
}

#[test]
fn model_builds_from_toml() {
    let dir = tempfile::tempdir().unwrap();
    let toml = format!(
        r#"
[model]
state_dimension = 4
residual_dimension = 1
feature_mask = [true, true, false, true]

[gp]
lengthscale = 1.5
outputscale = 0.5
noise = 0.02

[strategy]
kind = "record"
x_path = {x:?}
y_path = {y:?}
buffer_size = 4
"#,
        x = dir.path().join("x.txt").display().to_string(),
        y = dir.path().join("y.txt").display().to_string(),
    );
    let config = ResidualConfig::from_str(&toml).unwrap();
    let mut model = ResidualModel::from_config(&config).unwrap();
    assert_eq!(model.state_dimension(), 4);
    assert_eq!(model.gp().input_dimension(), 3);

    for i in 0..6 {
        let v = i as f64;
        model
            .record_datapoint(array![v, v, v, v].view(), array![v].view())
            .unwrap();
    }
    model.flush().unwrap();
    let (x, _) = residual_core::load_data(dir.path().join("x.txt"), dir.path().join("y.txt")).unwrap();
    assert_eq!(x.nrows(), 6);
    assert_eq!(x.ncols(), 4);
}
