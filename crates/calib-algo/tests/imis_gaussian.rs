use calib_algo::{Distribution, Imis, ImisConfig, NextPointAlgorithm, ParamSpec, Prior};
use calib_core::{ResultRow, ResultTable, SampleSet};

fn wide_normal_prior() -> Prior {
    Prior::new(vec![ParamSpec {
        name: "x".into(),
        distribution: Distribution::Normal { mean: 0.0, sd: 5.0 },
    }])
    .unwrap()
}

fn score(set: &SampleSet) -> Vec<ResultRow> {
    set.samples
        .iter()
        .map(|(&sample, params)| ResultRow {
            iteration: set.iteration,
            sample,
            params: params.clone(),
            analyzers: Default::default(),
            total: -0.5 * (params[0] - 2.0).powi(2),
        })
        .collect()
}

fn drive(imis: &mut Imis, iterations: usize) -> ResultTable {
    let mut table = ResultTable::new(imis.get_param_names());
    for iteration in 0..iterations {
        let set = imis.get_samples_for_iteration(iteration).unwrap();
        table.merge(&score(&set));
        imis.set_results_for_iteration(iteration, &table).unwrap();
        imis.update_iteration(iteration).unwrap();
        if imis.end_condition() {
            break;
        }
    }
    table
}

#[test]
fn posterior_mean_is_recovered() {
    let config = ImisConfig {
        initial_samples: 2000,
        samples_per_iteration: 200,
        n_resamples: 3000,
        initial_points: None,
    };
    let mut imis = Imis::new(wide_normal_prior(), config, 42).unwrap();
    drive(&mut imis, 5);

    let fin = imis.get_final_samples().unwrap();
    assert_eq!(fin.points.len(), 3000);
    let mean = fin.points.iter().map(|p| p[0]).sum::<f64>() / fin.points.len() as f64;
    // N(0, 25) prior times N(2, 1) likelihood.
    let expected = 2.0 * 25.0 / 26.0;
    assert!((mean - expected).abs() < 0.3, "mean {mean} vs {expected}");
}

#[test]
fn kernels_accumulate_one_per_stage() {
    let config = ImisConfig {
        initial_samples: 300,
        samples_per_iteration: 50,
        n_resamples: 100_000,
        initial_points: None,
    };
    let mut imis = Imis::new(wide_normal_prior(), config, 3).unwrap();
    drive(&mut imis, 4);
    let state = imis.state();
    assert_eq!(state.centers.len(), 3);
    assert_eq!(state.samples.len(), 300 + 3 * 50);
    assert!(state.kernel_densities.iter().all(|row| row.len() == 3));
    assert_eq!(state.diagnostics.len(), 4);
    assert!((imis.weights().iter().sum::<f64>() - 1.0).abs() < 1e-9);
}

#[test]
fn regenerating_an_iteration_returns_the_same_samples() {
    let config = ImisConfig {
        initial_samples: 100,
        samples_per_iteration: 20,
        n_resamples: 50,
        initial_points: None,
    };
    let mut imis = Imis::new(wide_normal_prior(), config, 5).unwrap();
    let first = imis.get_samples_for_iteration(0).unwrap();
    let again = imis.get_samples_for_iteration(0).unwrap();
    assert_eq!(first, again);
    assert_eq!(imis.state().samples.len(), 100);
}
