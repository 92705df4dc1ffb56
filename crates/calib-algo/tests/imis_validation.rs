use calib_algo::{
    stopping_statistic, stopping_threshold, Distribution, Imis, ImisConfig, NextPointAlgorithm,
    NextPointState, OptimTool, OptimToolConfig, ParamSpec, Prior,
};
use calib_core::{CalibError, ResultRow, ResultTable};
use proptest::prelude::*;

fn uniform_prior(names: &[&str]) -> Prior {
    Prior::new(
        names
            .iter()
            .map(|name| ParamSpec {
                name: name.to_string(),
                distribution: Distribution::Uniform { min: -5.0, max: 5.0 },
            })
            .collect(),
    )
    .unwrap()
}

fn small_config() -> ImisConfig {
    ImisConfig {
        initial_samples: 60,
        samples_per_iteration: 10,
        n_resamples: 40,
        initial_points: None,
    }
}

fn analyze(imis: &mut Imis, table: &mut ResultTable, iteration: usize) {
    let set = imis.get_samples_for_iteration(iteration).unwrap();
    let rows: Vec<ResultRow> = set
        .samples
        .iter()
        .map(|(&sample, params)| ResultRow {
            iteration,
            sample,
            params: params.clone(),
            analyzers: Default::default(),
            total: -params.iter().map(|x| (x - 1.0).powi(2)).sum::<f64>(),
        })
        .collect();
    table.merge(&rows);
    imis.set_results_for_iteration(iteration, table).unwrap();
    imis.update_iteration(iteration).unwrap();
}

#[test]
fn kernel_batch_must_exceed_dimension() {
    let config = ImisConfig {
        samples_per_iteration: 1,
        ..small_config()
    };
    let err = Imis::new(uniform_prior(&["a", "b"]), config, 0).unwrap_err();
    assert!(matches!(err, CalibError::Configuration(_)));
    assert_eq!(err.info().code, "imis-samples-per-iteration");
}

#[test]
fn kernel_batch_cannot_exceed_initial_stage() {
    let config = ImisConfig {
        initial_samples: 5,
        samples_per_iteration: 10,
        ..small_config()
    };
    assert!(matches!(
        Imis::new(uniform_prior(&["a"]), config, 0),
        Err(CalibError::Configuration(_))
    ));
}

#[test]
fn initial_points_replace_prior_draws() {
    let points: Vec<Vec<f64>> = (0..12).map(|i| vec![i as f64 * 0.5 - 3.0]).collect();
    let config = ImisConfig {
        initial_points: Some(points.clone()),
        samples_per_iteration: 4,
        ..small_config()
    };
    let mut imis = Imis::new(uniform_prior(&["a"]), config, 0).unwrap();
    let set = imis.get_samples_for_iteration(0).unwrap();
    assert_eq!(set.points(), points);
}

#[test]
fn stopping_rule_compares_against_threshold() {
    let uniform = vec![1.0 / 1000.0; 1000];
    let statistic = stopping_statistic(&uniform, 100);
    assert!(statistic > stopping_threshold(100));
    let concentrated = vec![0.5, 0.5];
    assert!(stopping_statistic(&concentrated, 100) < stopping_threshold(100));
}

#[test]
fn restored_state_draws_identical_next_iteration() {
    let mut original = Imis::new(uniform_prior(&["a", "b"]), small_config(), 77).unwrap();
    let mut table = ResultTable::new(original.get_param_names());
    analyze(&mut original, &mut table, 0);

    let snapshot = serde_json::to_string(&original.get_state()).unwrap();
    let restored_state: NextPointState = serde_json::from_str(&snapshot).unwrap();
    let mut restored = Imis::new(uniform_prior(&["a", "b"]), small_config(), 77).unwrap();
    restored.set_state(restored_state).unwrap();

    let next_a = original.get_samples_for_iteration(1).unwrap();
    let next_b = restored.get_samples_for_iteration(1).unwrap();
    assert_eq!(next_a.len(), next_b.len());
    for (a, b) in next_a.points().iter().zip(next_b.points()) {
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-9);
        }
    }
}

#[test]
fn state_from_another_algorithm_is_rejected() {
    let mut imis = Imis::new(uniform_prior(&["a"]), small_config(), 1).unwrap();
    let optim = OptimTool::new(uniform_prior(&["a"]), OptimToolConfig::default(), 1).unwrap();
    let err = imis.set_state(optim.get_state()).unwrap_err();
    assert_eq!(err.info().code, "state-algorithm-mismatch");
}

#[test]
fn resume_preparation_forgets_later_results() {
    let mut imis = Imis::new(uniform_prior(&["a"]), small_config(), 8).unwrap();
    let mut table = ResultTable::new(imis.get_param_names());
    analyze(&mut imis, &mut table, 0);
    analyze(&mut imis, &mut table, 1);
    assert_eq!(imis.state().diagnostics.len(), 2);

    table.truncate_after(Some(0));
    imis.prepare_for_resume(&table).unwrap();
    let state = imis.state();
    assert_eq!(state.diagnostics.len(), 1);
    assert!(state
        .samples
        .iter()
        .filter(|row| row.iteration == 1)
        .all(|row| row.log_likelihood.is_none()));
    assert_eq!(imis.weights().len(), 60);
}

#[test]
fn missing_result_is_an_analyzer_error() {
    let mut imis = Imis::new(uniform_prior(&["a"]), small_config(), 2).unwrap();
    imis.get_samples_for_iteration(0).unwrap();
    let table = ResultTable::new(imis.get_param_names());
    assert!(matches!(
        imis.set_results_for_iteration(0, &table),
        Err(CalibError::Analyzer(_))
    ));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn weights_are_normalized(seed in any::<u64>(), peak in -4.0f64..4.0) {
        let mut imis = Imis::new(uniform_prior(&["a"]), small_config(), seed).unwrap();
        let set = imis.get_samples_for_iteration(0).unwrap();
        let rows: Vec<ResultRow> = set
            .samples
            .iter()
            .map(|(&sample, params)| ResultRow {
                iteration: 0,
                sample,
                params: params.clone(),
                analyzers: Default::default(),
                total: -3.0 * (params[0] - peak).powi(2),
            })
            .collect();
        let mut table = ResultTable::new(imis.get_param_names());
        table.merge(&rows);
        imis.set_results_for_iteration(0, &table).unwrap();
        let weights = imis.weights();
        prop_assert!(weights.iter().all(|w| *w >= 0.0 && w.is_finite()));
        prop_assert!((weights.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }
}
