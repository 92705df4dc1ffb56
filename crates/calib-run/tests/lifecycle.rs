mod common;

use std::fs;

use calib_core::StatusPoint;
use calib_run::checkpoint::RESOLVED_CONFIG_FILE;
use calib_run::summary::{FINAL_SAMPLES_FILE, LEADERBOARD_FILE};
use calib_run::{
    CalibCheckpoint, CalibManager, ConflictPolicy, Executor, IterationRecord, StartOutcome,
};
use tempfile::tempdir;

use common::{config, executor, gaussian_model, record};

#[test]
fn fresh_run_completes_every_iteration() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let executor = executor(dir.path(), gaussian_model(), "local");
    let mut manager = CalibManager::new(config.clone(), executor.clone()).unwrap();

    let report = manager.run(ConflictPolicy::Abort).unwrap().unwrap();
    assert_eq!(report.iterations, 3);
    assert!(report.orphans.is_empty());
    assert_eq!(report.final_samples.param_names, vec!["x".to_string()]);
    assert_eq!(report.final_samples.points.len(), 1000);
    assert!(report.final_samples.weights.iter().all(|w| *w > 0.0));
    let mean = report.final_samples.weighted_mean()[0];
    assert!((mean - 50.0 / 26.0).abs() < 1.0, "posterior mean {mean}");

    let calib_dir = config.calibration_dir();
    assert!(calib_dir.join(LEADERBOARD_FILE).is_file());
    assert!(calib_dir.join(FINAL_SAMPLES_FILE).is_file());
    let resolved = fs::read(calib_dir.join(RESOLVED_CONFIG_FILE)).unwrap();
    let resolved: calib_run::CalibConfig = serde_yaml::from_slice(&resolved).unwrap();
    assert_eq!(resolved, config);
    let checkpoint = CalibCheckpoint::load(&calib_dir).unwrap();
    assert_eq!(checkpoint.results.rows.len(), 60 + 15 + 15);
    assert!(checkpoint.final_samples.is_some());
    assert_eq!(checkpoint.location, "local");

    for iteration in 0..3 {
        let record = record(&config, iteration);
        assert_eq!(record.status, Some(StatusPoint::Done));
        let statuses: Vec<StatusPoint> = record.timeline.iter().map(|event| event.status).collect();
        assert_eq!(statuses, StatusPoint::ALL.to_vec());
        assert!(record.algorithm_state.is_some());
        assert_eq!(record.analyzer_cache.len(), 1);
    }
}

#[test]
fn each_iteration_submits_one_job() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let executor = executor(dir.path(), gaussian_model(), "local");
    let mut manager = CalibManager::new(config.clone(), executor.clone()).unwrap();
    manager.run(ConflictPolicy::Abort).unwrap();

    let checkpoint = CalibCheckpoint::load(&config.calibration_dir()).unwrap();
    let jobs = executor.list_jobs(checkpoint.current_suite().unwrap()).unwrap();
    assert_eq!(jobs.len(), 3);
    for iteration in 0..3 {
        let job = record(&config, iteration).job.unwrap();
        assert!(jobs.contains(&job));
    }
}

#[test]
fn abort_leaves_an_existing_run_untouched() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let executor = executor(dir.path(), gaussian_model(), "local");
    CalibManager::new(config.clone(), executor.clone())
        .unwrap()
        .run(ConflictPolicy::Abort)
        .unwrap();
    let path = CalibCheckpoint::path(&config.calibration_dir());
    let before = fs::read(&path).unwrap();

    let mut manager = CalibManager::new(config.clone(), executor).unwrap();
    assert_eq!(manager.run(ConflictPolicy::Abort).unwrap(), None);
    assert_eq!(fs::read(&path).unwrap(), before);
}

#[test]
fn backup_moves_the_previous_run_aside() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let executor = executor(dir.path(), gaussian_model(), "local");
    CalibManager::new(config.clone(), executor.clone())
        .unwrap()
        .run(ConflictPolicy::Abort)
        .unwrap();

    let mut manager = CalibManager::new(config.clone(), executor).unwrap();
    let outcome = manager.start(ConflictPolicy::BackupAndRestart).unwrap();
    let StartOutcome::Restarted {
        backup: Some(backup),
    } = outcome.clone()
    else {
        panic!("unexpected outcome {outcome:?}");
    };
    assert!(CalibCheckpoint::exists(&backup));
    assert!(IterationRecord::exists(&backup, 2));
    assert!(backup
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("peak_backup_"));

    let fresh = CalibCheckpoint::load(&config.calibration_dir()).unwrap();
    assert!(fresh.results.rows.is_empty());
    assert_eq!(IterationRecord::count(&config.calibration_dir()), 0);
}

#[test]
fn clean_restart_deletes_previous_jobs() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let executor = executor(dir.path(), gaussian_model(), "local");
    CalibManager::new(config.clone(), executor.clone())
        .unwrap()
        .run(ConflictPolicy::Abort)
        .unwrap();
    let old_suite = CalibCheckpoint::load(&config.calibration_dir())
        .unwrap()
        .current_suite()
        .unwrap()
        .to_string();

    let mut manager = CalibManager::new(config.clone(), executor.clone()).unwrap();
    let report = manager.run(ConflictPolicy::CleanAndRestart).unwrap().unwrap();
    assert_eq!(report.iterations, 3);
    assert!(executor.list_jobs(&old_suite).unwrap().is_empty());
    let checkpoint = CalibCheckpoint::load(&config.calibration_dir()).unwrap();
    assert_eq!(checkpoint.suite_ids.len(), 1);
    assert_ne!(checkpoint.suite_ids[0], old_suite);
}

#[test]
fn cleanup_removes_directory_and_jobs() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let executor = executor(dir.path(), gaussian_model(), "local");
    let mut manager = CalibManager::new(config.clone(), executor.clone()).unwrap();
    manager.run(ConflictPolicy::Abort).unwrap();
    let suite = CalibCheckpoint::load(&config.calibration_dir())
        .unwrap()
        .current_suite()
        .unwrap()
        .to_string();

    manager.cleanup().unwrap();
    assert!(!config.calibration_dir().exists());
    assert!(executor.list_jobs(&suite).unwrap().is_empty());
    // Nothing left to clean is not an error.
    manager.cleanup().unwrap();
}

#[test]
fn replot_walks_analyzed_iterations() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let executor = executor(dir.path(), gaussian_model(), "local");
    CalibManager::new(config.clone(), executor.clone())
        .unwrap()
        .run(ConflictPolicy::Abort)
        .unwrap();

    let mut manager = CalibManager::new(config, executor).unwrap();
    assert_eq!(
        manager.start(ConflictPolicy::Replot).unwrap(),
        StartOutcome::Replotted { iterations: 3 }
    );
}

#[test]
fn invalid_name_is_rejected_before_side_effects() {
    let dir = tempdir().unwrap();
    let mut config = config(dir.path());
    config.name = "../escape".into();
    let executor = executor(dir.path(), gaussian_model(), "local");
    let err = CalibManager::new(config, executor).err().unwrap();
    assert_eq!(err.info().code, "config-name");
    assert!(!dir.path().join("calibrations").exists());
}

#[test]
fn converged_run_resumes_straight_to_finalize() {
    let dir = tempdir().unwrap();
    let mut config = config(dir.path());
    config.max_iterations = 5;
    match &mut config.algorithm {
        calib_algo::AlgorithmConfig::Imis(imis) => imis.n_resamples = 10,
        other => panic!("unexpected algorithm {other:?}"),
    }
    let executor = executor(dir.path(), gaussian_model(), "local");
    let mut manager = CalibManager::new(config.clone(), executor.clone()).unwrap();
    let report = manager.run(ConflictPolicy::Abort).unwrap().unwrap();
    assert_eq!(report.iterations, 1);
    assert_eq!(record(&config, 0).status, Some(StatusPoint::Plot));

    // Interrupted between the stopping rule and finalize.
    let calib_dir = config.calibration_dir();
    let mut checkpoint = CalibCheckpoint::load(&calib_dir).unwrap();
    checkpoint.final_samples = None;
    checkpoint.store(&calib_dir).unwrap();

    let mut manager = CalibManager::new(config.clone(), executor.clone()).unwrap();
    let resumed = manager.resume(Default::default()).unwrap();
    assert_eq!(resumed.iterations, 1);
    assert_eq!(IterationRecord::count(&calib_dir), 1);
    assert_eq!(record(&config, 0).status, Some(StatusPoint::Plot));
    assert_eq!(resumed.final_samples.points.len(), 10);
    let jobs = executor
        .list_jobs(CalibCheckpoint::load(&calib_dir).unwrap().current_suite().unwrap())
        .unwrap();
    assert_eq!(jobs.len(), 1);
}
