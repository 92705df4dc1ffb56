mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use calib_core::{CalibError, StatusPoint};
use calib_run::{CalibCheckpoint, CalibManager, ConflictPolicy, ResumeRequest};
use tempfile::tempdir;

use common::{config, executor, gaussian_model, record, switchable_model};

#[test]
fn resume_beyond_the_latest_iteration_conflicts() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let executor = executor(dir.path(), gaussian_model(), "local");
    let mut manager = CalibManager::new(config, executor).unwrap();
    manager.run(ConflictPolicy::Abort).unwrap();

    let err = manager
        .plan_resume(&ResumeRequest {
            iteration: Some(5),
            ..ResumeRequest::default()
        })
        .unwrap_err();
    assert!(matches!(err, CalibError::ResumeConflict(_)));
}

#[test]
fn started_calibration_without_iterations_only_resumes_from_the_start() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let executor = executor(dir.path(), gaussian_model(), "local");
    let mut manager = CalibManager::new(config, executor).unwrap();
    manager.start(ConflictPolicy::Abort).unwrap();

    let err = manager
        .plan_resume(&ResumeRequest {
            iteration: Some(0),
            status: Some(StatusPoint::Analyze),
            ..ResumeRequest::default()
        })
        .unwrap_err();
    assert!(matches!(err, CalibError::ResumeConflict(_)));

    let plan = manager
        .plan_resume(&ResumeRequest {
            iteration: Some(0),
            status: Some(StatusPoint::IterationStart),
            ..ResumeRequest::default()
        })
        .unwrap();
    assert_eq!(plan.iteration, 0);
    assert_eq!(plan.status, StatusPoint::IterationStart);
    assert!(plan.job_missing);
}

#[test]
fn resume_point_follows_the_first_incomplete_transition() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let executor = executor(dir.path(), gaussian_model(), "local");
    let mut manager = CalibManager::new(config.clone(), executor).unwrap();
    manager.run(ConflictPolicy::Abort).unwrap();

    let mut interrupted = record(&config, 2);
    interrupted.status = Some(StatusPoint::Commission);
    interrupted.timeline.truncate(2);
    interrupted.store(&config.calibration_dir()).unwrap();

    let plan = manager.plan_resume(&ResumeRequest::default()).unwrap();
    assert_eq!(plan.iteration, 2);
    assert_eq!(plan.status, StatusPoint::Running);
    assert!(!plan.job_missing);
    assert!(!plan.location_changed);

    let err = manager
        .plan_resume(&ResumeRequest {
            status: Some(StatusPoint::Analyze),
            ..ResumeRequest::default()
        })
        .unwrap_err();
    assert!(matches!(err, CalibError::ResumeConflict(_)));

    interrupted.job = None;
    interrupted.store(&config.calibration_dir()).unwrap();
    let plan = manager.plan_resume(&ResumeRequest::default()).unwrap();
    assert_eq!(plan.status, StatusPoint::Commission);
    assert!(plan.job_missing);
}

#[test]
fn resuming_at_commission_regenerates_identical_samples() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let executor = executor(dir.path(), gaussian_model(), "local");
    CalibManager::new(config.clone(), executor.clone())
        .unwrap()
        .run(ConflictPolicy::Abort)
        .unwrap();
    let original_1 = record(&config, 1);
    let original_2 = record(&config, 2);

    let mut manager = CalibManager::new(config.clone(), executor).unwrap();
    let report = manager
        .resume(ResumeRequest {
            iteration: Some(1),
            status: Some(StatusPoint::Commission),
            ..ResumeRequest::default()
        })
        .unwrap();
    assert_eq!(report.iterations, 3);

    let rerun_1 = record(&config, 1);
    let rerun_2 = record(&config, 2);
    assert_eq!(rerun_1.samples, original_1.samples);
    assert_eq!(rerun_2.samples, original_2.samples);
    assert_ne!(rerun_1.job, original_1.job);
    assert_eq!(rerun_2.results, original_2.results);

    // The replaced jobs of iterations 1 and 2 are no longer referenced.
    let orphaned: Vec<String> = report.orphans.iter().map(|o| o.job_id.clone()).collect();
    assert_eq!(orphaned.len(), 2);
    assert!(orphaned.contains(&original_1.job.unwrap().job_id));
    assert!(orphaned.contains(&original_2.job.unwrap().job_id));
    assert!(report.orphans.iter().all(|o| !o.purged));
}

#[test]
fn resuming_at_analyze_reuses_the_batch() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let executor = executor(dir.path(), gaussian_model(), "local");
    CalibManager::new(config.clone(), executor.clone())
        .unwrap()
        .run(ConflictPolicy::Abort)
        .unwrap();
    let before = record(&config, 2);

    let mut manager = CalibManager::new(config.clone(), executor).unwrap();
    let report = manager
        .resume(ResumeRequest {
            iteration: Some(2),
            status: Some(StatusPoint::Analyze),
            ..ResumeRequest::default()
        })
        .unwrap();
    let after = record(&config, 2);
    assert_eq!(after.samples, before.samples);
    assert_eq!(after.job, before.job);
    assert_eq!(after.results, before.results);
    assert_eq!(after.status, Some(StatusPoint::Done));
    assert!(report.orphans.is_empty());
}

#[test]
fn finalized_calibration_only_refreshes_outputs() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let executor = executor(dir.path(), gaussian_model(), "local");
    let first = CalibManager::new(config.clone(), executor.clone())
        .unwrap()
        .run(ConflictPolicy::Abort)
        .unwrap()
        .unwrap();
    let before = record(&config, 2);

    let mut manager = CalibManager::new(config.clone(), executor).unwrap();
    let again = manager.run(ConflictPolicy::Resume).unwrap().unwrap();
    assert_eq!(again.final_samples, first.final_samples);
    assert_eq!(record(&config, 2), before);
}

#[test]
fn failed_batch_resumes_at_a_new_location_after_confirmation() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let broken = Arc::new(AtomicBool::new(true));
    let first = executor(dir.path(), switchable_model(broken.clone()), "site-a");
    let mut manager = CalibManager::new(config.clone(), first).unwrap();
    let err = manager.run(ConflictPolicy::Abort).unwrap_err();
    assert!(matches!(err, CalibError::SimulationFailure(_)));
    let failed = record(&config, 0);
    assert_eq!(failed.status, Some(StatusPoint::Commission));
    let failed_job = failed.job.unwrap();

    broken.store(false, Ordering::SeqCst);
    let second = executor(dir.path(), switchable_model(broken), "site-b");
    let mut manager = CalibManager::new(config.clone(), second).unwrap();
    let err = manager.resume(ResumeRequest::default()).unwrap_err();
    assert!(err.is_soft());
    assert!(matches!(err, CalibError::ExecutionLocationChanged(_)));
    let plan = manager.plan_resume(&ResumeRequest::default()).unwrap();
    assert_eq!(plan.status, StatusPoint::Commission);
    assert!(plan.location_changed);

    let report = manager
        .resume(ResumeRequest {
            confirm_location_change: true,
            ..ResumeRequest::default()
        })
        .unwrap();
    assert_eq!(report.iterations, 3);
    assert_eq!(report.orphans.len(), 1);
    assert_eq!(report.orphans[0].job_id, failed_job.job_id);

    let checkpoint = CalibCheckpoint::load(&config.calibration_dir()).unwrap();
    assert_eq!(checkpoint.location, "site-b");
    assert_eq!(checkpoint.suite_ids.len(), 2);
    assert_eq!(record(&config, 0).job.unwrap().location, "site-b");
}
