mod common;

use std::thread;
use std::time::{Duration, Instant};

use calib_core::CalibError;
use calib_run::{CalibManager, ConflictPolicy, Executor, IterationRecord, SimState};
use tempfile::tempdir;

use common::{config, executor, slow_model};

#[test]
fn kill_cancels_the_running_batch() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let executor = executor(dir.path(), slow_model(Duration::from_millis(30)), "local");

    let runner = {
        let config = config.clone();
        let executor = executor.clone();
        thread::spawn(move || {
            CalibManager::new(config, executor)
                .unwrap()
                .run(ConflictPolicy::Abort)
        })
    };

    let calib_dir = config.calibration_dir();
    let deadline = Instant::now() + Duration::from_secs(10);
    let job = loop {
        if let Some(job) = IterationRecord::load(&calib_dir, 0)
            .ok()
            .and_then(|record| record.job)
        {
            break job;
        }
        assert!(Instant::now() < deadline, "batch was never commissioned");
        thread::sleep(Duration::from_millis(5));
    };

    let killer = CalibManager::new(config.clone(), executor.clone()).unwrap();
    assert_eq!(killer.kill().unwrap(), Some(job.clone()));
    let states = executor.poll_status(&job).unwrap();
    assert!(states.values().all(|state| state.is_terminal()));
    assert!(states.values().any(|state| *state == SimState::Cancelled));

    let err = runner.join().unwrap().unwrap_err();
    assert!(matches!(err, CalibError::SimulationFailure(_)));
}

#[test]
fn kill_without_a_calibration_is_a_no_op() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let executor = executor(dir.path(), slow_model(Duration::ZERO), "local");
    let manager = CalibManager::new(config, executor).unwrap();
    assert_eq!(manager.kill().unwrap(), None);
}
