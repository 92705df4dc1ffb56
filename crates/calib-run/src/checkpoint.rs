use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use calib_algo::NextPointState;
use calib_core::errors::{CalibError, ErrorInfo};
use calib_core::serde::{from_json_slice, to_pretty_json_bytes};
use calib_core::{FinalSamples, ResultRow, ResultTable, SampleSet, SchemaVersion, StatusPoint};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;

use crate::executor::{JobHandle, SimulationHandle};

/// File name of the calibration-level document.
pub const CALIBRATION_FILE: &str = "CalibManager.json";
/// File name of each iteration document.
pub const ITERATION_FILE: &str = "IterationState.json";
/// Resolved configuration written when a calibration is initialized.
pub const RESOLVED_CONFIG_FILE: &str = "calibration.yaml";

/// Schema version written into every checkpoint.
pub const CHECKPOINT_SCHEMA: SchemaVersion = SchemaVersion::new(1, 0, 0);

/// Writes `bytes` to a temporary sibling and renames it over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CalibError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|err| CalibError::io("checkpoint-mkdir", parent, err))?;
    let mut tmp =
        NamedTempFile::new_in(parent).map_err(|err| CalibError::io("checkpoint-temp", parent, err))?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|err| CalibError::io("checkpoint-write", path, err))?;
    tmp.persist(path)
        .map_err(|err| CalibError::io("checkpoint-rename", path, err.error))?;
    Ok(())
}

/// Serializes `value` as pretty JSON and writes it atomically.
pub fn store_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CalibError> {
    write_atomic(path, &to_pretty_json_bytes(value)?)
}

/// Reads a JSON document.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, CalibError> {
    let bytes = fs::read(path).map_err(|err| CalibError::io("checkpoint-read", path, err))?;
    from_json_slice(&bytes).map_err(|err| {
        CalibError::Serde(
            ErrorInfo::new("checkpoint-parse", err.info().message.clone())
                .with_context("path", path.display()),
        )
    })
}

fn check_schema(found: &SchemaVersion, path: &Path) -> Result<(), CalibError> {
    if CHECKPOINT_SCHEMA.reads(found) {
        Ok(())
    } else {
        Err(CalibError::Serde(
            ErrorInfo::new("checkpoint-schema", "checkpoint written by an incompatible version")
                .with_context("path", path.display())
                .with_context(
                    "found",
                    format!("{}.{}.{}", found.major, found.minor, found.patch),
                ),
        ))
    }
}

/// One completed transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// Status reached.
    pub status: StatusPoint,
    /// RFC 3339 time of the transition.
    pub at: String,
}

/// Persisted state of one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// Schema of the document.
    pub schema: SchemaVersion,
    /// Iteration number.
    pub iteration: usize,
    /// Last completed transition; `None` before the first one.
    pub status: Option<StatusPoint>,
    /// Wall-clock start of the iteration.
    pub started_at: Option<String>,
    /// Suite receiving the iteration's job.
    pub suite_id: String,
    /// Samples generated for the iteration.
    pub samples: Option<SampleSet>,
    /// Handle of the submitted job.
    pub job: Option<JobHandle>,
    /// Simulations of the submitted job.
    #[serde(default)]
    pub simulations: Vec<SimulationHandle>,
    /// Raw per-analyzer caches keyed `site/analyzer`.
    #[serde(default)]
    pub analyzer_cache: BTreeMap<String, Value>,
    /// Results in the form the algorithm asked to persist.
    pub results_cache: Option<Value>,
    /// Combined result rows of the iteration.
    #[serde(default)]
    pub results: Vec<ResultRow>,
    /// Algorithm snapshot as of the last completed transition.
    pub algorithm_state: Option<NextPointState>,
    /// Every completed transition in order.
    #[serde(default)]
    pub timeline: Vec<StatusEvent>,
}

impl IterationRecord {
    /// Empty record for a new iteration.
    pub fn new(iteration: usize, suite_id: impl Into<String>) -> Self {
        Self {
            schema: CHECKPOINT_SCHEMA,
            iteration,
            status: None,
            started_at: None,
            suite_id: suite_id.into(),
            samples: None,
            job: None,
            simulations: Vec::new(),
            analyzer_cache: BTreeMap::new(),
            results_cache: None,
            results: Vec::new(),
            algorithm_state: None,
            timeline: Vec::new(),
        }
    }

    /// Directory of iteration `iteration` inside a calibration directory.
    pub fn dir(calib_dir: &Path, iteration: usize) -> PathBuf {
        calib_dir.join(format!("iter{iteration}"))
    }

    /// Path of the iteration document.
    pub fn path(calib_dir: &Path, iteration: usize) -> PathBuf {
        Self::dir(calib_dir, iteration).join(ITERATION_FILE)
    }

    /// True when the iteration was checkpointed at least once.
    pub fn exists(calib_dir: &Path, iteration: usize) -> bool {
        Self::path(calib_dir, iteration).is_file()
    }

    /// Loads the iteration document.
    pub fn load(calib_dir: &Path, iteration: usize) -> Result<Self, CalibError> {
        let path = Self::path(calib_dir, iteration);
        let record: IterationRecord = load_json(&path)?;
        check_schema(&record.schema, &path)?;
        Ok(record)
    }

    /// Overwrites the iteration document.
    pub fn store(&self, calib_dir: &Path) -> Result<(), CalibError> {
        store_json(&Self::path(calib_dir, self.iteration), self)
    }

    /// Number of contiguous iteration documents starting at 0.
    pub fn count(calib_dir: &Path) -> usize {
        (0..).take_while(|k| Self::exists(calib_dir, *k)).count()
    }
}

/// Calibration-level document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibCheckpoint {
    /// Schema of the document.
    pub schema: SchemaVersion,
    /// Calibration name.
    pub name: String,
    /// Execution location the run was last commissioned against.
    pub location: String,
    /// Suites created for the run, newest last.
    pub suite_ids: Vec<String>,
    /// Upper bound on the number of iterations.
    pub max_iterations: usize,
    /// Iteration currently (or last) executed.
    pub iteration: usize,
    /// Calibration start time.
    pub started_at: String,
    /// Calibrated parameter names.
    pub param_names: Vec<String>,
    /// Analyzer names per site.
    pub sites: BTreeMap<String, Vec<String>>,
    /// Results of every analyzed iteration.
    pub results: ResultTable,
    /// Configuration the run was started with.
    pub config: Value,
    /// Stable hash of `config`.
    pub config_hash: String,
    /// Final samples once the run finalized.
    pub final_samples: Option<FinalSamples>,
}

impl CalibCheckpoint {
    /// Path of the document inside a calibration directory.
    pub fn path(calib_dir: &Path) -> PathBuf {
        calib_dir.join(CALIBRATION_FILE)
    }

    /// True when a calibration was started in `calib_dir`.
    pub fn exists(calib_dir: &Path) -> bool {
        Self::path(calib_dir).is_file()
    }

    /// Loads the calibration document.
    pub fn load(calib_dir: &Path) -> Result<Self, CalibError> {
        let path = Self::path(calib_dir);
        let checkpoint: CalibCheckpoint = load_json(&path)?;
        check_schema(&checkpoint.schema, &path)?;
        Ok(checkpoint)
    }

    /// Overwrites the calibration document.
    pub fn store(&self, calib_dir: &Path) -> Result<(), CalibError> {
        store_json(&Self::path(calib_dir), self)
    }

    /// Suite receiving new jobs.
    pub fn current_suite(&self) -> Result<&str, CalibError> {
        self.suite_ids.last().map(String::as_str).ok_or_else(|| {
            CalibError::Serde(ErrorInfo::new(
                "checkpoint-no-suite",
                "calibration checkpoint lists no suite",
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn iteration_record_roundtrip() {
        let dir = tempdir().unwrap();
        let mut record = IterationRecord::new(2, "suite-a");
        record.status = Some(StatusPoint::Commission);
        record.timeline.push(StatusEvent {
            status: StatusPoint::Commission,
            at: "2024-01-01T00:00:00.000Z".into(),
        });
        record.store(dir.path()).unwrap();
        assert!(IterationRecord::exists(dir.path(), 2));
        assert_eq!(IterationRecord::load(dir.path(), 2).unwrap(), record);
        assert_eq!(IterationRecord::count(dir.path()), 0);
    }

    #[test]
    fn atomic_write_replaces_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("doc.json");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        let leftovers = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn future_schema_is_rejected() {
        let dir = tempdir().unwrap();
        let mut record = IterationRecord::new(0, "suite");
        record.schema = SchemaVersion::new(2, 0, 0);
        record.store(dir.path()).unwrap();
        let err = IterationRecord::load(dir.path(), 0).unwrap_err();
        assert_eq!(err.info().code, "checkpoint-schema");
    }
}
