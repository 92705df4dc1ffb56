use std::collections::BTreeSet;
use std::path::Path;

use calib_core::errors::CalibError;
use calib_core::{FinalSamples, ResultTable};
use tempfile::NamedTempFile;

/// Leaderboard of every evaluated sample, best first.
pub const LEADERBOARD_FILE: &str = "LL_all.csv";
/// Final samples of a finished calibration.
pub const FINAL_SAMPLES_FILE: &str = "final_samples.csv";

fn write_csv(path: &Path, header: &[String], records: &[Vec<String>]) -> Result<(), CalibError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp =
        NamedTempFile::new_in(parent).map_err(|err| CalibError::io("csv-temp", parent, err))?;
    {
        let mut writer = csv::Writer::from_writer(&mut tmp);
        writer
            .write_record(header)
            .map_err(|err| CalibError::io("csv-write", path, err))?;
        for record in records {
            writer
                .write_record(record)
                .map_err(|err| CalibError::io("csv-write", path, err))?;
        }
        writer
            .flush()
            .map_err(|err| CalibError::io("csv-write", path, err))?;
    }
    tmp.persist(path)
        .map_err(|err| CalibError::io("csv-rename", path, err.error))?;
    Ok(())
}

/// Writes the result history ranked by total log-likelihood.
pub fn write_leaderboard(path: &Path, history: &ResultTable) -> Result<(), CalibError> {
    let analyzer_keys: BTreeSet<&String> = history
        .rows
        .iter()
        .flat_map(|row| row.analyzers.keys())
        .collect();
    let mut header = vec!["iteration".to_string(), "sample".to_string()];
    header.extend(history.param_names.iter().cloned());
    header.extend(analyzer_keys.iter().map(|key| key.to_string()));
    header.push("total".to_string());

    let records: Vec<Vec<String>> = history
        .leaderboard()
        .into_iter()
        .map(|row| {
            let mut record = vec![row.iteration.to_string(), row.sample.to_string()];
            record.extend(row.params.iter().map(f64::to_string));
            record.extend(analyzer_keys.iter().map(|key| {
                row.analyzers
                    .get(*key)
                    .map_or_else(String::new, f64::to_string)
            }));
            record.push(row.total.to_string());
            record
        })
        .collect();
    write_csv(path, &header, &records)
}

/// Writes final samples, one row per point with its weight.
pub fn write_final_samples(path: &Path, samples: &FinalSamples) -> Result<(), CalibError> {
    let mut header = samples.param_names.clone();
    header.push("weight".to_string());
    let records: Vec<Vec<String>> = samples
        .points
        .iter()
        .zip(&samples.weights)
        .map(|(point, weight)| {
            let mut record: Vec<String> = point.iter().map(f64::to_string).collect();
            record.push(weight.to_string());
            record
        })
        .collect();
    write_csv(path, &header, &records)
}
