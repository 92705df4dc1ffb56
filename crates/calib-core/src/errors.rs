//! Structured error types shared across calibration crates.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured payload attached to every [`CalibError`] variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable machine readable error code.
    pub code: String,
    /// Human readable diagnostic message.
    pub message: String,
    /// Contextual key value pairs (iteration numbers, paths, job ids, etc.).
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Optional hint that may help the operator resolve the issue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorInfo {
    /// Creates a new error payload with the provided code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            context: BTreeMap::new(),
            hint: None,
        }
    }

    /// Adds a context entry to the payload.
    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    /// Sets a human readable hint for remediation.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// Canonical error type for the calibration engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "family", content = "detail")]
pub enum CalibError {
    /// Invalid algorithm or run parameters, detected before any side effect.
    #[error("configuration error: {0}")]
    Configuration(ErrorInfo),
    /// Requested resume point lies beyond the last completed one.
    #[error("resume conflict: {0}")]
    ResumeConflict(ErrorInfo),
    /// The run was commissioned against a different execution backend.
    ///
    /// Soft: the operator may confirm and resume from `Commission`.
    #[error("execution location changed: {0}")]
    ExecutionLocationChanged(ErrorInfo),
    /// A simulation failed or was cancelled while the batch was running.
    #[error("simulation failure: {0}")]
    SimulationFailure(ErrorInfo),
    /// The executor backend rejected a request.
    #[error("executor error: {0}")]
    Executor(ErrorInfo),
    /// An analyzer could not turn simulation output into results.
    #[error("analyzer error: {0}")]
    Analyzer(ErrorInfo),
    /// Numerical failure inside a sampling algorithm.
    #[error("numeric error: {0}")]
    Numeric(ErrorInfo),
    /// Serialization and schema errors.
    #[error("serde error: {0}")]
    Serde(ErrorInfo),
    /// Filesystem errors.
    #[error("io error: {0}")]
    Io(ErrorInfo),
}

impl Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code: {})", self.message, self.code)?;
        if !self.context.is_empty() {
            write!(f, " | context: [")?;
            for (idx, (key, value)) in self.context.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{key}={value}")?;
            }
            write!(f, "]")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, " | hint: {hint}")?;
        }
        Ok(())
    }
}

impl CalibError {
    /// Returns a reference to the payload describing the error.
    pub fn info(&self) -> &ErrorInfo {
        match self {
            CalibError::Configuration(info)
            | CalibError::ResumeConflict(info)
            | CalibError::ExecutionLocationChanged(info)
            | CalibError::SimulationFailure(info)
            | CalibError::Executor(info)
            | CalibError::Analyzer(info)
            | CalibError::Numeric(info)
            | CalibError::Serde(info)
            | CalibError::Io(info) => info,
        }
    }

    /// Returns true when the error can be cleared by operator confirmation.
    pub fn is_soft(&self) -> bool {
        matches!(self, CalibError::ExecutionLocationChanged(_))
    }

    /// Shorthand for a configuration error.
    pub fn configuration(code: &str, message: impl Into<String>) -> Self {
        CalibError::Configuration(ErrorInfo::new(code, message))
    }

    /// Wraps a filesystem error, recording the offending path.
    pub fn io(code: &str, path: &std::path::Path, err: impl ToString) -> Self {
        CalibError::Io(ErrorInfo::new(code, err.to_string()).with_context("path", path.display()))
    }
}

/// Remote resource that no checkpoint references any more.
///
/// Reported by `finalize`, never raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanResourceWarning {
    /// Suite containing the orphaned job.
    pub suite_id: String,
    /// Identifier of the orphaned job.
    pub job_id: String,
    /// Whether the job was hard-deleted after being reported.
    pub purged: bool,
}

impl Display for OrphanResourceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "job {} in suite {} is not referenced by any checkpoint",
            self.job_id, self.suite_id
        )?;
        if self.purged {
            write!(f, " (purged)")?;
        }
        Ok(())
    }
}
