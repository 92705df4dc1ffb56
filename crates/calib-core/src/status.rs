//! Ordered status points of the per-iteration state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{CalibError, ErrorInfo};

/// Transition reached by an iteration, totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusPoint {
    /// Wall-clock start recorded.
    IterationStart = 0,
    /// Samples generated and the batch submitted.
    Commission = 1,
    /// Every simulation of the batch reached a terminal state.
    Running = 2,
    /// Results ingested by the next-point algorithm.
    Analyze = 3,
    /// Plotters invoked.
    Plot = 4,
    /// Secondary algorithm bookkeeping done.
    NextPoint = 5,
    /// Iteration complete.
    Done = 6,
}

impl StatusPoint {
    /// All status points in transition order.
    pub const ALL: [StatusPoint; 7] = [
        StatusPoint::IterationStart,
        StatusPoint::Commission,
        StatusPoint::Running,
        StatusPoint::Analyze,
        StatusPoint::Plot,
        StatusPoint::NextPoint,
        StatusPoint::Done,
    ];

    /// Position in the transition order.
    pub fn ordinal(self) -> usize {
        self as usize
    }

    /// Status reached just before this one, `None` for `IterationStart`.
    pub fn previous(self) -> Option<StatusPoint> {
        self.ordinal()
            .checked_sub(1)
            .map(|index| StatusPoint::ALL[index])
    }

    /// Status following this one, `None` for `Done`.
    pub fn next(self) -> Option<StatusPoint> {
        StatusPoint::ALL.get(self.ordinal() + 1).copied()
    }

    /// First status not yet reached given the last completed one.
    pub fn pending_after(last: Option<StatusPoint>) -> Option<StatusPoint> {
        match last {
            None => Some(StatusPoint::IterationStart),
            Some(status) => status.next(),
        }
    }

    /// Snake-case name used in checkpoints and on the command line.
    pub fn as_str(self) -> &'static str {
        match self {
            StatusPoint::IterationStart => "iteration_start",
            StatusPoint::Commission => "commission",
            StatusPoint::Running => "running",
            StatusPoint::Analyze => "analyze",
            StatusPoint::Plot => "plot",
            StatusPoint::NextPoint => "next_point",
            StatusPoint::Done => "done",
        }
    }
}

impl fmt::Display for StatusPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatusPoint {
    type Err = CalibError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        StatusPoint::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| {
                CalibError::Configuration(
                    ErrorInfo::new("unknown-status", format!("unknown status point '{value}'"))
                        .with_hint(
                            "expected one of iteration_start, commission, running, analyze, plot, next_point, done",
                        ),
                )
            })
    }
}
