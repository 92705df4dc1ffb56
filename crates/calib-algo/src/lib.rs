#![deny(missing_docs)]
#![doc = "Next-point algorithms for iterative model calibration: the shared contract, priors, IMIS and OptimTool."]

pub mod config;
pub mod contract;
pub mod dispatch;
pub mod imis;
pub mod linalg;
pub mod optim_tool;
pub mod prior;

pub use config::{AlgorithmConfig, ImisConfig, OptimToolConfig};
pub use contract::{NextPointAlgorithm, NextPointState};
pub use dispatch::NextPoint;
pub use imis::{stopping_statistic, stopping_threshold, Imis, ImisState};
pub use optim_tool::{OptimTool, OptimToolState};
pub use prior::{Distribution, ParamSpec, Prior};
