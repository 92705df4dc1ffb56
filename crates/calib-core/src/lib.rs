#![deny(missing_docs)]
#![doc = "Core types shared by the calibration engine: errors, status points, sample tables and the seeding policy."]

pub mod errors;
pub mod hash;
pub mod provenance;
pub mod rng;
pub mod samples;
pub mod serde;
pub mod status;

pub use errors::{CalibError, ErrorInfo, OrphanResourceWarning};
pub use provenance::SchemaVersion;
pub use rng::{derive_substream_seed, simulation_seed, RngHandle};
pub use samples::{FinalSamples, ResultRow, ResultTable, SampleSet};
pub use status::StatusPoint;
