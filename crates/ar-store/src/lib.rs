//! Persistence for Armory experiments.
//!
//! Experiments are stored as JSON snapshots; their observations are also
//! written as a Parquet table for analysis outside the process.

pub mod columnar;
pub mod storage;

pub use storage::{ExperimentStore, DATA_FILE, EXPERIMENT_FILE};
