//! # ar-experiment
//!
//! Experiments and their trials for Armory.
//!
//! Provides the trial lifecycle state machine, the `Experiment` aggregate
//! that owns search space, optimization config and trials, generation
//! strategies that propose new arms, and a registry for running several
//! experiments in one process.

mod experiment;
mod generation;
mod registry;
mod trial;

pub use experiment::{Experiment, ExperimentId, ObservedArm, STATUS_QUO_NAME};
pub use generation::{
    GenerationStep, GenerationStrategy, Generator, GridGenerator, PerturbationGenerator,
    RandomGenerator, DEFAULT_MAX_DRAWS,
};
pub use registry::{ExperimentRegistry, SharedExperiment};
pub use trial::{Trial, TrialKind, TrialStatus, WeightedArm};
