use ar_types::{validation_error, ArResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

use crate::experiment::Experiment;

/// An experiment shared between tasks. Trial creation takes the write lock,
/// so concurrent callers always get distinct indices.
pub type SharedExperiment = Arc<RwLock<Experiment>>;

/// In-process registry of independent experiments, keyed by name.
#[derive(Debug, Default)]
pub struct ExperimentRegistry {
    experiments: DashMap<String, SharedExperiment>,
}

impl ExperimentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, experiment: Experiment) -> ArResult<SharedExperiment> {
        let name = experiment.name().to_string();
        match self.experiments.entry(name) {
            Entry::Occupied(e) => Err(validation_error!(
                "An experiment named {} is already registered",
                e.key()
            )),
            Entry::Vacant(e) => {
                info!("Registered experiment {}", e.key());
                let shared = Arc::new(RwLock::new(experiment));
                e.insert(shared.clone());
                Ok(shared)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<SharedExperiment> {
        self.experiments.get(name).map(|e| e.value().clone())
    }

    pub fn remove(&self, name: &str) -> Option<SharedExperiment> {
        self.experiments.remove(name).map(|(_, e)| e)
    }

    /// A point-in-time copy of an experiment, taken under its read lock.
    pub fn snapshot(&self, name: &str) -> Option<Experiment> {
        self.get(name).map(|e| e.read().clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.experiments.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.experiments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experiments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ar_types::{Arm, Parameter, SearchSpace};
    use std::collections::BTreeSet;

    fn space() -> SearchSpace {
        SearchSpace::new()
            .with_parameter(Parameter::float("x", 0.0, 100.0).unwrap())
            .unwrap()
    }

    #[test]
    fn register_and_lookup() {
        let registry = ExperimentRegistry::new();
        registry.register(Experiment::new("b", space())).unwrap();
        registry.register(Experiment::new("a", space())).unwrap();
        assert!(registry.register(Experiment::new("a", space())).is_err());

        assert_eq!(registry.names(), vec!["a", "b"]);
        assert!(registry.get("a").is_some());
        assert!(registry.remove("a").is_some());
        assert_eq!(registry.len(), 1);
        assert!(registry.snapshot("a").is_none());
    }

    #[test]
    fn concurrent_trial_creation_assigns_unique_indices() {
        let registry = ExperimentRegistry::new();
        let shared = registry.register(Experiment::new("parallel", space())).unwrap();

        let indices: Vec<usize> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|t| {
                    let shared = shared.clone();
                    scope.spawn(move || {
                        (0..10)
                            .map(|i| {
                                let arm = Arm::from_pairs([("x", (t * 10 + i) as f64)]);
                                shared.write().new_trial(arm).unwrap().index()
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });

        let unique: BTreeSet<usize> = indices.iter().copied().collect();
        assert_eq!(unique.len(), 80);
        assert_eq!(unique.into_iter().collect::<Vec<_>>(), (0..80).collect::<Vec<_>>());
        assert_eq!(registry.snapshot("parallel").unwrap().num_trials(), 80);
    }
}
