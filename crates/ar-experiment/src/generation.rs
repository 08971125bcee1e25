//! Candidate generation: generators that propose arms and the step-based
//! strategy that decides which generator runs next.

use ar_types::{
    ArResult, Arm, GenerationError, Parameter, ParameterDomain, ParameterType, ParameterValue,
    Parameterization, SearchSpace,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use std::collections::HashSet;
use tracing::{debug, info};

use crate::experiment::Experiment;
use crate::trial::TrialStatus;

/// Default number of draws before a generator gives up on finding a new
/// feasible point.
pub const DEFAULT_MAX_DRAWS: usize = 10_000;

/// Common trait for all arm generators.
pub trait Generator: Send + Sync {
    /// Propose up to `n` new arms for `experiment`. Proposed arms are cast
    /// and satisfy the search space.
    fn generate(&mut self, experiment: &Experiment, n: usize) -> ArResult<Vec<Arm>>;

    /// Human-readable generator name.
    fn name(&self) -> &str;
}

fn seeded_rng(seed: Option<u64>) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed.unwrap_or_else(rand::random))
}

/// Draw a raw value for one parameter. Integer ranges are drawn as reals
/// and rounded by the search space's cast.
fn sample_parameter(parameter: &Parameter, rng: &mut impl Rng) -> ParameterValue {
    match parameter.domain() {
        ParameterDomain::Range {
            lower,
            upper,
            log_scale,
            ..
        } => {
            let v = if *log_scale {
                rng.random_range(lower.ln()..=upper.ln()).exp()
            } else {
                rng.random_range(*lower..=*upper)
            };
            ParameterValue::Float(v)
        }
        ParameterDomain::Choice { values, .. } => values[rng.random_range(0..values.len())].clone(),
        ParameterDomain::Fixed { value } => value.clone(),
    }
}

/// Signatures of every arm the experiment already knows.
fn known_signatures(experiment: &Experiment) -> HashSet<String> {
    experiment.arms().map(Arm::signature).collect()
}

// ---- Random ----

/// Independent uniform sampling with rejection against constraints.
#[derive(Debug, Clone)]
pub struct RandomGenerator {
    rng: ChaCha8Rng,
    max_draws: usize,
    deduplicate: bool,
}

impl RandomGenerator {
    pub fn new(seed: Option<u64>) -> Self {
        Self {
            rng: seeded_rng(seed),
            max_draws: DEFAULT_MAX_DRAWS,
            deduplicate: true,
        }
    }

    pub fn with_max_draws(mut self, max_draws: usize) -> Self {
        self.max_draws = max_draws.max(1);
        self
    }

    /// Allow proposing parameter values the experiment has already seen.
    pub fn allow_duplicates(mut self) -> Self {
        self.deduplicate = false;
        self
    }

    fn draw(&mut self, space: &SearchSpace) -> Parameterization {
        space
            .parameters()
            .iter()
            .map(|p| (p.name().to_string(), sample_parameter(p, &mut self.rng)))
            .collect()
    }

    /// Draw until a feasible, unseen point turns up.
    fn draw_feasible(&mut self, space: &SearchSpace, seen: &HashSet<String>) -> ArResult<Arm> {
        for _ in 0..self.max_draws {
            let raw = self.draw(space);
            let Ok(parameters) = space.validate_parameterization(&raw) else {
                continue;
            };
            let arm = Arm::new(parameters);
            if self.deduplicate && seen.contains(&arm.signature()) {
                continue;
            }
            return Ok(arm);
        }
        Err(GenerationError::Exhausted {
            generator: self.name().to_string(),
            attempts: self.max_draws,
        }
        .into())
    }
}

impl Generator for RandomGenerator {
    fn generate(&mut self, experiment: &Experiment, n: usize) -> ArResult<Vec<Arm>> {
        let space = experiment.search_space();
        let mut seen = known_signatures(experiment);
        let mut arms = Vec::with_capacity(n);
        for _ in 0..n {
            let arm = self.draw_feasible(space, &seen)?;
            seen.insert(arm.signature());
            arms.push(arm);
        }
        Ok(arms)
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- Grid ----

/// Exhaustive grid over the search space. Float ranges get `resolution`
/// evenly spaced points; infeasible points are skipped.
#[derive(Debug, Clone)]
pub struct GridGenerator {
    resolution: usize,
    grid: Option<(SearchSpace, Vec<Parameterization>)>,
}

impl GridGenerator {
    pub fn new(resolution: usize) -> Self {
        Self {
            resolution: resolution.max(2),
            grid: None,
        }
    }

    fn axis(&self, parameter: &Parameter) -> Vec<ParameterValue> {
        match parameter.domain() {
            ParameterDomain::Range {
                lower,
                upper,
                log_scale,
                ..
            } => {
                if parameter.parameter_type() == ParameterType::Int
                    && parameter.cardinality().is_some_and(|n| n <= self.resolution as u64)
                {
                    return (*lower as i64..=*upper as i64).map(ParameterValue::Int).collect();
                }
                let steps = self.resolution;
                let (lo, hi) = if *log_scale {
                    (lower.ln(), upper.ln())
                } else {
                    (*lower, *upper)
                };
                (0..steps)
                    .map(|i| {
                        let t = i as f64 / (steps - 1) as f64;
                        let v = lo + t * (hi - lo);
                        ParameterValue::Float(if *log_scale { v.exp() } else { v })
                    })
                    .collect()
            }
            ParameterDomain::Choice { values, .. } => values.clone(),
            ParameterDomain::Fixed { value } => vec![value.clone()],
        }
    }

    /// Cartesian product of every axis, keeping the feasible points.
    pub fn build_grid(&self, space: &SearchSpace) -> Vec<Parameterization> {
        let mut combos: Vec<Parameterization> = vec![Parameterization::new()];
        for parameter in space.parameters() {
            let axis = self.axis(parameter);
            let mut next = Vec::with_capacity(combos.len() * axis.len());
            for existing in &combos {
                for value in &axis {
                    let mut combo = existing.clone();
                    combo.insert(parameter.name().to_string(), value.clone());
                    next.push(combo);
                }
            }
            combos = next;
        }

        let mut seen = HashSet::new();
        combos
            .into_par_iter()
            .filter_map(|p| space.validate_parameterization(&p).ok())
            .collect::<Vec<_>>()
            .into_iter()
            .filter(|p| seen.insert(Arm::new(p.clone()).signature()))
            .collect()
    }
}

impl Generator for GridGenerator {
    fn generate(&mut self, experiment: &Experiment, n: usize) -> ArResult<Vec<Arm>> {
        let space = experiment.search_space();
        let stale = !matches!(&self.grid, Some((built_for, _)) if built_for == space);
        if stale {
            let points = self.build_grid(space);
            debug!("Grid generator built {} feasible points", points.len());
            self.grid = Some((space.clone(), points));
        }

        let known = known_signatures(experiment);
        let points = self.grid.as_ref().map(|(_, p)| p.as_slice()).unwrap_or_default();
        let arms: Vec<Arm> = points
            .iter()
            .map(|p| Arm::new(p.clone()))
            .filter(|a| !known.contains(&a.signature()))
            .take(n)
            .collect();

        if arms.is_empty() && n > 0 {
            return Err(GenerationError::Exhausted {
                generator: self.name().to_string(),
                attempts: points.len(),
            }
            .into());
        }
        Ok(arms)
    }

    fn name(&self) -> &str {
        "grid"
    }
}

// ---- Perturbation ----

/// Local search around the incumbent: the best arm for a single objective,
/// a random Pareto-optimal arm for several. Falls back to random sampling
/// while nothing has been observed.
#[derive(Debug, Clone)]
pub struct PerturbationGenerator {
    rng: ChaCha8Rng,
    /// Perturbation width as a fraction of each range.
    scale: f64,
    /// Probability of drawing a fresh random point instead.
    exploration: f64,
    max_draws: usize,
    fallback: RandomGenerator,
}

impl PerturbationGenerator {
    pub fn new(seed: Option<u64>) -> Self {
        let mut rng = seeded_rng(seed);
        let fallback = RandomGenerator::new(Some(rng.random()));
        Self {
            rng,
            scale: 0.1,
            exploration: 0.2,
            max_draws: DEFAULT_MAX_DRAWS,
            fallback,
        }
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale.clamp(f64::EPSILON, 1.0);
        self
    }

    pub fn with_exploration(mut self, exploration: f64) -> Self {
        self.exploration = exploration.clamp(0.0, 1.0);
        self
    }

    fn incumbent(&mut self, experiment: &Experiment) -> Option<Arm> {
        let config = experiment.optimization_config()?;
        if config.is_multi_objective() {
            let front = experiment.pareto_frontier().ok()?;
            if front.is_empty() {
                return None;
            }
            let pick = self.rng.random_range(0..front.len());
            Some(front[pick].arm.clone())
        } else {
            experiment.best_arm().ok().flatten().map(|o| o.arm)
        }
    }

    fn perturb(&mut self, space: &SearchSpace, base: &Arm) -> Parameterization {
        let mut perturbed = Parameterization::new();
        for parameter in space.parameters() {
            let base_value = base.get(parameter.name()).and_then(ParameterValue::as_f64);
            let value = match (parameter.domain(), base_value) {
                (
                    ParameterDomain::Range {
                        lower,
                        upper,
                        log_scale,
                        ..
                    },
                    Some(v),
                ) => {
                    let noise = self.rng.random_range(-self.scale..=self.scale);
                    let v = if *log_scale {
                        let width = upper.ln() - lower.ln();
                        (v.max(*lower).ln() + noise * width).exp()
                    } else {
                        v + noise * (upper - lower)
                    };
                    ParameterValue::Float(v.clamp(*lower, *upper))
                }
                // Choices and missing values are resampled.
                _ => sample_parameter(parameter, &mut self.rng),
            };
            perturbed.insert(parameter.name().to_string(), value);
        }
        perturbed
    }
}

impl Generator for PerturbationGenerator {
    fn generate(&mut self, experiment: &Experiment, n: usize) -> ArResult<Vec<Arm>> {
        let Some(incumbent) = self.incumbent(experiment) else {
            debug!("No incumbent yet, sampling at random");
            return self.fallback.generate(experiment, n);
        };

        let space = experiment.search_space();
        let mut seen = known_signatures(experiment);
        let mut arms = Vec::with_capacity(n);

        for _ in 0..n {
            let mut found = None;
            if self.rng.random::<f64>() >= self.exploration {
                for _ in 0..self.max_draws {
                    let raw = self.perturb(space, &incumbent);
                    if let Ok(parameters) = space.validate_parameterization(&raw) {
                        let arm = Arm::new(parameters);
                        if !seen.contains(&arm.signature()) {
                            found = Some(arm);
                            break;
                        }
                    }
                }
            }
            let arm = match found {
                Some(arm) => arm,
                None => self.fallback.draw_feasible(space, &seen)?,
            };
            seen.insert(arm.signature());
            arms.push(arm);
        }
        Ok(arms)
    }

    fn name(&self) -> &str {
        "perturbation"
    }
}

// ---- Strategy ----

/// One phase of a generation strategy.
pub struct GenerationStep {
    generator: Box<dyn Generator>,
    /// Trials this step produces; `None` means unlimited.
    num_trials: Option<usize>,
    /// Completed trials required from this step before moving on.
    min_trials_observed: usize,
    max_parallelism: Option<usize>,
}

impl GenerationStep {
    pub fn new(generator: impl Generator + 'static, num_trials: Option<usize>) -> Self {
        Self {
            generator: Box::new(generator),
            num_trials,
            min_trials_observed: 0,
            max_parallelism: None,
        }
    }

    pub fn with_min_trials_observed(mut self, n: usize) -> Self {
        self.min_trials_observed = n;
        self
    }

    pub fn with_max_parallelism(mut self, n: usize) -> Self {
        self.max_parallelism = Some(n);
        self
    }

    pub fn generator_name(&self) -> &str {
        self.generator.name()
    }

    pub fn num_trials(&self) -> Option<usize> {
        self.num_trials
    }
}

impl std::fmt::Debug for GenerationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationStep")
            .field("generator", &self.generator.name())
            .field("num_trials", &self.num_trials)
            .field("min_trials_observed", &self.min_trials_observed)
            .field("max_parallelism", &self.max_parallelism)
            .finish()
    }
}

/// Ordered generation steps, e.g. a few random trials followed by
/// unlimited local search.
#[derive(Debug)]
pub struct GenerationStrategy {
    steps: Vec<GenerationStep>,
    current: usize,
    /// Trial indices produced by each step.
    step_trials: Vec<Vec<usize>>,
}

impl GenerationStrategy {
    pub fn new(steps: Vec<GenerationStep>) -> ArResult<Self> {
        if steps.is_empty() {
            return Err(GenerationError::Misconfigured {
                message: "a generation strategy needs at least one step".to_string(),
            }
            .into());
        }
        if let Some(pos) = steps[..steps.len() - 1]
            .iter()
            .position(|s| s.num_trials.is_none())
        {
            return Err(GenerationError::Misconfigured {
                message: format!("only the last step may have an unlimited trial budget, step {pos} does"),
            }
            .into());
        }
        if steps.iter().any(|s| s.num_trials == Some(0) || s.max_parallelism == Some(0)) {
            return Err(GenerationError::Misconfigured {
                message: "trial budgets and parallelism limits must be positive".to_string(),
            }
            .into());
        }

        let step_trials = vec![Vec::new(); steps.len()];
        Ok(Self {
            steps,
            current: 0,
            step_trials,
        })
    }

    /// `count` random trials, then perturbation without limit.
    pub fn random_then_perturbation(count: usize, seed: Option<u64>) -> ArResult<Self> {
        Self::new(vec![
            GenerationStep::new(RandomGenerator::new(seed), Some(count)),
            GenerationStep::new(PerturbationGenerator::new(seed.map(|s| s.wrapping_add(1))), None),
        ])
    }

    pub fn current_step_index(&self) -> usize {
        self.current
    }

    pub fn current_step_name(&self) -> String {
        step_name(self.current, &self.steps[self.current])
    }

    pub fn steps(&self) -> &[GenerationStep] {
        &self.steps
    }

    pub fn trials_per_step(&self) -> Vec<usize> {
        self.step_trials.iter().map(Vec::len).collect()
    }

    /// `true` once the last step has used its whole trial budget.
    pub fn is_completed(&self) -> bool {
        let last = self.steps.len() - 1;
        self.current == last
            && self.steps[last]
                .num_trials
                .is_some_and(|n| self.step_trials[last].len() >= n)
    }

    fn count_in(&self, step: usize, experiment: &Experiment, keep: impl Fn(TrialStatus) -> bool) -> usize {
        self.step_trials[step]
            .iter()
            .filter_map(|i| experiment.trial(*i).ok())
            .filter(|t| keep(t.status()))
            .count()
    }

    /// Move past exhausted steps and check the current step may generate.
    fn select_step(&mut self, experiment: &Experiment) -> ArResult<usize> {
        loop {
            let step = &self.steps[self.current];
            let generated = self.step_trials[self.current].len();
            let exhausted = step.num_trials.is_some_and(|n| generated >= n);
            if !exhausted {
                break;
            }

            let observed = self.count_in(self.current, experiment, |s| {
                matches!(s, TrialStatus::Completed | TrialStatus::EarlyStopped)
            });
            if observed < step.min_trials_observed {
                return Err(GenerationError::DataRequired {
                    step: self.current_step_name(),
                    required: step.min_trials_observed,
                    observed,
                }
                .into());
            }
            if self.current + 1 == self.steps.len() {
                return Err(GenerationError::Completed.into());
            }

            self.current += 1;
            info!("Generation strategy moved to step {}", self.current_step_name());
        }

        let step = &self.steps[self.current];
        if let Some(max) = step.max_parallelism {
            let running = self.count_in(self.current, experiment, TrialStatus::is_pending);
            if running >= max {
                return Err(GenerationError::MaxParallelismReached {
                    step: self.current_step_name(),
                    running,
                    max,
                }
                .into());
            }
        }
        Ok(self.current)
    }

    /// Generate one arm and add it to `experiment` as a new single-arm
    /// trial. Returns the trial index.
    pub fn generate_trial(&mut self, experiment: &mut Experiment) -> ArResult<usize> {
        let step = self.select_step(experiment)?;
        let arms = self.steps[step].generator.generate(experiment, 1)?;
        let arm = arms.into_iter().next().ok_or_else(|| GenerationError::Exhausted {
            generator: self.steps[step].generator.name().to_string(),
            attempts: 0,
        })?;

        let method = step_name(step, &self.steps[step]);
        let trial = experiment.new_trial(arm)?;
        trial.set_generation_method(method);
        let index = trial.index();
        self.step_trials[step].push(index);
        Ok(index)
    }

    /// Generate `n` arms and add them to `experiment` as one batch trial.
    pub fn generate_batch_trial(&mut self, experiment: &mut Experiment, n: usize) -> ArResult<usize> {
        let step = self.select_step(experiment)?;
        let arms = self.steps[step].generator.generate(experiment, n)?;

        let method = step_name(step, &self.steps[step]);
        let trial = experiment.new_batch_trial(arms)?;
        trial.set_generation_method(method);
        let index = trial.index();
        self.step_trials[step].push(index);
        Ok(index)
    }
}

fn step_name(index: usize, step: &GenerationStep) -> String {
    format!("{}_{}", index, step.generator.name())
}
