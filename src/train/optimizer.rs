use std::fmt;
use std::io;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::balance::{self, CpuTimer, TrainingCost};
use super::cancel::{CancellationToken, TrainingHandle};
use super::objective::DifferentiableFunction;
use crate::concat_vector::ConcatVector;
use crate::error::{Error, Result};

mod adagrad;

pub use self::adagrad::{AdaGradParams, AdaGradState, BacktrackingAdaGrad};

/// Weight update strategy driven by [`BatchOptimizer`].
pub trait UpdateRule {
    type Params: Default + Clone + fmt::Debug + Send + Sync;
    /// Scratch kept across the rounds of a single `optimize` call
    type State: Send;

    fn new_state(params: &Self::Params, weights: &ConcatVector) -> Self::State;

    /// Apply one step to `weights` given the regularized full-batch
    /// `gradient` and `objective`. Returns `true` once converged.
    fn update_weights(
        params: &Self::Params,
        weights: &mut ConcatVector,
        gradient: &ConcatVector,
        objective: f64,
        state: &mut Self::State,
        quiet: bool,
    ) -> bool;
}

/// Pins one component of the weight vector.
///
/// The component is overwritten in the weights after every update and
/// zeroed in the gradient before it.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    Sparse {
        component: usize,
        index: usize,
        value: f64,
    },
    Dense {
        component: usize,
        values: Vec<f64>,
    },
}

impl Constraint {
    pub fn apply_to_weights(&self, weights: &mut ConcatVector) {
        match self {
            Constraint::Sparse {
                component,
                index,
                value,
            } => weights.set_sparse_component(*component, *index, *value),
            Constraint::Dense { component, values } => {
                weights.set_dense_component(*component, values.clone())
            }
        }
    }

    pub fn apply_to_derivative(&self, gradient: &mut ConcatVector) {
        match self {
            Constraint::Sparse {
                component, index, ..
            } => gradient.set_sparse_component(*component, *index, 0.0),
            Constraint::Dense { component, values } => {
                gradient.set_dense_component(*component, vec![0.0; values.len()])
            }
        }
    }
}

/// Optimizer parameters shared by every update rule.
#[derive(Debug, Clone)]
pub struct OptimizerParams {
    num_threads: usize,
    max_rounds: Option<usize>,
    rebalance_fraction_cap: f64,
}

impl Default for OptimizerParams {
    fn default() -> Self {
        Self {
            num_threads: num_cpus::get().max(1),
            max_rounds: None,
            rebalance_fraction_cap: 0.5,
        }
    }
}

impl OptimizerParams {
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn set_num_threads(&mut self, num_threads: usize) -> Result<()> {
        if num_threads == 0 {
            return Err(Error::invalid_input("num_threads must be at least 1"));
        }
        self.num_threads = num_threads;
        Ok(())
    }

    pub fn max_rounds(&self) -> Option<usize> {
        self.max_rounds
    }

    /// Stop after this many rounds even if not converged; `None` for no limit
    pub fn set_max_rounds(&mut self, max_rounds: Option<usize>) -> Result<()> {
        if max_rounds == Some(0) {
            return Err(Error::invalid_input("max_rounds must be at least 1"));
        }
        self.max_rounds = max_rounds;
        Ok(())
    }

    pub fn rebalance_fraction_cap(&self) -> f64 {
        self.rebalance_fraction_cap
    }

    pub fn set_rebalance_fraction_cap(&mut self, cap: f64) -> Result<()> {
        if !(cap > 0.0 && cap <= 1.0) {
            return Err(Error::invalid_input(
                "rebalance_fraction_cap must be in (0, 1]",
            ));
        }
        self.rebalance_fraction_cap = cap;
        Ok(())
    }
}

/// One worker's share of a round
struct ShardSummary {
    objective: f64,
    gradient: ConcatVector,
    cpu_time: Duration,
    cancelled: bool,
}

/// Full-batch objective and gradient of one round
struct BatchSummary {
    objective: f64,
    gradient: ConcatVector,
    cpu_times: Vec<Duration>,
    cancelled: bool,
}

/// Full-batch gradient ascent with a pluggable [`UpdateRule`].
///
/// Each round splits the dataset across worker threads, sums their
/// objectives and gradients, regularizes, and lets the update rule move the
/// weights. Shards are rebalanced between rounds using measured CPU time.
#[derive(Debug)]
pub struct BatchOptimizer<A: UpdateRule> {
    params: OptimizerParams,
    rule_params: A::Params,
    constraints: Vec<Constraint>,
    token: CancellationToken,
}

impl<A: UpdateRule> Clone for BatchOptimizer<A> {
    fn clone(&self) -> Self {
        Self {
            params: self.params.clone(),
            rule_params: self.rule_params.clone(),
            constraints: self.constraints.clone(),
            token: self.token.clone(),
        }
    }
}

impl<A: UpdateRule> Default for BatchOptimizer<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: UpdateRule> BatchOptimizer<A> {
    pub fn new() -> Self {
        Self {
            params: OptimizerParams::default(),
            rule_params: A::Params::default(),
            constraints: Vec::new(),
            token: CancellationToken::new(),
        }
    }

    pub fn params(&self) -> &OptimizerParams {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut OptimizerParams {
        &mut self.params
    }

    /// Parameters of the update rule
    pub fn rule_params(&self) -> &A::Params {
        &self.rule_params
    }

    pub fn rule_params_mut(&mut self) -> &mut A::Params {
        &mut self.rule_params
    }

    /// Set the number of worker threads (builder pattern)
    pub fn with_num_threads(mut self, num_threads: usize) -> Result<Self> {
        self.params.set_num_threads(num_threads)?;
        Ok(self)
    }

    /// Set the round limit (builder pattern)
    pub fn with_max_rounds(mut self, max_rounds: usize) -> Result<Self> {
        self.params.set_max_rounds(Some(max_rounds))?;
        Ok(self)
    }

    /// Pin `component` of the weights to a sparse `(index, value)`
    pub fn add_sparse_constraint(&mut self, component: usize, index: usize, value: f64) {
        self.constraints.push(Constraint::Sparse {
            component,
            index,
            value,
        });
    }

    /// Pin `component` of the weights to dense `values`
    pub fn add_dense_constraint(&mut self, component: usize, values: Vec<f64>) {
        self.constraints
            .push(Constraint::Dense { component, values });
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// Token that stops [`optimize`](Self::optimize) from another thread
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Maximize the sum of `function` over `dataset`, starting from `initial_weights`.
    ///
    /// Stops when the squared gradient norm drops below
    /// `convergence_threshold`, when the update rule reports convergence,
    /// after `max_rounds`, or on cancellation. A cancelled round is
    /// discarded, so the returned weights are always fully applied.
    pub fn optimize<T, F>(
        &self,
        dataset: &mut [T],
        function: &F,
        initial_weights: ConcatVector,
        l2_regularization: f64,
        convergence_threshold: f64,
        quiet: bool,
    ) -> Result<ConcatVector>
    where
        T: TrainingCost + Send,
        F: DifferentiableFunction<T>,
    {
        let mut weights = initial_weights;
        for constraint in &self.constraints {
            constraint.apply_to_weights(&mut weights);
        }
        let mut state = A::new_state(&self.rule_params, &weights);
        let mut shards = balance::initial_shards(dataset, self.params.num_threads);
        if !quiet {
            info!(
                instances = dataset.len(),
                threads = shards.len(),
                "starting optimization"
            );
        }

        let started = Instant::now();
        let mut round = 0;
        loop {
            if self.token.is_cancelled() {
                debug!(round, "optimization cancelled");
                break;
            }
            if self.params.max_rounds.map_or(false, |max| round >= max) {
                if !quiet {
                    info!(round, "reached the round limit");
                }
                break;
            }

            let batch = self.compute_batch(dataset, &shards, function, &weights)?;
            if batch.cancelled {
                debug!(round, "optimization cancelled mid-round, keeping previous weights");
                break;
            }
            let mut objective = batch.objective;
            let mut gradient = batch.gradient;

            if l2_regularization != 0.0 {
                objective -= l2_regularization * weights.dot_product(&weights);
                gradient.add_vector_in_place(&weights, -2.0 * l2_regularization);
            }
            for constraint in &self.constraints {
                constraint.apply_to_derivative(&mut gradient);
            }

            let gradient_norm = gradient.dot_product(&gradient);
            if !quiet {
                info!(
                    round,
                    objective,
                    gradient_norm,
                    elapsed = ?started.elapsed(),
                    "finished round"
                );
            }
            if gradient_norm < convergence_threshold {
                if !quiet {
                    info!(round, gradient_norm, "gradient below convergence threshold");
                }
                break;
            }

            let converged = A::update_weights(
                &self.rule_params,
                &mut weights,
                &gradient,
                objective,
                &mut state,
                quiet,
            );
            for constraint in &self.constraints {
                constraint.apply_to_weights(&mut weights);
            }
            if converged {
                if !quiet {
                    info!(round, "update rule converged");
                }
                break;
            }

            if let Some(migration) = balance::rebalance(
                &mut shards,
                &batch.cpu_times,
                self.params.rebalance_fraction_cap,
            ) {
                debug!(
                    from = migration.from,
                    to = migration.to,
                    count = migration.count,
                    "rebalanced shards"
                );
            }
            round += 1;
        }
        Ok(weights)
    }

    /// Run [`optimize`](Self::optimize) on a background orchestrator thread.
    ///
    /// The returned handle's [`cancel`](TrainingHandle::cancel) trips the
    /// same token as [`cancellation_token`](Self::cancellation_token).
    pub fn optimize_in_background<T, F>(
        &self,
        mut dataset: Vec<T>,
        function: F,
        initial_weights: ConcatVector,
        l2_regularization: f64,
        convergence_threshold: f64,
        quiet: bool,
    ) -> Result<TrainingHandle<ConcatVector>>
    where
        A: 'static,
        A::Params: 'static,
        T: TrainingCost + Send + 'static,
        F: DifferentiableFunction<T> + Send + 'static,
    {
        let optimizer = self.clone();
        TrainingHandle::spawn(self.token.clone(), move || {
            optimizer.optimize(
                &mut dataset,
                &function,
                initial_weights,
                l2_regularization,
                convergence_threshold,
                quiet,
            )
        })
    }

    fn compute_batch<T, F>(
        &self,
        dataset: &mut [T],
        shards: &[Vec<usize>],
        function: &F,
        weights: &ConcatVector,
    ) -> Result<BatchSummary>
    where
        T: Send,
        F: DifferentiableFunction<T>,
    {
        let mut slots: Vec<Option<&mut T>> = dataset.iter_mut().map(Some).collect();
        let work: Vec<Vec<&mut T>> = shards
            .iter()
            .map(|shard| shard.iter().filter_map(|&i| slots[i].take()).collect())
            .collect();
        let token = &self.token;

        let outcomes = thread::scope(|scope| -> Result<Vec<_>> {
            let handles = work
                .into_iter()
                .enumerate()
                .map(|(i, items)| {
                    thread::Builder::new()
                        .name(format!("loglinear-worker-{}", i))
                        .spawn_scoped(scope, move || run_shard(items, function, weights, token))
                })
                .collect::<io::Result<Vec<_>>>()?;
            // Join every worker before looking at any outcome
            Ok(handles.into_iter().map(|handle| handle.join()).collect())
        })?;

        let mut batch = BatchSummary {
            objective: 0.0,
            gradient: weights.new_empty_clone(),
            cpu_times: Vec::with_capacity(outcomes.len()),
            cancelled: false,
        };
        for outcome in outcomes {
            let shard = outcome.map_err(|_| Error::WorkerPanicked)??;
            batch.objective += shard.objective;
            batch.gradient.add_vector_in_place(&shard.gradient, 1.0);
            batch.cpu_times.push(shard.cpu_time);
            batch.cancelled |= shard.cancelled;
        }
        Ok(batch)
    }
}

fn run_shard<T, F>(
    items: Vec<&mut T>,
    function: &F,
    weights: &ConcatVector,
    token: &CancellationToken,
) -> Result<ShardSummary>
where
    F: DifferentiableFunction<T>,
{
    let timer = CpuTimer::start();
    let mut gradient = weights.new_empty_clone();
    let mut objective = 0.0;
    let mut cancelled = false;
    for datum in items {
        if token.is_cancelled() {
            cancelled = true;
            break;
        }
        objective += function.get_summary_for_instance(datum, weights, &mut gradient)?;
    }
    Ok(ShardSummary {
        objective,
        gradient,
        cpu_time: timer.elapsed(),
        cancelled,
    })
}
