//! L-BFGS design optimisation via the `argmin` crate.
//!
//! Wraps the forward + adjoint evaluation into argmin's `CostFunction` +
//! `Gradient` traits and runs L-BFGS with a More–Thuente line search.
//! Box bounds on θ enter as a softplus barrier.
//!
//! θ crosses into argmin as a flat `Vec<f64>` in `ParamSet::flatten` order;
//! `ParamSet::unflatten` maps the best point back onto named parameters.

use crate::gradients::ImplicitSolve;
use crate::objectives::{bounds_penalty, bounds_penalty_grad, Objective};
use crate::params::{BoundParams, ParamSet};
use crate::problem::Problem;
use crate::types::{Bounds, FemError, SolutionState, SolverOptions, DEFAULT_BARRIER_SHARPNESS};
use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerOptions {
    pub max_iterations: usize,
    /// L-BFGS correction pairs.
    pub memory: usize,
    pub barrier_weight: f64,
    pub barrier_sharpness: f64,
    /// Options for every inner forward solve.
    pub solver: SolverOptions,
}

impl Default for OptimizerOptions {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            memory: 10,
            barrier_weight: 1.0,
            barrier_sharpness: DEFAULT_BARRIER_SHARPNESS,
            solver: SolverOptions::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DesignResult {
    /// Best parameters found, same layout as the input `ParamSet`.
    pub params: ParamSet,
    pub theta: Vec<f64>,
    /// Objective plus barrier at `theta`.
    pub loss: f64,
    pub iterations: usize,
    pub converged: bool,
    pub state: SolutionState,
}

/// Last evaluation: θ, loss, gradient and converged state.
struct Evaluation {
    theta: Vec<f64>,
    loss: f64,
    gradient: Vec<f64>,
    state: SolutionState,
}

/// Problem + objective + barrier data, evaluated by argmin.
///
/// argmin calls `cost(θ)` and `gradient(θ)` separately at the same θ; the
/// last evaluation is memoised so each unique θ costs one forward and one
/// adjoint solve.  Forward solves warm-start from the previous state.
struct DesignProblem<'a> {
    problem: &'a Problem,
    objective: &'a dyn Objective,
    bound: BoundParams,
    bounds: &'a Bounds,
    options: &'a OptimizerOptions,
    last_eval: RefCell<Option<Evaluation>>,
}

impl DesignProblem<'_> {
    fn evaluate(&self, theta: &[f64]) -> Result<Evaluation, FemError> {
        let op = ImplicitSolve::new(self.problem, &self.options.solver);
        let bound = self.bound.with_theta(theta)?;
        let guess = self.last_eval.borrow().as_ref().map(|e| e.state.values.clone());
        let fwd = op.forward(&bound, guess.as_deref())?;
        let (value, mut gradient) = op.gradient_at(&fwd, self.objective)?;

        let k = self.options.barrier_sharpness;
        let w = self.options.barrier_weight;
        let loss = value + w * bounds_penalty(theta, self.bounds, k);
        bounds_penalty_grad(&mut gradient, theta, self.bounds, k, w);

        tracing::debug!(loss, objective = value, "design evaluation");
        Ok(Evaluation { theta: theta.to_vec(), loss, gradient, state: fwd.state })
    }

    /// Make `last_eval` hold the results for `theta`.
    fn ensure_evaluated(&self, theta: &[f64]) -> Result<(), argmin::core::Error> {
        if matches!(&*self.last_eval.borrow(), Some(e) if e.theta == theta) {
            return Ok(());
        }
        let eval = self.evaluate(theta).map_err(|e| argmin::core::Error::msg(e.to_string()))?;
        *self.last_eval.borrow_mut() = Some(eval);
        Ok(())
    }

    fn cached<T>(&self, pick: impl FnOnce(&Evaluation) -> T) -> Result<T, argmin::core::Error> {
        self.last_eval
            .borrow()
            .as_ref()
            .map(pick)
            .ok_or_else(|| argmin::core::Error::msg("no cached evaluation"))
    }
}

impl CostFunction for DesignProblem<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, theta: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        self.ensure_evaluated(theta)?;
        self.cached(|e| e.loss)
    }
}

impl Gradient for DesignProblem<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, theta: &Self::Param) -> Result<Self::Gradient, argmin::core::Error> {
        self.ensure_evaluated(theta)?;
        self.cached(|e| e.gradient.clone())
    }
}

/// Minimise `objective(u*(θ), θ)` over θ starting from `params`.
pub fn optimize(
    problem: &Problem,
    params: &ParamSet,
    objective: &dyn Objective,
    bounds: &Bounds,
    options: &OptimizerOptions,
) -> Result<DesignResult, FemError> {
    let bound = problem.bind(params)?;
    let n = bound.len();
    objective.validate(problem, n)?;
    if bounds.lower.len() != n || bounds.upper.len() != n {
        return Err(FemError::mismatch("parameter bounds", n, bounds.lower.len().min(bounds.upper.len())));
    }
    let init_param = bound.theta.clone();

    let design = DesignProblem {
        problem,
        objective,
        bound,
        bounds,
        options,
        last_eval: RefCell::new(None),
    };

    let linesearch = MoreThuenteLineSearch::new();
    let solver = LBFGS::new(linesearch, options.memory);

    let result = Executor::new(design, solver)
        .configure(|config| {
            config
                .param(init_param)
                .max_iters(options.max_iterations as u64)
                .target_cost(f64::NEG_INFINITY)
        })
        .run()?;

    let state = result.state();
    let theta = state
        .get_best_param()
        .cloned()
        .ok_or_else(|| FemError::Optimizer("L-BFGS returned no best parameters".into()))?;
    let converged = matches!(state.get_termination_reason(), Some(TerminationReason::SolverConverged));
    let iterations = state.get_iter() as usize;

    let op = ImplicitSolve::new(problem, &options.solver);
    let fwd = op.forward(&problem.bind(params)?.with_theta(&theta)?, None)?;
    let (value, _) = op.gradient_at(&fwd, objective)?;
    let loss = value + options.barrier_weight * bounds_penalty(&theta, bounds, options.barrier_sharpness);

    tracing::info!(iterations, loss, converged, "design optimisation finished");
    Ok(DesignResult {
        params: params.unflatten(&theta)?,
        theta,
        loss,
        iterations,
        converged,
        state: fwd.state,
    })
}
