//! Newton iteration on R(u, θ) = 0 with optional backtracking line search.
//!
//! The loop is an explicit state machine ([`NewtonPhase`]) whose counters and
//! history live in a [`NewtonContext`] value; nothing is global, so
//! independent solves can run on separate threads.

use crate::assembly::{assemble_into, residual, SystemCache};
use crate::bc::{apply_bcs, apply_bcs_residual, constraint_scaled_norm};
use crate::linear::{axpy, make_solver};
use crate::params::BoundParams;
use crate::problem::Problem;
use crate::types::{FemError, IterationRecord, LineSearch, SolutionState, SolverOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewtonPhase {
    Init,
    Assemble,
    LinearSolve,
    Update,
    CheckConvergence,
    Done,
    Diverged,
}

#[derive(Debug, Clone)]
pub struct NewtonContext {
    pub phase: NewtonPhase,
    /// Newton updates applied so far.
    pub iteration: usize,
    pub initial_norm: f64,
    pub residual_norm: f64,
    pub history: Vec<IterationRecord>,
}

impl NewtonContext {
    fn new() -> Self {
        Self {
            phase: NewtonPhase::Init,
            iteration: 0,
            initial_norm: 0.0,
            residual_norm: 0.0,
            history: Vec::new(),
        }
    }

    fn transition(&mut self, next: NewtonPhase) {
        tracing::trace!(iteration = self.iteration, from = ?self.phase, to = ?next, "newton phase");
        self.phase = next;
    }

    pub fn relative(&self) -> f64 {
        if self.initial_norm > 0.0 {
            self.residual_norm / self.initial_norm
        } else {
            0.0
        }
    }

    fn record(&mut self, step: f64) {
        self.history.push(IterationRecord {
            iteration: self.iteration,
            residual_norm: self.residual_norm,
            relative: self.relative(),
            step,
        });
    }
}

/// Converged state plus the boundary-condition-applied system at u*.
#[derive(Debug, Clone)]
pub struct ConvergedSystem {
    pub state: SolutionState,
    pub system: SystemCache,
}

pub struct NewtonSolver<'a> {
    problem: &'a Problem,
    options: &'a SolverOptions,
}

impl<'a> NewtonSolver<'a> {
    pub fn new(problem: &'a Problem, options: &'a SolverOptions) -> Self {
        Self { problem, options }
    }

    pub fn solve(&self, bound: &BoundParams, initial_guess: Option<&[f64]>) -> Result<ConvergedSystem, FemError> {
        let problem = self.problem;
        let opts = self.options;
        let _span = tracing::debug_span!(
            "newton_solve",
            physics = problem.physics().name(),
            dofs = problem.num_dofs()
        )
        .entered();

        let mut ctx = NewtonContext::new();
        let mut u = self.init(initial_guess)?;
        let mut system = SystemCache::new(problem);
        let mut solver = make_solver(opts.linear_solver, problem.physics().structure());

        loop {
            ctx.transition(NewtonPhase::Assemble);
            assemble_into(problem, &mut system, &u, bound, true)?;
            system.penalty = apply_bcs(
                &mut system.residual,
                &mut system.jacobian,
                problem.pattern(),
                &u,
                problem.compiled_bcs(),
                opts.dirichlet,
            );

            ctx.transition(NewtonPhase::CheckConvergence);
            ctx.residual_norm =
                constraint_scaled_norm(&system.residual, problem.compiled_bcs(), opts.dirichlet, system.penalty);
            if ctx.iteration == 0 {
                ctx.initial_norm = ctx.residual_norm;
            }
            if !ctx.residual_norm.is_finite() {
                return Err(self.diverge(&mut ctx));
            }
            if ctx.residual_norm < opts.absolute_tolerance || ctx.relative() < opts.relative_tolerance {
                ctx.record(0.0);
                ctx.transition(NewtonPhase::Done);
                tracing::info!(
                    iterations = ctx.iteration,
                    residual = ctx.residual_norm,
                    relative = ctx.relative(),
                    "Newton converged"
                );
                let state = SolutionState {
                    values: u,
                    iterations: ctx.iteration,
                    residual_norm: ctx.residual_norm,
                    history: ctx.history,
                };
                return Ok(ConvergedSystem { state, system });
            }
            if ctx.iteration >= opts.max_iterations {
                return Err(self.diverge(&mut ctx));
            }

            ctx.transition(NewtonPhase::LinearSolve);
            solver.factor(system.jacobian.view())?;
            let rhs: Vec<f64> = system.residual.iter().map(|r| -r).collect();
            let delta = solver.solve(&rhs)?;

            ctx.transition(NewtonPhase::Update);
            let step = self.step_length(&u, &delta, ctx.residual_norm, bound, system.penalty)?;
            axpy(step, &delta, &mut u);
            ctx.record(step);
            tracing::debug!(
                iteration = ctx.iteration,
                residual = ctx.residual_norm,
                relative = ctx.relative(),
                step,
                solver = solver.name(),
                "newton step"
            );
            ctx.iteration += 1;
        }
    }

    /// Zero or caller state, with Dirichlet values written in.
    fn init(&self, initial_guess: Option<&[f64]>) -> Result<Vec<f64>, FemError> {
        let n = self.problem.num_dofs();
        let mut u = match initial_guess {
            Some(g) if g.len() != n => return Err(FemError::mismatch("initial guess", n, g.len())),
            Some(g) => g.to_vec(),
            None => vec![0.0; n],
        };
        self.problem.compiled_bcs().impose_values(&mut u);
        Ok(u)
    }

    fn diverge(&self, ctx: &mut NewtonContext) -> FemError {
        ctx.record(0.0);
        ctx.transition(NewtonPhase::Diverged);
        tracing::warn!(
            iterations = ctx.iteration,
            residual = ctx.residual_norm,
            relative = ctx.relative(),
            "Newton diverged"
        );
        FemError::Convergence {
            iterations: ctx.iteration,
            residual_norm: ctx.residual_norm,
            relative: ctx.relative(),
        }
    }

    fn trial_norm(&self, u: &[f64], delta: &[f64], alpha: f64, bound: &BoundParams, penalty: f64) -> Result<f64, FemError> {
        let mut trial = u.to_vec();
        axpy(alpha, delta, &mut trial);
        let mut r = residual(self.problem, &trial, bound)?;
        let bcs = self.problem.compiled_bcs();
        apply_bcs_residual(&mut r, &trial, bcs, self.options.dirichlet, penalty);
        Ok(constraint_scaled_norm(&r, bcs, self.options.dirichlet, penalty))
    }

    fn step_length(&self, u: &[f64], delta: &[f64], current: f64, bound: &BoundParams, penalty: f64) -> Result<f64, FemError> {
        match self.options.line_search {
            LineSearch::Fixed { damping } => Ok(damping),
            LineSearch::Backtracking { armijo, shrink, min_step } => {
                let mut alpha = 1.0;
                loop {
                    let trial = self.trial_norm(u, delta, alpha, bound, penalty)?;
                    if trial.is_finite() && trial <= (1.0 - armijo * alpha) * current {
                        return Ok(alpha);
                    }
                    let next = alpha * shrink;
                    if next < min_step {
                        tracing::warn!(step = alpha, trial, current, "line search exhausted; taking smallest step");
                        return Ok(alpha);
                    }
                    alpha = next;
                }
            }
        }
    }
}
