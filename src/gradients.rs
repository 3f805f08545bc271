//! Implicit differentiation through the converged solve R(u*, θ) = 0.
//!
//! The adjoint method computes d f / d θ via:
//!   1. Forward Newton solve for u*, then factor J = ∂R/∂u at u* once
//!   2. Accumulate explicit ∂f/∂u from the objective
//!   3. Adjoint solve  Jᵀ λ = −∂f/∂u  (constrained rows zeroed)
//!   4. Implicit gradient  λᵀ ∂R/∂θ  plus explicit ∂f/∂θ
//!
//! The tangent (`jvp`) and Hessian-vector product reuse the same
//! factorisation.  Second derivatives of R come from hyper-dual numbers in
//! `assembly.rs`; objectives supply their own.

use crate::assembly::{residual_param_jvp, residual_param_vjp, residual_second_order};
use crate::bc::zero_constrained;
use crate::linear::{make_solver, LinearSolver};
use crate::newton::NewtonSolver;
use crate::objectives::{Objective, ObjectiveContext};
use crate::params::{BoundParams, ParamSet};
use crate::problem::Problem;
use crate::types::{FemError, ParameterGradient, SolutionState, SolverOptions};
use std::fmt;
use std::time::Instant;

/// Converged state at θ with the factored, boundary-condition-applied
/// Jacobian.  Every backward or tangent solve against it reuses the factor.
pub struct ForwardSolution {
    pub state: SolutionState,
    pub bound: BoundParams,
    solver: Box<dyn LinearSolver>,
}

impl fmt::Debug for ForwardSolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardSolution")
            .field("state", &self.state)
            .field("bound", &self.bound)
            .field("solver", &self.solver.name())
            .finish()
    }
}

impl ForwardSolution {
    pub fn theta(&self) -> &[f64] {
        &self.bound.theta
    }
}

/// The solve u*(θ) as a differentiable operator.
#[derive(Clone, Copy)]
pub struct ImplicitSolve<'a> {
    problem: &'a Problem,
    options: &'a SolverOptions,
}

impl<'a> ImplicitSolve<'a> {
    pub fn new(problem: &'a Problem, options: &'a SolverOptions) -> Self {
        Self { problem, options }
    }

    pub fn forward(&self, bound: &BoundParams, initial_guess: Option<&[f64]>) -> Result<ForwardSolution, FemError> {
        let converged = NewtonSolver::new(self.problem, self.options).solve(bound, initial_guess)?;
        let mut solver = make_solver(self.options.linear_solver, self.problem.physics().structure());
        solver.factor(converged.system.jacobian.view())?;
        Ok(ForwardSolution { state: converged.state, bound: bound.clone(), solver })
    }

    /// θ̄ = λᵀ ∂R/∂θ with Jᵀ λ = −ū.
    pub fn vjp(&self, fwd: &ForwardSolution, u_bar: &[f64]) -> Result<Vec<f64>, FemError> {
        let lambda = self.adjoint(fwd, u_bar)?;
        residual_param_vjp(self.problem, &fwd.state.values, &fwd.bound, &lambda)
    }

    /// û = du*/dθ · θ̂, from J û = −∂R/∂θ θ̂.
    pub fn jvp(&self, fwd: &ForwardSolution, theta_dot: &[f64]) -> Result<Vec<f64>, FemError> {
        let mut rhs = residual_param_jvp(self.problem, &fwd.state.values, &fwd.bound, theta_dot)?;
        rhs.iter_mut().for_each(|v| *v = -*v);
        zero_constrained(&mut rhs, self.problem.compiled_bcs(), self.options.dirichlet);
        fwd.solver.solve(&rhs)
    }

    /// λ with Jᵀ λ = −ū.
    fn adjoint(&self, fwd: &ForwardSolution, u_bar: &[f64]) -> Result<Vec<f64>, FemError> {
        let n = self.problem.num_dofs();
        if u_bar.len() != n {
            return Err(FemError::mismatch("state cotangent", n, u_bar.len()));
        }
        let mut rhs: Vec<f64> = u_bar.iter().map(|v| -v).collect();
        zero_constrained(&mut rhs, self.problem.compiled_bcs(), self.options.dirichlet);
        fwd.solver.solve_transpose(&rhs)
    }

    fn context<'b>(&'b self, fwd: &'b ForwardSolution) -> ObjectiveContext<'b> {
        ObjectiveContext { problem: self.problem, bound: &fwd.bound, state: &fwd.state.values }
    }

    /// Objective value and d f / d θ at an existing forward solution.
    pub fn gradient_at(&self, fwd: &ForwardSolution, objective: &dyn Objective) -> Result<(f64, Vec<f64>), FemError> {
        let _span = tracing::debug_span!("adjoint", params = fwd.bound.len()).entered();
        let start = Instant::now();
        let ctx = self.context(fwd);
        let value = objective.value(&ctx);

        let mut f_u = vec![0.0; self.problem.num_dofs()];
        objective.grad_state(&ctx, &mut f_u);
        let mut grad = self.vjp(fwd, &f_u)?;
        objective.grad_params(&ctx, &mut grad);

        tracing::debug!(value, elapsed_ms = start.elapsed().as_secs_f64() * 1e3, "adjoint gradient");
        Ok((value, grad))
    }

    /// H θ̂ for the reduced objective θ ↦ f(u*(θ), θ).
    pub fn hvp_at(
        &self,
        fwd: &ForwardSolution,
        objective: &dyn Objective,
        direction: &[f64],
    ) -> Result<HessianVectorProduct, FemError> {
        let _span = tracing::debug_span!("adjoint", params = fwd.bound.len()).entered();
        let start = Instant::now();
        let problem = self.problem;
        if direction.len() != fwd.bound.len() {
            return Err(FemError::mismatch("Hessian direction", fwd.bound.len(), direction.len()));
        }
        if !objective.has_second_order() {
            return Err(FemError::MissingSecondOrder(format!("{objective:?}")));
        }
        let ctx = self.context(fwd);
        let u = &fwd.state.values;
        let value = objective.value(&ctx);

        let mut f_u = vec![0.0; problem.num_dofs()];
        objective.grad_state(&ctx, &mut f_u);
        let lambda = self.adjoint(fwd, &f_u)?;
        let mut gradient = residual_param_vjp(problem, u, &fwd.bound, &lambda)?;
        objective.grad_params(&ctx, &mut gradient);

        // Incremental forward.
        let u_dot = self.jvp(fwd, direction)?;

        // Incremental adjoint.
        let second = residual_second_order(problem, u, &fwd.bound, &lambda, &u_dot, direction)?;
        let mut rhs = second.state;
        objective.hvp_state(&ctx, &u_dot, direction, &mut rhs);
        let lambda_dot = self.adjoint(fwd, &rhs)?;

        let mut hvp = residual_param_vjp(problem, u, &fwd.bound, &lambda_dot)?;
        for (h, s) in hvp.iter_mut().zip(&second.params) {
            *h += s;
        }
        objective.hvp_params(&ctx, &u_dot, direction, &mut hvp);

        tracing::debug!(elapsed_ms = start.elapsed().as_secs_f64() * 1e3, "hessian-vector product");
        Ok(HessianVectorProduct { value, gradient, hvp, state: fwd.state.clone() })
    }
}

/// Objective value, gradient and H θ̂ at one parameter point.
#[derive(Debug, Clone)]
pub struct HessianVectorProduct {
    pub value: f64,
    pub gradient: Vec<f64>,
    pub hvp: Vec<f64>,
    pub state: SolutionState,
}

fn prepare(problem: &Problem, params: &ParamSet, objective: &dyn Objective) -> Result<BoundParams, FemError> {
    let bound = problem.bind(params)?;
    objective.validate(problem, bound.len())?;
    Ok(bound)
}

/// Forward solve, then one adjoint solve.
pub fn value_and_gradient(
    problem: &Problem,
    params: &ParamSet,
    objective: &dyn Objective,
    options: &SolverOptions,
) -> Result<ParameterGradient, FemError> {
    let bound = prepare(problem, params, objective)?;
    let op = ImplicitSolve::new(problem, options);
    let fwd = op.forward(&bound, None)?;
    let (value, gradient) = op.gradient_at(&fwd, objective)?;
    Ok(ParameterGradient { value, gradient, state: fwd.state })
}

/// Forward solve, adjoint, incremental forward and incremental adjoint.
pub fn hessian_vector_product(
    problem: &Problem,
    params: &ParamSet,
    objective: &dyn Objective,
    direction: &[f64],
    options: &SolverOptions,
) -> Result<HessianVectorProduct, FemError> {
    let bound = prepare(problem, params, objective)?;
    let op = ImplicitSolve::new(problem, options);
    let fwd = op.forward(&bound, None)?;
    op.hvp_at(&fwd, objective, direction)
}
