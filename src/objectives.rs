//! Scalar objectives f(u, θ) and their hand-coded derivatives.
//!
//! Every objective supplies its value and the partials ∂f/∂u, ∂f/∂θ; the
//! adjoint in `gradients.rs` turns those into the total derivative d f / d θ.
//! Second-order products are only needed for Hessian-vector products and
//! default to zero (objectives affine in (u, θ)).

use crate::assembly::{external_load, external_load_jvp, external_load_vjp};
use crate::params::BoundParams;
use crate::problem::Problem;
use crate::types::{Bounds, FemError, MeshError};
use std::fmt;

// ─────────────────────────────────────────────────────────────
//  Softplus barrier
// ─────────────────────────────────────────────────────────────

/// Numerically stable log(1 + exp(z)).
#[inline]
fn log1pexp(z: f64) -> f64 {
    if z > 0.0 {
        z + (-z).exp().ln_1p()
    } else {
        z.exp().ln_1p()
    }
}

/// Smooth one-sided barrier.
/// `k < 0` ⟹  penalise x < b.
/// `k > 0` ⟹  penalise x > b.
#[inline]
pub fn softplus(x: f64, b: f64, k: f64) -> f64 {
    log1pexp(-k * (b - x) - 1.0)
}

/// d/dx softplus = k · σ(z),  z = −k(b − x) − 1.
#[inline]
pub fn softplus_grad(x: f64, b: f64, k: f64) -> f64 {
    let z = -k * (b - x) - 1.0;
    k / (1.0 + (-z).exp())
}

/// Barrier loss for the finite entries of `bounds`.
pub fn bounds_penalty(theta: &[f64], bounds: &Bounds, sharpness: f64) -> f64 {
    let mut loss = 0.0;
    for (i, &t) in theta.iter().enumerate() {
        if bounds.lower[i].is_finite() {
            loss += softplus(t, bounds.lower[i], -sharpness);
        }
        if bounds.upper[i].is_finite() {
            loss += softplus(t, bounds.upper[i], sharpness);
        }
    }
    loss
}

/// Accumulate `weight ·` ∇ bounds_penalty into `grad`.
pub fn bounds_penalty_grad(grad: &mut [f64], theta: &[f64], bounds: &Bounds, sharpness: f64, weight: f64) {
    for (i, &t) in theta.iter().enumerate() {
        if bounds.lower[i].is_finite() {
            grad[i] += weight * softplus_grad(t, bounds.lower[i], -sharpness);
        }
        if bounds.upper[i].is_finite() {
            grad[i] += weight * softplus_grad(t, bounds.upper[i], sharpness);
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Objective contract
// ─────────────────────────────────────────────────────────────

/// What an objective sees: the converged state and the bound parameters.
#[derive(Clone, Copy)]
pub struct ObjectiveContext<'a> {
    pub problem: &'a Problem,
    pub bound: &'a BoundParams,
    pub state: &'a [f64],
}

impl ObjectiveContext<'_> {
    pub fn theta(&self) -> &[f64] {
        &self.bound.theta
    }
}

pub trait Objective: Send + Sync + fmt::Debug {
    fn value(&self, ctx: &ObjectiveContext) -> f64;

    /// Accumulate ∂f/∂u.
    fn grad_state(&self, ctx: &ObjectiveContext, grad: &mut [f64]);

    /// Accumulate ∂f/∂θ.
    fn grad_params(&self, _ctx: &ObjectiveContext, _grad: &mut [f64]) {}

    /// Accumulate f_uu û + f_uθ θ̂.
    fn hvp_state(&self, _ctx: &ObjectiveContext, _u_dot: &[f64], _theta_dot: &[f64], _out: &mut [f64]) {}

    /// Accumulate f_θu û + f_θθ θ̂.
    fn hvp_params(&self, _ctx: &ObjectiveContext, _u_dot: &[f64], _theta_dot: &[f64], _out: &mut [f64]) {}

    /// `false` when `hvp_state` / `hvp_params` do not hold this objective's
    /// second derivatives; Hessian-vector products refuse such objectives.
    fn has_second_order(&self) -> bool {
        true
    }

    /// Check indices against the problem before any solve runs.
    fn validate(&self, _problem: &Problem, _num_params: usize) -> Result<(), FemError> {
        Ok(())
    }
}

fn check_dofs(dofs: &[usize], problem: &Problem) -> Result<(), FemError> {
    let n = problem.num_dofs();
    match dofs.iter().find(|&&d| d >= n) {
        Some(&dof) => Err(MeshError::InvalidDof { dof, num_dofs: n }.into()),
        None => Ok(()),
    }
}

fn check_lengths(what: &str, expected: usize, found: usize) -> Result<(), FemError> {
    if expected != found {
        return Err(FemError::mismatch(what, expected, found));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────
//  Built-in objectives
// ─────────────────────────────────────────────────────────────

/// f = Σ c_i u[d_i], e.g. a tip displacement.
#[derive(Debug, Clone, PartialEq)]
pub struct DofValue {
    pub dofs: Vec<usize>,
    pub coefficients: Vec<f64>,
}

impl DofValue {
    pub fn new(dofs: Vec<usize>, coefficients: Vec<f64>) -> Self {
        Self { dofs, coefficients }
    }

    pub fn single(dof: usize) -> Self {
        Self { dofs: vec![dof], coefficients: vec![1.0] }
    }
}

impl Objective for DofValue {
    fn value(&self, ctx: &ObjectiveContext) -> f64 {
        self.dofs.iter().zip(&self.coefficients).map(|(&d, c)| c * ctx.state[d]).sum()
    }

    fn grad_state(&self, _ctx: &ObjectiveContext, grad: &mut [f64]) {
        for (&d, c) in self.dofs.iter().zip(&self.coefficients) {
            grad[d] += c;
        }
    }

    fn validate(&self, problem: &Problem, _num_params: usize) -> Result<(), FemError> {
        check_lengths("DofValue coefficients", self.dofs.len(), self.coefficients.len())?;
        check_dofs(&self.dofs, problem)
    }
}

/// f = w Σ (u[d_i] − t_i)².
#[derive(Debug, Clone, PartialEq)]
pub struct TargetState {
    pub weight: f64,
    pub dofs: Vec<usize>,
    pub targets: Vec<f64>,
}

impl TargetState {
    pub fn new(dofs: Vec<usize>, targets: Vec<f64>) -> Self {
        Self { weight: 1.0, dofs, targets }
    }
}

impl Objective for TargetState {
    fn value(&self, ctx: &ObjectiveContext) -> f64 {
        let sq: f64 = self
            .dofs
            .iter()
            .zip(&self.targets)
            .map(|(&d, t)| (ctx.state[d] - t).powi(2))
            .sum();
        self.weight * sq
    }

    fn grad_state(&self, ctx: &ObjectiveContext, grad: &mut [f64]) {
        for (&d, t) in self.dofs.iter().zip(&self.targets) {
            grad[d] += 2.0 * self.weight * (ctx.state[d] - t);
        }
    }

    fn hvp_state(&self, _ctx: &ObjectiveContext, u_dot: &[f64], _theta_dot: &[f64], out: &mut [f64]) {
        for &d in &self.dofs {
            out[d] += 2.0 * self.weight * u_dot[d];
        }
    }

    fn validate(&self, problem: &Problem, _num_params: usize) -> Result<(), FemError> {
        check_lengths("TargetState targets", self.dofs.len(), self.targets.len())?;
        check_dofs(&self.dofs, problem)
    }
}

/// External work f = w F_ext(θ) · u.
#[derive(Debug, Clone, PartialEq)]
pub struct Compliance {
    pub weight: f64,
}

impl Default for Compliance {
    fn default() -> Self {
        Self { weight: 1.0 }
    }
}

impl Objective for Compliance {
    fn value(&self, ctx: &ObjectiveContext) -> f64 {
        let f = external_load(ctx.problem, ctx.bound);
        self.weight * f.iter().zip(ctx.state).map(|(a, b)| a * b).sum::<f64>()
    }

    fn grad_state(&self, ctx: &ObjectiveContext, grad: &mut [f64]) {
        for (g, f) in grad.iter_mut().zip(external_load(ctx.problem, ctx.bound)) {
            *g += self.weight * f;
        }
    }

    fn grad_params(&self, ctx: &ObjectiveContext, grad: &mut [f64]) {
        for (g, v) in grad.iter_mut().zip(external_load_vjp(ctx.problem, ctx.bound, ctx.state)) {
            *g += self.weight * v;
        }
    }

    fn hvp_state(&self, ctx: &ObjectiveContext, _u_dot: &[f64], theta_dot: &[f64], out: &mut [f64]) {
        for (o, v) in out.iter_mut().zip(external_load_jvp(ctx.problem, ctx.bound, theta_dot)) {
            *o += self.weight * v;
        }
    }

    fn hvp_params(&self, ctx: &ObjectiveContext, u_dot: &[f64], _theta_dot: &[f64], out: &mut [f64]) {
        for (o, v) in out.iter_mut().zip(external_load_vjp(ctx.problem, ctx.bound, u_dot)) {
            *o += self.weight * v;
        }
    }
}

/// f = w Σ (θ[i] − t_i)², a regulariser on design variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterTarget {
    pub weight: f64,
    pub indices: Vec<usize>,
    pub targets: Vec<f64>,
}

impl ParameterTarget {
    pub fn new(indices: Vec<usize>, targets: Vec<f64>) -> Self {
        Self { weight: 1.0, indices, targets }
    }
}

impl Objective for ParameterTarget {
    fn value(&self, ctx: &ObjectiveContext) -> f64 {
        let theta = ctx.theta();
        self.weight * self.indices.iter().zip(&self.targets).map(|(&i, t)| (theta[i] - t).powi(2)).sum::<f64>()
    }

    fn grad_state(&self, _ctx: &ObjectiveContext, _grad: &mut [f64]) {}

    fn grad_params(&self, ctx: &ObjectiveContext, grad: &mut [f64]) {
        let theta = ctx.theta();
        for (&i, t) in self.indices.iter().zip(&self.targets) {
            grad[i] += 2.0 * self.weight * (theta[i] - t);
        }
    }

    fn hvp_params(&self, _ctx: &ObjectiveContext, _u_dot: &[f64], theta_dot: &[f64], out: &mut [f64]) {
        for &i in &self.indices {
            out[i] += 2.0 * self.weight * theta_dot[i];
        }
    }

    fn validate(&self, _problem: &Problem, num_params: usize) -> Result<(), FemError> {
        check_lengths("ParameterTarget targets", self.indices.len(), self.targets.len())?;
        match self.indices.iter().find(|&&i| i >= num_params) {
            Some(&i) => Err(FemError::mismatch("ParameterTarget index bound", num_params, i + 1)),
            None => Ok(()),
        }
    }
}

type ValueFn = Box<dyn Fn(&[f64], &[f64]) -> f64 + Send + Sync>;
type GradientFn = Box<dyn Fn(&[f64], &[f64], &mut [f64], &mut [f64]) + Send + Sync>;
type HessianFn = Box<dyn Fn(&[f64], &[f64], &[f64], &[f64], &mut [f64], &mut [f64]) + Send + Sync>;

/// Caller-supplied closures over (state, θ).  The gradient closure
/// accumulates ∂f/∂u into its third argument and ∂f/∂θ into its fourth.
///
/// Without [`FnObjective::with_hessian`] the objective has no second-order
/// terms and `hessian_vector_product` rejects it.
pub struct FnObjective {
    name: String,
    value: ValueFn,
    gradient: GradientFn,
    hessian: Option<HessianFn>,
}

impl FnObjective {
    pub fn new(
        name: impl Into<String>,
        value: impl Fn(&[f64], &[f64]) -> f64 + Send + Sync + 'static,
        gradient: impl Fn(&[f64], &[f64], &mut [f64], &mut [f64]) + Send + Sync + 'static,
    ) -> Self {
        Self { name: name.into(), value: Box::new(value), gradient: Box::new(gradient), hessian: None }
    }

    /// Second-order closure `(u, θ, û, θ̂, out_u, out_θ)` accumulating
    /// f_uu û + f_uθ θ̂ into `out_u` and f_θu û + f_θθ θ̂ into `out_θ`.
    /// Affine objectives pass a closure that does nothing.
    pub fn with_hessian(
        mut self,
        hessian: impl Fn(&[f64], &[f64], &[f64], &[f64], &mut [f64], &mut [f64]) + Send + Sync + 'static,
    ) -> Self {
        self.hessian = Some(Box::new(hessian));
        self
    }
}

impl fmt::Debug for FnObjective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FnObjective({})", self.name)
    }
}

impl Objective for FnObjective {
    fn value(&self, ctx: &ObjectiveContext) -> f64 {
        (self.value)(ctx.state, ctx.theta())
    }

    fn grad_state(&self, ctx: &ObjectiveContext, grad: &mut [f64]) {
        let mut scratch = vec![0.0; ctx.theta().len()];
        (self.gradient)(ctx.state, ctx.theta(), grad, &mut scratch);
    }

    fn grad_params(&self, ctx: &ObjectiveContext, grad: &mut [f64]) {
        let mut scratch = vec![0.0; ctx.state.len()];
        (self.gradient)(ctx.state, ctx.theta(), &mut scratch, grad);
    }

    fn hvp_state(&self, ctx: &ObjectiveContext, u_dot: &[f64], theta_dot: &[f64], out: &mut [f64]) {
        if let Some(hessian) = &self.hessian {
            let mut scratch = vec![0.0; ctx.theta().len()];
            hessian(ctx.state, ctx.theta(), u_dot, theta_dot, out, &mut scratch);
        }
    }

    fn hvp_params(&self, ctx: &ObjectiveContext, u_dot: &[f64], theta_dot: &[f64], out: &mut [f64]) {
        if let Some(hessian) = &self.hessian {
            let mut scratch = vec![0.0; ctx.state.len()];
            hessian(ctx.state, ctx.theta(), u_dot, theta_dot, &mut scratch, out);
        }
    }

    fn has_second_order(&self) -> bool {
        self.hessian.is_some()
    }
}

/// Sum of objectives.
#[derive(Debug, Default)]
pub struct ObjectiveSum(pub Vec<Box<dyn Objective>>);

impl ObjectiveSum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, objective: impl Objective + 'static) -> Self {
        self.0.push(Box::new(objective));
        self
    }
}

impl Objective for ObjectiveSum {
    fn value(&self, ctx: &ObjectiveContext) -> f64 {
        self.0.iter().map(|o| o.value(ctx)).sum()
    }

    fn grad_state(&self, ctx: &ObjectiveContext, grad: &mut [f64]) {
        self.0.iter().for_each(|o| o.grad_state(ctx, grad));
    }

    fn grad_params(&self, ctx: &ObjectiveContext, grad: &mut [f64]) {
        self.0.iter().for_each(|o| o.grad_params(ctx, grad));
    }

    fn hvp_state(&self, ctx: &ObjectiveContext, u_dot: &[f64], theta_dot: &[f64], out: &mut [f64]) {
        self.0.iter().for_each(|o| o.hvp_state(ctx, u_dot, theta_dot, out));
    }

    fn hvp_params(&self, ctx: &ObjectiveContext, u_dot: &[f64], theta_dot: &[f64], out: &mut [f64]) {
        self.0.iter().for_each(|o| o.hvp_params(ctx, u_dot, theta_dot, out));
    }

    fn has_second_order(&self) -> bool {
        self.0.iter().all(|o| o.has_second_order())
    }

    fn validate(&self, problem: &Problem, num_params: usize) -> Result<(), FemError> {
        self.0.iter().try_for_each(|o| o.validate(problem, num_params))
    }
}
