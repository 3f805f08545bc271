//! **dfem**: differentiable finite-element engine with hand-assembled adjoints.
//!
//! This crate implements the complete solve-and-differentiate pipeline:
//!
//! 1. **Discretisation** (`element`, `mesh`): reference elements, quadrature,
//!    isoparametric mapping, index-array meshes and DOF numbering.
//! 2. **Weak forms** (`physics`, `params`): elasticity and nonlinear heat,
//!    generic over dual numbers; named global / per-element parameters.
//! 3. **Assembly** (`sparsity`, `assembly`, `bc`): cached CSC pattern,
//!    parallel element kernels, Dirichlet elimination or penalty.
//! 4. **Forward solve** (`linear`, `newton`): Cholesky / LDL / LU or Krylov,
//!    Newton with backtracking line search.
//! 5. **Gradients** (`gradients`, `objectives`): adjoint VJP, tangent JVP and
//!    Hessian-vector products through the converged solve.
//! 6. **Optimiser** (`optimizer`): L-BFGS via `argmin`.

pub mod types;
pub mod element;
pub mod mesh;
pub mod params;
pub mod physics;
pub mod sparsity;
pub mod bc;
pub mod assembly;
pub mod linear;
pub mod newton;
pub mod objectives;
pub mod gradients;
pub mod problem;
pub mod optimizer;

pub use bc::{BoundaryConditions, DirichletBc, NeumannLoad};
pub use element::ElementKind;
pub use gradients::{hessian_vector_product, HessianVectorProduct, ImplicitSolve};
pub use mesh::{ElementBlock, Mesh};
pub use objectives::{Compliance, DofValue, FnObjective, Objective, ObjectiveSum, ParameterTarget, TargetState};
pub use optimizer::{optimize, DesignResult, OptimizerOptions};
pub use params::{ParamRef, ParamSet};
pub use physics::{LinearElasticity, NonlinearHeat, Physics, Simp};
pub use problem::{gradient, solve, Problem};
pub use types::{
    Bounds, DirichletPolicy, FemError, IterativeOptions, KrylovMethod, LineSearch, LinearSolverKind, MeshError,
    ParameterGradient, SolutionState, SolverOptions,
};
