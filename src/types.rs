use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─────────────────────────────────────────────────────────────
//  Error types
// ─────────────────────────────────────────────────────────────

/// Problems with the mesh, its connectivity, or the DOF addressing.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MeshError {
    #[error("mesh has no nodes or no elements")]
    EmptyMesh,
    #[error("unsupported spatial dimension {0} (expected 1 or 2)")]
    UnsupportedDimension(usize),
    #[error("element {element}: node index {node} out of range (mesh has {num_nodes} nodes)")]
    NodeOutOfRange { element: usize, node: usize, num_nodes: usize },
    #[error("{kind} expects {expected} nodes per element, connectivity has {found}")]
    WrongNodeCount { kind: &'static str, expected: usize, found: usize },
    #[error("element {element} is degenerate or inverted (det J = {det:.3e})")]
    DegenerateElement { element: usize, det: f64 },
    #[error("{kind} cannot be used in a {dim}-D mesh as a volume element")]
    IncompatibleElement { kind: &'static str, dim: usize },
    #[error("DOF {dof} out of range (problem has {num_dofs} DOFs)")]
    InvalidDof { dof: usize, num_dofs: usize },
}

/// Unified error type for all fallible operations in the crate.
///
/// Every function in the public API returns `Result<T, FemError>` instead of
/// panicking. Linear-solver failures are terminal for the current solve call.
#[derive(Debug, Error)]
pub enum FemError {
    #[error("mesh error: {0}")]
    Mesh(#[from] MeshError),

    /// Newton iteration hit the iteration cap (or produced a non-finite
    /// residual) before meeting the tolerance.
    #[error(
        "Newton iteration did not converge after {iterations} iterations \
         (|R| = {residual_norm:.3e}, |R|/|R0| = {relative:.3e})"
    )]
    Convergence { iterations: usize, residual_norm: f64, relative: f64 },

    /// Direct factorisation found a structurally or numerically singular matrix.
    #[error("singular system{}: {reason}", pivot_suffix(.index))]
    SingularSystem { index: Option<usize>, reason: String },

    /// Krylov method exhausted its iteration cap.
    #[error(
        "{method} did not reach tolerance {tolerance:.1e} in {iterations} iterations \
         (relative residual {residual_norm:.3e})"
    )]
    IterativeDivergence { method: &'static str, iterations: usize, residual_norm: f64, tolerance: f64 },

    /// Parameter or state vector shape inconsistent with the DOF map.
    #[error("dimension mismatch for {what}: expected {expected}, found {found}")]
    DimensionMismatch { what: String, expected: usize, found: usize },

    #[error("unknown parameter `{0}`")]
    UnknownParameter(String),

    /// `solve` called on a linear solver before `factor`.
    #[error("factorization not computed; call factor() first")]
    MissingFactorization,

    /// An element touches a (row, col) pair the cached pattern does not hold.
    #[error("element {element}: entry ({row}, {col}) missing from the sparsity pattern")]
    SparsityMismatch { element: usize, row: usize, col: usize },

    /// Hessian-vector product requested for an objective without second derivatives.
    #[error("objective `{0}` provides no second derivatives")]
    MissingSecondOrder(String),

    /// Design optimiser (argmin) returned an error.
    #[error("optimizer error: {0}")]
    Optimizer(String),
}

fn pivot_suffix(index: &Option<usize>) -> String {
    index.map(|i| format!(" at pivot {i}")).unwrap_or_default()
}

impl FemError {
    pub(crate) fn mismatch(what: impl Into<String>, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch { what: what.into(), expected, found }
    }
}

impl From<sprs::errors::LinalgError> for FemError {
    fn from(e: sprs::errors::LinalgError) -> Self {
        match e {
            sprs::errors::LinalgError::SingularMatrix(info) => Self::SingularSystem {
                index: Some(info.index),
                reason: info.reason.to_string(),
            },
            other => Self::SingularSystem { index: None, reason: other.to_string() },
        }
    }
}

impl From<argmin::core::Error> for FemError {
    fn from(e: argmin::core::Error) -> Self {
        Self::Optimizer(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────
//  Constants
// ─────────────────────────────────────────────────────────────

pub const DEFAULT_PENALTY_FACTOR: f64 = 1e8;
pub const DEFAULT_BARRIER_SHARPNESS: f64 = 10.0;

// ─────────────────────────────────────────────────────────────
//  Boundary-condition policy
// ─────────────────────────────────────────────────────────────

/// How Dirichlet constraints enter the linearised system.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DirichletPolicy {
    /// Zero constrained rows/columns, unit diagonal, known values moved to
    /// the right-hand side. Exact, keeps symmetry.
    Elimination,
    /// Add `factor * max|diag|` on constrained diagonals. Approximate.
    Penalty { factor: f64 },
}

impl Default for DirichletPolicy {
    fn default() -> Self {
        Self::Elimination
    }
}

// ─────────────────────────────────────────────────────────────
//  Linear / nonlinear solver options
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KrylovMethod {
    /// Conjugate gradient. Symmetric positive definite systems only.
    ConjugateGradient,
    /// BiCGSTAB. General (non-symmetric) systems.
    BiCgStab,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IterativeOptions {
    pub method: KrylovMethod,
    /// Relative residual tolerance ‖b − Ax‖ / ‖b‖.
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for IterativeOptions {
    fn default() -> Self {
        Self {
            method: KrylovMethod::BiCgStab,
            tolerance: 1e-12,
            max_iterations: 5000,
        }
    }
}

/// Backend used for every linear solve (Newton increment, adjoint, tangent).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinearSolverKind {
    /// Sparse LDLᵀ (dense LU for non-symmetric Jacobians).
    Direct,
    /// Jacobi-preconditioned Krylov method.
    Iterative(IterativeOptions),
}

impl Default for LinearSolverKind {
    fn default() -> Self {
        Self::Direct
    }
}

/// Step-length control for the Newton update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LineSearch {
    /// Full Newton step, optionally scaled by a constant damping factor.
    Fixed { damping: f64 },
    /// Backtracking on the residual norm with the Armijo condition
    /// ‖R(u + αδ)‖ ≤ (1 − c α) ‖R(u)‖.
    Backtracking { armijo: f64, shrink: f64, min_step: f64 },
}

impl Default for LineSearch {
    fn default() -> Self {
        Self::Backtracking { armijo: 1e-4, shrink: 0.5, min_step: 1.0 / 64.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    pub relative_tolerance: f64,
    pub absolute_tolerance: f64,
    pub max_iterations: usize,
    pub line_search: LineSearch,
    pub linear_solver: LinearSolverKind,
    pub dirichlet: DirichletPolicy,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            relative_tolerance: 1e-10,
            absolute_tolerance: 1e-12,
            max_iterations: 25,
            line_search: LineSearch::default(),
            linear_solver: LinearSolverKind::default(),
            dirichlet: DirichletPolicy::default(),
        }
    }
}

impl SolverOptions {
    pub fn with_linear_solver(mut self, kind: LinearSolverKind) -> Self {
        self.linear_solver = kind;
        self
    }

    pub fn with_dirichlet(mut self, policy: DirichletPolicy) -> Self {
        self.dirichlet = policy;
        self
    }

    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n;
        self
    }
}

// ─────────────────────────────────────────────────────────────
//  Bounds  (design-variable box for the optimiser)
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bounds {
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

impl Bounds {
    pub fn unbounded(num_params: usize) -> Self {
        Self {
            lower: vec![f64::NEG_INFINITY; num_params],
            upper: vec![f64::INFINITY; num_params],
        }
    }

    /// Strictly positive lower bound on every parameter (moduli, densities).
    pub fn positive(num_params: usize) -> Self {
        Self {
            lower: vec![1e-8; num_params],
            upper: vec![f64::INFINITY; num_params],
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Solve results
// ─────────────────────────────────────────────────────────────

/// One row of the Newton convergence history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IterationRecord {
    pub iteration: usize,
    pub residual_norm: f64,
    pub relative: f64,
    /// Step length applied after this residual evaluation (0 at the last row).
    pub step: f64,
}

/// Converged state vector handed back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct SolutionState {
    /// One scalar per DOF, `dof = node * arity + component`.
    pub values: Vec<f64>,
    /// Number of Newton updates applied.
    pub iterations: usize,
    pub residual_norm: f64,
    pub history: Vec<IterationRecord>,
}

impl SolutionState {
    pub fn dof(&self, dof: usize) -> f64 {
        self.values[dof]
    }
}

/// Gradient of an objective with respect to the flattened parameter vector.
#[derive(Debug, Clone)]
pub struct ParameterGradient {
    pub value: f64,
    /// d f / d θ, same layout as `ParamSet::flatten()`.
    pub gradient: Vec<f64>,
    pub state: SolutionState,
}
