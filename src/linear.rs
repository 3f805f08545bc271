//! Linear solver backends behind the [`LinearSolver`] trait.
//!
//! * Direct: `sprs-ldl` LDLᵀ (Cholesky-validated for SPD systems) with the
//!   symbolic analysis reused across refactorisations, or nalgebra's dense
//!   LU with partial pivoting for non-symmetric Jacobians.
//! * Iterative: `kryst` CG or BiCGSTAB on a Jacobi-scaled system.
//!
//! Every backend also solves with the transpose, which the adjoint needs.

use crate::types::{FemError, IterativeOptions, KrylovMethod, LinearSolverKind};
use kryst::context::ksp_context::Workspace;
use kryst::matrix::op::CsrOp;
use kryst::matrix::sparse::CsrMatrix;
use kryst::parallel::{NoComm, UniverseComm};
use kryst::preconditioner::PcSide;
use kryst::solver::bicgstab::BiCgStabSolver;
use kryst::solver::cg::CgSolver;
use kryst::solver::LinearSolver as _;
use nalgebra::{DMatrix, DVector, Dyn, LU};
use sprs::{CsMat, CsMatView, FillInReduction, SymmetryCheck};
use sprs_ldl::{Ldl, LdlNumeric};
use std::sync::Arc;

/// Structural class of a system matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixStructure {
    SymmetricPositiveDefinite,
    Symmetric,
    General,
}

impl MatrixStructure {
    pub fn is_symmetric(self) -> bool {
        !matches!(self, Self::General)
    }
}

pub trait LinearSolver: Send {
    fn name(&self) -> &'static str;

    /// Factor (or store) `a`.  Calling again with the same pattern reuses
    /// whatever symbolic work the backend keeps.
    fn factor(&mut self, a: CsMatView<f64>) -> Result<(), FemError>;

    /// Solve A x = b with the most recent factorisation.
    fn solve(&self, b: &[f64]) -> Result<Vec<f64>, FemError>;

    /// Solve Aᵀ x = b.
    fn solve_transpose(&self, b: &[f64]) -> Result<Vec<f64>, FemError>;
}

pub fn make_solver(kind: LinearSolverKind, structure: MatrixStructure) -> Box<dyn LinearSolver> {
    match kind {
        LinearSolverKind::Direct => Box::new(DirectSolver::new(FactorisationStrategy::from_structure(structure))),
        LinearSolverKind::Iterative(options) => Box::new(IterativeSolver::new(options)),
    }
}

// ─────────────────────────────────────────────────────────────
//  Factorisation strategy
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactorisationStrategy {
    /// LDLᵀ with D > 0 validated.
    Cholesky,
    /// Symmetric indefinite LDLᵀ.
    LDL,
    /// Dense LU with partial pivoting.
    DenseLu,
}

impl FactorisationStrategy {
    pub fn from_structure(structure: MatrixStructure) -> Self {
        match structure {
            MatrixStructure::SymmetricPositiveDefinite => Self::Cholesky,
            MatrixStructure::Symmetric => Self::LDL,
            MatrixStructure::General => Self::DenseLu,
        }
    }
}

/// Relative pivot size below which a factorisation is declared singular.
const PIVOT_TOLERANCE: f64 = 1e-15;

pub enum Factorization {
    Cholesky(LdlNumeric<f64, usize>),
    Ldl(LdlNumeric<f64, usize>),
    DenseLu(DenseLu),
}

impl std::fmt::Debug for Factorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cholesky(_) => write!(f, "Factorization::Cholesky(...)"),
            Self::Ldl(_) => write!(f, "Factorization::Ldl(...)"),
            Self::DenseLu(lu) => write!(f, "Factorization::DenseLu(n = {})", lu.n),
        }
    }
}

impl Factorization {
    pub fn new(a: CsMatView<f64>, strategy: FactorisationStrategy) -> Result<Self, FemError> {
        match strategy {
            FactorisationStrategy::Cholesky => {
                let ldl = symbolic().numeric(a)?;
                check_pivots(&ldl, true)?;
                Ok(Self::Cholesky(ldl))
            }
            FactorisationStrategy::LDL => {
                let ldl = symbolic().numeric(a)?;
                check_pivots(&ldl, false)?;
                Ok(Self::Ldl(ldl))
            }
            FactorisationStrategy::DenseLu => Ok(Self::DenseLu(DenseLu::factor(a)?)),
        }
    }

    /// Re-factor with new values on the same pattern.
    pub fn update(&mut self, a: CsMatView<f64>) -> Result<(), FemError> {
        match self {
            Self::Cholesky(ldl) => {
                ldl.update(a)?;
                check_pivots(ldl, true)
            }
            Self::Ldl(ldl) => {
                ldl.update(a)?;
                check_pivots(ldl, false)
            }
            Self::DenseLu(lu) => {
                *lu = DenseLu::factor(a)?;
                Ok(())
            }
        }
    }

    pub fn solve(&self, rhs: &[f64]) -> Result<Vec<f64>, FemError> {
        match self {
            Self::Cholesky(ldl) | Self::Ldl(ldl) => Ok(ldl.solve(rhs)),
            Self::DenseLu(lu) => lu.solve(rhs),
        }
    }

    pub fn solve_transpose(&self, rhs: &[f64]) -> Result<Vec<f64>, FemError> {
        match self {
            Self::Cholesky(ldl) | Self::Ldl(ldl) => Ok(ldl.solve(rhs)),
            Self::DenseLu(lu) => lu.solve_transpose(rhs),
        }
    }

    pub fn strategy(&self) -> FactorisationStrategy {
        match self {
            Self::Cholesky(_) => FactorisationStrategy::Cholesky,
            Self::Ldl(_) => FactorisationStrategy::LDL,
            Self::DenseLu(_) => FactorisationStrategy::DenseLu,
        }
    }
}

fn symbolic() -> Ldl {
    Ldl::new()
        .fill_in_reduction(FillInReduction::ReverseCuthillMcKee)
        .check_symmetry(SymmetryCheck::DontCheckSymmetry)
}

fn check_pivots(ldl: &LdlNumeric<f64, usize>, positive: bool) -> Result<(), FemError> {
    let d = ldl.d();
    let scale = d.iter().fold(0.0f64, |m, &v| m.max(v.abs()));
    for (i, &di) in d.iter().enumerate() {
        if positive && di <= 0.0 {
            return Err(FemError::SingularSystem {
                index: Some(i),
                reason: format!("D[{i}] = {di:.3e} <= 0 in Cholesky factorization (not SPD)"),
            });
        }
        if !di.is_finite() || di.abs() <= PIVOT_TOLERANCE * scale {
            return Err(FemError::SingularSystem {
                index: Some(i),
                reason: format!("pivot D[{i}] = {di:.3e} numerically zero"),
            });
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────
//  Dense LU  (non-symmetric fallback)
// ─────────────────────────────────────────────────────────────

/// nalgebra PA = LU of the densified matrix.
#[derive(Debug, Clone)]
pub struct DenseLu {
    n: usize,
    lu: LU<f64, Dyn, Dyn>,
}

impl DenseLu {
    pub fn factor(a: CsMatView<f64>) -> Result<Self, FemError> {
        let n = a.rows();
        let mut m = DMatrix::<f64>::zeros(n, n);
        for (&v, (row, col)) in a.iter() {
            m[(row, col)] += v;
        }
        let scale = m.amax();
        let lu = m.lu();
        for (i, &uii) in lu.lu_internal().diagonal().iter().enumerate() {
            if !(uii.abs() > PIVOT_TOLERANCE * scale) {
                return Err(FemError::SingularSystem {
                    index: Some(i),
                    reason: format!("no usable pivot in column {i} (|u_ii| = {:.3e})", uii.abs()),
                });
            }
        }
        Ok(Self { n, lu })
    }

    pub fn solve(&self, b: &[f64]) -> Result<Vec<f64>, FemError> {
        self.lu
            .solve(&DVector::from_column_slice(b))
            .map(|x| x.iter().copied().collect())
            .ok_or_else(|| singular_lu(self.n))
    }

    /// Aᵀ = Uᵀ Lᵀ P, so solve Uᵀ y = b, Lᵀ z = y, x = Pᵀ z.
    pub fn solve_transpose(&self, b: &[f64]) -> Result<Vec<f64>, FemError> {
        let mut x = DVector::from_column_slice(b);
        let l = self.lu.l();
        if !self.lu.lu_internal().tr_solve_upper_triangular_mut(&mut x) || !l.tr_solve_lower_triangular_mut(&mut x) {
            return Err(singular_lu(self.n));
        }
        self.lu.p().inv_permute_rows(&mut x);
        Ok(x.iter().copied().collect())
    }
}

fn singular_lu(n: usize) -> FemError {
    FemError::SingularSystem { index: None, reason: format!("dense LU of order {n} is not invertible") }
}

// ─────────────────────────────────────────────────────────────
//  Direct solver
// ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct DirectSolver {
    strategy: FactorisationStrategy,
    factorization: Option<Factorization>,
}

impl DirectSolver {
    pub fn new(strategy: FactorisationStrategy) -> Self {
        Self { strategy, factorization: None }
    }

    pub fn strategy(&self) -> FactorisationStrategy {
        self.strategy
    }

    fn factors(&self) -> Result<&Factorization, FemError> {
        self.factorization.as_ref().ok_or(FemError::MissingFactorization)
    }
}

impl LinearSolver for DirectSolver {
    fn name(&self) -> &'static str {
        match self.strategy {
            FactorisationStrategy::Cholesky => "cholesky",
            FactorisationStrategy::LDL => "ldl",
            FactorisationStrategy::DenseLu => "dense-lu",
        }
    }

    fn factor(&mut self, a: CsMatView<f64>) -> Result<(), FemError> {
        match self.factorization.as_mut() {
            Some(f) => {
                if let Err(e) = f.update(a) {
                    self.factorization = None;
                    return Err(e);
                }
            }
            None => self.factorization = Some(Factorization::new(a, self.strategy)?),
        }
        Ok(())
    }

    fn solve(&self, b: &[f64]) -> Result<Vec<f64>, FemError> {
        self.factors()?.solve(b)
    }

    fn solve_transpose(&self, b: &[f64]) -> Result<Vec<f64>, FemError> {
        self.factors()?.solve_transpose(b)
    }
}

// ─────────────────────────────────────────────────────────────
//  Iterative solver
// ─────────────────────────────────────────────────────────────

/// Allowance on the true residual over the Krylov tolerance; kryst stops on
/// its recursively updated residual, which drifts from b − A x.
const KRYLOV_RESIDUAL_SLACK: f64 = 10.0;

/// kryst CG / BiCGSTAB on a Jacobi-scaled copy of the system.
///
/// CG sees the symmetric scaling S A S with S = |diag A|^{-1/2}, so the
/// operator stays symmetric; BiCGSTAB sees the row scaling D⁻¹ A.
#[derive(Debug)]
pub struct IterativeSolver {
    options: IterativeOptions,
    matrix: Option<CsMat<f64>>,
}

/// L A R with diagonal L, R, stored as CSR.
struct ScaledSystem {
    matrix: CsMat<f64>,
    left: Vec<f64>,
    right: Vec<f64>,
}

impl IterativeSolver {
    pub fn new(options: IterativeOptions) -> Self {
        Self { options, matrix: None }
    }

    fn method_name(&self) -> &'static str {
        match self.options.method {
            KrylovMethod::ConjugateGradient => "CG",
            KrylovMethod::BiCgStab => "BiCGSTAB",
        }
    }

    fn scaled(&self, csr: CsMat<f64>) -> ScaledSystem {
        let n = csr.rows();
        let mut diag = vec![0.0; n];
        for (&v, (row, col)) in csr.iter() {
            if row == col {
                diag[row] += v;
            }
        }
        let (left, right): (Vec<f64>, Vec<f64>) = match self.options.method {
            KrylovMethod::ConjugateGradient => diag
                .iter()
                .map(|&d| {
                    let s = if d.abs() > 0.0 { 1.0 / d.abs().sqrt() } else { 1.0 };
                    (s, s)
                })
                .unzip(),
            KrylovMethod::BiCgStab => diag.iter().map(|&d| (if d != 0.0 { 1.0 / d } else { 1.0 }, 1.0)).unzip(),
        };
        let mut matrix = csr;
        for (row, mut vec) in matrix.outer_iterator_mut().enumerate() {
            for (col, v) in vec.iter_mut() {
                *v *= left[row] * right[col];
            }
        }
        ScaledSystem { matrix, left, right }
    }

    /// Solve with `csr` (already in row-major storage).
    fn run(&self, csr: CsMat<f64>, b: &[f64]) -> Result<Vec<f64>, FemError> {
        let n = b.len();
        if norm(b) == 0.0 {
            return Ok(vec![0.0; n]);
        }
        let system = self.scaled(csr);
        let rhs: Vec<f64> = b.iter().zip(&system.left).map(|(b, l)| b * l).collect();

        let op = CsrOp::new(Arc::new(CsrMatrix::from_csr(
            n,
            n,
            system.matrix.indptr().to_proper().into_owned(),
            system.matrix.indices().to_vec(),
            system.matrix.data().to_vec(),
        )));
        let (tol, max_iterations) = (self.options.tolerance, self.options.max_iterations);
        let mut workspace = Workspace::new(n);
        let mut y = vec![0.0; n];
        let comm = UniverseComm::NoComm(NoComm {});

        let outcome = match self.options.method {
            KrylovMethod::ConjugateGradient => {
                let mut solver = CgSolver::new(tol, max_iterations);
                solver.setup_workspace(&mut workspace);
                solver
                    .solve(&op, None, rhs.as_slice(), y.as_mut_slice(), PcSide::Left, &comm, None, Some(&mut workspace))
                    .map(|stats| format!("{stats:?}"))
                    .map_err(|e| format!("{e:?}"))
            }
            KrylovMethod::BiCgStab => {
                let mut solver = BiCgStabSolver::new(tol, max_iterations);
                solver.setup_workspace(&mut workspace);
                solver
                    .solve(&op, None, rhs.as_slice(), y.as_mut_slice(), PcSide::Left, &comm, None, Some(&mut workspace))
                    .map(|stats| format!("{stats:?}"))
                    .map_err(|e| format!("{e:?}"))
            }
        };

        let residual = system
            .matrix
            .outer_iterator()
            .zip(&rhs)
            .map(|(row, b)| (b - row.iter().map(|(col, v)| v * y[col]).sum::<f64>()).powi(2))
            .sum::<f64>()
            .sqrt();
        let rhs_norm = norm(&rhs);
        let converged = residual.is_finite() && residual <= KRYLOV_RESIDUAL_SLACK * tol * rhs_norm.max(1.0);
        match outcome {
            Ok(stats) if converged => {
                tracing::trace!(method = self.method_name(), %stats, "Krylov solve converged");
                Ok(y.iter().zip(&system.right).map(|(y, r)| y * r).collect())
            }
            other => {
                if let Err(e) = other {
                    tracing::debug!(method = self.method_name(), error = %e, "kryst reported failure");
                }
                Err(FemError::IterativeDivergence {
                    method: self.method_name(),
                    iterations: max_iterations,
                    residual_norm: residual / rhs_norm,
                    tolerance: tol,
                })
            }
        }
    }
}

impl LinearSolver for IterativeSolver {
    fn name(&self) -> &'static str {
        match self.options.method {
            KrylovMethod::ConjugateGradient => "cg",
            KrylovMethod::BiCgStab => "bicgstab",
        }
    }

    fn factor(&mut self, a: CsMatView<f64>) -> Result<(), FemError> {
        self.matrix = Some(a.to_owned());
        Ok(())
    }

    fn solve(&self, b: &[f64]) -> Result<Vec<f64>, FemError> {
        let a = self.matrix.as_ref().ok_or(FemError::MissingFactorization)?;
        self.run(a.to_csr(), b)
    }

    fn solve_transpose(&self, b: &[f64]) -> Result<Vec<f64>, FemError> {
        let a = self.matrix.as_ref().ok_or(FemError::MissingFactorization)?;
        self.run(a.transpose_view().to_csr(), b)
    }
}

// ─────────────────────────────────────────────────────────────
//  Vector helpers
// ─────────────────────────────────────────────────────────────

pub(crate) fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub(crate) fn norm(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

pub(crate) fn axpy(alpha: f64, x: &[f64], y: &mut [f64]) {
    for (yi, xi) in y.iter_mut().zip(x) {
        *yi += alpha * xi;
    }
}
