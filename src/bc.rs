//! Boundary conditions: Dirichlet constraints, Neumann point loads and facet
//! tractions, and their enforcement on the assembled system.

use crate::element::{facet_weights, ElementKind, ReferenceTabulation};
use crate::linear::norm;
use crate::mesh::{DofMap, Mesh};
use crate::params::ParamRef;
use crate::sparsity::SparsityPattern;
use crate::types::{DirichletPolicy, FemError, MeshError};
use serde::{Deserialize, Serialize};
use sprs::CsMat;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirichletBc {
    pub node: usize,
    pub component: usize,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeumannLoad {
    /// Concentrated nodal force / flux.
    Point { node: usize, component: usize, magnitude: ParamRef },
    /// Uniform load per unit facet length, distributed work-equivalently.
    Traction { kind: ElementKind, nodes: Vec<usize>, component: usize, magnitude: ParamRef },
}

impl NeumannLoad {
    pub fn magnitude(&self) -> &ParamRef {
        match self {
            Self::Point { magnitude, .. } | Self::Traction { magnitude, .. } => magnitude,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundaryConditions {
    pub dirichlet: Vec<DirichletBc>,
    pub neumann: Vec<NeumannLoad>,
}

impl BoundaryConditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fix(mut self, node: usize, component: usize, value: f64) -> Self {
        self.dirichlet.push(DirichletBc { node, component, value });
        self
    }

    /// Fix every component of `node` to zero.
    pub fn clamp(mut self, node: usize, arity: usize) -> Self {
        for c in 0..arity {
            self.dirichlet.push(DirichletBc { node, component: c, value: 0.0 });
        }
        self
    }

    pub fn point_load(mut self, node: usize, component: usize, magnitude: impl Into<ParamRef>) -> Self {
        self.neumann.push(NeumannLoad::Point { node, component, magnitude: magnitude.into() });
        self
    }

    pub fn traction(
        mut self,
        kind: ElementKind,
        nodes: Vec<usize>,
        component: usize,
        magnitude: impl Into<ParamRef>,
    ) -> Self {
        self.neumann.push(NeumannLoad::Traction { kind, nodes, component, magnitude: magnitude.into() });
        self
    }
}

/// External load term F_ext += m · w over `dofs`.
#[derive(Debug, Clone)]
pub struct LoadTerm {
    pub dofs: Vec<usize>,
    pub weights: Vec<f64>,
}

/// Boundary conditions resolved against a mesh and DOF map.
#[derive(Debug, Clone)]
pub struct CompiledBcs {
    /// Sorted by DOF, one entry per constrained DOF.
    pub dirichlet: Vec<(usize, f64)>,
    pub constrained: Vec<bool>,
    pub loads: Vec<LoadTerm>,
}

impl CompiledBcs {
    pub fn compile(bcs: &BoundaryConditions, mesh: &Mesh, dofs: &DofMap) -> Result<Self, FemError> {
        let n = dofs.num_dofs();
        let mut dirichlet = Vec::with_capacity(bcs.dirichlet.len());
        for bc in &bcs.dirichlet {
            dirichlet.push((dofs.dof(bc.node, bc.component)?, bc.value));
        }
        // Later entries override earlier ones on the same DOF.
        dirichlet.reverse();
        dirichlet.sort_by_key(|&(d, _)| d);
        dirichlet.dedup_by_key(|&mut (d, _)| d);

        let mut constrained = vec![false; n];
        for &(d, _) in &dirichlet {
            constrained[d] = true;
        }

        let mut loads = Vec::with_capacity(bcs.neumann.len());
        for (i, load) in bcs.neumann.iter().enumerate() {
            loads.push(match load {
                NeumannLoad::Point { node, component, .. } => {
                    LoadTerm { dofs: vec![dofs.dof(*node, *component)?], weights: vec![1.0] }
                }
                NeumannLoad::Traction { kind, nodes, component, .. } => {
                    if nodes.len() != kind.num_nodes() {
                        return Err(MeshError::WrongNodeCount {
                            kind: kind.name(),
                            expected: kind.num_nodes(),
                            found: nodes.len(),
                        }
                        .into());
                    }
                    let coords = mesh.gather_coords(nodes)?;
                    let tab = ReferenceTabulation::new(*kind);
                    let weights = facet_weights(&tab, coords.view(), i)?;
                    let dofs = nodes
                        .iter()
                        .map(|&node| dofs.dof(node, *component))
                        .collect::<Result<Vec<_>, _>>()?;
                    LoadTerm { dofs, weights }
                }
            });
        }

        Ok(Self { dirichlet, constrained, loads })
    }

    /// Write prescribed values into a state vector.
    pub fn impose_values(&self, state: &mut [f64]) {
        for &(d, g) in &self.dirichlet {
            state[d] = g;
        }
    }
}

/// Enforce Dirichlet constraints on an assembled residual and Jacobian in
/// place.  Returns the penalty coefficient used (1 for elimination), which
/// [`apply_bcs_residual`] needs for residual-only evaluations.
pub fn apply_bcs(
    residual: &mut [f64],
    jacobian: &mut CsMat<f64>,
    pattern: &SparsityPattern,
    state: &[f64],
    bcs: &CompiledBcs,
    policy: DirichletPolicy,
) -> f64 {
    if bcs.dirichlet.is_empty() {
        return 1.0;
    }
    let mut shift = vec![0.0; residual.len()];
    for &(d, g) in &bcs.dirichlet {
        shift[d] = state[d] - g;
    }

    match policy {
        DirichletPolicy::Elimination => {
            let indptr = pattern.indptr();
            let indices = pattern.indices();
            let data = jacobian.data_mut();
            for col in 0..pattern.dim() {
                for nz in indptr[col]..indptr[col + 1] {
                    let row = indices[nz];
                    if bcs.constrained[col] {
                        if !bcs.constrained[row] {
                            residual[row] -= data[nz] * shift[col];
                        }
                        data[nz] = if row == col { 1.0 } else { 0.0 };
                    } else if bcs.constrained[row] {
                        data[nz] = 0.0;
                    }
                }
            }
            for &(d, _) in &bcs.dirichlet {
                residual[d] = shift[d];
            }
            1.0
        }
        DirichletPolicy::Penalty { factor } => {
            let diag = pattern.diag();
            let data = jacobian.data_mut();
            let max_diag = diag.iter().map(|&nz| data[nz].abs()).fold(0.0, f64::max);
            let alpha = if max_diag > 0.0 {
                factor * max_diag
            } else {
                tracing::warn!("Jacobian diagonal is zero; penalty falls back to the bare factor");
                factor
            };
            for &(d, _) in &bcs.dirichlet {
                data[diag[d]] += alpha;
                residual[d] += alpha * shift[d];
            }
            alpha
        }
    }
}

/// Residual-only counterpart of [`apply_bcs`] for line-search trials.
/// Assumes constrained DOFs already hold their prescribed values for
/// elimination, so free rows need no shift.
pub fn apply_bcs_residual(
    residual: &mut [f64],
    state: &[f64],
    bcs: &CompiledBcs,
    policy: DirichletPolicy,
    alpha: f64,
) {
    for &(d, g) in &bcs.dirichlet {
        match policy {
            DirichletPolicy::Elimination => residual[d] = state[d] - g,
            DirichletPolicy::Penalty { .. } => residual[d] += alpha * (state[d] - g),
        }
    }
}

/// Residual norm used for convergence and line-search decisions.  Penalty
/// rows carry R_d + α (u_d − g); they enter divided by α so the norm
/// measures the constraint violation u_d − g instead of α-scaled rounding.
pub fn constraint_scaled_norm(residual: &[f64], bcs: &CompiledBcs, policy: DirichletPolicy, alpha: f64) -> f64 {
    let DirichletPolicy::Penalty { .. } = policy else {
        return norm(residual);
    };
    residual
        .iter()
        .zip(&bcs.constrained)
        .map(|(r, &c)| if c { r / alpha } else { *r })
        .map(|r| r * r)
        .sum::<f64>()
        .sqrt()
}

/// Zero constrained entries of a right-hand side (adjoint / tangent solves
/// against an eliminated matrix).  Penalty systems are left untouched.
pub fn zero_constrained(rhs: &mut [f64], bcs: &CompiledBcs, policy: DirichletPolicy) {
    if let DirichletPolicy::Elimination = policy {
        for &(d, _) in &bcs.dirichlet {
            rhs[d] = 0.0;
        }
    }
}
