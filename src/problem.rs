//! The [`Problem`] bundle and the top-level `solve` / `gradient` entry points.

use crate::bc::{BoundaryConditions, CompiledBcs};
use crate::element::{map_element, ElementGeometry, ReferenceTabulation};
use crate::gradients::{self, HessianVectorProduct};
use crate::mesh::{DofMap, Mesh};
use crate::newton::NewtonSolver;
use crate::objectives::Objective;
use crate::params::{BoundParams, ParamSet, Slot};
use crate::physics::Physics;
use crate::sparsity::{PatternCache, SparsityPattern};
use crate::types::{FemError, ParameterGradient, SolutionState, SolverOptions};
use rayon::prelude::*;
use std::sync::Arc;

/// Mesh, weak form, boundary conditions, DOF map, cached sparsity pattern
/// and mapped element geometry.  Immutable once built; share it between
/// threads freely.
#[derive(Debug)]
pub struct Problem {
    mesh: Arc<Mesh>,
    physics: Physics,
    boundary: BoundaryConditions,
    dofs: DofMap,
    pattern: Arc<SparsityPattern>,
    tabulations: Vec<ReferenceTabulation>,
    /// Per block, per element: shape gradients and jxw at the quadrature points.
    geometry: Vec<Vec<ElementGeometry>>,
    compiled: CompiledBcs,
}

impl Problem {
    pub fn new(mesh: Arc<Mesh>, physics: Physics, boundary: BoundaryConditions) -> Result<Self, FemError> {
        Self::with_cache(mesh, physics, boundary, &mut PatternCache::new())
    }

    /// Build with a shared pattern cache, so problems on the same mesh (load
    /// cases, physics variants of equal arity) reuse one pattern.
    pub fn with_cache(
        mesh: Arc<Mesh>,
        physics: Physics,
        boundary: BoundaryConditions,
        cache: &mut PatternCache,
    ) -> Result<Self, FemError> {
        let dofs = DofMap::new(mesh.num_nodes(), physics.arity(mesh.dim()));
        let pattern = cache.get_or_build(&mesh, &dofs)?;
        let tabulations: Vec<_> = mesh.blocks().iter().map(|b| ReferenceTabulation::new(b.kind)).collect();
        let geometry = map_geometry(&mesh, &tabulations)?;
        let compiled = CompiledBcs::compile(&boundary, &mesh, &dofs)?;

        tracing::debug!(
            physics = physics.name(),
            nodes = mesh.num_nodes(),
            elements = mesh.num_elements(),
            dofs = dofs.num_dofs(),
            constrained = compiled.dirichlet.len(),
            "problem built"
        );
        Ok(Self { mesh, physics, boundary, dofs, pattern, tabulations, geometry, compiled })
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    pub fn physics(&self) -> &Physics {
        &self.physics
    }

    pub fn boundary_conditions(&self) -> &BoundaryConditions {
        &self.boundary
    }

    pub fn compiled_bcs(&self) -> &CompiledBcs {
        &self.compiled
    }

    pub fn dofs(&self) -> &DofMap {
        &self.dofs
    }

    pub fn num_dofs(&self) -> usize {
        self.dofs.num_dofs()
    }

    pub fn pattern(&self) -> &Arc<SparsityPattern> {
        &self.pattern
    }

    pub fn tabulation(&self, block: usize) -> &ReferenceTabulation {
        &self.tabulations[block]
    }

    /// Mapped geometry of element `e` of `block`, computed once at build time.
    pub fn element_geometry(&self, block: usize, e: usize) -> &ElementGeometry {
        &self.geometry[block][e]
    }

    /// Resolve every coefficient and load magnitude against `params`.
    pub fn bind(&self, params: &ParamSet) -> Result<BoundParams, FemError> {
        params.validate(self.mesh.num_elements())?;
        let physics = self
            .physics
            .coefficients()
            .into_iter()
            .map(|r| r.resolve(params))
            .collect::<Result<Vec<_>, _>>()?;

        let mut loads = Vec::with_capacity(self.boundary.neumann.len());
        for load in &self.boundary.neumann {
            let slot = load.magnitude().resolve(params)?;
            if let Slot::Field(_) = slot {
                let name = load.magnitude();
                return Err(FemError::mismatch(
                    format!("load magnitude {name:?} (must be a global parameter)"),
                    1,
                    self.mesh.num_elements(),
                ));
            }
            loads.push(slot);
        }

        Ok(BoundParams { theta: params.flatten(), physics, loads })
    }

    pub fn solve(
        &self,
        params: &ParamSet,
        initial_guess: Option<&[f64]>,
        options: &SolverOptions,
    ) -> Result<SolutionState, FemError> {
        let bound = self.bind(params)?;
        let converged = NewtonSolver::new(self, options).solve(&bound, initial_guess)?;
        Ok(converged.state)
    }

    pub fn gradient(
        &self,
        params: &ParamSet,
        objective: &dyn Objective,
        options: &SolverOptions,
    ) -> Result<ParameterGradient, FemError> {
        gradients::value_and_gradient(self, params, objective, options)
    }

    pub fn hessian_vector_product(
        &self,
        params: &ParamSet,
        objective: &dyn Objective,
        direction: &[f64],
        options: &SolverOptions,
    ) -> Result<HessianVectorProduct, FemError> {
        gradients::hessian_vector_product(self, params, objective, direction, options)
    }
}

/// Solve R(u, θ) = 0 for the converged state.
pub fn solve(
    problem: &Problem,
    params: &ParamSet,
    initial_guess: Option<&[f64]>,
    options: &SolverOptions,
) -> Result<SolutionState, FemError> {
    problem.solve(params, initial_guess, options)
}

/// Objective value and d f / d θ through the adjoint.
pub fn gradient(
    problem: &Problem,
    params: &ParamSet,
    objective: &dyn Objective,
    options: &SolverOptions,
) -> Result<ParameterGradient, FemError> {
    problem.gradient(params, objective, options)
}

/// Map every element once; the mesh is immutable, so assembly passes reuse it.
fn map_geometry(mesh: &Mesh, tabulations: &[ReferenceTabulation]) -> Result<Vec<Vec<ElementGeometry>>, FemError> {
    mesh.blocks()
        .iter()
        .zip(tabulations)
        .enumerate()
        .map(|(b, (block, tab))| {
            (0..block.num_elements())
                .into_par_iter()
                .map(|e| {
                    let nodes: Vec<usize> = block.element(e).to_vec();
                    let coords = mesh.gather_coords(&nodes)?;
                    Ok(map_element(tab, coords.view(), mesh.global_element(b, e))?)
                })
                .collect::<Result<Vec<_>, FemError>>()
        })
        .collect()
}
