//! Global assembly: residual R(u, θ) = F_int(u, θ) − F_ext(θ), its Jacobian,
//! and the parameter derivatives the adjoint needs.
//!
//! Element-local work runs as a `rayon` parallel map per block; results are
//! scattered sequentially in element order through the precomputed
//! element → nonzero maps, so sums are reproducible bit for bit.

use crate::element::ElementGeometry;
use crate::params::{BoundParams, ParamSet};
use crate::problem::Problem;
use crate::types::FemError;
use num_dual::{Dual64, HyperDual64};
use rayon::prelude::*;
use sprs::CsMat;
use std::time::Instant;

// ─────────────────────────────────────────────────────────────
//  Workspace
// ─────────────────────────────────────────────────────────────

/// Residual and Jacobian buffers reused across Newton iterations.
#[derive(Debug, Clone)]
pub struct SystemCache {
    pub residual: Vec<f64>,
    /// Pattern-fixed CSC matrix; only `data` changes.
    pub jacobian: CsMat<f64>,
    /// Penalty coefficient of the last Dirichlet application.
    pub penalty: f64,
}

impl SystemCache {
    pub fn new(problem: &Problem) -> Self {
        Self {
            residual: vec![0.0; problem.num_dofs()],
            jacobian: problem.pattern().zeros(),
            penalty: 1.0,
        }
    }
}

/// Everything an element kernel needs, gathered once per element.
struct ElementWork<'p> {
    block: usize,
    /// Index inside the block.
    local: usize,
    dofs: Vec<usize>,
    geometry: &'p ElementGeometry,
    coeffs: Vec<f64>,
    indices: Vec<Option<usize>>,
}

impl ElementWork<'_> {
    fn gather(&self, v: &[f64]) -> Vec<f64> {
        self.dofs.iter().map(|&d| v[d]).collect()
    }
}

fn element_work<'p>(problem: &'p Problem, bound: &BoundParams, block: usize, e: usize) -> ElementWork<'p> {
    let mesh = problem.mesh();
    let element = mesh.global_element(block, e);
    let nodes: Vec<usize> = mesh.blocks()[block].element(e).to_vec();
    let geometry = problem.element_geometry(block, e);
    let mut dofs = Vec::with_capacity(nodes.len() * problem.dofs().arity());
    problem.dofs().element_dofs(&nodes, &mut dofs);
    let (coeffs, indices) = bound.element_locals(element);
    ElementWork { block, local: e, dofs, geometry, coeffs, indices }
}

/// Run `f` on every element of every block, in parallel within a block,
/// returning results in (block, element) order.
fn map_elements<'p, R, F>(problem: &'p Problem, bound: &BoundParams, f: F) -> Vec<(ElementWork<'p>, R)>
where
    R: Send,
    F: Fn(&ElementWork<'p>) -> R + Sync,
{
    let mut out = Vec::with_capacity(problem.mesh().num_elements());
    for (b, block) in problem.mesh().blocks().iter().enumerate() {
        let results = (0..block.num_elements())
            .into_par_iter()
            .map(|e| {
                let work = element_work(problem, bound, b, e);
                let r = f(&work);
                (work, r)
            })
            .collect::<Vec<_>>();
        out.extend(results);
    }
    out
}

// ─────────────────────────────────────────────────────────────
//  Local kernels
// ─────────────────────────────────────────────────────────────

/// Local residual and row-major local Jacobian (`n × n`) via one `Dual64`
/// pass per local DOF.
fn local_system(problem: &Problem, work: &ElementWork, u: &[f64], with_jacobian: bool) -> (Vec<f64>, Vec<f64>) {
    let n = work.dofs.len();
    let physics = problem.physics();
    let u_local = work.gather(u);

    if !with_jacobian {
        let mut r = vec![0.0; n];
        physics.element_residual(work.geometry, &u_local, &work.coeffs, &mut r);
        return (r, Vec::new());
    }

    let coeffs: Vec<Dual64> = work.coeffs.iter().map(|&c| Dual64::from(c)).collect();
    let mut ud: Vec<Dual64> = u_local.iter().map(|&v| Dual64::from(v)).collect();
    let mut out = vec![Dual64::from(0.0); n];
    let mut r = vec![0.0; n];
    let mut k = vec![0.0; n * n];

    for j in 0..n {
        ud[j].eps = 1.0;
        out.iter_mut().for_each(|o| *o = Dual64::from(0.0));
        physics.element_residual(work.geometry, &ud, &coeffs, &mut out);
        ud[j].eps = 0.0;
        for i in 0..n {
            k[i * n + j] = out[i].eps;
            if j == 0 {
                r[i] = out[i].re;
            }
        }
    }
    (r, k)
}

/// ∂R_e/∂θ contracted with a per-coefficient seed vector.
fn local_param_tangent(problem: &Problem, work: &ElementWork, u: &[f64], seeds: &[f64]) -> Vec<f64> {
    let n = work.dofs.len();
    let ud: Vec<Dual64> = work.gather(u).into_iter().map(Dual64::from).collect();
    let coeffs: Vec<Dual64> = work.coeffs.iter().zip(seeds).map(|(&c, &s)| Dual64::new(c, s)).collect();
    let mut out = vec![Dual64::from(0.0); n];
    problem.physics().element_residual(work.geometry, &ud, &coeffs, &mut out);
    out.iter().map(|o| o.eps).collect()
}

// ─────────────────────────────────────────────────────────────
//  Residual and Jacobian
// ─────────────────────────────────────────────────────────────

/// Assemble R(u, θ) (and J = ∂R/∂u when `with_jacobian`) into `cache`.
/// Boundary conditions are not applied here.
pub fn assemble_into(
    problem: &Problem,
    cache: &mut SystemCache,
    u: &[f64],
    bound: &BoundParams,
    with_jacobian: bool,
) -> Result<(), FemError> {
    if u.len() != problem.num_dofs() {
        return Err(FemError::mismatch("state vector", problem.num_dofs(), u.len()));
    }
    let locals = map_elements(problem, bound, |w| local_system(problem, w, u, with_jacobian));

    cache.residual.iter_mut().for_each(|v| *v = 0.0);
    if with_jacobian {
        cache.jacobian.data_mut().iter_mut().for_each(|v| *v = 0.0);
    }
    let pattern = problem.pattern();

    for (work, (r, k)) in &locals {
        for (i, &d) in work.dofs.iter().enumerate() {
            cache.residual[d] += r[i];
        }
        if with_jacobian {
            let nz = pattern.block(work.block).element(work.local);
            let data = cache.jacobian.data_mut();
            for (idx, &v) in nz.iter().zip(k) {
                data[*idx] += v;
            }
        }
    }

    let f_ext = external_load(problem, bound);
    for (r, f) in cache.residual.iter_mut().zip(&f_ext) {
        *r -= f;
    }
    Ok(())
}

/// Residual only, without boundary conditions.
pub fn residual(problem: &Problem, u: &[f64], bound: &BoundParams) -> Result<Vec<f64>, FemError> {
    let mut cache = SystemCache {
        residual: vec![0.0; problem.num_dofs()],
        jacobian: CsMat::zero((0, 0)),
        penalty: 1.0,
    };
    assemble_into(problem, &mut cache, u, bound, false)?;
    Ok(cache.residual)
}

/// Residual and Jacobian at `state` for `params`, before boundary conditions.
pub fn assemble(problem: &Problem, state: &[f64], params: &ParamSet) -> Result<(Vec<f64>, CsMat<f64>), FemError> {
    let bound = problem.bind(params)?;
    let mut cache = SystemCache::new(problem);
    assemble_into(problem, &mut cache, state, &bound, true)?;
    Ok((cache.residual, cache.jacobian))
}

// ─────────────────────────────────────────────────────────────
//  External loads
// ─────────────────────────────────────────────────────────────

/// F_ext(θ).
pub fn external_load(problem: &Problem, bound: &BoundParams) -> Vec<f64> {
    let mut f = vec![0.0; problem.num_dofs()];
    for (l, term) in problem.compiled_bcs().loads.iter().enumerate() {
        let m = bound.load_value(l);
        for (&d, &w) in term.dofs.iter().zip(&term.weights) {
            f[d] += m * w;
        }
    }
    f
}

/// ∂F_ext/∂θ · θ̂.
pub fn external_load_jvp(problem: &Problem, bound: &BoundParams, theta_dot: &[f64]) -> Vec<f64> {
    let mut f = vec![0.0; problem.num_dofs()];
    for (l, term) in problem.compiled_bcs().loads.iter().enumerate() {
        if let Some(idx) = bound.load_index(l) {
            for (&d, &w) in term.dofs.iter().zip(&term.weights) {
                f[d] += theta_dot[idx] * w;
            }
        }
    }
    f
}

/// vᵀ ∂F_ext/∂θ.
pub fn external_load_vjp(problem: &Problem, bound: &BoundParams, v: &[f64]) -> Vec<f64> {
    let mut g = vec![0.0; bound.len()];
    for (l, term) in problem.compiled_bcs().loads.iter().enumerate() {
        if let Some(idx) = bound.load_index(l) {
            g[idx] += term.dofs.iter().zip(&term.weights).map(|(&d, &w)| v[d] * w).sum::<f64>();
        }
    }
    g
}

// ─────────────────────────────────────────────────────────────
//  Parameter derivatives
// ─────────────────────────────────────────────────────────────

/// λᵀ ∂R/∂θ, length |θ|.
pub fn residual_param_vjp(problem: &Problem, u: &[f64], bound: &BoundParams, lambda: &[f64]) -> Result<Vec<f64>, FemError> {
    let contributions = map_elements(problem, bound, |w| {
        let lam = w.gather(lambda);
        let mut seeds = vec![0.0; w.coeffs.len()];
        let mut out = Vec::new();
        for (s, idx) in w.indices.iter().enumerate() {
            let Some(idx) = *idx else { continue };
            seeds[s] = 1.0;
            let dr = local_param_tangent(problem, w, u, &seeds);
            seeds[s] = 0.0;
            out.push((idx, lam.iter().zip(&dr).map(|(l, d)| l * d).sum::<f64>()));
        }
        out
    });

    let mut grad = vec![0.0; bound.len()];
    for (_, terms) in &contributions {
        for &(idx, v) in terms {
            grad[idx] += v;
        }
    }
    for (g, l) in grad.iter_mut().zip(external_load_vjp(problem, bound, lambda)) {
        *g -= l;
    }
    Ok(grad)
}

/// ∂R/∂θ · θ̂, length n_dof.
pub fn residual_param_jvp(problem: &Problem, u: &[f64], bound: &BoundParams, theta_dot: &[f64]) -> Result<Vec<f64>, FemError> {
    if theta_dot.len() != bound.len() {
        return Err(FemError::mismatch("parameter direction", bound.len(), theta_dot.len()));
    }
    let tangents = map_elements(problem, bound, |w| {
        let seeds: Vec<f64> = w.indices.iter().map(|i| i.map_or(0.0, |i| theta_dot[i])).collect();
        if seeds.iter().all(|&s| s == 0.0) {
            return None;
        }
        Some(local_param_tangent(problem, w, u, &seeds))
    });

    let mut out = vec![0.0; problem.num_dofs()];
    for (work, t) in &tangents {
        if let Some(t) = t {
            for (&d, v) in work.dofs.iter().zip(t) {
                out[d] += v;
            }
        }
    }
    for (o, f) in out.iter_mut().zip(external_load_jvp(problem, bound, theta_dot)) {
        *o -= f;
    }
    Ok(out)
}

/// Second derivatives of λ·R contracted with the direction (û, θ̂).
#[derive(Debug, Clone)]
pub struct SecondOrder {
    /// [∂²(λ·R)/∂u∂u] û + [∂²(λ·R)/∂u∂θ] θ̂
    pub state: Vec<f64>,
    /// [∂²(λ·R)/∂θ∂u] û + [∂²(λ·R)/∂θ∂θ] θ̂
    pub params: Vec<f64>,
}

/// Hyper-dual evaluation: ε₁ selects the differentiated coordinate, ε₂
/// carries the direction, and the ε₁ε₂ part of λ·R_e is the contracted
/// second derivative.  F_ext is linear in θ and independent of u, so loads
/// contribute nothing here.
pub fn residual_second_order(
    problem: &Problem,
    u: &[f64],
    bound: &BoundParams,
    lambda: &[f64],
    u_dot: &[f64],
    theta_dot: &[f64],
) -> Result<SecondOrder, FemError> {
    let start = Instant::now();
    let physics = problem.physics();

    let locals = map_elements(problem, bound, |w| {
        let n = w.dofs.len();
        let u_local = w.gather(u);
        let du_local = w.gather(u_dot);
        let lam = w.gather(lambda);
        let dc: Vec<f64> = w.indices.iter().map(|i| i.map_or(0.0, |i| theta_dot[i])).collect();

        let eval = |seed_u: Option<usize>, seed_c: Option<usize>| -> f64 {
            let ud: Vec<HyperDual64> = (0..n)
                .map(|i| HyperDual64::new(u_local[i], if seed_u == Some(i) { 1.0 } else { 0.0 }, du_local[i], 0.0))
                .collect();
            let cd: Vec<HyperDual64> = (0..w.coeffs.len())
                .map(|s| HyperDual64::new(w.coeffs[s], if seed_c == Some(s) { 1.0 } else { 0.0 }, dc[s], 0.0))
                .collect();
            let mut out = vec![HyperDual64::from(0.0); n];
            physics.element_residual(w.geometry, &ud, &cd, &mut out);
            lam.iter().zip(&out).map(|(l, o)| l * o.eps1eps2).sum()
        };

        let state: Vec<f64> = (0..n).map(|k| eval(Some(k), None)).collect();
        let params: Vec<(usize, f64)> = w
            .indices
            .iter()
            .enumerate()
            .filter_map(|(s, idx)| idx.map(|idx| (idx, eval(None, Some(s)))))
            .collect();
        (state, params)
    });

    let mut out = SecondOrder { state: vec![0.0; problem.num_dofs()], params: vec![0.0; bound.len()] };
    for (work, (state, params)) in &locals {
        for (&d, v) in work.dofs.iter().zip(state) {
            out.state[d] += v;
        }
        for &(idx, v) in params {
            out.params[idx] += v;
        }
    }
    tracing::debug!(elapsed_ms = start.elapsed().as_secs_f64() * 1e3, "second-order residual terms");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bc::BoundaryConditions;
    use crate::element::ElementKind;
    use crate::mesh::Mesh;
    use crate::physics::{LinearElasticity, NonlinearHeat, Physics};
    use approx::assert_relative_eq;
    use ndarray::array;
    use std::sync::Arc;

    fn bar(n: usize) -> Arc<Mesh> {
        let nodes = ndarray::Array2::from_shape_fn((n + 1, 1), |(i, _)| i as f64 / n as f64);
        let conn = ndarray::Array2::from_shape_fn((n, 2), |(e, a)| e + a);
        Arc::new(Mesh::single(nodes, ElementKind::Line2, conn).unwrap())
    }

    #[test]
    fn bar_jacobian_is_tridiagonal_stiffness() {
        let physics = Physics::Elasticity(LinearElasticity::new("E", 0.0));
        let problem = Problem::new(bar(2), physics, BoundaryConditions::new()).unwrap();
        let params = ParamSet::new().with_global("E", 3.0);
        let (r, k) = assemble(&problem, &[0.0; 3], &params).unwrap();
        assert_eq!(r, vec![0.0; 3]);
        // EA/h = 3 / 0.5
        assert_relative_eq!(*k.get(0, 0).unwrap(), 6.0, epsilon = 1e-12);
        assert_relative_eq!(*k.get(1, 1).unwrap(), 12.0, epsilon = 1e-12);
        assert_relative_eq!(*k.get(1, 2).unwrap(), -6.0, epsilon = 1e-12);
        assert!(problem.pattern().same_structure(&k));
    }

    #[test]
    fn loads_enter_with_negative_sign() {
        let physics = Physics::Elasticity(LinearElasticity::new(1.0, 0.0));
        let bcs = BoundaryConditions::new().point_load(2, 0, "P");
        let problem = Problem::new(bar(2), physics, bcs).unwrap();
        let bound = problem.bind(&ParamSet::new().with_global("P", 5.0)).unwrap();
        let r = residual(&problem, &[0.0; 3], &bound).unwrap();
        assert_eq!(r, vec![0.0, 0.0, -5.0]);
    }

    #[test]
    fn param_vjp_matches_finite_differences() {
        let physics = Physics::Heat(NonlinearHeat::new("k").with_nonlinearity(0.3).with_source("s"));
        let mesh = Arc::new(
            Mesh::single(
                array![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]],
                ElementKind::Quad4,
                array![[0, 1, 2, 3]],
            )
            .unwrap(),
        );
        let problem = Problem::new(mesh, physics, BoundaryConditions::new()).unwrap();
        let params = ParamSet::new().with_global("k", 1.5).with_field("s", vec![2.0]);
        let bound = problem.bind(&params).unwrap();
        let u = [0.1, 0.4, -0.2, 0.3];
        let lambda = [1.0, -0.5, 0.25, 2.0];

        let grad = residual_param_vjp(&problem, &u, &bound, &lambda).unwrap();
        let h = 1e-6;
        for i in 0..bound.len() {
            let mut tp = bound.theta.clone();
            let mut tm = bound.theta.clone();
            tp[i] += h;
            tm[i] -= h;
            let rp = residual(&problem, &u, &bound.with_theta(&tp).unwrap()).unwrap();
            let rm = residual(&problem, &u, &bound.with_theta(&tm).unwrap()).unwrap();
            let fd: f64 = (0..4).map(|d| lambda[d] * (rp[d] - rm[d]) / (2.0 * h)).sum();
            assert_relative_eq!(grad[i], fd, epsilon = 1e-6);
        }

        let dir = [0.7, -1.3];
        let jvp = residual_param_jvp(&problem, &u, &bound, &dir).unwrap();
        let contracted: f64 = jvp.iter().zip(&lambda).map(|(a, b)| a * b).sum();
        let expected: f64 = grad.iter().zip(&dir).map(|(a, b)| a * b).sum();
        assert_relative_eq!(contracted, expected, epsilon = 1e-10);
    }

    #[test]
    fn second_order_state_block_matches_jacobian_difference() {
        let physics = Physics::Heat(NonlinearHeat::new(1.0).with_nonlinearity(0.8));
        let problem = Problem::new(bar(3), physics, BoundaryConditions::new()).unwrap();
        let bound = problem.bind(&ParamSet::new()).unwrap();
        let u = [0.2, 0.5, 0.1, -0.3];
        let lambda = [0.3, -1.0, 0.5, 1.0];
        let du = [1.0, 0.5, -0.5, 0.2];

        let so = residual_second_order(&problem, &u, &bound, &lambda, &du, &[]).unwrap();

        // d/dt [Jᵀ λ](u + t û)
        let h = 1e-6;
        let jt_lambda = |state: &[f64]| -> Vec<f64> {
            let mut cache = SystemCache::new(&problem);
            assemble_into(&problem, &mut cache, state, &bound, true).unwrap();
            let mut out = vec![0.0; 4];
            for (&v, (i, j)) in cache.jacobian.iter() {
                out[j] += v * lambda[i];
            }
            out
        };
        let up: Vec<f64> = u.iter().zip(&du).map(|(a, b)| a + h * b).collect();
        let um: Vec<f64> = u.iter().zip(&du).map(|(a, b)| a - h * b).collect();
        let (gp, gm) = (jt_lambda(&up), jt_lambda(&um));
        for k in 0..4 {
            assert_relative_eq!(so.state[k], (gp[k] - gm[k]) / (2.0 * h), epsilon = 1e-6);
        }
    }

    #[test]
    fn parallel_assembly_is_deterministic() {
        let physics = Physics::Heat(NonlinearHeat::new(2.0).with_nonlinearity(0.5).with_source(1.0));
        let problem = Problem::new(bar(64), physics, BoundaryConditions::new()).unwrap();
        let params = ParamSet::new();
        let u: Vec<f64> = (0..65).map(|i| (i as f64 * 0.37).sin()).collect();
        let (r1, k1) = assemble(&problem, &u, &params).unwrap();
        let (r2, k2) = assemble(&problem, &u, &params).unwrap();
        assert_eq!(r1, r2);
        assert_eq!(k1.data(), k2.data());
    }
}
