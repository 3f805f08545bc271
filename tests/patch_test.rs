//! Patch tests: fields in the element's polynomial space, prescribed on the
//! boundary, must be reproduced exactly at interior nodes, including on
//! distorted meshes.

mod common;

use common::*;
use dfem::*;
use proptest::prelude::*;
use std::sync::Arc;

fn distortion(amp: f64) -> impl Fn(f64, f64) -> (f64, f64) {
    move |x, y| (x + amp * (7.0 * x + 3.0 * y).sin(), y + amp * (5.0 * x - 2.0 * y).cos())
}

fn solve_with_boundary(mesh: Arc<Mesh>, physics: Physics, exact: impl Fn(&[f64]) -> Vec<f64>) -> (Problem, SolutionState) {
    let arity = physics.arity(mesh.dim());
    let mut bcs = BoundaryConditions::new();
    let boundary = if mesh.dim() == 1 {
        let last = mesh.nodes().iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        nodes_where(&mesh, |p| p[0] < 1e-12 || p[0] > last - 1e-12)
    } else {
        rectangle_boundary(&mesh, 1.0, 1.0)
    };
    for node in boundary {
        let values = exact(mesh.nodes().row(node).as_slice().unwrap());
        for (c, v) in values.into_iter().enumerate().take(arity) {
            bcs = bcs.fix(node, c, v);
        }
    }
    let problem = Problem::new(mesh, physics, bcs).unwrap();
    let state = solve(&problem, &ParamSet::new(), None, &SolverOptions::default()).unwrap();
    (problem, state)
}

fn assert_reproduces(problem: &Problem, state: &SolutionState, exact: impl Fn(&[f64]) -> Vec<f64>, tol: f64) {
    let nodes = problem.mesh().nodes();
    let arity = problem.dofs().arity();
    for node in 0..problem.mesh().num_nodes() {
        let expected = exact(nodes.row(node).as_slice().unwrap());
        for c in 0..arity {
            let got = state.values[node * arity + c];
            assert!(
                (got - expected[c]).abs() < tol,
                "node {node} component {c}: got {got}, expected {}",
                expected[c]
            );
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn elasticity_reproduces_linear_displacement(
        a in prop::array::uniform3(-1.0f64..1.0),
        b in prop::array::uniform3(-1.0f64..1.0),
        nu in 0.0f64..0.45,
        amp in 0.0f64..0.03,
        tri in any::<bool>(),
    ) {
        let kind = if tri { ElementKind::Tri3 } else { ElementKind::Quad4 };
        let mesh = rectangle_with(4, 4, 1.0, 1.0, kind, distortion(amp));
        let exact = move |p: &[f64]| vec![a[0] + a[1] * p[0] + a[2] * p[1], b[0] + b[1] * p[0] + b[2] * p[1]];
        let (problem, state) = solve_with_boundary(mesh, Physics::Elasticity(LinearElasticity::new(1.0, nu)), exact);
        assert_reproduces(&problem, &state, exact, 1e-9);
    }

    #[test]
    fn heat_reproduces_linear_temperature(
        c in prop::array::uniform3(-1.0f64..1.0),
        amp in 0.0f64..0.03,
        tri in any::<bool>(),
    ) {
        let kind = if tri { ElementKind::Tri3 } else { ElementKind::Quad4 };
        let mesh = rectangle_with(3, 5, 1.0, 1.0, kind, distortion(amp));
        let exact = move |p: &[f64]| vec![c[0] + c[1] * p[0] + c[2] * p[1]];
        let (problem, state) = solve_with_boundary(mesh, Physics::Heat(NonlinearHeat::new(2.5)), exact);
        assert_reproduces(&problem, &state, exact, 1e-10);
    }

    #[test]
    fn tri6_reproduces_quadratic_temperature(c in prop::array::uniform6(-1.0f64..1.0)) {
        // −Δu = −2 (c3 + c5) is constant.
        let source = -2.0 * (c[3] + c[5]);
        let exact = move |p: &[f64]| {
            let (x, y) = (p[0], p[1]);
            vec![c[0] + c[1] * x + c[2] * y + c[3] * x * x + c[4] * x * y + c[5] * y * y]
        };
        let mesh = rectangle(3, 3, 1.0, 1.0, ElementKind::Tri6);
        let physics = Physics::Heat(NonlinearHeat::new(1.0).with_source(source));
        let (problem, state) = solve_with_boundary(mesh, physics, exact);
        assert_reproduces(&problem, &state, exact, 1e-10);
    }

    #[test]
    fn line3_reproduces_quadratic_temperature(c in prop::array::uniform3(-1.0f64..1.0), k in 0.5f64..3.0) {
        let exact = move |p: &[f64]| vec![c[0] + c[1] * p[0] + c[2] * p[0] * p[0]];
        let mesh = interval(4, 1.5, ElementKind::Line3);
        let physics = Physics::Heat(NonlinearHeat::new(k).with_source(-2.0 * k * c[2]));
        let (problem, state) = solve_with_boundary(mesh, physics, exact);
        assert_reproduces(&problem, &state, exact, 1e-10);
    }

    #[test]
    fn jacobian_structure_matches_cached_pattern(e in 0.5f64..5.0, nu in 0.0f64..0.45, amp in 0.0f64..0.03) {
        let mesh = rectangle_with(3, 2, 1.0, 1.0, ElementKind::Quad4, distortion(amp));
        let physics = Physics::Elasticity(LinearElasticity::new("E", nu));
        let problem = Problem::new(mesh, physics, BoundaryConditions::new()).unwrap();
        let params = ParamSet::new().with_global("E", e);
        let state = vec![0.01; problem.num_dofs()];
        let (_, jacobian) = dfem::assembly::assemble(&problem, &state, &params).unwrap();
        prop_assert!(problem.pattern().same_structure(&jacobian));
        prop_assert_eq!(jacobian.nnz(), problem.pattern().nnz());
    }
}
