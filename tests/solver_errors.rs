//! Every failure mode surfaces as a typed `FemError`; nothing panics or
//! retries silently.

mod common;

use common::*;
use dfem::*;
use ndarray::array;
use std::sync::Arc;

fn heat_rod(n: usize, beta: f64) -> Problem {
    let mesh = interval(n, 1.0, ElementKind::Line2);
    let physics = Physics::Heat(NonlinearHeat::new(1.0).with_nonlinearity(beta).with_source(10.0));
    let bcs = BoundaryConditions::new().fix(0, 0, 0.0).fix(n, 0, 0.0);
    Problem::new(mesh, physics, bcs).unwrap()
}

// ─────────────────────────────────────────────────────────────
//  Linear and nonlinear solver failures
// ─────────────────────────────────────────────────────────────

#[test]
fn isolated_node_is_a_singular_system() {
    // Node 3 belongs to no element and carries no constraint.
    let nodes = array![[0.0], [1.0], [2.0], [3.0]];
    let mesh = Arc::new(Mesh::single(nodes, ElementKind::Line2, array![[0, 1], [1, 2]]).unwrap());
    let bcs = BoundaryConditions::new().fix(0, 0, 0.0).point_load(2, 0, 1.0);
    let problem = Problem::new(mesh, Physics::Heat(NonlinearHeat::new(1.0)), bcs).unwrap();

    let err = solve(&problem, &ParamSet::new(), None, &SolverOptions::default()).unwrap_err();
    assert!(matches!(err, FemError::SingularSystem { .. }), "{err}");
    assert!(err.to_string().starts_with("singular system"));
}

#[test]
fn krylov_iteration_cap_is_reported() {
    let problem = heat_rod(40, 0.0);
    let options = SolverOptions::default().with_linear_solver(LinearSolverKind::Iterative(IterativeOptions {
        method: KrylovMethod::ConjugateGradient,
        tolerance: 1e-12,
        max_iterations: 3,
    }));
    let err = solve(&problem, &ParamSet::new(), None, &options).unwrap_err();
    match err {
        FemError::IterativeDivergence { method, iterations, tolerance, .. } => {
            assert_eq!(method, "CG");
            assert_eq!(iterations, 3);
            assert_eq!(tolerance, 1e-12);
        }
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn newton_iteration_cap_is_reported() {
    let problem = heat_rod(20, 3.0);
    let options = SolverOptions::default().with_max_iterations(2);
    let err = solve(&problem, &ParamSet::new(), None, &options).unwrap_err();
    match err {
        FemError::Convergence { iterations, residual_norm, relative } => {
            assert_eq!(iterations, 2);
            assert!(residual_norm > 0.0 && residual_norm.is_finite());
            assert!(relative > 1e-10);
        }
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn adjoint_propagates_forward_failure() {
    let problem = heat_rod(20, 3.0);
    let options = SolverOptions::default().with_max_iterations(1);
    let err = gradient(&problem, &ParamSet::new(), &DofValue::single(10), &options).unwrap_err();
    assert!(matches!(err, FemError::Convergence { iterations: 1, .. }));
}

// ─────────────────────────────────────────────────────────────
//  Shape and name errors
// ─────────────────────────────────────────────────────────────

#[test]
fn dimension_mismatches_are_reported() {
    let problem = heat_rod(4, 0.0);
    let options = SolverOptions::default();

    let err = solve(&problem, &ParamSet::new(), Some(&[0.0; 3]), &options).unwrap_err();
    assert!(matches!(err, FemError::DimensionMismatch { expected: 5, found: 3, .. }));

    let physics = Physics::Heat(NonlinearHeat::new("k"));
    let field = Problem::new(interval(4, 1.0, ElementKind::Line2), physics, BoundaryConditions::new().fix(0, 0, 0.0))
        .unwrap();
    let err = solve(&field, &ParamSet::new().with_field("k", vec![1.0; 3]), None, &options).unwrap_err();
    assert!(matches!(err, FemError::DimensionMismatch { expected: 4, found: 3, .. }), "{err}");

    let err = hessian_vector_product(
        &field,
        &ParamSet::new().with_field("k", vec![1.0; 4]),
        &DofValue::single(2),
        &[1.0; 2],
        &options,
    )
    .unwrap_err();
    assert!(matches!(err, FemError::DimensionMismatch { expected: 4, found: 2, .. }));
}

#[test]
fn unknown_parameter_is_named() {
    let physics = Physics::Elasticity(LinearElasticity::new("E", "nu"));
    let problem = Problem::new(interval(2, 1.0, ElementKind::Line2), physics, BoundaryConditions::new()).unwrap();
    let err = solve(&problem, &ParamSet::new().with_global("E", 1.0), None, &SolverOptions::default()).unwrap_err();
    assert!(matches!(&err, FemError::UnknownParameter(name) if name == "nu"));
    assert_eq!(err.to_string(), "unknown parameter `nu`");
}

#[test]
fn objective_with_bad_dof_is_rejected_before_solving() {
    let problem = heat_rod(4, 0.0);
    let err = gradient(&problem, &ParamSet::new(), &DofValue::single(5), &SolverOptions::default()).unwrap_err();
    assert!(matches!(err, FemError::Mesh(MeshError::InvalidDof { dof: 5, num_dofs: 5 })));
}

#[test]
fn hessian_of_first_order_closure_is_refused() {
    let problem = heat_rod(4, 0.5);
    let objective = FnObjective::new("u2^2", |u, _| u[2] * u[2], |u, _, gu, _| gu[2] += 2.0 * u[2]);
    let err = hessian_vector_product(&problem, &ParamSet::new(), &objective, &[], &SolverOptions::default())
        .unwrap_err();
    assert!(matches!(&err, FemError::MissingSecondOrder(name) if name.contains("u2^2")), "{err}");

    // Same objective with its curvature supplied.
    let objective = FnObjective::new("u2^2", |u, _| u[2] * u[2], |u, _, gu, _| gu[2] += 2.0 * u[2])
        .with_hessian(|_, _, ud, _, hu, _| hu[2] += 2.0 * ud[2]);
    let out = hessian_vector_product(&problem, &ParamSet::new(), &objective, &[], &SolverOptions::default()).unwrap();
    assert!(out.hvp.is_empty());
    assert!(out.value > 0.0);
}

// ─────────────────────────────────────────────────────────────
//  Mesh and boundary-condition validation
// ─────────────────────────────────────────────────────────────

#[test]
fn bad_meshes_are_rejected() {
    let err = Mesh::single(array![[0.0], [1.0]], ElementKind::Line2, array![[0, 2]]).unwrap_err();
    assert_eq!(err, MeshError::NodeOutOfRange { element: 0, node: 2, num_nodes: 2 });

    let err = ElementBlock::from_flat(ElementKind::Tri3, vec![0, 1, 2, 3]).unwrap_err();
    assert!(matches!(err, MeshError::WrongNodeCount { expected: 3, .. }));

    // Clockwise triangle.
    let nodes = array![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]];
    let err = Mesh::single(nodes.clone(), ElementKind::Tri3, array![[0, 2, 1]]).unwrap_err();
    assert!(matches!(err, MeshError::DegenerateElement { element: 0, .. }));

    let err = Mesh::single(nodes, ElementKind::Line2, array![[0, 1]]).unwrap_err();
    assert!(matches!(err, MeshError::IncompatibleElement { dim: 2, .. }));

    let err = Mesh::new(ndarray::Array2::zeros((0, 2)), vec![]).unwrap_err();
    assert_eq!(err, MeshError::EmptyMesh);

    let err = Mesh::new(ndarray::Array2::zeros((3, 3)), vec![]).unwrap_err();
    assert_eq!(err, MeshError::UnsupportedDimension(3));
}

#[test]
fn boundary_condition_on_missing_node_is_rejected() {
    let bcs = BoundaryConditions::new().fix(9, 0, 0.0);
    let err = Problem::new(interval(2, 1.0, ElementKind::Line2), Physics::Heat(NonlinearHeat::new(1.0)), bcs).unwrap_err();
    assert!(matches!(err, FemError::Mesh(MeshError::InvalidDof { .. })));

    let bcs = BoundaryConditions::new().traction(ElementKind::Line2, vec![0, 1, 2], 0, 1.0);
    let err = Problem::new(rectangle(1, 1, 1.0, 1.0, ElementKind::Quad4), Physics::Heat(NonlinearHeat::new(1.0)), bcs)
        .unwrap_err();
    assert!(matches!(err, FemError::Mesh(MeshError::WrongNodeCount { expected: 2, found: 3, .. })));
}
