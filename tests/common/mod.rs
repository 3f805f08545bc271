//! Mesh builders and finite-difference helpers shared by the integration
//! tests.

#![allow(dead_code)]

use dfem::{ElementKind, Mesh, Objective, ParamSet, Problem, SolverOptions};
use ndarray::Array2;
use std::sync::Arc;

// ─────────────────────────────────────────────────────────────
//  Meshes
// ─────────────────────────────────────────────────────────────

/// Segment [0, length] split into `n` Line2 or Line3 elements.
/// Line3 nodes are numbered along x, so element e is [2e, 2e+2, 2e+1].
pub fn interval(n: usize, length: f64, kind: ElementKind) -> Arc<Mesh> {
    let (num_nodes, conn) = match kind {
        ElementKind::Line2 => (n + 1, Array2::from_shape_fn((n, 2), |(e, a)| e + a)),
        ElementKind::Line3 => (
            2 * n + 1,
            Array2::from_shape_fn((n, 3), |(e, a)| match a {
                0 => 2 * e,
                1 => 2 * e + 2,
                _ => 2 * e + 1,
            }),
        ),
        other => panic!("interval mesh cannot use {other:?}"),
    };
    let h = length / (num_nodes - 1) as f64;
    let nodes = Array2::from_shape_fn((num_nodes, 1), |(i, _)| i as f64 * h);
    Arc::new(Mesh::single(nodes, kind, conn).unwrap())
}

/// Rectangle [0, w] × [0, h] with `nx × ny` cells of Quad4, or two Tri3 /
/// Tri6 per cell.  Nodes are numbered row by row from the origin.
pub fn rectangle(nx: usize, ny: usize, w: f64, h: f64, kind: ElementKind) -> Arc<Mesh> {
    rectangle_with(nx, ny, w, h, kind, |x, y| (x, y))
}

/// As [`rectangle`], with `map` applied to every node that is not on the
/// outer boundary (interior distortion for patch tests).
pub fn rectangle_with(
    nx: usize,
    ny: usize,
    w: f64,
    h: f64,
    kind: ElementKind,
    map: impl Fn(f64, f64) -> (f64, f64),
) -> Arc<Mesh> {
    // Quadratic triangles live on the half-spacing grid.
    let s = if kind == ElementKind::Tri6 { 2 } else { 1 };
    let (gx, gy) = (s * nx + 1, s * ny + 1);
    let id = |i: usize, j: usize| j * gx + i;

    let mut nodes = Array2::zeros((gx * gy, 2));
    for j in 0..gy {
        for i in 0..gx {
            let (x, y) = (w * i as f64 / (gx - 1) as f64, h * j as f64 / (gy - 1) as f64);
            let interior = i > 0 && j > 0 && i + 1 < gx && j + 1 < gy;
            let (x, y) = if interior { map(x, y) } else { (x, y) };
            nodes[[id(i, j), 0]] = x;
            nodes[[id(i, j), 1]] = y;
        }
    }

    let mut flat = Vec::new();
    for cj in 0..ny {
        for ci in 0..nx {
            let (i, j) = (s * ci, s * cj);
            match kind {
                ElementKind::Quad4 => flat.extend([id(i, j), id(i + 1, j), id(i + 1, j + 1), id(i, j + 1)]),
                ElementKind::Tri3 => {
                    flat.extend([id(i, j), id(i + 1, j), id(i + 1, j + 1)]);
                    flat.extend([id(i, j), id(i + 1, j + 1), id(i, j + 1)]);
                }
                ElementKind::Tri6 => {
                    flat.extend([
                        id(i, j),
                        id(i + 2, j),
                        id(i + 2, j + 2),
                        id(i + 1, j),
                        id(i + 2, j + 1),
                        id(i + 1, j + 1),
                    ]);
                    flat.extend([
                        id(i, j),
                        id(i + 2, j + 2),
                        id(i, j + 2),
                        id(i + 1, j + 1),
                        id(i + 1, j + 2),
                        id(i, j + 1),
                    ]);
                }
                other => panic!("rectangle mesh cannot use {other:?}"),
            }
        }
    }
    let block = dfem::ElementBlock::from_flat(kind, flat).unwrap();
    Arc::new(Mesh::new(nodes, vec![block]).unwrap())
}

/// Nodes whose coordinates satisfy `pred`.
pub fn nodes_where(mesh: &Mesh, pred: impl Fn(&[f64]) -> bool) -> Vec<usize> {
    let nodes = mesh.nodes();
    (0..mesh.num_nodes())
        .filter(|&i| pred(nodes.row(i).as_slice().unwrap()))
        .collect()
}

/// Nodes on the outer boundary of the rectangle [0, w] × [0, h].
pub fn rectangle_boundary(mesh: &Mesh, w: f64, h: f64) -> Vec<usize> {
    let eps = 1e-12;
    nodes_where(mesh, |p| p[0] < eps || p[1] < eps || p[0] > w - eps || p[1] > h - eps)
}

// ─────────────────────────────────────────────────────────────
//  Finite differences
// ─────────────────────────────────────────────────────────────

/// Tight Newton tolerances so finite differences see converged states.
pub fn tight_options() -> SolverOptions {
    SolverOptions {
        relative_tolerance: 1e-11,
        absolute_tolerance: 1e-14,
        max_iterations: 40,
        ..SolverOptions::default()
    }
}

pub fn objective_value(problem: &Problem, params: &ParamSet, objective: &dyn Objective, options: &SolverOptions) -> f64 {
    dfem::gradient(problem, params, objective, options).unwrap().value
}

/// Central differences of the objective along every θ component.
pub fn fd_gradient(
    problem: &Problem,
    params: &ParamSet,
    objective: &dyn Objective,
    options: &SolverOptions,
    h: f64,
) -> Vec<f64> {
    let theta = params.flatten();
    (0..theta.len())
        .map(|i| {
            let mut plus = theta.clone();
            let mut minus = theta.clone();
            plus[i] += h;
            minus[i] -= h;
            let fp = objective_value(problem, &params.unflatten(&plus).unwrap(), objective, options);
            let fm = objective_value(problem, &params.unflatten(&minus).unwrap(), objective, options);
            (fp - fm) / (2.0 * h)
        })
        .collect()
}

/// Print a comparison table, then assert every component agrees in either
/// absolute or relative terms.
pub fn assert_gradients_match(labels: &[String], analytic: &[f64], fd: &[f64], tol_abs: f64, tol_rel: f64) {
    assert_eq!(analytic.len(), fd.len());
    eprintln!("──────────────────────────────────────────────");
    for i in 0..analytic.len() {
        let abs_err = (analytic[i] - fd[i]).abs();
        let denom = fd[i].abs().max(analytic[i].abs()).max(1e-14);
        let flag = if abs_err > tol_abs && abs_err / denom > tol_rel { " <<<" } else { "" };
        eprintln!(
            "  {:>8}  analytic={:+12.6e}  fd={:+12.6e}  abs={:.2e}  rel={:.2e}{flag}",
            labels.get(i).map(String::as_str).unwrap_or("?"),
            analytic[i],
            fd[i],
            abs_err,
            abs_err / denom,
        );
    }
    eprintln!("──────────────────────────────────────────────");
    for i in 0..analytic.len() {
        let abs_err = (analytic[i] - fd[i]).abs();
        let denom = fd[i].abs().max(analytic[i].abs()).max(1e-14);
        assert!(
            abs_err < tol_abs || abs_err / denom < tol_rel,
            "component {i}: analytic={:.8e}, fd={:.8e}, abs_err={abs_err:.3e}",
            analytic[i],
            fd[i],
        );
    }
}

/// Route library logs to the test writer; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
