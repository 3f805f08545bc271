//! Element library: reference shape functions, quadrature rules, and the
//! isoparametric map to physical coordinates.
//!
//! Element kinds form a closed set.  Each kind resolves to a static
//! [`ElementSpec`] row holding its shape-function and quadrature
//! implementations, so dispatch is a table lookup rather than a trait object.

use crate::types::MeshError;
use ndarray::{Array2, Array3, ArrayView2};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────
//  Element kinds
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementKind {
    /// 2-node line, linear.
    Line2,
    /// 3-node line, quadratic.  Node order: end, end, midpoint.
    Line3,
    /// 3-node triangle, linear.
    Tri3,
    /// 6-node triangle, quadratic.  Corners 0–2, then midsides 0–1, 1–2, 2–0.
    Tri6,
    /// 4-node quadrilateral, bilinear.  Counter-clockwise corners.
    Quad4,
}

type ShapeFn = fn(xi: &[f64], values: &mut [f64], derivatives: &mut [f64]);
type RuleFn = fn() -> QuadratureRule;

/// Lookup-table row for one element kind.
pub struct ElementSpec {
    pub name: &'static str,
    pub num_nodes: usize,
    pub ref_dim: usize,
    pub order: usize,
    /// Kind of the boundary facet (edge) for 2-D elements.
    pub facet: Option<ElementKind>,
    /// Local node indices of each facet, counter-clockwise.
    pub facet_nodes: &'static [&'static [usize]],
    shape: ShapeFn,
    rule: RuleFn,
}

static LINE2: ElementSpec = ElementSpec {
    name: "Line2",
    num_nodes: 2,
    ref_dim: 1,
    order: 1,
    facet: None,
    facet_nodes: &[],
    shape: line2_shape,
    rule: gauss_line_2,
};

static LINE3: ElementSpec = ElementSpec {
    name: "Line3",
    num_nodes: 3,
    ref_dim: 1,
    order: 2,
    facet: None,
    facet_nodes: &[],
    shape: line3_shape,
    rule: gauss_line_3,
};

static TRI3: ElementSpec = ElementSpec {
    name: "Tri3",
    num_nodes: 3,
    ref_dim: 2,
    order: 1,
    facet: Some(ElementKind::Line2),
    facet_nodes: &[&[0, 1], &[1, 2], &[2, 0]],
    shape: tri3_shape,
    rule: triangle_centroid,
};

static TRI6: ElementSpec = ElementSpec {
    name: "Tri6",
    num_nodes: 6,
    ref_dim: 2,
    order: 2,
    facet: Some(ElementKind::Line3),
    facet_nodes: &[&[0, 1, 3], &[1, 2, 4], &[2, 0, 5]],
    shape: tri6_shape,
    rule: triangle_three_point,
};

static QUAD4: ElementSpec = ElementSpec {
    name: "Quad4",
    num_nodes: 4,
    ref_dim: 2,
    order: 1,
    facet: Some(ElementKind::Line2),
    facet_nodes: &[&[0, 1], &[1, 2], &[2, 3], &[3, 0]],
    shape: quad4_shape,
    rule: gauss_quad_2x2,
};

impl ElementKind {
    pub const ALL: [ElementKind; 5] = [
        ElementKind::Line2,
        ElementKind::Line3,
        ElementKind::Tri3,
        ElementKind::Tri6,
        ElementKind::Quad4,
    ];

    pub fn spec(self) -> &'static ElementSpec {
        match self {
            Self::Line2 => &LINE2,
            Self::Line3 => &LINE3,
            Self::Tri3 => &TRI3,
            Self::Tri6 => &TRI6,
            Self::Quad4 => &QUAD4,
        }
    }

    pub fn name(self) -> &'static str {
        self.spec().name
    }

    pub fn num_nodes(self) -> usize {
        self.spec().num_nodes
    }

    pub fn ref_dim(self) -> usize {
        self.spec().ref_dim
    }

    pub fn order(self) -> usize {
        self.spec().order
    }

    pub fn quadrature(self) -> QuadratureRule {
        (self.spec().rule)()
    }

    /// Evaluate shape values (`num_nodes`) and reference derivatives
    /// (`num_nodes × ref_dim`, row-major) at reference point `xi`.
    pub fn shape(self, xi: &[f64], values: &mut [f64], derivatives: &mut [f64]) {
        (self.spec().shape)(xi, values, derivatives)
    }
}

// ─────────────────────────────────────────────────────────────
//  Shape functions
// ─────────────────────────────────────────────────────────────

fn line2_shape(xi: &[f64], n: &mut [f64], dn: &mut [f64]) {
    let x = xi[0];
    n[0] = 0.5 * (1.0 - x);
    n[1] = 0.5 * (1.0 + x);
    dn[0] = -0.5;
    dn[1] = 0.5;
}

fn line3_shape(xi: &[f64], n: &mut [f64], dn: &mut [f64]) {
    let x = xi[0];
    n[0] = 0.5 * x * (x - 1.0);
    n[1] = 0.5 * x * (x + 1.0);
    n[2] = 1.0 - x * x;
    dn[0] = x - 0.5;
    dn[1] = x + 0.5;
    dn[2] = -2.0 * x;
}

fn tri3_shape(xi: &[f64], n: &mut [f64], dn: &mut [f64]) {
    let (x, y) = (xi[0], xi[1]);
    n[0] = 1.0 - x - y;
    n[1] = x;
    n[2] = y;
    dn.copy_from_slice(&[-1.0, -1.0, 1.0, 0.0, 0.0, 1.0]);
}

fn tri6_shape(xi: &[f64], n: &mut [f64], dn: &mut [f64]) {
    let l = [1.0 - xi[0] - xi[1], xi[0], xi[1]];
    let dl = [[-1.0, -1.0], [1.0, 0.0], [0.0, 1.0]];

    for a in 0..3 {
        n[a] = l[a] * (2.0 * l[a] - 1.0);
        for j in 0..2 {
            dn[a * 2 + j] = (4.0 * l[a] - 1.0) * dl[a][j];
        }
    }
    for (m, &(a, b)) in [(0usize, 1usize), (1, 2), (2, 0)].iter().enumerate() {
        let node = 3 + m;
        n[node] = 4.0 * l[a] * l[b];
        for j in 0..2 {
            dn[node * 2 + j] = 4.0 * (l[a] * dl[b][j] + l[b] * dl[a][j]);
        }
    }
}

fn quad4_shape(xi: &[f64], n: &mut [f64], dn: &mut [f64]) {
    const CORNERS: [(f64, f64); 4] = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];
    let (x, y) = (xi[0], xi[1]);
    for (a, &(xa, ya)) in CORNERS.iter().enumerate() {
        n[a] = 0.25 * (1.0 + x * xa) * (1.0 + y * ya);
        dn[a * 2] = 0.25 * xa * (1.0 + y * ya);
        dn[a * 2 + 1] = 0.25 * ya * (1.0 + x * xa);
    }
}

// ─────────────────────────────────────────────────────────────
//  Quadrature rules
// ─────────────────────────────────────────────────────────────

/// Points (`num_points × ref_dim`) and weights on the reference element.
#[derive(Debug, Clone)]
pub struct QuadratureRule {
    pub points: Array2<f64>,
    pub weights: Vec<f64>,
}

impl QuadratureRule {
    fn new(ref_dim: usize, points: Vec<f64>, weights: Vec<f64>) -> Self {
        let n = weights.len();
        let points = Array2::from_shape_vec((n, ref_dim), points)
            .expect("quadrature table has num_points × ref_dim entries");
        Self { points, weights }
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

fn gauss_line_2() -> QuadratureRule {
    let g = 1.0 / 3.0_f64.sqrt();
    QuadratureRule::new(1, vec![-g, g], vec![1.0, 1.0])
}

fn gauss_line_3() -> QuadratureRule {
    let g = (3.0_f64 / 5.0).sqrt();
    QuadratureRule::new(1, vec![-g, 0.0, g], vec![5.0 / 9.0, 8.0 / 9.0, 5.0 / 9.0])
}

fn triangle_centroid() -> QuadratureRule {
    QuadratureRule::new(2, vec![1.0 / 3.0, 1.0 / 3.0], vec![0.5])
}

/// Degree-2 exact rule on the reference triangle.
fn triangle_three_point() -> QuadratureRule {
    let (a, b) = (1.0 / 6.0, 2.0 / 3.0);
    QuadratureRule::new(2, vec![a, a, b, a, a, b], vec![1.0 / 6.0; 3])
}

fn gauss_quad_2x2() -> QuadratureRule {
    let g = 1.0 / 3.0_f64.sqrt();
    QuadratureRule::new(2, vec![-g, -g, g, -g, g, g, -g, g], vec![1.0; 4])
}

// ─────────────────────────────────────────────────────────────
//  Reference tabulation  (one per element block)
// ─────────────────────────────────────────────────────────────

/// Shape values and reference derivatives at every quadrature point.
/// Computed once per element kind and shared by all elements of a block.
#[derive(Debug, Clone)]
pub struct ReferenceTabulation {
    pub kind: ElementKind,
    pub quadrature: QuadratureRule,
    /// `num_points × num_nodes`
    pub values: Array2<f64>,
    /// `num_points × num_nodes × ref_dim`
    pub derivatives: Array3<f64>,
}

impl ReferenceTabulation {
    pub fn new(kind: ElementKind) -> Self {
        let quadrature = kind.quadrature();
        let nq = quadrature.len();
        let nn = kind.num_nodes();
        let rd = kind.ref_dim();

        let mut values = Array2::zeros((nq, nn));
        let mut derivatives = Array3::zeros((nq, nn, rd));
        let mut n = vec![0.0; nn];
        let mut dn = vec![0.0; nn * rd];

        for q in 0..nq {
            let xi: Vec<f64> = quadrature.points.row(q).to_vec();
            kind.shape(&xi, &mut n, &mut dn);
            for a in 0..nn {
                values[[q, a]] = n[a];
                for j in 0..rd {
                    derivatives[[q, a, j]] = dn[a * rd + j];
                }
            }
        }

        Self { kind, quadrature, values, derivatives }
    }

    pub fn num_points(&self) -> usize {
        self.quadrature.len()
    }
}

// ─────────────────────────────────────────────────────────────
//  Physical element geometry
// ─────────────────────────────────────────────────────────────

/// Per-element data the weak-form kernels integrate against.
#[derive(Debug, Clone)]
pub struct ElementGeometry {
    /// Shape values `num_points × num_nodes` (borrowed layout of the tabulation).
    pub values: Array2<f64>,
    /// Physical gradients `num_points × num_nodes × dim`.
    pub gradients: Array3<f64>,
    /// Quadrature weight × |det J| per point.
    pub jxw: Vec<f64>,
}

impl ElementGeometry {
    pub fn num_points(&self) -> usize {
        self.jxw.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.values.ncols()
    }

    pub fn dim(&self) -> usize {
        self.gradients.shape()[2]
    }

    pub fn measure(&self) -> f64 {
        self.jxw.iter().sum()
    }
}

/// Map a volume element (reference dim == spatial dim) with node coordinates
/// `coords` (`num_nodes × dim`).  `element` is only used for error context.
pub fn map_element(
    tab: &ReferenceTabulation,
    coords: ArrayView2<f64>,
    element: usize,
) -> Result<ElementGeometry, MeshError> {
    let dim = coords.ncols();
    let nn = tab.kind.num_nodes();
    if tab.kind.ref_dim() != dim {
        return Err(MeshError::IncompatibleElement { kind: tab.kind.name(), dim });
    }
    let nq = tab.num_points();
    let mut gradients = Array3::zeros((nq, nn, dim));
    let mut jxw = vec![0.0; nq];

    for q in 0..nq {
        // J[i][j] = Σ_a x_a[i] ∂N_a/∂ξ_j
        let mut jac = [[0.0f64; 2]; 2];
        for a in 0..nn {
            for i in 0..dim {
                for j in 0..dim {
                    jac[i][j] += coords[[a, i]] * tab.derivatives[[q, a, j]];
                }
            }
        }

        match dim {
            1 => {
                let det = jac[0][0];
                if !(det > 0.0) || !det.is_finite() {
                    return Err(MeshError::DegenerateElement { element, det });
                }
                for a in 0..nn {
                    gradients[[q, a, 0]] = tab.derivatives[[q, a, 0]] / det;
                }
                jxw[q] = tab.quadrature.weights[q] * det;
            }
            2 => {
                let det = jac[0][0] * jac[1][1] - jac[0][1] * jac[1][0];
                if !(det > 0.0) || !det.is_finite() {
                    return Err(MeshError::DegenerateElement { element, det });
                }
                let inv = [
                    [jac[1][1] / det, -jac[0][1] / det],
                    [-jac[1][0] / det, jac[0][0] / det],
                ];
                // ∂N/∂x_i = Σ_j (J⁻¹)_{j i} ∂N/∂ξ_j
                for a in 0..nn {
                    for i in 0..2 {
                        gradients[[q, a, i]] = inv[0][i] * tab.derivatives[[q, a, 0]]
                            + inv[1][i] * tab.derivatives[[q, a, 1]];
                    }
                }
                jxw[q] = tab.quadrature.weights[q] * det;
            }
            other => return Err(MeshError::UnsupportedDimension(other)),
        }
    }

    Ok(ElementGeometry { values: tab.values.clone(), gradients, jxw })
}

/// Work-equivalent nodal weights ∫ N_a ds of a boundary facet embedded in a
/// 2-D mesh (or ∫ N_a dx of a 1-D segment).
pub fn facet_weights(
    tab: &ReferenceTabulation,
    coords: ArrayView2<f64>,
    facet: usize,
) -> Result<Vec<f64>, MeshError> {
    let nn = tab.kind.num_nodes();
    let dim = coords.ncols();
    let mut weights = vec![0.0; nn];

    for q in 0..tab.num_points() {
        let mut tangent = [0.0f64; 2];
        for a in 0..nn {
            for i in 0..dim.min(2) {
                tangent[i] += coords[[a, i]] * tab.derivatives[[q, a, 0]];
            }
        }
        let measure = (tangent[0] * tangent[0] + tangent[1] * tangent[1]).sqrt();
        if !(measure > 0.0) || !measure.is_finite() {
            return Err(MeshError::DegenerateElement { element: facet, det: measure });
        }
        for a in 0..nn {
            weights[a] += tab.values[[q, a]] * tab.quadrature.weights[q] * measure;
        }
    }
    Ok(weights)
}
