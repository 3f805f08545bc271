//! Weak-form kernels.
//!
//! Each kernel integrates the element residual for one element given its
//! geometry, local DOF values and local coefficient values.  Kernels are
//! generic over [`DualNum`] so the same code yields the residual (`f64`), the
//! local Jacobian and parameter tangents (`Dual64`) and contracted second
//! derivatives (`HyperDual64`).

use crate::element::ElementGeometry;
use crate::linear::MatrixStructure;
use crate::params::ParamRef;
use num_dual::DualNum;
use serde::{Deserialize, Serialize};

/// Scalar type accepted by the kernels.
pub trait Scalar: DualNum<f64> + Copy + Send + Sync {}
impl<T: DualNum<f64> + Copy + Send + Sync> Scalar for T {}

/// SIMP interpolation of the Young's modulus by an element density:
/// E_eff = E (ρ_min + (1 − ρ_min) ρ^p).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Simp {
    pub density: ParamRef,
    pub penalty: f64,
    pub min_stiffness: f64,
}

impl Simp {
    pub fn new(density: impl Into<ParamRef>) -> Self {
        Self { density: density.into(), penalty: 3.0, min_stiffness: 1e-9 }
    }
}

/// Small-strain isotropic elasticity.  Axial bar in 1-D (`thickness` is the
/// cross-section area), plane stress in 2-D.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearElasticity {
    pub youngs_modulus: ParamRef,
    pub poisson_ratio: ParamRef,
    pub thickness: ParamRef,
    pub simp: Option<Simp>,
}

impl LinearElasticity {
    pub fn new(youngs_modulus: impl Into<ParamRef>, poisson_ratio: impl Into<ParamRef>) -> Self {
        Self {
            youngs_modulus: youngs_modulus.into(),
            poisson_ratio: poisson_ratio.into(),
            thickness: ParamRef::Constant(1.0),
            simp: None,
        }
    }

    pub fn with_thickness(mut self, thickness: impl Into<ParamRef>) -> Self {
        self.thickness = thickness.into();
        self
    }

    pub fn with_simp(mut self, simp: Simp) -> Self {
        self.simp = Some(simp);
        self
    }

    fn effective_modulus<T: Scalar>(&self, c: &[T]) -> T {
        match &self.simp {
            None => c[0],
            Some(simp) => {
                let rho = c[3];
                let interp = T::from(simp.min_stiffness) + rho.powf(simp.penalty) * (1.0 - simp.min_stiffness);
                c[0] * interp
            }
        }
    }

    fn residual<T: Scalar>(&self, geo: &ElementGeometry, u: &[T], c: &[T], out: &mut [T]) {
        let e = self.effective_modulus(c);
        let t = c[2];
        let nn = geo.num_nodes();

        match geo.dim() {
            1 => {
                for q in 0..geo.num_points() {
                    let mut strain = T::zero();
                    for a in 0..nn {
                        strain += u[a] * geo.gradients[[q, a, 0]];
                    }
                    let flux = e * t * strain * geo.jxw[q];
                    for a in 0..nn {
                        out[a] += flux * geo.gradients[[q, a, 0]];
                    }
                }
            }
            _ => {
                let nu = c[1];
                let scale = e * t / (T::one() - nu * nu);
                let shear = (T::one() - nu) * 0.5;
                for q in 0..geo.num_points() {
                    let (mut exx, mut eyy, mut gxy) = (T::zero(), T::zero(), T::zero());
                    for a in 0..nn {
                        let (dx, dy) = (geo.gradients[[q, a, 0]], geo.gradients[[q, a, 1]]);
                        exx += u[2 * a] * dx;
                        eyy += u[2 * a + 1] * dy;
                        gxy += u[2 * a] * dy + u[2 * a + 1] * dx;
                    }
                    let w = scale * geo.jxw[q];
                    let sxx = w * (exx + nu * eyy);
                    let syy = w * (nu * exx + eyy);
                    let sxy = w * shear * gxy;
                    for a in 0..nn {
                        let (dx, dy) = (geo.gradients[[q, a, 0]], geo.gradients[[q, a, 1]]);
                        out[2 * a] += sxx * dx + sxy * dy;
                        out[2 * a + 1] += sxy * dx + syy * dy;
                    }
                }
            }
        }
    }
}

/// Steady heat conduction with temperature-dependent conductivity
/// k(u) = k₀ (1 + β u²) and a volumetric source s:
/// R_a = ∫ k(u) ∇u·∇N_a − s N_a.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NonlinearHeat {
    pub conductivity: ParamRef,
    pub nonlinearity: ParamRef,
    pub source: ParamRef,
}

impl NonlinearHeat {
    pub fn new(conductivity: impl Into<ParamRef>) -> Self {
        Self {
            conductivity: conductivity.into(),
            nonlinearity: ParamRef::Constant(0.0),
            source: ParamRef::Constant(0.0),
        }
    }

    pub fn with_nonlinearity(mut self, beta: impl Into<ParamRef>) -> Self {
        self.nonlinearity = beta.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<ParamRef>) -> Self {
        self.source = source.into();
        self
    }

    fn is_linear(&self) -> bool {
        self.nonlinearity == ParamRef::Constant(0.0)
    }

    fn residual<T: Scalar>(&self, geo: &ElementGeometry, u: &[T], c: &[T], out: &mut [T]) {
        let (k0, beta, source) = (c[0], c[1], c[2]);
        let nn = geo.num_nodes();
        let dim = geo.dim();

        for q in 0..geo.num_points() {
            let mut uq = T::zero();
            let mut grad = [T::zero(); 2];
            for a in 0..nn {
                uq += u[a] * geo.values[[q, a]];
                for i in 0..dim {
                    grad[i] += u[a] * geo.gradients[[q, a, i]];
                }
            }
            let k = k0 * (T::one() + beta * uq * uq) * geo.jxw[q];
            let s = source * geo.jxw[q];
            for a in 0..nn {
                let mut flux = T::zero();
                for i in 0..dim {
                    flux += grad[i] * geo.gradients[[q, a, i]];
                }
                out[a] += k * flux - s * geo.values[[q, a]];
            }
        }
    }
}

/// Closed set of weak forms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Physics {
    Elasticity(LinearElasticity),
    Heat(NonlinearHeat),
}

impl Physics {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Elasticity(_) => "elasticity",
            Self::Heat(_) => "heat",
        }
    }

    /// Unknowns per node.
    pub fn arity(&self, dim: usize) -> usize {
        match self {
            Self::Elasticity(_) => dim,
            Self::Heat(_) => 1,
        }
    }

    /// Coefficients in the order the kernels read them.
    pub fn coefficients(&self) -> Vec<&ParamRef> {
        match self {
            Self::Elasticity(p) => {
                let mut refs = vec![&p.youngs_modulus, &p.poisson_ratio, &p.thickness];
                if let Some(simp) = &p.simp {
                    refs.push(&simp.density);
                }
                refs
            }
            Self::Heat(p) => vec![&p.conductivity, &p.nonlinearity, &p.source],
        }
    }

    /// Structure of the Jacobian, used to pick a factorisation.
    pub fn structure(&self) -> MatrixStructure {
        match self {
            Self::Elasticity(_) => MatrixStructure::SymmetricPositiveDefinite,
            Self::Heat(h) if h.is_linear() => MatrixStructure::SymmetricPositiveDefinite,
            Self::Heat(_) => MatrixStructure::General,
        }
    }

    /// Accumulate the element residual into `out` (length = local DOFs).
    pub fn element_residual<T: Scalar>(&self, geo: &ElementGeometry, u: &[T], coeffs: &[T], out: &mut [T]) {
        match self {
            Self::Elasticity(p) => p.residual(geo, u, coeffs, out),
            Self::Heat(p) => p.residual(geo, u, coeffs, out),
        }
    }
}
