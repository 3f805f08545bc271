//! Mesh topology and DOF addressing.
//!
//! A mesh is node coordinates plus one or more element blocks; each block
//! has a single [`ElementKind`] and an index array `elements × nodes`.
//! Elements are numbered globally block by block, which is also the order
//! of per-element parameter fields.

use crate::element::{map_element, ElementKind, ReferenceTabulation};
use crate::types::MeshError;
use ndarray::{Array2, ArrayView1};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_MESH_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a [`Mesh`], used as the sparsity-cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshId(u64);

impl MeshId {
    fn next() -> Self {
        Self(NEXT_MESH_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone)]
pub struct ElementBlock {
    pub kind: ElementKind,
    /// `num_elements × kind.num_nodes()`
    pub connectivity: Array2<usize>,
}

impl ElementBlock {
    pub fn new(kind: ElementKind, connectivity: Array2<usize>) -> Result<Self, MeshError> {
        if connectivity.ncols() != kind.num_nodes() {
            return Err(MeshError::WrongNodeCount {
                kind: kind.name(),
                expected: kind.num_nodes(),
                found: connectivity.ncols(),
            });
        }
        Ok(Self { kind, connectivity })
    }

    /// Build from a flat row-major index list.
    pub fn from_flat(kind: ElementKind, flat: Vec<usize>) -> Result<Self, MeshError> {
        let nn = kind.num_nodes();
        if flat.len() % nn != 0 {
            return Err(MeshError::WrongNodeCount {
                kind: kind.name(),
                expected: nn,
                found: flat.len() % nn,
            });
        }
        let rows = flat.len() / nn;
        let connectivity = Array2::from_shape_vec((rows, nn), flat).map_err(|_| {
            MeshError::WrongNodeCount { kind: kind.name(), expected: nn, found: 0 }
        })?;
        Ok(Self { kind, connectivity })
    }

    pub fn num_elements(&self) -> usize {
        self.connectivity.nrows()
    }

    pub fn element(&self, e: usize) -> ArrayView1<'_, usize> {
        self.connectivity.row(e)
    }
}

/// Immutable mesh.  Validated once at construction: node indices in range,
/// node counts per kind, element kinds compatible with the spatial
/// dimension, and no inverted or degenerate element.
#[derive(Debug)]
pub struct Mesh {
    id: MeshId,
    nodes: Array2<f64>,
    blocks: Vec<ElementBlock>,
    /// Global index of the first element in each block, plus the total.
    offsets: Vec<usize>,
}

impl Mesh {
    pub fn new(nodes: Array2<f64>, blocks: Vec<ElementBlock>) -> Result<Self, MeshError> {
        let dim = nodes.ncols();
        if dim != 1 && dim != 2 {
            return Err(MeshError::UnsupportedDimension(dim));
        }
        let num_nodes = nodes.nrows();
        let mut offsets = Vec::with_capacity(blocks.len() + 1);
        let mut total = 0;
        for block in &blocks {
            offsets.push(total);
            total += block.num_elements();
        }
        offsets.push(total);
        if num_nodes == 0 || total == 0 {
            return Err(MeshError::EmptyMesh);
        }

        for (b, block) in blocks.iter().enumerate() {
            if block.kind.ref_dim() != dim {
                return Err(MeshError::IncompatibleElement { kind: block.kind.name(), dim });
            }
            let tab = ReferenceTabulation::new(block.kind);
            let mut coords = Array2::zeros((block.kind.num_nodes(), dim));
            for e in 0..block.num_elements() {
                let global = offsets[b] + e;
                for (a, &node) in block.element(e).iter().enumerate() {
                    if node >= num_nodes {
                        return Err(MeshError::NodeOutOfRange { element: global, node, num_nodes });
                    }
                    coords.row_mut(a).assign(&nodes.row(node));
                }
                map_element(&tab, coords.view(), global)?;
            }
        }

        Ok(Self { id: MeshId::next(), nodes, blocks, offsets })
    }

    /// Single-block convenience constructor.
    pub fn single(
        nodes: Array2<f64>,
        kind: ElementKind,
        connectivity: Array2<usize>,
    ) -> Result<Self, MeshError> {
        Self::new(nodes, vec![ElementBlock::new(kind, connectivity)?])
    }

    pub fn id(&self) -> MeshId {
        self.id
    }

    pub fn dim(&self) -> usize {
        self.nodes.ncols()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.nrows()
    }

    pub fn num_elements(&self) -> usize {
        self.offsets[self.offsets.len() - 1]
    }

    pub fn nodes(&self) -> &Array2<f64> {
        &self.nodes
    }

    pub fn blocks(&self) -> &[ElementBlock] {
        &self.blocks
    }

    /// Global number of element `e` of block `block`.
    pub fn global_element(&self, block: usize, e: usize) -> usize {
        self.offsets[block] + e
    }

    /// Gather node coordinates `num_nodes × dim` for a list of node indices.
    pub fn gather_coords(&self, element_nodes: &[usize]) -> Result<Array2<f64>, MeshError> {
        let dim = self.dim();
        let mut coords = Array2::zeros((element_nodes.len(), dim));
        for (a, &node) in element_nodes.iter().enumerate() {
            if node >= self.num_nodes() {
                return Err(MeshError::NodeOutOfRange {
                    element: usize::MAX,
                    node,
                    num_nodes: self.num_nodes(),
                });
            }
            coords.row_mut(a).assign(&self.nodes.row(node));
        }
        Ok(coords)
    }

    /// Boundary facets: element edges referenced by exactly one element.
    /// Returned as local node lists (facet kind from the owning element).
    pub fn boundary_facets(&self) -> Vec<(ElementKind, Vec<usize>)> {
        use std::collections::HashMap;
        let mut count: HashMap<Vec<usize>, (usize, ElementKind, Vec<usize>)> = HashMap::new();
        for block in &self.blocks {
            let spec = block.kind.spec();
            let Some(facet_kind) = spec.facet else { continue };
            for e in 0..block.num_elements() {
                let nodes = block.element(e);
                for local in spec.facet_nodes {
                    let facet: Vec<usize> = local.iter().map(|&a| nodes[a]).collect();
                    let mut key = facet.clone();
                    key.sort_unstable();
                    count
                        .entry(key)
                        .and_modify(|c| c.0 += 1)
                        .or_insert((1, facet_kind, facet));
                }
            }
        }
        let mut out: Vec<(ElementKind, Vec<usize>)> = count
            .into_values()
            .filter(|(n, _, _)| *n == 1)
            .map(|(_, kind, facet)| (kind, facet))
            .collect();
        out.sort_by(|a, b| a.1.cmp(&b.1));
        out
    }
}

/// Contiguous node-major DOF numbering: `dof = node * arity + component`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DofMap {
    num_nodes: usize,
    arity: usize,
}

impl DofMap {
    pub fn new(num_nodes: usize, arity: usize) -> Self {
        Self { num_nodes, arity }
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn num_dofs(&self) -> usize {
        self.num_nodes * self.arity
    }

    pub fn dof(&self, node: usize, component: usize) -> Result<usize, MeshError> {
        if node >= self.num_nodes || component >= self.arity {
            return Err(MeshError::InvalidDof {
                dof: node * self.arity + component,
                num_dofs: self.num_dofs(),
            });
        }
        Ok(node * self.arity + component)
    }

    /// Inverse of [`dof`](Self::dof).
    pub fn node_component(&self, dof: usize) -> (usize, usize) {
        (dof / self.arity, dof % self.arity)
    }

    /// Local-to-global DOF list for an element, node-major.
    pub fn element_dofs(&self, nodes: &[usize], out: &mut Vec<usize>) {
        out.clear();
        for &node in nodes {
            for c in 0..self.arity {
                out.push(node * self.arity + c);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn unit_square_tris() -> Mesh {
        let nodes = array![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
        let conn = array![[0, 1, 2], [0, 2, 3]];
        Mesh::single(nodes, ElementKind::Tri3, conn).unwrap()
    }

    #[test]
    fn mesh_ids_are_unique() {
        let a = unit_square_tris();
        let b = unit_square_tris();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn rejects_out_of_range_node() {
        let nodes = array![[0.0], [1.0]];
        let err = Mesh::single(nodes, ElementKind::Line2, array![[0, 2]]).unwrap_err();
        assert_eq!(err, MeshError::NodeOutOfRange { element: 0, node: 2, num_nodes: 2 });
    }

    #[test]
    fn rejects_wrong_arity_connectivity() {
        let err = ElementBlock::new(ElementKind::Quad4, array![[0, 1, 2]]).unwrap_err();
        assert!(matches!(err, MeshError::WrongNodeCount { expected: 4, found: 3, .. }));
    }

    #[test]
    fn rejects_line_elements_as_volume_in_2d() {
        let nodes = array![[0.0, 0.0], [1.0, 0.0]];
        let err = Mesh::single(nodes, ElementKind::Line2, array![[0, 1]]).unwrap_err();
        assert!(matches!(err, MeshError::IncompatibleElement { dim: 2, .. }));
    }

    #[test]
    fn rejects_collapsed_quad() {
        let nodes = array![[0.0, 0.0], [1.0, 0.0], [2.0, 0.0], [3.0, 0.0]];
        let err = Mesh::single(nodes, ElementKind::Quad4, array![[0, 1, 2, 3]]).unwrap_err();
        assert!(matches!(err, MeshError::DegenerateElement { element: 0, .. }));
    }

    #[test]
    fn dof_map_is_node_major() {
        let map = DofMap::new(4, 2);
        assert_eq!(map.num_dofs(), 8);
        assert_eq!(map.dof(3, 1).unwrap(), 7);
        assert_eq!(map.node_component(5), (2, 1));
        assert!(map.dof(4, 0).is_err());

        let mut dofs = Vec::new();
        map.element_dofs(&[2, 0], &mut dofs);
        assert_eq!(dofs, vec![4, 5, 0, 1]);
    }

    #[test]
    fn square_has_four_boundary_edges() {
        let mesh = unit_square_tris();
        let facets = mesh.boundary_facets();
        assert_eq!(facets.len(), 4);
        assert!(facets.iter().all(|(k, f)| *k == ElementKind::Line2 && f.len() == 2));
    }
}
