//! CSC sparsity pattern of the global Jacobian and the element → nonzero maps
//! used to scatter local matrices without searching.
//!
//! The pattern depends only on connectivity and arity.  It is built once per
//! `(MeshId, arity)` and shared through [`PatternCache`].

use crate::mesh::{DofMap, Mesh, MeshId};
use crate::types::FemError;
use sprs::CsMat;
use std::collections::HashMap;
use std::sync::Arc;

/// Nonzero indices of one block's element matrices, `n_local²` per element,
/// row-major within the element.
#[derive(Debug, Clone)]
pub struct BlockNzMap {
    pub local_dofs: usize,
    pub nz: Vec<usize>,
}

impl BlockNzMap {
    pub fn element(&self, e: usize) -> &[usize] {
        let n2 = self.local_dofs * self.local_dofs;
        &self.nz[e * n2..(e + 1) * n2]
    }
}

#[derive(Debug, Clone)]
pub struct SparsityPattern {
    n: usize,
    indptr: Vec<usize>,
    indices: Vec<usize>,
    /// Nonzero index of each diagonal entry.
    diag: Vec<usize>,
    blocks: Vec<BlockNzMap>,
}

impl SparsityPattern {
    pub fn build(mesh: &Mesh, dofs: &DofMap) -> Result<Self, FemError> {
        let n = dofs.num_dofs();
        let mut columns: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();
        let mut local = Vec::new();

        for block in mesh.blocks() {
            for e in 0..block.num_elements() {
                let nodes: Vec<usize> = block.element(e).to_vec();
                dofs.element_dofs(&nodes, &mut local);
                for &col in &local {
                    columns[col].extend_from_slice(&local);
                }
            }
        }

        let mut indptr = Vec::with_capacity(n + 1);
        let mut indices = Vec::new();
        indptr.push(0);
        for col in columns.iter_mut() {
            col.sort_unstable();
            col.dedup();
            indices.extend_from_slice(col);
            indptr.push(indices.len());
        }

        let mut diag = Vec::with_capacity(n);
        for i in 0..n {
            let nz = find_nz_index(&indptr, &indices, i, i)
                .ok_or(FemError::SparsityMismatch { element: usize::MAX, row: i, col: i })?;
            diag.push(nz);
        }

        let mut blocks = Vec::with_capacity(mesh.blocks().len());
        for (b, block) in mesh.blocks().iter().enumerate() {
            let local_dofs = block.kind.num_nodes() * dofs.arity();
            let mut nz = Vec::with_capacity(block.num_elements() * local_dofs * local_dofs);
            for e in 0..block.num_elements() {
                let nodes: Vec<usize> = block.element(e).to_vec();
                dofs.element_dofs(&nodes, &mut local);
                for &row in &local {
                    for &col in &local {
                        let idx = find_nz_index(&indptr, &indices, row, col).ok_or(
                            FemError::SparsityMismatch { element: mesh.global_element(b, e), row, col },
                        )?;
                        nz.push(idx);
                    }
                }
            }
            blocks.push(BlockNzMap { local_dofs, nz });
        }

        tracing::debug!(dofs = n, nnz = indices.len(), "built sparsity pattern");
        Ok(Self { n, indptr, indices, diag, blocks })
    }

    pub fn dim(&self) -> usize {
        self.n
    }

    pub fn nnz(&self) -> usize {
        self.indices.len()
    }

    pub fn indptr(&self) -> &[usize] {
        &self.indptr
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn diag(&self) -> &[usize] {
        &self.diag
    }

    pub fn block(&self, b: usize) -> &BlockNzMap {
        &self.blocks[b]
    }

    /// Matrix with this pattern and all values zero.
    pub fn zeros(&self) -> CsMat<f64> {
        self.matrix(vec![0.0; self.nnz()])
    }

    pub fn matrix(&self, data: Vec<f64>) -> CsMat<f64> {
        CsMat::new_csc((self.n, self.n), self.indptr.clone(), self.indices.clone(), data)
    }

    pub fn same_structure(&self, m: &CsMat<f64>) -> bool {
        m.is_csc()
            && m.rows() == self.n
            && m.indptr().raw_storage() == self.indptr.as_slice()
            && m.indices() == self.indices.as_slice()
    }
}

/// Given CSC indptr and (sorted) indices, position of entry (row, col).
pub fn find_nz_index(indptr: &[usize], indices: &[usize], row: usize, col: usize) -> Option<usize> {
    let (start, end) = (indptr[col], indptr[col + 1]);
    indices[start..end].binary_search(&row).ok().map(|k| start + k)
}

/// Patterns keyed by mesh identity and DOFs per node.
#[derive(Debug, Default)]
pub struct PatternCache {
    entries: HashMap<(MeshId, usize), Arc<SparsityPattern>>,
}

impl PatternCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_build(&mut self, mesh: &Mesh, dofs: &DofMap) -> Result<Arc<SparsityPattern>, FemError> {
        let key = (mesh.id(), dofs.arity());
        if let Some(p) = self.entries.get(&key) {
            return Ok(Arc::clone(p));
        }
        let pattern = Arc::new(SparsityPattern::build(mesh, dofs)?);
        self.entries.insert(key, Arc::clone(&pattern));
        Ok(pattern)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ElementKind;
    use ndarray::array;

    fn chain() -> Mesh {
        let nodes = array![[0.0], [1.0], [2.0], [3.0]];
        Mesh::single(nodes, ElementKind::Line2, array![[0, 1], [1, 2], [2, 3]]).unwrap()
    }

    #[test]
    fn chain_is_tridiagonal() {
        let mesh = chain();
        let p = SparsityPattern::build(&mesh, &DofMap::new(4, 1)).unwrap();
        assert_eq!(p.nnz(), 4 + 2 * 3);
        assert_eq!(p.indptr(), &[0, 2, 5, 8, 10]);
        assert_eq!(p.indices(), &[0, 1, 0, 1, 2, 1, 2, 3, 2, 3]);
        assert_eq!(p.diag(), &[0, 3, 6, 9]);
    }

    #[test]
    fn element_map_points_at_its_entries() {
        let mesh = chain();
        let p = SparsityPattern::build(&mesh, &DofMap::new(4, 1)).unwrap();
        // Element 1 couples DOFs 1 and 2: (1,1) (1,2) (2,1) (2,2).
        let map = p.block(0).element(1);
        assert_eq!(map, &[3, 5, 4, 6]);
    }

    #[test]
    fn isolated_node_keeps_diagonal() {
        let nodes = array![[0.0], [1.0], [5.0]];
        let mesh = Mesh::single(nodes, ElementKind::Line2, array![[0, 1]]).unwrap();
        let p = SparsityPattern::build(&mesh, &DofMap::new(3, 1)).unwrap();
        assert_eq!(p.diag().len(), 3);
        assert_eq!(p.indptr()[3] - p.indptr()[2], 1);
    }

    #[test]
    fn cache_reuses_pattern_per_mesh_and_arity() {
        let mesh = chain();
        let mut cache = PatternCache::new();
        let a = cache.get_or_build(&mesh, &DofMap::new(4, 1)).unwrap();
        let b = cache.get_or_build(&mesh, &DofMap::new(4, 1)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let c = cache.get_or_build(&mesh, &DofMap::new(4, 2)).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.len(), 2);
    }
}
