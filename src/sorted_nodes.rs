//! Depth-major node ordering and the shared corner/edge index tables.
//!
//! Each geometric corner (and edge) shared between cells is assigned exactly
//! one dense index, chosen by an ownership rule: among the co-depth cells
//! meeting at the point, the cell with the smallest antipodal corner index
//! owns it, unless a finer incident cell claims it from within.

use crate::cube;
use crate::octree::{NeighborKey3, NodeId, Octree};
use rayon::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};

/// Tree nodes ordered by depth, then pre-order within each depth.
///
/// Depth `d` occupies `nodes[node_count[d]..node_count[d + 1]]`, and every
/// ordered node's `node_index` equals its position in `nodes`.
pub struct SortedNodes {
    pub nodes: Vec<NodeId>,
    pub node_count: Vec<usize>,
    /// Number of depth levels (deepest depth + 1).
    pub levels: usize,
}

impl SortedNodes {
    pub fn set(tree: &mut Octree) -> Self {
        let levels = tree.max_depth() + 1;
        let mut current = None;
        while let Some(id) = tree.next_node(tree.root(), current) {
            tree[id].data.node_index = -1;
            current = Some(id);
        }

        let mut nodes = vec![tree.root()];
        let mut node_count = vec![0usize, 1];
        for d in 1..levels {
            let (start, end) = (node_count[d - 1], node_count[d]);
            for i in start..end {
                let id = nodes[i];
                if tree[id].has_children() {
                    for c in 0..8 {
                        nodes.push(tree.child(id, c));
                    }
                }
            }
            node_count.push(nodes.len());
        }
        for (i, &id) in nodes.iter().enumerate() {
            tree[id].data.node_index = i as i32;
        }
        Self {
            nodes,
            node_count,
            levels,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The span of depth `d` in `nodes`.
    pub fn depth_range(&self, d: usize) -> std::ops::Range<usize> {
        self.node_count[d]..self.node_count[d + 1]
    }

    fn table_spans(
        &self,
        tree: &Octree,
        root: Option<NodeId>,
        max_depth: usize,
    ) -> (usize, Vec<(usize, usize)>, Vec<i64>, usize) {
        let mut spans = vec![(usize::MAX, usize::MAX); self.levels];
        let mut offsets = vec![i64::MIN; self.levels];

        let (min_depth, mut start, mut end);
        match root {
            Some(root) => {
                min_depth = tree[root].depth();
                start = tree[root].data.node_index as usize;
                end = start;
            }
            None => {
                min_depth = (0..self.levels)
                    .find(|&d| self.node_count[d + 1] > 0)
                    .unwrap_or(0);
                start = 0;
                end = self.node_count[min_depth + 1] - 1;
            }
        }

        let mut table_len = 0usize;
        for d in min_depth..=max_depth {
            spans[d] = (start, end + 1);
            offsets[d] = table_len as i64 - start as i64;
            table_len += end + 1 - start;
            if d < max_depth {
                while start < end && !tree[self.nodes[start]].has_children() {
                    start += 1;
                }
                while end > start && !tree[self.nodes[end]].has_children() {
                    end -= 1;
                }
                if start == end && !tree[self.nodes[start]].has_children() {
                    break;
                }
                start = tree[tree.child(self.nodes[start], 0)].data.node_index as usize;
                end = tree[tree.child(self.nodes[end], 7)].data.node_index as usize;
            }
        }
        (min_depth, spans, offsets, table_len)
    }

    /// Builds the shared-corner table for the subtree rooted at `root`
    /// (the whole tree when `None`), covering depths up to `max_depth`.
    pub fn set_corner_table(
        &self,
        tree: &Octree,
        root: Option<NodeId>,
        max_depth: usize,
    ) -> CornerTable {
        let (min_depth, spans, offsets, table_len) = self.table_spans(tree, root, max_depth);
        let root_off = root.map(|r| tree[r].depth_and_offset().1);

        let table: Vec<[AtomicU32; 8]> = (0..table_len)
            .map(|_| std::array::from_fn(|_| AtomicU32::new(0)))
            .collect();
        let mut flags = vec![0u32; table_len * cube::CORNERS];
        let flag_hits: Vec<u32> = (min_depth..=max_depth)
            .flat_map(|d| {
                let (start, end) = spans[d];
                if start == usize::MAX {
                    return vec![];
                }
                (start..end)
                    .into_par_iter()
                    .map_init(
                        || NeighborKey3::new(self.levels),
                        |key, i| {
                            let node = self.nodes[i];
                            if d < max_depth && tree[node].has_children() {
                                return vec![];
                            }
                            let neighbors = key.neighbors3(tree, node);
                            let mut owned = Vec::new();
                            for c in 0..cube::CORNERS {
                                let (x, y, z) = cube::factor_corner_index(c);
                                if !owns_corner(
                                    tree, &neighbors, d, max_depth, c, min_depth, root_off,
                                ) {
                                    continue;
                                }
                                let my_count = ((tree[node].data.node_index as i64 + offsets[d])
                                    as usize)
                                    * cube::CORNERS
                                    + c;
                                owned.push(my_count as u32);
                                // Share the index with every co-depth cell
                                // meeting at the corner, then climb ancestors
                                // that still contain it.
                                for cc in 0..cube::CORNERS {
                                    let (xx, yy, zz) = cube::factor_corner_index(cc);
                                    if let Some(neighbor) = neighbors.nodes[xx + x][yy + y][zz + z]
                                    {
                                        if tree[neighbor].data.node_index != -1 {
                                            let slot =
                                                tree[neighbor].data.node_index as i64 + offsets[d];
                                            if (0..table.len() as i64).contains(&slot) {
                                                table[slot as usize]
                                                    [cube::antipodal_corner_index(cc)]
                                                .store(my_count as u32, Ordering::Relaxed);
                                            }
                                        }
                                    }
                                }
                                let mut n = node;
                                let mut nd = d;
                                loop {
                                    if nd == min_depth {
                                        break;
                                    }
                                    let Some(parent) = tree[n].parent() else { break };
                                    if tree[n].child_index() != c {
                                        break;
                                    }
                                    let parent_neighbors = *key.cached(nd - 1);
                                    for cc in 0..cube::CORNERS {
                                        let (xx, yy, zz) = cube::factor_corner_index(cc);
                                        if let Some(neighbor) =
                                            parent_neighbors.nodes[xx + x][yy + y][zz + z]
                                        {
                                            if tree[neighbor].data.node_index != -1 {
                                                let slot = tree[neighbor].data.node_index as i64
                                                    + offsets[nd - 1];
                                                if (0..table.len() as i64).contains(&slot) {
                                                    table[slot as usize]
                                                        [cube::antipodal_corner_index(cc)]
                                                    .store(my_count as u32, Ordering::Relaxed);
                                                }
                                            }
                                        }
                                    }
                                    n = parent;
                                    nd -= 1;
                                }
                            }
                            owned
                        },
                    )
                    .flatten()
                    .collect::<Vec<_>>()
            })
            .collect();
        for hit in flag_hits {
            flags[hit as usize] = 1;
        }

        let mut count = 0;
        for flag in flags.iter_mut() {
            if *flag != 0 {
                *flag = count;
                count += 1;
            }
        }
        let table: Vec<[u32; 8]> = table
            .into_par_iter()
            .map(|entry| std::array::from_fn(|j| flags[entry[j].load(Ordering::Relaxed) as usize]))
            .collect();

        CornerTable {
            offsets,
            table,
            count: count as usize,
        }
    }

    /// Builds the shared-edge table for the subtree rooted at `root`.
    pub fn set_edge_table(
        &self,
        tree: &Octree,
        root: Option<NodeId>,
        max_depth: usize,
    ) -> EdgeTable {
        let (min_depth, spans, offsets, table_len) = self.table_spans(tree, root, max_depth);

        let table: Vec<[AtomicU32; 12]> = (0..table_len)
            .map(|_| std::array::from_fn(|_| AtomicU32::new(0)))
            .collect();
        let mut flags = vec![0u32; table_len * cube::EDGES];
        let flag_hits: Vec<u32> = (min_depth..=max_depth)
            .flat_map(|d| {
                let (start, end) = spans[d];
                if start == usize::MAX {
                    return vec![];
                }
                (start..end)
                    .into_par_iter()
                    .map_init(
                        || NeighborKey3::new(self.levels),
                        |key, i| {
                            let node = self.nodes[i];
                            let neighbors = key.neighbors3(tree, node);
                            let mut owned = Vec::new();
                            for e in 0..cube::EDGES {
                                let (o, i1, i2) = cube::factor_edge_index(e);
                                let ac = cube::square::antipodal_corner_index(
                                    cube::square::corner_index(i1, i2),
                                );
                                let mut owner = true;
                                for cc in 0..cube::square::CORNERS {
                                    let (ii, jj) = cube::square::factor_corner_index(cc);
                                    let (x, y, z) = edge_neighbor_position(o, ii + i1, jj + i2);
                                    if let Some(neighbor) = neighbors.nodes[x][y][z] {
                                        if tree[neighbor].data.node_index != -1 && cc < ac {
                                            owner = false;
                                            break;
                                        }
                                    }
                                }
                                if !owner {
                                    continue;
                                }
                                let my_count = ((tree[node].data.node_index as i64 + offsets[d])
                                    as usize)
                                    * cube::EDGES
                                    + e;
                                owned.push(my_count as u32);
                                for cc in 0..cube::square::CORNERS {
                                    let (ii, jj) = cube::square::factor_corner_index(cc);
                                    let (aii, ajj) = cube::square::factor_corner_index(
                                        cube::square::antipodal_corner_index(cc),
                                    );
                                    let (x, y, z) = edge_neighbor_position(o, ii + i1, jj + i2);
                                    if let Some(neighbor) = neighbors.nodes[x][y][z] {
                                        if tree[neighbor].data.node_index != -1 {
                                            let slot =
                                                tree[neighbor].data.node_index as i64 + offsets[d];
                                            if (0..table.len() as i64).contains(&slot) {
                                                table[slot as usize][cube::edge_index(o, aii, ajj)]
                                                    .store(my_count as u32, Ordering::Relaxed);
                                            }
                                        }
                                    }
                                }
                            }
                            owned
                        },
                    )
                    .flatten()
                    .collect::<Vec<_>>()
            })
            .collect();
        for hit in flag_hits {
            flags[hit as usize] = 1;
        }

        let mut count = 0;
        for flag in flags.iter_mut() {
            if *flag != 0 {
                *flag = count;
                count += 1;
            }
        }
        let table: Vec<[u32; 12]> = table
            .into_par_iter()
            .map(|entry| std::array::from_fn(|j| flags[entry[j].load(Ordering::Relaxed) as usize]))
            .collect();

        EdgeTable {
            offsets,
            table,
            count: count as usize,
        }
    }

}

/// The corner-ownership rule: among the co-depth cells meeting at corner
/// `c` of the center cell, ownership falls to the cell with the smallest
/// antipodal corner index, unless a finer incident cell claims the corner
/// from within. `root_off`, when given, restricts blocking cells to the
/// subtree of the depth-`min_depth` cell at that offset.
pub(crate) fn owns_corner(
    tree: &Octree,
    neighbors: &crate::octree::Neighbors3,
    d: usize,
    max_depth: usize,
    c: usize,
    min_depth: usize,
    root_off: Option<[i32; 3]>,
) -> bool {
    let (x, y, z) = cube::factor_corner_index(c);
    let ac = cube::antipodal_corner_index(c);
    for cc in 0..cube::CORNERS {
        let (xx, yy, zz) = cube::factor_corner_index(cc);
        let Some(neighbor) = neighbors.nodes[xx + x][yy + y][zz + z] else {
            continue;
        };
        if tree[neighbor].data.node_index == -1 {
            continue;
        }
        if cc < ac || (d < max_depth && tree[neighbor].has_children()) {
            if in_subtree(tree, neighbor, min_depth, root_off) {
                return false;
            } else {
                log::warn!("corner-table neighbor escaped the subtree");
            }
        }
    }
    true
}

/// Does the node's cell lie within the subtree identified by the offset of
/// its depth-`min_depth` ancestor?
fn in_subtree(tree: &Octree, node: NodeId, min_depth: usize, root_off: Option<[i32; 3]>) -> bool {
    match root_off {
        None => true,
        Some(root_off) => {
            let (d, off) = tree[node].depth_and_offset();
            (0..3).all(|a| (off[a] >> (d - min_depth)) == root_off[a])
        }
    }
}

/// Position inside a 3³ neighborhood of the cell diagonally across edge
/// `(orientation, i, j)`, with `i, j ∈ {0, 1, 2}` spanning the transverse
/// axes and the edge's own axis pinned to the center plane.
fn edge_neighbor_position(orientation: usize, i: usize, j: usize) -> (usize, usize, usize) {
    match orientation {
        0 => (1, i, j),
        1 => (i, 1, j),
        _ => (i, j, 1),
    }
}

/// Dense shared-corner indices: `index(tree, node, corner)` is valid for any
/// node covered by the table's spans.
pub struct CornerTable {
    offsets: Vec<i64>,
    table: Vec<[u32; 8]>,
    count: usize,
}

impl CornerTable {
    #[inline]
    pub fn index(&self, tree: &Octree, node: NodeId, corner: usize) -> usize {
        let d = tree[node].depth();
        self.table[(tree[node].data.node_index as i64 + self.offsets[d]) as usize][corner] as usize
    }

    /// Like [`Self::index`], `None` when the node lies outside the table's
    /// spans.
    pub fn try_index(&self, tree: &Octree, node: NodeId, corner: usize) -> Option<usize> {
        let d = tree[node].depth();
        let offset = *self.offsets.get(d)?;
        if offset == i64::MIN {
            return None;
        }
        let slot = tree[node].data.node_index as i64 + offset;
        if !(0..self.table.len() as i64).contains(&slot) {
            return None;
        }
        Some(self.table[slot as usize][corner] as usize)
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

/// Dense shared-edge indices.
pub struct EdgeTable {
    offsets: Vec<i64>,
    table: Vec<[u32; 12]>,
    count: usize,
}

impl EdgeTable {
    #[inline]
    pub fn index(&self, tree: &Octree, node: NodeId, edge: usize) -> usize {
        let d = tree[node].depth();
        self.table[(tree[node].data.node_index as i64 + self.offsets[d]) as usize][edge] as usize
    }

    /// Like [`Self::index`], `None` when the node lies outside the table's
    /// spans.
    pub fn try_index(&self, tree: &Octree, node: NodeId, edge: usize) -> Option<usize> {
        let d = tree[node].depth();
        let offset = *self.offsets.get(d)?;
        if offset == i64::MIN {
            return None;
        }
        let slot = tree[node].data.node_index as i64 + offset;
        if !(0..self.table.len() as i64).contains(&slot) {
            return None;
        }
        Some(self.table[slot as usize][edge] as usize)
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn full_tree(depth: usize) -> Octree {
        let mut tree = Octree::new();
        tree.set_full_depth(depth);
        tree
    }

    #[test]
    fn node_counts_are_monotone_and_dense() {
        let mut tree = full_tree(3);
        let sorted = SortedNodes::set(&mut tree);
        for d in 0..sorted.levels {
            assert!(sorted.node_count[d] <= sorted.node_count[d + 1]);
        }
        assert_eq!(*sorted.node_count.last().unwrap(), sorted.len());
        for (i, &id) in sorted.nodes.iter().enumerate() {
            assert_eq!(tree[id].data.node_index, i as i32);
        }
        // A complete tree has 8^d nodes per depth.
        for d in 0..sorted.levels {
            assert_eq!(sorted.depth_range(d).len(), 8usize.pow(d as u32));
        }
    }

    #[test]
    fn corner_ownership_is_a_partition() {
        let mut tree = full_tree(2);
        // Refine one cell to exercise cross-depth claims.
        let target = tree.child(tree.child(tree.root(), 0), 7);
        tree.split(target);
        let sorted = SortedNodes::set(&mut tree);
        let max_depth = tree.max_depth();
        let corners = sorted.set_corner_table(&tree, None, max_depth);

        // Leaves meeting at one geometric point must agree on the shared
        // index, and distinct points must get distinct indices.
        use std::collections::HashMap;
        let mut by_position: HashMap<[i64; 3], usize> = HashMap::new();
        let mut current = None;
        while let Some(id) = tree.next_leaf(tree.root(), current) {
            let (d, off) = tree[id].depth_and_offset();
            let scale = 1i64 << (max_depth - d);
            for c in 0..cube::CORNERS {
                let (x, y, z) = cube::factor_corner_index(c);
                let position = [
                    (off[0] as i64 + x as i64) * scale,
                    (off[1] as i64 + y as i64) * scale,
                    (off[2] as i64 + z as i64) * scale,
                ];
                let index = corners.index(&tree, id, c);
                match by_position.entry(position) {
                    std::collections::hash_map::Entry::Occupied(existing) => {
                        assert_eq!(*existing.get(), index, "corner at {position:?}");
                    }
                    std::collections::hash_map::Entry::Vacant(slot) => {
                        slot.insert(index);
                    }
                }
            }
            current = Some(id);
        }
        // Every geometric corner position maps to a unique dense index.
        let mut seen: Vec<usize> = by_position.values().copied().collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), by_position.len());
        assert!(seen.iter().all(|&i| i < corners.count()));
    }

    #[test]
    fn edge_indices_agree_between_face_neighbors() {
        let mut tree = full_tree(2);
        let sorted = SortedNodes::set(&mut tree);
        let max_depth = tree.max_depth();
        let edges = sorted.set_edge_table(&tree, None, max_depth);

        let mut current = None;
        while let Some(id) = tree.next_leaf(tree.root(), current) {
            for f in 0..cube::FACES {
                let (dx, dy, dz) = cube::factor_face_index_xyz(f);
                let Some(neighbor) = tree.neighbor_by_offset(id, [dx, dy, dz]) else {
                    continue;
                };
                for e in 0..cube::EDGES {
                    let (f1, f2) = cube::faces_adjacent_to_edge(e);
                    if f1 != f && f2 != f {
                        continue;
                    }
                    let mirrored = cube::face_reflect_edge_index(e, f);
                    assert_eq!(
                        edges.index(&tree, id, e),
                        edges.index(&tree, neighbor, mirrored),
                        "edge {e} across face {f}"
                    );
                }
            }
            current = Some(id);
        }
        assert!(edges.count() > 0);
    }
}
