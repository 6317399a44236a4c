//! Iso-surface extraction.
//!
//! The extractor walks the tree one subdivision subtree at a time to bound
//! memory: corner values and edge roots are cached per subtree through the
//! shared-index tables, vertices interior to a subtree go out-of-core, and
//! vertices on subdivision boundaries are deduplicated across subtrees
//! through a global key map. Loops are assembled across face-adjacent cells
//! of differing depths and triangulated with either a barycenter fan or a
//! minimal-area triangulation.

use crate::bspline::{is_inset, BoundaryType};
use crate::cube;
use crate::marching_cubes as mc;
use crate::mesh::{MeshSink, MeshVertex, VertexIndex};
use crate::octree::{NeighborKey3, NodeId, Octree};
use crate::poisson::Reconstructor;
use crate::polynomial::Polynomial;
use crate::sorted_nodes::{owns_corner, CornerTable, EdgeTable, SortedNodes};
use crate::stencils::{self, ChildStencil, Range3D, Stencil3, VStencil5};
use crate::{Real, EPSILON};
use fnv::FnvHashMap;
use na::{Point3, Vector3};
use rayon::prelude::*;

/// The finest cell owning an edge root, the edge's index in that cell, and
/// a globally unique key for the geometric root position.
#[derive(Copy, Clone, Debug)]
struct RootInfo {
    node: NodeId,
    edge: usize,
    key: u64,
}

/// Per-subtree caches addressed through the shared corner/edge tables.
struct RootCache {
    corners: CornerTable,
    edges: Option<EdgeTable>,
    values: Vec<Real>,
    values_set: Vec<bool>,
    interior_roots: Vec<usize>,
    edges_set: Vec<bool>,
}

impl RootCache {
    fn new(corners: CornerTable, edges: Option<EdgeTable>) -> Self {
        let corner_count = corners.count();
        let edge_count = edges.as_ref().map_or(0, EdgeTable::count);
        Self {
            corners,
            edges,
            values: vec![0.0; corner_count],
            values_set: vec![false; corner_count],
            interior_roots: vec![0; edge_count],
            edges_set: vec![false; edge_count],
        }
    }
}

struct RootCandidate {
    key: u64,
    edge_table_index: Option<usize>,
    vertex: MeshVertex,
}

impl Reconstructor {
    /// Inserts the minimal sibling cells so that every leaf deeper than the
    /// subdivision depth has co-depth face neighbors across subdivision
    /// boundaries, then rebuilds the sorted ordering. Returns the
    /// subdivision depth.
    pub(crate) fn refine_boundary(&mut self) -> usize {
        let max_depth = self.tree.max_depth();
        let mut subdivide_depth = self.iso_divide;
        if self.boundary == BoundaryType::Free {
            subdivide_depth += 2;
        }
        subdivide_depth = subdivide_depth.min(max_depth);
        let mut s_depth = max_depth - subdivide_depth;
        if self.boundary == BoundaryType::Free {
            s_depth = s_depth.max(2);
        }
        if s_depth == 0 {
            self.sorted = SortedNodes::set(&mut self.tree);
            return 0;
        }

        let leaves: Vec<NodeId> = {
            let mut leaves = Vec::new();
            let mut current = None;
            while let Some(id) = self.tree.next_leaf(self.tree.root(), current) {
                leaves.push(id);
                current = Some(id);
            }
            leaves
        };
        for leaf in leaves {
            let (d, off) = self.tree[leaf].depth_and_offset();
            if d <= s_depth {
                continue;
            }
            let res = (1i32 << d) - 1;
            let sub_res = (1i32 << (d - s_depth)) - 1;
            let sub_off = [off[0] & sub_res, off[1] & sub_res, off[2] & sub_res];
            let boundary: [[bool; 2]; 3] = std::array::from_fn(|a| {
                [
                    off[a] != 0 && sub_off[a] == 0,
                    off[a] != res && sub_off[a] == sub_res,
                ]
            });
            if boundary.iter().all(|b| !b[0] && !b[1]) {
                continue;
            }

            let missing = |delta: [i32; 3]| self.tree.neighbor_by_offset(leaf, delta).is_none();
            let step = |axis: usize| -> i32 {
                let mut delta = [0i32; 3];
                delta[axis] = -1;
                if boundary[axis][0] && missing(delta) {
                    return -1;
                }
                delta[axis] = 1;
                if boundary[axis][1] && missing(delta) {
                    return 1;
                }
                0
            };
            let (x, y, z) = (step(0), step(1), step(2));
            if x == 0 && y == 0 && z == 0 {
                continue;
            }

            let mut flags = [[[false; 3]; 3]; 3];
            let (xi, yi, zi) = ((1 + x) as usize, (1 + y) as usize, (1 + z) as usize);
            if x != 0 && y != 0 && z != 0 {
                flags[xi][yi][zi] = true;
            }
            if x != 0 && y != 0 {
                flags[xi][yi][1] = true;
            }
            if x != 0 && z != 0 {
                flags[xi][1][zi] = true;
            }
            if y != 0 && z != 0 {
                flags[1][yi][zi] = true;
            }
            if x != 0 {
                flags[xi][1][1] = true;
            }
            if y != 0 {
                flags[1][yi][1] = true;
            }
            if z != 0 {
                flags[1][1][zi] = true;
            }
            self.tree.set_neighbors(leaf, &flags);
        }
        self.sorted = SortedNodes::set(&mut self.tree);
        s_depth
    }

    /// The weighted mean of the solution's cell-center values, offset by 0.5
    /// in Dirichlet mode.
    pub(crate) fn iso_value(&self) -> Real {
        let max_depth = self.sorted.levels - 1;
        let slot = self.center_weight_slot();

        let mut met = vec![0.0 as Real; self.sorted.node_count[max_depth]];
        for i in self.sorted.node_count[self.min_depth]..self.sorted.node_count[max_depth] {
            met[i] = self.tree[self.sorted.nodes[i]].data.solution;
        }
        for d in self.min_depth..max_depth {
            self.up_sample_cumulative(d, &mut met);
        }

        let mut center_stencils = Vec::with_capacity(max_depth + 1);
        let mut center_child_stencils = Vec::with_capacity(max_depth + 1);
        for d in 0..=max_depth {
            center_stencils.push(stencils::center_evaluation_stencil(&self.fdata, d));
            center_child_stencils.push(stencils::center_evaluation_stencils(&self.fdata, d));
        }

        let mut iso_value = 0.0;
        let mut weight_sum = 0.0;
        let mut center_values = vec![0.0 as Real; self.sorted.len()];
        for d in (self.min_depth..=max_depth).rev() {
            let range = self.sorted.depth_range(d);
            let values: Vec<Real> = range
                .clone()
                .into_par_iter()
                .map_init(
                    || NeighborKey3::new(self.sorted.levels),
                    |key, i| {
                        let node = self.sorted.nodes[i];
                        if self.tree[node].has_children() {
                            let mut value = 0.0;
                            for c in 0..8 {
                                let child = self.tree.child(node, c);
                                value += center_values
                                    [self.tree[child].data.node_index as usize];
                            }
                            value / 8.0
                        } else {
                            let child = self.tree[node].child_index();
                            let (cx, cy, cz) = cube::factor_corner_index(child);
                            let (_, off) = self.tree[node].depth_and_offset();
                            let mn = if self.boundary == BoundaryType::Free {
                                (1i32 << (d.max(2) - 2)) + 2
                            } else {
                                2
                            };
                            let mx = (1i32 << d) - mn;
                            let is_interior = off.iter().all(|&v| v >= mn && v < mx);
                            self.center_value(
                                key,
                                node,
                                &met,
                                &center_stencils[d],
                                center_child_stencils[d].at(cx, cy, cz),
                                is_interior,
                            )
                        }
                    },
                )
                .collect();
            for (i, value) in range.zip(values) {
                center_values[i] = value;
                let node = self.sorted.nodes[i];
                let w = self.tree[node].data.center_weights[slot];
                if w != 0.0 {
                    iso_value += value * w;
                    weight_sum += w;
                }
            }
        }
        let offset = if self.boundary == BoundaryType::Dirichlet {
            0.5
        } else {
            0.0
        };
        if weight_sum == 0.0 {
            log::warn!("no weighted cells for the iso-value; defaulting to 0");
            return -offset;
        }
        iso_value / weight_sum - offset
    }

    /// Function value at a leaf's center, from the co-depth and parent-depth
    /// 3³ neighborhoods.
    fn center_value(
        &self,
        key: &mut NeighborKey3,
        node: NodeId,
        met: &[Real],
        stencil: &Stencil3,
        child_stencil: &Stencil3,
        is_interior: bool,
    ) -> Real {
        let (d, off) = self.tree[node].depth_and_offset();
        let neighbors = key.neighbors3(&self.tree, node);
        let mut value = 0.0;
        for x in 0..3usize {
            for y in 0..3usize {
                for z in 0..3usize {
                    let Some(other) = neighbors.nodes[x][y][z] else {
                        continue;
                    };
                    value += self.tree[other].data.solution
                        * if is_interior {
                            stencil[x][y][z]
                        } else {
                            let (_, ooff) = self.tree[other].depth_and_offset();
                            self.fdata.center_value(d, off[0], ooff[0], false, false)
                                * self.fdata.center_value(d, off[1], ooff[1], false, false)
                                * self.fdata.center_value(d, off[2], ooff[2], false, false)
                        };
                }
            }
        }
        if d > self.min_depth {
            let parents = key.cached(d - 1);
            for x in 0..3usize {
                for y in 0..3usize {
                    for z in 0..3usize {
                        let Some(other) = parents.nodes[x][y][z] else {
                            continue;
                        };
                        if self.tree[other].data.node_index < 0 {
                            continue;
                        }
                        value += met[self.tree[other].data.node_index as usize]
                            * if is_interior {
                                child_stencil[x][y][z]
                            } else {
                                let (_, ooff) = self.tree[other].depth_and_offset();
                                self.fdata.center_value(d, off[0], ooff[0], false, true)
                                    * self.fdata.center_value(d, off[1], ooff[1], false, true)
                                    * self.fdata.center_value(d, off[2], ooff[2], false, true)
                            };
                    }
                }
            }
        }
        value
    }

    /// Runs the full extraction into `sink`.
    pub(crate) fn extract_iso_surface(&mut self, iso_value: Real, sink: &mut dyn MeshSink) {
        let s_depth = self.refine_boundary();
        let extractor = IsoExtractor::new(self, iso_value, s_depth);
        extractor.run(sink);
    }
}

struct IsoExtractor<'a> {
    r: &'a Reconstructor,
    iso_value: Real,
    s_depth: usize,
    max_depth: usize,
    met: Vec<Real>,
    mc_indices: Vec<u8>,
    corner_stencil: Vec<ChildStencil<Stencil3>>,
    corner_stencils: Vec<ChildStencil<ChildStencil<Stencil3>>>,
    normal_stencil: Vec<ChildStencil<VStencil5>>,
    normal_stencils: Vec<ChildStencil<ChildStencil<VStencil5>>>,
    boundary_roots: FnvHashMap<u64, usize>,
}

impl<'a> IsoExtractor<'a> {
    fn new(r: &'a Reconstructor, iso_value: Real, s_depth: usize) -> Self {
        let max_depth = r.sorted.levels - 1;
        let mut met = vec![0.0 as Real; r.sorted.node_count[max_depth]];
        for i in r.sorted.node_count[r.min_depth]..r.sorted.node_count[max_depth] {
            met[i] = r.tree[r.sorted.nodes[i]].data.solution;
        }
        for d in r.min_depth..max_depth {
            r.up_sample(d, &mut met);
        }

        let mut corner_stencil = Vec::with_capacity(max_depth + 1);
        let mut corner_stencils = Vec::with_capacity(max_depth + 1);
        let mut normal_stencil = Vec::with_capacity(max_depth + 1);
        let mut normal_stencils = Vec::with_capacity(max_depth + 1);
        for d in 0..=max_depth {
            corner_stencil.push(stencils::corner_evaluation_stencil(&r.fdata, d));
            corner_stencils.push(stencils::corner_evaluation_stencils(&r.fdata, d));
            normal_stencil.push(stencils::corner_normal_stencil(&r.fdata, d));
            normal_stencils.push(stencils::corner_normal_stencils(&r.fdata, d));
        }

        Self {
            r,
            iso_value,
            s_depth,
            max_depth,
            met,
            mc_indices: vec![0; r.sorted.len()],
            corner_stencil,
            corner_stencils,
            normal_stencil,
            normal_stencils,
            boundary_roots: FnvHashMap::default(),
        }
    }

    fn tree(&self) -> &Octree {
        &self.r.tree
    }

    fn mc_of(&self, node: NodeId) -> u8 {
        self.mc_indices[self.tree()[node].data.node_index as usize]
    }

    fn emit_allowed(&self, node: NodeId) -> bool {
        if self.r.boundary != BoundaryType::Free {
            return true;
        }
        let (d, off) = self.tree()[node].depth_and_offset();
        is_inset(d, off)
    }

    fn run(mut self, sink: &mut dyn MeshSink) {
        let r = self.r;

        let coarse_corners = r.sorted.set_corner_table(&r.tree, None, self.s_depth);
        let mut coarse_cache = RootCache::new(coarse_corners, None);

        let subtree_roots: Vec<NodeId> = r
            .sorted
            .depth_range(self.s_depth)
            .map(|i| r.sorted.nodes[i])
            .filter(|&n| r.tree[n].has_children())
            .collect();

        for subtree_root in subtree_roots {
            let corners = r
                .sorted
                .set_corner_table(&r.tree, Some(subtree_root), self.max_depth);
            let edges = r
                .sorted
                .set_edge_table(&r.tree, Some(subtree_root), self.max_depth);
            let mut cache = RootCache::new(corners, Some(edges));
            let mut interior_vertices: Vec<MeshVertex> = Vec::new();
            let offset = sink.out_of_core_point_count();

            for d in ((self.s_depth + 1)..=self.max_depth).rev() {
                let leaves: Vec<NodeId> = {
                    let mut leaves = Vec::new();
                    let mut current = None;
                    while let Some(id) = r.tree.next_leaf(subtree_root, current) {
                        if r.tree[id].depth() == d && r.tree[id].data.node_index != -1 {
                            leaves.push(id);
                        }
                        current = Some(id);
                    }
                    leaves
                };
                if leaves.is_empty() {
                    continue;
                }

                self.set_iso_corners(&leaves, &mut cache, self.max_depth, Some(&mut coarse_cache));
                self.set_root_positions(&leaves, &mut cache, Some(&mut interior_vertices), sink);
                let s_depth = self.s_depth;
                for &leaf in &leaves {
                    if self.emit_allowed(leaf) {
                        self.triangulate_node(
                            leaf,
                            &cache,
                            s_depth,
                            Some(&mut interior_vertices),
                            offset,
                            sink,
                        );
                    }
                }
            }
        }

        // Cells at and above the subdivision depth, against the coarse
        // corner table; every root here sits on a subdivision boundary and
        // resolves through the global key map.
        for d in (0..=self.s_depth).rev() {
            let leaves: Vec<NodeId> = r
                .sorted
                .depth_range(d)
                .map(|i| r.sorted.nodes[i])
                .filter(|&n| !r.tree[n].has_children())
                .collect();
            if leaves.is_empty() {
                continue;
            }
            let table_depth = self.s_depth;
            self.set_iso_corners(&leaves, &mut coarse_cache, table_depth, None);
            self.set_root_positions(&leaves, &mut coarse_cache, None, sink);
            for &leaf in &leaves {
                if self.emit_allowed(leaf) {
                    self.triangulate_node(leaf, &coarse_cache, 0, None, 0, sink);
                }
            }
        }
    }

    /// Corner values, marching-cubes indices, and ancestor index
    /// propagation for one depth level of a subtree.
    fn set_iso_corners(
        &mut self,
        leaves: &[NodeId],
        cache: &mut RootCache,
        table_max_depth: usize,
        mut coarse: Option<&mut RootCache>,
    ) {
        let r = self.r;
        let tree = &r.tree;

        // Owned corners computed in parallel, scattered sequentially: the
        // ownership rule guarantees one writer per shared index.
        let cache_ref: &RootCache = cache;
        let this: &Self = &*self;
        let computed: Vec<Vec<(usize, Real)>> = leaves
            .par_iter()
            .map_init(
                || NeighborKey3::new(r.sorted.levels),
                |key, &leaf| {
                    let d = tree[leaf].depth();
                    let neighbors = key.neighbors3(tree, leaf);
                    let mut out = Vec::new();
                    for c in 0..cube::CORNERS {
                        if !owns_corner(tree, &neighbors, d, table_max_depth, c, 0, None) {
                            continue;
                        }
                        if let Some(idx) = cache_ref.corners.try_index(tree, leaf, c) {
                            let value = this.corner_value(key, leaf, c);
                            out.push((idx, value));
                        }
                    }
                    out
                },
            )
            .collect();
        for owned in computed {
            for (idx, value) in owned {
                cache.values[idx] = value;
                cache.values_set[idx] = true;
            }
        }

        // Any corner left unset (its owner was clipped out of the covered
        // span) is computed on demand, then the cube indices are assembled.
        let mut key = NeighborKey3::new(r.sorted.levels);
        for &leaf in leaves {
            let mut values = [0.0 as Real; 8];
            for (c, value) in values.iter_mut().enumerate() {
                match cache.corners.try_index(tree, leaf, c) {
                    Some(idx) if cache.values_set[idx] => *value = cache.values[idx],
                    Some(idx) => {
                        *value = self.corner_value(&mut key, leaf, c);
                        cache.values[idx] = *value;
                        cache.values_set[idx] = true;
                    }
                    None => {
                        log::warn!("corner lookup outside the table; evaluating directly");
                        *value = self.corner_value(&mut key, leaf, c);
                    }
                }
            }
            let index = mc::get_index(&values, self.iso_value);
            self.mc_indices[tree[leaf].data.node_index as usize] = index;

            // Copy values shared with the subdivision-depth cell into the
            // coarse table.
            if let Some(coarse_cache) = coarse.as_deref_mut() {
                let (d, off) = tree[leaf].depth_and_offset();
                let res = 1i32 << (d - self.s_depth);
                let sub_off = [off[0] % res, off[1] % res, off[2] % res];
                let edge = res - 1;
                if sub_off.iter().all(|&v| v % edge == 0) {
                    let mut temp = leaf;
                    while tree[temp].depth() != self.s_depth {
                        temp = tree[temp].parent().expect("leaf deeper than s_depth");
                    }
                    let c = cube::corner_index(
                        usize::from(sub_off[0] != 0),
                        usize::from(sub_off[1] != 0),
                        usize::from(sub_off[2] != 0),
                    );
                    if let (Some(coarse_idx), Some(fine_idx)) = (
                        coarse_cache.corners.try_index(tree, temp, c),
                        cache.corners.try_index(tree, leaf, c),
                    ) {
                        coarse_cache.values[coarse_idx] = cache.values[fine_idx];
                        coarse_cache.values_set[coarse_idx] = true;
                    }
                }
            }

            // Propagate the cube index along the shared-corner ancestor
            // chain.
            let child = tree[leaf].child_index();
            let bit = index & (1 << mc::corner_map(child));
            if bit != 0 {
                if let Some(parent) = tree[leaf].parent() {
                    self.mc_indices[tree[parent].data.node_index as usize] |= bit;
                    let mut node = parent;
                    while let Some(grand) = tree[node].parent() {
                        if tree[node].child_index() != child
                            || tree[grand].depth() < self.r.min_depth
                        {
                            break;
                        }
                        self.mc_indices[tree[grand].data.node_index as usize] |= bit;
                        node = grand;
                    }
                }
            }
        }
    }

    /// Basis-weighted corner value of the solution at one cell corner.
    fn corner_value(&self, key: &mut NeighborKey3, node: NodeId, corner: usize) -> Real {
        let tree = self.tree();
        let (d, off) = tree[node].depth_and_offset();
        let mn = if self.r.boundary == BoundaryType::Free {
            (1i32 << (d.max(2) - 2)) + 2
        } else {
            2
        };
        let mx = (1i32 << d) - mn;
        let is_interior = off.iter().all(|&v| v >= mn && v < mx);

        let mut value = if self.r.boundary == BoundaryType::Dirichlet {
            -0.5
        } else {
            0.0
        };
        let (cx, cy, cz) = cube::factor_corner_index(corner);
        let neighbors = key.neighbors3(tree, node);

        let mut range = Range3D::full3();
        for (axis, &c) in [cx, cy, cz].iter().enumerate() {
            if c == 0 {
                range.end[axis] = 2;
            } else {
                range.start[axis] = 1;
            }
        }
        let stencil = self.corner_stencil[d].at(cx, cy, cz);
        for x in range.start[0]..range.end[0] {
            for y in range.start[1]..range.end[1] {
                for z in range.start[2]..range.end[2] {
                    let Some(other) = neighbors.nodes[x][y][z] else {
                        continue;
                    };
                    value += tree[other].data.solution
                        * if is_interior {
                            stencil[x][y][z]
                        } else {
                            let (_, ooff) = tree[other].depth_and_offset();
                            self.fvalue(d, off, [cx as i32, cy as i32, cz as i32], ooff, false)
                        };
                }
            }
        }

        if d > self.r.min_depth {
            let child = tree[node].child_index();
            let (px, py, pz) = cube::factor_corner_index(child);
            for (axis, (&c, &p)) in [cx, cy, cz].iter().zip([px, py, pz].iter()).enumerate() {
                if c != p {
                    range.start[axis] = 0;
                    range.end[axis] = 3;
                }
            }
            let parents = key.cached(d - 1);
            let child_stencil = self.corner_stencils[d].at(cx, cy, cz).at(px, py, pz);
            for x in range.start[0]..range.end[0] {
                for y in range.start[1]..range.end[1] {
                    for z in range.start[2]..range.end[2] {
                        let Some(other) = parents.nodes[x][y][z] else {
                            continue;
                        };
                        if tree[other].data.node_index < 0 {
                            continue;
                        }
                        value += self.met[tree[other].data.node_index as usize]
                            * if is_interior {
                                child_stencil[x][y][z]
                            } else {
                                let (_, ooff) = tree[other].depth_and_offset();
                                self.fvalue(
                                    d,
                                    off,
                                    [cx as i32, cy as i32, cz as i32],
                                    ooff,
                                    true,
                                )
                            };
                    }
                }
            }
        }
        value
    }

    fn fvalue(
        &self,
        d: usize,
        off: [i32; 3],
        corner: [i32; 3],
        ooff: [i32; 3],
        child_parent: bool,
    ) -> Real {
        self.r
            .fdata
            .corner_value(d, off[0], corner[0], ooff[0], false, child_parent)
            * self
                .r
                .fdata
                .corner_value(d, off[1], corner[1], ooff[1], false, child_parent)
            * self
                .r
                .fdata
                .corner_value(d, off[2], corner[2], ooff[2], false, child_parent)
    }

    /// Basis-weighted gradient of the solution at one cell corner.
    fn corner_normal(&self, key: &mut NeighborKey3, node: NodeId, corner: usize) -> Vector3<Real> {
        let tree = self.tree();
        let (d, off) = tree[node].depth_and_offset();
        let mn = if self.r.boundary == BoundaryType::Free {
            (1i32 << (d.max(2) - 2)) + 2
        } else {
            2
        };
        let mx = (1i32 << d) - mn;
        let is_interior = off.iter().all(|&v| v >= mn && v < mx);

        let (cx, cy, cz) = cube::factor_corner_index(corner);
        let mut normal = Vector3::zeros();
        let neighbors5 = key.neighbors5(tree, node);

        let mut range = Range3D::full5();
        for (axis, &c) in [cx, cy, cz].iter().enumerate() {
            if c == 0 {
                range.end[axis] = 4;
            } else {
                range.start[axis] = 1;
            }
        }
        let stencil = self.normal_stencil[d].at(cx, cy, cz);
        for x in range.start[0]..range.end[0] {
            for y in range.start[1]..range.end[1] {
                for z in range.start[2]..range.end[2] {
                    let Some(other) = neighbors5.nodes[x][y][z] else {
                        continue;
                    };
                    normal += if is_interior {
                        stencil[x][y][z] * tree[other].data.solution
                    } else {
                        let (_, ooff) = tree[other].depth_and_offset();
                        self.fgradient(d, off, [cx as i32, cy as i32, cz as i32], ooff, false)
                            * tree[other].data.solution
                    };
                }
            }
        }

        if d > self.r.min_depth {
            let parent = tree[node].parent().expect("deeper than min depth");
            let child = tree[node].child_index();
            let (px, py, pz) = cube::factor_corner_index(child);
            for (axis, (&c, &p)) in [cx, cy, cz].iter().zip([px, py, pz].iter()).enumerate() {
                if c != p {
                    range.start[axis] = 0;
                    range.end[axis] = 5;
                }
            }
            let parents5 = key.neighbors5(tree, parent);
            let child_stencil = self.normal_stencils[d].at(cx, cy, cz).at(px, py, pz);
            for x in range.start[0]..range.end[0] {
                for y in range.start[1]..range.end[1] {
                    for z in range.start[2]..range.end[2] {
                        let Some(other) = parents5.nodes[x][y][z] else {
                            continue;
                        };
                        if tree[other].data.node_index < 0 {
                            continue;
                        }
                        normal += if is_interior {
                            child_stencil[x][y][z] * self.met[tree[other].data.node_index as usize]
                        } else {
                            let (_, ooff) = tree[other].depth_and_offset();
                            self.fgradient(d, off, [cx as i32, cy as i32, cz as i32], ooff, true)
                                * self.met[tree[other].data.node_index as usize]
                        };
                    }
                }
            }
        }
        normal
    }

    fn fgradient(
        &self,
        d: usize,
        off: [i32; 3],
        corner: [i32; 3],
        ooff: [i32; 3],
        child_parent: bool,
    ) -> Vector3<Real> {
        let fdata = &self.r.fdata;
        let v = [
            fdata.corner_value(d, off[0], corner[0], ooff[0], false, child_parent),
            fdata.corner_value(d, off[1], corner[1], ooff[1], false, child_parent),
            fdata.corner_value(d, off[2], corner[2], ooff[2], false, child_parent),
        ];
        let dv = [
            fdata.corner_value(d, off[0], corner[0], ooff[0], true, child_parent),
            fdata.corner_value(d, off[1], corner[1], ooff[1], true, child_parent),
            fdata.corner_value(d, off[2], corner[2], ooff[2], true, child_parent),
        ];
        Vector3::new(dv[0] * v[1] * v[2], v[0] * dv[1] * v[2], v[0] * v[1] * dv[2])
    }

    /// Locates the finest cell owning the root on `edge` of `node`,
    /// descending through face, edge, and child reflections.
    fn root_index(
        &self,
        key: &mut NeighborKey3,
        node: NodeId,
        edge: usize,
    ) -> Option<RootInfo> {
        let tree = self.tree();
        if tree[node].data.node_index == -1 {
            log::warn!("root lookup on an unindexed cell");
        }
        if !mc::has_edge_root(self.mc_of(node), edge) {
            return None;
        }

        let (f1, f2) = cube::faces_adjacent_to_edge(edge);
        let mut finest = node;
        let mut finest_edge = edge;
        if tree[node].depth() < self.max_depth && !tree[node].has_children() {
            let neighbors = key.neighbors3(tree, node);
            let lookup = |f: usize| -> Option<NodeId> {
                let (x, y, z) = cube::factor_face_index_xyz(f);
                neighbors.nodes[(x + 1) as usize][(y + 1) as usize][(z + 1) as usize]
                    .filter(|&t| tree[t].data.node_index != -1 && tree[t].has_children())
            };
            if let Some(t) = lookup(f1) {
                finest = t;
                finest_edge = cube::face_reflect_edge_index(edge, f1);
            } else if let Some(t) = lookup(f2) {
                finest = t;
                finest_edge = cube::face_reflect_edge_index(edge, f2);
            } else {
                let (o, i1, i2) = cube::factor_edge_index(edge);
                let diagonal = match o {
                    0 => neighbors.nodes[1][i1 << 1][i2 << 1],
                    1 => neighbors.nodes[i1 << 1][1][i2 << 1],
                    _ => neighbors.nodes[i1 << 1][i2 << 1][1],
                };
                if let Some(t) =
                    diagonal.filter(|&t| tree[t].data.node_index != -1 && tree[t].has_children())
                {
                    finest = t;
                    finest_edge = cube::edge_reflect_edge_index(edge);
                }
            }
        }

        let (c1, c2) = cube::edge_corners(finest_edge);
        if tree[finest].has_children() {
            if let Some(ri) = self.root_index(key, tree.child(finest, c1), finest_edge) {
                return Some(ri);
            }
            if let Some(ri) = self.root_index(key, tree.child(finest, c2), finest_edge) {
                return Some(ri);
            }
            let (d, off) = tree[node].depth_and_offset();
            log::warn!(
                "no root in either child of the finest edge cell at depth {d}, offset {off:?}"
            );
            return None;
        }

        let (o, i1, i2) = cube::factor_edge_index(finest_edge);
        let (d, off) = tree[finest].depth_and_offset();
        let shift = self.max_depth + 1 - d;
        let (t1, t2) = match o {
            0 => (1, 2),
            1 => (0, 2),
            _ => (0, 1),
        };
        let e0 = ((off[t1] + i1 as i32) as u64) << shift;
        let e1 = ((off[t2] + i2 as i32) as u64) << shift;
        let center = ((2 * off[o] + 1) as u64) << (self.max_depth - d);
        Some(RootInfo {
            node: finest,
            edge: finest_edge,
            key: (o as u64) | (e0 << 5) | (e1 << 25) | (center << 45),
        })
    }

    /// The other root on the same coarse edge, found by climbing ancestors.
    fn root_pair(&self, key: &mut NeighborKey3, ri: &RootInfo) -> Option<RootInfo> {
        let tree = self.tree();
        let (c1, c2) = cube::edge_corners(ri.edge);
        let mut node = ri.node;
        while let Some(parent) = tree[node].parent() {
            let c = tree[node].child_index();
            if c != c1 && c != c2 {
                return None;
            }
            if !mc::has_edge_root(self.mc_of(parent), ri.edge) {
                let sibling = tree.child(parent, if c == c1 { c2 } else { c1 });
                return self.root_index(key, sibling, ri.edge);
            }
            node = parent;
        }
        None
    }

    /// Hermite-quadratic inversion of the edge root; returns the vertex in
    /// normalized coordinates.
    fn root_vertex(
        &self,
        key: &mut NeighborKey3,
        ri: &RootInfo,
        cache: &RootCache,
    ) -> Option<MeshVertex> {
        let tree = self.tree();
        let index = self.mc_of(ri.node);
        if !mc::has_roots(index) || !mc::has_edge_root(index, ri.edge) {
            return None;
        }

        let (c1, c2) = cube::edge_corners(ri.edge);
        let (o, i1, i2) = cube::factor_edge_index(ri.edge);

        let cached_value = |c: usize| -> Option<Real> {
            cache
                .corners
                .try_index(tree, ri.node, c)
                .filter(|&i| cache.values_set[i])
                .map(|i| cache.values[i])
        };
        let x0 = match cached_value(c1) {
            Some(v) => v,
            None => self.corner_value(key, ri.node, c1),
        };
        let x1 = match cached_value(c2) {
            Some(v) => v,
            None => self.corner_value(key, ri.node, c2),
        };
        let mut n0 = self.corner_normal(key, ri.node, c1);
        let mut n1 = self.corner_normal(key, ri.node, c2);

        let (center, width) = tree[ri.node].center_and_width();
        n0 *= width;
        n1 *= width;

        let mut position = Point3::origin();
        let (t1, t2) = match o {
            0 => (1, 2),
            1 => (0, 2),
            _ => (0, 1),
        };
        position[t1] = center[t1] - width / 2.0 + width * i1 as Real;
        position[t2] = center[t2] - width / 2.0 + width * i2 as Real;

        let dx0 = n0[o];
        let dx1 = n1[o];
        // The scaling turns the Hermite spline into a quadratic.
        let scl = (x1 - x0) / ((dx1 + dx0) / 2.0);
        let dx0 = dx0 * scl;
        let dx1 = dx1 * scl;
        let hermite =
            Polynomial::<3>::quadratic(x0, dx0, 3.0 * (x1 - x0) - dx1 - 2.0 * dx0);

        let mut average_root = 0.0;
        let mut root_count = 0;
        if scl.is_finite() {
            for root in hermite.solve(self.iso_value, EPSILON) {
                if (0.0..=1.0).contains(&root) {
                    average_root += root;
                    root_count += 1;
                }
            }
        }
        if root_count > 0 && self.r.non_linear_fit {
            average_root /= root_count as Real;
        } else {
            average_root = (x0 - self.iso_value) / (x0 - x1);
        }
        if !(0.0..=1.0).contains(&average_root) || !average_root.is_finite() {
            log::warn!(
                "bad average edge root {average_root} ({x0} {x1}), ({dx0} {dx1}) ({})",
                self.iso_value
            );
            average_root = average_root.clamp(0.0, 1.0);
            if !average_root.is_finite() {
                average_root = 0.5;
            }
        }
        position[o] = center[o] - width / 2.0 + width * average_root;

        let value = if self.r.output_density {
            let mut temp = ri.node;
            while tree[temp].depth() > self.r.splat_depth {
                temp = tree[temp].parent().expect("deeper than the splat depth");
            }
            let (depth, _) = self.r.sample_depth_and_weight(temp, &position);
            Some(depth)
        } else {
            None
        };

        Some(MeshVertex { position, value })
    }

    /// Computes and registers the edge-root vertices of one depth level.
    fn set_root_positions(
        &mut self,
        leaves: &[NodeId],
        cache: &mut RootCache,
        mut interior_vertices: Option<&mut Vec<MeshVertex>>,
        sink: &mut dyn MeshSink,
    ) {
        let r = self.r;
        let tree = &r.tree;
        let s_depth = self.s_depth;

        let cache_ref: &RootCache = cache;
        let this: &Self = &*self;
        let candidates: Vec<Vec<RootCandidate>> = leaves
            .par_iter()
            .map_init(
                || NeighborKey3::new(r.sorted.levels),
                |key, &leaf| {
                    let mut out = Vec::new();
                    if !this.emit_allowed(leaf) || !mc::has_roots(this.mc_of(leaf)) {
                        return out;
                    }
                    for axis in 0..3 {
                        for i1 in 0..2 {
                            for i2 in 0..2 {
                                let edge = cube::edge_index(axis, i1, i2);
                                let Some(ri) = this.root_index(key, leaf, edge) else {
                                    continue;
                                };
                                let boundary = cache_ref.edges.is_none()
                                    || is_boundary_edge(tree, leaf, axis, i1, i2, s_depth);
                                let edge_table_index = if boundary {
                                    if this.boundary_roots.contains_key(&ri.key) {
                                        continue;
                                    }
                                    None
                                } else {
                                    let ei = cache_ref
                                        .edges
                                        .as_ref()
                                        .and_then(|t| t.try_index(tree, ri.node, ri.edge));
                                    match ei {
                                        Some(ei) if cache_ref.edges_set[ei] => continue,
                                        Some(ei) => Some(ei),
                                        None => {
                                            log::warn!(
                                                "edge lookup outside the table; treating as boundary"
                                            );
                                            None
                                        }
                                    }
                                };
                                let Some(mut vertex) = this.root_vertex(key, &ri, cache_ref)
                                else {
                                    continue;
                                };
                                vertex.position = r.denormalize(vertex.position);
                                out.push(RootCandidate {
                                    key: ri.key,
                                    edge_table_index,
                                    vertex,
                                });
                            }
                        }
                    }
                    out
                },
            )
            .collect();

        for per_leaf in candidates {
            for candidate in per_leaf {
                match candidate.edge_table_index {
                    None => {
                        if !self.boundary_roots.contains_key(&candidate.key) {
                            let index = sink.add_in_core_point(candidate.vertex);
                            self.boundary_roots.insert(candidate.key, index);
                        }
                    }
                    Some(ei) => {
                        if !cache.edges_set[ei] {
                            let index = sink.add_out_of_core_point(candidate.vertex);
                            cache.interior_roots[ei] = index;
                            cache.edges_set[ei] = true;
                            if let Some(vertices) = interior_vertices.as_deref_mut() {
                                vertices.push(candidate.vertex);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Resolves a root to its sink index.
    fn output_index(&self, ri: &RootInfo, cache: &RootCache) -> Option<VertexIndex> {
        if let Some(&index) = self.boundary_roots.get(&ri.key) {
            return Some(VertexIndex {
                index,
                in_core: true,
            });
        }
        let edges = cache.edges.as_ref()?;
        let ei = edges.try_index(self.tree(), ri.node, ri.edge)?;
        if cache.edges_set[ei] {
            Some(VertexIndex {
                index: cache.interior_roots[ei],
                in_core: false,
            })
        } else {
            None
        }
    }

    /// Collects the directed iso-segments of one leaf, pulling finer
    /// segments across faces shared with deeper neighbors, and closes the
    /// vertex balance through coarse-edge root pairs.
    fn iso_edges(
        &self,
        key: &mut NeighborKey3,
        node: NodeId,
        s_depth: usize,
    ) -> Vec<(RootInfo, RootInfo)> {
        let tree = self.tree();
        let mut edges: Vec<(RootInfo, RootInfo)> = Vec::new();
        let mut vertex_count: FnvHashMap<u64, (RootInfo, i64)> = FnvHashMap::default();

        let neighbors = key.neighbors3(tree, node);
        let face_neighbors: Vec<Option<NodeId>> = (0..cube::FACES)
            .map(|f| {
                let (x, y, z) = cube::factor_face_index_xyz(f);
                neighbors.nodes[(x + 1) as usize][(y + 1) as usize][(z + 1) as usize]
            })
            .collect();

        let triangles = mc::triangles(self.mc_of(node));
        for f in 0..cube::FACES {
            let mirrored = cube::opposite_face_index(f);
            let finer = face_neighbors[f].filter(|&t| {
                tree[t].data.node_index != -1
                    && tree[t].has_children()
                    && !is_boundary_face(tree, node, f, s_depth)
            });
            if let Some(neighbor) = finer {
                // The neighbor is finer: walk its leaves on the shared face.
                self.face_edges(key, neighbor, mirrored, &mut edges, &mut vertex_count);
            } else {
                for tri in &triangles {
                    for k in 0..3 {
                        let e1 = tri[k];
                        let e2 = tri[(k + 1) % 3];
                        if cube::face_adjacent_to_edges(e1, e2) != Some(f) {
                            continue;
                        }
                        let ri1 = self.root_index(key, node, e1);
                        let ri2 = self.root_index(key, node, e2);
                        match (ri1, ri2) {
                            (Some(ri1), Some(ri2)) => {
                                edges.push((ri1, ri2));
                                vertex_count.entry(ri1.key).or_insert((ri1, 0)).1 += 1;
                                vertex_count.entry(ri2.key).or_insert((ri2, 0)).1 -= 1;
                            }
                            _ => log::warn!("unresolved iso-segment endpoints on a leaf face"),
                        }
                    }
                }
            }
        }

        // Close the balance: every vertex with non-zero net incidence pairs
        // with the other root on the same coarser edge. Closure segments
        // appended here are themselves revisited.
        let mut i = 0;
        while i < edges.len() {
            for side in 0..2 {
                let ri = if side == 0 { edges[i].0 } else { edges[i].1 };
                let Some(&(_, count)) = vertex_count.get(&ri.key) else {
                    log::warn!("iso-segment vertex missing from the balance map");
                    continue;
                };
                if count == 0 {
                    continue;
                }
                let Some(pair) = self.root_pair(key, &ri) else {
                    continue;
                };
                if !vertex_count.contains_key(&pair.key) {
                    let (d, off) = tree[node].depth_and_offset();
                    log::warn!(
                        "root pair {:?} not incident to cell at depth {d}, offset {off:?}",
                        pair.key
                    );
                    continue;
                }
                if side == 0 {
                    edges.push((pair, ri));
                    vertex_count.get_mut(&pair.key).unwrap().1 += 1;
                    vertex_count.get_mut(&ri.key).unwrap().1 -= 1;
                } else {
                    edges.push((ri, pair));
                    vertex_count.get_mut(&pair.key).unwrap().1 -= 1;
                    vertex_count.get_mut(&ri.key).unwrap().1 += 1;
                }
            }
            i += 1;
        }
        edges
    }

    /// Recursively collects the iso-segments of the finer leaves on `face`.
    fn face_edges(
        &self,
        key: &mut NeighborKey3,
        node: NodeId,
        face: usize,
        edges: &mut Vec<(RootInfo, RootInfo)>,
        vertex_count: &mut FnvHashMap<u64, (RootInfo, i64)>,
    ) {
        let tree = self.tree();
        if tree[node].has_children() {
            for c in cube::face_corners(face) {
                self.face_edges(key, tree.child(node, c), face, edges, vertex_count);
            }
            return;
        }
        if !mc::has_roots(self.mc_of(node)) {
            return;
        }
        for tri in mc::triangles(self.mc_of(node)) {
            for k in 0..3 {
                let e1 = tri[k];
                let e2 = tri[(k + 1) % 3];
                if cube::face_adjacent_to_edges(e1, e2) != Some(face) {
                    continue;
                }
                let ri1 = self.root_index(key, node, e1);
                let ri2 = self.root_index(key, node, e2);
                match (ri1, ri2) {
                    (Some(ri1), Some(ri2)) => {
                        // Reversed: the shared face is seen from the other
                        // side.
                        edges.push((ri2, ri1));
                        vertex_count.entry(ri1.key).or_insert((ri1, 0)).1 -= 1;
                        vertex_count.entry(ri2.key).or_insert((ri2, 0)).1 += 1;
                    }
                    _ => log::warn!("unresolved iso-segment endpoints across a face"),
                }
            }
        }
    }

    /// Chains directed segments into closed loops.
    fn edge_loops(mut edges: Vec<(RootInfo, RootInfo)>) -> Vec<Vec<(RootInfo, RootInfo)>> {
        let mut loops = Vec::new();
        while let Some(seed) = edges.pop() {
            let mut front: Vec<(RootInfo, RootInfo)> = Vec::new();
            let mut back: Vec<(RootInfo, RootInfo)> = Vec::new();
            let mut front_key = seed.1.key;
            let mut back_key = seed.0.key;
            let mut j = 0;
            while j < edges.len() {
                let (a, b) = edges[j];
                if a.key == front_key || b.key == front_key {
                    let segment = if a.key == front_key { (a, b) } else { (b, a) };
                    front_key = segment.1.key;
                    front.push(segment);
                    edges.swap_remove(j);
                    j = 0;
                } else if a.key == back_key || b.key == back_key {
                    let segment = if b.key == back_key { (a, b) } else { (b, a) };
                    back_key = segment.0.key;
                    back.push(segment);
                    edges.swap_remove(j);
                    j = 0;
                } else {
                    j += 1;
                }
            }
            let mut closed = Vec::with_capacity(front.len() + back.len() + 1);
            closed.extend(back.into_iter().rev());
            closed.push(seed);
            closed.extend(front);
            loops.push(closed);
        }
        loops
    }

    /// Emits the polygons of one leaf.
    fn triangulate_node(
        &self,
        node: NodeId,
        cache: &RootCache,
        s_depth: usize,
        mut interior_vertices: Option<&mut Vec<MeshVertex>>,
        offset: usize,
        sink: &mut dyn MeshSink,
    ) {
        let mut key = NeighborKey3::new(self.r.sorted.levels);
        let edges = self.iso_edges(&mut key, node, s_depth);
        let loops = Self::edge_loops(edges);

        for one_loop in loops {
            let mut indices: Vec<VertexIndex> = Vec::with_capacity(one_loop.len());
            for (a, _) in one_loop.iter().rev() {
                match self.output_index(a, cache) {
                    Some(index) => indices.push(index),
                    None => log::warn!("iso-loop vertex has no registered position; skipped"),
                }
            }
            if indices.len() < 3 {
                continue;
            }
            self.add_polygons(&indices, interior_vertices.as_deref_mut(), offset, sink);
        }
    }

    fn vertex_of(
        &self,
        index: VertexIndex,
        interior_vertices: Option<&Vec<MeshVertex>>,
        offset: usize,
        sink: &dyn MeshSink,
    ) -> Option<MeshVertex> {
        if index.in_core {
            Some(sink.in_core_point(index.index))
        } else {
            interior_vertices.and_then(|v| {
                index
                    .index
                    .checked_sub(offset)
                    .and_then(|i| v.get(i).copied())
            })
        }
    }

    fn add_polygons(
        &self,
        indices: &[VertexIndex],
        mut interior_vertices: Option<&mut Vec<MeshVertex>>,
        offset: usize,
        sink: &mut dyn MeshSink,
    ) {
        if self.r.polygon_mesh {
            sink.add_polygon(indices);
            return;
        }
        if indices.len() == 3 {
            sink.add_polygon(indices);
            return;
        }

        // Degenerate (coplanar) polygons fan around the barycenter; the
        // rest go through the minimal-area triangulation.
        let vertices: Option<Vec<MeshVertex>> = indices
            .iter()
            .map(|&i| self.vertex_of(i, interior_vertices.as_deref(), offset, sink))
            .collect();
        let Some(vertices) = vertices else {
            log::warn!("polygon references an unreadable vertex; emitting a raw fan");
            for k in 1..indices.len() - 1 {
                sink.add_polygon(&[indices[0], indices[k], indices[k + 1]]);
            }
            return;
        };

        let mut coplanar = false;
        if self.r.add_barycenter {
            let k = indices.len();
            for i in 0..k {
                for j in 0..i {
                    if (i + 1) % k == j || (j + 1) % k == i {
                        continue;
                    }
                    for axis in 0..3 {
                        if vertices[i].position[axis] == vertices[j].position[axis] {
                            coplanar = true;
                        }
                    }
                }
            }
        }

        if coplanar {
            let mut center = Vector3::zeros();
            let mut value = 0.0;
            let mut has_value = true;
            for v in &vertices {
                center += v.position.coords;
                match v.value {
                    Some(x) => value += x,
                    None => has_value = false,
                }
            }
            let k = vertices.len() as Real;
            let barycenter = MeshVertex {
                position: Point3::from(center / k),
                value: has_value.then_some(value / k),
            };
            let center_index = sink.add_out_of_core_point(barycenter);
            if let Some(vertices) = interior_vertices.as_deref_mut() {
                vertices.push(barycenter);
            }
            for i in 0..indices.len() {
                sink.add_polygon(&[
                    indices[i],
                    indices[(i + 1) % indices.len()],
                    VertexIndex {
                        index: center_index,
                        in_core: false,
                    },
                ]);
            }
        } else {
            let positions: Vec<Point3<Real>> = vertices.iter().map(|v| v.position).collect();
            for tri in minimal_area_triangulation(&positions) {
                sink.add_polygon(&[indices[tri[0]], indices[tri[1]], indices[tri[2]]]);
            }
        }
    }
}

/// Does this face of the cell lie on the subdivision grid of `s_depth`?
fn is_boundary_face(tree: &Octree, node: NodeId, face: usize, s_depth: usize) -> bool {
    let (d, off) = tree[node].depth_and_offset();
    if d <= s_depth {
        return true;
    }
    let (dir, face_offset) = cube::factor_face_index(face);
    let idx = (off[dir] << 1) + ((face_offset as i32) << 1);
    idx % (2 << (d - s_depth)) == 0
}

/// Does this edge of the cell lie on the subdivision grid of `s_depth`?
fn is_boundary_edge(
    tree: &Octree,
    node: NodeId,
    dir: usize,
    i1: usize,
    i2: usize,
    s_depth: usize,
) -> bool {
    let (d, off) = tree[node].depth_and_offset();
    if d <= s_depth {
        return true;
    }
    let (idx1, idx2) = match dir {
        0 => (off[1] + i1 as i32, off[2] + i2 as i32),
        1 => (off[0] + i1 as i32, off[2] + i2 as i32),
        _ => (off[0] + i1 as i32, off[1] + i2 as i32),
    };
    let mask = 1i32 << (d - s_depth);
    idx1 % mask == 0 || idx2 % mask == 0
}

/// Dynamic-program triangulation of a (small) polygon minimizing total
/// triangle area.
fn minimal_area_triangulation(vertices: &[Point3<Real>]) -> Vec<[usize; 3]> {
    let k = vertices.len();
    debug_assert!(k >= 3);
    let area = |a: usize, b: usize, c: usize| -> Real {
        (vertices[b] - vertices[a])
            .cross(&(vertices[c] - vertices[a]))
            .norm()
            / 2.0
    };

    // best[i][j]: minimal area of the fan between vertices i..=j.
    let mut best = vec![vec![0.0 as Real; k]; k];
    let mut split = vec![vec![0usize; k]; k];
    for span in 2..k {
        for i in 0..k - span {
            let j = i + span;
            let mut best_area = Real::INFINITY;
            let mut best_mid = i + 1;
            for m in i + 1..j {
                let candidate = best[i][m] + area(i, m, j) + best[m][j];
                if candidate < best_area {
                    best_area = candidate;
                    best_mid = m;
                }
            }
            best[i][j] = best_area;
            split[i][j] = best_mid;
        }
    }

    let mut triangles = Vec::with_capacity(k - 2);
    let mut stack = vec![(0usize, k - 1)];
    while let Some((i, j)) = stack.pop() {
        if j - i < 2 {
            continue;
        }
        let m = split[i][j];
        triangles.push([i, m, j]);
        stack.push((i, m));
        stack.push((m, j));
    }
    triangles
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn minimal_area_triangulation_covers_the_polygon() {
        let square = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(1.0, 1.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ];
        let triangles = minimal_area_triangulation(&square);
        assert_eq!(triangles.len(), 2);
        let total: Real = triangles
            .iter()
            .map(|t| {
                (square[t[1]] - square[t[0]])
                    .cross(&(square[t[2]] - square[t[0]]))
                    .norm()
                    / 2.0
            })
            .sum();
        assert!((total - 1.0).abs() < 1.0e-12);

        let pentagon = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(2.0, 0.0, 0.0),
            Point3::new(2.5, 1.5, 0.0),
            Point3::new(1.0, 2.5, 0.0),
            Point3::new(-0.5, 1.5, 0.0),
        ];
        let triangles = minimal_area_triangulation(&pentagon);
        assert_eq!(triangles.len(), 3);
    }

    #[test]
    fn boundary_predicates_follow_the_subdivision_grid() {
        let mut tree = Octree::new();
        tree.set_full_depth(3);
        let s_depth = 1;
        let mut current = None;
        while let Some(id) = tree.next_leaf(tree.root(), current) {
            let (d, off) = tree[id].depth_and_offset();
            assert_eq!(d, 3);
            for f in 0..cube::FACES {
                let (dir, fo) = cube::factor_face_index(f);
                let plane = off[dir] + fo as i32;
                let expected = plane % (1 << (d - s_depth)) == 0;
                assert_eq!(
                    is_boundary_face(&tree, id, f, s_depth),
                    expected,
                    "face {f} of {off:?}"
                );
            }
            current = Some(id);
        }
    }
}
