//! The coarse-to-fine multigrid cascade.
//!
//! Each depth assembles a symmetric system over its nodes, corrects the
//! constraints by the cumulative up-sampled coarser solution, and relaxes
//! with conjugate gradient. Deep depths can optionally be partitioned into
//! independent subtree solves whose memory footprint is bounded by the
//! largest coarse-cell neighborhood.

use crate::bspline::{is_inset_supported, BoundaryType};
use crate::constraints::up_sample_generic;
use crate::octree::{NeighborKey3, Neighbors5, NodeId};
use crate::poisson::Reconstructor;
use crate::sparse::{self, MatrixEntry, SparseSymmetricMatrix};
use crate::stencils::{self, Range3D, Stencil5};
use crate::Real;
use rayon::prelude::*;

const ITERATION_POWER: Real = 1.0 / 3.0;
const MATRIX_ENTRY_EPSILON: Real = 0.0;

impl Reconstructor {
    /// Runs the cascade over every depth; returns the total CG iterations.
    pub(crate) fn laplacian_matrix_iteration(&mut self) -> usize {
        let levels = self.sorted.levels;
        let floor = if self.boundary == BoundaryType::Free {
            2
        } else {
            0
        };
        let starting_depth = if self.boundary == BoundaryType::Free && self.solver_divide > 0 {
            self.solver_divide + 1
        } else {
            self.solver_divide
        };

        let root = self.sorted.nodes[0];
        self.tree[root].data.solution = 0.0;

        let mut met_solution = vec![0.0 as Real; self.sorted.node_count[levels - 1]];
        let mut iterations = 0;
        for d in floor..levels {
            log::info!(
                "depth {d}/{}: {} nodes",
                levels - 1,
                self.sorted.depth_range(d).len()
            );
            iterations += if starting_depth > 0 {
                self.solve_fixed_depth_partitioned(d, &mut met_solution, starting_depth)
            } else {
                self.solve_fixed_depth(d, &mut met_solution)
            };
        }
        iterations
    }

    /// Folds the already-solved coarser depths into a starting vector for
    /// `depth`, clearing their per-node solutions.
    fn up_sample_coarser_solution(&mut self, depth: usize) -> Vec<Real> {
        let start = self.sorted.node_count[depth];
        let end = self.sorted.node_count[depth + 1];
        let mut solution = vec![0.0 as Real; end - start];
        if (self.boundary != BoundaryType::Free && depth == 0)
            || (self.boundary == BoundaryType::Free && depth <= 2)
        {
            return solution;
        }
        up_sample_generic(
            &self.tree,
            &self.sorted,
            self.boundary,
            depth,
            |i, coarse, us, idx| {
                let w = us[0].v[idx[0]] * us[1].v[idx[1]] * us[2].v[idx[2]];
                solution[i - start] += self.tree[coarse].data.solution * w;
            },
        );
        for i in self.sorted.depth_range(depth - 1) {
            let node = self.sorted.nodes[i];
            self.tree[node].data.solution = 0.0;
        }
        solution
    }

    /// Brings the cumulative coarser solution up to `depth - 1` and caches
    /// the coarser function value at every screening point of `depth`.
    fn prepare_coarser_state(&mut self, depth: usize, met_solution: &mut [Real]) {
        if depth > 0 {
            self.up_sample(depth - 1, met_solution);
            for i in self.sorted.depth_range(depth - 1) {
                let node = self.sorted.nodes[i];
                met_solution[i] += self.tree[node].data.solution;
            }
        }
        if self.constrain_values {
            self.set_coarser_point_values(depth, met_solution);
        }
    }

    fn set_coarser_point_values(&mut self, depth: usize, met_solution: &[Real]) {
        let updates: Vec<(usize, Real)> = self
            .sorted
            .depth_range(depth)
            .into_par_iter()
            .map_init(
                || NeighborKey3::new(self.sorted.levels),
                |key, i| {
                    let node = self.sorted.nodes[i];
                    let idx = self.tree[node].data.point_index;
                    if idx == -1 {
                        return None;
                    }
                    key.neighbors3(&self.tree, node);
                    let value = self.weighted_coarser_function_value(key, node, met_solution);
                    Some((idx as usize, value))
                },
            )
            .flatten()
            .collect();
        for (idx, value) in updates {
            self.points[idx].coarser_value = value;
        }
    }

    /// The cumulative coarser function value at a cell's screening point,
    /// multiplied by the point's weight.
    fn weighted_coarser_function_value(
        &self,
        key: &NeighborKey3,
        node: NodeId,
        met_solution: &[Real],
    ) -> Real {
        let depth = self.tree[node].depth();
        let idx = self.tree[node].data.point_index;
        if self.boundary == BoundaryType::Dirichlet && depth == 0 && idx != -1 {
            return -0.5 * self.points[idx as usize].weight;
        }
        if (self.boundary != BoundaryType::Free && depth == 0)
            || (self.boundary == BoundaryType::Free && depth <= 2)
            || idx == -1
        {
            return 0.0;
        }

        let point = &self.points[idx as usize];
        let weight = point.weight;
        let p = point.position;
        let neighbors = key.cached(depth - 1);
        let parent = neighbors.nodes[1][1][1].expect("cached parent neighborhood");
        let (pd, poff) = self.tree[parent].depth_and_offset();

        let mut value = 0.0;
        for j in 0..3i32 {
            let x_value = self.fdata.value(pd, poff[0] + j - 1, p.x);
            if x_value == 0.0 {
                continue;
            }
            for k in 0..3i32 {
                let xy_value = x_value * self.fdata.value(pd, poff[1] + k - 1, p.y);
                if xy_value == 0.0 {
                    continue;
                }
                let mut z_value = 0.0;
                for l in 0..3i32 {
                    if let Some(basis_node) =
                        neighbors.nodes[j as usize][k as usize][l as usize]
                    {
                        if self.tree[basis_node].data.node_index >= 0 {
                            z_value += self.fdata.value(pd, poff[2] + l - 1, p.z)
                                * met_solution[self.tree[basis_node].data.node_index as usize];
                        }
                    }
                }
                value += xy_value * z_value;
            }
        }
        if self.boundary == BoundaryType::Dirichlet {
            value -= 0.5;
        }
        value * weight
    }

    fn is_matrix_interior(&self, d: usize, off: [i32; 3], margin: i32) -> bool {
        let mn = if self.boundary == BoundaryType::Free {
            (1i32 << (d.max(2) - 2)) + margin
        } else {
            margin
        };
        let mx = (1i32 << d) - mn;
        off.iter().all(|&v| v >= mn && v < mx)
    }

    /// The screening quadratic-form contributions of a row node's 3³
    /// point neighborhood, spread over its 5³ coupling window.
    fn screening_row_values(
        &self,
        d: usize,
        off: [i32; 3],
        neighbors5: &Neighbors5,
    ) -> [[[Real; 5]; 5]; 5] {
        let mut point_values = [[[0.0 as Real; 5]; 5]; 5];
        for i in 0..3usize {
            for j in 0..3usize {
                for k in 0..3usize {
                    let Some(other) = neighbors5.nodes[i + 1][j + 1][k + 1] else {
                        continue;
                    };
                    let idx = self.tree[other].data.point_index;
                    if idx == -1 {
                        continue;
                    }
                    let point = &self.points[idx as usize];
                    let p = point.position;
                    let mut basis = [[0.0 as Real; 5]; 3];
                    for (axis, row) in basis.iter_mut().enumerate() {
                        for (s, v) in row.iter_mut().enumerate() {
                            *v = self.fdata.value(d, off[axis] + s as i32 - 2, p[axis]);
                        }
                    }
                    let center_value = basis[0][2] * basis[1][2] * basis[2][2];
                    if center_value == 0.0 {
                        continue;
                    }
                    let weighted = center_value * point.weight;
                    for (x, plane) in point_values.iter_mut().enumerate() {
                        for (y, row) in plane.iter_mut().enumerate() {
                            for (z, v) in row.iter_mut().enumerate() {
                                *v += weighted * basis[0][x] * basis[1][y] * basis[2][z];
                            }
                        }
                    }
                }
            }
        }
        point_values
    }

    /// Builds one upper-triangular matrix row (diagonal halved) over the
    /// restricted 5³ `range`, with columns relative to `offset` through the
    /// current node indices.
    fn set_matrix_row(
        &self,
        node: NodeId,
        neighbors5: &Neighbors5,
        offset: usize,
        stencil: &Stencil5,
        range: Range3D,
    ) -> Vec<MatrixEntry> {
        let (d, off) = self.tree[node].depth_and_offset();
        let is_interior = self.is_matrix_interior(d, off, 2);
        let point_values = if self.constrain_values {
            Some(self.screening_row_values(d, off, neighbors5))
        } else {
            None
        };

        let mut row = Vec::new();
        for x in range.start[0]..range.end[0].min(3) {
            for y in range.start[1]..range.end[1] {
                if x == 2 && y > 2 {
                    break;
                }
                for z in range.start[2]..range.end[2] {
                    if x == 2 && y == 2 && z > 2 {
                        break;
                    }
                    let Some(other) = neighbors5.nodes[x][y][z] else {
                        continue;
                    };
                    if self.tree[other].data.node_index < 0 {
                        continue;
                    }
                    let mut value = if is_interior {
                        stencil[x][y][z]
                    } else {
                        let (_, ooff) = self.tree[other].depth_and_offset();
                        stencils::laplacian(&self.fdata, d, off, ooff, false)
                    };
                    if let Some(pv) = &point_values {
                        value += pv[x][y][z];
                    }
                    if x == 2 && y == 2 && z == 2 {
                        value /= 2.0;
                    }
                    if value.abs() > MATRIX_ENTRY_EPSILON {
                        row.push(MatrixEntry::new(
                            self.tree[other].data.node_index as usize - offset,
                            value,
                        ));
                    }
                }
            }
        }
        row
    }

    /// The amount to subtract from a node's constraint for the coarser
    /// cumulative solution and the coarser screening values.
    fn constraint_from_coarser(
        &self,
        node: NodeId,
        neighbors5: &Neighbors5,
        parent_neighbors5: &Neighbors5,
        met_solution: &[Real],
        child_stencil: &Stencil5,
    ) -> Real {
        let (d, off) = self.tree[node].depth_and_offset();
        if d <= self.min_depth {
            return 0.0;
        }
        let is_interior = self.is_matrix_interior(d, off, 4);
        let mut range = Range3D::full5();
        stencils::update_coarser_support_bounds(self.tree[node].child_index(), &mut range);

        let mut delta = 0.0;
        for x in range.start[0]..range.end[0] {
            for y in range.start[1]..range.end[1] {
                for z in range.start[2]..range.end[2] {
                    let Some(other) = parent_neighbors5.nodes[x][y][z] else {
                        continue;
                    };
                    if self.tree[other].data.node_index < 0 {
                        continue;
                    }
                    let solution = met_solution[self.tree[other].data.node_index as usize];
                    delta += if is_interior {
                        child_stencil[x][y][z] * solution
                    } else {
                        let (_, ooff) = self.tree[other].depth_and_offset();
                        stencils::laplacian(&self.fdata, d, off, ooff, true) * solution
                    };
                }
            }
        }

        if self.constrain_values {
            let mut screening = 0.0;
            for x in 1..4usize {
                for y in 1..4usize {
                    for z in 1..4usize {
                        let Some(other) = neighbors5.nodes[x][y][z] else {
                            continue;
                        };
                        let idx = self.tree[other].data.point_index;
                        if idx == -1 {
                            continue;
                        }
                        let point = &self.points[idx as usize];
                        let p = point.position;
                        screening += self.fdata.value(d, off[0], p.x)
                            * self.fdata.value(d, off[1], p.y)
                            * self.fdata.value(d, off[2], p.z)
                            * point.coarser_value;
                    }
                }
            }
            delta += screening;
        }
        delta
    }

    fn cg_schedule(&self, rows: usize) -> (usize, Real) {
        match self.fixed_iters {
            Some(iters) => (iters, 1.0e-10),
            None => (
                ((rows as Real).powf(ITERATION_POWER) as usize).max(self.min_iters),
                (self.accuracy / 1.0e5) * rows as Real,
            ),
        }
    }

    fn inset_supported(&self, node: NodeId) -> bool {
        if self.boundary != BoundaryType::Free {
            return true;
        }
        let (d, off) = self.tree[node].depth_and_offset();
        is_inset_supported(d, off)
    }

    /// Assembles and solves the full system of one depth.
    fn solve_fixed_depth(&mut self, depth: usize, met_solution: &mut [Real]) -> usize {
        let start = self.sorted.node_count[depth];
        let end = self.sorted.node_count[depth + 1];
        let rows = end - start;

        let mut x = if depth <= self.min_depth {
            self.up_sample_coarser_solution(depth)
        } else {
            vec![0.0 as Real; rows]
        };
        if depth > self.min_depth {
            self.prepare_coarser_state(depth, met_solution);
        } else if self.constrain_values {
            self.set_coarser_point_values(depth, met_solution);
        }

        let stencil = stencils::laplacian_stencil(&self.fdata, depth);
        let child_stencils = stencils::laplacian_stencils(&self.fdata, depth);

        let met: &[Real] = met_solution;
        let assembled: Vec<(Vec<MatrixEntry>, Real)> = (start..end)
            .into_par_iter()
            .map_init(
                || NeighborKey3::new(self.sorted.levels),
                |key, i| {
                    let node = self.sorted.nodes[i];
                    if !self.inset_supported(node) {
                        return (vec![MatrixEntry::new(i - start, 1.0)], 0.0);
                    }
                    let neighbors5 = key.neighbors5(&self.tree, node);
                    let row =
                        self.set_matrix_row(node, &neighbors5, start, &stencil, Range3D::full5());
                    let delta = match self.tree[node].parent() {
                        Some(parent) => {
                            let child = self.tree[node].child_index();
                            let (cx, cy, cz) = crate::cube::factor_corner_index(child);
                            let parent_neighbors5 = key.neighbors5(&self.tree, parent);
                            self.constraint_from_coarser(
                                node,
                                &neighbors5,
                                &parent_neighbors5,
                                met,
                                child_stencils.at(cx, cy, cz),
                            )
                        }
                        None => 0.0,
                    };
                    (row, delta)
                },
            )
            .collect();

        let mut matrix = SparseSymmetricMatrix::zeros(rows);
        let mut b = vec![0.0 as Real; rows];
        for (j, (row, delta)) in assembled.into_iter().enumerate() {
            let node = self.sorted.nodes[start + j];
            self.tree[node].data.constraint -= delta;
            matrix.set_row(j, row);
            b[j] = if self.inset_supported(node) {
                self.tree[node].data.constraint
            } else {
                0.0
            };
        }

        let (iters, eps) = self.cg_schedule(rows);
        let full_res = {
            let mut res = 1i64 << depth;
            if self.boundary == BoundaryType::Free && depth > 3 {
                res -= 1i64 << (depth - 2);
            }
            res
        };
        let add_dc_term = rows as i64 == full_res * full_res * full_res
            && !self.constrain_values
            && self.boundary != BoundaryType::Dirichlet;
        let iterations = sparse::solve(&matrix, &b, iters, &mut x, eps, false, add_dc_term);
        log::debug!(
            "depth {depth}: {} entries, {iterations} iterations",
            matrix.entries()
        );

        for (j, &value) in x.iter().enumerate() {
            let node = self.sorted.nodes[start + j];
            self.tree[node].data.solution = value;
        }
        iterations
    }

    /// All depth-`depth` nodes whose support interacts with the subtree of
    /// `coarse`: its descendants plus the in-window descendants of its 3³
    /// co-depth neighborhood.
    fn restricted_node_set(&self, coarse: NodeId, depth: usize) -> Vec<usize> {
        let (cd, coff) = self.tree[coarse].depth_and_offset();
        let shift = depth - cd;
        let window = |axis: usize, off: i32| -> bool {
            let lo = (coff[axis] << shift) - 2;
            let hi = ((coff[axis] + 1) << shift) + 1;
            off >= lo && off <= hi
        };

        let mut entries = Vec::new();
        for i in -1..=1i32 {
            for j in -1..=1i32 {
                for k in -1..=1i32 {
                    let Some(neighbor) = self.tree.neighbor_by_offset(coarse, [i, j, k]) else {
                        continue;
                    };
                    let mut stack = vec![neighbor];
                    while let Some(id) = stack.pop() {
                        let d = self.tree[id].depth();
                        if d == depth {
                            let (_, off) = self.tree[id].depth_and_offset();
                            if self.tree[id].data.node_index != -1
                                && (0..3).all(|axis| window(axis, off[axis]))
                            {
                                entries.push(self.tree[id].data.node_index as usize);
                            }
                            continue;
                        }
                        if self.tree[id].has_children() {
                            stack.extend((0..8).map(|c| self.tree.child(id, c)));
                        }
                    }
                }
            }
        }
        entries.sort_unstable();
        entries.dedup();
        entries
    }

    /// Partitioned per-subtree solve for deep levels.
    fn solve_fixed_depth_partitioned(
        &mut self,
        depth: usize,
        met_solution: &mut [Real],
        starting_depth: usize,
    ) -> usize {
        if starting_depth >= depth {
            return self.solve_fixed_depth(depth, met_solution);
        }

        if depth > self.min_depth {
            self.prepare_coarser_state(depth, met_solution);
        } else if self.constrain_values {
            self.set_coarser_point_values(depth, met_solution);
        }

        let start = self.sorted.node_count[depth];
        let end = self.sorted.node_count[depth + 1];

        // Back up the constraints of this depth.
        let mut b_backup = vec![0.0 as Real; end - start];
        for i in start..end {
            let node = self.sorted.nodes[i];
            b_backup[i - start] = if self.inset_supported(node) {
                self.tree[node].data.constraint
            } else {
                0.0
            };
        }

        let coarse_depth = if self.boundary == BoundaryType::Free {
            depth - starting_depth + 1
        } else {
            depth - starting_depth
        };
        let stencil = stencils::laplacian_stencil(&self.fdata, depth);
        let child_stencils = stencils::laplacian_stencils(&self.fdata, depth);

        let mut total_iterations = 0;
        let coarse_range = self.sorted.depth_range(coarse_depth);
        for ci in coarse_range {
            let coarse = self.sorted.nodes[ci];
            let entries = self.restricted_node_set(coarse, depth);
            if entries.is_empty() {
                continue;
            }
            let n = entries.len();

            let mut local_b = vec![0.0 as Real; n];
            let mut local_x = vec![0.0 as Real; n];
            for (j, &e) in entries.iter().enumerate() {
                local_b[j] = b_backup[e - start];
                local_x[j] = self.tree[self.sorted.nodes[e]].data.solution;
            }

            // Temporarily renumber the restricted nodes.
            for (j, &e) in entries.iter().enumerate() {
                let node = self.sorted.nodes[e];
                self.tree[node].data.node_index = j as i32;
            }

            let (cd, coff) = self.tree[coarse].depth_and_offset();
            let met: &[Real] = met_solution;
            let assembled: Vec<(Vec<MatrixEntry>, Real)> = (0..n)
                .into_par_iter()
                .map_init(
                    || NeighborKey3::new(self.sorted.levels),
                    |key, j| {
                        let node = self.sorted.nodes[entries[j]];
                        if !self.inset_supported(node) {
                            return (vec![MatrixEntry::new(j, 1.0)], 0.0);
                        }
                        let (d, off) = self.tree[node].depth_and_offset();
                        let shift = d - cd;
                        let under = (0..3).all(|a| (off[a] >> shift) == coff[a]);
                        let range = if under {
                            Range3D::full5()
                        } else {
                            set_matrix_row_bounds(off, coff, shift)
                        };

                        let neighbors5 = key.neighbors5(&self.tree, node);
                        let row = self.set_matrix_row(node, &neighbors5, 0, &stencil, range);
                        let delta = match self.tree[node].parent() {
                            Some(parent) => {
                                let child = self.tree[node].child_index();
                                let (cx, cy, cz) = crate::cube::factor_corner_index(child);
                                let parent_neighbors5 = key.neighbors5(&self.tree, parent);
                                self.constraint_from_coarser(
                                    node,
                                    &neighbors5,
                                    &parent_neighbors5,
                                    met,
                                    child_stencils.at(cx, cy, cz),
                                )
                            }
                            None => 0.0,
                        };
                        (row, delta)
                    },
                )
                .collect();

            let mut matrix = SparseSymmetricMatrix::zeros(n);
            for (j, (row, delta)) in assembled.into_iter().enumerate() {
                matrix.set_row(j, row);
                local_b[j] -= delta;
            }

            // Restore the global numbering.
            for &e in &entries {
                let node = self.sorted.nodes[e];
                self.tree[node].data.node_index = e as i32;
            }

            let (iters, eps) = self.cg_schedule(n);
            total_iterations +=
                sparse::solve(&matrix, &local_b, iters, &mut local_x, eps, false, false);

            // Write back only the nodes rooted at (or ordered after) this
            // coarse cell, so shared border cells are finalized exactly once.
            let coarse_index = self.tree[coarse].data.node_index;
            for (j, &e) in entries.iter().enumerate() {
                let node = self.sorted.nodes[e];
                let mut temp = node;
                while self.tree[temp].depth() > cd {
                    temp = self.tree[temp].parent().expect("deeper than coarse depth");
                }
                if self.tree[temp].data.node_index >= coarse_index {
                    self.tree[node].data.solution = local_x[j];
                }
            }
        }
        total_iterations
    }
}

/// Clamps a 5³ row range to the interaction window of the coarse cell at
/// offset `coarse_off`, for a node `shift` depths below it.
fn set_matrix_row_bounds(off: [i32; 3], coarse_off: [i32; 3], shift: usize) -> Range3D {
    let width = 1i32 << shift;
    let mut range = Range3D::full5();
    for axis in 0..3 {
        let rel = off[axis] - (coarse_off[axis] << shift);
        range.start[axis] = if rel < 0 { (-rel) as usize } else { 0 };
        range.end[axis] = if rel >= width {
            (4 - (rel - width)) as usize
        } else {
            5
        };
    }
    range
}
