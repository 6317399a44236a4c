//! Divergence constraints and the inter-depth transfer operators.

use crate::bspline::BoundaryType;
use crate::octree::{NeighborKey3, NodeId, Octree};
use crate::poisson::Reconstructor;
use crate::sorted_nodes::SortedNodes;
use crate::stencils::{self, Range3D};
use crate::Real;
use na::Vector3;
use rayon::prelude::*;
use std::ops::{AddAssign, Mul};

/// One axis of the dyadic prolongation: which parent pair a child overlaps
/// and with what weights.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct UpSampleData {
    pub start: usize,
    pub v: [Real; 2],
}

fn up_sample_data(depth: usize, off: i32, corner_value: Real) -> UpSampleData {
    if off == 0 {
        UpSampleData {
            start: 1,
            v: [corner_value, 0.0],
        }
    } else if off + 1 == 1 << depth {
        UpSampleData {
            start: 0,
            v: [0.0, corner_value],
        }
    } else if off % 2 == 1 {
        UpSampleData {
            start: 1,
            v: [0.75, 0.25],
        }
    } else {
        UpSampleData {
            start: 0,
            v: [0.25, 0.75],
        }
    }
}

/// Visits, for every depth-`depth` node, the parent-depth nodes its basis
/// function is a dyadic combination of, with the tensor weights.
pub(crate) fn up_sample_generic(
    tree: &Octree,
    sorted: &SortedNodes,
    boundary: BoundaryType,
    depth: usize,
    mut f: impl FnMut(usize, NodeId, &[UpSampleData; 3], [usize; 3]),
) {
    let corner_value = boundary.corner_value();
    let mut key = NeighborKey3::new(sorted.levels);
    for i in sorted.depth_range(depth) {
        let node = sorted.nodes[i];
        let (d, off) = tree[node].depth_and_offset();
        let us: [UpSampleData; 3] =
            std::array::from_fn(|axis| up_sample_data(d, off[axis], corner_value));
        let parent = tree[node].parent().expect("up-sampling above the root");
        let neighbors = key.neighbors3(tree, parent);
        for ii in 0..2 {
            for jj in 0..2 {
                for kk in 0..2 {
                    let candidate =
                        neighbors.nodes[ii + us[0].start][jj + us[1].start][kk + us[2].start];
                    if let Some(other) = candidate {
                        if tree[other].data.node_index != -1 {
                            f(i, other, &us, [ii, jj, kk]);
                        }
                    }
                }
            }
        }
    }
}

impl Reconstructor {
    fn transfer_floor(&self) -> usize {
        if self.boundary == BoundaryType::Free {
            2
        } else {
            0
        }
    }

    /// Fine-to-coarse accumulation of per-node quantities indexed by the
    /// global sorted order.
    pub(crate) fn down_sample<C>(&self, depth: usize, values: &mut [C])
    where
        C: Copy + AddAssign + Mul<Real, Output = C>,
    {
        if depth == 0 {
            return;
        }
        let mut updates: Vec<(usize, C)> = Vec::new();
        up_sample_generic(
            &self.tree,
            &self.sorted,
            self.boundary,
            depth,
            |i, coarse, us, idx| {
                let w = us[0].v[idx[0]] * us[1].v[idx[1]] * us[2].v[idx[2]];
                updates.push((self.tree[coarse].data.node_index as usize, values[i] * w));
            },
        );
        for (i, v) in updates {
            values[i] += v;
        }
    }

    /// Coarse-to-fine prolongation of per-node quantities indexed by the
    /// global sorted order, in place.
    pub(crate) fn up_sample<C>(&self, depth: usize, values: &mut [C])
    where
        C: Copy + AddAssign + Mul<Real, Output = C>,
    {
        if (self.boundary != BoundaryType::Free && depth == 0)
            || (self.boundary == BoundaryType::Free && depth <= 2)
        {
            return;
        }
        let mut updates: Vec<(usize, C)> = Vec::new();
        up_sample_generic(
            &self.tree,
            &self.sorted,
            self.boundary,
            depth,
            |i, coarse, us, idx| {
                let w = us[0].v[idx[0]] * us[1].v[idx[1]] * us[2].v[idx[2]];
                updates.push((i, values[self.tree[coarse].data.node_index as usize] * w));
            },
        );
        for (i, v) in updates {
            values[i] += v;
        }
    }

    /// Coarse-to-fine prolongation like [`Self::up_sample`], but anchored at
    /// the solver's pivot depth rather than the transfer floor.
    pub(crate) fn up_sample_cumulative(&self, depth: usize, values: &mut [Real]) {
        if depth <= self.min_depth {
            return;
        }
        let mut updates: Vec<(usize, Real)> = Vec::new();
        up_sample_generic(
            &self.tree,
            &self.sorted,
            self.boundary,
            depth,
            |i, coarse, us, idx| {
                let w = us[0].v[idx[0]] * us[1].v[idx[1]] * us[2].v[idx[2]];
                updates.push((i, values[self.tree[coarse].data.node_index as usize] * w));
            },
        );
        for (i, v) in updates {
            values[i] += v;
        }
    }

    /// Distributes `∫ ∇φ · n̂` over the tree: every splatted normal
    /// constrains its co-depth 5³ neighborhood directly, its parent-depth
    /// neighborhood by scatter, and (through down/up-sampled coefficients)
    /// every other depth.
    pub(crate) fn set_laplacian_constraints(&mut self) {
        let max_depth = self.sorted.levels - 1;
        let floor = self.transfer_floor();
        let gradient_domain = self.gradient_domain;

        let mut current = None;
        while let Some(id) = self.tree.next_node(self.tree.root(), current) {
            self.tree[id].data.constraint = 0.0;
            current = Some(id);
        }

        let mut constraints = vec![0.0 as Real; self.sorted.node_count[max_depth]];

        for d in (floor..=max_depth).rev() {
            let stencil = stencils::divergence_stencil(&self.fdata, d, false, gradient_domain);
            let parent_stencils =
                stencils::divergence_stencils(&self.fdata, d, true, gradient_domain);
            let range = self.sorted.depth_range(d);

            // Same-depth gather plus parent-depth scatter, collected per
            // node and folded into per-thread partial buffers.
            let (self_adds, parent_partials): (Vec<Real>, Vec<Vec<(usize, Real)>>) = range
                .clone()
                .into_par_iter()
                .map_init(
                    || NeighborKey3::new(self.sorted.levels),
                    |key, i| {
                        let node = self.sorted.nodes[i];
                        let neighbors5 = key.neighbors5(&self.tree, node);
                        let (_, off) = self.tree[node].depth_and_offset();

                        let mn = if self.boundary == BoundaryType::Free {
                            (1i32 << (d.max(2) - 2)) + 2
                        } else {
                            2
                        };
                        let mx = (1i32 << d) - mn;
                        let is_interior = off.iter().all(|&v| v >= mn && v < mx);
                        let (mn2, mx2) = (mn + 2, mx - 2);
                        let is_interior2 = off.iter().all(|&v| v >= mn2 && v < mx2);

                        let mut self_add = 0.0;
                        for x in 0..5usize {
                            for y in 0..5usize {
                                for z in 0..5usize {
                                    let Some(other) = neighbors5.nodes[x][y][z] else {
                                        continue;
                                    };
                                    let ni = self.tree[other].data.normal_index;
                                    if ni < 0 {
                                        continue;
                                    }
                                    let normal = self.normals[ni as usize];
                                    self_add += if is_interior {
                                        stencil[x][y][z].dot(&normal)
                                    } else {
                                        let (_, noff) = self.tree[other].depth_and_offset();
                                        stencils::divergence2(
                                            &self.fdata,
                                            d,
                                            off,
                                            noff,
                                            false,
                                            gradient_domain,
                                        )
                                        .dot(&normal)
                                    };
                                }
                            }
                        }

                        let mut scattered = Vec::new();
                        let ni = self.tree[node].data.normal_index;
                        if d > 0 && self.tree[node].data.node_index >= 0 && ni >= 0 {
                            let normal = self.normals[ni as usize];
                            if normal != Vector3::zeros() {
                                let mut range = Range3D::full5();
                                stencils::update_coarser_support_bounds(
                                    self.tree[node].child_index(),
                                    &mut range,
                                );
                                let child = self.tree[node].child_index();
                                let (cx, cy, cz) = crate::cube::factor_corner_index(child);
                                let child_stencil = parent_stencils.at(cx, cy, cz);
                                let parent = self.tree[node].parent().unwrap();
                                let parents5 = key.neighbors5(&self.tree, parent);
                                for x in range.start[0]..range.end[0] {
                                    for y in range.start[1]..range.end[1] {
                                        for z in range.start[2]..range.end[2] {
                                            let Some(other) = parents5.nodes[x][y][z] else {
                                                continue;
                                            };
                                            if self.tree[other].data.node_index == -1 {
                                                continue;
                                            }
                                            let c = if is_interior2 {
                                                child_stencil[x][y][z].dot(&normal)
                                            } else {
                                                let (_, noff) =
                                                    self.tree[other].depth_and_offset();
                                                stencils::divergence1(
                                                    &self.fdata,
                                                    d,
                                                    off,
                                                    noff,
                                                    true,
                                                    gradient_domain,
                                                )
                                                .dot(&normal)
                                            };
                                            scattered.push((
                                                self.tree[other].data.node_index as usize,
                                                c,
                                            ));
                                        }
                                    }
                                }
                            }
                        }
                        (self_add, scattered)
                    },
                )
                .unzip();

            for (i, add) in range.clone().zip(self_adds) {
                let node = self.sorted.nodes[i];
                self.tree[node].data.constraint += add;
            }
            for partial in parent_partials {
                for (i, c) in partial {
                    constraints[i] += c;
                }
            }
        }

        // Aggregate per-depth normal coefficients.
        let mut coefficients = vec![Vector3::<Real>::zeros(); self.sorted.node_count[max_depth]];
        for i in 0..self.sorted.node_count[max_depth] {
            let node = self.sorted.nodes[i];
            let ni = self.tree[node].data.normal_index;
            if self.tree[node].data.node_index >= 0 && ni >= 0 {
                coefficients[i] += self.normals[ni as usize];
            }
        }

        // Fine-to-coarse down-sampling of constraints.
        for d in (floor..max_depth).rev() {
            self.down_sample(d, &mut constraints);
        }
        // Coarse-to-fine up-sampling of coefficients.
        for d in floor..max_depth {
            self.up_sample(d, &mut coefficients);
        }
        for (i, c) in constraints.iter().enumerate() {
            let node = self.sorted.nodes[i];
            self.tree[node].data.constraint += c;
        }

        // Contribution of all coarser depths through the up-sampled
        // coefficients.
        for d in 1..=max_depth {
            let cp_stencils = stencils::divergence_stencils(&self.fdata, d, false, gradient_domain);
            let range = self.sorted.depth_range(d);
            let adds: Vec<Real> = range
                .clone()
                .into_par_iter()
                .map_init(
                    || NeighborKey3::new(self.sorted.levels),
                    |key, i| {
                        let node = self.sorted.nodes[i];
                        let (_, off) = self.tree[node].depth_and_offset();
                        let mut range = Range3D::full5();
                        let child = self.tree[node].child_index();
                        stencils::update_coarser_support_bounds(child, &mut range);
                        let (cx, cy, cz) = crate::cube::factor_corner_index(child);
                        let stencil = cp_stencils.at(cx, cy, cz);

                        let mn = if self.boundary == BoundaryType::Free {
                            (1i32 << (d.max(2) - 2)) + 4
                        } else {
                            4
                        };
                        let mx = (1i32 << d) - mn;
                        let is_interior = off.iter().all(|&v| v >= mn && v < mx);

                        let parent = self.tree[node].parent().unwrap();
                        let parents5 = key.neighbors5(&self.tree, parent);
                        let mut constraint = 0.0;
                        for x in range.start[0]..range.end[0] {
                            for y in range.start[1]..range.end[1] {
                                for z in range.start[2]..range.end[2] {
                                    let Some(other) = parents5.nodes[x][y][z] else {
                                        continue;
                                    };
                                    if self.tree[other].data.node_index == -1 {
                                        continue;
                                    }
                                    let normal =
                                        coefficients[self.tree[other].data.node_index as usize];
                                    constraint += if is_interior {
                                        stencil[x][y][z].dot(&normal)
                                    } else {
                                        let (_, noff) = self.tree[other].depth_and_offset();
                                        stencils::divergence2(
                                            &self.fdata,
                                            d,
                                            off,
                                            noff,
                                            true,
                                            gradient_domain,
                                        )
                                        .dot(&normal)
                                    };
                                }
                            }
                        }
                        constraint
                    },
                )
                .collect();
            for (i, add) in range.zip(adds) {
                let node = self.sorted.nodes[i];
                self.tree[node].data.constraint += add;
            }
        }

        // The iso-value weights are the normal magnitudes.
        let slot = self.center_weight_slot();
        for i in 0..self.sorted.len() {
            let node = self.sorted.nodes[i];
            let ni = self.tree[node].data.normal_index;
            let w = if self.tree[node].data.node_index < 0 || ni < 0 {
                0.0
            } else {
                self.normals[ni as usize].norm()
            };
            self.tree[node].data.center_weights[slot] = w;
        }

        self.normals.clear();
        self.normals.shrink_to_fit();
    }
}
