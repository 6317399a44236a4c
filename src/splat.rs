//! The two-pass point pipeline: bounding, density splatting, normal
//! splatting, and screening accumulation.

use crate::bspline::BoundaryType;
use crate::octree::{corner_index_of_point, NodeId};
use crate::points::PointStream;
use crate::poisson::{Reconstructor, ScreeningPoint};
use crate::{Error, Real, EPSILON};
use na::{Matrix3, Point3, Vector3};
use parry::bounding_volume::Aabb;

// Splatting happens along a co-dimension one manifold, so uniform samples do
// not produce a unit kernel mass.
const SAMPLE_SCALE: Real = 1.0 / (0.125 * 0.125 + 0.75 * 0.75 + 0.125 * 0.125);

/// Per-axis weights of the order-2 splat kernel of a cell against a point.
fn splat_kernel(center: &Point3<Real>, width: Real, position: &Point3<Real>) -> [[Real; 3]; 3] {
    let mut dx = [[0.0; 3]; 3];
    for axis in 0..3 {
        let x = (center[axis] - position[axis] - width) / width;
        dx[axis][0] = 1.125 + 1.5 * x + 0.5 * x * x;
        let x = (center[axis] - position[axis]) / width;
        dx[axis][1] = 0.75 - x * x;
        dx[axis][2] = 1.0 - dx[axis][1] - dx[axis][0];
    }
    dx
}

impl Reconstructor {
    fn in_bounds(&self, p: &Point3<Real>) -> bool {
        let e = if self.boundary == BoundaryType::Free {
            0.25
        } else {
            0.0
        };
        p.iter().all(|&v| v >= e && v <= 1.0 - e)
    }

    /// Streams the samples twice and builds the adapted tree: pass one
    /// accumulates the bounding cube and the density weights down to the
    /// splat depth, pass two splats normals at the density-adapted depth and
    /// aggregates the screening points.
    ///
    /// Returns the number of samples splatted.
    pub fn set_tree(&mut self, stream: &mut dyn PointStream) -> Result<usize, Error> {
        let xform = self.xform;
        let xform_normal = {
            let linear: Matrix3<Real> = self.xform.fixed_view::<3, 3>(0, 0).into_owned();
            match linear.transpose().try_inverse() {
                Some(inv) => inv,
                None => {
                    log::warn!("singular input transform; normals left untransformed");
                    Matrix3::identity()
                }
            }
        };

        // Bounding pass.
        let mut aabb = Aabb::new_invalid();
        stream.reset();
        let mut any = false;
        while let Some((p, _)) = stream.next_point() {
            let p = xform.transform_point(&p);
            aabb.mins = Point3::from(aabb.mins.coords.inf(&p.coords));
            aabb.maxs = Point3::from(aabb.maxs.coords.sup(&p.coords));
            any = true;
        }
        if !any {
            return Ok(0);
        }
        let extents = aabb.extents();
        self.scale = extents.max()
            * if self.boundary == BoundaryType::Free {
                2.0 * self.scale_factor
            } else {
                self.scale_factor
            };
        if self.scale <= 0.0 {
            self.scale = 1.0;
        }
        self.center = aabb.center() - Vector3::repeat(self.scale / 2.0);

        self.tree.set_full_depth(self.full_depth);

        // Density pass down to the splat depth.
        if self.splat_depth > 0 {
            stream.reset();
            while let Some((p, n)) = stream.next_point() {
                let p = Point3::from((xform.transform_point(&p) - self.center) / self.scale);
                let n = xform_normal * n;
                if !self.in_bounds(&p) {
                    continue;
                }
                let weight = if self.use_confidence { n.norm() } else { 1.0 };
                let mut node = self.tree.root();
                for _ in 0..self.splat_depth {
                    self.update_weight_contribution(node, &p, weight);
                    self.tree.split(node);
                    let (center, _) = self.tree[node].center_and_width();
                    node = self.tree.child(node, corner_index_of_point(&center, &p));
                }
                self.update_weight_contribution(node, &p, weight);
            }
        }

        // Splatting pass.
        let mut point_weight_sum = 0.0;
        let mut count = 0usize;
        stream.reset();
        while let Some((p, n)) = stream.next_point() {
            let p = Point3::from((xform.transform_point(&p) - self.center) / self.scale);
            let n = xform_normal * (-n);
            if !self.in_bounds(&p) {
                continue;
            }
            let normal_length = n.norm();
            if normal_length <= EPSILON {
                continue;
            }
            let n = if self.use_confidence {
                n
            } else {
                n / normal_length
            };

            if self.samples_per_node > 0.0 && self.splat_depth > 0 {
                point_weight_sum += self.splat_oriented_point(&p, &n);
            } else {
                let mut node = self.tree.root();
                let mut n = n;
                if self.splat_depth > 0 {
                    for _ in 0..self.splat_depth {
                        let (center, _) = self.tree[node].center_and_width();
                        node = self.tree.child(node, corner_index_of_point(&center, &p));
                    }
                    let point_weight = self.sample_weight(node, &p);
                    n *= point_weight;
                    point_weight_sum += point_weight;
                }
                while self.tree[node].depth() < self.max_depth {
                    self.tree.split(node);
                    let (center, _) = self.tree[node].center_and_width();
                    node = self.tree.child(node, corner_index_of_point(&center, &p));
                }
                self.splat_normal(node, &p, &n);
            }

            if self.constrain_values {
                let screening_weight = if self.use_normal_weights {
                    normal_length
                } else {
                    1.0
                };
                let mut node = self.tree.root();
                loop {
                    let idx = self.tree[node].data.point_index;
                    if idx == -1 {
                        self.tree[node].data.point_index = self.points.len() as i32;
                        self.points.push(ScreeningPoint {
                            position: Point3::from(p.coords * screening_weight),
                            weight: screening_weight,
                            coarser_value: 0.0,
                        });
                    } else {
                        let point = &mut self.points[idx as usize];
                        point.position += p.coords * screening_weight;
                        point.weight += screening_weight;
                    }
                    if !self.tree[node].has_children() {
                        break;
                    }
                    let (center, _) = self.tree[node].center_and_width();
                    node = self.tree.child(node, corner_index_of_point(&center, &p));
                }
            }
            count += 1;
        }

        if count == 0 {
            return Ok(0);
        }
        if self.boundary == BoundaryType::Free {
            point_weight_sum *= 4.0;
        }
        self.constraint_weight *= point_weight_sum / count as Real;

        if self.constrain_values {
            let exponent = self.adaptive_exponent;
            let (depth_bias, max_bias) = if self.boundary == BoundaryType::Free {
                (1, 1)
            } else {
                (0, 0)
            };
            let max_depth = self.max_depth;
            let mut current = None;
            while let Some(id) = self.tree.next_node(self.tree.root(), current) {
                current = Some(id);
                let idx = self.tree[id].data.point_index;
                if idx == -1 {
                    continue;
                }
                let nd = self.tree[id].depth() as i32 - depth_bias;
                let md = max_depth as i32 - max_bias;
                let e = nd * exponent - md * (exponent - 1);
                let mul = if e < 0 {
                    1.0 / (1i64 << -e) as Real
                } else {
                    (1i64 << e) as Real
                };
                let point = &mut self.points[idx as usize];
                point.position /= point.weight;
                point.weight *= mul * self.constraint_weight;
            }
        }

        if self.force_neumann && self.boundary == BoundaryType::Neumann {
            let mut current = None;
            while let Some(id) = self.tree.next_node(self.tree.root(), current) {
                current = Some(id);
                let idx = self.tree[id].data.normal_index;
                if idx < 0 {
                    continue;
                }
                let (d, off) = self.tree[id].depth_and_offset();
                let res = 1i32 << d;
                for axis in 0..3 {
                    if off[axis] == 0 || off[axis] == res - 1 {
                        self.normals[idx as usize][axis] = 0.0;
                    }
                }
            }
        }

        Ok(count)
    }

    /// Adds the order-2 kernel of `position` into the density accumulator of
    /// the 3³ neighborhood around `node`, materializing missing cells.
    fn update_weight_contribution(&mut self, node: NodeId, position: &Point3<Real>, weight: Real) {
        let (center, width) = self.tree[node].center_and_width();
        let mut dx = splat_kernel(&center, width, position);
        for axis in 0..3 {
            dx[axis][0] *= SAMPLE_SCALE;
        }
        for i in 0..3i32 {
            for j in 0..3i32 {
                for k in 0..3i32 {
                    if let Some(neighbor) = self.tree.ensure_neighbor(node, [i - 1, j - 1, k - 1]) {
                        self.tree[neighbor].data.center_weights[0] +=
                            dx[0][i as usize] * dx[1][j as usize] * dx[2][k as usize] * weight;
                    }
                }
            }
        }
    }

    /// The reciprocal of the splatted density around `node` at `position`.
    pub(crate) fn sample_weight(&self, node: NodeId, position: &Point3<Real>) -> Real {
        let (center, width) = self.tree[node].center_and_width();
        let dx = splat_kernel(&center, width, position);
        let mut weight = 0.0;
        for i in 0..3i32 {
            for j in 0..3i32 {
                for k in 0..3i32 {
                    if let Some(neighbor) = self.tree.neighbor_by_offset(node, [i - 1, j - 1, k - 1])
                    {
                        weight += dx[0][i as usize]
                            * dx[1][j as usize]
                            * dx[2][k as usize]
                            * self.tree[neighbor].data.center_weights[0];
                    }
                }
            }
        }
        if weight <= 0.0 {
            return Real::INFINITY;
        }
        1.0 / weight
    }

    /// Climbs coarser cells until the splatted density reaches
    /// `samples_per_node`, interpolating a fractional depth; the returned
    /// weight is `4^-depth`.
    pub(crate) fn sample_depth_and_weight(
        &self,
        node: NodeId,
        position: &Point3<Real>,
    ) -> (Real, Real) {
        let mut current = node;
        let weight = self.sample_weight(current, position);
        let depth = if weight >= self.samples_per_node {
            self.tree[current].depth() as Real
                + (weight / self.samples_per_node).ln() / (4.0 as Real).ln()
        } else {
            let mut old_weight = weight;
            let mut new_weight = weight;
            while new_weight < self.samples_per_node {
                let Some(parent) = self.tree[current].parent() else {
                    break;
                };
                current = parent;
                old_weight = new_weight;
                new_weight = self.sample_weight(current, position);
            }
            let ratio = if new_weight > old_weight {
                (new_weight / old_weight).ln()
            } else {
                (4.0 as Real).ln()
            };
            self.tree[current].depth() as Real
                + (new_weight / self.samples_per_node).ln() / ratio
        };
        (depth, (4.0 as Real).powf(-depth))
    }

    /// Splats `normal` into the 3³ neighborhood of `node` with the order-2
    /// kernel, materializing missing cells.
    fn splat_normal(&mut self, node: NodeId, position: &Point3<Real>, normal: &Vector3<Real>) {
        let (center, width) = self.tree[node].center_and_width();
        let dx = splat_kernel(&center, width, position);
        for i in 0..3i32 {
            for j in 0..3i32 {
                for k in 0..3i32 {
                    if let Some(neighbor) = self.tree.ensure_neighbor(node, [i - 1, j - 1, k - 1]) {
                        let idx = if self.tree[neighbor].data.normal_index < 0 {
                            let idx = self.normals.len() as i32;
                            self.tree[neighbor].data.normal_index = idx;
                            self.normals.push(Vector3::zeros());
                            idx
                        } else {
                            self.tree[neighbor].data.normal_index
                        };
                        self.normals[idx as usize] +=
                            normal * (dx[0][i as usize] * dx[1][j as usize] * dx[2][k as usize]);
                    }
                }
            }
        }
    }

    /// Splats one oriented sample at its density-adapted depth, blending
    /// between the two nearest integer depths. Returns the sample weight.
    fn splat_oriented_point(&mut self, position: &Point3<Real>, normal: &Vector3<Real>) -> Real {
        let mut node = self.tree.root();
        while self.tree[node].depth() < self.splat_depth {
            if !self.tree[node].has_children() {
                log::warn!("splat descent hit an unrefined cell; sample skipped");
                return 0.0;
            }
            let (center, _) = self.tree[node].center_and_width();
            node = self.tree.child(node, corner_index_of_point(&center, position));
        }

        let (depth, weight) = self.sample_depth_and_weight(node, position);
        let depth = depth.clamp(self.min_depth as Real, self.max_depth as Real);
        let top_depth = (depth.ceil() as usize).clamp(self.min_depth, self.max_depth);

        while self.tree[node].depth() > top_depth {
            node = self.tree[node].parent().expect("depth > 0 implies parent");
        }
        while self.tree[node].depth() < top_depth {
            self.tree.split(node);
            let (center, _) = self.tree[node].center_and_width();
            node = self.tree.child(node, corner_index_of_point(&center, position));
        }

        let mut dx = 1.0 - (top_depth as Real - depth);
        let width = 1.0 / (1i64 << self.tree[node].depth()) as Real;
        let n = normal * (weight / width.powi(3) * dx);
        self.splat_normal(node, position, &n);
        if (1.0 - dx).abs() > EPSILON {
            dx = 1.0 - dx;
            let node = self.tree[node].parent().expect("blended splat above root");
            let width = 1.0 / (1i64 << self.tree[node].depth()) as Real;
            let n = normal * (weight / width.powi(3) * dx);
            self.splat_normal(node, position, &n);
        }
        weight
    }

    /// Does the subtree carry any non-zero splatted normal?
    fn has_normals(&self, node: NodeId) -> bool {
        let idx = self.tree[node].data.normal_index;
        if idx >= 0 && self.normals[idx as usize] != Vector3::zeros() {
            return true;
        }
        if !self.tree[node].has_children() {
            return false;
        }
        (0..8).any(|c| self.has_normals(self.tree.child(node, c)))
    }

    /// Collapses subtrees that received no normal mass.
    pub(crate) fn clip_tree(&mut self) {
        let min_depth = self.min_depth;
        let mut current = None;
        let mut clipped = 0usize;
        while let Some(id) = self.tree.next_node(self.tree.root(), current) {
            if self.tree[id].has_children() && self.tree[id].depth() >= min_depth {
                let has_normals = (0..8).any(|c| self.has_normals(self.tree.child(id, c)));
                if !has_normals {
                    self.tree.collapse(id);
                    clipped += 1;
                }
            }
            current = Some(id);
        }
        log::debug!("clipped {clipped} empty subtrees");
    }

    /// Guarantees coarse-neighborhood support for every node, then refines
    /// the subdivision boundaries and rebuilds the sorted ordering.
    pub(crate) fn finalize(&mut self) {
        let max_depth = self.tree.max_depth();
        for d in (2..=max_depth).rev() {
            let nodes: Vec<NodeId> = {
                let mut nodes = Vec::new();
                let mut current = None;
                while let Some(id) = self.tree.next_node(self.tree.root(), current) {
                    if self.tree[id].depth() == d {
                        nodes.push(id);
                    }
                    current = Some(id);
                }
                nodes
            };
            for id in nodes {
                let grandparent = self.tree[id]
                    .parent()
                    .and_then(|p| self.tree[p].parent())
                    .expect("depth >= 2");
                for i in -1..=1i32 {
                    for j in -1..=1i32 {
                        for k in -1..=1i32 {
                            if let Some(neighbor) =
                                self.tree.neighbor_by_offset(grandparent, [i, j, k])
                            {
                                if !self.tree[neighbor].has_children() {
                                    self.tree.split(neighbor);
                                }
                            }
                        }
                    }
                }
            }
        }
        self.refine_boundary();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn splat_kernel_sums_to_one() {
        // Partition of unity over unit translates of the support, for any
        // sample position inside the center cell.
        let center = Point3::new(0.5, 0.5, 0.5);
        let width = 0.25;
        for s in 0..10 {
            let t = s as Real / 9.0 - 0.5;
            let position = Point3::new(0.5 + t * width, 0.5 - t * width, 0.5 + 0.3 * width);
            let dx = splat_kernel(&center, width, &position);
            for axis in 0..3 {
                let sum: Real = dx[axis].iter().sum();
                assert!((sum - 1.0).abs() < 1.0e-12);
                assert!(dx[axis].iter().all(|&w| w >= -1.0e-12));
            }
        }
    }
}
