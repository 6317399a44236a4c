use crate::bspline::{BSplineData, BoundaryType};
use crate::mesh::MeshSink;
use crate::octree::Octree;
use crate::points::PointStream;
use crate::sorted_nodes::SortedNodes;
use crate::{Error, Real};
use na::{Matrix4, Point3, Vector3};

/// Knobs of a reconstruction run.
///
/// One instance is passed explicitly through every phase; there is no global
/// state.
#[derive(Clone, Debug)]
pub struct ReconstructionParams {
    /// Maximum octree depth.
    pub depth: usize,
    /// Depth at which the cumulative coarse solution is folded into a single
    /// starting vector.
    pub min_depth: usize,
    /// Depth down to which the octree is kept complete.
    pub full_depth: usize,
    /// Density-estimation (splatting) depth; `None` selects `depth - 2`.
    pub kernel_depth: Option<usize>,
    /// Target samples per leaf used by the density-adapted splat depth.
    pub samples_per_node: Real,
    /// Screening weight; `0` disables screening.
    pub point_weight: Real,
    /// Bounding-cube scale factor applied to the samples' extent.
    pub scale: Real,
    /// Weigh samples by their normal length instead of normalizing them.
    pub confidence: bool,
    /// Use normal lengths as screening weights.
    pub normal_weights: bool,
    /// Attach a density value to every output vertex.
    pub density: bool,
    /// Exponent of the depth-adaptive screening scale.
    pub adaptive_exponent: i32,
    /// Minimum conjugate-gradient iterations per depth.
    pub min_iters: usize,
    /// Solver accuracy; scaled by the per-depth system size.
    pub accuracy: Real,
    /// Fixed conjugate-gradient iteration count overriding the adaptive one.
    pub fixed_iters: Option<usize>,
    /// Coarse-depth distance used to partition deep solves into independent
    /// subtrees; `0` disables partitioning.
    pub solver_divide: usize,
    /// Subdivision depth bounding the extractor's per-subtree memory.
    pub iso_divide: usize,
    /// Solve the gradient-domain formulation instead of the divergence one.
    pub gradient_domain_solution: bool,
    /// Zero boundary-face normal components in Neumann mode.
    pub force_neumann_field: bool,
    /// Hermite-quadratic edge-root inversion (`false` falls back to linear).
    pub non_linear_fit: bool,
    /// Emit closed polygons instead of triangles.
    pub polygon_mesh: bool,
    /// Fan coplanar polygons around their barycenter instead of running the
    /// minimal-area triangulation.
    pub add_barycenter: bool,
    /// Boundary condition of the B-spline basis.
    pub boundary: BoundaryType,
    /// Affine transform applied to every input sample.
    pub xform: Matrix4<Real>,
}

impl Default for ReconstructionParams {
    fn default() -> Self {
        Self {
            depth: 8,
            min_depth: 0,
            full_depth: 5,
            kernel_depth: None,
            samples_per_node: 1.0,
            point_weight: 4.0,
            scale: 1.1,
            confidence: false,
            normal_weights: false,
            density: false,
            adaptive_exponent: 1,
            min_iters: 8,
            accuracy: 1.0e-3,
            fixed_iters: None,
            solver_divide: 0,
            iso_divide: 8,
            gradient_domain_solution: true,
            force_neumann_field: true,
            non_linear_fit: true,
            polygon_mesh: false,
            add_barycenter: true,
            boundary: BoundaryType::Neumann,
            xform: Matrix4::identity(),
        }
    }
}

/// Per-cell screening accumulator: the weighted sample position, the total
/// weight, and the cached coarser-depth function value of the current solve
/// step.
#[derive(Clone, Debug)]
pub(crate) struct ScreeningPoint {
    pub position: Point3<Real>,
    pub weight: Real,
    pub coarser_value: Real,
}

/// All mutable state of one reconstruction run. The phase implementations
/// live in `splat`, `constraints`, `solver`, and `isosurface`.
pub(crate) struct Reconstructor {
    pub tree: Octree,
    pub sorted: SortedNodes,
    pub fdata: BSplineData,

    pub boundary: BoundaryType,
    pub gradient_domain: bool,
    pub force_neumann: bool,
    pub output_density: bool,
    pub constrain_values: bool,
    pub non_linear_fit: bool,
    pub polygon_mesh: bool,
    pub add_barycenter: bool,

    pub max_depth: usize,
    pub min_depth: usize,
    pub full_depth: usize,
    pub splat_depth: usize,
    pub samples_per_node: Real,
    pub scale_factor: Real,
    pub use_confidence: bool,
    pub use_normal_weights: bool,
    pub constraint_weight: Real,
    pub adaptive_exponent: i32,
    pub min_iters: usize,
    pub accuracy: Real,
    pub fixed_iters: Option<usize>,
    pub solver_divide: usize,
    pub iso_divide: usize,
    pub xform: Matrix4<Real>,

    pub scale: Real,
    pub center: Point3<Real>,
    pub normals: Vec<Vector3<Real>>,
    pub points: Vec<ScreeningPoint>,
}

impl Reconstructor {
    fn new(params: &ReconstructionParams) -> Result<Self, Error> {
        if params.depth < 2 {
            return Err(Error::Config("depth must be at least 2".into()));
        }
        if params.min_depth > params.depth {
            return Err(Error::Config(format!(
                "minDepth {} exceeds depth {}",
                params.min_depth, params.depth
            )));
        }
        if params.full_depth > params.depth {
            return Err(Error::Config(format!(
                "fullDepth {} exceeds depth {}",
                params.full_depth, params.depth
            )));
        }
        let free = params.boundary == BoundaryType::Free;

        let max_depth = if free { params.depth + 1 } else { params.depth };
        let min_depth = if free {
            (params.min_depth + 1).clamp(2, max_depth)
        } else {
            params.min_depth.min(max_depth)
        };
        let full_depth = {
            let full = if free {
                params.full_depth + 1
            } else {
                params.full_depth
            };
            full.clamp(min_depth, max_depth)
        };
        let splat_depth = {
            let kernel = params.kernel_depth.unwrap_or(params.depth.saturating_sub(2));
            if kernel > params.depth {
                return Err(Error::Config(format!(
                    "kernelDepth {} exceeds depth {}",
                    kernel, params.depth
                )));
            }
            if free && kernel > 0 {
                kernel + 1
            } else {
                kernel
            }
        };

        let mut tree = Octree::new();
        let sorted = SortedNodes::set(&mut tree);

        Ok(Self {
            tree,
            sorted,
            fdata: BSplineData::new(max_depth, params.boundary),
            boundary: params.boundary,
            gradient_domain: params.gradient_domain_solution,
            force_neumann: params.force_neumann_field,
            output_density: params.density,
            constrain_values: params.point_weight > 0.0,
            non_linear_fit: params.non_linear_fit,
            polygon_mesh: params.polygon_mesh,
            add_barycenter: params.add_barycenter,
            max_depth,
            min_depth,
            full_depth,
            splat_depth,
            samples_per_node: params.samples_per_node,
            scale_factor: params.scale,
            use_confidence: params.confidence,
            use_normal_weights: params.normal_weights,
            constraint_weight: params.point_weight,
            adaptive_exponent: params.adaptive_exponent,
            min_iters: params.min_iters,
            accuracy: params.accuracy,
            fixed_iters: params.fixed_iters,
            solver_divide: params.solver_divide,
            iso_divide: params.iso_divide,
            xform: params.xform,
            scale: 1.0,
            center: Point3::origin(),
            normals: Vec::new(),
            points: Vec::new(),
        })
    }

    /// The per-node weight used for iso-value averaging, depending on
    /// whether densities are carried through extraction.
    pub fn center_weight_slot(&self) -> usize {
        usize::from(self.output_density)
    }

    /// Maps a normalized-cube point back to input coordinates.
    pub fn denormalize(&self, p: Point3<Real>) -> Point3<Real> {
        self.center + p.coords * self.scale
    }
}

/// An implicit surface reconstructed with the screened Poisson
/// reconstruction algorithm over an adaptive octree.
pub struct PoissonReconstruction {
    pub(crate) recon: Reconstructor,
    iso_value: Real,
    sample_count: usize,
}

impl PoissonReconstruction {
    /// Reconstructs the indicator function from in-memory samples.
    ///
    /// `points` and `normals` must have the same length; normals point
    /// outward. This is a convenience wrapper around [`Self::from_stream`].
    pub fn from_points_and_normals(
        points: &[Point3<Real>],
        normals: &[Vector3<Real>],
        params: &ReconstructionParams,
    ) -> Result<Self, Error> {
        if points.len() != normals.len() {
            return Err(Error::Config(
                "exactly one normal per point must be provided".into(),
            ));
        }
        let mut stream = crate::points::SlicePointStream::new(points, normals);
        Self::from_stream(&mut stream, params)
    }

    /// Runs the full solver pipeline over a reset-able point stream.
    ///
    /// The stream is read exactly twice: once for the bounding pass and once
    /// for splatting.
    pub fn from_stream(
        stream: &mut dyn PointStream,
        params: &ReconstructionParams,
    ) -> Result<Self, Error> {
        let mut recon = Reconstructor::new(params)?;

        let sample_count = recon.set_tree(stream)?;
        if sample_count == 0 {
            return Err(Error::MalformedInput("empty point stream".into()));
        }
        log::info!("tree set from {sample_count} samples");

        recon.clip_tree();
        recon.finalize();
        log::info!(
            "tree finalized: {} nodes over {} depths",
            recon.sorted.len(),
            recon.sorted.levels
        );

        recon.set_laplacian_constraints();
        let iterations = recon.laplacian_matrix_iteration();
        log::info!("multigrid cascade done in {iterations} CG iterations");

        let iso_value = recon.iso_value();
        log::info!("iso-value: {iso_value}");

        Ok(Self {
            recon,
            iso_value,
            sample_count,
        })
    }

    pub fn iso_value(&self) -> Real {
        self.iso_value
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// The domain of the implicit function, in input coordinates.
    pub fn aabb(&self) -> parry::bounding_volume::Aabb {
        let mins = self.recon.denormalize(Point3::origin());
        let maxs = self.recon.denormalize(Point3::new(1.0, 1.0, 1.0));
        parry::bounding_volume::Aabb::new(mins, maxs)
    }

    /// Evaluates the indicator function (minus the iso-value) at an input
    /// point. Positive values lie inside the surface.
    pub fn eval(&self, p: &Point3<Real>) -> Real {
        let recon = &self.recon;
        let q = Point3::from((p - recon.center) / recon.scale);
        let mut value = 0.0;
        let mut node = recon.tree.root();
        loop {
            let d = recon.tree[node].depth();
            for i in -1..=1i32 {
                for j in -1..=1i32 {
                    for k in -1..=1i32 {
                        if let Some(neighbor) = recon.tree.neighbor_by_offset(node, [i, j, k]) {
                            let (_, noff) = recon.tree[neighbor].depth_and_offset();
                            value += recon.tree[neighbor].data.solution
                                * recon.fdata.value(d, noff[0], q.x)
                                * recon.fdata.value(d, noff[1], q.y)
                                * recon.fdata.value(d, noff[2], q.z);
                        }
                    }
                }
            }
            if !recon.tree[node].has_children() {
                break;
            }
            let (center, _) = recon.tree[node].center_and_width();
            node = recon
                .tree
                .child(node, crate::octree::corner_index_of_point(&center, &q));
        }
        value - self.iso_value
    }

    /// Extracts the iso-surface into the given mesh sink. Vertices are
    /// emitted in input coordinates.
    pub fn extract_mesh(&mut self, sink: &mut dyn MeshSink) {
        let iso_value = self.iso_value;
        self.recon.extract_iso_surface(iso_value, sink);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_inconsistent_params() {
        let mut params = ReconstructionParams::default();
        params.min_depth = 12;
        params.depth = 6;
        let err = PoissonReconstruction::from_points_and_normals(&[], &[], &params);
        assert!(matches!(err, Err(Error::Config(_))));
    }

    #[test]
    fn rejects_empty_input() {
        let params = ReconstructionParams {
            depth: 4,
            full_depth: 2,
            ..Default::default()
        };
        let err = PoissonReconstruction::from_points_and_normals(&[], &[], &params);
        assert!(matches!(err, Err(Error::MalformedInput(_))));
    }
}
