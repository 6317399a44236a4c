/*!
Rust implementation of the [Screened Poisson surface
reconstruction](https://www.cs.jhu.edu/~misha/MyPapers/ToG13.pdf) by Kazhdan
and Hoppe, over an adaptive octree of tensor-product quadratic B-splines.

Oriented samples are splatted into a density-adapted octree, the screened
Poisson system is solved depth by depth with a cascaded multigrid scheme, and
the iso-surface is extracted with an adaptive marching-cubes variant that
stitches cells of differing depths into a watertight mesh.
*/

#![allow(clippy::type_complexity, clippy::too_many_arguments)]
#![warn(missing_docs)]

/// Floating-point type used by this library.
pub type Real = f64;

extern crate nalgebra as na;
extern crate parry3d_f64 as parry;

pub use self::bspline::BoundaryType;
pub use self::mesh::{CoredVecMesh, MeshSink, MeshVertex, VertexIndex};
pub use self::points::{PointStream, SlicePointStream};
pub use self::poisson::{PoissonReconstruction, ReconstructionParams};

pub(crate) const EPSILON: Real = 1.0e-6;

mod bspline;
mod constraints;
mod cube;
mod isosurface;
pub mod marching_cubes;
mod mesh;
mod octree;
pub mod ply;
mod points;
mod poisson;
mod polynomial;
mod solver;
mod sorted_nodes;
mod sparse;
mod splat;
mod stencils;
pub mod trim;

/// Failures surfaced by the reconstruction pipeline and its I/O helpers.
///
/// Numeric and topological anomalies inside the solver and extractor are
/// logged diagnostics, never errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Reading or writing a stream failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The input exists but cannot be interpreted.
    #[error("malformed input: {0}")]
    MalformedInput(String),
    /// The requested parameters are inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),
}
