//! Command-line front-end: `reconstruct` solves the screened Poisson system
//! over a PLY point cloud, `trim` post-processes a reconstructed mesh by
//! density.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use nalgebra::Matrix4;
use screened_poisson::ply::{self, PlyPointStream};
use screened_poisson::trim::{trim_surface, TrimParams};
use screened_poisson::{
    BoundaryType, CoredVecMesh, PoissonReconstruction, Real, ReconstructionParams,
};

#[derive(Parser)]
#[command(name = "spsr", version, about = "Screened Poisson surface reconstruction")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, ValueEnum)]
enum Boundary {
    Free,
    Dirichlet,
    Neumann,
}

impl From<Boundary> for BoundaryType {
    fn from(b: Boundary) -> Self {
        match b {
            Boundary::Free => BoundaryType::Free,
            Boundary::Dirichlet => BoundaryType::Dirichlet,
            Boundary::Neumann => BoundaryType::Neumann,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Reconstruct a mesh from an oriented point cloud.
    Reconstruct(ReconstructArgs),
    /// Trim a reconstructed mesh by its per-vertex density.
    Trim(TrimArgs),
}

#[derive(clap::Args)]
struct ReconstructArgs {
    /// Input PLY point cloud with per-vertex normals.
    #[arg(long = "in")]
    input: String,

    /// Output PLY mesh.
    #[arg(long = "out")]
    output: String,

    /// Maximum octree depth.
    #[arg(long, default_value_t = 8)]
    depth: usize,

    /// Coarsest multigrid depth.
    #[arg(long = "minDepth", default_value_t = 0)]
    min_depth: usize,

    /// Depth down to which the octree is complete.
    #[arg(long = "fullDepth", default_value_t = 5)]
    full_depth: usize,

    /// Density-estimation depth (defaults to depth - 2).
    #[arg(long = "kernelDepth")]
    kernel_depth: Option<usize>,

    /// Target samples per octree leaf.
    #[arg(long = "samplesPerNode", default_value_t = 1.0)]
    samples_per_node: Real,

    /// Screening weight; 0 disables screening.
    #[arg(long = "pointWeight", default_value_t = 4.0)]
    point_weight: Real,

    /// Bounding-cube scale factor.
    #[arg(long, default_value_t = 1.1)]
    scale: Real,

    /// Weigh samples by normal length instead of normalizing.
    #[arg(long)]
    confidence: bool,

    /// Use normal lengths as screening weights.
    #[arg(long = "nWeights")]
    n_weights: bool,

    /// Attach a density value to every output vertex.
    #[arg(long)]
    density: bool,

    /// Emit polygons instead of triangles.
    #[arg(long = "polygonMesh")]
    polygon_mesh: bool,

    /// Quadratic edge-root fit (disable for plain linear interpolation).
    #[arg(long = "nonLinearFit", default_value_t = true, action = clap::ArgAction::Set)]
    non_linear_fit: bool,

    /// Minimum conjugate-gradient iterations per depth.
    #[arg(long, default_value_t = 8)]
    iters: usize,

    /// Conjugate-gradient accuracy.
    #[arg(long, default_value_t = 1.0e-3)]
    accuracy: Real,

    /// Coarse-depth distance for partitioned deep solves; 0 disables.
    #[arg(long = "solverDivide", default_value_t = 0)]
    solver_divide: usize,

    /// Subdivision depth bounding extraction memory.
    #[arg(long = "isoDivide", default_value_t = 8)]
    iso_divide: usize,

    /// Depth-adaptive screening exponent.
    #[arg(long = "adaptiveExp", default_value_t = 1)]
    adaptive_exponent: i32,

    /// Worker threads (0 uses all cores).
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Boundary condition of the B-spline basis.
    #[arg(long, value_enum, default_value = "neumann")]
    boundary: Boundary,

    /// Row-major 4x4 affine transform applied to the input samples, as 16
    /// comma- or space-separated values.
    #[arg(long = "xForm", value_parser = parse_xform)]
    xform: Option<Matrix4<Real>>,

    /// Write the output PLY in ASCII instead of binary.
    #[arg(long)]
    ascii: bool,

    /// Per-depth solver reporting.
    #[arg(long)]
    verbose: bool,
}

#[derive(clap::Args)]
struct TrimArgs {
    /// Input PLY mesh with per-vertex densities.
    #[arg(long = "in")]
    input: String,

    /// Output PLY mesh.
    #[arg(long = "out")]
    output: String,

    /// Density threshold below which geometry is removed.
    #[arg(long)]
    trim: Real,

    /// Density smoothing iterations.
    #[arg(long, default_value_t = 5)]
    smooth: usize,

    /// Island-to-largest-component area ratio below which components swap
    /// sides.
    #[arg(long = "aRatio", default_value_t = 0.001)]
    a_ratio: Real,

    /// Keep polygons un-triangulated.
    #[arg(long = "polygonMesh")]
    polygon_mesh: bool,

    /// Write the output PLY in ASCII instead of binary.
    #[arg(long)]
    ascii: bool,

    /// Verbose reporting.
    #[arg(long)]
    verbose: bool,
}

fn parse_xform(s: &str) -> Result<Matrix4<Real>, String> {
    let values: Vec<Real> = s
        .split([',', ' '])
        .filter(|t| !t.is_empty())
        .map(|t| t.parse::<Real>().map_err(|e| e.to_string()))
        .collect::<Result<_, _>>()?;
    if values.len() != 16 {
        return Err(format!("expected 16 values, got {}", values.len()));
    }
    Ok(Matrix4::from_row_slice(&values))
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn reconstruct(args: ReconstructArgs) -> Result<()> {
    init_logging(args.verbose);
    if args.threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(args.threads)
            .build_global()
            .context("configuring the thread pool")?;
    }

    let mut stream = PlyPointStream::open(&args.input)
        .with_context(|| format!("reading {}", args.input))?;
    log::info!("{} samples in {}", stream.len(), args.input);

    let params = ReconstructionParams {
        depth: args.depth,
        min_depth: args.min_depth,
        full_depth: args.full_depth,
        kernel_depth: args.kernel_depth,
        samples_per_node: args.samples_per_node,
        point_weight: args.point_weight,
        scale: args.scale,
        confidence: args.confidence,
        normal_weights: args.n_weights,
        density: args.density,
        adaptive_exponent: args.adaptive_exponent,
        min_iters: args.iters,
        accuracy: args.accuracy,
        solver_divide: args.solver_divide,
        iso_divide: args.iso_divide,
        non_linear_fit: args.non_linear_fit,
        polygon_mesh: args.polygon_mesh,
        boundary: args.boundary.into(),
        xform: args.xform.unwrap_or_else(Matrix4::identity),
        ..Default::default()
    };

    let mut reconstruction = PoissonReconstruction::from_stream(&mut stream, &params)
        .context("reconstruction failed")?;

    let mut mesh = CoredVecMesh::new();
    reconstruction.extract_mesh(&mut mesh);
    log::info!(
        "extracted {} vertices, {} polygons",
        mesh.vertex_count(),
        mesh.polygon_count()
    );
    if mesh.polygon_count() == 0 {
        bail!("extraction produced an empty mesh");
    }

    let (vertices, polygons) = mesh.into_vertices_and_polygons();
    ply::write_mesh(&args.output, &vertices, &polygons, args.ascii)
        .with_context(|| format!("writing {}", args.output))?;
    Ok(())
}

fn trim(args: TrimArgs) -> Result<()> {
    init_logging(args.verbose);

    let (mut vertices, mut polygons) =
        ply::read_mesh(&args.input).with_context(|| format!("reading {}", args.input))?;
    let before = polygons.len();

    let params = TrimParams {
        trim_value: args.trim,
        smooth_iterations: args.smooth,
        island_area_ratio: args.a_ratio,
        polygon_mesh: args.polygon_mesh,
    };
    trim_surface(&mut vertices, &mut polygons, &params).context("trimming failed")?;
    log::info!("trimmed {} -> {} polygons", before, polygons.len());

    ply::write_mesh(&args.output, &vertices, &polygons, args.ascii)
        .with_context(|| format!("writing {}", args.output))?;
    Ok(())
}

fn main() -> Result<()> {
    match Cli::parse().command {
        Command::Reconstruct(args) => reconstruct(args),
        Command::Trim(args) => trim(args),
    }
}
