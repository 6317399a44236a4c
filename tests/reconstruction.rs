//! End-to-end reconstruction of an analytically known surface.

use nalgebra::{Point3, Vector3};
use screened_poisson::{
    CoredVecMesh, MeshVertex, PoissonReconstruction, Real, ReconstructionParams,
};
use std::collections::HashMap;

/// Fibonacci-lattice sampling of the unit sphere with outward normals.
fn fibonacci_sphere(n: usize) -> (Vec<Point3<Real>>, Vec<Vector3<Real>>) {
    let golden = (1.0 + (5.0 as Real).sqrt()) / 2.0;
    let mut points = Vec::with_capacity(n);
    let mut normals = Vec::with_capacity(n);
    for i in 0..n {
        let z = 1.0 - 2.0 * (i as Real + 0.5) / n as Real;
        let r = (1.0 - z * z).sqrt();
        let phi = 2.0 * std::f64::consts::PI * (i as Real / golden).fract();
        let normal = Vector3::new(r * phi.cos(), r * phi.sin(), z);
        points.push(Point3::from(normal));
        normals.push(normal);
    }
    (points, normals)
}

/// Every edge of a closed triangle mesh is shared by exactly two faces.
fn assert_watertight(polygons: &[Vec<usize>]) {
    let mut edge_counts: HashMap<(usize, usize), usize> = HashMap::new();
    for polygon in polygons {
        assert!(polygon.len() >= 3);
        for i in 0..polygon.len() {
            let a = polygon[i];
            let b = polygon[(i + 1) % polygon.len()];
            assert_ne!(a, b, "degenerate edge in {polygon:?}");
            *edge_counts.entry((a.min(b), a.max(b))).or_default() += 1;
        }
    }
    let open: Vec<_> = edge_counts
        .iter()
        .filter(|(_, &count)| count != 2)
        .take(10)
        .collect();
    assert!(
        open.is_empty(),
        "{} of {} edges are not shared by exactly two faces, e.g. {open:?}",
        edge_counts.values().filter(|&&c| c != 2).count(),
        edge_counts.len()
    );
}

fn reconstruct(params: &ReconstructionParams, n: usize) -> (Vec<MeshVertex>, Vec<Vec<usize>>) {
    let (points, normals) = fibonacci_sphere(n);
    let mut reconstruction =
        PoissonReconstruction::from_points_and_normals(&points, &normals, params)
            .expect("reconstruction");
    assert_eq!(reconstruction.sample_count(), n);

    // The implicit function must separate the inside of the sphere from the
    // domain corner.
    let inside = reconstruction.eval(&Point3::origin());
    let outside = reconstruction.eval(&Point3::new(1.4, 1.4, 1.4));
    assert!(
        inside * outside < 0.0,
        "implicit function does not separate inside ({inside}) from outside ({outside})"
    );

    let mut mesh = CoredVecMesh::new();
    reconstruction.extract_mesh(&mut mesh);
    mesh.into_vertices_and_polygons()
}

#[test]
fn screened_sphere_is_watertight_and_round() {
    let params = ReconstructionParams {
        depth: 6,
        full_depth: 4,
        iso_divide: 4,
        density: true,
        ..Default::default()
    };
    let (vertices, polygons) = reconstruct(&params, 20_000);
    assert!(!polygons.is_empty());
    assert_watertight(&polygons);

    for vertex in &vertices {
        let radius = vertex.position.coords.norm();
        assert!(
            (0.93..=1.07).contains(&radius),
            "vertex at radius {radius} strays from the unit sphere"
        );
        let density = vertex.value.expect("per-vertex density requested");
        assert!(density >= 0.0 && density.is_finite());
    }
}

#[test]
fn unscreened_sphere_is_watertight() {
    let params = ReconstructionParams {
        depth: 5,
        full_depth: 4,
        iso_divide: 3,
        point_weight: 0.0,
        ..Default::default()
    };
    let (vertices, polygons) = reconstruct(&params, 8_000);
    assert!(!polygons.is_empty());
    assert_watertight(&polygons);
    for vertex in &vertices {
        assert!(vertex.value.is_none());
        let radius = vertex.position.coords.norm();
        assert!((0.85..=1.15).contains(&radius));
    }
}
