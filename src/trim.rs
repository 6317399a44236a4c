//! Density-driven surface trimming.
//!
//! Vertices carry the per-vertex density emitted by the reconstruction.
//! Polygons are subdivided along the iso-contour of a density threshold, the
//! low-density side is discarded, and small islands (or small holes, which
//! get filled back in) are reassigned by comparing their component area
//! against the largest component.

use crate::mesh::MeshVertex;
use crate::{Error, Real};
use fnv::FnvHashMap;
use itertools::Itertools;
use na::Point3;

/// Knobs of one trimming pass.
#[derive(Clone, Debug)]
pub struct TrimParams {
    /// Density threshold; geometry below it is cut away.
    pub trim_value: Real,
    /// Laplacian smoothing iterations applied to the densities first.
    pub smooth_iterations: usize,
    /// Components whose area falls below this fraction of the largest
    /// component swap sides (small islands drop, small holes fill).
    pub island_area_ratio: Real,
    /// Keep split polygons as polygons instead of triangulating them.
    pub polygon_mesh: bool,
}

impl Default for TrimParams {
    fn default() -> Self {
        Self {
            trim_value: 0.0,
            smooth_iterations: 5,
            island_area_ratio: 0.001,
            polygon_mesh: false,
        }
    }
}

/// Trims the mesh in place.
///
/// Every input vertex must carry a density value. New vertices are appended
/// where polygon edges cross the threshold; unreferenced vertices are
/// dropped and indices remapped.
pub fn trim_surface(
    vertices: &mut Vec<MeshVertex>,
    polygons: &mut Vec<Vec<usize>>,
    params: &TrimParams,
) -> Result<(), Error> {
    if vertices.iter().any(|v| v.value.is_none()) {
        return Err(Error::MalformedInput(
            "trimming requires a per-vertex density (reconstruct with --density)".into(),
        ));
    }

    let mut values: Vec<Real> = vertices.iter().map(|v| v.value.unwrap()).collect();
    for _ in 0..params.smooth_iterations {
        values = smooth_values(&values, polygons);
    }
    for (vertex, &value) in vertices.iter_mut().zip(values.iter()) {
        vertex.value = Some(value);
    }

    // Subdivide every polygon crossing the threshold. Edge crossings are
    // cached so both incident polygons reference one new vertex.
    let mut edge_vertices: FnvHashMap<(usize, usize), usize> = FnvHashMap::default();
    let mut above: Vec<Vec<usize>> = Vec::new();
    let mut below: Vec<Vec<usize>> = Vec::new();
    for polygon in polygons.iter() {
        split_polygon(
            polygon,
            vertices,
            &values,
            params.trim_value,
            &mut edge_vertices,
            &mut above,
            &mut below,
        );
    }
    log::debug!(
        "trim split: {} above, {} below the threshold",
        above.len(),
        below.len()
    );

    // Small islands of the kept side are dropped; small components of the
    // discarded side are holes and get filled back in.
    if params.island_area_ratio > 0.0 {
        let above_components = connected_components(&above);
        let below_components = connected_components(&below);
        let area_of = |list: &[Vec<usize>], component: &[usize]| -> Real {
            component
                .iter()
                .map(|&p| polygon_area(&list[p], vertices))
                .sum()
        };
        let max_area = above_components
            .iter()
            .map(|c| area_of(&above, c))
            .fold(0.0, Real::max)
            .max(
                below_components
                    .iter()
                    .map(|c| area_of(&below, c))
                    .fold(0.0, Real::max),
            );

        let mut kept = Vec::new();
        for component in &above_components {
            if area_of(&above, component) >= params.island_area_ratio * max_area {
                kept.extend(component.iter().map(|&p| above[p].clone()));
            }
        }
        for component in &below_components {
            if area_of(&below, component) < params.island_area_ratio * max_area {
                kept.extend(component.iter().map(|&p| below[p].clone()));
            }
        }
        above = kept;
    }

    // Triangulate and compact.
    let mut result: Vec<Vec<usize>> = Vec::with_capacity(above.len());
    for polygon in above {
        if params.polygon_mesh || polygon.len() == 3 {
            result.push(polygon);
        } else {
            for k in 1..polygon.len() - 1 {
                result.push(vec![polygon[0], polygon[k], polygon[k + 1]]);
            }
        }
    }

    let mut remap: Vec<Option<usize>> = vec![None; vertices.len()];
    let mut compacted = Vec::new();
    for polygon in result.iter_mut() {
        for index in polygon.iter_mut() {
            let old = *index;
            *index = *remap[old].get_or_insert_with(|| {
                compacted.push(vertices[old]);
                compacted.len() - 1
            });
        }
    }
    *vertices = compacted;
    *polygons = result;
    Ok(())
}

/// One pass of value averaging over the polygon edge graph.
fn smooth_values(values: &[Real], polygons: &[Vec<usize>]) -> Vec<Real> {
    let mut sums = values.to_vec();
    let mut counts = vec![1.0 as Real; values.len()];
    for polygon in polygons {
        for (&a, &b) in polygon.iter().circular_tuple_windows::<(_, _)>() {
            sums[a] += values[b];
            counts[a] += 1.0;
            sums[b] += values[a];
            counts[b] += 1.0;
        }
    }
    sums.iter().zip(&counts).map(|(s, c)| s / c).collect()
}

fn polygon_area(polygon: &[usize], vertices: &[MeshVertex]) -> Real {
    if polygon.len() < 3 {
        return 0.0;
    }
    let origin = vertices[polygon[0]].position;
    let mut doubled = 0.0;
    for k in 1..polygon.len() - 1 {
        let a = vertices[polygon[k]].position - origin;
        let b = vertices[polygon[k + 1]].position - origin;
        doubled += a.cross(&b).norm();
    }
    doubled / 2.0
}

/// Splits one polygon at the threshold, appending crossing vertices and the
/// resulting sub-polygons to the matching side.
fn split_polygon(
    polygon: &[usize],
    vertices: &mut Vec<MeshVertex>,
    values: &[Real],
    trim_value: Real,
    edge_vertices: &mut FnvHashMap<(usize, usize), usize>,
    above: &mut Vec<Vec<usize>>,
    below: &mut Vec<Vec<usize>>,
) {
    let is_above: Vec<bool> = polygon.iter().map(|&v| values[v] >= trim_value).collect();
    if is_above.iter().all(|&b| b) {
        above.push(polygon.to_vec());
        return;
    }
    if is_above.iter().all(|&b| !b) {
        below.push(polygon.to_vec());
        return;
    }

    let mut above_part = Vec::new();
    let mut below_part = Vec::new();
    let k = polygon.len();
    for i in 0..k {
        let v1 = polygon[i];
        let v2 = polygon[(i + 1) % k];
        if is_above[i] {
            above_part.push(v1);
        } else {
            below_part.push(v1);
        }
        if is_above[i] != is_above[(i + 1) % k] {
            let key = (v1.min(v2), v1.max(v2));
            let crossing = *edge_vertices.entry(key).or_insert_with(|| {
                let t = (trim_value - values[v1]) / (values[v2] - values[v1]);
                let p1 = vertices[v1].position;
                let p2 = vertices[v2].position;
                vertices.push(MeshVertex::with_value(
                    Point3::from(p1.coords * (1.0 - t) + p2.coords * t),
                    trim_value,
                ));
                vertices.len() - 1
            });
            above_part.push(crossing);
            below_part.push(crossing);
        }
    }
    if above_part.len() >= 3 {
        above.push(above_part);
    }
    if below_part.len() >= 3 {
        below.push(below_part);
    }
}

/// Groups polygons into edge-connected components; returns lists of polygon
/// indices.
fn connected_components(polygons: &[Vec<usize>]) -> Vec<Vec<usize>> {
    let mut edge_owner: FnvHashMap<(usize, usize), Vec<usize>> = FnvHashMap::default();
    for (p, polygon) in polygons.iter().enumerate() {
        for (&a, &b) in polygon.iter().circular_tuple_windows::<(_, _)>() {
            edge_owner.entry((a.min(b), a.max(b))).or_default().push(p);
        }
    }

    let mut component = vec![usize::MAX; polygons.len()];
    let mut components = Vec::new();
    for seed in 0..polygons.len() {
        if component[seed] != usize::MAX {
            continue;
        }
        let id = components.len();
        let mut members = Vec::new();
        let mut stack = vec![seed];
        component[seed] = id;
        while let Some(p) = stack.pop() {
            members.push(p);
            for (&a, &b) in polygons[p].iter().circular_tuple_windows::<(_, _)>() {
                for &q in &edge_owner[&(a.min(b), a.max(b))] {
                    if component[q] == usize::MAX {
                        component[q] = id;
                        stack.push(q);
                    }
                }
            }
        }
        components.push(members);
    }
    components
}

#[cfg(test)]
mod test {
    use super::*;

    fn quad_strip() -> (Vec<MeshVertex>, Vec<Vec<usize>>) {
        // Two unit quads side by side in the plane, densities rising along x.
        let mut vertices = Vec::new();
        for x in 0..3 {
            for y in 0..2 {
                vertices.push(MeshVertex::with_value(
                    Point3::new(x as Real, y as Real, 0.0),
                    x as Real,
                ));
            }
        }
        let polygons = vec![vec![0, 2, 3, 1], vec![2, 4, 5, 3]];
        (vertices, polygons)
    }

    #[test]
    fn trimming_cuts_the_low_density_side() {
        let (mut vertices, mut polygons) = quad_strip();
        let params = TrimParams {
            trim_value: 0.5,
            smooth_iterations: 0,
            island_area_ratio: 0.0,
            polygon_mesh: true,
        };
        trim_surface(&mut vertices, &mut polygons, &params).unwrap();

        // Everything below x = 0.5 is gone; the cut edge sits exactly at
        // the threshold.
        let total: Real = polygons.iter().map(|p| polygon_area(p, &vertices)).sum();
        assert!((total - 1.5).abs() < 1.0e-12);
        assert!(vertices
            .iter()
            .all(|v| v.value.unwrap() >= 0.5 - 1.0e-12));
    }

    #[test]
    fn trimming_rejects_meshes_without_densities() {
        let mut vertices = vec![MeshVertex::new(Point3::origin())];
        let mut polygons = vec![];
        let err = trim_surface(&mut vertices, &mut polygons, &TrimParams::default());
        assert!(matches!(err, Err(Error::MalformedInput(_))));
    }

    #[test]
    fn component_walk_finds_disconnected_pieces() {
        let polygons = vec![vec![0, 1, 2], vec![1, 2, 3], vec![10, 11, 12]];
        let components = connected_components(&polygons);
        assert_eq!(components.len(), 2);
        assert_eq!(components[0].len(), 2);
        assert_eq!(components[1].len(), 1);
    }
}
