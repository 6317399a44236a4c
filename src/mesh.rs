//! Mesh sink interface and the in-memory implementation.
//!
//! The extractor routes vertices through two channels: *in-core* vertices
//! sit on subtree boundaries and may be referenced (and deduplicated) across
//! subtrees; *out-of-core* vertices are interior to one subtree and only
//! ever appended. A sink backed by spill files can stream the latter.

use crate::Real;
use na::Point3;

/// An iso-surface vertex, with an optional per-vertex density value.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MeshVertex {
    pub position: Point3<Real>,
    pub value: Option<Real>,
}

impl MeshVertex {
    pub fn new(position: Point3<Real>) -> Self {
        Self {
            position,
            value: None,
        }
    }

    pub fn with_value(position: Point3<Real>, value: Real) -> Self {
        Self {
            position,
            value: Some(value),
        }
    }
}

/// A vertex reference as emitted by the extractor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VertexIndex {
    pub index: usize,
    pub in_core: bool,
}

/// Receives the extracted surface.
pub trait MeshSink {
    /// Stores a deduplicable boundary vertex; returns its in-core index.
    fn add_in_core_point(&mut self, vertex: MeshVertex) -> usize;

    /// Appends an interior vertex; returns its running index.
    fn add_out_of_core_point(&mut self, vertex: MeshVertex) -> usize;

    /// Reads back an in-core vertex.
    fn in_core_point(&self, index: usize) -> MeshVertex;

    /// Emits one face.
    fn add_polygon(&mut self, vertices: &[VertexIndex]);

    /// The number of interior vertices appended so far; the extractor uses
    /// this as a per-subtree base offset.
    fn out_of_core_point_count(&self) -> usize;
}

/// A mesh collected entirely in memory.
#[derive(Default)]
pub struct CoredVecMesh {
    in_core: Vec<MeshVertex>,
    out_of_core: Vec<MeshVertex>,
    polygons: Vec<Vec<VertexIndex>>,
}

impl CoredVecMesh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn polygon_count(&self) -> usize {
        self.polygons.len()
    }

    pub fn vertex_count(&self) -> usize {
        self.in_core.len() + self.out_of_core.len()
    }

    /// Flattens the two vertex channels into one array and remaps every
    /// polygon accordingly: in-core vertices first, then out-of-core.
    pub fn into_vertices_and_polygons(self) -> (Vec<MeshVertex>, Vec<Vec<usize>>) {
        let in_core_count = self.in_core.len();
        let mut vertices = self.in_core;
        vertices.extend(self.out_of_core);
        let polygons = self
            .polygons
            .into_iter()
            .map(|polygon| {
                polygon
                    .into_iter()
                    .map(|v| {
                        if v.in_core {
                            v.index
                        } else {
                            in_core_count + v.index
                        }
                    })
                    .collect()
            })
            .collect();
        (vertices, polygons)
    }
}

impl MeshSink for CoredVecMesh {
    fn add_in_core_point(&mut self, vertex: MeshVertex) -> usize {
        self.in_core.push(vertex);
        self.in_core.len() - 1
    }

    fn add_out_of_core_point(&mut self, vertex: MeshVertex) -> usize {
        self.out_of_core.push(vertex);
        self.out_of_core.len() - 1
    }

    fn in_core_point(&self, index: usize) -> MeshVertex {
        self.in_core[index]
    }

    fn add_polygon(&mut self, vertices: &[VertexIndex]) {
        self.polygons.push(vertices.to_vec());
    }

    fn out_of_core_point_count(&self) -> usize {
        self.out_of_core.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn vertex_channels_flatten_consistently() {
        let mut mesh = CoredVecMesh::new();
        let a = mesh.add_in_core_point(MeshVertex::new(Point3::new(0.0, 0.0, 0.0)));
        let b = mesh.add_out_of_core_point(MeshVertex::new(Point3::new(1.0, 0.0, 0.0)));
        let c = mesh.add_out_of_core_point(MeshVertex::new(Point3::new(0.0, 1.0, 0.0)));
        mesh.add_polygon(&[
            VertexIndex {
                index: a,
                in_core: true,
            },
            VertexIndex {
                index: b,
                in_core: false,
            },
            VertexIndex {
                index: c,
                in_core: false,
            },
        ]);
        assert_eq!(mesh.out_of_core_point_count(), 2);

        let (vertices, polygons) = mesh.into_vertices_and_polygons();
        assert_eq!(vertices.len(), 3);
        assert_eq!(polygons, vec![vec![0, 1, 2]]);
        assert_eq!(vertices[1].position, Point3::new(1.0, 0.0, 0.0));
    }
}
