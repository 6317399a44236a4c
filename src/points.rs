use crate::Real;
use na::{Point3, Vector3};

/// A reset-able cursor over oriented samples.
///
/// The reconstruction reads the stream exactly twice in full (a bounding
/// pass, then the splatting pass) and never persists cursor state.
pub trait PointStream {
    /// Rewinds the cursor to the first sample.
    fn reset(&mut self);

    /// The next `(position, normal)` sample, or `None` at the end.
    fn next_point(&mut self) -> Option<(Point3<Real>, Vector3<Real>)>;
}

/// A stream over borrowed sample slices.
pub struct SlicePointStream<'a> {
    points: &'a [Point3<Real>],
    normals: &'a [Vector3<Real>],
    cursor: usize,
}

impl<'a> SlicePointStream<'a> {
    pub fn new(points: &'a [Point3<Real>], normals: &'a [Vector3<Real>]) -> Self {
        assert_eq!(points.len(), normals.len());
        Self {
            points,
            normals,
            cursor: 0,
        }
    }
}

impl PointStream for SlicePointStream<'_> {
    fn reset(&mut self) {
        self.cursor = 0;
    }

    fn next_point(&mut self) -> Option<(Point3<Real>, Vector3<Real>)> {
        let i = self.cursor;
        if i == self.points.len() {
            return None;
        }
        self.cursor += 1;
        Some((self.points[i], self.normals[i]))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn slice_stream_resets() {
        let points = vec![Point3::new(0.0, 1.0, 2.0), Point3::new(3.0, 4.0, 5.0)];
        let normals = vec![Vector3::x(), Vector3::y()];
        let mut stream = SlicePointStream::new(&points, &normals);
        assert_eq!(stream.next_point().unwrap().0, points[0]);
        assert_eq!(stream.next_point().unwrap().0, points[1]);
        assert!(stream.next_point().is_none());
        stream.reset();
        assert_eq!(stream.next_point().unwrap().1, normals[0]);
    }
}
