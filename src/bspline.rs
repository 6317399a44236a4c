//! Tabulated 1D quadratic B-spline basis indexed by (depth, offset).
//!
//! The basis function of cell `o` at depth `d` is the quadratic B-spline
//! centered on that cell with a three-cell support, expressed in global
//! `[0, 1]` coordinates. Dirichlet and Neumann modes fold the out-of-domain
//! tails back by odd resp. even reflection, so the interior functions form a
//! partition of unity and the boundary conditions hold exactly. In free mode
//! nothing is folded: the functions spill outside the unit interval and the
//! callers restrict themselves to inset cells.

use crate::polynomial::Polynomial;
use crate::Real;

/// Boundary condition of the B-spline basis at the unit-cube walls.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BoundaryType {
    /// No condition: functions spill outside the domain and one extra depth
    /// is carried so the reconstruction stays inside the inset region.
    Free,
    /// The indicator vanishes on the walls (odd reflection).
    Dirichlet,
    /// The indicator's normal derivative vanishes on the walls (even
    /// reflection).
    Neumann,
}

impl BoundaryType {
    /// The tensor up/down-sampling weight attached to a domain-wall cell.
    pub fn corner_value(self) -> Real {
        match self {
            BoundaryType::Dirichlet => 0.5,
            BoundaryType::Neumann => 1.0,
            BoundaryType::Free => 0.75,
        }
    }
}

/// Is the cell inside the region where free-boundary basis functions are
/// fully supported (strictly inside the central half of the domain)?
pub fn is_inset(depth: usize, off: [i32; 3]) -> bool {
    if depth < 2 {
        return false;
    }
    let res = 1i32 << depth;
    let o = 1i32 << (depth - 2);
    off.iter().all(|&v| v >= o && v < res - o)
}

/// Like [`is_inset`] with an inclusive upper bound, for cells whose basis
/// support (rather than the cell itself) must stay inside.
pub fn is_inset_supported(depth: usize, off: [i32; 3]) -> bool {
    if depth < 2 {
        return false;
    }
    let res = 1i32 << depth;
    let o = 1i32 << (depth - 2);
    off.iter().all(|&v| v >= o && v <= res - o)
}

/// The three polynomial pieces of the canonical quadratic B-spline on
/// `[0, 3)`.
fn bspline03() -> [Polynomial<6>; 3] {
    [
        Polynomial::quadratic(0.0, 0.0, 0.5),    // x in [0, 1)
        Polynomial::quadratic(-1.5, 3.0, -1.0),  // x in [1, 2)
        Polynomial::quadratic(4.5, -3.0, 0.5),   // x in [2, 3)
    ]
}

/// A piecewise polynomial over disjoint, sorted intervals.
#[derive(Clone, Debug, Default)]
struct PiecewisePoly {
    pieces: Vec<(Real, Real, Polynomial<6>)>,
}

impl PiecewisePoly {
    fn eval(&self, x: Real) -> Real {
        for &(start, end, poly) in &self.pieces {
            if x >= start && x <= end {
                return poly.eval(x);
            }
        }
        0.0
    }

    fn derivative(&self) -> Self {
        Self {
            pieces: self
                .pieces
                .iter()
                .map(|&(start, end, poly)| (start, end, poly.derivative()))
                .collect(),
        }
    }

    /// ∫ self·other over the intersection of supports and `domain`.
    fn dot(&self, other: &Self, domain: Option<(Real, Real)>) -> Real {
        let mut result = 0.0;
        for &(s1, e1, p1) in &self.pieces {
            for &(s2, e2, p2) in &other.pieces {
                let mut start = s1.max(s2);
                let mut end = e1.min(e2);
                if let Some((lo, hi)) = domain {
                    start = start.max(lo);
                    end = end.min(hi);
                }
                if end > start {
                    result += (p1 * p2).integrate(start, end);
                }
            }
        }
        result
    }
}

/// The folded basis function for `(depth, offset)`.
fn basis_function(depth: usize, offset: i32, boundary: BoundaryType) -> PiecewisePoly {
    let res = 1i64 << depth;
    let width = 1.0 / res as Real;
    let b = bspline03();

    let mut raw: Vec<(i64, Polynomial<6>)> = (0..3)
        .map(|j| {
            let cell = offset as i64 - 1 + j as i64;
            (
                cell,
                b[j].scale_shift((offset as Real - 1.0) * width, width),
            )
        })
        .collect();

    if boundary != BoundaryType::Free {
        let sign = if boundary == BoundaryType::Neumann {
            1.0
        } else {
            -1.0
        };
        let mut folded: Vec<(i64, Polynomial<6>)> = Vec::new();
        for (cell, poly) in raw {
            if cell < 0 {
                // Reflect about x = 0 into cell -1 - cell.
                folded.push((-1 - cell, poly.reflect(0.0) * sign));
            } else if cell >= res {
                // Reflect about x = 1.
                folded.push((2 * res - 1 - cell, poly.reflect(2.0) * sign));
            } else {
                folded.push((cell, poly));
            }
        }
        // Merge pieces that landed on the same cell.
        folded.sort_by_key(|&(cell, _)| cell);
        let mut merged: Vec<(i64, Polynomial<6>)> = Vec::new();
        for (cell, poly) in folded {
            match merged.last_mut() {
                Some((last_cell, last_poly)) if *last_cell == cell => {
                    *last_poly = *last_poly + poly;
                }
                _ => merged.push((cell, poly)),
            }
        }
        raw = merged;
    }

    PiecewisePoly {
        pieces: raw
            .into_iter()
            .map(|(cell, poly)| (cell as Real * width, (cell + 1) as Real * width, poly))
            .collect(),
    }
}

/// Precomputed bases, derivatives, and cross-integral tables for every depth
/// up to a fixed maximum.
pub struct BSplineData {
    values: Vec<Vec<PiecewisePoly>>,
    derivatives: Vec<Vec<PiecewisePoly>>,
    integrator: Integrator,
}

/// Tabulated 1D cross-products.
///
/// Same-depth entries are indexed by `off2 - off1 + 2`; child-parent entries
/// by `off2 - (off1 >> 1) + 2` with `off2` at the parent depth. Entries
/// outside the five-wide support window are zero.
pub struct Integrator {
    // [depth][offset][delta][d1][d2]
    same: Vec<Vec<[[[Real; 2]; 2]; 5]>>,
    child_parent: Vec<Vec<[[[Real; 2]; 2]; 5]>>,
}

impl Integrator {
    /// 1D integral `∫ D^{d1} φ_{d,off1} · D^{d2} φ_{d',off2}` with
    /// `d' = d - 1` when `child_parent` is set.
    pub fn dot(
        &self,
        depth: usize,
        off1: i32,
        off2: i32,
        d1: bool,
        d2: bool,
        child_parent: bool,
    ) -> Real {
        let res = 1i32 << depth;
        if off1 < 0 || off1 >= res {
            return 0.0;
        }
        let table = if child_parent {
            &self.child_parent
        } else {
            &self.same
        };
        let delta = if child_parent {
            off2 - (off1 >> 1) + 2
        } else {
            off2 - off1 + 2
        };
        if !(0..5).contains(&delta) {
            return 0.0;
        }
        table[depth][off1 as usize][delta as usize][usize::from(d1)][usize::from(d2)]
    }
}

impl BSplineData {
    /// Tabulates the basis for all depths `0..=depth`.
    pub fn new(depth: usize, boundary: BoundaryType) -> Self {
        let mut values = Vec::with_capacity(depth + 1);
        let mut derivatives: Vec<Vec<PiecewisePoly>> = Vec::with_capacity(depth + 1);
        for d in 0..=depth {
            let res = 1i32 << d;
            let row: Vec<PiecewisePoly> =
                (0..res).map(|o| basis_function(d, o, boundary)).collect();
            derivatives.push(row.iter().map(PiecewisePoly::derivative).collect());
            values.push(row);
        }

        let domain = match boundary {
            BoundaryType::Free => None,
            _ => Some((0.0, 1.0)),
        };
        let mut same = Vec::with_capacity(depth + 1);
        let mut child_parent = Vec::with_capacity(depth + 1);
        for d in 0..=depth {
            let res = 1i32 << d;
            let mut same_row = Vec::with_capacity(res as usize);
            let mut cp_row = Vec::with_capacity(res as usize);
            for o in 0..res {
                let mut same_entry = [[[0.0; 2]; 2]; 5];
                let mut cp_entry = [[[0.0; 2]; 2]; 5];
                for delta in 0..5i32 {
                    let off2 = o + delta - 2;
                    if off2 >= 0 && off2 < res {
                        for d1 in 0..2 {
                            for d2 in 0..2 {
                                let f1 = if d1 == 0 {
                                    &values[d][o as usize]
                                } else {
                                    &derivatives[d][o as usize]
                                };
                                let f2 = if d2 == 0 {
                                    &values[d][off2 as usize]
                                } else {
                                    &derivatives[d][off2 as usize]
                                };
                                same_entry[delta as usize][d1][d2] = f1.dot(f2, domain);
                            }
                        }
                    }
                    if d > 0 {
                        let parent_off = (o >> 1) + delta - 2;
                        if parent_off >= 0 && parent_off < res / 2 {
                            for d1 in 0..2 {
                                for d2 in 0..2 {
                                    let f1 = if d1 == 0 {
                                        &values[d][o as usize]
                                    } else {
                                        &derivatives[d][o as usize]
                                    };
                                    let f2 = if d2 == 0 {
                                        &values[d - 1][parent_off as usize]
                                    } else {
                                        &derivatives[d - 1][parent_off as usize]
                                    };
                                    cp_entry[delta as usize][d1][d2] = f1.dot(f2, domain);
                                }
                            }
                        }
                    }
                }
                same_row.push(same_entry);
                cp_row.push(cp_entry);
            }
            same.push(same_row);
            child_parent.push(cp_row);
        }

        Self {
            values,
            derivatives,
            integrator: Integrator { same, child_parent },
        }
    }

    pub fn integrator(&self) -> &Integrator {
        &self.integrator
    }

    /// φ_{depth,off}(x), zero outside the tabulated range.
    pub fn value(&self, depth: usize, off: i32, x: Real) -> Real {
        if off < 0 || off >= 1i32 << depth {
            return 0.0;
        }
        self.values[depth][off as usize].eval(x)
    }

    /// φ'_{depth,off}(x).
    pub fn derivative(&self, depth: usize, off: i32, x: Real) -> Real {
        if off < 0 || off >= 1i32 << depth {
            return 0.0;
        }
        self.derivatives[depth][off as usize].eval(x)
    }

    /// Basis value (or derivative) of `(d', off2)` at the center of cell
    /// `(depth, off1)`, with `d' = depth - 1` when `child_parent` is set.
    pub fn center_value(
        &self,
        depth: usize,
        off1: i32,
        off2: i32,
        derivative: bool,
        child_parent: bool,
    ) -> Real {
        let width = 1.0 / (1i64 << depth) as Real;
        let x = (off1 as Real + 0.5) * width;
        let d = if child_parent { depth - 1 } else { depth };
        if derivative {
            self.derivative(d, off2, x)
        } else {
            self.value(d, off2, x)
        }
    }

    /// Basis value (or derivative) of `(d', off2)` at corner `c ∈ {0, 1}` of
    /// cell `(depth, off1)`.
    pub fn corner_value(
        &self,
        depth: usize,
        off1: i32,
        c: i32,
        off2: i32,
        derivative: bool,
        child_parent: bool,
    ) -> Real {
        let width = 1.0 / (1i64 << depth) as Real;
        let x = (off1 + c) as Real * width;
        let d = if child_parent { depth - 1 } else { depth };
        if derivative {
            self.derivative(d, off2, x)
        } else {
            self.value(d, off2, x)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn neumann_basis_is_a_partition_of_unity() {
        let data = BSplineData::new(4, BoundaryType::Neumann);
        for d in 0..=4usize {
            let res = 1i32 << d;
            for i in 0..50 {
                let x = i as Real / 49.0;
                let sum: Real = (0..res).map(|o| data.value(d, o, x)).sum();
                assert_abs_diff_eq!(sum, 1.0, epsilon = 1.0e-10);
            }
        }
    }

    #[test]
    fn free_basis_is_a_partition_of_unity_inside() {
        let data = BSplineData::new(4, BoundaryType::Free);
        let d = 4usize;
        let res = 1i32 << d;
        // Away from the walls the un-folded functions already sum to one.
        for i in 0..50 {
            let x = 0.25 + 0.5 * i as Real / 49.0;
            let sum: Real = (0..res).map(|o| data.value(d, o, x)).sum();
            assert_abs_diff_eq!(sum, 1.0, epsilon = 1.0e-10);
        }
    }

    #[test]
    fn dirichlet_basis_vanishes_at_the_walls() {
        let data = BSplineData::new(3, BoundaryType::Dirichlet);
        for d in 1..=3usize {
            let res = 1i32 << d;
            for o in 0..res {
                assert_abs_diff_eq!(data.value(d, o, 0.0), 0.0, epsilon = 1.0e-12);
                assert_abs_diff_eq!(data.value(d, o, 1.0), 0.0, epsilon = 1.0e-12);
            }
        }
    }

    #[test]
    fn neumann_derivative_vanishes_at_the_walls() {
        let data = BSplineData::new(3, BoundaryType::Neumann);
        for d in 1..=3usize {
            let res = 1i32 << d;
            for o in 0..res {
                assert_abs_diff_eq!(data.derivative(d, o, 0.0), 0.0, epsilon = 1.0e-9);
                assert_abs_diff_eq!(data.derivative(d, o, 1.0), 0.0, epsilon = 1.0e-9);
            }
        }
    }

    #[test]
    fn cross_products_are_symmetric() {
        for boundary in [
            BoundaryType::Free,
            BoundaryType::Dirichlet,
            BoundaryType::Neumann,
        ] {
            let data = BSplineData::new(4, boundary);
            let integrator = data.integrator();
            let d = 3usize;
            let res = 1i32 << d;
            for o1 in 0..res {
                for delta in -2..=2i32 {
                    let o2 = o1 + delta;
                    if o2 < 0 || o2 >= res {
                        continue;
                    }
                    assert_abs_diff_eq!(
                        integrator.dot(d, o1, o2, false, false, false),
                        integrator.dot(d, o2, o1, false, false, false),
                        epsilon = 1.0e-12
                    );
                    assert_abs_diff_eq!(
                        integrator.dot(d, o1, o2, true, true, false),
                        integrator.dot(d, o2, o1, true, true, false),
                        epsilon = 1.0e-12
                    );
                    assert_abs_diff_eq!(
                        integrator.dot(d, o1, o2, true, false, false),
                        integrator.dot(d, o2, o1, false, true, false),
                        epsilon = 1.0e-12
                    );
                }
            }
        }
    }

    #[test]
    fn integrals_match_quadrature() {
        let data = BSplineData::new(3, BoundaryType::Neumann);
        let integrator = data.integrator();
        let d = 3usize;
        // Midpoint rule on a fine grid as an independent reference.
        let steps = 20_000;
        for (o1, o2, d1, d2, child_parent) in [
            (3i32, 3i32, false, false, false),
            (3, 4, false, false, false),
            (3, 5, true, true, false),
            (5, 2, false, true, true),
            (4, 3, true, false, true),
        ] {
            let mut reference = 0.0;
            for i in 0..steps {
                let x = (i as Real + 0.5) / steps as Real;
                let f1 = if d1 {
                    data.derivative(d, o1, x)
                } else {
                    data.value(d, o1, x)
                };
                let dp = if child_parent { d - 1 } else { d };
                let f2 = if d2 {
                    data.derivative(dp, o2, x)
                } else {
                    data.value(dp, o2, x)
                };
                reference += f1 * f2 / steps as Real;
            }
            let tabulated = integrator.dot(d, o1, o2, d1, d2, child_parent);
            assert_abs_diff_eq!(tabulated, reference, epsilon = 1.0e-6);
        }
    }

    #[test]
    fn inset_predicate_matches_definition() {
        assert!(is_inset(4, [4, 8, 11]));
        assert!(!is_inset(4, [3, 8, 8]));
        assert!(!is_inset(4, [4, 8, 12]));
        assert!(is_inset_supported(4, [4, 8, 12]));
        assert!(!is_inset_supported(4, [3, 8, 8]));
    }
}
