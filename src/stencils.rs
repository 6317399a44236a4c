//! Precomputed interior-cell stencils.
//!
//! At a fixed depth every interior cell sees the same relative basis
//! configuration, so the 5³ Laplacian/divergence couplings and the 3³
//! evaluation weights are computed once per depth from a representative
//! center cell. Cells near the domain walls (or outside the inset region in
//! free mode) fall back to explicit [`Integrator`](crate::bspline::Integrator)
//! queries.

use crate::bspline::BSplineData;
use crate::Real;
use na::Vector3;

pub type Stencil3 = [[[Real; 3]; 3]; 3];
pub type Stencil5 = [[[Real; 5]; 5]; 5];
pub type VStencil5 = [[[Vector3<Real>; 5]; 5]; 5];

/// A stencil variant per child corner of the parent cell.
#[derive(Clone)]
pub struct ChildStencil<T>(pub [[[T; 2]; 2]; 2]);

impl<T> ChildStencil<T> {
    #[inline]
    pub fn at(&self, x: usize, y: usize, z: usize) -> &T {
        &self.0[x][y][z]
    }
}

/// Axis-aligned index bounds into a 5³ (or 3³) neighborhood.
#[derive(Copy, Clone, Debug)]
pub struct Range3D {
    pub start: [usize; 3],
    pub end: [usize; 3],
}

impl Range3D {
    pub fn full5() -> Self {
        Self {
            start: [0; 3],
            end: [5; 3],
        }
    }

    pub fn full3() -> Self {
        Self {
            start: [0; 3],
            end: [3; 3],
        }
    }
}

/// Restricts a parent-depth 5³ range to the half actually overlapping the
/// child's support, given the child's corner index within its parent.
pub fn update_coarser_support_bounds(child_index: usize, range: &mut Range3D) {
    let (x, y, z) = crate::cube::factor_corner_index(child_index);
    for (axis, &c) in [x, y, z].iter().enumerate() {
        if c == 0 {
            range.end[axis] = 4;
        } else {
            range.start[axis] = 1;
        }
    }
}

fn zero_stencil3() -> Stencil3 {
    [[[0.0; 3]; 3]; 3]
}

fn zero_stencil5() -> Stencil5 {
    [[[0.0; 5]; 5]; 5]
}

fn zero_vstencil5() -> VStencil5 {
    [[[Vector3::zeros(); 5]; 5]; 5]
}

/// ⟨∇φ₁, ∇φ₂⟩ between `(d, off1)` and `(d or d-1, off2)`.
pub fn laplacian(
    data: &BSplineData,
    d: usize,
    off1: [i32; 3],
    off2: [i32; 3],
    child_parent: bool,
) -> Real {
    let integrator = data.integrator();
    let vv = [
        integrator.dot(d, off1[0], off2[0], false, false, child_parent),
        integrator.dot(d, off1[1], off2[1], false, false, child_parent),
        integrator.dot(d, off1[2], off2[2], false, false, child_parent),
    ];
    let dd = [
        integrator.dot(d, off1[0], off2[0], true, true, child_parent),
        integrator.dot(d, off1[1], off2[1], true, true, child_parent),
        integrator.dot(d, off1[2], off2[2], true, true, child_parent),
    ];
    dd[0] * vv[1] * vv[2] + vv[0] * dd[1] * vv[2] + vv[0] * vv[1] * dd[2]
}

/// The divergence coupling used when the acting node carries the normal
/// (the scatter direction).
///
/// With `gradient_domain` the vector field is dotted with the gradient of
/// the receiving basis; otherwise the (negated) divergence of the field is
/// dotted with the basis. The two differ by a sign and which factor carries
/// the derivative.
pub fn divergence1(
    data: &BSplineData,
    d: usize,
    off1: [i32; 3],
    off2: [i32; 3],
    child_parent: bool,
    gradient_domain: bool,
) -> Vector3<Real> {
    let integrator = data.integrator();
    let vv = [
        integrator.dot(d, off1[0], off2[0], false, false, child_parent),
        integrator.dot(d, off1[1], off2[1], false, false, child_parent),
        integrator.dot(d, off1[2], off2[2], false, false, child_parent),
    ];
    if gradient_domain {
        let vd = [
            integrator.dot(d, off1[0], off2[0], false, true, child_parent),
            integrator.dot(d, off1[1], off2[1], false, true, child_parent),
            integrator.dot(d, off1[2], off2[2], false, true, child_parent),
        ];
        Vector3::new(vd[0] * vv[1] * vv[2], vv[0] * vd[1] * vv[2], vv[0] * vv[1] * vd[2])
    } else {
        let dv = [
            integrator.dot(d, off1[0], off2[0], true, false, child_parent),
            integrator.dot(d, off1[1], off2[1], true, false, child_parent),
            integrator.dot(d, off1[2], off2[2], true, false, child_parent),
        ];
        -Vector3::new(dv[0] * vv[1] * vv[2], vv[0] * dv[1] * vv[2], vv[0] * vv[1] * dv[2])
    }
}

/// The divergence coupling used when the acting node receives contributions
/// from a normal-carrying neighbor (the gather direction).
pub fn divergence2(
    data: &BSplineData,
    d: usize,
    off1: [i32; 3],
    off2: [i32; 3],
    child_parent: bool,
    gradient_domain: bool,
) -> Vector3<Real> {
    let integrator = data.integrator();
    let vv = [
        integrator.dot(d, off1[0], off2[0], false, false, child_parent),
        integrator.dot(d, off1[1], off2[1], false, false, child_parent),
        integrator.dot(d, off1[2], off2[2], false, false, child_parent),
    ];
    if gradient_domain {
        let dv = [
            integrator.dot(d, off1[0], off2[0], true, false, child_parent),
            integrator.dot(d, off1[1], off2[1], true, false, child_parent),
            integrator.dot(d, off1[2], off2[2], true, false, child_parent),
        ];
        Vector3::new(dv[0] * vv[1] * vv[2], vv[0] * dv[1] * vv[2], vv[0] * vv[1] * dv[2])
    } else {
        let vd = [
            integrator.dot(d, off1[0], off2[0], false, true, child_parent),
            integrator.dot(d, off1[1], off2[1], false, true, child_parent),
            integrator.dot(d, off1[2], off2[2], false, true, child_parent),
        ];
        -Vector3::new(vd[0] * vv[1] * vv[2], vv[0] * vd[1] * vv[2], vv[0] * vv[1] * vd[2])
    }
}

pub fn laplacian_stencil(data: &BSplineData, depth: usize) -> Stencil5 {
    let mut stencil = zero_stencil5();
    if depth < 2 {
        return stencil;
    }
    let center = 1i32 << (depth - 1);
    for (x, plane) in stencil.iter_mut().enumerate() {
        for (y, row) in plane.iter_mut().enumerate() {
            for (z, v) in row.iter_mut().enumerate() {
                let off2 = [
                    x as i32 + center - 2,
                    y as i32 + center - 2,
                    z as i32 + center - 2,
                ];
                *v = laplacian(data, depth, [center; 3], off2, false);
            }
        }
    }
    stencil
}

pub fn laplacian_stencils(data: &BSplineData, depth: usize) -> ChildStencil<Stencil5> {
    let mut stencils = ChildStencil([[[zero_stencil5(); 2]; 2]; 2]);
    if depth < 2 {
        return stencils;
    }
    let center = 1i32 << (depth - 1);
    for i in 0..2i32 {
        for j in 0..2i32 {
            for k in 0..2i32 {
                let off1 = [center + i, center + j, center + k];
                let target = &mut stencils.0[i as usize][j as usize][k as usize];
                for (x, plane) in target.iter_mut().enumerate() {
                    for (y, row) in plane.iter_mut().enumerate() {
                        for (z, v) in row.iter_mut().enumerate() {
                            let off2 = [
                                x as i32 + center / 2 - 2,
                                y as i32 + center / 2 - 2,
                                z as i32 + center / 2 - 2,
                            ];
                            *v = laplacian(data, depth, off1, off2, true);
                        }
                    }
                }
            }
        }
    }
    stencils
}

pub fn divergence_stencil(
    data: &BSplineData,
    depth: usize,
    scatter: bool,
    gradient_domain: bool,
) -> VStencil5 {
    let mut stencil = zero_vstencil5();
    if depth < 2 {
        return stencil;
    }
    let center = 1i32 << (depth - 1);
    for (x, plane) in stencil.iter_mut().enumerate() {
        for (y, row) in plane.iter_mut().enumerate() {
            for (z, v) in row.iter_mut().enumerate() {
                let off2 = [
                    x as i32 + center - 2,
                    y as i32 + center - 2,
                    z as i32 + center - 2,
                ];
                *v = if scatter {
                    divergence1(data, depth, [center; 3], off2, false, gradient_domain)
                } else {
                    divergence2(data, depth, [center; 3], off2, false, gradient_domain)
                };
            }
        }
    }
    stencil
}

pub fn divergence_stencils(
    data: &BSplineData,
    depth: usize,
    scatter: bool,
    gradient_domain: bool,
) -> ChildStencil<VStencil5> {
    let mut stencils = ChildStencil([[[zero_vstencil5(); 2]; 2]; 2]);
    if depth < 2 {
        return stencils;
    }
    let center = 1i32 << (depth - 1);
    for i in 0..2i32 {
        for j in 0..2i32 {
            for k in 0..2i32 {
                let off1 = [center + i, center + j, center + k];
                let target = &mut stencils.0[i as usize][j as usize][k as usize];
                for (x, plane) in target.iter_mut().enumerate() {
                    for (y, row) in plane.iter_mut().enumerate() {
                        for (z, v) in row.iter_mut().enumerate() {
                            let off2 = [
                                x as i32 + center / 2 - 2,
                                y as i32 + center / 2 - 2,
                                z as i32 + center / 2 - 2,
                            ];
                            *v = if scatter {
                                divergence1(data, depth, off1, off2, true, gradient_domain)
                            } else {
                                divergence2(data, depth, off1, off2, true, gradient_domain)
                            };
                        }
                    }
                }
            }
        }
    }
    stencils
}

pub fn center_evaluation_stencil(data: &BSplineData, depth: usize) -> Stencil3 {
    let mut stencil = zero_stencil3();
    if depth < 2 {
        return stencil;
    }
    let center = 1i32 << (depth - 1);
    for (x, plane) in stencil.iter_mut().enumerate() {
        for (y, row) in plane.iter_mut().enumerate() {
            for (z, v) in row.iter_mut().enumerate() {
                *v = data.center_value(depth, center, x as i32 + center - 1, false, false)
                    * data.center_value(depth, center, y as i32 + center - 1, false, false)
                    * data.center_value(depth, center, z as i32 + center - 1, false, false);
            }
        }
    }
    stencil
}

pub fn center_evaluation_stencils(data: &BSplineData, depth: usize) -> ChildStencil<Stencil3> {
    let mut stencils = ChildStencil([[[zero_stencil3(); 2]; 2]; 2]);
    if depth < 3 {
        return stencils;
    }
    let center = 1i32 << (depth - 1);
    for i in 0..2i32 {
        for j in 0..2i32 {
            for k in 0..2i32 {
                let idx = [center + i, center + j, center + k];
                let target = &mut stencils.0[i as usize][j as usize][k as usize];
                for (x, plane) in target.iter_mut().enumerate() {
                    for (y, row) in plane.iter_mut().enumerate() {
                        for (z, v) in row.iter_mut().enumerate() {
                            *v = data
                                .center_value(depth, idx[0], x as i32 + center / 2 - 1, false, true)
                                * data.center_value(
                                    depth,
                                    idx[1],
                                    y as i32 + center / 2 - 1,
                                    false,
                                    true,
                                )
                                * data.center_value(
                                    depth,
                                    idx[2],
                                    z as i32 + center / 2 - 1,
                                    false,
                                    true,
                                );
                        }
                    }
                }
            }
        }
    }
    stencils
}

/// Per cell corner: the 3³ weights of the co-depth neighborhood.
pub fn corner_evaluation_stencil(data: &BSplineData, depth: usize) -> ChildStencil<Stencil3> {
    let mut stencils = ChildStencil([[[zero_stencil3(); 2]; 2]; 2]);
    if depth < 2 {
        return stencils;
    }
    let center = 1i32 << (depth - 1);
    for cx in 0..2i32 {
        for cy in 0..2i32 {
            for cz in 0..2i32 {
                let target = &mut stencils.0[cx as usize][cy as usize][cz as usize];
                for (x, plane) in target.iter_mut().enumerate() {
                    for (y, row) in plane.iter_mut().enumerate() {
                        for (z, v) in row.iter_mut().enumerate() {
                            *v = data
                                .corner_value(depth, center, cx, x as i32 + center - 1, false, false)
                                * data.corner_value(
                                    depth,
                                    center,
                                    cy,
                                    y as i32 + center - 1,
                                    false,
                                    false,
                                )
                                * data.corner_value(
                                    depth,
                                    center,
                                    cz,
                                    z as i32 + center - 1,
                                    false,
                                    false,
                                );
                        }
                    }
                }
            }
        }
    }
    stencils
}

/// Per cell corner and per child index: the parent-depth 3³ weights.
pub fn corner_evaluation_stencils(
    data: &BSplineData,
    depth: usize,
) -> ChildStencil<ChildStencil<Stencil3>> {
    let mut outer = ChildStencil([
        [
            [
                ChildStencil([[[zero_stencil3(); 2]; 2]; 2]),
                ChildStencil([[[zero_stencil3(); 2]; 2]; 2]),
            ],
            [
                ChildStencil([[[zero_stencil3(); 2]; 2]; 2]),
                ChildStencil([[[zero_stencil3(); 2]; 2]; 2]),
            ],
        ],
        [
            [
                ChildStencil([[[zero_stencil3(); 2]; 2]; 2]),
                ChildStencil([[[zero_stencil3(); 2]; 2]; 2]),
            ],
            [
                ChildStencil([[[zero_stencil3(); 2]; 2]; 2]),
                ChildStencil([[[zero_stencil3(); 2]; 2]; 2]),
            ],
        ],
    ]);
    if depth < 3 {
        return outer;
    }
    let center = 1i32 << (depth - 1);
    for cx in 0..2i32 {
        for cy in 0..2i32 {
            for cz in 0..2i32 {
                for ci in 0..2i32 {
                    for cj in 0..2i32 {
                        for ck in 0..2i32 {
                            let idx = [center + ci, center + cj, center + ck];
                            let target = &mut outer.0[cx as usize][cy as usize][cz as usize].0
                                [ci as usize][cj as usize][ck as usize];
                            for (x, plane) in target.iter_mut().enumerate() {
                                for (y, row) in plane.iter_mut().enumerate() {
                                    for (z, v) in row.iter_mut().enumerate() {
                                        *v = data.corner_value(
                                            depth,
                                            idx[0],
                                            cx,
                                            x as i32 + center / 2 - 1,
                                            false,
                                            true,
                                        ) * data.corner_value(
                                            depth,
                                            idx[1],
                                            cy,
                                            y as i32 + center / 2 - 1,
                                            false,
                                            true,
                                        ) * data.corner_value(
                                            depth,
                                            idx[2],
                                            cz,
                                            z as i32 + center / 2 - 1,
                                            false,
                                            true,
                                        );
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    outer
}

/// Per cell corner: the 5³ gradient weights of the co-depth neighborhood.
pub fn corner_normal_stencil(data: &BSplineData, depth: usize) -> ChildStencil<VStencil5> {
    let mut stencils = ChildStencil([[[zero_vstencil5(); 2]; 2]; 2]);
    if depth < 2 {
        return stencils;
    }
    let center = 1i32 << (depth - 1);
    for cx in 0..2i32 {
        for cy in 0..2i32 {
            for cz in 0..2i32 {
                let target = &mut stencils.0[cx as usize][cy as usize][cz as usize];
                for (x, plane) in target.iter_mut().enumerate() {
                    for (y, row) in plane.iter_mut().enumerate() {
                        for (z, out) in row.iter_mut().enumerate() {
                            let off = [
                                x as i32 + center - 2,
                                y as i32 + center - 2,
                                z as i32 + center - 2,
                            ];
                            let v = [
                                data.corner_value(depth, center, cx, off[0], false, false),
                                data.corner_value(depth, center, cy, off[1], false, false),
                                data.corner_value(depth, center, cz, off[2], false, false),
                            ];
                            let dv = [
                                data.corner_value(depth, center, cx, off[0], true, false),
                                data.corner_value(depth, center, cy, off[1], true, false),
                                data.corner_value(depth, center, cz, off[2], true, false),
                            ];
                            *out = Vector3::new(
                                dv[0] * v[1] * v[2],
                                v[0] * dv[1] * v[2],
                                v[0] * v[1] * dv[2],
                            );
                        }
                    }
                }
            }
        }
    }
    stencils
}

/// Per cell corner and per child index: the parent-depth 5³ gradient
/// weights.
pub fn corner_normal_stencils(
    data: &BSplineData,
    depth: usize,
) -> ChildStencil<ChildStencil<VStencil5>> {
    let empty = || ChildStencil([[[zero_vstencil5(); 2]; 2]; 2]);
    let mut outer = ChildStencil([
        [[empty(), empty()], [empty(), empty()]],
        [[empty(), empty()], [empty(), empty()]],
    ]);
    if depth < 3 {
        return outer;
    }
    let center = 1i32 << (depth - 1);
    for cx in 0..2i32 {
        for cy in 0..2i32 {
            for cz in 0..2i32 {
                for ci in 0..2i32 {
                    for cj in 0..2i32 {
                        for ck in 0..2i32 {
                            let idx = [center + ci, center + cj, center + ck];
                            let target = &mut outer.0[cx as usize][cy as usize][cz as usize].0
                                [ci as usize][cj as usize][ck as usize];
                            for (x, plane) in target.iter_mut().enumerate() {
                                for (y, row) in plane.iter_mut().enumerate() {
                                    for (z, out) in row.iter_mut().enumerate() {
                                        let off = [
                                            x as i32 + center / 2 - 2,
                                            y as i32 + center / 2 - 2,
                                            z as i32 + center / 2 - 2,
                                        ];
                                        let v = [
                                            data.corner_value(depth, idx[0], cx, off[0], false, true),
                                            data.corner_value(depth, idx[1], cy, off[1], false, true),
                                            data.corner_value(depth, idx[2], cz, off[2], false, true),
                                        ];
                                        let dv = [
                                            data.corner_value(depth, idx[0], cx, off[0], true, true),
                                            data.corner_value(depth, idx[1], cy, off[1], true, true),
                                            data.corner_value(depth, idx[2], cz, off[2], true, true),
                                        ];
                                        *out = Vector3::new(
                                            dv[0] * v[1] * v[2],
                                            v[0] * dv[1] * v[2],
                                            v[0] * v[1] * dv[2],
                                        );
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    outer
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bspline::BoundaryType;
    use approx::assert_abs_diff_eq;

    #[test]
    fn laplacian_stencil_matches_explicit_integrals() {
        let data = BSplineData::new(5, BoundaryType::Neumann);
        let depth = 4;
        let stencil = laplacian_stencil(&data, depth);
        let center = 1i32 << (depth - 1);
        for x in 0..5 {
            for y in 0..5 {
                for z in 0..5 {
                    let off2 = [
                        x as i32 + center - 2,
                        y as i32 + center - 2,
                        z as i32 + center - 2,
                    ];
                    assert_abs_diff_eq!(
                        stencil[x][y][z],
                        laplacian(&data, depth, [center; 3], off2, false),
                        epsilon = 1.0e-12
                    );
                }
            }
        }
        // Symmetry of the 5^3 table about its center.
        for x in 0..5 {
            for y in 0..5 {
                for z in 0..5 {
                    assert_abs_diff_eq!(
                        stencil[x][y][z],
                        stencil[4 - x][4 - y][4 - z],
                        epsilon = 1.0e-10
                    );
                }
            }
        }
    }

    #[test]
    fn divergence_directions_are_adjoint() {
        // Scatter from node A to node B must match gather at B from A.
        let data = BSplineData::new(5, BoundaryType::Neumann);
        let depth = 4;
        let center = 1i32 << (depth - 1);
        for gradient_domain in [false, true] {
            for delta in [-2i32, -1, 0, 1, 2] {
                let off2 = [center + delta, center, center + 1];
                let scatter = divergence1(&data, depth, [center; 3], off2, false, gradient_domain);
                let gather = divergence2(&data, depth, off2, [center; 3], false, gradient_domain);
                for a in 0..3 {
                    assert_abs_diff_eq!(scatter[a], gather[a], epsilon = 1.0e-12);
                }
            }
        }
    }

    #[test]
    fn shallow_depths_yield_empty_stencils() {
        let data = BSplineData::new(3, BoundaryType::Neumann);
        let stencil = laplacian_stencil(&data, 1);
        assert!(stencil.iter().flatten().flatten().all(|&v| v == 0.0));
    }
}
