//! Row-stored symmetric sparse matrix and the conjugate-gradient solver used
//! by the per-depth multigrid systems.

use crate::Real;
use rayon::prelude::*;

/// One stored entry of a matrix row.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MatrixEntry {
    pub col: u32,
    pub value: Real,
}

impl MatrixEntry {
    pub fn new(col: usize, value: Real) -> Self {
        Self {
            col: col as u32,
            value,
        }
    }
}

/// A symmetric sparse matrix storing only the upper-triangular half of each
/// row, with the diagonal entry halved.
///
/// The symmetric complement is applied unconditionally during mat-vec, so a
/// halved diagonal is accumulated exactly twice. Row assembly is responsible
/// for the halving.
#[derive(Clone, Debug, Default)]
pub struct SparseSymmetricMatrix {
    rows: Vec<Vec<MatrixEntry>>,
}

impl SparseSymmetricMatrix {
    pub fn zeros(rows: usize) -> Self {
        Self {
            rows: vec![Vec::new(); rows],
        }
    }

    pub fn from_rows(rows: Vec<Vec<MatrixEntry>>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> usize {
        self.rows.len()
    }

    pub fn entries(&self) -> usize {
        self.rows.iter().map(Vec::len).sum()
    }

    pub fn row(&self, i: usize) -> &[MatrixEntry] {
        &self.rows[i]
    }

    pub fn set_row(&mut self, i: usize, row: Vec<MatrixEntry>) {
        self.rows[i] = row;
    }

    /// `output = A * input`, optionally with the rank-one DC term
    /// `(1/n)·𝟙𝟙ᵀ` added to the operator.
    ///
    /// Rows are processed in parallel; the scattered (transposed) halves land
    /// in per-thread scratch vectors that are reduced afterwards.
    pub fn multiply(&self, input: &[Real], output: &mut [Real], add_dc_term: bool) {
        let n = input.len();
        debug_assert_eq!(output.len(), n);

        let accumulated = self
            .rows
            .par_iter()
            .enumerate()
            .fold(
                || vec![0.0; n],
                |mut scratch, (i, row)| {
                    let mut acc = 0.0;
                    for e in row {
                        acc += e.value * input[e.col as usize];
                        scratch[e.col as usize] += e.value * input[i];
                    }
                    scratch[i] += acc;
                    scratch
                },
            )
            .reduce(
                || vec![0.0; n],
                |mut a, b| {
                    for (x, y) in a.iter_mut().zip(b) {
                        *x += y;
                    }
                    a
                },
            );

        let dc_term = if add_dc_term {
            input.par_iter().sum::<Real>() / n as Real
        } else {
            0.0
        };

        output
            .par_iter_mut()
            .zip(accumulated.par_iter())
            .for_each(|(out, acc)| *out = dc_term + acc);
    }

    /// The Frobenius-like `Ln` norm over the stored entries.
    pub fn norm(&self, ln: u32) -> Real {
        let mut n = 0.0;
        for row in &self.rows {
            for e in row {
                n += e.value.powi(ln as i32);
            }
        }
        n.powf(1.0 / ln as Real)
    }
}

fn dot(a: &[Real], b: &[Real]) -> Real {
    a.par_iter().zip(b.par_iter()).map(|(x, y)| x * y).sum()
}

/// Classical conjugate gradient on `A x = b`.
///
/// The true residual is recomputed every 50 iterations; convergence is
/// declared when the squared residual falls below `eps² · ‖r₀‖²`. When
/// `reset` is false the iteration continues from the incoming `x`. Returns
/// the number of iterations performed.
pub fn solve(
    a: &SparseSymmetricMatrix,
    b: &[Real],
    iters: usize,
    x: &mut [Real],
    eps: Real,
    reset: bool,
    add_dc_term: bool,
) -> usize {
    const REFRESH_INTERVAL: usize = 50;
    let dim = b.len();
    let eps2 = eps * eps;
    if reset {
        x.iter_mut().for_each(|v| *v = 0.0);
    }

    let mut r = vec![0.0; dim];
    a.multiply(x, &mut r, add_dc_term);
    let mut d = vec![0.0; dim];
    let mut delta_new = 0.0;
    for i in 0..dim {
        r[i] = b[i] - r[i];
        d[i] = r[i];
        delta_new += r[i] * r[i];
    }

    if delta_new < eps2 {
        log::debug!("initial residual already below tolerance: {delta_new} < {eps2}");
        return 0;
    }
    let delta_0 = delta_new;

    let mut q = vec![0.0; dim];
    let mut iteration = 0;
    while iteration != iters && delta_new > eps2 * delta_0 {
        a.multiply(&d, &mut q, add_dc_term);
        let d_dot_q = dot(&d, &q);
        if d_dot_q == 0.0 {
            break;
        }
        let alpha = delta_new / d_dot_q;
        let delta_old = delta_new;

        if iteration % REFRESH_INTERVAL == REFRESH_INTERVAL - 1 {
            x.par_iter_mut()
                .zip(d.par_iter())
                .for_each(|(x, d)| *x += d * alpha);
            a.multiply(x, &mut r, add_dc_term);
            delta_new = r
                .par_iter_mut()
                .zip(b.par_iter())
                .map(|(r, b)| {
                    *r = b - *r;
                    *r * *r
                })
                .sum();
        } else {
            delta_new = 0.0;
            for i in 0..dim {
                r[i] -= q[i] * alpha;
                delta_new += r[i] * r[i];
                x[i] += d[i] * alpha;
            }
        }

        let beta = delta_new / delta_old;
        d.par_iter_mut()
            .zip(r.par_iter())
            .for_each(|(d, r)| *d = r + *d * beta);
        iteration += 1;
    }
    iteration
}

#[cfg(test)]
mod test {
    use super::*;

    // Deterministic pseudo-random reals in (-1, 1).
    fn lcg(seed: &mut u64) -> Real {
        *seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((*seed >> 11) as Real / (1u64 << 53) as Real) * 2.0 - 1.0
    }

    // A diagonally dominant (hence SPD) symmetric matrix in upper-half
    // storage, plus the same matrix as a dense array.
    fn spd_fixture(n: usize, seed: u64) -> (SparseSymmetricMatrix, Vec<Vec<Real>>) {
        let mut seed = seed;
        let mut dense = vec![vec![0.0; n]; n];
        for i in 0..n {
            for j in i + 1..n {
                if lcg(&mut seed) > 0.2 {
                    continue;
                }
                let v = lcg(&mut seed);
                dense[i][j] = v;
                dense[j][i] = v;
            }
        }
        for i in 0..n {
            let off_sum: Real = dense[i].iter().map(|v| v.abs()).sum();
            dense[i][i] = off_sum + 1.0;
        }

        let mut m = SparseSymmetricMatrix::zeros(n);
        for i in 0..n {
            let mut row = vec![MatrixEntry::new(i, dense[i][i] / 2.0)];
            for j in i + 1..n {
                if dense[i][j] != 0.0 {
                    row.push(MatrixEntry::new(j, dense[i][j]));
                }
            }
            m.set_row(i, row);
        }
        (m, dense)
    }

    #[test]
    fn multiply_matches_dense_reference() {
        let n = 37;
        let (m, dense) = spd_fixture(n, 17);
        let mut seed = 99;
        let x: Vec<Real> = (0..n).map(|_| lcg(&mut seed)).collect();

        let mut result = vec![0.0; n];
        m.multiply(&x, &mut result, false);

        for i in 0..n {
            let expected: Real = (0..n).map(|j| dense[i][j] * x[j]).sum();
            assert!((result[i] - expected).abs() < 1.0e-12);
        }
    }

    #[test]
    fn multiply_matches_csc_reference() {
        use nalgebra_sparse::{coo::CooMatrix, csc::CscMatrix};

        let n = 23;
        let (m, dense) = spd_fixture(n, 5);
        let mut coo = CooMatrix::new(n, n);
        for i in 0..n {
            for j in 0..n {
                if dense[i][j] != 0.0 {
                    coo.push(i, j, dense[i][j]);
                }
            }
        }
        let csc = CscMatrix::from(&coo);

        let mut seed = 3;
        let x = nalgebra::DVector::from_iterator(n, (0..n).map(|_| lcg(&mut seed)));
        let reference = &csc * &x;

        let mut result = vec![0.0; n];
        m.multiply(x.as_slice(), &mut result, false);
        for i in 0..n {
            assert!((result[i] - reference[i]).abs() < 1.0e-12);
        }
    }

    #[test]
    fn dc_term_augments_operator() {
        let n = 8;
        let (m, _) = spd_fixture(n, 11);
        let x = vec![1.0; n];
        let mut plain = vec![0.0; n];
        let mut augmented = vec![0.0; n];
        m.multiply(&x, &mut plain, false);
        m.multiply(&x, &mut augmented, true);
        for i in 0..n {
            // 1ᵀx / n = 1 for the all-ones vector.
            assert!((augmented[i] - plain[i] - 1.0).abs() < 1.0e-12);
        }
    }

    #[test]
    fn cg_solves_spd_system() {
        let n = 60;
        let (m, dense) = spd_fixture(n, 23);
        let mut seed = 7;
        let expected: Vec<Real> = (0..n).map(|_| lcg(&mut seed)).collect();
        let b: Vec<Real> = (0..n)
            .map(|i| (0..n).map(|j| dense[i][j] * expected[j]).sum())
            .collect();

        let mut x = vec![0.0; n];
        let iters = solve(&m, &b, 500, &mut x, 1.0e-10, true, false);
        assert!(iters > 0);
        for i in 0..n {
            assert!((x[i] - expected[i]).abs() < 1.0e-6, "row {i}");
        }
    }

    #[test]
    fn cg_residual_decreases_across_refreshes() {
        let n = 120;
        let (m, _) = spd_fixture(n, 41);
        let mut seed = 13;
        let b: Vec<Real> = (0..n).map(|_| lcg(&mut seed)).collect();

        let residual = |x: &[Real]| {
            let mut ax = vec![0.0; n];
            m.multiply(x, &mut ax, false);
            ax.iter()
                .zip(&b)
                .map(|(a, b)| (b - a) * (b - a))
                .sum::<Real>()
                .sqrt()
        };

        // Run CG in bursts that straddle the refresh interval; the true
        // residual must never grow from one burst to the next.
        let mut x = vec![0.0; n];
        let mut prev = residual(&x);
        for _ in 0..4 {
            solve(&m, &b, 60, &mut x, 0.0, false, false);
            let next = residual(&x);
            assert!(next <= prev + 1.0e-9);
            prev = next;
        }
    }
}
