use crate::Real;
use std::ops::{Add, Div, Mul, Neg, Sub};

/// A dense polynomial of degree at most `N - 1`, stored low-order first.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Polynomial<const N: usize> {
    pub coeffs: [Real; N],
}

impl<const N: usize> Default for Polynomial<N> {
    fn default() -> Self {
        Self { coeffs: [0.0; N] }
    }
}

impl<const N: usize> Polynomial<N> {
    pub fn eval(&self, x: Real) -> Real {
        let mut result = self.coeffs[N - 1];

        for i in (0..N - 1).rev() {
            result = result * x + self.coeffs[i];
        }

        result
    }

    #[must_use]
    pub fn constant(cst: Real) -> Self {
        let mut coeffs = [0.0; N];
        coeffs[0] = cst;
        Self { coeffs }
    }

    #[must_use]
    pub fn quadratic(cst: Real, x: Real, xx: Real) -> Self {
        let mut coeffs = [0.0; N];
        coeffs[0] = cst;
        coeffs[1] = x;
        coeffs[2] = xx;
        Self { coeffs }
    }

    #[must_use]
    pub fn derivative(mut self) -> Self {
        for i in 0..N - 1 {
            self.coeffs[i] = self.coeffs[i + 1] * (i as Real + 1.0);
        }
        self.coeffs[N - 1] = 0.0;
        self
    }

    #[must_use]
    pub fn primitive(mut self) -> Self {
        assert_eq!(
            self.coeffs[N - 1],
            0.0,
            "Integration coefficient overflow. Increase the polynomial degree."
        );
        for i in (1..N).rev() {
            self.coeffs[i] = self.coeffs[i - 1] / (i as Real);
        }
        self.coeffs[0] = 0.0;
        self
    }

    /// The definite integral of this polynomial over `[start, end]`.
    pub fn integrate(&self, start: Real, end: Real) -> Real {
        let primitive = self.primitive();
        primitive.eval(end) - primitive.eval(start)
    }

    // For a polynomial up to degree 2, this computes the polynomial
    // representation of P(X) = P((x - center) / width)
    #[must_use]
    pub fn scale_shift(self, center: Real, width: Real) -> Self {
        for k in 3..N {
            assert_eq!(
                self.coeffs[k], 0.0,
                "Only implemented for polynomials with degrees up to 2."
            );
        }

        let a = self.coeffs[0];
        let b = self.coeffs[1];
        let c = self.coeffs[2];
        let w = width;
        let ww = w * w;

        let mut result = Self::default();
        result.coeffs[0] = a - center * b / w + c * center * center / ww;
        result.coeffs[1] = b / w - 2.0 * c * center / ww;
        result.coeffs[2] = c / ww;
        result
    }

    // For a polynomial up to degree 2, this computes the polynomial
    // representation of P(X) = P(pivot - x), i.e. the reflection about
    // `pivot / 2`.
    #[must_use]
    pub fn reflect(self, pivot: Real) -> Self {
        for k in 3..N {
            assert_eq!(
                self.coeffs[k], 0.0,
                "Only implemented for polynomials with degrees up to 2."
            );
        }

        let a = self.coeffs[0];
        let b = self.coeffs[1];
        let c = self.coeffs[2];

        let mut result = Self::default();
        result.coeffs[0] = a + b * pivot + c * pivot * pivot;
        result.coeffs[1] = -b - 2.0 * c * pivot;
        result.coeffs[2] = c;
        result
    }

    /// Real solutions of `P(x) = value` for polynomials of degree at most 2.
    ///
    /// Degenerate (near-constant) equations yield no roots.
    pub fn solve(&self, value: Real, eps: Real) -> Vec<Real> {
        for k in 3..N {
            assert_eq!(
                self.coeffs[k], 0.0,
                "Only implemented for polynomials with degrees up to 2."
            );
        }

        let c = self.coeffs[0] - value;
        let b = self.coeffs[1];
        let a = self.coeffs[2];

        if a.abs() <= eps {
            if b.abs() <= eps {
                return vec![];
            }
            return vec![-c / b];
        }

        let disc = b * b - 4.0 * a * c;
        if disc < 0.0 {
            return vec![];
        }
        let sq = disc.sqrt();
        vec![(-b - sq) / (2.0 * a), (-b + sq) / (2.0 * a)]
    }
}

impl<const N: usize> Neg for Polynomial<N> {
    type Output = Self;
    fn neg(mut self) -> Self {
        for i in 0..N {
            self.coeffs[i] = -self.coeffs[i];
        }
        self
    }
}

impl<const N: usize> Div<Real> for Polynomial<N> {
    type Output = Self;
    fn div(mut self, rhs: Real) -> Self {
        for i in 0..N {
            self.coeffs[i] /= rhs;
        }
        self
    }
}

impl<const N: usize> Mul<Real> for Polynomial<N> {
    type Output = Self;
    fn mul(mut self, rhs: Real) -> Self {
        for i in 0..N {
            self.coeffs[i] *= rhs;
        }
        self
    }
}

impl<const N: usize> Mul<Polynomial<N>> for Polynomial<N> {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        let mut result = Self::default();
        for i in 0..N {
            for j in 0..N {
                let val = self.coeffs[i] * rhs.coeffs[j];
                if j + i >= N {
                    assert_eq!(
                        val, 0.0,
                        "The result of the product must have a degree smaller than N"
                    );
                } else {
                    result.coeffs[j + i] += val;
                }
            }
        }
        result
    }
}

impl<const N: usize> Add<Polynomial<N>> for Polynomial<N> {
    type Output = Self;
    fn add(mut self, rhs: Self) -> Self {
        for i in 0..N {
            self.coeffs[i] += rhs.coeffs[i];
        }
        self
    }
}

impl<const N: usize> Sub<Polynomial<N>> for Polynomial<N> {
    type Output = Self;
    fn sub(mut self, rhs: Self) -> Self {
        for i in 0..N {
            self.coeffs[i] -= rhs.coeffs[i];
        }
        self
    }
}

#[cfg(test)]
mod test {
    use crate::polynomial::Polynomial;

    #[test]
    fn poly_eval() {
        let poly = Polynomial {
            coeffs: [1.0, 2.0, 3.0, 4.0, 5.0],
        };
        assert_eq!(
            poly.eval(2.0),
            1.0 + 2.0 * 2.0 + 3.0 * 4.0 + 4.0 * 8.0 + 5.0 * 16.0
        );
    }

    #[test]
    fn poly_mul() {
        let poly1 = Polynomial {
            coeffs: [1.0, 2.0, 3.0, 0.0, 0.0],
        };
        let poly2 = Polynomial {
            coeffs: [10.0, 20.0, 30.0, 0.0, 0.0],
        };
        let expected = Polynomial {
            coeffs: [10.0, 40.0, 100.0, 120.0, 90.0],
        };
        assert_eq!(poly1 * poly2, expected);
    }

    #[test]
    fn poly_diff() {
        let poly = Polynomial {
            coeffs: [1.0, 2.0, 3.0, 4.0, 5.0],
        };
        let expected = Polynomial {
            coeffs: [2.0, 6.0, 12.0, 20.0, 0.0],
        };
        assert_eq!(poly.derivative(), expected);
    }

    #[test]
    fn poly_primitive() {
        let poly = Polynomial {
            coeffs: [1.0, 2.0, 3.0, 4.0, 0.0],
        };
        let expected = Polynomial {
            coeffs: [0.0, 1.0, 1.0, 1.0, 1.0],
        };
        assert_eq!(poly.primitive(), expected);
        assert_eq!(poly.primitive().derivative(), poly);
    }

    #[test]
    fn scale_shift() {
        let shift = 0.5;
        let width = 2.5;
        let poly = Polynomial {
            coeffs: [10.0, 20.0, 30.0, 0.0, 0.0],
        };
        let poly_scale_shifted = poly.scale_shift(shift, width);
        assert_eq!(
            poly.eval((11.0 - shift) / width),
            poly_scale_shifted.eval(11.0)
        );
        assert_eq!(poly.eval(0.0), poly_scale_shifted.eval(shift));
        assert!((poly.eval(-shift / width) - poly_scale_shifted.eval(0.0)).abs() < 1.0e-8);
    }

    #[test]
    fn reflect() {
        let poly = Polynomial::<4>::quadratic(1.0, -3.0, 2.0);
        let reflected = poly.reflect(2.0);
        for i in 0..10 {
            let x = i as f64 * 0.3 - 1.0;
            assert!((reflected.eval(x) - poly.eval(2.0 - x)).abs() < 1.0e-12);
        }
    }

    #[test]
    fn solve_quadratic() {
        // (x - 1)(x - 3) = x^2 - 4x + 3
        let poly = Polynomial::<3>::quadratic(3.0, -4.0, 1.0);
        let roots = poly.solve(0.0, 1.0e-12);
        assert_eq!(roots.len(), 2);
        assert!((roots[0] - 1.0).abs() < 1.0e-12);
        assert!((roots[1] - 3.0).abs() < 1.0e-12);

        let linear = Polynomial::<3>::quadratic(1.0, 2.0, 0.0);
        let roots = linear.solve(0.0, 1.0e-12);
        assert_eq!(roots, vec![-0.5]);

        assert!(Polynomial::<3>::constant(4.0).solve(0.0, 1.0e-12).is_empty());
    }
}
