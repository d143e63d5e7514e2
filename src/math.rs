use itertools::izip;
use multiversion::multiversion;

#[inline]
pub(crate) fn logaddexp(a: f64, b: f64) -> f64 {
    if a == b {
        return a + 2f64.ln();
    }
    let diff = a - b;
    if diff > 0. {
        a + (-diff).exp().ln_1p()
    } else if diff < 0. {
        b + diff.exp().ln_1p()
    } else {
        // diff is NAN
        diff
    }
}

/// `ln(1 + exp(x))` without overflow.
#[inline]
pub(crate) fn softplus(x: f64) -> f64 {
    if x > 0. {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

/// Inverse of `softplus` for positive arguments.
#[inline]
pub(crate) fn softplus_inv(y: f64) -> f64 {
    y + (-(-y).exp_m1()).ln()
}

#[inline]
pub(crate) fn sigmoid(x: f64) -> f64 {
    if x >= 0. {
        1. / (1. + (-x).exp())
    } else {
        let e = x.exp();
        e / (1. + e)
    }
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn vector_dot(a: &[f64], b: &[f64]) -> f64 {
    assert!(a.len() == b.len());
    izip!(a, b).fold(0f64, |acc, (x, y)| x.mul_add(*y, acc))
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn axpy(x: &[f64], y: &mut [f64], a: f64) {
    assert!(x.len() == y.len());
    izip!(x, y).for_each(|(x, y)| {
        *y = a.mul_add(*x, *y);
    });
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn axpy_out(x: &[f64], y: &[f64], a: f64, out: &mut [f64]) {
    assert!(x.len() == y.len());
    assert!(out.len() == y.len());
    izip!(x, y, out).for_each(|(x, y, out)| {
        *out = a.mul_add(*x, *y);
    });
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn multiply(x: &[f64], y: &[f64], out: &mut [f64]) {
    assert!(x.len() == y.len());
    assert!(out.len() == y.len());
    izip!(x, y, out).for_each(|(x, y, out)| {
        *out = x * y;
    });
}

/// Returns `((a + b) . x, (a + b) . y)`.
#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn scalar_prods2(a: &[f64], b: &[f64], x: &[f64], y: &[f64]) -> (f64, f64) {
    let n = a.len();
    assert!(b.len() == n);
    assert!(x.len() == n);
    assert!(y.len() == n);

    izip!(a, b, x, y).fold((0f64, 0f64), |(s1, s2), (a, b, x, y)| {
        (s1 + x * (a + b), s2 + y * (a + b))
    })
}

/// Returns `((a - b + c) . x, (a - b + c) . y)`.
#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn scalar_prods3(
    a: &[f64],
    b: &[f64],
    c: &[f64],
    x: &[f64],
    y: &[f64],
) -> (f64, f64) {
    let n = a.len();
    assert!(b.len() == n);
    assert!(c.len() == n);
    assert!(x.len() == n);
    assert!(y.len() == n);

    izip!(a, b, c, x, y).fold((0f64, 0f64), |(s1, s2), (a, b, c, x, y)| {
        (s1 + x * (a - b + c), s2 + y * (a - b + c))
    })
}

/// Linear-interpolation percentile of sorted values, `q` in `[0, 100]`.
///
/// Matches numpy's default `percentile` method.
pub(crate) fn percentile_sorted(sorted: &[f64], q: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return f64::NAN;
    }
    let rank = (q / 100.) * (n - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi.min(n - 1)] - sorted[lo]) * frac
}

pub(crate) fn sorted(values: impl IntoIterator<Item = f64>) -> Vec<f64> {
    let mut out: Vec<f64> = values.into_iter().collect();
    out.sort_unstable_by(|a, b| a.total_cmp(b));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol * (1. + a.abs().max(b.abs()))
    }

    #[test]
    fn check_logaddexp() {
        let x = 10f64;
        let y = 12f64;
        let expect = (x.exp() + y.exp()).ln();
        assert!(close(logaddexp(x, y), expect, 1e-12));
        assert!(close(logaddexp(3., 3.), 3. + 2f64.ln(), 1e-12));
        assert!(logaddexp(f64::NAN, 1.).is_nan());
    }

    #[test]
    fn softplus_roundtrip() {
        for &y in &[1e-6, 0.01, 0.5, 3., 40.] {
            assert!(close(softplus(softplus_inv(y)), y, 1e-10));
        }
        assert!(softplus(-800.) >= 0.);
        assert!(close(sigmoid(0.), 0.5, 1e-15));
    }

    #[test]
    fn check_axpy() {
        let x = vec![1., 2., 3., 4., 5.];
        let mut y = vec![1., 1., 1., 1., 1.];
        axpy(&x, &mut y, 2.);
        assert_eq!(y, vec![3., 5., 7., 9., 11.]);

        let mut out = vec![0.; 5];
        axpy_out(&x, &y, -1., &mut out);
        assert_eq!(out, vec![2., 3., 4., 5., 6.]);
    }

    #[test]
    fn check_scalar_prods() {
        let a = [1., 2.];
        let b = [0.5, 1.];
        let c = [1., 0.];
        let x = [1., 1.];
        let y = [2., -1.];
        assert_eq!(scalar_prods2(&a, &b, &x, &y), (4.5, 0.));
        assert_eq!(scalar_prods3(&a, &b, &c, &x, &y), (2.5, 2.));
    }

    #[test]
    fn percentile_matches_numpy() {
        let values = sorted([4., 1., 3., 2.]);
        assert_eq!(percentile_sorted(&values, 0.), 1.);
        assert_eq!(percentile_sorted(&values, 100.), 4.);
        assert_eq!(percentile_sorted(&values, 50.), 2.5);
        assert!(close(percentile_sorted(&values, 3.), 1.09, 1e-12));
        assert!(percentile_sorted(&[], 50.).is_nan());
    }

    proptest! {
        #[test]
        fn check_dot(x in prop::collection::vec(-100f64..100f64, 1..50)) {
            let y: Vec<f64> = x.iter().map(|v| v * 0.5).collect();
            let expect: f64 = x.iter().zip(&y).map(|(a, b)| a * b).sum();
            prop_assert!(close(vector_dot(&x, &y), expect, 1e-10));
        }
    }
}
