use special::Gamma;

/// Spherical Bessel function of the first kind j_l(x) for x >= 0.
///
/// Below x = max(l, 1) the power series is summed, above it the upward
/// recurrence from j_0 and j_1 is stable.
pub fn spherical_bessel(l: usize, x: f64) -> f64 {
    if x == 0.0 {
        return if l == 0 { 1.0 } else { 0.0 };
    }

    if x < (l as f64).max(1.0) {
        return spherical_bessel_series(l, x);
    }

    let (sin, cos) = x.sin_cos();
    let j0 = sin / x;
    if l == 0 {
        return j0;
    }
    let mut previous = j0;
    let mut current = sin / (x * x) - cos / x;
    for k in 1..l {
        let next = (2 * k + 1) as f64 / x * current - previous;
        previous = current;
        current = next;
    }
    current
}

/// j_l(x) = x^l sum_s (-x^2/2)^s / (s! (2l + 2s + 1)!!)
fn spherical_bessel_series(l: usize, x: f64) -> f64 {
    let half_x2 = 0.5 * x * x;
    let mut term = x.powi(l as i32) / double_factorial(2 * l + 1);
    let mut sum = term;
    for s in 1..200 {
        term *= -half_x2 / (s as f64 * (2 * l + 2 * s + 1) as f64);
        sum += term;
        if term.abs() < 1e-17 * sum.abs() {
            break;
        }
    }
    sum
}

/// n!! for odd or even n, computed in floating point.
pub fn double_factorial(n: usize) -> f64 {
    let mut result = 1.0;
    let mut k = n;
    while k > 1 {
        result *= k as f64;
        k -= 2;
    }
    result
}

/// j_0(x) - 1, summed as a series at small x where the difference cancels.
pub fn spherical_bessel_0_minus_one(x: f64) -> f64 {
    if x.abs() < 1e-2 {
        let x2 = x * x;
        -x2 / 6.0 * (1.0 - x2 / 20.0 * (1.0 - x2 / 42.0))
    } else {
        x.sin() / x - 1.0
    }
}

/// Fourier transform of a spherical top hat, W(x) = 3 (sin x - x cos x) / x^3.
pub fn top_hat(x: f64) -> f64 {
    if x.abs() < 1e-2 {
        let x2 = x * x;
        1.0 - x2 / 10.0 * (1.0 - x2 / 28.0)
    } else {
        3.0 * (x.sin() - x * x.cos()) / x.powi(3)
    }
}

/// n! through the gamma function.
pub fn factorial(n: usize) -> f64 {
    (n as f64 + 1.0).gamma()
}

/// Cylindrical Bessel function J_0(x), rational approximations accurate to ~1e-8.
pub fn bessel_j0(x: f64) -> f64 {
    let ax = x.abs();
    if ax < 8.0 {
        let y = x * x;
        let numerator = 57568490574.0
            + y * (-13362590354.0
                + y * (651619640.7 + y * (-11214424.18 + y * (77392.33017 + y * (-184.9052456)))));
        let denominator = 57568490411.0
            + y * (1029532985.0 + y * (9494680.718 + y * (59272.64853 + y * (267.8532712 + y))));
        numerator / denominator
    } else {
        let z = 8.0 / ax;
        let y = z * z;
        let xx = ax - 0.785398164;
        let p = 1.0
            + y * (-0.1098628627e-2
                + y * (0.2734510407e-4 + y * (-0.2073370639e-5 + y * 0.2093887211e-6)));
        let q = -0.1562499995e-1
            + y * (0.1430488765e-3
                + y * (-0.6911147651e-5 + y * (0.7621095161e-6 - y * 0.934935152e-7)));
        (0.636619772 / ax).sqrt() * (xx.cos() * p - z * xx.sin() * q)
    }
}

/// Legendre polynomial P_l(x) by the three-term recurrence.
pub fn legendre(l: usize, x: f64) -> f64 {
    match l {
        0 => 1.0,
        1 => x,
        _ => {
            let mut previous = 1.0;
            let mut current = x;
            for k in 1..l {
                let next =
                    ((2 * k + 1) as f64 * x * current - k as f64 * previous) / (k + 1) as f64;
                previous = current;
                current = next;
            }
            current
        }
    }
}

/// Coefficient of P_l in the Legendre expansion of x^m:
/// x^m = sum_l c_{m,l} P_l(x), nonzero only for l <= m with m - l even.
pub fn legendre_coefficient(m: usize, l: usize) -> f64 {
    if l > m || (m - l) % 2 != 0 {
        return 0.0;
    }
    let half = (m - l) / 2;
    (2 * l + 1) as f64 * factorial(m)
        / (2.0_f64.powi(half as i32) * factorial(half) * double_factorial(m + l + 1))
}

/// Powers of i reduced to a real sign, for even exponents only.
/// Returns None when the exponent is odd (purely imaginary).
pub fn i_power_real(exponent: i64) -> Option<f64> {
    match exponent.rem_euclid(4) {
        0 => Some(1.0),
        2 => Some(-1.0),
        _ => None,
    }
}

#[test]
fn test_spherical_bessel_closed_forms() {
    for &x in &[0.01, 0.3, 1.0, 2.5, 7.0, 40.0] {
        let (s, c) = (f64::sin(x), f64::cos(x));
        let j0 = s / x;
        let j1 = s / (x * x) - c / x;
        let j2 = (3.0 / (x * x) - 1.0) * s / x - 3.0 * c / (x * x);
        assert!((spherical_bessel(0, x) - j0).abs() < 1e-12);
        assert!((spherical_bessel(1, x) - j1).abs() < 1e-12);
        // The closed form for j_2 itself cancels badly at small x
        if x > 0.2 {
            assert!((spherical_bessel(2, x) - j2).abs() < 1e-10);
        }
    }
}

#[test]
fn test_spherical_bessel_continuity_at_branch() {
    // The series and recurrence branches must agree where they meet
    for l in 1..8 {
        let x = l as f64;
        let below = spherical_bessel_series(l, x);
        let above = spherical_bessel(l, x * (1.0 + 1e-12));
        assert!((below - above).abs() < 1e-10, "l = {l}: {below} vs {above}");
    }
}

#[test]
fn test_spherical_bessel_small_argument() {
    assert_eq!(spherical_bessel(0, 0.0), 1.0);
    assert_eq!(spherical_bessel(3, 0.0), 0.0);
    let x = 1e-3;
    assert!((spherical_bessel(4, x) / (x.powi(4) / 945.0) - 1.0).abs() < 1e-6);
}

#[test]
fn test_bessel_j0_reference_values() {
    assert!((bessel_j0(0.0) - 1.0).abs() < 1e-8);
    assert!((bessel_j0(1.0) - 0.765_197_686_557_966_6).abs() < 1e-7);
    assert!(bessel_j0(2.404_825_557_695_773).abs() < 1e-7);
    assert!((bessel_j0(10.0) - (-0.245_935_764_451_348_3)).abs() < 1e-7);
}

#[test]
fn test_legendre_values() {
    let x: f64 = 0.3;
    assert_eq!(legendre(0, x), 1.0);
    assert_eq!(legendre(1, x), x);
    assert!((legendre(2, x) - 0.5 * (3.0 * x * x - 1.0)).abs() < 1e-15);
    assert!((legendre(4, x) - (35.0 * x.powi(4) - 30.0 * x * x + 3.0) / 8.0).abs() < 1e-15);
    assert!((legendre(7, 1.0) - 1.0).abs() < 1e-14);
}

#[test]
fn test_legendre_coefficients_reconstruct_powers() {
    for m in 0..=6 {
        for &x in &[-0.7, 0.1, 0.9] {
            let reconstructed: f64 = (0..=m)
                .map(|l| legendre_coefficient(m, l) * legendre(l, x))
                .sum();
            assert!((reconstructed - f64::powi(x, m as i32)).abs() < 1e-13);
        }
    }
    assert!((legendre_coefficient(4, 4) - 8.0 / 35.0).abs() < 1e-15);
    assert!((legendre_coefficient(2, 0) - 1.0 / 3.0).abs() < 1e-15);
}

#[test]
fn test_factorials() {
    assert!((factorial(5) - 120.0).abs() < 1e-9);
    assert_eq!(double_factorial(9), 945.0);
    assert_eq!(double_factorial(0), 1.0);
    assert_eq!(i_power_real(-2), Some(-1.0));
    assert_eq!(i_power_real(4), Some(1.0));
    assert_eq!(i_power_real(3), None);
}

#[test]
fn test_spherical_bessel_0_minus_one_is_continuous() {
    for &x in &[1e-6, 1e-3, 0.5, 3.0] {
        let direct = spherical_bessel(0, x) - 1.0;
        let value = spherical_bessel_0_minus_one(x);
        assert!((value - direct).abs() < 1e-12, "x = {x}");
    }
    // Across the switch to the series
    let below = spherical_bessel_0_minus_one(1e-2 * (1.0 - 1e-12));
    let above = spherical_bessel_0_minus_one(1e-2);
    assert!((below / above - 1.0).abs() < 1e-9);
    assert!((spherical_bessel_0_minus_one(1e-5) / (-1e-10 / 6.0) - 1.0).abs() < 1e-9);
}

#[test]
fn test_top_hat() {
    assert_eq!(top_hat(0.0), 1.0);
    let x: f64 = 2.0;
    let exact = 3.0 * (x.sin() - x * x.cos()) / x.powi(3);
    assert!((top_hat(x) - exact).abs() < 1e-15);
    assert!((top_hat(1e-2 * (1.0 - 1e-12)) - top_hat(1e-2)).abs() < 1e-10);
    // First zero at tan x = x
    assert!(top_hat(4.493_409_457_909_064).abs() < 1e-12);
}
