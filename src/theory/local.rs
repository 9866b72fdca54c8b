use super::derivatives::{directional, RadialDerivatives};
use super::{dot, sub_scaled, Kernel, PairGeometry, TheoryContext};
use crate::error::Result;
use crate::utils::special::{i_power_real, legendre, legendre_coefficient};

/// Correlation of two local terms in the flat-sky approximation, both
/// evaluated at the mean redshift:
///
/// xi = A_X A_Y sum_l i^(p_X - p_Y - l) c_{p_X + p_Y, l} P_l(mu) I_l^(q_X + q_Y)(r)
///
/// where c_{m,l} are the Legendre coefficients of mu^m.
pub fn flat_sky(context: &TheoryContext, x: &Kernel, y: &Kernel, r: f64, mu: f64) -> Result<f64> {
    let m = x.p + y.p;
    let n = x.q + y.q;

    let mut value = 0.0;
    for l in (m % 2..=m).step_by(2) {
        let exponent = x.p as i64 - y.p as i64 - l as i64;
        // m - l is even, so the phase is always real
        let phase = i_power_real(exponent).unwrap_or(0.0);
        value += phase * legendre_coefficient(m, l) * legendre(l, mu) * context.integral(l, n, r)?;
    }

    Ok(x.amplitude * y.amplitude * value)
}

/// Correlation of two local terms in full sky. Each kernel must be evaluated
/// at the position of its own galaxy.
///
/// xi = A_X A_Y (-1)^p_Y (n1.grad)^p_X (n2.grad)^p_Y I_0^N(|x1 - x2|)
/// with N = p_X + q_X + p_Y + q_Y.
pub fn full_sky(
    context: &TheoryContext,
    x: &Kernel,
    y: &Kernel,
    geometry: &PairGeometry,
) -> Result<f64> {
    let total = x.p + x.q + y.p + y.q;
    let separation = sub_scaled(&geometry.x1, 1.0, &geometry.x2);
    let r = geometry.r;

    let mut g: RadialDerivatives = [0.0; 5];
    for (m, value) in g.iter_mut().enumerate().take(x.p + y.p + 1) {
        let sign = if m % 2 == 0 { 1.0 } else { -1.0 };
        *value = sign * context.integral(m, total - m, r)? / r.powi(m as i32);
    }

    let sign = if y.p % 2 == 0 { 1.0 } else { -1.0 };
    let derivative = directional(
        x.p,
        y.p,
        dot(&geometry.n1, &separation),
        dot(&geometry.n2, &separation),
        dot(&geometry.n1, &geometry.n2),
        &g,
    );

    Ok(x.amplitude * y.amplitude * sign * derivative)
}
