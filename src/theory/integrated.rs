use super::derivatives::{directional, RadialDerivatives};
use super::lensing::{line_of_sight, local_lensing, split_line_of_sight};
use super::{dot, norm, sub_scaled, Integrated, Kernel, TheoryContext, TracerState, Vector};
use crate::error::Result;

/// The potential itself as a local kernel, Phi_A delta_0 / k^2 with unit amplitude.
const POTENTIAL: Kernel = Kernel {
    amplitude: 1.0,
    p: 0,
    q: 2,
};

fn along(direction: &Vector, distance: f64) -> Vector {
    [
        distance * direction[0],
        distance * direction[1],
        distance * direction[2],
    ]
}

/// Correlation of a local term with an integrated potential:
///
/// P int_0^chi dlambda w(lambda) A_X (n_l.grad)^p I_0^N(|x_l - lambda n|)
///
/// with N = p + q + 2. The result does not depend on which population
/// carries which term.
pub fn local_integrated(
    context: &TheoryContext,
    local: &Kernel,
    local_position: &Vector,
    local_direction: &Vector,
    integrated: &Integrated,
    chi: f64,
    direction: &Vector,
) -> Result<f64> {
    let p = local.p;
    let total = p + local.q + 2;
    let c = dot(local_direction, direction);

    let integrand = |lambda: f64| -> Result<f64> {
        let separation = sub_scaled(local_position, lambda, direction);
        let r = norm(&separation);

        let mut g: RadialDerivatives = [0.0; 5];
        for (m, value) in g.iter_mut().enumerate().take(p + 1) {
            let sign = if m % 2 == 0 { 1.0 } else { -1.0 };
            *value = sign * context.reduced_integral(m, total - m, r)?;
        }

        let a = dot(local_direction, &separation);
        let b = dot(direction, &separation);
        let weight = context.integrated_weight(integrated, lambda)?;
        Ok(weight * directional(p, 0, a, b, c, &g))
    };

    let closest = dot(local_position, direction);
    let integral = split_line_of_sight(
        integrand,
        0.0,
        closest,
        chi,
        context.parameters.numerics.lensing_tolerance,
        "local x integrated",
    )?;

    Ok(local.amplitude * integrated.amplitude * integral)
}

/// Two integrated potentials, P1 P2 int int w1 w2 I_0^4(|lambda1 n1 - lambda2 n2|)
/// with the renormalized I_0^4.
pub fn integrated_integrated(
    context: &TheoryContext,
    first: &Integrated,
    first_chi: f64,
    first_direction: &Vector,
    second: &Integrated,
    second_chi: f64,
    second_direction: &Vector,
) -> Result<f64> {
    let x = dot(first_direction, second_direction).clamp(-1.0, 1.0);
    let rel_tol = context.parameters.numerics.lensing_tolerance;

    let outer = |lambda1: f64| -> Result<f64> {
        let weight = context.integrated_weight(first, lambda1)?;
        let inner = |lambda2: f64| -> Result<f64> {
            let r = (lambda1 * lambda1 + lambda2 * lambda2 - 2.0 * lambda1 * lambda2 * x)
                .max(0.0)
                .sqrt();
            Ok(context.integrated_weight(second, lambda2)? * context.reduced_integral(0, 4, r)?)
        };
        let what = "integrated x integrated";
        let integral = split_line_of_sight(inner, 0.0, lambda1 * x, second_chi, rel_tol, what)?;
        Ok(weight * integral)
    };

    let integral = line_of_sight(outer, 0.0, first_chi, rel_tol, "integrated x integrated")?;
    Ok(first.amplitude * second.amplitude * integral)
}

/// An integrated potential against the lensing convergence of another
/// galaxy: the potential at each point of the first line of sight is
/// correlated with the lensing as a local term would be.
pub fn integrated_lensing(
    context: &TheoryContext,
    integrated: &Integrated,
    chi: f64,
    direction: &Vector,
    source: &TracerState,
    source_direction: &Vector,
) -> Result<f64> {
    let integrand = |lambda: f64| -> Result<f64> {
        let position = along(direction, lambda);
        let weight = context.integrated_weight(integrated, lambda)?;
        Ok(weight
            * local_lensing(context, &POTENTIAL, &position, direction, source, source_direction)?)
    };

    let rel_tol = context.parameters.numerics.lensing_tolerance;
    let integral = line_of_sight(integrand, 0.0, chi, rel_tol, "integrated x lensing")?;
    Ok(integrated.amplitude * integral)
}

#[test]
fn test_along() {
    let direction = [0.6, 0.0, 0.8];
    let point = along(&direction, 5.0);
    assert!((norm(&point) - 5.0).abs() < 1e-14);
    assert!((dot(&point, &direction) - 5.0).abs() < 1e-14);
}
