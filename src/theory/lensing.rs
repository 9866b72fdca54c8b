use super::derivatives::{directional, laplacian, RadialDerivatives};
use super::{dot, norm, sub_scaled, Kernel, TheoryContext, TracerState, Vector};
use crate::error::{Error, Result};
use crate::utils::gauss::GaussLegendre;
use log::warn;
use quadrature::double_exponential;
use std::cell::RefCell;

/// An integration is reported as failed when its error estimate exceeds the
/// target by more than this factor.
const FAILURE_FACTOR: f64 = 100.0;

/// Integrates a fallible function over [a, b] with the tanh-sinh rule, to a
/// relative accuracy first measured against an 8-point Gauss-Legendre estimate.
///
/// Errors of the integrand are propagated, a quadrature that does not reach
/// its target gives NaN.
pub fn line_of_sight<F>(f: F, a: f64, b: f64, rel_tol: f64, what: &str) -> Result<f64>
where
    F: Fn(f64) -> Result<f64>,
{
    if !(b > a) {
        return Ok(0.0);
    }

    let coarse = GaussLegendre::get(8).try_integrate(a, b, &f)?;
    if !coarse.is_finite() {
        return Ok(f64::NAN);
    }
    let target = (rel_tol * coarse.abs()).max(f64::MIN_POSITIVE);

    let failure: RefCell<Option<Error>> = RefCell::new(None);
    let output = double_exponential::integrate(
        |x| match f(x) {
            Ok(value) => value,
            Err(error) => {
                failure.borrow_mut().get_or_insert(error);
                0.0
            }
        },
        a,
        b,
        target,
    );
    if let Some(error) = failure.into_inner() {
        return Err(error);
    }

    // The coarse estimate can miss narrow features, so judge against the result too
    let achieved = target.max(rel_tol * output.integral.abs());
    if !(output.error_estimate <= FAILURE_FACTOR * achieved) || !output.integral.is_finite() {
        warn!(
            "Line of sight integral of {what} did not converge \
             (error {:e}, target {:e}), using NaN",
            output.error_estimate, target
        );
        return Ok(f64::NAN);
    }
    Ok(output.integral)
}

/// `line_of_sight` over [a, b], split at the point where the integrand
/// peaks so that the quadrature nodes cluster around it.
pub fn split_line_of_sight<F>(
    f: F,
    a: f64,
    split: f64,
    b: f64,
    rel_tol: f64,
    what: &str,
) -> Result<f64>
where
    F: Fn(f64) -> Result<f64>,
{
    if !(split > a && split < b) {
        return line_of_sight(f, a, b, rel_tol, what);
    }
    Ok(line_of_sight(&f, a, split, rel_tol, what)? + line_of_sight(&f, split, b, rel_tol, what)?)
}

/// Correlation of a local term with the lensing convergence of another
/// galaxy, in full sky:
///
/// -(2 - 5s)/(2 chi_s) int_0^chi_s dlambda (chi_s - lambda)/lambda 2 Phi_A(lambda) A_X lap_Omega F
///
/// with F = (n_l.grad)^p I_0^N(|x_l - lambda n_s|), N = p + q + 2, and the
/// angular Laplacian lap_Omega F = lambda^2 (lap - (n_s.grad)^2) F + 2 lambda n_s.grad F.
pub fn local_lensing(
    context: &TheoryContext,
    local: &Kernel,
    local_position: &Vector,
    local_direction: &Vector,
    source: &TracerState,
    source_direction: &Vector,
) -> Result<f64> {
    let p = local.p;
    let total = p + local.q + 2;
    let c = dot(local_direction, source_direction);

    let integrand = |lambda: f64| -> Result<f64> {
        let separation = sub_scaled(local_position, lambda, source_direction);
        let r = norm(&separation);
        let r2 = r * r;

        let mut g: RadialDerivatives = [0.0; 5];
        for (m, value) in g.iter_mut().enumerate().take(p + 3).skip(1) {
            let sign = if m % 2 == 0 { 1.0 } else { -1.0 };
            *value = sign * context.reduced_integral(m, total - m, r)?;
        }

        let a = dot(local_direction, &separation);
        let b = dot(source_direction, &separation);
        let angular = lambda * (laplacian(p, a, r2, &g) - directional(p, 2, a, b, c, &g))
            + 2.0 * directional(p, 1, a, b, c, &g);

        Ok(2.0 * context.potential_at_distance(lambda)? * (source.chi - lambda) * angular)
    };

    // Closest approach of the line of sight to the local galaxy
    let closest = dot(local_position, source_direction);
    let integral = split_line_of_sight(
        integrand,
        0.0,
        closest,
        source.chi,
        context.parameters.numerics.lensing_tolerance,
        "local x lensing",
    )?;

    let s = source.magnification_bias;
    Ok(-(2.0 - 5.0 * s) / (2.0 * source.chi) * local.amplitude * integral)
}

/// Lensing x lensing in full sky. With x = n1.n2 the two angular Laplacians
/// act on g(x) = I_0^4(R), R^2 = lambda1^2 + lambda2^2 - 2 lambda1 lambda2 x:
///
/// L^2 g = (1 - x^2)^2 g'''' - 8x(1 - x^2) g''' + (14x^2 - 6) g'' + 4x g'
///
/// where g^(m) = (lambda1 lambda2)^m R^-m I_m^(4 - m)(R).
pub fn lensing_lensing(
    context: &TheoryContext,
    first: &TracerState,
    first_direction: &Vector,
    second: &TracerState,
    second_direction: &Vector,
) -> Result<f64> {
    let x = dot(first_direction, second_direction).clamp(-1.0, 1.0);
    let one_minus = 1.0 - x * x;
    // Coefficients of g', g'', g''', g''''
    let coefficients = [
        4.0 * x,
        14.0 * x * x - 6.0,
        -8.0 * x * one_minus,
        one_minus * one_minus,
    ];
    let rel_tol = context.parameters.numerics.lensing_tolerance;

    let outer = |lambda1: f64| -> Result<f64> {
        let potential1 = context.potential_at_distance(lambda1)?;
        let inner = |lambda2: f64| -> Result<f64> {
            let product = lambda1 * lambda2;
            let r = (lambda1 * lambda1 + lambda2 * lambda2 - 2.0 * product * x)
                .max(0.0)
                .sqrt();

            // L^2 g / (lambda1 lambda2)
            let mut operator = 0.0;
            let mut power = 1.0;
            for (m, coefficient) in (1..=4).zip(coefficients) {
                operator += coefficient * power * context.reduced_integral(m, 4 - m, r)?;
                power *= product;
            }

            Ok((second.chi - lambda2) * context.potential_at_distance(lambda2)? * operator)
        };
        let what = "lensing x lensing";
        let integral = split_line_of_sight(inner, 0.0, lambda1 * x, second.chi, rel_tol, what)?;
        Ok((first.chi - lambda1) * potential1 * integral)
    };

    let integral = line_of_sight(outer, 0.0, first.chi, rel_tol, "lensing x lensing")?;

    let (s1, s2) = (first.magnification_bias, second.magnification_bias);
    Ok((2.0 - 5.0 * s1) * (2.0 - 5.0 * s2) / (first.chi * second.chi) * integral)
}

#[test]
fn test_line_of_sight_polynomial_and_errors() {
    let value = line_of_sight(|x| Ok(3.0 * x * x), 0.0, 2.0, 1e-10, "test").unwrap();
    assert!((value - 8.0).abs() < 1e-9);

    let value = line_of_sight(|x: f64| Ok(x.sqrt()), 0.0, 1.0, 1e-8, "test").unwrap();
    assert!((value - 2.0 / 3.0).abs() < 1e-7);

    let failed = line_of_sight(
        |x| {
            if x > 0.5 {
                Err(Error::InvalidInput(String::from("beyond")))
            } else {
                Ok(1.0)
            }
        },
        0.0,
        1.0,
        1e-6,
        "test",
    );
    assert!(matches!(failed, Err(Error::InvalidInput(_))));

    assert_eq!(line_of_sight(|_| Ok(1.0), 1.0, 1.0, 1e-6, "test").unwrap(), 0.0);
}

#[test]
fn test_split_line_of_sight_resolves_narrow_peaks() {
    // Lorentzian of width 1e-3 centred at 0.3 on [0, 1]
    let width: f64 = 1e-3;
    let peak = |x: f64| Ok(width / ((x - 0.3).powi(2) + width * width));
    let exact = (0.7 / width).atan() + (0.3 / width).atan();
    let value = split_line_of_sight(peak, 0.0, 0.3, 1.0, 1e-6, "test").unwrap();
    assert!((value / exact - 1.0).abs() < 1e-5, "{value} vs {exact}");
}
