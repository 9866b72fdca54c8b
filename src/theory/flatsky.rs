use super::lensing::line_of_sight;
use super::{Kernel, TheoryContext, TracerState};
use crate::error::Result;

/// Lensing efficiency of a source at chi_s,
///
/// W(lambda; chi_s) = (3/2) Omega_m0 H0^2 (1 + z) D lambda (chi_s - lambda) / chi_s
///
/// such that the convergence is int dlambda W delta_0.
pub fn lensing_efficiency(context: &TheoryContext, lambda: f64, source_chi: f64) -> Result<f64> {
    if !(lambda > 0.0 && lambda < source_chi) {
        return Ok(0.0);
    }
    Ok(-context.potential_at_distance(lambda)? * lambda * (source_chi - lambda) / source_chi)
}

/// Local x lensing in the Limber approximation. Only the part of the
/// lensing line of sight at the distance of the local galaxy contributes:
///
/// -(2 - 5s) A_X W(chi_l; chi_s) H_q(r_perp)
///
/// which vanishes for a local galaxy behind the source and for terms with
/// radial derivatives (p > 0).
pub fn local_lensing(
    context: &TheoryContext,
    local: &Kernel,
    local_state: &TracerState,
    source: &TracerState,
    r_perp: f64,
) -> Result<f64> {
    if local.p > 0 || local_state.chi >= source.chi {
        return Ok(0.0);
    }
    let s = source.magnification_bias;
    let efficiency = lensing_efficiency(context, local_state.chi, source.chi)?;
    Ok(-(2.0 - 5.0 * s) * local.amplitude * efficiency * context.hankel(local.q, r_perp)?)
}

/// Lensing x lensing in the Limber approximation:
///
/// (2 - 5s_1)(2 - 5s_2) int_0^min(chi_1, chi_2) dlambda W_1 W_2 H_0(r_perp lambda / chi_mean)
pub fn lensing_lensing(
    context: &TheoryContext,
    first: &TracerState,
    second: &TracerState,
    r_perp: f64,
    chi_mean: f64,
) -> Result<f64> {
    let upper = first.chi.min(second.chi);
    let integrand = |lambda: f64| -> Result<f64> {
        let w1 = lensing_efficiency(context, lambda, first.chi)?;
        let w2 = lensing_efficiency(context, lambda, second.chi)?;
        Ok(w1 * w2 * context.hankel(0, r_perp * lambda / chi_mean)?)
    };
    let integral = line_of_sight(
        integrand,
        0.0,
        upper,
        context.parameters.numerics.lensing_tolerance,
        "flat-sky lensing x lensing",
    )?;

    let (s1, s2) = (first.magnification_bias, second.magnification_bias);
    Ok((2.0 - 5.0 * s1) * (2.0 - 5.0 * s2) * integral)
}
