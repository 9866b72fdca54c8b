use crate::error::{Error, Result};
use crate::parameters::{Contribution, Support};
use crate::theory::{
    flatsky, integrated, lensing, local, Integrated, Kernel, PairGeometry, TheoryContext,
    TracerState,
};
use itertools::iproduct;
use log::info;
use rayon::prelude::*;
use serde_derive::{Deserialize, Serialize};
use std::time::Instant;

/// One value of the correlation function.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorrelationResult {
    pub r: f64,
    pub mu: f64,
    pub z: f64,
    pub value: f64,
}

/// Sums the enabled contributions of the two tracers into xi(r, mu, z).
#[derive(Clone, Copy)]
pub struct CorrelationFunctionAssembler<'a> {
    context: TheoryContext<'a>,
}

impl<'a> CorrelationFunctionAssembler<'a> {
    pub fn new(context: TheoryContext<'a>) -> Self {
        CorrelationFunctionAssembler { context }
    }

    pub fn context(&self) -> &TheoryContext<'a> {
        &self.context
    }

    /// xi(r, mu, z) for the pair of populations of the parameters, the first
    /// one at the near end of the separation when mu > 0.
    pub fn correlation(&self, r: f64, mu: f64, z: f64) -> Result<f64> {
        let parameters = self.context.parameters;
        if parameters.contributions.is_empty() {
            return Err(Error::NoContributions);
        }
        if !(r > 0.0) || !r.is_finite() {
            return Err(Error::InvalidInput(format!("separation must be positive, got {r}")));
        }
        if !(-1.0..=1.0).contains(&mu) {
            return Err(Error::InvalidInput(format!("mu must lie in [-1, 1], got {mu}")));
        }

        let chi_mean = self.context.background.comoving_distance(z)?;
        let geometry = PairGeometry::new(chi_mean, r, mu)?;

        let mut value = 0.0;
        for &first in &parameters.contributions {
            for &second in &parameters.contributions {
                if parameters.only_cross_correlations && first == second {
                    continue;
                }
                value += self.term(first, second, z, &geometry)?;
            }
        }
        Ok(value)
    }

    /// Correlation of contribution `first` of the first population with
    /// contribution `second` of the second one.
    fn term(
        &self,
        first: Contribution,
        second: Contribution,
        z: f64,
        geometry: &PairGeometry,
    ) -> Result<f64> {
        let context = &self.context;
        let flatsky = &context.parameters.flatsky;
        let [a, b] = context.parameters.correlation_populations;
        let (x1, x2, n1, n2) = (&geometry.x1, &geometry.x2, &geometry.n1, &geometry.n2);

        match (first.support(), second.support()) {
            (Support::Local, Support::Local) if flatsky.local => {
                let x = local_kernel(&context.tracer(a, z)?, first)?;
                let y = local_kernel(&context.tracer(b, z)?, second)?;
                local::flat_sky(context, &x, &y, geometry.r, geometry.mu)
            }
            (Support::Local, Support::Local) => {
                let x = local_kernel(&context.tracer_at_distance(a, geometry.chi1)?, first)?;
                let y = local_kernel(&context.tracer_at_distance(b, geometry.chi2)?, second)?;
                local::full_sky(context, &x, &y, geometry)
            }
            (Support::Local, Support::Lensing) if flatsky.local_nonlocal => {
                let limber = LimberGeometry::new(geometry)?;
                let state = context.tracer_at_distance(a, limber.chi1)?;
                let source = context.tracer_at_distance(b, limber.chi2)?;
                let kernel = local_kernel(&state, first)?;
                flatsky::local_lensing(context, &kernel, &state, &source, limber.r_perp)
            }
            (Support::Local, Support::Lensing) => {
                let state = context.tracer_at_distance(a, geometry.chi1)?;
                let source = context.tracer_at_distance(b, geometry.chi2)?;
                let kernel = local_kernel(&state, first)?;
                lensing::local_lensing(context, &kernel, x1, n1, &source, n2)
            }
            (Support::Lensing, Support::Local) if flatsky.local_nonlocal => {
                let limber = LimberGeometry::new(geometry)?;
                let source = context.tracer_at_distance(a, limber.chi1)?;
                let state = context.tracer_at_distance(b, limber.chi2)?;
                let kernel = local_kernel(&state, second)?;
                flatsky::local_lensing(context, &kernel, &state, &source, limber.r_perp)
            }
            (Support::Lensing, Support::Local) => {
                let source = context.tracer_at_distance(a, geometry.chi1)?;
                let state = context.tracer_at_distance(b, geometry.chi2)?;
                let kernel = local_kernel(&state, second)?;
                lensing::local_lensing(context, &kernel, x2, n2, &source, n1)
            }
            (Support::Lensing, Support::Lensing) if flatsky.nonlocal => {
                let limber = LimberGeometry::new(geometry)?;
                let first = context.tracer_at_distance(a, limber.chi1)?;
                let second = context.tracer_at_distance(b, limber.chi2)?;
                flatsky::lensing_lensing(context, &first, &second, limber.r_perp, geometry.chi_mean)
            }
            (Support::Lensing, Support::Lensing) => {
                let first = context.tracer_at_distance(a, geometry.chi1)?;
                let second = context.tracer_at_distance(b, geometry.chi2)?;
                lensing::lensing_lensing(context, &first, n1, &second, n2)
            }
            (Support::Local, Support::Integrated) => {
                let state = context.tracer_at_distance(a, geometry.chi1)?;
                let source = context.tracer_at_distance(b, geometry.chi2)?;
                let kernel = local_kernel(&state, first)?;
                let potential = integrated_kernel(&source, second)?;
                integrated::local_integrated(context, &kernel, x1, n1, &potential, source.chi, n2)
            }
            (Support::Integrated, Support::Local) => {
                let source = context.tracer_at_distance(a, geometry.chi1)?;
                let state = context.tracer_at_distance(b, geometry.chi2)?;
                let kernel = local_kernel(&state, second)?;
                let potential = integrated_kernel(&source, first)?;
                integrated::local_integrated(context, &kernel, x2, n2, &potential, source.chi, n1)
            }
            (Support::Integrated, Support::Integrated) => {
                let (chi1, chi2) = (geometry.chi1, geometry.chi2);
                let x = integrated_kernel(&context.tracer_at_distance(a, chi1)?, first)?;
                let y = integrated_kernel(&context.tracer_at_distance(b, chi2)?, second)?;
                integrated::integrated_integrated(context, &x, chi1, n1, &y, chi2, n2)
            }
            (Support::Integrated, Support::Lensing) => {
                let state = context.tracer_at_distance(a, geometry.chi1)?;
                let source = context.tracer_at_distance(b, geometry.chi2)?;
                let potential = integrated_kernel(&state, first)?;
                integrated::integrated_lensing(context, &potential, state.chi, n1, &source, n2)
            }
            (Support::Lensing, Support::Integrated) => {
                let source = context.tracer_at_distance(a, geometry.chi1)?;
                let state = context.tracer_at_distance(b, geometry.chi2)?;
                let potential = integrated_kernel(&state, second)?;
                integrated::integrated_lensing(context, &potential, state.chi, n2, &source, n1)
            }
        }
    }

    /// xi over the z_mean x separations x mu grid of the parameters, in that
    /// order with mu running fastest.
    pub fn compute_bulk(&self) -> Result<Vec<CorrelationResult>> {
        let parameters = self.context.parameters;
        if parameters.contributions.is_empty() {
            return Err(Error::NoContributions);
        }
        check_grid("redshift", &parameters.z_mean)?;
        check_grid("separation", &parameters.separations)?;
        check_grid("mu", &parameters.mu)?;

        let start = Instant::now();
        let points: Vec<(f64, f64, f64)> =
            iproduct!(&parameters.z_mean, &parameters.separations, &parameters.mu)
                .map(|(&z, &r, &mu)| (z, r, mu))
                .collect();

        let results = points
            .par_iter()
            .map(|&(z, r, mu)| {
                Ok(CorrelationResult {
                    r,
                    mu,
                    z,
                    value: self.correlation(r, mu, z)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            "Computed {} correlation function values in {:?}",
            results.len(),
            start.elapsed()
        );
        Ok(results)
    }
}

pub(crate) fn check_grid(name: &'static str, grid: &[impl Copy]) -> Result<()> {
    if grid.is_empty() {
        return Err(Error::EmptyGrid(name));
    }
    Ok(())
}

fn local_kernel(state: &TracerState, contribution: Contribution) -> Result<Kernel> {
    state.kernel(contribution)?.ok_or_else(|| {
        Error::InvalidInput(format!("{} is not a local contribution", contribution.tag()))
    })
}

fn integrated_kernel(state: &TracerState, contribution: Contribution) -> Result<Integrated> {
    state.integrated(contribution)?.ok_or_else(|| {
        Error::InvalidInput(format!("{} is not an integrated contribution", contribution.tag()))
    })
}

/// Radial distances and transverse separation of a pair in the plane-parallel limit.
struct LimberGeometry {
    chi1: f64,
    chi2: f64,
    r_perp: f64,
}

impl LimberGeometry {
    fn new(geometry: &PairGeometry) -> Result<Self> {
        let (r, mu) = (geometry.r, geometry.mu);
        let chi1 = geometry.chi_mean - 0.5 * r * mu;
        let chi2 = geometry.chi_mean + 0.5 * r * mu;
        if !(chi1 > 0.0 && chi2 > 0.0) {
            return Err(Error::InvalidInput(format!(
                "a separation of {r} at mu = {mu} puts a galaxy at the observer"
            )));
        }
        Ok(LimberGeometry {
            chi1,
            chi2,
            r_perp: r * (1.0 - mu * mu).max(0.0).sqrt(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CorrelationEngine;
    use crate::parameters::Parameters;
    use crate::spectrum::PowerSpectrumTable;
    use crate::transfer::NoWiggleSpectrum;
    use crate::utils::special::legendre;

    fn engine(parameters: Parameters) -> CorrelationEngine {
        let spectrum = NoWiggleSpectrum::new(&parameters, 0.8, 0.96)
            .unwrap()
            .table(1e-4, 5.0, 512)
            .unwrap();
        CorrelationEngine::new(parameters, spectrum).unwrap()
    }

    #[test]
    fn test_density_and_rsd_match_kaiser() {
        let engine = engine(Parameters::default());
        let background = engine.background().unwrap();
        let z = 1.0;
        let d = background.growth_factor(z).unwrap();
        let f = background.growth_rate(z).unwrap();
        let b = 1.0;

        for &r in &[10.0, 80.0] {
            let i0 = engine.integral(0, 0, r).unwrap();
            let i2 = engine.integral(2, 0, r).unwrap();
            let i4 = engine.integral(4, 0, r).unwrap();
            for &mu in &[0.0, 0.3, 0.9] {
                let expected = d
                    * d
                    * ((b * b + 2.0 * b * f / 3.0 + f * f / 5.0) * i0
                        - (4.0 * b * f / 3.0 + 4.0 * f * f / 7.0) * legendre(2, mu) * i2
                        + 8.0 * f * f / 35.0 * legendre(4, mu) * i4);
                let value = engine.correlation(r, mu, z).unwrap();
                assert!(
                    (value - expected).abs() <= 1e-10 * expected.abs() + 1e-14,
                    "r = {r}, mu = {mu}: {value} vs {expected}"
                );
            }
        }
    }

    #[test]
    fn test_only_cross_correlations_drops_auto_terms() {
        let mut parameters = Parameters::default();
        parameters.only_cross_correlations = true;
        let cross = engine(parameters);
        let full = engine(Parameters::default());

        let mut parameters = Parameters::default();
        parameters.contributions = [Contribution::Density].into_iter().collect();
        let density = engine(parameters);
        let mut parameters = Parameters::default();
        parameters.contributions = [Contribution::Rsd].into_iter().collect();
        let rsd = engine(parameters);

        let (r, mu, z) = (30.0, 0.4, 0.8);
        let expected = full.correlation(r, mu, z).unwrap()
            - density.correlation(r, mu, z).unwrap()
            - rsd.correlation(r, mu, z).unwrap();
        let value = cross.correlation(r, mu, z).unwrap();
        assert!((value - expected).abs() < 1e-10 * expected.abs());
    }

    #[test]
    fn test_full_sky_agrees_with_flat_sky_at_small_separations() {
        let flat = engine(Parameters::default());
        let mut parameters = Parameters::default();
        parameters.flatsky.local = false;
        let full = engine(parameters);

        for &mu in &[0.0, 0.3, 0.7] {
            let a = flat.correlation(20.0, mu, 1.0).unwrap();
            let b = full.correlation(20.0, mu, 1.0).unwrap();
            assert!((a / b - 1.0).abs() < 5e-3, "mu = {mu}: {a} vs {b}");
        }
    }

    #[test]
    fn test_correlation_errors() {
        let mut parameters = Parameters::default();
        parameters.contributions.clear();
        let empty = engine(parameters);
        assert!(matches!(empty.correlation(10.0, 0.1, 1.0), Err(Error::NoContributions)));
        assert!(matches!(empty.compute_corrfunc_bulk(), Err(Error::NoContributions)));

        let mut parameters = Parameters::default();
        parameters.mu.clear();
        let no_mu = engine(parameters);
        assert!(matches!(no_mu.compute_corrfunc_bulk(), Err(Error::EmptyGrid("mu"))));

        let mut parameters = Parameters::default();
        parameters.separations.clear();
        let no_separations = engine(parameters);
        assert!(matches!(
            no_separations.compute_corrfunc_bulk(),
            Err(Error::EmptyGrid("separation"))
        ));

        let engine = engine(Parameters::default());
        assert!(matches!(engine.correlation(-1.0, 0.1, 1.0), Err(Error::InvalidInput(_))));
        assert!(matches!(engine.correlation(10.0, 1.5, 1.0), Err(Error::InvalidInput(_))));
        assert!(matches!(engine.correlation(10.0, 0.5, 20.0), Err(Error::OutOfRange { .. })));
    }

    #[test]
    fn test_potential_correlation_ignores_the_infrared_cutoff() {
        let mut parameters = Parameters::default();
        parameters.contributions = [Contribution::Potential].into_iter().collect();
        let values: Vec<f64> = [1e-3, 1e-5]
            .iter()
            .map(|&k_min| {
                let spectrum = NoWiggleSpectrum::new(&parameters, 0.8, 0.96)
                    .unwrap()
                    .table(k_min, 5.0, 800)
                    .unwrap();
                let engine = CorrelationEngine::new(parameters.clone(), spectrum).unwrap();
                engine.correlation(30.0, 0.5, 1.0).unwrap()
            })
            .collect();
        assert!(values[0].is_finite() && values[0] != 0.0);
        assert!((values[0] / values[1] - 1.0).abs() < 1e-3, "{values:?}");
    }

    #[test]
    fn test_bulk_sweep_survives_failed_integrals() {
        // k^2 P overflows, so every Bessel integral fails and becomes NaN
        let k = crate::utils::logspace(1e-2, 100.0, 50);
        let p = vec![1e307; k.len()];
        let spectrum = PowerSpectrumTable::new(&k, &p).unwrap();
        let mut parameters = Parameters::default();
        parameters.separations = vec![10.0, 40.0];
        parameters.mu = vec![0.0, 0.5];
        let engine = CorrelationEngine::new(parameters, spectrum).unwrap();

        let results = engine.compute_corrfunc_bulk().unwrap();
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|result| result.value.is_nan()));
        assert_eq!((results[3].r, results[3].mu), (40.0, 0.5));
    }

    #[test]
    fn test_bulk_order() {
        let mut parameters = Parameters::default();
        parameters.z_mean = vec![0.5, 1.0];
        parameters.separations = vec![10.0, 50.0];
        parameters.mu = vec![0.0, 0.5, 1.0];
        let engine = engine(parameters);

        let results = engine.compute_corrfunc_bulk().unwrap();
        assert_eq!(results.len(), 12);
        assert_eq!((results[0].z, results[0].r, results[0].mu), (0.5, 10.0, 0.0));
        assert_eq!((results[1].z, results[1].r, results[1].mu), (0.5, 10.0, 0.5));
        assert_eq!((results[3].z, results[3].r, results[3].mu), (0.5, 50.0, 0.0));
        assert_eq!((results[6].z, results[6].r, results[6].mu), (1.0, 10.0, 0.0));
        let direct = engine.correlation(50.0, 1.0, 1.0).unwrap();
        assert_eq!(results[11].value, direct);
    }
}
