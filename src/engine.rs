use crate::background::BackgroundCosmology;
use crate::corrfunc::{CorrelationFunctionAssembler, CorrelationResult};
use crate::covariance::{CovarianceAssembler, CovarianceEntry};
use crate::error::Result;
use crate::integrals::{BesselIntegralCache, IntegralSettings};
use crate::multipoles::{MultipoleProjector, MultipoleResult};
use crate::parameters::Parameters;
use crate::spectrum::{Extrapolation, PowerSpectrumTable};
use crate::theory::TheoryContext;
use log::debug;
use parking_lot::RwLock;
use std::sync::Arc;

/// Tables derived from one version of the inputs.
#[derive(Debug)]
struct Prepared {
    version: u64,
    background: Arc<BackgroundCosmology>,
    settings: IntegralSettings,
}

/// Owns the inputs of a computation and every cache derived from them.
///
/// Inputs are only changed through `&mut self`, and every change bumps a
/// version: the background is rebuilt lazily for a new version, and the
/// Bessel integrals are dropped whenever an input changes.
#[derive(Debug)]
pub struct CorrelationEngine {
    parameters: Parameters,
    spectrum: PowerSpectrumTable,
    version: u64,
    state: RwLock<Option<Prepared>>,
    integrals: BesselIntegralCache,
}

impl CorrelationEngine {
    pub fn new(parameters: Parameters, spectrum: PowerSpectrumTable) -> Result<Self> {
        parameters.validate()?;
        Ok(CorrelationEngine {
            parameters,
            spectrum,
            version: 0,
            state: RwLock::new(None),
            integrals: BesselIntegralCache::new(),
        })
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn spectrum(&self) -> &PowerSpectrumTable {
        &self.spectrum
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn integrals(&self) -> &BesselIntegralCache {
        &self.integrals
    }

    /// Replaces the parameters. Invalid parameters leave the engine untouched.
    pub fn set_parameters(&mut self, parameters: Parameters) -> Result<()> {
        parameters.validate()?;
        self.parameters = parameters;
        // Table ranges and the window follow the parameters
        self.integrals.clear();
        self.version += 1;
        Ok(())
    }

    /// Modifies a copy of the parameters, which replaces them if it is valid.
    pub fn update_parameters<F: FnOnce(&mut Parameters)>(&mut self, update: F) -> Result<()> {
        let mut parameters = self.parameters.clone();
        update(&mut parameters);
        self.set_parameters(parameters)
    }

    pub fn set_power_spectrum(&mut self, k: &[f64], p: &[f64]) -> Result<()> {
        self.spectrum.set(k, p)?;
        self.spectrum_changed();
        Ok(())
    }

    pub fn set_population_spectrum(
        &mut self,
        population: usize,
        k: &[f64],
        p: &[f64],
    ) -> Result<()> {
        self.spectrum.set_population(population, k, p)?;
        self.spectrum_changed();
        Ok(())
    }

    pub fn set_extrapolation(&mut self, extrapolation: Extrapolation) {
        self.spectrum.set_extrapolation(extrapolation);
        self.spectrum_changed();
    }

    fn spectrum_changed(&mut self) {
        self.integrals.clear();
        self.version += 1;
    }

    /// The background of the current parameters, built on first use.
    pub fn background(&self) -> Result<Arc<BackgroundCosmology>> {
        Ok(self.prepared()?.0)
    }

    fn prepared(&self) -> Result<(Arc<BackgroundCosmology>, IntegralSettings)> {
        if let Some(prepared) = self.state.read().as_ref() {
            if prepared.version == self.version {
                return Ok((prepared.background.clone(), prepared.settings));
            }
        }

        let mut state = self.state.write();
        // Another thread may have won the race for the write lock
        if let Some(prepared) = state.as_ref() {
            if prepared.version == self.version {
                return Ok((prepared.background.clone(), prepared.settings));
            }
        }

        let background = Arc::new(BackgroundCosmology::new(&self.parameters)?);
        let settings = integral_settings(&self.parameters, &background, &self.spectrum)?;
        debug!("Prepared version {} of the engine with {:?}", self.version, settings);
        *state = Some(Prepared {
            version: self.version,
            background: background.clone(),
            settings,
        });
        Ok((background, settings))
    }

    fn with_context<T, F>(&self, compute: F) -> Result<T>
    where
        F: FnOnce(TheoryContext) -> Result<T>,
    {
        let (background, settings) = self.prepared()?;
        compute(TheoryContext {
            parameters: &self.parameters,
            background: &background,
            spectrum: &self.spectrum,
            integrals: &self.integrals,
            settings,
        })
    }

    /// I_l^n(r) of the spectrum of the correlated populations.
    pub fn integral(&self, l: usize, n: usize, r: f64) -> Result<f64> {
        self.with_context(|context| {
            self.integrals
                .integral(&self.spectrum, &context.settings, context.pair(), l, n, r)
        })
    }

    pub fn correlation(&self, r: f64, mu: f64, z: f64) -> Result<f64> {
        self.with_context(|context| {
            CorrelationFunctionAssembler::new(context).correlation(r, mu, z)
        })
    }

    pub fn compute_corrfunc_bulk(&self) -> Result<Vec<CorrelationResult>> {
        self.with_context(|context| CorrelationFunctionAssembler::new(context).compute_bulk())
    }

    pub fn multipole(&self, r: f64, l: usize, z: f64) -> Result<f64> {
        self.with_context(|context| projector(context).multipole(r, l, z))
    }

    pub fn redshift_averaged_multipole(
        &self,
        r: f64,
        l: usize,
        z_min: f64,
        z_max: f64,
    ) -> Result<f64> {
        self.with_context(|context| projector(context).redshift_averaged(r, l, z_min, z_max))
    }

    pub fn compute_multipoles_bulk(&self) -> Result<Vec<MultipoleResult>> {
        self.with_context(|context| projector(context).compute_bulk())
    }

    pub fn covariance(&self, l1: usize, r1: f64, l2: usize, r2: f64, bin: usize) -> Result<f64> {
        self.with_context(|context| {
            CovarianceAssembler::new(context).covariance(l1, r1, l2, r2, bin)
        })
    }

    pub fn compute_covariance_bulk(&self, rstep: Option<f64>) -> Result<Vec<CovarianceEntry>> {
        self.with_context(|context| CovarianceAssembler::new(context).compute_bulk(rstep))
    }
}

fn projector(context: TheoryContext) -> MultipoleProjector {
    MultipoleProjector::new(CorrelationFunctionAssembler::new(context))
}

/// Table geometry wide enough for every separation the line of sight
/// integrals can reach from the requested redshifts.
fn integral_settings(
    parameters: &Parameters,
    background: &BackgroundCosmology,
    spectrum: &PowerSpectrumTable,
) -> Result<IntegralSettings> {
    let numerics = &parameters.numerics;
    let covariance = &parameters.covariance;
    let z_top = parameters
        .z_mean
        .iter()
        .copied()
        .chain(
            covariance
                .z_mean
                .iter()
                .zip(&covariance.deltaz)
                .map(|(z, dz)| z + dz / 2.0),
        )
        .fold(0.0_f64, f64::max)
        .min(background.z_max());
    let max_separation = parameters.separations.iter().copied().fold(0.0_f64, f64::max);
    let r_max = (2.1 * background.comoving_distance(z_top)? + 2.0 * max_separation).max(1.0);

    Ok(IntegralSettings {
        rel_tol: numerics.integral_tolerance,
        table_rel_tol: 0.1 * numerics.lensing_tolerance,
        bins: numerics.bessel_bins,
        r_min: (1e-2 / spectrum.k_max()).min(0.5 * r_max),
        r_max,
        window: parameters.resolution_window,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::theory::Integrated;
    use crate::transfer::NoWiggleSpectrum;

    fn engine() -> CorrelationEngine {
        let parameters = Parameters::default();
        let spectrum = NoWiggleSpectrum::new(&parameters, 0.8, 0.96)
            .unwrap()
            .table(1e-4, 5.0, 512)
            .unwrap();
        CorrelationEngine::new(parameters, spectrum).unwrap()
    }

    #[test]
    fn test_parameter_updates_rebuild_background() {
        let mut engine = engine();
        let before = engine.background().unwrap().comoving_distance(1.0).unwrap();
        assert_eq!(engine.version(), 0);

        engine.integral(0, 0, 20.0).unwrap();
        assert!(!engine.integrals().is_empty());
        engine.update_parameters(|parameters| parameters.h = 0.7).unwrap();
        assert_eq!(engine.version(), 1);
        assert!(engine.integrals().is_empty());
        let after = engine.background().unwrap().comoving_distance(1.0).unwrap();
        assert!((after / before - 0.67 / 0.7).abs() < 1e-8);

        // A rejected update changes nothing
        let result = engine.update_parameters(|parameters| parameters.h = -1.0);
        assert!(matches!(result, Err(Error::ParameterRange(_))));
        assert_eq!(engine.version(), 1);
        assert_eq!(engine.parameters().h, 0.7);
    }

    #[test]
    fn test_spectrum_change_clears_integrals() {
        let mut engine = engine();
        let first = engine.integral(0, 0, 20.0).unwrap();
        assert!(!engine.integrals().is_empty());

        let k = crate::utils::logspace(1e-4, 5.0, 512);
        let p: Vec<f64> = k.iter().map(|&k| 2.0 * engine.spectrum().evaluate(k).unwrap()).collect();
        engine.set_power_spectrum(&k, &p).unwrap();
        assert!(engine.integrals().is_empty());
        let second = engine.integral(0, 0, 20.0).unwrap();
        assert!((second / first - 2.0).abs() < 1e-6);

        assert!(matches!(
            engine.set_power_spectrum(&[1.0, 0.5], &[1.0, 1.0]),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_integrated_weights_in_einstein_de_sitter() {
        let parameters = Parameters {
            omega_cdm: 0.95,
            omega_baryon: 0.05,
            ..Default::default()
        };
        let spectrum = NoWiggleSpectrum::new(&parameters, 0.8, 0.96)
            .unwrap()
            .table(1e-4, 5.0, 64)
            .unwrap();
        let engine = CorrelationEngine::new(parameters, spectrum).unwrap();

        let potential = Integrated {
            amplitude: 1.0,
            derivative: false,
        };
        let derivative = Integrated {
            amplitude: 1.0,
            derivative: true,
        };
        engine
            .with_context(|context| {
                let today = context.potential(0.0)?;
                for &chi in &[100.0, 1000.0, 3000.0] {
                    let z = context.background.redshift_at_distance(chi)?;
                    let h = context.background.conformal_hubble(z);
                    // Matter domination freezes the potential
                    let phi = context.integrated_weight(&potential, chi)?;
                    assert!((phi / today - 1.0).abs() < 1e-4);
                    let phi_prime = context.integrated_weight(&derivative, chi)?;
                    assert!(phi_prime.abs() < 1e-4 * h * today.abs());
                }
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_engine_is_shared_across_threads() {
        let engine = engine();
        let values: Vec<f64> = std::thread::scope(|scope| {
            let handles: Vec<_> = [10.0, 20.0, 30.0]
                .iter()
                .map(|&r| {
                    let engine = &engine;
                    scope.spawn(move || engine.correlation(r, 0.5, 1.0).unwrap())
                })
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).collect()
        });
        for (&r, value) in [10.0, 20.0, 30.0].iter().zip(values) {
            assert_eq!(engine.correlation(r, 0.5, 1.0).unwrap(), value);
        }
    }
}
