/// This module contains the Fourier-space kernels of every contribution to
/// the relativistic number counts, and the functions that correlate them.
///
/// A local contribution X of a tracer is A_X (i mu_k)^p k^-q times the
/// linear density today; lensing is a line of sight integral of the
/// potential. `local` correlates two local terms, `lensing` and `flatsky`
/// the terms involving lensing, in full sky and in the Limber approximation.
/// The integrated potentials are handled by `integrated`, in full sky only.
pub mod derivatives;
pub mod flatsky;
pub mod integrated;
pub mod lensing;
pub mod local;

use crate::background::BackgroundCosmology;
use crate::error::{Error, Result};
use crate::integrals::{BesselIntegralCache, IntegralSettings, PopulationPair};
use crate::parameters::{Contribution, Parameters};
use crate::spectrum::PowerSpectrumTable;

pub type Vector = [f64; 3];

pub fn dot(a: &Vector, b: &Vector) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

pub fn norm(a: &Vector) -> f64 {
    dot(a, a).sqrt()
}

/// a - s b
pub fn sub_scaled(a: &Vector, s: f64, b: &Vector) -> Vector {
    [a[0] - s * b[0], a[1] - s * b[1], a[2] - s * b[2]]
}

/// Everything the kernels need to know about one tracer at one point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TracerState {
    pub z: f64,
    pub chi: f64,
    pub growth_factor: f64,
    pub growth_rate: f64,
    pub conformal_hubble: f64,
    pub conformal_hubble_prime: f64,
    pub bias: f64,
    pub magnification_bias: f64,
    pub evolution_bias: f64,
    /// Phi_A = -(3/2) Omega_m0 H0^2 (1 + z) D, such that Phi = Phi_A delta_0 / k^2
    pub potential: f64,
}

/// A_X (i mu_k)^p k^-q
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Kernel {
    pub amplitude: f64,
    pub p: usize,
    pub q: usize,
}

/// P_X int_0^chi dlambda w(lambda) Phi(lambda n), where the weight is Phi_A
/// or, for the time derivative, H (f - 1) Phi_A.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Integrated {
    pub amplitude: f64,
    pub derivative: bool,
}

impl TracerState {
    /// The Doppler coefficient alpha = H'/H^2 + (2 - 5s)/(chi H) + 5s - f_evo.
    fn doppler_coefficient(&self) -> Result<f64> {
        if !(self.chi > 0.0) {
            return Err(Error::InvalidInput(String::from(
                "Doppler and potential terms are undefined at the observer",
            )));
        }
        let h = self.conformal_hubble;
        let s = self.magnification_bias;
        Ok(self.conformal_hubble_prime / (h * h) + (2.0 - 5.0 * s) / (self.chi * h) + 5.0 * s
            - self.evolution_bias)
    }

    /// The kernel of a local contribution, None for the line of sight terms.
    pub fn kernel(&self, contribution: Contribution) -> Result<Option<Kernel>> {
        let d = self.growth_factor;
        let f = self.growth_rate;
        let h = self.conformal_hubble;
        let s = self.magnification_bias;

        let kernel = |amplitude, p, q| Ok(Some(Kernel { amplitude, p, q }));
        match contribution {
            Contribution::Density => kernel(self.bias * d, 0, 0),
            Contribution::Rsd => kernel(-f * d, 2, 0),
            Contribution::Doppler => kernel(self.doppler_coefficient()? * f * h * d, 1, 1),
            Contribution::VelocityPotential => {
                kernel((self.evolution_bias - 3.0) * f * h * h * d, 0, 2)
            }
            Contribution::PotentialSource => {
                kernel((1.0 + self.doppler_coefficient()?) * self.potential, 0, 2)
            }
            Contribution::Potential => kernel((5.0 * s - 2.0) * self.potential, 0, 2),
            Contribution::PotentialDerivative => kernel((f - 1.0) * self.potential, 0, 2),
            Contribution::IntegratedPotential
            | Contribution::IntegratedPotentialDerivative
            | Contribution::Lensing => Ok(None),
        }
    }

    /// The prefactor of an integrated potential, None for the other terms.
    pub fn integrated(&self, contribution: Contribution) -> Result<Option<Integrated>> {
        match contribution {
            Contribution::IntegratedPotential => {
                if !(self.chi > 0.0) {
                    return Err(Error::InvalidInput(String::from(
                        "the integrated potential is undefined at the observer",
                    )));
                }
                Ok(Some(Integrated {
                    amplitude: 2.0 * (2.0 - 5.0 * self.magnification_bias) / self.chi,
                    derivative: false,
                }))
            }
            Contribution::IntegratedPotentialDerivative => Ok(Some(Integrated {
                amplitude: 2.0 * (1.0 + self.doppler_coefficient()?),
                derivative: true,
            })),
            _ => Ok(None),
        }
    }
}

/// Read-only view of everything a correlation needs.
#[derive(Clone, Copy)]
pub struct TheoryContext<'a> {
    pub parameters: &'a Parameters,
    pub background: &'a BackgroundCosmology,
    pub spectrum: &'a PowerSpectrumTable,
    pub integrals: &'a BesselIntegralCache,
    pub settings: IntegralSettings,
}

impl<'a> TheoryContext<'a> {
    /// The pair of populations whose correlation is computed.
    pub fn pair(&self) -> PopulationPair {
        let [a, b] = self.parameters.correlation_populations;
        PopulationPair::new(a, b)
    }

    /// Phi_A at redshift z.
    pub fn potential(&self, z: f64) -> Result<f64> {
        let h0 = self.background.h0();
        let growth = self.background.growth_factor(z)?;
        Ok(-1.5 * self.background.omega_matter() * h0 * h0 * (1.0 + z) * growth)
    }

    /// Phi_A at comoving distance chi.
    pub fn potential_at_distance(&self, chi: f64) -> Result<f64> {
        self.potential(self.background.redshift_at_distance(chi)?)
    }

    /// Weight of an integrated potential at comoving distance chi.
    pub fn integrated_weight(&self, integrated: &Integrated, chi: f64) -> Result<f64> {
        let z = self.background.redshift_at_distance(chi)?;
        let potential = self.potential(z)?;
        if !integrated.derivative {
            return Ok(potential);
        }
        let f = self.background.growth_rate(z)?;
        Ok(self.background.conformal_hubble(z) * (f - 1.0) * potential)
    }

    pub fn tracer(&self, population: usize, z: f64) -> Result<TracerState> {
        let chi = self.background.comoving_distance(z)?;
        self.tracer_with_distance(population, z, chi)
    }

    pub fn tracer_at_distance(&self, population: usize, chi: f64) -> Result<TracerState> {
        let z = self.background.redshift_at_distance(chi)?;
        self.tracer_with_distance(population, z, chi)
    }

    fn tracer_with_distance(&self, population: usize, z: f64, chi: f64) -> Result<TracerState> {
        let background = self.background;
        let population = self.parameters.population(population)?;
        Ok(TracerState {
            z,
            chi,
            growth_factor: background.growth_factor(z)?,
            growth_rate: background.growth_rate(z)?,
            conformal_hubble: background.conformal_hubble(z),
            conformal_hubble_prime: background.conformal_hubble_prime(z),
            bias: population.galaxy_bias.evaluate(z)?,
            magnification_bias: population.magnification_bias.evaluate(z)?,
            evolution_bias: population.evolution_bias.evaluate(z)?,
            potential: self.potential(z)?,
        })
    }

    /// I_l^n(r), a convergence failure becoming NaN.
    pub fn integral(&self, l: usize, n: usize, r: f64) -> Result<f64> {
        self.integrals
            .integral_or_fallback(self.spectrum, &self.settings, self.pair(), l, n, r)
    }

    /// I_l^n(r) / r^l from the tables.
    pub fn reduced_integral(&self, l: usize, n: usize, r: f64) -> Result<f64> {
        self.integrals
            .reduced_integral(self.spectrum, &self.settings, self.pair(), l, n, r)
    }

    /// H_q(x) from the tables.
    pub fn hankel(&self, q: usize, x: f64) -> Result<f64> {
        self.integrals
            .hankel(self.spectrum, &self.settings, self.pair(), q, x)
    }
}

/// Positions of a pair of galaxies separated by r at angle mu to the line of
/// sight of their midpoint, which lies along the z axis at chi_mean.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairGeometry {
    pub r: f64,
    pub mu: f64,
    pub chi_mean: f64,
    pub x1: Vector,
    pub x2: Vector,
    pub chi1: f64,
    pub chi2: f64,
    /// Unit vectors towards the two galaxies
    pub n1: Vector,
    pub n2: Vector,
}

impl PairGeometry {
    pub fn new(chi_mean: f64, r: f64, mu: f64) -> Result<Self> {
        let sin = (1.0 - mu * mu).max(0.0).sqrt();
        let x1 = [-0.5 * r * sin, 0.0, chi_mean - 0.5 * r * mu];
        let x2 = [0.5 * r * sin, 0.0, chi_mean + 0.5 * r * mu];
        let (chi1, chi2) = (norm(&x1), norm(&x2));
        if !(chi1 > 0.0 && chi2 > 0.0) {
            return Err(Error::InvalidInput(format!(
                "a separation of {r} at mu = {mu} puts a galaxy at the observer"
            )));
        }
        Ok(PairGeometry {
            r,
            mu,
            chi_mean,
            x1,
            x2,
            chi1,
            chi2,
            n1: [x1[0] / chi1, x1[1] / chi1, x1[2] / chi1],
            n2: [x2[0] / chi2, x2[1] / chi2, x2[2] / chi2],
        })
    }

    /// Cosine of the angle between the two lines of sight.
    pub fn cos_theta(&self) -> f64 {
        dot(&self.n1, &self.n2).clamp(-1.0, 1.0)
    }
}

#[test]
fn test_pair_geometry() {
    let geometry = PairGeometry::new(1000.0, 100.0, 0.6).unwrap();
    let separation = sub_scaled(&geometry.x2, 1.0, &geometry.x1);
    assert!((norm(&separation) - 100.0).abs() < 1e-10);
    // The separation makes angle mu with the midpoint direction
    assert!((separation[2] / 100.0 - 0.6).abs() < 1e-12);
    assert!((norm(&geometry.n1) - 1.0).abs() < 1e-14);
    assert!(geometry.chi1 < geometry.chi2);
    assert!(geometry.cos_theta() < 1.0);

    assert!(PairGeometry::new(50.0, 100.0, 1.0).is_err());
}

#[test]
fn test_kernels() {
    let state = TracerState {
        z: 1.0,
        chi: 3000.0,
        growth_factor: 0.6,
        growth_rate: 0.85,
        conformal_hubble: 2e-4,
        conformal_hubble_prime: -1e-8,
        bias: 1.5,
        magnification_bias: 0.2,
        evolution_bias: 0.5,
        potential: -1e-8,
    };
    let density = state.kernel(Contribution::Density).unwrap().unwrap();
    assert_eq!((density.p, density.q), (0, 0));
    assert!((density.amplitude - 0.9).abs() < 1e-15);

    let rsd = state.kernel(Contribution::Rsd).unwrap().unwrap();
    assert_eq!((rsd.p, rsd.q), (2, 0));
    assert!((rsd.amplitude + 0.51).abs() < 1e-15);

    let alpha = -1e-8 / 4e-8 + 1.0 / (3000.0 * 2e-4) + 1.0 - 0.5;
    let doppler = state.kernel(Contribution::Doppler).unwrap().unwrap();
    assert_eq!((doppler.p, doppler.q), (1, 1));
    assert!((doppler.amplitude - alpha * 0.85 * 2e-4 * 0.6).abs() < 1e-15);

    let potential = state.kernel(Contribution::Potential).unwrap().unwrap();
    assert!((potential.amplitude - 1e-8).abs() < 1e-20);

    assert!(state.kernel(Contribution::Lensing).unwrap().is_none());
    assert!(state.kernel(Contribution::IntegratedPotential).unwrap().is_none());

    let g4 = state.integrated(Contribution::IntegratedPotential).unwrap().unwrap();
    assert!((g4.amplitude - 2.0 / 3000.0).abs() < 1e-15);
    assert!(!g4.derivative);
    let g5 = state.integrated(Contribution::IntegratedPotentialDerivative).unwrap().unwrap();
    assert!((g5.amplitude - 2.0 * (1.0 + alpha)).abs() < 1e-12);
    assert!(g5.derivative);
    assert!(state.integrated(Contribution::Potential).unwrap().is_none());

    let observer = TracerState { chi: 0.0, ..state };
    assert!(observer.kernel(Contribution::Doppler).is_err());
    assert!(observer.integrated(Contribution::IntegratedPotential).is_err());
}
