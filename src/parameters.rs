use crate::constants::MAX_MULTIPOLE;
use crate::error::{Error, Result};
use crate::utils::is_strictly_increasing;
use interp::interp;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A function of redshift given by samples, linearly interpolated between them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampledCurve {
    pub z: Vec<f64>,
    pub values: Vec<f64>,
}

impl SampledCurve {
    pub fn new(z: Vec<f64>, values: Vec<f64>) -> Self {
        SampledCurve { z, values }
    }

    /// A curve that takes the same value on [z_min, z_max].
    pub fn constant(value: f64, z_min: f64, z_max: f64) -> Self {
        SampledCurve {
            z: vec![z_min, z_max],
            values: vec![value, value],
        }
    }

    pub fn z_min(&self) -> f64 {
        self.z.first().copied().unwrap_or(f64::NAN)
    }

    pub fn z_max(&self) -> f64 {
        self.z.last().copied().unwrap_or(f64::NAN)
    }

    pub fn evaluate(&self, z: f64) -> Result<f64> {
        if !(z >= self.z_min() && z <= self.z_max()) {
            return Err(Error::out_of_range(
                "redshift curve",
                z,
                self.z_min(),
                self.z_max(),
            ));
        }
        Ok(interp(&self.z, &self.values, z))
    }

    fn validate(&self, name: &str, z_max: f64) -> Result<()> {
        if self.z.len() != self.values.len() || self.z.len() < 2 {
            return Err(Error::InvalidInput(format!(
                "{name} needs at least two samples and as many values as redshifts"
            )));
        }
        if !is_strictly_increasing(&self.z) || self.values.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidInput(format!(
                "{name} redshifts must be strictly increasing and values finite"
            )));
        }
        if self.z_min() < 0.0 || self.z_max() > z_max {
            return Err(Error::InvalidInput(format!(
                "{name} is sampled on [{}, {}], which is not inside [0, {z_max}]",
                self.z_min(),
                self.z_max()
            )));
        }
        Ok(())
    }
}

/// A galaxy population (tracer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Population {
    /// Linear galaxy bias b(z).
    pub galaxy_bias: SampledCurve,
    /// Magnification bias s(z).
    pub magnification_bias: SampledCurve,
    /// Evolution bias f_evo(z).
    pub evolution_bias: SampledCurve,
    /// Comoving number density in each covariance redshift bin, in Mpc^-3.
    pub number_density: Vec<f64>,
}

impl Population {
    /// A population with constant biases over [0, z_max].
    pub fn constant(bias: f64, magnification: f64, evolution: f64, z_max: f64) -> Self {
        Population {
            galaxy_bias: SampledCurve::constant(bias, 0.0, z_max),
            magnification_bias: SampledCurve::constant(magnification, 0.0, z_max),
            evolution_bias: SampledCurve::constant(evolution, 0.0, z_max),
            number_density: vec![1e-3],
        }
    }
}

/// The physical terms that can enter the correlation function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Contribution {
    Density,
    Rsd,
    /// Doppler term (d1)
    Doppler,
    /// Velocity potential term (d2)
    VelocityPotential,
    /// Potential at the source (g1)
    PotentialSource,
    /// Potential (g2)
    Potential,
    /// Time derivative of the potential (g3)
    PotentialDerivative,
    /// Potential integrated along the line of sight (g4)
    IntegratedPotential,
    /// Integrated time derivative of the potential (g5)
    IntegratedPotentialDerivative,
    Lensing,
}

/// Where a contribution samples the density field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Support {
    /// At the source only
    Local,
    /// Along the line of sight, weighted by the angular Laplacian
    Lensing,
    /// Along the line of sight
    Integrated,
}

impl Contribution {
    pub const ALL: [Contribution; 10] = [
        Contribution::Density,
        Contribution::Rsd,
        Contribution::Doppler,
        Contribution::VelocityPotential,
        Contribution::PotentialSource,
        Contribution::Potential,
        Contribution::PotentialDerivative,
        Contribution::IntegratedPotential,
        Contribution::IntegratedPotentialDerivative,
        Contribution::Lensing,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            Contribution::Density => "den",
            Contribution::Rsd => "rsd",
            Contribution::Doppler => "d1",
            Contribution::VelocityPotential => "d2",
            Contribution::PotentialSource => "g1",
            Contribution::Potential => "g2",
            Contribution::PotentialDerivative => "g3",
            Contribution::IntegratedPotential => "g4",
            Contribution::IntegratedPotentialDerivative => "g5",
            Contribution::Lensing => "len",
        }
    }

    pub fn support(&self) -> Support {
        match self {
            Contribution::Lensing => Support::Lensing,
            Contribution::IntegratedPotential | Contribution::IntegratedPotentialDerivative => {
                Support::Integrated
            }
            _ => Support::Local,
        }
    }

    /// Whether the term is evaluated at the source position only.
    pub fn is_local(&self) -> bool {
        self.support() == Support::Local
    }
}

/// Which pairs of terms use the small-angle approximation. Terms involving
/// the integrated potentials are always computed in full sky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatSky {
    /// Local x local terms.
    pub local: bool,
    /// Local x lensing terms.
    pub local_nonlocal: bool,
    /// Lensing x lensing.
    pub nonlocal: bool,
}

impl Default for FlatSky {
    fn default() -> Self {
        FlatSky {
            local: true,
            local_nonlocal: false,
            nonlocal: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CovarianceTerms {
    pub cosmic: bool,
    pub mixed: bool,
    pub poisson: bool,
}

impl CovarianceTerms {
    pub fn any(&self) -> bool {
        self.cosmic || self.mixed || self.poisson
    }
}

impl Default for CovarianceTerms {
    fn default() -> Self {
        CovarianceTerms {
            cosmic: true,
            mixed: true,
            poisson: true,
        }
    }
}

/// Survey description for the covariance, one entry per redshift bin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovarianceSettings {
    pub z_mean: Vec<f64>,
    pub deltaz: Vec<f64>,
    pub fsky: Vec<f64>,
    /// Separation bin width L_p in Mpc.
    pub pixelsize: Vec<f64>,
    /// Populations [a, b, c, d] of Cov[xi^{ab}, xi^{cd}].
    pub populations: [usize; 4],
    pub terms: CovarianceTerms,
}

impl Default for CovarianceSettings {
    fn default() -> Self {
        CovarianceSettings {
            z_mean: vec![1.0],
            deltaz: vec![0.1],
            fsky: vec![0.2],
            pixelsize: vec![5.0],
            populations: [0; 4],
            terms: CovarianceTerms::default(),
        }
    }
}

impl CovarianceSettings {
    pub fn bins(&self) -> usize {
        self.z_mean.len()
    }
}

/// Accuracy and tabulation knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Numerics {
    /// Largest redshift of the background tabulation.
    pub z_max: f64,
    /// Number of background nodes, uniform in ln(1 + z).
    pub background_bins: usize,
    /// Number of log-spaced separations of the Bessel integral tables.
    pub bessel_bins: usize,
    /// Relative tolerance of a single Bessel integral.
    pub integral_tolerance: f64,
    /// Relative tolerance of the line of sight integrals of lensing.
    pub lensing_tolerance: f64,
    /// Gauss-Legendre order of the multipole projection.
    pub mu_order: usize,
}

impl Default for Numerics {
    fn default() -> Self {
        Numerics {
            z_max: 15.0,
            background_bins: 512,
            bessel_bins: 256,
            integral_tolerance: 1e-6,
            lensing_tolerance: 1e-4,
            mu_order: 32,
        }
    }
}

/// Everything needed to evaluate the two-point statistics, apart from the power spectrum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    pub omega_cdm: f64,
    pub omega_baryon: f64,
    pub omega_gamma: f64,
    pub h: f64,
    /// Dark energy equation of state w(z) = w0 + wa z / (1 + z).
    pub w0: f64,
    pub wa: f64,

    pub populations: Vec<Population>,
    /// The two tracers of the correlation function.
    pub correlation_populations: [usize; 2],

    pub z_mean: Vec<f64>,
    pub separations: Vec<f64>,
    pub mu: Vec<f64>,
    pub multipoles: Vec<usize>,

    pub contributions: BTreeSet<Contribution>,
    pub only_cross_correlations: bool,
    pub flatsky: FlatSky,
    /// Size in Mpc of a top-hat window smoothing the spectrum, to mimic the
    /// finite resolution of a survey.
    pub resolution_window: Option<f64>,

    pub covariance: CovarianceSettings,
    pub numerics: Numerics,
}

impl Default for Parameters {
    fn default() -> Self {
        let numerics = Numerics::default();
        Parameters {
            omega_cdm: 0.25,
            omega_baryon: 0.05,
            omega_gamma: 0.0,
            h: 0.67,
            w0: -1.0,
            wa: 0.0,
            populations: vec![Population::constant(1.0, 0.0, 0.0, numerics.z_max)],
            correlation_populations: [0, 0],
            z_mean: vec![1.0],
            separations: vec![10.0, 20.0, 40.0, 100.0, 150.0],
            mu: vec![0.0, 0.2, 0.5, 0.8, 0.95],
            multipoles: vec![0, 2, 4],
            contributions: [Contribution::Density, Contribution::Rsd]
                .into_iter()
                .collect(),
            only_cross_correlations: false,
            flatsky: FlatSky::default(),
            resolution_window: None,
            covariance: CovarianceSettings::default(),
            numerics,
        }
    }
}

impl Parameters {
    pub fn omega_matter(&self) -> f64 {
        self.omega_cdm + self.omega_baryon
    }

    /// Dark energy density today, fixed by flatness.
    pub fn omega_dark_energy(&self) -> f64 {
        1.0 - self.omega_cdm - self.omega_baryon - self.omega_gamma
    }

    pub fn has(&self, contribution: Contribution) -> bool {
        self.contributions.contains(&contribution)
    }

    pub fn population(&self, index: usize) -> Result<&Population> {
        self.populations.get(index).ok_or_else(|| {
            Error::InvalidInput(format!(
                "population {index} requested but only {} are defined",
                self.populations.len()
            ))
        })
    }

    /// Checks every invariant of the configuration. Empty output grids are
    /// accepted here, bulk computations report them.
    pub fn validate(&self) -> Result<()> {
        // Step 1: cosmology
        let densities = [
            ("omega_cdm", self.omega_cdm),
            ("omega_baryon", self.omega_baryon),
            ("omega_gamma", self.omega_gamma),
        ];
        for (name, value) in densities {
            if !(value >= 0.0) || !value.is_finite() {
                return Err(Error::ParameterRange(format!("{name} = {value} must be non-negative")));
            }
        }
        if !(self.omega_matter() > 0.0) {
            return Err(Error::ParameterRange(String::from(
                "the total matter density must be positive",
            )));
        }
        if self.omega_dark_energy() < 0.0 {
            return Err(Error::ParameterRange(format!(
                "densities sum to {} > 1, implying negative dark energy density",
                1.0 - self.omega_dark_energy()
            )));
        }
        if !(self.h > 0.0) || !self.h.is_finite() {
            return Err(Error::ParameterRange(format!("h = {} must be positive", self.h)));
        }
        if !self.w0.is_finite() || !self.wa.is_finite() {
            return Err(Error::ParameterRange(String::from(
                "dark energy equation of state must be finite",
            )));
        }

        // Step 2: numerics
        let numerics = &self.numerics;
        if !(numerics.z_max > 0.0) || !numerics.z_max.is_finite() {
            return Err(Error::InvalidInput(String::from("z_max must be positive")));
        }
        if numerics.background_bins < 16 || numerics.bessel_bins < 16 {
            return Err(Error::InvalidInput(String::from(
                "background and Bessel tables need at least 16 nodes",
            )));
        }
        if !(numerics.integral_tolerance > 0.0 && numerics.integral_tolerance < 1.0)
            || !(numerics.lensing_tolerance > 0.0 && numerics.lensing_tolerance < 1.0)
        {
            return Err(Error::InvalidInput(String::from(
                "tolerances must lie strictly between 0 and 1",
            )));
        }
        if numerics.mu_order < 3 {
            return Err(Error::InvalidInput(String::from(
                "the multipole quadrature needs at least 3 points",
            )));
        }
        if let Some(size) = self.resolution_window {
            if !(size > 0.0) || !size.is_finite() {
                return Err(Error::InvalidInput(format!(
                    "the resolution window must be positive, got {size}"
                )));
            }
        }

        // Step 3: output grids
        if self
            .z_mean
            .iter()
            .any(|&z| !(z >= 0.0) || !(z < numerics.z_max))
        {
            return Err(Error::InvalidInput(format!(
                "mean redshifts must lie in [0, {})",
                numerics.z_max
            )));
        }
        if self.separations.iter().any(|&r| !(r > 0.0) || !r.is_finite()) {
            return Err(Error::InvalidInput(String::from(
                "separations must be positive and finite",
            )));
        }
        if self.mu.iter().any(|&mu| !(-1.0..=1.0).contains(&mu)) {
            return Err(Error::InvalidInput(String::from("mu values must lie in [-1, 1]")));
        }
        if self.multipoles.iter().any(|&l| l > MAX_MULTIPOLE) {
            return Err(Error::InvalidInput(format!(
                "multipoles above {MAX_MULTIPOLE} are not supported"
            )));
        }

        // Step 4: populations
        if self.populations.is_empty() {
            return Err(Error::InvalidInput(String::from(
                "at least one galaxy population is required",
            )));
        }
        for (index, population) in self.populations.iter().enumerate() {
            population
                .galaxy_bias
                .validate(&format!("galaxy bias of population {index}"), numerics.z_max)?;
            population.magnification_bias.validate(
                &format!("magnification bias of population {index}"),
                numerics.z_max,
            )?;
            population.evolution_bias.validate(
                &format!("evolution bias of population {index}"),
                numerics.z_max,
            )?;
        }
        for &index in &self.correlation_populations {
            self.population(index)?;
        }

        // Step 5: survey
        let covariance = &self.covariance;
        let bins = covariance.bins();
        if covariance.deltaz.len() != bins
            || covariance.fsky.len() != bins
            || covariance.pixelsize.len() != bins
        {
            return Err(Error::InvalidInput(String::from(
                "covariance z_mean, deltaz, fsky and pixelsize must have the same length",
            )));
        }
        for bin in 0..bins {
            let (z, dz) = (covariance.z_mean[bin], covariance.deltaz[bin]);
            if !(dz > 0.0) || !(z - dz / 2.0 >= 0.0) || !(z + dz / 2.0 < numerics.z_max) {
                return Err(Error::ParameterRange(format!(
                    "covariance bin {bin} at z = {z} with width {dz} is outside [0, {}]",
                    numerics.z_max
                )));
            }
            if !(covariance.fsky[bin] > 0.0 && covariance.fsky[bin] <= 1.0) {
                return Err(Error::ParameterRange(format!(
                    "fsky of bin {bin} must lie in (0, 1]"
                )));
            }
            if !(covariance.pixelsize[bin] > 0.0) {
                return Err(Error::ParameterRange(format!(
                    "pixel size of bin {bin} must be positive"
                )));
            }
        }
        for &index in &covariance.populations {
            let population = self.population(index)?;
            if population.number_density.len() != bins {
                return Err(Error::InvalidInput(format!(
                    "population {index} has {} number densities for {bins} covariance bins",
                    population.number_density.len()
                )));
            }
            if population.number_density.iter().any(|&n| !(n > 0.0)) {
                return Err(Error::ParameterRange(format!(
                    "number densities of population {index} must be positive"
                )));
            }
        }

        Ok(())
    }
}

#[test]
fn test_default_parameters_are_valid() {
    let parameters = Parameters::default();
    parameters.validate().unwrap();
    assert!((parameters.omega_dark_energy() - 0.7).abs() < 1e-15);
    assert!(parameters.has(Contribution::Density));
    assert!(!parameters.has(Contribution::Lensing));
}

#[test]
fn test_parameters_round_trip() {
    let mut parameters = Parameters::default();
    parameters.contributions.insert(Contribution::Lensing);
    parameters.separations = vec![12.5, 50.0, 0.3];
    parameters.resolution_window = Some(4.0);
    parameters.populations.push(Population {
        galaxy_bias: SampledCurve::new(vec![0.0, 1.0, 2.0], vec![1.1, 1.4, 2.2]),
        ..Population::constant(1.0, 0.2, -1.0, 15.0)
    });

    let bytes = bincode::serialize(&parameters).unwrap();
    let reloaded: Parameters = bincode::deserialize(&bytes).unwrap();
    assert_eq!(parameters, reloaded);
    assert_eq!(reloaded.separations, vec![12.5, 50.0, 0.3]);
}

#[test]
fn test_parameters_reject_inconsistent_cosmology() {
    let mut parameters = Parameters::default();
    parameters.omega_cdm = -0.1;
    assert!(matches!(parameters.validate(), Err(Error::ParameterRange(_))));

    let mut parameters = Parameters::default();
    parameters.omega_cdm = 0.99;
    assert!(matches!(parameters.validate(), Err(Error::ParameterRange(_))));

    let mut parameters = Parameters::default();
    parameters.h = 0.0;
    assert!(matches!(parameters.validate(), Err(Error::ParameterRange(_))));

    let mut parameters = Parameters::default();
    parameters.resolution_window = Some(-5.0);
    assert!(matches!(parameters.validate(), Err(Error::InvalidInput(_))));
}

#[test]
fn test_parameters_reject_bad_populations() {
    let mut parameters = Parameters::default();
    parameters.correlation_populations = [0, 3];
    assert!(matches!(parameters.validate(), Err(Error::InvalidInput(_))));

    let mut parameters = Parameters::default();
    parameters.populations[0].number_density = vec![1e-3, 1e-3];
    assert!(matches!(parameters.validate(), Err(Error::InvalidInput(_))));

    let mut parameters = Parameters::default();
    parameters.populations[0].galaxy_bias = SampledCurve::new(vec![0.0, 20.0], vec![1.0, 1.0]);
    assert!(matches!(parameters.validate(), Err(Error::InvalidInput(_))));
}

#[test]
fn test_sampled_curve_interpolates_linearly() {
    let curve = SampledCurve::new(vec![0.0, 1.0, 3.0], vec![1.0, 2.0, 0.0]);
    assert!((curve.evaluate(0.5).unwrap() - 1.5).abs() < 1e-15);
    assert!((curve.evaluate(2.0).unwrap() - 1.0).abs() < 1e-15);
    assert!(matches!(curve.evaluate(3.5), Err(Error::OutOfRange { .. })));
}

#[test]
fn test_contribution_tags_and_support() {
    let tags: BTreeSet<&str> = Contribution::ALL.iter().map(|c| c.tag()).collect();
    assert_eq!(tags.len(), Contribution::ALL.len());
    let local = Contribution::ALL.iter().filter(|c| c.is_local()).count();
    assert_eq!(local, 7);
    assert_eq!(Contribution::IntegratedPotentialDerivative.tag(), "g5");
    assert_eq!(Contribution::IntegratedPotential.support(), Support::Integrated);
    assert_eq!(Contribution::Lensing.support(), Support::Lensing);
}
