use crate::constants::SEPARATION_EQUALITY;
use crate::corrfunc::check_grid;
use crate::error::{Error, Result};
use crate::integrals::{KernelSpectra, PopulationPair};
use crate::parameters::Contribution;
use crate::theory::TheoryContext;
use crate::utils::approx_equal;
use crate::utils::gauss::GaussLegendre;
use crate::utils::special::{i_power_real, legendre};
use itertools::iproduct;
use log::info;
use nalgebra::DMatrix;
use ndarray::Array2;
use rayon::prelude::*;
use serde_derive::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::time::Instant;

/// One element Cov[xi_l1(r1), xi_l2(r2)] of the covariance of the multipoles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CovarianceEntry {
    pub l1: usize,
    pub r1: f64,
    pub l2: usize,
    pub r2: f64,
    pub z: f64,
    pub value: f64,
}

/// Per-population quantities of one redshift bin.
#[derive(Debug, Clone, Copy)]
struct Tracer {
    population: usize,
    bias: f64,
    number_density: f64,
}

/// Gaussian covariance of the Kaiser (density and RSD) multipoles in a
/// redshift bin, for the populations [a, b, c, d] of Cov[xi^ab, xi^cd].
///
/// The cosmic variance term sums the two Wick pairings (ac)(bd) and
/// (ad)(bc), the mixed term replaces one spectrum of a pairing by the shot
/// noise 1/n of its population, and the Poisson term is pure shot noise,
/// diagonal in multipole and in separation.
#[derive(Clone, Copy)]
pub struct CovarianceAssembler<'a> {
    context: TheoryContext<'a>,
}

impl<'a> CovarianceAssembler<'a> {
    pub fn new(context: TheoryContext<'a>) -> Self {
        CovarianceAssembler { context }
    }

    /// Comoving volume of a redshift bin, fsky 4pi/3 (chi_max^3 - chi_min^3).
    pub fn volume(&self, bin: usize) -> Result<f64> {
        let covariance = &self.context.parameters.covariance;
        check_bin(bin, covariance.bins())?;
        let (z, dz) = (covariance.z_mean[bin], covariance.deltaz[bin]);
        let background = self.context.background;
        let chi_max = background.comoving_distance(z + dz / 2.0)?;
        let chi_min = background.comoving_distance(z - dz / 2.0)?;
        Ok(covariance.fsky[bin] * 4.0 * PI / 3.0 * (chi_max.powi(3) - chi_min.powi(3)))
    }

    pub fn covariance(&self, l1: usize, r1: f64, l2: usize, r2: f64, bin: usize) -> Result<f64> {
        let parameters = self.context.parameters;
        if parameters.contributions.is_empty() {
            return Err(Error::NoContributions);
        }
        let covariance = &parameters.covariance;
        check_bin(bin, covariance.bins())?;
        if !(r1 > 0.0 && r2 > 0.0) {
            return Err(Error::InvalidInput(format!(
                "covariance separations must be positive, got {r1} and {r2}"
            )));
        }

        // Only even l1 - l2 survive the mu integrals
        let phase = match i_power_real(l1 as i64 - l2 as i64) {
            Some(phase) => phase,
            None => return Ok(0.0),
        };
        let terms = &covariance.terms;
        if !terms.any() {
            return Ok(0.0);
        }

        let z = covariance.z_mean[bin];
        let volume = self.volume(bin)?;
        let background = self.context.background;
        let growth = background.growth_factor(z)?;
        let rate = background.growth_rate(z)?;
        let [a, b, c, d] = covariance
            .populations
            .map(|population| self.tracer(population, bin, z));
        let [a, b, c, d] = [a?, b?, c?, d?];

        // Kaiser factor Q(mu) = D (b + f mu^2) of a tracer, each part only when enabled
        let density = if parameters.has(Contribution::Density) { 1.0 } else { 0.0 };
        let rsd = if parameters.has(Contribution::Rsd) { 1.0 } else { 0.0 };
        let kaiser =
            |tracer: &Tracer, mu: f64| growth * (density * tracer.bias + rsd * rate * mu * mu);

        let rule = GaussLegendre::get((l1 + l2 + 8) / 2 + 1);
        let angular = |tracers: &[&Tracer]| {
            rule.integrate(-1.0, 1.0, |mu| {
                let product: f64 = tracers.iter().map(|&tracer| kaiser(tracer, mu)).product();
                legendre(l1, mu) * legendre(l2, mu) * product
            })
        };
        // (ad)(bc) exchanges the ends of the second separation
        let crossed = if l2 % 2 == 0 { 1.0 } else { -1.0 };
        let prefactor = (2 * l1 + 1) as f64 * (2 * l2 + 1) as f64 / (2.0 * volume);

        let mut value = 0.0;
        if terms.cosmic {
            let direct = KernelSpectra::Product(pair(&a, &c), pair(&b, &d));
            let exchanged = KernelSpectra::Product(pair(&a, &d), pair(&b, &c));
            let direct = self.kernel(direct, l1, r1, l2, r2)?;
            let exchanged = self.kernel(exchanged, l1, r1, l2, r2)?;
            let mu_integral = angular(&[&a, &b, &c, &d]);
            value += phase * prefactor * mu_integral * (direct + crossed * exchanged);
        }

        if terms.mixed {
            // (spectrum pair, shot noise pair, sign)
            let pairings = [
                (&a, &c, &b, &d, 1.0),
                (&b, &d, &a, &c, 1.0),
                (&a, &d, &b, &c, crossed),
                (&b, &c, &a, &d, crossed),
            ];
            for (x, y, u, v, sign) in pairings {
                if u.population != v.population {
                    continue;
                }
                let kernel = self.kernel(KernelSpectra::Single(pair(x, y)), l1, r1, l2, r2)?;
                value += phase * prefactor * sign * angular(&[x, y]) * kernel / u.number_density;
            }
        }

        if terms.poisson && l1 == l2 && approx_equal(r1, r2, SEPARATION_EQUALITY, 0.0) {
            let mut shot = 0.0;
            if a.population == c.population && b.population == d.population {
                shot += 1.0;
            }
            if a.population == d.population && b.population == c.population {
                shot += crossed;
            }
            let pixel = covariance.pixelsize[bin];
            value += (2 * l1 + 1) as f64 * shot
                / (a.number_density * b.number_density)
                / (4.0 * PI * volume * r1 * r1 * pixel);
        }

        Ok(value)
    }

    fn tracer(&self, population: usize, bin: usize, z: f64) -> Result<Tracer> {
        let entry = self.context.parameters.population(population)?;
        let number_density = *entry.number_density.get(bin).ok_or_else(|| {
            Error::InvalidInput(format!(
                "population {population} has no number density for bin {bin}"
            ))
        })?;
        Ok(Tracer {
            population,
            bias: entry.galaxy_bias.evaluate(z)?,
            number_density,
        })
    }

    fn kernel(
        &self,
        spectra: KernelSpectra,
        l1: usize,
        r1: f64,
        l2: usize,
        r2: f64,
    ) -> Result<f64> {
        let context = &self.context;
        context
            .integrals
            .covariance_kernel(context.spectrum, &context.settings, spectra, l1, r1, l2, r2)
    }

    /// The covariance over bins x l1 x r1 x l2 x r2, r2 running fastest.
    /// With `rstep`, only separations that are multiples of it are kept,
    /// which may leave nothing to compute.
    pub fn compute_bulk(&self, rstep: Option<f64>) -> Result<Vec<CovarianceEntry>> {
        let parameters = self.context.parameters;
        if parameters.contributions.is_empty() {
            return Err(Error::NoContributions);
        }
        check_grid("redshift", &parameters.covariance.z_mean)?;
        check_grid("separation", &parameters.separations)?;
        check_grid("multipole", &parameters.multipoles)?;

        let separations: Vec<f64> = match rstep {
            Some(rstep) => {
                check_rstep(rstep)?;
                parameters
                    .separations
                    .iter()
                    .copied()
                    .filter(|&r| is_multiple(r, rstep))
                    .collect()
            }
            None => parameters.separations.clone(),
        };

        let start = Instant::now();
        let multipoles = &parameters.multipoles;
        let points: Vec<(usize, usize, f64, usize, f64)> = iproduct!(
            0..parameters.covariance.bins(),
            multipoles,
            &separations,
            multipoles,
            &separations
        )
        .map(|(bin, &l1, &r1, &l2, &r2)| (bin, l1, r1, l2, r2))
        .collect();

        let entries = points
            .par_iter()
            .map(|&(bin, l1, r1, l2, r2)| {
                Ok(CovarianceEntry {
                    l1,
                    r1,
                    l2,
                    r2,
                    z: parameters.covariance.z_mean[bin],
                    value: self.covariance(l1, r1, l2, r2, bin)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            "Computed {} covariance entries in {:?}",
            entries.len(),
            start.elapsed()
        );
        Ok(entries)
    }
}

fn pair(x: &Tracer, y: &Tracer) -> PopulationPair {
    PopulationPair::new(x.population, y.population)
}

fn check_bin(bin: usize, bins: usize) -> Result<()> {
    if bin >= bins {
        return Err(Error::InvalidInput(format!(
            "covariance bin {bin} requested but only {bins} are defined"
        )));
    }
    Ok(())
}

fn check_rstep(rstep: f64) -> Result<()> {
    if !(rstep > 0.0) || !rstep.is_finite() {
        return Err(Error::InvalidInput(format!("rstep must be positive, got {rstep}")));
    }
    Ok(())
}

fn is_multiple(r: f64, rstep: f64) -> bool {
    let ratio = (r / rstep).round();
    ratio >= 1.0 && approx_equal(r, ratio * rstep, 1e-8, 0.0)
}

/// Keeps the entries whose two separations are both multiples of `rstep`.
pub fn filter_rstep(entries: &[CovarianceEntry], rstep: f64) -> Result<Vec<CovarianceEntry>> {
    check_rstep(rstep)?;
    Ok(entries
        .iter()
        .filter(|entry| is_multiple(entry.r1, rstep) && is_multiple(entry.r2, rstep))
        .copied()
        .collect())
}

/// Reshapes the entries of one redshift bin, as ordered by `compute_bulk`,
/// into the square matrix indexed by (l, r) pairs. No entries give an
/// empty matrix.
pub fn covariance_matrix(entries: &[CovarianceEntry]) -> Result<Array2<f64>> {
    if entries.is_empty() {
        return Ok(Array2::zeros((0, 0)));
    }
    let z = entries[0].z;
    if entries.iter().any(|entry| entry.z != z) {
        return Err(Error::InvalidInput(String::from(
            "a covariance matrix is only defined for a single redshift bin",
        )));
    }

    let size = (entries.len() as f64).sqrt().round() as usize;
    if size * size != entries.len() {
        return Err(Error::InvalidInput(format!(
            "{} entries do not form a square matrix",
            entries.len()
        )));
    }

    // The column labels of the first row fix the grid of both axes
    let labels: Vec<(usize, f64)> =
        entries[..size].iter().map(|entry| (entry.l2, entry.r2)).collect();
    let mut matrix = Array2::zeros((size, size));
    for (index, entry) in entries.iter().enumerate() {
        let (row, column) = (index / size, index % size);
        if (entry.l1, entry.r1) != labels[row] || (entry.l2, entry.r2) != labels[column] {
            return Err(Error::InvalidInput(String::from(
                "covariance entries are not laid out on the same (l, r) grid on both axes",
            )));
        }
        matrix[[row, column]] = entry.value;
    }
    Ok(matrix)
}

/// A covariance matrix with the checks callers usually want.
#[derive(Debug, Clone, PartialEq)]
pub struct CovarianceMatrix {
    pub matrix: Array2<f64>,
}

impl CovarianceMatrix {
    pub fn from_entries(entries: &[CovarianceEntry]) -> Result<Self> {
        Ok(CovarianceMatrix {
            matrix: covariance_matrix(entries)?,
        })
    }

    pub fn size(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn is_symmetric(&self, rel_tol: f64) -> bool {
        let n = self.size();
        (0..n).all(|i| {
            (0..i).all(|j| {
                let (a, b) = (self.matrix[[i, j]], self.matrix[[j, i]]);
                (a - b).abs() <= rel_tol * a.abs().max(b.abs())
            })
        })
    }

    /// Smallest eigenvalue of the symmetric part, None for an empty matrix.
    pub fn min_eigenvalue(&self) -> Option<f64> {
        let n = self.size();
        if n == 0 {
            return None;
        }
        let symmetric = DMatrix::<f64>::from_fn(n, n, |i, j| {
            0.5 * (self.matrix[[i, j]] + self.matrix[[j, i]])
        });
        let eigen = symmetric.symmetric_eigen();
        eigen.eigenvalues.iter().copied().reduce(f64::min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CorrelationEngine;
    use crate::parameters::{CovarianceTerms, Parameters, Population};
    use crate::transfer::NoWiggleSpectrum;

    fn survey() -> Parameters {
        let mut parameters = Parameters::default();
        parameters.separations = (1..=6).map(|i| 75.0 * i as f64).collect();
        parameters.multipoles = vec![0, 2, 4];
        parameters.covariance.pixelsize = vec![75.0];
        parameters
    }

    fn engine(parameters: Parameters) -> CorrelationEngine {
        let spectrum = NoWiggleSpectrum::new(&parameters, 0.8, 0.96)
            .unwrap()
            .table(1e-4, 2.0, 512)
            .unwrap();
        CorrelationEngine::new(parameters, spectrum).unwrap()
    }

    #[test]
    fn test_covariance_is_symmetric_and_positive_definite() {
        let engine = engine(survey());
        let entries = engine.compute_covariance_bulk(None).unwrap();
        assert_eq!(entries.len(), 18 * 18);

        let matrix = CovarianceMatrix::from_entries(&entries).unwrap();
        assert_eq!(matrix.size(), 18);
        assert!(matrix.is_symmetric(1e-10));
        let smallest = matrix.min_eigenvalue().unwrap();
        assert!(smallest > 0.0, "smallest eigenvalue {smallest}");
    }

    #[test]
    fn test_covariance_terms() {
        let mut parameters = survey();
        parameters.covariance.terms = CovarianceTerms {
            cosmic: false,
            mixed: false,
            poisson: false,
        };
        let engine = engine(parameters.clone());
        let entries = engine.compute_covariance_bulk(None).unwrap();
        assert!(entries.iter().all(|entry| entry.value == 0.0));

        parameters.covariance.terms.poisson = true;
        let engine = self::engine(parameters);
        let matrix = covariance_matrix(&engine.compute_covariance_bulk(None).unwrap()).unwrap();
        for i in 0..matrix.nrows() {
            assert!(matrix[[i, i]] > 0.0);
            for j in 0..matrix.ncols() {
                if i != j {
                    assert_eq!(matrix[[i, j]], 0.0);
                }
            }
        }
    }

    #[test]
    fn test_distinct_populations_decouple() {
        let mut parameters = survey();
        parameters.populations = (0..4)
            .map(|i| Population::constant(1.0 + 0.2 * i as f64, 0.0, 0.0, 15.0))
            .collect();
        parameters.covariance.populations = [0, 1, 2, 3];
        parameters.covariance.terms = CovarianceTerms {
            cosmic: false,
            mixed: true,
            poisson: true,
        };
        let engine = engine(parameters);
        let entries = engine.compute_covariance_bulk(None).unwrap();
        assert!(entries.iter().all(|entry| entry.value == 0.0));
    }

    #[test]
    fn test_rstep_filtering() {
        let engine = engine(survey());
        assert!(engine.compute_covariance_bulk(Some(111.0)).unwrap().is_empty());
        assert_eq!(covariance_matrix(&[]).unwrap().len(), 0);

        let entries = engine.compute_covariance_bulk(Some(150.0)).unwrap();
        // 150, 300 and 450 survive for each of the three multipoles
        assert_eq!(entries.len(), 81);
        assert_eq!(filter_rstep(&entries, 150.0).unwrap().len(), 81);
        assert_eq!(filter_rstep(&entries, 300.0).unwrap().len(), 9);
        assert!(filter_rstep(&entries, -1.0).is_err());
    }

    #[test]
    fn test_covariance_errors() {
        let mut parameters = survey();
        parameters.contributions.clear();
        let empty = engine(parameters);
        assert!(matches!(empty.covariance(0, 75.0, 0, 75.0, 0), Err(Error::NoContributions)));

        let engine = engine(survey());
        assert!(matches!(engine.covariance(0, 75.0, 0, 75.0, 3), Err(Error::InvalidInput(_))));
        // Odd l1 - l2 vanish
        assert_eq!(engine.covariance(0, 75.0, 1, 75.0, 0).unwrap(), 0.0);

        let matrix = covariance_matrix(&[CovarianceEntry {
            l1: 0,
            r1: 1.0,
            l2: 0,
            r2: 1.0,
            z: 1.0,
            value: 1.0,
        }; 2]);
        assert!(matrix.is_err());
    }

    #[test]
    fn test_covariance_bulk_needs_every_grid() {
        let mut parameters = survey();
        let covariance = &mut parameters.covariance;
        covariance.z_mean.clear();
        covariance.deltaz.clear();
        covariance.fsky.clear();
        covariance.pixelsize.clear();
        parameters.populations[0].number_density.clear();
        let no_bins = engine(parameters);
        assert!(matches!(
            no_bins.compute_covariance_bulk(None),
            Err(Error::EmptyGrid("redshift"))
        ));

        let mut parameters = survey();
        parameters.separations.clear();
        let no_separations = engine(parameters);
        assert!(matches!(
            no_separations.compute_covariance_bulk(None),
            Err(Error::EmptyGrid("separation"))
        ));

        let mut parameters = survey();
        parameters.multipoles.clear();
        let no_multipoles = engine(parameters);
        assert!(matches!(
            no_multipoles.compute_covariance_bulk(Some(75.0)),
            Err(Error::EmptyGrid("multipole"))
        ));
    }
}
