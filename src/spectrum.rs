use crate::error::{Error, Result};
use crate::utils::{is_strictly_increasing, spline::CubicSpline};
use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;

/// What to do when a wavenumber outside the tabulated range is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Extrapolation {
    /// Out of range requests fail with `OutOfRange`.
    #[default]
    None,
    /// The spectrum vanishes outside the table.
    Zero,
    /// Log-log continuation with the slope at the end of the table.
    PowerLaw,
}

/// A single tabulated spectrum.
///
/// Interpolation is cubic in (ln k, ln P). Tables containing zeros cannot be
/// taken to log, they are interpolated cubically in (ln k, P) instead.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledSpectrum {
    spline: CubicSpline,
    logarithmic: bool,
    k_min: f64,
    k_max: f64,
}

impl SampledSpectrum {
    pub fn new(k: &[f64], p: &[f64]) -> Result<Self> {
        if k.len() != p.len() {
            return Err(Error::InvalidInput(format!(
                "power spectrum has {} wavenumbers but {} values",
                k.len(),
                p.len()
            )));
        }
        if k.len() < 2 {
            return Err(Error::InvalidInput(String::from(
                "power spectrum needs at least two samples",
            )));
        }
        if k.iter().any(|&ki| !(ki > 0.0) || !ki.is_finite()) {
            return Err(Error::InvalidInput(String::from(
                "power spectrum wavenumbers must be positive and finite",
            )));
        }
        if !is_strictly_increasing(k) {
            return Err(Error::InvalidInput(String::from(
                "power spectrum wavenumbers must be strictly increasing",
            )));
        }
        if p.iter().any(|&pi| !(pi >= 0.0) || !pi.is_finite()) {
            return Err(Error::InvalidInput(String::from(
                "power spectrum values must be non-negative and finite",
            )));
        }

        let ln_k: Vec<f64> = k.iter().map(|v| v.ln()).collect();
        let logarithmic = p.iter().all(|&pi| pi > 0.0);
        let values: Vec<f64> = if logarithmic {
            p.iter().map(|v| v.ln()).collect()
        } else {
            p.to_vec()
        };

        Ok(SampledSpectrum {
            spline: CubicSpline::new(ln_k, values)?,
            logarithmic,
            k_min: k[0],
            k_max: k[k.len() - 1],
        })
    }

    pub fn k_min(&self) -> f64 {
        self.k_min
    }

    pub fn k_max(&self) -> f64 {
        self.k_max
    }

    pub fn evaluate(&self, k: f64, extrapolation: Extrapolation) -> Result<f64> {
        if k >= self.k_min && k <= self.k_max {
            return Ok(self.interpolate(k.ln()));
        }
        if !(k > 0.0) {
            return Err(Error::out_of_range("power spectrum", k, self.k_min, self.k_max));
        }

        match extrapolation {
            Extrapolation::None => Err(Error::out_of_range(
                "power spectrum",
                k,
                self.k_min,
                self.k_max,
            )),
            Extrapolation::Zero => Ok(0.0),
            Extrapolation::PowerLaw => {
                let edge = if k < self.k_min { self.k_min } else { self.k_max };
                let ln_edge = edge.ln();
                let p_edge = self.interpolate(ln_edge);
                if p_edge <= 0.0 {
                    return Ok(0.0);
                }
                let slope = if self.logarithmic {
                    self.spline.derivative(ln_edge)
                } else {
                    self.spline.derivative(ln_edge) / p_edge
                };
                Ok(p_edge * (k / edge).powf(slope))
            }
        }
    }

    /// Evaluation inside the table, no range checks.
    fn interpolate(&self, ln_k: f64) -> f64 {
        let value = self.spline.eval(ln_k);
        if self.logarithmic {
            value.exp()
        } else {
            value.max(0.0)
        }
    }
}

/// The linear matter power spectrum, with optional per-population tables for
/// cross-correlating tracers that see different spectra.
///
/// Every mutation bumps `version`, which keys every cache derived from the table.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerSpectrumTable {
    matter: SampledSpectrum,
    populations: HashMap<usize, SampledSpectrum>,
    extrapolation: Extrapolation,
    version: u64,
}

impl PowerSpectrumTable {
    pub fn new(k: &[f64], p: &[f64]) -> Result<Self> {
        Ok(PowerSpectrumTable {
            matter: SampledSpectrum::new(k, p)?,
            populations: HashMap::new(),
            extrapolation: Extrapolation::default(),
            version: 0,
        })
    }

    /// Replaces the matter spectrum. Population tables are kept.
    /// On error the table is left untouched.
    pub fn set(&mut self, k: &[f64], p: &[f64]) -> Result<()> {
        self.matter = SampledSpectrum::new(k, p)?;
        self.version += 1;
        Ok(())
    }

    /// Installs a separate spectrum for one galaxy population.
    pub fn set_population(&mut self, population: usize, k: &[f64], p: &[f64]) -> Result<()> {
        let table = SampledSpectrum::new(k, p)?;
        self.populations.insert(population, table);
        self.version += 1;
        Ok(())
    }

    pub fn set_extrapolation(&mut self, extrapolation: Extrapolation) {
        if extrapolation != self.extrapolation {
            self.extrapolation = extrapolation;
            self.version += 1;
        }
    }

    pub fn extrapolation(&self) -> Extrapolation {
        self.extrapolation
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// The matter power spectrum at `k`.
    pub fn evaluate(&self, k: f64) -> Result<f64> {
        self.matter.evaluate(k, self.extrapolation)
    }

    /// The spectrum seen by one population, falling back to the matter spectrum.
    pub fn evaluate_population(&self, k: f64, population: usize) -> Result<f64> {
        self.table(population).evaluate(k, self.extrapolation)
    }

    /// Cross spectrum of two populations, sqrt(P_i P_j).
    pub fn cross_spectrum(&self, k: f64, i: usize, j: usize) -> Result<f64> {
        // Populations without a table of their own share the matter one
        if i == j || std::ptr::eq(self.table(i), self.table(j)) {
            return self.evaluate_population(k, i);
        }
        let p_i = self.evaluate_population(k, i)?;
        let p_j = self.evaluate_population(k, j)?;
        Ok((p_i * p_j).sqrt())
    }

    /// The wavenumber range over which both populations are tabulated.
    pub fn domain(&self, i: usize, j: usize) -> (f64, f64) {
        let (a, b) = (self.table(i), self.table(j));
        (a.k_min().max(b.k_min()), a.k_max().min(b.k_max()))
    }

    pub fn k_min(&self) -> f64 {
        self.matter.k_min()
    }

    pub fn k_max(&self) -> f64 {
        self.matter.k_max()
    }

    fn table(&self, population: usize) -> &SampledSpectrum {
        self.populations.get(&population).unwrap_or(&self.matter)
    }
}

#[cfg(test)]
fn test_table() -> (Vec<f64>, Vec<f64>) {
    let k = crate::utils::logspace(1e-4, 10.0, 300);
    let p = k
        .iter()
        .map(|k| 2e4 * k / (1.0 + (k / 0.02).powi(2)).powf(1.3))
        .collect();
    (k, p)
}

#[test]
fn test_spectrum_identity_at_nodes() {
    let (k, p) = test_table();
    let table = PowerSpectrumTable::new(&k, &p).unwrap();
    for (ki, pi) in k.iter().zip(&p) {
        let value = table.evaluate(*ki).unwrap();
        assert!((value / pi - 1.0).abs() < 1e-12);
    }
}

#[test]
fn test_spectrum_interpolates_power_law_exactly() {
    let k = crate::utils::logspace(1e-3, 1.0, 20);
    let p: Vec<f64> = k.iter().map(|k| 3.0 * k.powf(-1.5)).collect();
    let table = PowerSpectrumTable::new(&k, &p).unwrap();
    let value = table.evaluate(0.0123).unwrap();
    assert!((value / (3.0 * 0.0123_f64.powf(-1.5)) - 1.0).abs() < 1e-12);
}

#[test]
fn test_spectrum_rejects_malformed_tables() {
    assert!(matches!(
        PowerSpectrumTable::new(&[0.1, 0.2], &[1.0]),
        Err(Error::InvalidInput(_))
    ));
    assert!(matches!(
        PowerSpectrumTable::new(&[0.2, 0.1], &[1.0, 1.0]),
        Err(Error::InvalidInput(_))
    ));
    assert!(matches!(
        PowerSpectrumTable::new(&[0.0, 0.1], &[1.0, 1.0]),
        Err(Error::InvalidInput(_))
    ));
    assert!(matches!(
        PowerSpectrumTable::new(&[0.1, 0.2], &[1.0, -1.0]),
        Err(Error::InvalidInput(_))
    ));
}

#[test]
fn test_spectrum_extrapolation_modes() {
    let k = crate::utils::logspace(1e-3, 1.0, 20);
    let p: Vec<f64> = k.iter().map(|k| k.powi(-2)).collect();
    let mut table = PowerSpectrumTable::new(&k, &p).unwrap();

    assert!(matches!(
        table.evaluate(2.0),
        Err(Error::OutOfRange { .. })
    ));

    table.set_extrapolation(Extrapolation::Zero);
    assert_eq!(table.evaluate(2.0).unwrap(), 0.0);

    table.set_extrapolation(Extrapolation::PowerLaw);
    assert!((table.evaluate(2.0).unwrap() / 0.25 - 1.0).abs() < 1e-6);
    assert!((table.evaluate(1e-4).unwrap() / 1e8 - 1.0).abs() < 1e-6);
}

#[test]
fn test_spectrum_versions_and_populations() {
    let (k, p) = test_table();
    let mut table = PowerSpectrumTable::new(&k, &p).unwrap();
    assert_eq!(table.version(), 0);

    let doubled: Vec<f64> = p.iter().map(|v| 4.0 * v).collect();
    table.set_population(1, &k, &doubled).unwrap();
    assert_eq!(table.version(), 1);

    for ki in k.iter().step_by(17) {
        let p0 = table.evaluate(*ki).unwrap();
        assert!((table.cross_spectrum(*ki, 0, 0).unwrap() - p0).abs() <= 1e-12 * p0);
        assert!((table.cross_spectrum(*ki, 0, 1).unwrap() / (2.0 * p0) - 1.0).abs() < 1e-12);
        assert!((table.cross_spectrum(*ki, 1, 1).unwrap() / (4.0 * p0) - 1.0).abs() < 1e-12);
    }

    // A failed update leaves the table and its version alone
    assert!(table.set(&[1.0], &[1.0]).is_err());
    assert_eq!(table.version(), 1);
}

#[test]
fn test_spectrum_with_zeros_stays_non_negative() {
    let k = vec![0.1, 0.2, 0.3, 0.4, 0.5];
    let p = vec![0.0, 1.0, 0.0, 1.0, 0.0];
    let table = PowerSpectrumTable::new(&k, &p).unwrap();
    assert_eq!(table.evaluate(0.2).unwrap(), 1.0);
    assert!(table.evaluate(0.25).unwrap() >= 0.0);
}

#[test]
fn test_cross_spectrum_of_shared_tables_is_the_table() {
    let (k, p) = test_table();
    let mut table = PowerSpectrumTable::new(&k, &p).unwrap();
    // Neither population has its own table
    for ki in k.iter().step_by(23) {
        assert_eq!(table.cross_spectrum(*ki, 0, 3).unwrap(), table.evaluate(*ki).unwrap());
    }

    // Equal but separate tables go through sqrt(P_i P_j)
    table.set_population(2, &k, &p).unwrap();
    for ki in k.iter().step_by(23) {
        let p0 = table.evaluate(*ki).unwrap();
        assert!((table.cross_spectrum(*ki, 0, 2).unwrap() / p0 - 1.0).abs() < 1e-12);
    }
}
