use crate::constants::MAX_MULTIPOLE;
use crate::corrfunc::{check_grid, CorrelationFunctionAssembler};
use crate::error::{Error, Result};
use crate::utils::gauss::GaussLegendre;
use crate::utils::special::legendre;
use log::info;
use rayon::prelude::*;
use serde_derive::{Deserialize, Serialize};
use std::time::Instant;

/// Order of the redshift quadrature of `redshift_averaged`.
const REDSHIFT_ORDER: usize = 8;

/// One multipole of the correlation function.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MultipoleResult {
    pub l: usize,
    pub r: f64,
    pub z: f64,
    pub value: f64,
}

/// Legendre multipoles xi_l(r) = (2l + 1)/2 int dmu xi(r, mu) P_l(mu),
/// integrated with Gauss-Legendre quadrature of order `numerics.mu_order`.
#[derive(Clone, Copy)]
pub struct MultipoleProjector<'a> {
    assembler: CorrelationFunctionAssembler<'a>,
}

impl<'a> MultipoleProjector<'a> {
    pub fn new(assembler: CorrelationFunctionAssembler<'a>) -> Self {
        MultipoleProjector { assembler }
    }

    pub fn multipole(&self, r: f64, l: usize, z: f64) -> Result<f64> {
        Ok(self.multipoles_at(r, &[l], z)?[0])
    }

    /// Several multipoles at one point, sharing the evaluations of xi.
    pub fn multipoles_at(&self, r: f64, multipoles: &[usize], z: f64) -> Result<Vec<f64>> {
        if self.assembler.context().parameters.contributions.is_empty() {
            return Err(Error::NoContributions);
        }
        if let Some(l) = multipoles.iter().find(|&&l| l > MAX_MULTIPOLE) {
            return Err(Error::InvalidInput(format!(
                "multipoles above {MAX_MULTIPOLE} are not supported, got {l}"
            )));
        }

        let rule = GaussLegendre::get(self.assembler.context().parameters.numerics.mu_order);
        let xi = rule
            .nodes
            .iter()
            .map(|&mu| self.assembler.correlation(r, mu, z))
            .collect::<Result<Vec<f64>>>()?;

        Ok(multipoles
            .iter()
            .map(|&l| {
                let sum: f64 = rule
                    .nodes
                    .iter()
                    .zip(&rule.weights)
                    .zip(&xi)
                    .map(|((&mu, &w), &xi)| w * xi * legendre(l, mu))
                    .sum();
                (2 * l + 1) as f64 / 2.0 * sum
            })
            .collect())
    }

    /// xi_l averaged over the redshift bin [z_min, z_max], each redshift
    /// weighted by its comoving volume chi^2 / H.
    pub fn redshift_averaged(&self, r: f64, l: usize, z_min: f64, z_max: f64) -> Result<f64> {
        if !(z_min >= 0.0 && z_max > z_min) {
            return Err(Error::InvalidInput(format!(
                "invalid redshift bin [{z_min}, {z_max}]"
            )));
        }
        let background = self.assembler.context().background;
        let rule = GaussLegendre::get(REDSHIFT_ORDER);

        let half = 0.5 * (z_max - z_min);
        let mut numerator = 0.0;
        let mut volume = 0.0;
        for (&x, &w) in rule.nodes.iter().zip(&rule.weights) {
            let z = z_min + half * (x + 1.0);
            let chi = background.comoving_distance(z)?;
            let weight = w * chi * chi / background.hubble_rate(z);
            numerator += weight * self.multipole(r, l, z)?;
            volume += weight;
        }
        Ok(numerator / volume)
    }

    /// Multipoles over the z_mean x multipoles x separations grid, in that
    /// order with the separation running fastest.
    pub fn compute_bulk(&self) -> Result<Vec<MultipoleResult>> {
        let parameters = self.assembler.context().parameters;
        if parameters.contributions.is_empty() {
            return Err(Error::NoContributions);
        }
        check_grid("redshift", &parameters.z_mean)?;
        check_grid("separation", &parameters.separations)?;
        check_grid("multipole", &parameters.multipoles)?;

        let start = Instant::now();
        let points: Vec<(f64, f64)> = parameters
            .z_mean
            .iter()
            .flat_map(|&z| parameters.separations.iter().map(move |&r| (z, r)))
            .collect();
        let values = points
            .par_iter()
            .map(|&(z, r)| self.multipoles_at(r, &parameters.multipoles, z))
            .collect::<Result<Vec<_>>>()?;

        // Reorder from (z, r, l) to (z, l, r)
        let nr = parameters.separations.len();
        let mut results = Vec::with_capacity(values.len() * parameters.multipoles.len());
        for (iz, &z) in parameters.z_mean.iter().enumerate() {
            for (il, &l) in parameters.multipoles.iter().enumerate() {
                for (ir, &r) in parameters.separations.iter().enumerate() {
                    results.push(MultipoleResult {
                        l,
                        r,
                        z,
                        value: values[iz * nr + ir][il],
                    });
                }
            }
        }

        info!(
            "Computed {} multipoles in {:?}",
            results.len(),
            start.elapsed()
        );
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CorrelationEngine;
    use crate::parameters::{Contribution, Parameters};
    use crate::transfer::NoWiggleSpectrum;

    fn engine(parameters: Parameters) -> CorrelationEngine {
        let spectrum = NoWiggleSpectrum::new(&parameters, 0.8, 0.96)
            .unwrap()
            .table(1e-4, 5.0, 512)
            .unwrap();
        CorrelationEngine::new(parameters, spectrum).unwrap()
    }

    #[test]
    fn test_kaiser_multipoles() {
        let engine = engine(Parameters::default());
        let background = engine.background().unwrap();
        let z = 1.0;
        let d = background.growth_factor(z).unwrap();
        let f = background.growth_rate(z).unwrap();
        let r = 40.0;

        let kaiser = [
            d * d * (1.0 + 2.0 * f / 3.0 + f * f / 5.0) * engine.integral(0, 0, r).unwrap(),
            0.0,
            -d * d * (4.0 * f / 3.0 + 4.0 * f * f / 7.0) * engine.integral(2, 0, r).unwrap(),
            0.0,
            d * d * 8.0 * f * f / 35.0 * engine.integral(4, 0, r).unwrap(),
        ];
        for (l, &expected) in kaiser.iter().enumerate() {
            let value = engine.multipole(r, l, z).unwrap();
            let scale = kaiser[0].abs().max(expected.abs());
            assert!((value - expected).abs() < 1e-10 * scale, "l = {l}: {value} vs {expected}");
        }
        // A Kaiser correlation is a polynomial of degree 4 in mu
        assert!(engine.multipole(r, 6, z).unwrap().abs() < 1e-10 * kaiser[0].abs());
    }

    #[test]
    fn test_redshift_average_lies_within_bin() {
        // The density monopole falls with redshift, so the average lies between the ends
        let mut parameters = Parameters::default();
        parameters.contributions = [Contribution::Density].into_iter().collect();
        let engine = engine(parameters);

        let low = engine.multipole(50.0, 0, 0.9).unwrap();
        let high = engine.multipole(50.0, 0, 1.1).unwrap();
        let average = engine.redshift_averaged_multipole(50.0, 0, 0.9, 1.1).unwrap();
        assert!(average < low && average > high);
        assert!(engine.redshift_averaged_multipole(50.0, 0, 1.1, 0.9).is_err());
    }

    #[test]
    fn test_multipole_bulk_order_and_errors() {
        let mut parameters = Parameters::default();
        parameters.separations = vec![20.0, 60.0];
        parameters.multipoles = vec![0, 2];
        let engine = engine(parameters);

        let results = engine.compute_multipoles_bulk().unwrap();
        assert_eq!(results.len(), 4);
        let order: Vec<(usize, f64)> = results.iter().map(|result| (result.l, result.r)).collect();
        assert_eq!(order, vec![(0, 20.0), (0, 60.0), (2, 20.0), (2, 60.0)]);
        assert_eq!(results[3].value, engine.multipole(60.0, 2, 1.0).unwrap());

        let mut parameters = Parameters::default();
        parameters.multipoles.clear();
        assert!(matches!(
            self::engine(parameters).compute_multipoles_bulk(),
            Err(Error::EmptyGrid("multipole"))
        ));

        let mut parameters = Parameters::default();
        parameters.contributions.clear();
        let empty = self::engine(parameters);
        assert!(matches!(empty.multipole(10.0, 0, 1.0), Err(Error::NoContributions)));
    }
}
