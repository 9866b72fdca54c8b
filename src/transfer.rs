use crate::constants::THETA_CMB;
use crate::error::{Error, Result};
use crate::parameters::Parameters;
use crate::spectrum::PowerSpectrumTable;
use crate::utils::{logspace, special::top_hat};
use quadrature::double_exponential;
use std::f64::consts::PI;

/// Linear matter power spectrum today from the Eisenstein & Hu (1998)
/// no-wiggle transfer function, P(k) = A k^n_s T(k)^2 with A fixed by sigma_8.
///
/// Wavenumbers in 1/Mpc, P in Mpc^3.
#[derive(Debug, Clone, PartialEq)]
pub struct NoWiggleSpectrum {
    h: f64,
    omega_matter: f64,
    spectral_index: f64,
    sound_horizon: f64,
    alpha_gamma: f64,
    amplitude: f64,
}

impl NoWiggleSpectrum {
    pub fn new(parameters: &Parameters, sigma8: f64, spectral_index: f64) -> Result<Self> {
        parameters.validate()?;
        if !(sigma8 > 0.0) {
            return Err(Error::ParameterRange(format!("sigma8 = {sigma8} must be positive")));
        }

        let h = parameters.h;
        let omega_matter = parameters.omega_matter();
        let om = omega_matter * h * h;
        let ob = parameters.omega_baryon * h * h;
        let baryon_fraction = parameters.omega_baryon / omega_matter;

        let sound_horizon = 44.5 * (9.83 / om).ln() / (1.0 + 10.0 * ob.powf(0.75)).sqrt();
        let alpha_gamma = 1.0 - 0.328 * (431.0 * om).ln() * baryon_fraction
            + 0.38 * (22.3 * om).ln() * baryon_fraction * baryon_fraction;

        let mut spectrum = NoWiggleSpectrum {
            h,
            omega_matter,
            spectral_index,
            sound_horizon,
            alpha_gamma,
            amplitude: 1.0,
        };
        let sigma = spectrum.sigma(8.0 / h)?;
        spectrum.amplitude = (sigma8 / sigma).powi(2);
        Ok(spectrum)
    }

    pub fn transfer(&self, k: f64) -> f64 {
        let gamma = self.omega_matter
            * self.h
            * (self.alpha_gamma
                + (1.0 - self.alpha_gamma) / (1.0 + (0.43 * k * self.sound_horizon).powi(4)));
        let q = k * THETA_CMB * THETA_CMB / (gamma * self.h);
        let l0 = (2.0 * std::f64::consts::E + 1.8 * q).ln();
        let c0 = 14.2 + 731.0 / (1.0 + 62.5 * q);
        l0 / (l0 + c0 * q * q)
    }

    pub fn evaluate(&self, k: f64) -> f64 {
        let t = self.transfer(k);
        self.amplitude * k.powf(self.spectral_index) * t * t
    }

    /// RMS of the linear density in spheres of radius `radius` Mpc.
    pub fn sigma(&self, radius: f64) -> Result<f64> {
        let integrand = |ln_k: f64| {
            let k = ln_k.exp();
            let (t, w) = (self.transfer(k), top_hat(k * radius));
            k.powf(3.0 + self.spectral_index) * t * t * w * w / (2.0 * PI * PI)
        };
        // Without the amplitude, so normalizing does not change the quadrature
        let (ln_k_min, ln_k_max) = ((1e-6_f64).ln(), (1e3_f64).ln());
        let output = double_exponential::integrate(integrand, ln_k_min, ln_k_max, 1e-16);
        if !output.integral.is_finite() || !(output.integral > 0.0) {
            return Err(Error::Integration {
                what: format!("sigma({radius})"),
                error: output.error_estimate,
            });
        }
        Ok((self.amplitude * output.integral).sqrt())
    }

    /// Samples the spectrum on `points` log-spaced wavenumbers.
    pub fn table(&self, k_min: f64, k_max: f64, points: usize) -> Result<PowerSpectrumTable> {
        if !(k_min > 0.0 && k_max > k_min) || points < 2 {
            return Err(Error::InvalidInput(format!(
                "cannot sample {points} wavenumbers on [{k_min}, {k_max}]"
            )));
        }
        let k = logspace(k_min, k_max, points);
        let p: Vec<f64> = k.iter().map(|&k| self.evaluate(k)).collect();
        PowerSpectrumTable::new(&k, &p)
    }
}

#[test]
fn test_no_wiggle_normalization() {
    let parameters = Parameters::default();
    let spectrum = NoWiggleSpectrum::new(&parameters, 0.8, 0.96).unwrap();
    let sigma8 = spectrum.sigma(8.0 / parameters.h).unwrap();
    assert!((sigma8 - 0.8).abs() < 1e-6);

    // T -> 1 on large scales, and falls off on small ones
    assert!((spectrum.transfer(1e-6) - 1.0).abs() < 1e-3);
    assert!(spectrum.transfer(1.0) < 0.01);

    // The spectrum turns over around k_eq ~ 0.01/Mpc
    let turnover = logspace(1e-4, 1.0, 400)
        .into_iter()
        .max_by(|a, b| spectrum.evaluate(*a).total_cmp(&spectrum.evaluate(*b)))
        .unwrap();
    assert!(turnover > 5e-3 && turnover < 5e-2, "{turnover}");

    assert!(NoWiggleSpectrum::new(&parameters, 0.0, 0.96).is_err());
}
