use crate::constants::{GROWTH_INITIAL_REDSHIFT, HUBBLE_UNIT};
use crate::error::{Error, Result};
use crate::parameters::Parameters;
use crate::utils::{linspace, ode::DormandPrince, spline::CubicSpline};
use log::debug;
use std::time::Instant;

/// Homogeneous flat FLRW background with CPL dark energy.
///
/// Distances and growth are integrated once with an adaptive Runge-Kutta
/// solver on nodes uniform in ln(1 + z), then served from splines.
/// Every length is in Mpc and every rate in 1/Mpc.
#[derive(Debug, Clone)]
pub struct BackgroundCosmology {
    h0: f64,
    omega_matter: f64,
    omega_gamma: f64,
    omega_dark_energy: f64,
    w0: f64,
    wa: f64,
    z_max: f64,

    /// Splines in x = ln(1 + z)
    comoving_distance: CubicSpline,
    growth_factor: CubicSpline,
    growth_rate: CubicSpline,
    /// x = ln(1 + z) as a function of comoving distance
    inverse_distance: CubicSpline,
}

impl BackgroundCosmology {
    pub fn new(parameters: &Parameters) -> Result<Self> {
        parameters.validate()?;
        let start = Instant::now();

        let mut background = BackgroundCosmology {
            h0: parameters.h * HUBBLE_UNIT,
            omega_matter: parameters.omega_matter(),
            omega_gamma: parameters.omega_gamma,
            omega_dark_energy: parameters.omega_dark_energy(),
            w0: parameters.w0,
            wa: parameters.wa,
            z_max: parameters.numerics.z_max,
            // Placeholders, replaced below once the ODEs are solved
            comoving_distance: CubicSpline::new(vec![0.0, 1.0], vec![0.0, 0.0])?,
            growth_factor: CubicSpline::new(vec![0.0, 1.0], vec![0.0, 0.0])?,
            growth_rate: CubicSpline::new(vec![0.0, 1.0], vec![0.0, 0.0])?,
            inverse_distance: CubicSpline::new(vec![0.0, 1.0], vec![0.0, 0.0])?,
        };

        let x_max = (1.0 + background.z_max).ln();
        let x_nodes = linspace(0.0, x_max, parameters.numerics.background_bins);
        let solver = DormandPrince::new(1e-10, 1e-14);

        // Step 1: comoving distance, dchi/dx = (1 + z) / H(z)
        let chi: Vec<f64> = solver
            .solve(
                |x, _: &[f64; 1]| {
                    let z = x.exp() - 1.0;
                    [(1.0 + z) / background.hubble_rate(z)]
                },
                0.0,
                [0.0],
                &x_nodes,
            )?
            .into_iter()
            .map(|state| state[0])
            .collect();

        // Step 2: growth, integrated in u = ln a from deep in matter domination
        let u_nodes: Vec<f64> = x_nodes.iter().rev().map(|x| -x).collect();
        let a_initial = 1.0 / (1.0 + GROWTH_INITIAL_REDSHIFT);
        let growth = solver.solve(
            |u, state: &[f64; 2]| {
                let z = (-u).exp() - 1.0;
                let friction = 2.0 + background.hubble_log_derivative(z);
                let source = 1.5 * background.matter_fraction_unchecked(z);
                [state[1], -friction * state[1] + source * state[0]]
            },
            a_initial.ln(),
            [a_initial, a_initial],
            &u_nodes,
        )?;

        // Solutions are in increasing u, i.e. decreasing z
        let today = growth[growth.len() - 1][0];
        if !(today > 0.0) {
            return Err(Error::ParameterRange(String::from(
                "the linear growth factor does not stay positive",
            )));
        }
        let mut growth_factor: Vec<f64> = growth.iter().map(|state| state[0] / today).collect();
        let mut growth_rate: Vec<f64> = growth.iter().map(|state| state[1] / state[0]).collect();
        growth_factor.reverse();
        growth_rate.reverse();

        background.comoving_distance = CubicSpline::new(x_nodes.clone(), chi.clone())?;
        background.growth_factor = CubicSpline::new(x_nodes.clone(), growth_factor)?;
        background.growth_rate = CubicSpline::new(x_nodes.clone(), growth_rate)?;
        background.inverse_distance = CubicSpline::new(chi, x_nodes)?;

        debug!(
            "Tabulated background up to z = {} on {} nodes in {:?}",
            background.z_max,
            parameters.numerics.background_bins,
            start.elapsed()
        );
        Ok(background)
    }

    /// H0 in 1/Mpc.
    pub fn h0(&self) -> f64 {
        self.h0
    }

    pub fn omega_matter(&self) -> f64 {
        self.omega_matter
    }

    pub fn z_max(&self) -> f64 {
        self.z_max
    }

    pub fn scale_factor(&self, z: f64) -> f64 {
        1.0 / (1.0 + z)
    }

    /// Dark energy density relative to today.
    fn dark_energy_evolution(&self, z: f64) -> f64 {
        let a = 1.0 + z;
        a.powf(3.0 * (1.0 + self.w0 + self.wa)) * (-3.0 * self.wa * z / a).exp()
    }

    /// E(z)^2 = H(z)^2 / H0^2
    fn e_squared(&self, z: f64) -> f64 {
        let a = 1.0 + z;
        self.omega_matter * a.powi(3)
            + self.omega_gamma * a.powi(4)
            + self.omega_dark_energy * self.dark_energy_evolution(z)
    }

    /// d ln H / d ln a
    fn hubble_log_derivative(&self, z: f64) -> f64 {
        let a = 1.0 + z;
        let w = self.w0 + self.wa * z / a;
        let de_squared_dz = 3.0 * self.omega_matter * a * a
            + 4.0 * self.omega_gamma * a.powi(3)
            + self.omega_dark_energy * self.dark_energy_evolution(z) * 3.0 * (1.0 + w) / a;
        -a * de_squared_dz / (2.0 * self.e_squared(z))
    }

    fn matter_fraction_unchecked(&self, z: f64) -> f64 {
        self.omega_matter * (1.0 + z).powi(3) / self.e_squared(z)
    }

    /// Validates a redshift and maps it to the spline variable ln(1 + z).
    fn node_variable(&self, z: f64) -> Result<f64> {
        if !(z >= 0.0 && z <= self.z_max) {
            return Err(Error::out_of_range("background redshift", z, 0.0, self.z_max));
        }
        Ok(z.ln_1p())
    }

    /// H(z) in 1/Mpc. Analytic, so defined for any z >= 0.
    pub fn hubble_rate(&self, z: f64) -> f64 {
        self.h0 * self.e_squared(z).sqrt()
    }

    /// Conformal Hubble rate a H.
    pub fn conformal_hubble(&self, z: f64) -> f64 {
        self.hubble_rate(z) / (1.0 + z)
    }

    /// Derivative of the conformal Hubble rate with respect to conformal time.
    pub fn conformal_hubble_prime(&self, z: f64) -> f64 {
        let conformal = self.conformal_hubble(z);
        conformal * conformal * (1.0 + self.hubble_log_derivative(z))
    }

    /// Omega_m(z).
    pub fn matter_fraction(&self, z: f64) -> Result<f64> {
        self.node_variable(z)?;
        Ok(self.matter_fraction_unchecked(z))
    }

    pub fn comoving_distance(&self, z: f64) -> Result<f64> {
        let x = self.node_variable(z)?;
        Ok(self.comoving_distance.eval(x))
    }

    /// Linear growth factor D(z), normalized to D(0) = 1.
    pub fn growth_factor(&self, z: f64) -> Result<f64> {
        let x = self.node_variable(z)?;
        Ok(self.growth_factor.eval(x))
    }

    /// f = d ln D / d ln a.
    pub fn growth_rate(&self, z: f64) -> Result<f64> {
        let x = self.node_variable(z)?;
        Ok(self.growth_rate.eval(x))
    }

    /// Inverse of `comoving_distance`.
    pub fn redshift_at_distance(&self, chi: f64) -> Result<f64> {
        let chi_max = self.inverse_distance.max_x();
        if !(chi >= 0.0 && chi <= chi_max) {
            return Err(Error::out_of_range("comoving distance", chi, 0.0, chi_max));
        }
        Ok(self.inverse_distance.eval(chi).exp_m1().max(0.0))
    }

    /// Largest tabulated comoving distance.
    pub fn max_distance(&self) -> f64 {
        self.inverse_distance.max_x()
    }
}

#[cfg(test)]
fn einstein_de_sitter() -> BackgroundCosmology {
    let parameters = Parameters {
        omega_cdm: 1.0,
        omega_baryon: 0.0,
        ..Default::default()
    };
    BackgroundCosmology::new(&parameters).unwrap()
}

#[test]
fn test_background_einstein_de_sitter() {
    let background = einstein_de_sitter();
    let h0 = background.h0();
    for &z in &[0.0, 0.1, 0.5, 1.0, 3.7, 10.0] {
        let chi = 2.0 / h0 * (1.0 - 1.0 / (1.0 + z as f64).sqrt());
        assert!((background.comoving_distance(z).unwrap() - chi).abs() <= 1e-6 * chi + 1e-9);
        assert!((background.growth_factor(z).unwrap() * (1.0 + z) - 1.0).abs() < 1e-5);
        assert!((background.growth_rate(z).unwrap() - 1.0).abs() < 1e-5);
        assert!((background.hubble_rate(z) - h0 * (1.0 + z as f64).powf(1.5)).abs() < 1e-12);
        // Conformal Hubble rate scales as a^-1/2, so H'/H^2 = -1/2
        let conformal = background.conformal_hubble(z);
        assert!((background.conformal_hubble_prime(z) / conformal.powi(2) + 0.5).abs() < 1e-12);
    }
}

#[test]
fn test_background_sanity() {
    let background = BackgroundCosmology::new(&Parameters::default()).unwrap();
    assert_eq!(background.scale_factor(0.0), 1.0);
    assert!((background.growth_factor(0.0).unwrap() - 1.0).abs() < 1e-12);
    assert_eq!(background.comoving_distance(0.0).unwrap(), 0.0);

    let mut previous = -1.0;
    for i in 0..200 {
        let chi = background.comoving_distance(i as f64 * 0.07).unwrap();
        assert!(chi > previous);
        previous = chi;
    }

    // LCDM growth rate today is close to Omega_m^0.55
    let f0 = background.growth_rate(0.0).unwrap();
    assert!((f0 - 0.3_f64.powf(0.55)).abs() < 0.01);
    assert!((background.matter_fraction(0.0).unwrap() - 0.3).abs() < 1e-12);
}

#[test]
fn test_background_inverse_distance() {
    let background = BackgroundCosmology::new(&Parameters::default()).unwrap();
    for &z in &[0.01, 0.3, 1.0, 2.5, 9.0] {
        let chi = background.comoving_distance(z).unwrap();
        assert!((background.redshift_at_distance(chi).unwrap() - z).abs() < 1e-6 * (1.0 + z));
    }
    assert!(matches!(
        background.redshift_at_distance(-1.0),
        Err(Error::OutOfRange { .. })
    ));
}

#[test]
fn test_background_out_of_range() {
    let background = einstein_de_sitter();
    assert!(matches!(
        background.comoving_distance(20.0),
        Err(Error::OutOfRange { .. })
    ));
    assert!(matches!(
        background.growth_factor(-0.5),
        Err(Error::OutOfRange { .. })
    ));
}

#[test]
fn test_background_rejects_inconsistent_parameters() {
    let parameters = Parameters {
        omega_baryon: -0.05,
        ..Default::default()
    };
    assert!(matches!(
        BackgroundCosmology::new(&parameters),
        Err(Error::ParameterRange(_))
    ));
}
