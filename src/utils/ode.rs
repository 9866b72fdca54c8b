use crate::error::{Error, Result};

// Dormand-Prince 5(4) tableau
const C: [f64; 7] = [0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0];
const A: [[f64; 6]; 7] = [
    [0.0; 6],
    [1.0 / 5.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [3.0 / 40.0, 9.0 / 40.0, 0.0, 0.0, 0.0, 0.0],
    [44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0, 0.0, 0.0, 0.0],
    [19372.0 / 6561.0, -25360.0 / 2187.0, 64448.0 / 6561.0, -212.0 / 729.0, 0.0, 0.0],
    [9017.0 / 3168.0, -355.0 / 33.0, 46732.0 / 5247.0, 49.0 / 176.0, -5103.0 / 18656.0, 0.0],
    [35.0 / 384.0, 0.0, 500.0 / 1113.0, 125.0 / 192.0, -2187.0 / 6784.0, 11.0 / 84.0],
];
/// Difference between the fifth and fourth order weights.
const E: [f64; 7] = [
    71.0 / 57600.0,
    0.0,
    -71.0 / 16695.0,
    71.0 / 1920.0,
    -17253.0 / 339200.0,
    22.0 / 525.0,
    -1.0 / 40.0,
];

/// Adaptive Dormand-Prince integrator for small systems y' = f(t, y).
#[derive(Debug, Clone, Copy)]
pub struct DormandPrince {
    pub rtol: f64,
    pub atol: f64,
    pub max_steps: usize,
}

impl Default for DormandPrince {
    fn default() -> Self {
        DormandPrince {
            rtol: 1e-8,
            atol: 1e-12,
            max_steps: 100_000,
        }
    }
}

impl DormandPrince {
    pub fn new(rtol: f64, atol: f64) -> Self {
        DormandPrince {
            rtol,
            atol,
            ..Default::default()
        }
    }

    /// Integrates from (t0, y0) and records the state at every point of `outputs`,
    /// which must be non-decreasing and not below `t0`.
    pub fn solve<const N: usize, F>(
        &self,
        f: F,
        t0: f64,
        y0: [f64; N],
        outputs: &[f64],
    ) -> Result<Vec<[f64; N]>>
    where
        F: Fn(f64, &[f64; N]) -> [f64; N],
    {
        if outputs.iter().any(|t| !t.is_finite())
            || outputs.windows(2).any(|w| w[1] < w[0])
            || outputs.first().map_or(false, |&t| t < t0)
        {
            return Err(Error::InvalidInput(String::from(
                "ode output points must be finite, sorted and after the initial point",
            )));
        }

        let span = outputs.last().map_or(0.0, |&t| t - t0);
        let mut h = (span * 1e-3).max(1e-6);
        let mut t = t0;
        let mut y = y0;
        let mut steps = 0;
        let mut result = Vec::with_capacity(outputs.len());

        for &target in outputs {
            while t < target {
                if steps >= self.max_steps {
                    return Err(Error::Integration {
                        what: format!("ode up to t = {target}"),
                        error: f64::NAN,
                    });
                }
                steps += 1;

                let step = h.min(target - t);
                let (y_new, error) = self.step(&f, t, &y, step);
                if error <= 1.0 {
                    t = if step == target - t { target } else { t + step };
                    y = y_new;
                }

                // Standard step size controller with safety factor 0.9
                let factor = if error == 0.0 {
                    5.0
                } else {
                    (0.9 * error.powf(-0.2)).clamp(0.2, 5.0)
                };
                h = step * factor;
                if h < 1e-14 * t.abs().max(1.0) {
                    return Err(Error::Integration {
                        what: format!("ode step size underflow at t = {t}"),
                        error,
                    });
                }
            }
            result.push(y);
        }

        Ok(result)
    }

    /// Single trial step, returning the new state and the scaled error norm.
    fn step<const N: usize, F>(&self, f: &F, t: f64, y: &[f64; N], h: f64) -> ([f64; N], f64)
    where
        F: Fn(f64, &[f64; N]) -> [f64; N],
    {
        let mut k = [[0.0; N]; 7];
        k[0] = f(t, y);
        for stage in 1..7 {
            let mut y_stage = *y;
            for (i, value) in y_stage.iter_mut().enumerate() {
                for j in 0..stage {
                    *value += h * A[stage][j] * k[j][i];
                }
            }
            k[stage] = f(t + C[stage] * h, &y_stage);
        }

        // The last stage is evaluated at the fifth order solution (FSAL)
        let mut y_new = *y;
        for (i, value) in y_new.iter_mut().enumerate() {
            for j in 0..6 {
                *value += h * A[6][j] * k[j][i];
            }
        }

        let mut norm = 0.0;
        for i in 0..N {
            let error: f64 = (0..7).map(|j| h * E[j] * k[j][i]).sum();
            let scale = self.atol + self.rtol * y[i].abs().max(y_new[i].abs());
            norm += (error / scale).powi(2);
        }
        let norm = (norm / N.max(1) as f64).sqrt();
        if norm.is_finite() {
            (y_new, norm)
        } else {
            (y_new, f64::INFINITY)
        }
    }
}

#[test]
fn test_dormand_prince_exponential() {
    let solver = DormandPrince::default();
    let outputs = [0.5, 1.0, 2.0];
    let solution = solver
        .solve(|_, y: &[f64; 1]| [y[0]], 0.0, [1.0], &outputs)
        .unwrap();
    for (t, y) in outputs.iter().zip(solution) {
        assert!((y[0] / t.exp() - 1.0).abs() < 1e-7);
    }
}

#[test]
fn test_dormand_prince_harmonic_oscillator() {
    let solver = DormandPrince::new(1e-9, 1e-12);
    let outputs = [0.0, 1.0, 10.0];
    let solution = solver
        .solve(|_, y: &[f64; 2]| [y[1], -y[0]], 0.0, [0.0, 1.0], &outputs)
        .unwrap();
    assert_eq!(solution[0], [0.0, 1.0]);
    for (t, y) in outputs.iter().zip(solution) {
        assert!((y[0] - t.sin()).abs() < 1e-7);
        assert!((y[1] - t.cos()).abs() < 1e-7);
    }
}

#[test]
fn test_dormand_prince_rejects_unsorted_outputs() {
    let solver = DormandPrince::default();
    let result = solver.solve(|_, y: &[f64; 1]| [y[0]], 0.0, [1.0], &[1.0, 0.5]);
    assert!(matches!(result, Err(Error::InvalidInput(_))));
}
