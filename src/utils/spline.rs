use crate::error::{Error, Result};
use crate::utils::is_strictly_increasing;

/// A natural cubic spline through a set of nodes. The interpolant passes
/// exactly through every node and has a continuous second derivative.
#[derive(Debug, Clone, PartialEq)]
pub struct CubicSpline {
    x: Vec<f64>,
    y: Vec<f64>,
    /// Second derivatives at the nodes
    y2: Vec<f64>,
}

impl CubicSpline {
    /// Builds the spline. Needs at least two nodes with strictly increasing `x`.
    pub fn new(x: Vec<f64>, y: Vec<f64>) -> Result<Self> {
        if x.len() != y.len() {
            return Err(Error::InvalidInput(format!(
                "spline abscissa and ordinate differ in length ({} vs {})",
                x.len(),
                y.len()
            )));
        }
        if x.len() < 2 {
            return Err(Error::InvalidInput(String::from(
                "a spline needs at least two nodes",
            )));
        }
        if !is_strictly_increasing(&x) {
            return Err(Error::InvalidInput(String::from(
                "spline abscissa must be strictly increasing",
            )));
        }
        if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
            return Err(Error::InvalidInput(String::from(
                "spline nodes must be finite",
            )));
        }

        let y2 = second_derivatives(&x, &y);
        Ok(CubicSpline { x, y, y2 })
    }

    pub fn min_x(&self) -> f64 {
        self.x[0]
    }

    pub fn max_x(&self) -> f64 {
        self.x[self.x.len() - 1]
    }

    pub fn nodes(&self) -> (&[f64], &[f64]) {
        (&self.x, &self.y)
    }

    /// Whether `x` lies inside the tabulated domain.
    pub fn contains(&self, x: f64) -> bool {
        x >= self.min_x() && x <= self.max_x()
    }

    /// Evaluates the spline. Outside the domain the end cubics are continued,
    /// callers that care must check `contains` first.
    pub fn eval(&self, x: f64) -> f64 {
        let (lo, hi) = self.bracket(x);
        let h = self.x[hi] - self.x[lo];
        let a = (self.x[hi] - x) / h;
        let b = (x - self.x[lo]) / h;

        a * self.y[lo]
            + b * self.y[hi]
            + ((a * a * a - a) * self.y2[lo] + (b * b * b - b) * self.y2[hi]) * h * h / 6.0
    }

    /// First derivative of the interpolant.
    pub fn derivative(&self, x: f64) -> f64 {
        let (lo, hi) = self.bracket(x);
        let h = self.x[hi] - self.x[lo];
        let a = (self.x[hi] - x) / h;
        let b = (x - self.x[lo]) / h;

        (self.y[hi] - self.y[lo]) / h
            - (3.0 * a * a - 1.0) / 6.0 * h * self.y2[lo]
            + (3.0 * b * b - 1.0) / 6.0 * h * self.y2[hi]
    }

    /// Index pair of the interval containing `x` (clamped to the end intervals).
    fn bracket(&self, x: f64) -> (usize, usize) {
        let n = self.x.len();
        let hi = self.x.partition_point(|&node| node < x).clamp(1, n - 1);
        (hi - 1, hi)
    }
}

/// Solves the tridiagonal system for the second derivatives of a natural spline.
fn second_derivatives(x: &[f64], y: &[f64]) -> Vec<f64> {
    let n = x.len();
    let mut y2 = vec![0.0; n];
    let mut u = vec![0.0; n];

    for i in 1..n - 1 {
        let sig = (x[i] - x[i - 1]) / (x[i + 1] - x[i - 1]);
        let p = sig * y2[i - 1] + 2.0;
        y2[i] = (sig - 1.0) / p;
        let slope_diff =
            (y[i + 1] - y[i]) / (x[i + 1] - x[i]) - (y[i] - y[i - 1]) / (x[i] - x[i - 1]);
        u[i] = (6.0 * slope_diff / (x[i + 1] - x[i - 1]) - sig * u[i - 1]) / p;
    }

    // Natural boundary: vanishing second derivative at both ends
    y2[n - 1] = 0.0;
    for k in (0..n - 1).rev() {
        y2[k] = y2[k] * y2[k + 1] + u[k];
    }
    y2
}

#[test]
fn test_spline_passes_through_nodes() {
    let x: Vec<f64> = (0..20).map(|i| i as f64 * 0.3).collect();
    let y: Vec<f64> = x.iter().map(|v| v.sin()).collect();
    let spline = CubicSpline::new(x.clone(), y.clone()).unwrap();
    for (xi, yi) in x.iter().zip(y) {
        assert!((spline.eval(*xi) - yi).abs() < 1e-14);
    }
}

#[test]
fn test_spline_reproduces_smooth_function() {
    let x: Vec<f64> = (0..200).map(|i| i as f64 * 0.05).collect();
    let y: Vec<f64> = x.iter().map(|v| v.sin()).collect();
    let spline = CubicSpline::new(x, y).unwrap();
    for &t in &[0.512, 2.77, 5.03, 8.91] {
        assert!((spline.eval(t) - t.sin()).abs() < 1e-6);
        assert!((spline.derivative(t) - t.cos()).abs() < 1e-4);
    }
}

#[test]
fn test_spline_is_exact_for_lines() {
    let spline = CubicSpline::new(vec![0.0, 1.0, 3.0, 4.0], vec![1.0, 3.0, 7.0, 9.0]).unwrap();
    assert!((spline.eval(2.0) - 5.0).abs() < 1e-14);
    assert!((spline.derivative(0.5) - 2.0).abs() < 1e-14);
}

#[test]
fn test_spline_rejects_bad_nodes() {
    assert!(CubicSpline::new(vec![0.0, 1.0], vec![1.0]).is_err());
    assert!(CubicSpline::new(vec![0.0], vec![1.0]).is_err());
    assert!(CubicSpline::new(vec![1.0, 0.0], vec![1.0, 2.0]).is_err());
    assert!(CubicSpline::new(vec![0.0, 1.0], vec![f64::NAN, 2.0]).is_err());
}
