use dashmap::DashMap;
use std::f64::consts::PI;
use std::sync::Arc;

lazy_static! {
    static ref GAUSS_LEGENDRE_RULES: DashMap<usize, Arc<GaussLegendre>> = DashMap::new();
}

/// Nodes and weights of an n-point Gauss-Legendre rule on [-1, 1].
/// Exact for polynomials of degree up to 2n - 1.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussLegendre {
    pub nodes: Vec<f64>,
    pub weights: Vec<f64>,
}

impl GaussLegendre {
    /// Returns the (shared) rule of the given order, computing it on first use.
    pub fn get(order: usize) -> Arc<GaussLegendre> {
        let order = order.max(1);
        GAUSS_LEGENDRE_RULES
            .entry(order)
            .or_insert_with(|| Arc::new(GaussLegendre::compute(order)))
            .clone()
    }

    /// Newton iteration on P_n from the Chebyshev guesses.
    fn compute(order: usize) -> GaussLegendre {
        let n = order;
        let mut nodes = vec![0.0; n];
        let mut weights = vec![0.0; n];

        for i in 0..(n + 1) / 2 {
            let mut x = (PI * (i as f64 + 0.75) / (n as f64 + 0.5)).cos();
            let mut derivative = 1.0;
            for _ in 0..100 {
                let (p, dp) = legendre_with_derivative(n, x);
                derivative = dp;
                let step = p / dp;
                x -= step;
                if step.abs() < 1e-15 {
                    let (_, dp) = legendre_with_derivative(n, x);
                    derivative = dp;
                    break;
                }
            }
            let w = 2.0 / ((1.0 - x * x) * derivative * derivative);
            nodes[i] = -x;
            nodes[n - 1 - i] = x;
            weights[i] = w;
            weights[n - 1 - i] = w;
        }

        GaussLegendre { nodes, weights }
    }

    pub fn order(&self) -> usize {
        self.nodes.len()
    }

    /// Integrates `f` over [a, b].
    pub fn integrate<F: Fn(f64) -> f64>(&self, a: f64, b: f64, f: F) -> f64 {
        let half = 0.5 * (b - a);
        let mid = 0.5 * (b + a);
        self.nodes
            .iter()
            .zip(&self.weights)
            .map(|(x, w)| w * f(mid + half * x))
            .sum::<f64>()
            * half
    }

    /// Fallible version of `integrate`, stopping at the first error.
    pub fn try_integrate<F, E>(&self, a: f64, b: f64, f: F) -> std::result::Result<f64, E>
    where
        F: Fn(f64) -> std::result::Result<f64, E>,
    {
        let half = 0.5 * (b - a);
        let mid = 0.5 * (b + a);
        let mut sum = 0.0;
        for (x, w) in self.nodes.iter().zip(&self.weights) {
            sum += w * f(mid + half * x)?;
        }
        Ok(sum * half)
    }
}

/// P_n(x) and P_n'(x).
fn legendre_with_derivative(n: usize, x: f64) -> (f64, f64) {
    let mut p0 = 1.0;
    let mut p1 = x;
    if n == 0 {
        return (1.0, 0.0);
    }
    for k in 2..=n {
        let p2 = ((2 * k - 1) as f64 * x * p1 - (k - 1) as f64 * p0) / k as f64;
        p0 = p1;
        p1 = p2;
    }
    let dp = n as f64 * (x * p1 - p0) / (x * x - 1.0);
    (p1, dp)
}

#[test]
fn test_gauss_legendre_weights_sum_to_two() {
    for order in [1, 2, 5, 10, 33] {
        let rule = GaussLegendre::get(order);
        assert_eq!(rule.order(), order);
        let total: f64 = rule.weights.iter().sum();
        assert!((total - 2.0).abs() < 1e-13, "order {order}: {total}");
    }
}

#[test]
fn test_gauss_legendre_exact_for_polynomials() {
    let rule = GaussLegendre::get(5);
    // Degree 9 is the largest integrated exactly by 5 points
    let value = rule.integrate(-1.0, 1.0, |x| x.powi(8) + x.powi(9));
    assert!((value - 2.0 / 9.0).abs() < 1e-14);

    let value = rule.integrate(0.0, 2.0, |x| 3.0 * x * x);
    assert!((value - 8.0).abs() < 1e-13);
}

#[test]
fn test_gauss_legendre_known_nodes() {
    let rule = GaussLegendre::get(2);
    assert!((rule.nodes[1] - 1.0 / 3f64.sqrt()).abs() < 1e-15);
    assert!((rule.nodes[0] + rule.nodes[1]).abs() < 1e-15);
    assert!(rule.nodes[0] < rule.nodes[1]);
}

#[test]
fn test_gauss_legendre_try_integrate_propagates() {
    let rule = GaussLegendre::get(4);
    let ok: Result<f64, ()> = rule.try_integrate(0.0, 1.0, |x| Ok(x));
    assert!((ok.unwrap() - 0.5).abs() < 1e-15);
    let err: Result<f64, &str> = rule.try_integrate(0.0, 1.0, |_| Err("bad"));
    assert_eq!(err, Err("bad"));
}
