pub mod gauss;
pub mod ode;
pub mod oscillatory;
pub mod special;
pub mod spline;

/// `n` points evenly spaced between `start` and `end` (both included).
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => vec![],
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { end } else { start + step * i as f64 })
                .collect()
        }
    }
}

/// `n` points evenly spaced in log between `start` and `end` (both included, both positive).
pub fn logspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    let mut points: Vec<f64> = linspace(start.ln(), end.ln(), n)
        .into_iter()
        .map(f64::exp)
        .collect();

    // Pin the endpoints so they survive the round trip through ln/exp
    if let Some(first) = points.first_mut() {
        *first = start;
    }
    if let Some(last) = points.last_mut() {
        *last = end;
    }
    points
}

/// Checks that every element is strictly larger than the previous one.
pub fn is_strictly_increasing(values: &[f64]) -> bool {
    values.windows(2).all(|pair| pair[0] < pair[1])
}

/// Relative comparison with an absolute floor for values near zero.
pub fn approx_equal(a: f64, b: f64, rel_epsilon: f64, abs_epsilon: f64) -> bool {
    if a != 0.0 && b != 0.0 {
        (a - b).abs() <= rel_epsilon * a.abs().max(b.abs())
    } else {
        (a - b).abs() <= abs_epsilon
    }
}

#[test]
fn test_linspace_endpoints() {
    let points = linspace(0.0, 1.0, 11);
    assert_eq!(points.len(), 11);
    assert_eq!(points[0], 0.0);
    assert_eq!(points[10], 1.0);
    assert!((points[5] - 0.5).abs() < 1e-15);
}

#[test]
fn test_logspace_is_geometric() {
    let points = logspace(1e-3, 1e3, 7);
    assert_eq!(points[0], 1e-3);
    assert_eq!(points[6], 1e3);
    for pair in points.windows(2) {
        assert!((pair[1] / pair[0] - 10.0).abs() < 1e-10);
    }
}

#[test]
fn test_strictly_increasing() {
    assert!(is_strictly_increasing(&[1.0, 2.0, 3.0]));
    assert!(!is_strictly_increasing(&[1.0, 1.0, 3.0]));
    assert!(!is_strictly_increasing(&[3.0, 2.0]));
    assert!(is_strictly_increasing(&[]));
}

#[test]
fn test_approx_equal_uses_absolute_floor_at_zero() {
    assert!(approx_equal(0.0, 1e-12, 5e-4, 1e-10));
    assert!(!approx_equal(0.0, 1e-8, 5e-4, 1e-10));
    assert!(approx_equal(1.0, 1.0001, 5e-4, 1e-10));
    assert!(!approx_equal(1.0, 1.01, 5e-4, 1e-10));
}
