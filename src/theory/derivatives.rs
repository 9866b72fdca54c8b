//! Derivatives of a radial function G(|R|) along fixed directions.
//!
//! With D = R^-1 d/dR and G_m = D^m G, every Cartesian derivative of G is a
//! polynomial in the projections of R times the G_m. For the Bessel
//! integrals G = I_0^N one has G_m = (-1)^m R^-m I_m^(N - m).

/// Largest total number of directional derivatives supported.
pub const MAX_ORDER: usize = 4;

/// Radial derivatives G_0 ... G_4 of a radial function.
pub type RadialDerivatives = [f64; MAX_ORDER + 1];

/// (a.grad)^pa (b.grad)^pb G for pa, pb <= 2, with A = a.R, B = b.R and
/// c = a.b.
pub fn directional(
    pa: usize,
    pb: usize,
    a_proj: f64,
    b_proj: f64,
    c: f64,
    g: &RadialDerivatives,
) -> f64 {
    // Symmetric in the two directions, order them so that pa >= pb
    let (pa, pb, a, b) = if pa >= pb {
        (pa, pb, a_proj, b_proj)
    } else {
        (pb, pa, b_proj, a_proj)
    };

    match (pa, pb) {
        (0, 0) => g[0],
        (1, 0) => a * g[1],
        (2, 0) => g[1] + a * a * g[2],
        (1, 1) => c * g[1] + a * b * g[2],
        (2, 1) => (b + 2.0 * c * a) * g[2] + a * a * b * g[3],
        (2, 2) => {
            (1.0 + 2.0 * c * c) * g[2]
                + (a * a + b * b + 4.0 * c * a * b) * g[3]
                + a * a * b * b * g[4]
        }
        _ => panic!("directional derivatives of order ({pa}, {pb}) are not implemented"),
    }
}

/// Laplacian of (a.grad)^pa G for pa <= 2, with A = a.R and R2 = |R|^2.
pub fn laplacian(pa: usize, a: f64, r2: f64, g: &RadialDerivatives) -> f64 {
    match pa {
        0 => 3.0 * g[1] + r2 * g[2],
        1 => 5.0 * a * g[2] + r2 * a * g[3],
        2 => 5.0 * g[2] + (7.0 * a * a + r2) * g[3] + r2 * a * a * g[4],
        _ => panic!("laplacian of directional derivative of order {pa} is not implemented"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // G(R) = exp(-R^2 / 2) has G_m = (-1)^m G
    fn gaussian(r2: f64) -> RadialDerivatives {
        let g = (-0.5 * r2).exp();
        [g, -g, g, -g, g]
    }

    fn field(x: [f64; 3]) -> f64 {
        (-0.5 * (x[0] * x[0] + x[1] * x[1] + x[2] * x[2])).exp()
    }

    fn shifted(x: [f64; 3], d: [f64; 3], h: f64) -> [f64; 3] {
        [x[0] + h * d[0], x[1] + h * d[1], x[2] + h * d[2]]
    }

    /// Finite difference derivative (a.grad)^pa (b.grad)^pb of the field.
    fn finite_difference(x: [f64; 3], a: [f64; 3], pa: usize, b: [f64; 3], pb: usize) -> f64 {
        let h: f64 = 2e-2;
        let first = vec![
            (-2.0, 1.0 / 12.0),
            (-1.0, -2.0 / 3.0),
            (1.0, 2.0 / 3.0),
            (2.0, -1.0 / 12.0),
        ];
        let second = vec![
            (-2.0, -1.0 / 12.0),
            (-1.0, 4.0 / 3.0),
            (0.0, -5.0 / 2.0),
            (1.0, 4.0 / 3.0),
            (2.0, -1.0 / 12.0),
        ];
        let weights = |p: usize| match p {
            0 => vec![(0.0, 1.0)],
            1 => first.clone(),
            _ => second.clone(),
        };
        let scale = |p: usize| h.powi(p as i32);

        let mut total = 0.0;
        for (sa, wa) in weights(pa) {
            for (sb, wb) in weights(pb) {
                let point = shifted(shifted(x, a, sa * h), b, sb * h);
                total += wa * wb * field(point);
            }
        }
        total / (scale(pa) * scale(pb))
    }

    #[test]
    fn test_directional_matches_finite_differences() {
        let x = [0.3, -0.4, 0.8];
        let a = [0.0, 0.6, 0.8];
        let b = [1.0, 0.0, 0.0];
        let r2 = x.iter().map(|v| v * v).sum::<f64>();
        let a_proj = a.iter().zip(&x).map(|(u, v)| u * v).sum::<f64>();
        let b_proj = b.iter().zip(&x).map(|(u, v)| u * v).sum::<f64>();
        let c = a.iter().zip(&b).map(|(u, v)| u * v).sum::<f64>();
        let g = gaussian(r2);

        for pa in 0..=2 {
            for pb in 0..=2 {
                let exact = directional(pa, pb, a_proj, b_proj, c, &g);
                let numeric = finite_difference(x, a, pa, b, pb);
                assert!((exact - numeric).abs() < 1e-6, "({pa}, {pb}): {exact} vs {numeric}");
            }
        }
    }

    #[test]
    fn test_laplacian_matches_sum_of_second_derivatives() {
        let x = [0.5, 0.1, -0.7];
        let a = [0.0, 0.0, 1.0];
        let r2 = x.iter().map(|v| v * v).sum::<f64>();
        let a_proj = x[2];
        let g = gaussian(r2);
        let axes = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

        for pa in 0..=2 {
            // Sum over axes of (e_i.grad)^2 (a.grad)^pa G
            let numeric: f64 = axes
                .iter()
                .map(|e| {
                    let e_proj = e.iter().zip(&x).map(|(u, v)| u * v).sum::<f64>();
                    let c = e.iter().zip(&a).map(|(u, v)| u * v).sum::<f64>();
                    directional(pa, 2, a_proj, e_proj, c, &g)
                })
                .sum();
            let exact = laplacian(pa, a_proj, r2, &g);
            assert!((exact - numeric).abs() < 1e-12, "order {pa}: {exact} vs {numeric}");
        }
    }
}
