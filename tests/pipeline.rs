use relativistic_correlations::{
    covariance_matrix, Contribution, CorrelationEngine, Error, NoWiggleSpectrum, Parameters,
    Population,
};

fn engine(parameters: Parameters, k_max: f64) -> CorrelationEngine {
    let spectrum = NoWiggleSpectrum::new(&parameters, 0.8, 0.96)
        .unwrap()
        .table(1e-4, k_max, 400)
        .unwrap();
    CorrelationEngine::new(parameters, spectrum).unwrap()
}

fn two_populations() -> Parameters {
    let mut parameters = Parameters::default();
    parameters.populations = vec![
        Population::constant(1.0, 0.0, 0.0, 15.0),
        Population::constant(2.0, 0.0, 0.0, 15.0),
    ];
    parameters.correlation_populations = [0, 1];
    parameters.contributions = [Contribution::Density, Contribution::Doppler].into_iter().collect();
    parameters
}

#[test]
fn test_doppler_dipole_flips_with_population_order() {
    let forward = engine(two_populations(), 5.0);
    let mut parameters = two_populations();
    parameters.correlation_populations = [1, 0];
    let backward = engine(parameters, 5.0);

    let (r, z) = (40.0, 0.8);
    let monopole = forward.multipole(r, 0, z).unwrap();
    let dipole = forward.multipole(r, 1, z).unwrap();
    assert!(dipole.abs() > 1e-6 * monopole.abs());
    assert!((backward.multipole(r, 1, z).unwrap() + dipole).abs() < 1e-8 * monopole.abs());
    assert!((backward.multipole(r, 0, z).unwrap() - monopole).abs() < 1e-8 * monopole.abs());
}

#[test]
fn test_single_population_has_no_flat_sky_dipole() {
    let mut parameters = two_populations();
    parameters.correlation_populations = [1, 1];
    let engine = engine(parameters, 5.0);
    let monopole = engine.multipole(40.0, 0, 0.8).unwrap();
    assert!(engine.multipole(40.0, 1, 0.8).unwrap().abs() < 1e-10 * monopole.abs());
}

#[test]
fn test_limber_lensing_matches_full_sky_at_small_angles() {
    let mut parameters = Parameters::default();
    parameters.contributions = [Contribution::Lensing].into_iter().collect();
    parameters.numerics.bessel_bins = 96;
    parameters.flatsky.nonlocal = true;
    let limber = engine(parameters.clone(), 1.0);
    parameters.flatsky.nonlocal = false;
    let full = engine(parameters, 1.0);

    let a = limber.correlation(20.0, 0.0, 1.0).unwrap();
    let b = full.correlation(20.0, 0.0, 1.0).unwrap();
    assert!(a > 0.0 && b > 0.0);
    assert!((a / b - 1.0).abs() < 0.1, "Limber {a} vs full sky {b}");
}

#[test]
fn test_limber_local_lensing_needs_the_source_behind() {
    let mut parameters = Parameters::default();
    parameters.contributions = [Contribution::Density, Contribution::Lensing]
        .into_iter()
        .collect();
    parameters.only_cross_correlations = true;
    parameters.flatsky.local_nonlocal = true;
    parameters.numerics.bessel_bins = 96;
    let engine = engine(parameters, 1.0);

    // A single population is symmetric under mu -> -mu
    let ahead = engine.correlation(30.0, 0.5, 1.0).unwrap();
    let behind = engine.correlation(30.0, -0.5, 1.0).unwrap();
    assert!((ahead / behind - 1.0).abs() < 1e-10);
    // Without magnification bias, lensing dilutes the counts behind an overdensity
    assert!(ahead < 0.0);
}

#[test]
fn test_integrated_potential_anticorrelates_with_density() {
    let mut parameters = Parameters::default();
    parameters.contributions = [Contribution::Density, Contribution::IntegratedPotential]
        .into_iter()
        .collect();
    parameters.only_cross_correlations = true;
    parameters.numerics.bessel_bins = 96;
    let engine = engine(parameters, 1.0);

    let ahead = engine.correlation(40.0, 0.5, 1.0).unwrap();
    let behind = engine.correlation(40.0, -0.5, 1.0).unwrap();
    assert!((ahead / behind - 1.0).abs() < 2e-3, "{ahead} vs {behind}");
    // Phi_A < 0, so overdensities deepen the potential along the line of sight
    assert!(ahead < 0.0);
}

#[test]
fn test_integrated_potential_and_lensing_are_symmetric() {
    let mut parameters = Parameters::default();
    parameters.contributions = [Contribution::IntegratedPotential, Contribution::Lensing]
        .into_iter()
        .collect();
    parameters.only_cross_correlations = true;
    parameters.numerics.bessel_bins = 96;
    let engine = engine(parameters, 1.0);

    let ahead = engine.correlation(40.0, 0.5, 1.0).unwrap();
    let behind = engine.correlation(40.0, -0.5, 1.0).unwrap();
    assert!(ahead.is_finite() && ahead != 0.0);
    assert!((ahead / behind - 1.0).abs() < 5e-3, "{ahead} vs {behind}");
}

#[test]
fn test_integrated_potentials_are_full_sky_only() {
    let mut parameters = Parameters::default();
    parameters.contributions = [
        Contribution::IntegratedPotential,
        Contribution::IntegratedPotentialDerivative,
    ]
    .into_iter()
    .collect();
    parameters.numerics.bessel_bins = 96;
    parameters.flatsky.nonlocal = true;
    parameters.flatsky.local_nonlocal = true;
    let limber = engine(parameters.clone(), 1.0);
    parameters.flatsky.nonlocal = false;
    parameters.flatsky.local_nonlocal = false;
    let full = engine(parameters, 1.0);

    let value = full.correlation(40.0, 0.3, 1.0).unwrap();
    assert!(value.is_finite() && value != 0.0);
    assert_eq!(limber.correlation(40.0, 0.3, 1.0).unwrap(), value);
}

#[test]
fn test_covariance_matrix_needs_a_single_bin() {
    let mut parameters = Parameters::default();
    parameters.separations = vec![100.0, 200.0];
    parameters.multipoles = vec![0, 2];
    parameters.covariance.z_mean = vec![0.5, 1.0];
    parameters.covariance.deltaz = vec![0.1, 0.1];
    parameters.covariance.fsky = vec![0.2, 0.2];
    parameters.covariance.pixelsize = vec![50.0, 50.0];
    parameters.populations[0].number_density = vec![1e-3, 5e-4];
    let engine = engine(parameters, 2.0);

    let entries = engine.compute_covariance_bulk(None).unwrap();
    assert_eq!(entries.len(), 2 * 16);
    assert!(matches!(covariance_matrix(&entries), Err(Error::InvalidInput(_))));

    let first: Vec<_> = entries.iter().copied().filter(|entry| entry.z == 0.5).collect();
    let matrix = covariance_matrix(&first).unwrap();
    assert_eq!(matrix.dim(), (4, 4));
    let second: Vec<_> = entries.iter().copied().filter(|entry| entry.z == 1.0).collect();
    let other = covariance_matrix(&second).unwrap();
    for i in 0..4 {
        assert!(matrix[[i, i]] > 0.0 && other[[i, i]] > 0.0);
    }
    assert_ne!(matrix, other);
}
