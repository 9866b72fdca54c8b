use anyhow::Result;
use relativistic_correlations::{Contribution, CorrelationEngine, NoWiggleSpectrum, Parameters};

fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    // Fiducial survey with density, RSD and Doppler
    let mut parameters = Parameters::default();
    parameters.contributions.insert(Contribution::Doppler);
    parameters.z_mean = vec![0.5, 1.0, 1.5];
    parameters.separations = (1..=15).map(|i| 10.0 * i as f64).collect();
    parameters.multipoles = vec![0, 1, 2, 3, 4];

    let spectrum = NoWiggleSpectrum::new(&parameters, 0.8, 0.96)?.table(1e-5, 10.0, 1024)?;
    let engine = CorrelationEngine::new(parameters, spectrum)?;

    let multipoles = engine.compute_multipoles_bulk()?;
    println!("{:>6} {:>3} {:>10} {:>14}", "z", "l", "r [Mpc]", "xi_l");
    for multipole in &multipoles {
        println!(
            "{:>6.2} {:>3} {:>10.2} {:>14.6e}",
            multipole.z, multipole.l, multipole.r, multipole.value
        );
    }

    Ok(())
}
