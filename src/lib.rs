#[macro_use]
extern crate lazy_static;

pub mod background;
pub mod constants;
pub mod corrfunc;
pub mod covariance;
pub mod engine;
pub mod error;
pub mod integrals;
pub mod multipoles;
pub mod parameters;
pub mod spectrum;
pub mod theory;
pub mod transfer;
pub mod utils;

pub use background::BackgroundCosmology;
pub use corrfunc::{CorrelationFunctionAssembler, CorrelationResult};
pub use covariance::{
    covariance_matrix, filter_rstep, CovarianceAssembler, CovarianceEntry, CovarianceMatrix,
};
pub use engine::CorrelationEngine;
pub use error::{Error, Result};
pub use integrals::{BesselIntegralCache, IntegralSettings, PopulationPair};
pub use multipoles::{MultipoleProjector, MultipoleResult};
pub use parameters::{
    Contribution, CovarianceSettings, CovarianceTerms, FlatSky, Numerics, Parameters, Population,
    SampledCurve, Support,
};
pub use spectrum::{Extrapolation, PowerSpectrumTable};
pub use transfer::NoWiggleSpectrum;
