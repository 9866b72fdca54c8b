/// Speed of light in km/s.
pub const SPEED_OF_LIGHT: f64 = 299_792.458;

/// H0 / h in units of 1/Mpc (with c = 1), i.e. 100 km/s/Mpc divided by c.
pub const HUBBLE_UNIT: f64 = 100.0 / SPEED_OF_LIGHT;

/// Redshift at which the growth equation is started, deep in matter domination.
pub const GROWTH_INITIAL_REDSHIFT: f64 = 999.0;

/// CMB temperature in units of 2.7 K, used by the no-wiggle transfer function.
pub const THETA_CMB: f64 = 2.7255 / 2.7;

/// Largest multipole order accepted anywhere in the engine.
pub const MAX_MULTIPOLE: usize = 16;

/// Largest value of l + n for which the Bessel integrals I_l^n are supported.
/// Every contribution only ever needs l + n <= 4.
pub const MAX_BESSEL_ORDER: usize = 4;

/// Relative tolerance used when comparing two separations for equality
/// (the Poisson term of the covariance is diagonal in separation).
pub const SEPARATION_EQUALITY: f64 = 1e-10;
