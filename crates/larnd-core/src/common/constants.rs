//! Physical constants and nominal detector values.
//!
//! Lengths are cm, times µs, energies MeV, fields kV/cm, charges in electrons.
//! Everything a run may tune lives in `DetectorProperties`; these are only the
//! defaults it starts from.

/// Mean energy to create one ionisation electron in LAr.
pub const W_ION: f64 = 23.6e-6;
pub const LAR_DENSITY: f64 = 1.38;

pub const BOX_ALPHA: f64 = 0.93;
pub const BOX_BETA: f64 = 0.207;
pub const BIRKS_AB: f64 = 0.800;
pub const BIRKS_KB: f64 = 0.0486;

pub const E_FIELD: f64 = 0.50;
pub const V_DRIFT: f64 = 0.1648;
pub const ELECTRON_LIFETIME: f64 = 2.2e3;
pub const LONG_DIFF: f64 = 4.0e-6;
pub const TRAN_DIFF: f64 = 8.8e-6;

pub const TIME_SAMPLING: f64 = 0.1;
pub const TIME_PADDING: f64 = 10.0;
pub const TIME_INTERVAL: [f64; 2] = [0.0, 200.0];
pub const SAMPLED_POINTS: usize = 40;

pub const PIXEL_PITCH: f64 = 0.4434;
