pub mod config;
pub mod constants;

pub use config::{DetectorProperties, PixelLayout, SimulationContext, TpcBorders};
