//! Run configuration: detector properties, pixel layout and the immutable
//! context handed to every stage.
//!
//! A context is built once per run (or once per fit probe) and never mutated;
//! stages receive it by reference.

use super::constants;
use crate::domain::{ConfigResult, SimError};
use crate::modules::export::ExportSettings;
use crate::modules::pixels::ProjectionSettings;
use crate::modules::quenching::RecombinationModel;
use crate::modules::readout::ElectronicsConfig;
use crate::modules::serialization::read_json_file;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Bounds of one TPC volume: `[x_min, x_max]`, `[y_min, y_max]` and
/// `[z_anode, z_cathode]`.
pub type TpcBorders = [[f64; 2]; 3];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorProperties {
    pub vdrift: f64,
    pub lifetime: f64,
    pub long_diff: f64,
    pub tran_diff: f64,
    #[serde(rename = "eField")]
    pub e_field: f64,
    pub lar_density: f64,
    pub box_alpha: f64,
    pub box_beta: f64,
    pub birks_ab: f64,
    pub birks_kb: f64,
    pub recombination: RecombinationModel,
    pub time_sampling: f64,
    pub time_padding: f64,
    pub time_interval: [f64; 2],
    pub sampled_points: usize,
    pub tpc_borders: Vec<TpcBorders>,
    pub projection: ProjectionSettings,
    pub electronics: ElectronicsConfig,
    pub export: ExportSettings,
}

impl Default for DetectorProperties {
    fn default() -> Self {
        Self {
            vdrift: constants::V_DRIFT,
            lifetime: constants::ELECTRON_LIFETIME,
            long_diff: constants::LONG_DIFF,
            tran_diff: constants::TRAN_DIFF,
            e_field: constants::E_FIELD,
            lar_density: constants::LAR_DENSITY,
            box_alpha: constants::BOX_ALPHA,
            box_beta: constants::BOX_BETA,
            birks_ab: constants::BIRKS_AB,
            birks_kb: constants::BIRKS_KB,
            recombination: RecombinationModel::Box,
            time_sampling: constants::TIME_SAMPLING,
            time_padding: constants::TIME_PADDING,
            time_interval: constants::TIME_INTERVAL,
            sampled_points: constants::SAMPLED_POINTS,
            tpc_borders: vec![[[-30.0, 30.0], [-60.0, 60.0], [0.0, 30.0]]],
            projection: ProjectionSettings::default(),
            electronics: ElectronicsConfig::default(),
            export: ExportSettings::default(),
        }
    }
}

impl DetectorProperties {
    pub fn from_path(path: &Path) -> ConfigResult<Self> {
        read_json_file(path, "detector properties")
    }

    /// Drift length of the first TPC, echoed into exported files.
    pub fn drift_length(&self) -> f64 {
        self.tpc_borders
            .first()
            .map(|borders| (borders[2][1] - borders[2][0]).abs())
            .unwrap_or(0.0)
    }

    fn validate(&self) -> ConfigResult<()> {
        let positive = [
            ("vdrift", self.vdrift),
            ("lifetime", self.lifetime),
            ("eField", self.e_field),
            ("lar_density", self.lar_density),
            ("time_sampling", self.time_sampling),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(SimError::input_validation(
                    "INPUT.DETECTOR_PROPERTY",
                    format!("detector property '{}' must be positive, got {}", name, value),
                ));
            }
        }

        for (name, value) in [("long_diff", self.long_diff), ("tran_diff", self.tran_diff)] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(SimError::input_validation(
                    "INPUT.DETECTOR_PROPERTY",
                    format!(
                        "detector property '{}' must be non-negative, got {}",
                        name, value
                    ),
                ));
            }
        }

        if !(self.time_interval[1] > self.time_interval[0]) {
            return Err(SimError::input_validation(
                "INPUT.DETECTOR_PROPERTY",
                format!(
                    "time_interval must be increasing, got [{}, {}]",
                    self.time_interval[0], self.time_interval[1]
                ),
            ));
        }
        if self.sampled_points == 0 {
            return Err(SimError::input_validation(
                "INPUT.DETECTOR_PROPERTY",
                "sampled_points must be at least 1",
            ));
        }
        if self.tpc_borders.is_empty() {
            return Err(SimError::input_validation(
                "INPUT.DETECTOR_PROPERTY",
                "tpc_borders must describe at least one TPC",
            ));
        }
        self.projection.validate()?;
        self.electronics.validate()?;
        self.export.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PixelLayout {
    pub pixel_pitch: f64,
    /// Pixels along x and y on every plane.
    pub n_pixels: [u32; 2],
}

impl Default for PixelLayout {
    fn default() -> Self {
        Self {
            pixel_pitch: constants::PIXEL_PITCH,
            n_pixels: [135, 270],
        }
    }
}

impl PixelLayout {
    pub fn from_path(path: &Path) -> ConfigResult<Self> {
        read_json_file(path, "pixel layout")
    }

    fn validate(&self) -> ConfigResult<()> {
        if !(self.pixel_pitch.is_finite() && self.pixel_pitch > 0.0) {
            return Err(SimError::input_validation(
                "INPUT.PIXEL_LAYOUT",
                format!("pixel_pitch must be positive, got {}", self.pixel_pitch),
            ));
        }
        if self.n_pixels[0] == 0 || self.n_pixels[1] == 0 {
            return Err(SimError::input_validation(
                "INPUT.PIXEL_LAYOUT",
                format!(
                    "n_pixels must be non-zero on both axes, got [{}, {}]",
                    self.n_pixels[0], self.n_pixels[1]
                ),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationContext {
    detector: DetectorProperties,
    layout: PixelLayout,
}

impl SimulationContext {
    pub fn new(detector: DetectorProperties, layout: PixelLayout) -> ConfigResult<Self> {
        detector.validate()?;
        layout.validate()?;
        Ok(Self { detector, layout })
    }

    pub fn from_paths(detector_path: &Path, layout_path: &Path) -> ConfigResult<Self> {
        Self::new(
            DetectorProperties::from_path(detector_path)?,
            PixelLayout::from_path(layout_path)?,
        )
    }

    /// Derives a context with different detector properties and the same
    /// layout.
    pub fn with_detector(&self, detector: DetectorProperties) -> ConfigResult<Self> {
        Self::new(detector, self.layout.clone())
    }

    pub fn detector(&self) -> &DetectorProperties {
        &self.detector
    }

    pub fn layout(&self) -> &PixelLayout {
        &self.layout
    }

    pub fn n_planes(&self) -> usize {
        self.detector.tpc_borders.len()
    }

    pub fn borders(&self, plane: usize) -> Option<&TpcBorders> {
        self.detector.tpc_borders.get(plane)
    }

    /// Number of samples on the global time grid.
    pub fn global_ticks(&self) -> usize {
        let [start, end] = self.detector.time_interval;
        ((end - start) / self.detector.time_sampling).ceil() as usize
    }

    /// Tick on the global grid for an absolute time, floored. `None` before
    /// the start of the grid.
    pub fn tick_for_time(&self, time: f64) -> Option<usize> {
        let offset = (time - self.detector.time_interval[0]) / self.detector.time_sampling;
        if offset.is_finite() && offset >= 0.0 {
            Some(offset.floor() as usize)
        } else {
            None
        }
    }
}
