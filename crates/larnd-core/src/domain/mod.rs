pub mod errors;

pub use errors::{ConfigResult, SimError, SimErrorCategory, SimResult, StageResult};

use crate::modules::serialization::nullable_f64;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimStage {
    Quenching,
    Drifting,
    PixelProjection,
    CurrentInduction,
    SignalAggregation,
    ElectronicsReadout,
    Export,
}

impl SimStage {
    pub const ORDER: [SimStage; 7] = [
        Self::Quenching,
        Self::Drifting,
        Self::PixelProjection,
        Self::CurrentInduction,
        Self::SignalAggregation,
        Self::ElectronicsReadout,
        Self::Export,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Quenching => "QUENCHING",
            Self::Drifting => "DRIFTING",
            Self::PixelProjection => "PIXELS",
            Self::CurrentInduction => "INDUCTION",
            Self::SignalAggregation => "AGGREGATION",
            Self::ElectronicsReadout => "READOUT",
            Self::Export => "EXPORT",
        }
    }
}

impl Display for SimStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

/// Progress marker carried by a [`TrackTable`].
///
/// Quenching and drifting rewrite segment fields in place, so running them out
/// of order (or twice) silently corrupts the physics. Each in-place stage checks
/// the marker it expects and advances it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackStage {
    Deposited,
    Quenched,
    Drifted,
}

impl TrackStage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deposited => "deposited",
            Self::Quenched => "quenched",
            Self::Drifted => "drifted",
        }
    }
}

impl Display for TrackStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

/// One straight energy-deposition segment.
///
/// Lengths are in cm, times in µs and energies in MeV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(rename = "eventID", default)]
    pub event_id: u32,
    #[serde(rename = "trackID", default)]
    pub track_id: i64,
    #[serde(rename = "pdgId", default)]
    pub pdg_id: i32,
    #[serde(with = "nullable_f64")]
    pub x_start: f64,
    #[serde(with = "nullable_f64")]
    pub y_start: f64,
    #[serde(with = "nullable_f64")]
    pub z_start: f64,
    #[serde(with = "nullable_f64", default)]
    pub t_start: f64,
    #[serde(with = "nullable_f64")]
    pub x_end: f64,
    #[serde(with = "nullable_f64")]
    pub y_end: f64,
    #[serde(with = "nullable_f64")]
    pub z_end: f64,
    #[serde(with = "nullable_f64", default)]
    pub t_end: f64,
    #[serde(with = "nullable_f64", default)]
    pub x: f64,
    #[serde(with = "nullable_f64", default)]
    pub y: f64,
    #[serde(with = "nullable_f64", default)]
    pub z: f64,
    #[serde(with = "nullable_f64", default)]
    pub t: f64,
    #[serde(with = "nullable_f64", default)]
    pub dx: f64,
    #[serde(rename = "dE", with = "nullable_f64")]
    pub de: f64,
    #[serde(rename = "dEdx", with = "nullable_f64", default)]
    pub dedx: f64,
    #[serde(with = "nullable_f64", default)]
    pub n_electrons: f64,
    #[serde(with = "nullable_f64", default)]
    pub long_diff: f64,
    #[serde(with = "nullable_f64", default)]
    pub tran_diff: f64,
    #[serde(default)]
    pub pixel_plane: usize,
}

impl Segment {
    /// Builds a segment from its end points and deposited energy, filling the
    /// derived midpoint, length and stopping power.
    pub fn from_endpoints(start: [f64; 3], end: [f64; 3], de: f64) -> Self {
        let mut segment = Self {
            event_id: 0,
            track_id: 0,
            pdg_id: 13,
            x_start: start[0],
            y_start: start[1],
            z_start: start[2],
            t_start: 0.0,
            x_end: end[0],
            y_end: end[1],
            z_end: end[2],
            t_end: 0.0,
            x: 0.0,
            y: 0.0,
            z: 0.0,
            t: 0.0,
            dx: 0.0,
            de,
            dedx: 0.0,
            n_electrons: 0.0,
            long_diff: 0.0,
            tran_diff: 0.0,
            pixel_plane: 0,
        };
        segment.fill_derived();
        segment
    }

    /// Recomputes midpoint, length and `dEdx` from the end points when the
    /// converter left them empty.
    pub fn fill_derived(&mut self) {
        if self.dx == 0.0 {
            self.dx = distance3(self.start(), self.end());
        }
        if self.x == 0.0 && self.y == 0.0 && self.z == 0.0 {
            self.x = 0.5 * (self.x_start + self.x_end);
            self.y = 0.5 * (self.y_start + self.y_end);
            self.z = 0.5 * (self.z_start + self.z_end);
        }
        if self.t == 0.0 {
            self.t = 0.5 * (self.t_start + self.t_end);
        }
        if self.dedx == 0.0 && self.dx > 0.0 {
            self.dedx = self.de / self.dx;
        }
    }

    pub fn start(&self) -> [f64; 3] {
        [self.x_start, self.y_start, self.z_start]
    }

    pub fn end(&self) -> [f64; 3] {
        [self.x_end, self.y_end, self.z_end]
    }
}

pub(crate) fn distance3(a: [f64; 3], b: [f64; 3]) -> f64 {
    let dx = b[0] - a[0];
    let dy = b[1] - a[1];
    let dz = b[2] - a[2];
    (dx * dx + dy * dy + dz * dz).sqrt()
}

/// Owned batch of segments moving through the in-place stages.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackTable {
    segments: Vec<Segment>,
    stage: TrackStage,
}

impl TrackTable {
    pub fn new(segments: Vec<Segment>) -> Self {
        Self::with_stage(segments, TrackStage::Deposited)
    }

    /// Rebuilds a table at a known stage, e.g. tracks echoed by a packet file.
    pub fn with_stage(segments: Vec<Segment>, stage: TrackStage) -> Self {
        Self { segments, stage }
    }

    pub fn stage(&self) -> TrackStage {
        self.stage
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn into_segments(self) -> Vec<Segment> {
        self.segments
    }

    /// Event id of every segment, in table order.
    pub fn event_ids(&self) -> Vec<u32> {
        self.segments.iter().map(|segment| segment.event_id).collect()
    }

    pub(crate) fn require(&self, expected: TrackStage, stage: SimStage) -> StageResult<()> {
        if self.stage == expected {
            return Ok(());
        }
        Err(SimError::input_validation(
            "STAGE.ORDER",
            format!(
                "{} expects a {} track table but received a {} one",
                stage, expected, self.stage
            ),
        ))
    }

    pub(crate) fn segments_mut(&mut self) -> &mut [Segment] {
        &mut self.segments
    }

    pub(crate) fn advance(mut self, next: TrackStage) -> Self {
        self.stage = next;
        self
    }
}

/// Pixel coordinates on one anode plane.
///
/// Field order makes the derived ordering match the encoded id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PixelId {
    pub plane: u32,
    pub y: u32,
    pub x: u32,
}

impl PixelId {
    pub const fn new(x: u32, y: u32, plane: u32) -> Self {
        Self { plane, y, x }
    }
}

impl Display for PixelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})@{}", self.x, self.y, self.plane)
    }
}

#[cfg(test)]
mod tests {
    use super::{PixelId, Segment, SimStage, TrackStage, TrackTable};
    use crate::domain::SimErrorCategory;

    #[test]
    fn segment_from_endpoints_fills_derived_fields() {
        let segment = Segment::from_endpoints([0.0, 0.0, 0.0], [3.0, 4.0, 0.0], 2.5);
        assert!((segment.dx - 5.0).abs() < 1.0e-12);
        assert!((segment.dedx - 0.5).abs() < 1.0e-12);
        assert!((segment.x - 1.5).abs() < 1.0e-12);
        assert!((segment.y - 2.0).abs() < 1.0e-12);
    }

    #[test]
    fn stage_check_rejects_unexpected_marker() {
        let table = TrackTable::new(Vec::new());
        assert!(table.require(TrackStage::Deposited, SimStage::Quenching).is_ok());

        let error = table
            .require(TrackStage::Quenched, SimStage::Drifting)
            .expect_err("deposited table should not be drifted");
        assert_eq!(error.category(), SimErrorCategory::InputValidationError);
        assert_eq!(error.placeholder(), "STAGE.ORDER");
        assert!(error.message().contains("DRIFTING"));
    }

    #[test]
    fn pixel_ordering_follows_plane_then_row_then_column() {
        let mut pixels = vec![
            PixelId::new(0, 1, 0),
            PixelId::new(5, 0, 1),
            PixelId::new(3, 0, 0),
        ];
        pixels.sort();
        assert_eq!(
            pixels,
            vec![
                PixelId::new(3, 0, 0),
                PixelId::new(0, 1, 0),
                PixelId::new(5, 0, 1)
            ]
        );
    }

    #[test]
    fn segment_json_accepts_null_for_non_finite_values() {
        let json = r#"{
            "eventID": 4, "trackID": 7, "pdgId": 11,
            "x_start": 0.0, "y_start": 0.0, "z_start": 1.0,
            "x_end": 1.0, "y_end": 0.0, "z_end": 1.0,
            "dE": null
        }"#;
        let segment: Segment = serde_json::from_str(json).expect("segment should parse");
        assert_eq!(segment.event_id, 4);
        assert!(segment.de.is_nan());
        assert_eq!(segment.pixel_plane, 0);
    }
}
