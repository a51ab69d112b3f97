//! Induced current on the assigned pixels.
//!
//! Every segment is cut into `sampled_points` equal charge samples. Each
//! sample is spread over the pixel footprints by its transverse diffusion
//! cloud and over ticks by its longitudinal one; the field response for the
//! sample's offset from the pixel centre is then accumulated into that
//! pixel's fragment of the [`SignalTensor`].

use super::aggregation::TrackStartIndex;
use super::pixels::{PixelAssignment, pixel_center};
use super::serialization::read_json_file;
use crate::common::SimulationContext;
use crate::domain::{
    ConfigResult, PixelId, Segment, SimError, SimStage, StageResult, TrackStage, TrackTable,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::f64::consts::SQRT_2;
use std::path::Path;

/// Longitudinal spread is cut at this many widths and renormalised.
pub(crate) const TIME_SPREAD_WIDTHS: f64 = 4.0;

/// Current induced on a pixel by a unit charge, sampled on the detector tick
/// grid. A waveform integrates to one over `time_sampling`.
pub trait FieldResponse: Send + Sync {
    /// Waveform for a charge arriving at transverse offset (`dx`, `dy`) cm
    /// from the pixel centre, or `None` outside the tabulated footprint.
    fn waveform(&self, dx: f64, dy: f64) -> Option<&[f64]>;

    fn duration_ticks(&self) -> usize;

    /// Ticks of the waveform that precede the arrival tick.
    fn lead_ticks(&self) -> usize {
        0
    }

    fn time_sampling(&self) -> f64;
}

/// Response table indexed by `|dx|` and `|dy|` bins.
///
/// `values` is row-major over `shape = [nx, ny, nt]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabulatedResponse {
    pub bin_width: f64,
    pub time_sampling: f64,
    #[serde(default)]
    pub lead_ticks: usize,
    pub shape: [usize; 3],
    pub values: Vec<f64>,
}

impl TabulatedResponse {
    pub fn from_path(path: &Path) -> ConfigResult<Self> {
        let response: Self = read_json_file(path, "field response")?;
        response.validate()?;
        Ok(response)
    }

    /// Single-tick response over a square footprint of half-width `extent`.
    pub fn delta(extent: f64, time_sampling: f64) -> Self {
        Self {
            bin_width: extent,
            time_sampling,
            lead_ticks: 0,
            shape: [1, 1, 1],
            values: vec![1.0 / time_sampling],
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if !(self.bin_width.is_finite() && self.bin_width > 0.0) {
            return Err(SimError::input_validation(
                "INPUT.RESPONSE",
                format!("response bin_width must be positive, got {}", self.bin_width),
            ));
        }
        if !(self.time_sampling.is_finite() && self.time_sampling > 0.0) {
            return Err(SimError::input_validation(
                "INPUT.RESPONSE",
                format!(
                    "response time_sampling must be positive, got {}",
                    self.time_sampling
                ),
            ));
        }
        let [nx, ny, nt] = self.shape;
        if nx == 0 || ny == 0 || nt == 0 {
            return Err(SimError::input_validation(
                "INPUT.RESPONSE",
                format!("response shape must be non-empty, got {:?}", self.shape),
            ));
        }
        if nx * ny * nt != self.values.len() {
            return Err(SimError::input_validation(
                "INPUT.RESPONSE",
                format!(
                    "response shape {:?} needs {} values but {} were given",
                    self.shape,
                    nx * ny * nt,
                    self.values.len()
                ),
            ));
        }
        if self.lead_ticks >= nt {
            return Err(SimError::input_validation(
                "INPUT.RESPONSE",
                format!(
                    "response lead_ticks {} must be shorter than the waveform ({} ticks)",
                    self.lead_ticks, nt
                ),
            ));
        }
        if let Some(index) = self.values.iter().position(|value| !value.is_finite()) {
            return Err(SimError::input_validation(
                "INPUT.RESPONSE",
                format!("response value {} is not finite", index),
            ));
        }
        Ok(())
    }
}

impl FieldResponse for TabulatedResponse {
    fn waveform(&self, dx: f64, dy: f64) -> Option<&[f64]> {
        let [nx, ny, nt] = self.shape;
        let ix = (dx.abs() / self.bin_width).floor();
        let iy = (dy.abs() / self.bin_width).floor();
        if !(ix.is_finite() && iy.is_finite()) || ix >= nx as f64 || iy >= ny as f64 {
            return None;
        }
        let offset = (ix as usize * ny + iy as usize) * nt;
        self.values.get(offset..offset + nt)
    }

    fn duration_ticks(&self) -> usize {
        self.shape[2]
    }

    fn lead_ticks(&self) -> usize {
        self.lead_ticks
    }

    fn time_sampling(&self) -> f64 {
        self.time_sampling
    }
}

/// Rejects a response sampled on a different grid than the detector.
pub fn check_response_sampling(
    response: &dyn FieldResponse,
    context: &SimulationContext,
) -> ConfigResult<()> {
    let expected = context.detector().time_sampling;
    let actual = response.time_sampling();
    if (actual - expected).abs() > 1.0e-9 * expected {
        return Err(SimError::input_validation(
            "INPUT.RESPONSE",
            format!(
                "response is sampled every {} us but the detector samples every {} us",
                actual, expected
            ),
        ));
    }
    Ok(())
}

/// Dense `(segment, pixel slot, tick)` current samples.
///
/// The slot axis follows each segment's pixel list; ticks are local to the
/// segment's window in the [`TrackStartIndex`].
#[derive(Debug, Clone, PartialEq)]
pub struct SignalTensor {
    segments: usize,
    slots: usize,
    ticks: usize,
    data: Vec<f64>,
    clipped: usize,
}

impl SignalTensor {
    pub fn zeros(segments: usize, slots: usize, ticks: usize) -> Self {
        Self {
            segments,
            slots,
            ticks,
            data: vec![0.0; segments * slots * ticks],
            clipped: 0,
        }
    }

    pub fn dims(&self) -> [usize; 3] {
        [self.segments, self.slots, self.ticks]
    }

    pub fn fragment(&self, segment: usize, slot: usize) -> &[f64] {
        if segment >= self.segments || slot >= self.slots {
            return &[];
        }
        let start = (segment * self.slots + slot) * self.ticks;
        &self.data[start..start + self.ticks]
    }

    /// Samples that fell outside their segment's window and were dropped.
    pub fn clipped_samples(&self) -> usize {
        self.clipped
    }

    /// Integrated charge of every fragment, skipping non-finite samples.
    pub fn total_charge(&self, time_sampling: f64) -> f64 {
        self.data.iter().filter(|value| value.is_finite()).sum::<f64>() * time_sampling
    }
}

/// Fraction of a 1-D Gaussian (`mean`, `sigma`) inside `[lo, hi)`.
fn gaussian_overlap(mean: f64, sigma: f64, lo: f64, hi: f64) -> f64 {
    if sigma > 0.0 {
        let scale = sigma * SQRT_2;
        0.5 * (libm::erf((hi - mean) / scale) - libm::erf((lo - mean) / scale))
    } else if mean >= lo && mean < hi {
        1.0
    } else {
        0.0
    }
}

/// Global ticks and weights a charge arriving at `time` is spread over.
fn time_spread(time: f64, sigma: f64, context: &SimulationContext) -> Vec<(usize, f64)> {
    let detector = context.detector();
    let Some(center) = context.tick_for_time(time) else {
        return Vec::new();
    };
    if !(sigma > 0.0) {
        return vec![(center, 1.0)];
    }

    let t0 = detector.time_interval[0];
    let dt = detector.time_sampling;
    let reach = TIME_SPREAD_WIDTHS * sigma;
    // ticks past the grid are clipped downstream; no need to enumerate them
    let bound = context.global_ticks();
    let first = context.tick_for_time(time - reach).unwrap_or(0).min(bound);
    let last = context.tick_for_time(time + reach).unwrap_or(center).min(bound);

    let mut weights: Vec<(usize, f64)> = (first..=last)
        .map(|tick| {
            let lo = t0 + tick as f64 * dt;
            (tick, gaussian_overlap(time, sigma, lo, lo + dt))
        })
        .filter(|(_, weight)| *weight > 0.0)
        .collect();
    let total: f64 = weights.iter().map(|(_, weight)| weight).sum();
    if total > 0.0 {
        weights.iter_mut().for_each(|(_, weight)| *weight /= total);
    }
    weights
}

/// Fills one segment's block of the tensor and returns the dropped samples.
fn induce_segment(
    segment: &Segment,
    pixels: &[PixelId],
    window_start: usize,
    block: &mut [f64],
    ticks: usize,
    response: &dyn FieldResponse,
    context: &SimulationContext,
) -> usize {
    if pixels.is_empty() || ticks == 0 {
        return 0;
    }
    let detector = context.detector();
    let pitch = context.layout().pixel_pitch;
    let samples = detector.sampled_points;
    let charge = segment.n_electrons / samples as f64;
    let sigma_t = segment.long_diff / detector.vdrift;
    let lead = response.lead_ticks();

    let centers: Vec<Option<[f64; 2]>> = pixels
        .iter()
        .map(|pixel| pixel_center(context, *pixel))
        .collect();

    let mut clipped = 0;
    for sample in 0..samples {
        let fraction = (sample as f64 + 0.5) / samples as f64;
        let x = segment.x_start + fraction * (segment.x_end - segment.x_start);
        let y = segment.y_start + fraction * (segment.y_end - segment.y_start);
        let time = segment.t_start + fraction * (segment.t_end - segment.t_start);
        let spread = time_spread(time, sigma_t, context);

        for (slot, center) in centers.iter().enumerate() {
            let Some([cx, cy]) = *center else {
                continue;
            };
            let half = 0.5 * pitch;
            let weight = gaussian_overlap(x, segment.tran_diff, cx - half, cx + half)
                * gaussian_overlap(y, segment.tran_diff, cy - half, cy + half);
            if weight == 0.0 {
                continue;
            }
            let Some(waveform) = response.waveform(x - cx, y - cy) else {
                continue;
            };

            let fragment = &mut block[slot * ticks..(slot + 1) * ticks];
            for &(arrival, time_weight) in &spread {
                let amplitude = charge * weight * time_weight;
                for (offset, current) in waveform.iter().enumerate() {
                    let local = arrival
                        .saturating_add(offset)
                        .checked_sub(lead)
                        .and_then(|tick| tick.checked_sub(window_start));
                    match local {
                        Some(local) if local < ticks => fragment[local] += amplitude * current,
                        _ => clipped += 1,
                    }
                }
            }
        }
    }
    clipped
}

/// Computes the induced current of every (segment, pixel) pair.
pub fn induce(
    table: &TrackTable,
    assignment: &PixelAssignment,
    starts: &TrackStartIndex,
    response: &dyn FieldResponse,
    context: &SimulationContext,
) -> StageResult<SignalTensor> {
    table.require(TrackStage::Drifted, SimStage::CurrentInduction)?;
    if assignment.segments() != table.len() || starts.segments() != table.len() {
        return Err(SimError::internal(
            "STAGE.SHAPE",
            format!(
                "induction got {} segments but {} pixel lists and {} windows",
                table.len(),
                assignment.segments(),
                starts.segments()
            ),
        ));
    }

    let slots = assignment.max_slots();
    let ticks = starts.time_max();
    let mut tensor = SignalTensor::zeros(table.len(), slots, ticks);
    let block_len = slots * ticks;
    if block_len == 0 {
        return Ok(tensor);
    }

    let clipped: usize = tensor
        .data
        .par_chunks_mut(block_len)
        .enumerate()
        .map(|(index, block)| {
            induce_segment(
                &table.segments()[index],
                assignment.for_segment(index),
                starts.start_tick(index),
                block,
                ticks,
                response,
                context,
            )
        })
        .sum();
    tensor.clipped = clipped;

    if clipped > 0 {
        tracing::warn!(clipped, time_max = ticks, "induced samples fell outside their window");
    }
    tracing::debug!(segments = table.len(), slots, ticks, "induced pixel currents");
    Ok(tensor)
}
