//! Time windows and per-pixel summation of induced current.
//!
//! [`time_intervals`] fixes, per segment, where its fragment window starts on
//! the global tick grid and the common window length. After induction,
//! [`sum_pixel_signals`] groups fragments by event and pixel and lets a single
//! owner per group add them onto the global grid, so no two workers ever write
//! the same waveform. Events are separate readouts of the detector: two events
//! hitting one pixel give two waveforms, never a sum.

use super::induction::{FieldResponse, SignalTensor, TIME_SPREAD_WIDTHS};
use super::pixels::PixelAssignment;
use crate::common::SimulationContext;
use crate::domain::{PixelId, Segment, SimError, SimStage, StageResult, TrackStage, TrackTable};
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Start tick of every segment's window and the shared window length.
///
/// Every pixel fragment of a segment shares its segment's start. Windows are
/// shifted back so that `start + time_max` never passes the end of the grid.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TrackStartIndex {
    starts: Vec<usize>,
    time_max: usize,
}

impl TrackStartIndex {
    pub fn new(starts: Vec<usize>, time_max: usize) -> Self {
        Self { starts, time_max }
    }

    pub fn start_tick(&self, segment: usize) -> usize {
        self.starts.get(segment).copied().unwrap_or(0)
    }

    pub fn time_max(&self) -> usize {
        self.time_max
    }

    pub fn segments(&self) -> usize {
        self.starts.len()
    }
}

fn segment_window(
    segment: &Segment,
    response: &dyn FieldResponse,
    context: &SimulationContext,
) -> (usize, usize) {
    if !(segment.t_start.is_finite() && segment.t_end.is_finite()) {
        return (0, 0);
    }
    let detector = context.detector();
    let global = context.global_ticks();
    let early = segment.t_start.min(segment.t_end);
    let late = segment.t_start.max(segment.t_end);
    let spread = TIME_SPREAD_WIDTHS * segment.long_diff / detector.vdrift;
    let spread = if spread.is_finite() { spread } else { 0.0 };
    let lead = response.lead_ticks();

    let start = context
        .tick_for_time(early - detector.time_padding - spread)
        .unwrap_or(0)
        .saturating_sub(lead)
        .min(global);
    let end = match context.tick_for_time(late + spread) {
        Some(last) => last
            .saturating_add(response.duration_ticks())
            .saturating_sub(lead)
            .min(global),
        None => start,
    };
    (start, end.max(start))
}

/// Computes the window of every segment of a drifted table.
pub fn time_intervals(
    table: &TrackTable,
    response: &dyn FieldResponse,
    context: &SimulationContext,
) -> StageResult<TrackStartIndex> {
    table.require(TrackStage::Drifted, SimStage::SignalAggregation)?;
    let global = context.global_ticks();

    let windows: Vec<(usize, usize)> = table
        .segments()
        .par_iter()
        .map(|segment| segment_window(segment, response, context))
        .collect();

    let time_max = windows
        .iter()
        .map(|(start, end)| end - start)
        .max()
        .unwrap_or(0)
        .min(global);
    let starts = windows
        .iter()
        .map(|(start, _)| (*start).min(global - time_max))
        .collect();

    tracing::debug!(segments = table.len(), time_max, global, "computed segment windows");
    Ok(TrackStartIndex::new(starts, time_max))
}

/// One segment's current on one pixel, starting at `start` on the global grid.
#[derive(Debug, Clone, PartialEq)]
pub struct Contribution {
    pub segment: usize,
    pub start: usize,
    pub current: Vec<f64>,
}

impl Contribution {
    /// Current at a global tick, zero outside the window.
    pub fn at(&self, tick: usize) -> f64 {
        tick.checked_sub(self.start)
            .and_then(|local| self.current.get(local))
            .copied()
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PixelSignal {
    pub event_id: u32,
    pub pixel: PixelId,
    /// Summed current on the full global grid.
    pub waveform: Vec<f64>,
    /// Per contributing segment, in segment order.
    pub contributions: Vec<Contribution>,
}

impl PixelSignal {
    pub fn contributors(&self) -> Vec<usize> {
        self.contributions.iter().map(|entry| entry.segment).collect()
    }

    fn key(&self) -> (u32, PixelId) {
        (self.event_id, self.pixel)
    }
}

/// Summed waveforms of every touched pixel, ordered by event then pixel id.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PixelWaveforms {
    signals: Vec<PixelSignal>,
    ticks: usize,
}

impl PixelWaveforms {
    pub fn from_signals(mut signals: Vec<PixelSignal>, ticks: usize) -> Self {
        signals.sort_by_key(PixelSignal::key);
        Self { signals, ticks }
    }

    pub fn signals(&self) -> &[PixelSignal] {
        &self.signals
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    pub fn ticks(&self) -> usize {
        self.ticks
    }

    pub fn get(&self, event_id: u32, pixel: PixelId) -> Option<&PixelSignal> {
        self.signals
            .binary_search_by_key(&(event_id, pixel), PixelSignal::key)
            .ok()
            .map(|index| &self.signals[index])
    }

    /// Integrated charge over all pixels, skipping non-finite samples.
    pub fn total_charge(&self, time_sampling: f64) -> f64 {
        self.signals
            .iter()
            .flat_map(|signal| signal.waveform.iter())
            .filter(|value| value.is_finite())
            .sum::<f64>()
            * time_sampling
    }
}

/// Adds every fragment of the tensor onto the global waveform of its pixel
/// within its segment's event. `events` holds the event id of each segment.
pub fn sum_pixel_signals(
    tensor: &SignalTensor,
    assignment: &PixelAssignment,
    starts: &TrackStartIndex,
    events: &[u32],
    context: &SimulationContext,
) -> StageResult<PixelWaveforms> {
    let [segments, _, ticks] = tensor.dims();
    if assignment.segments() != segments || starts.segments() != segments {
        return Err(SimError::internal(
            "STAGE.SHAPE",
            format!(
                "aggregation got a tensor of {} segments, {} pixel lists and {} windows",
                segments,
                assignment.segments(),
                starts.segments()
            ),
        ));
    }
    if events.len() != segments {
        return Err(SimError::internal(
            "STAGE.SHAPE",
            format!(
                "aggregation got {} event ids for {} segments",
                events.len(),
                segments
            ),
        ));
    }
    let global = context.global_ticks();

    let mut pairs: BTreeMap<(u32, PixelId), Vec<(usize, usize)>> = BTreeMap::new();
    for segment in 0..segments {
        for (slot, pixel) in assignment.for_segment(segment).iter().enumerate() {
            pairs
                .entry((events[segment], *pixel))
                .or_default()
                .push((segment, slot));
        }
    }
    let grouped: Vec<((u32, PixelId), Vec<(usize, usize)>)> = pairs.into_iter().collect();

    let signals: Vec<PixelSignal> = grouped
        .into_par_iter()
        .map(|((event_id, pixel), pairs)| {
            let mut waveform = vec![0.0; global];
            let mut contributions = Vec::with_capacity(pairs.len());
            for (segment, slot) in pairs {
                let start = starts.start_tick(segment);
                let fragment = tensor.fragment(segment, slot);
                let usable = fragment.len().min(global.saturating_sub(start));
                for (tick, current) in fragment[..usable].iter().enumerate() {
                    waveform[start + tick] += current;
                }
                contributions.push(Contribution {
                    segment,
                    start,
                    current: fragment[..usable].to_vec(),
                });
            }
            PixelSignal {
                event_id,
                pixel,
                waveform,
                contributions,
            }
        })
        .collect();

    tracing::debug!(pixels = signals.len(), ticks, global, "summed pixel waveforms");
    Ok(PixelWaveforms::from_signals(signals, global))
}
