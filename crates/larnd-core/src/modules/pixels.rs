//! Projection of drifted segments onto the anode pixel grid.
//!
//! Each segment's start and end points are mapped to pixel indices on its
//! plane and the line between them is rasterised with Bresenham's algorithm.
//! The active pixels are then extended by a square ring of neighbours to
//! catch charge that diffused sideways. The per-segment list is capped at
//! `max_pixels`; what happens to longer lists is an explicit
//! [`OverflowPolicy`] and every occurrence is reported.

use crate::common::SimulationContext;
use crate::domain::{
    ConfigResult, PixelId, Segment, SimError, SimStage, StageResult, TrackStage, TrackTable,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionSettings {
    /// Upper bound on assigned pixels per segment.
    pub max_pixels: usize,
    /// Neighbour ring radius (Chebyshev distance, in pixels).
    pub neighbor_radius: u32,
    /// Transverse diffusion widths added to the radius; zero keeps it fixed.
    pub diffusion_extent: f64,
}

impl Default for ProjectionSettings {
    fn default() -> Self {
        Self {
            max_pixels: 200,
            neighbor_radius: 1,
            diffusion_extent: 0.0,
        }
    }
}

impl ProjectionSettings {
    pub(crate) fn validate(&self) -> ConfigResult<()> {
        if self.max_pixels == 0 {
            return Err(SimError::input_validation(
                "INPUT.PROJECTION",
                "projection.max_pixels must be at least 1",
            ));
        }
        if !(self.diffusion_extent.is_finite() && self.diffusion_extent >= 0.0) {
            return Err(SimError::input_validation(
                "INPUT.PROJECTION",
                format!(
                    "projection.diffusion_extent must be non-negative, got {}",
                    self.diffusion_extent
                ),
            ));
        }
        Ok(())
    }
}

/// What to do with a segment whose pixel list exceeds `max_pixels`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Drop every pixel of the segment; it induces nothing.
    #[default]
    Skip,
    /// Keep the first `max_pixels` entries. Active pixels come first, so
    /// only neighbours are lost unless the track itself is too long.
    Truncate,
    /// Abort the run with a capacity error.
    Fail,
}

impl OverflowPolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Truncate => "truncate",
            Self::Fail => "fail",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "skip" => Some(Self::Skip),
            "truncate" => Some(Self::Truncate),
            "fail" => Some(Self::Fail),
            _ => None,
        }
    }
}

impl Display for OverflowPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelOverflow {
    pub segment: usize,
    /// Pixels found when the search stopped, always above the cap. Tracks
    /// too long to rasterise report the number of cells their line crosses.
    pub required: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PixelAssignment {
    pixels: Vec<Vec<PixelId>>,
}

impl PixelAssignment {
    pub fn new(pixels: Vec<Vec<PixelId>>) -> Self {
        Self { pixels }
    }

    pub fn for_segment(&self, segment: usize) -> &[PixelId] {
        self.pixels.get(segment).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn segments(&self) -> usize {
        self.pixels.len()
    }

    /// Width of the pixel-slot axis: the longest list over all segments.
    pub fn max_slots(&self) -> usize {
        self.pixels.iter().map(Vec::len).max().unwrap_or(0)
    }

    pub fn total_pairs(&self) -> usize {
        self.pixels.iter().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProjectionOutcome {
    pub assignment: PixelAssignment,
    pub overflows: Vec<PixelOverflow>,
    /// Segments with non-finite geometry; they receive no pixels.
    pub degenerate: Vec<usize>,
}

pub fn pixel_center(context: &SimulationContext, pixel: PixelId) -> Option<[f64; 2]> {
    let borders = context.borders(pixel.plane as usize)?;
    let pitch = context.layout().pixel_pitch;
    Some([
        borders[0][0] + (pixel.x as f64 + 0.5) * pitch,
        borders[1][0] + (pixel.y as f64 + 0.5) * pitch,
    ])
}

/// Flat channel number `x + nx * (y + ny * plane)`.
pub fn encode_pixel(context: &SimulationContext, pixel: PixelId) -> u64 {
    let [nx, ny] = context.layout().n_pixels;
    pixel.x as u64 + nx as u64 * (pixel.y as u64 + ny as u64 * pixel.plane as u64)
}

pub fn decode_pixel(context: &SimulationContext, id: u64) -> PixelId {
    let [nx, ny] = context.layout().n_pixels;
    let x = id % nx as u64;
    let rest = id / nx as u64;
    PixelId::new(x as u32, (rest % ny as u64) as u32, (rest / ny as u64) as u32)
}

/// Integer pixel coordinates of a point, possibly outside the plane.
fn pixel_coordinates(context: &SimulationContext, plane: usize, x: f64, y: f64) -> Option<(i64, i64)> {
    let borders = context.borders(plane)?;
    let pitch = context.layout().pixel_pitch;
    let ix = ((x - borders[0][0]) / pitch).floor();
    let iy = ((y - borders[1][0]) / pitch).floor();
    (ix.is_finite() && iy.is_finite()).then_some((ix as i64, iy as i64))
}

/// All grid cells on the line between two cells, both included.
pub fn bresenham(start: (i64, i64), end: (i64, i64)) -> Vec<(i64, i64)> {
    let (mut x, mut y) = start;
    let dx = (end.0 - x).abs();
    let dy = -(end.1 - y).abs();
    let sx = if x < end.0 { 1 } else { -1 };
    let sy = if y < end.1 { 1 } else { -1 };
    let mut err = dx + dy;

    let mut cells = Vec::with_capacity((dx - dy + 1) as usize);
    loop {
        cells.push((x, y));
        if x == end.0 && y == end.1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
    cells
}

enum SegmentPixels {
    Assigned(Vec<PixelId>),
    /// The first `max_pixels + 1` pixels found, or none when the track is
    /// too long to rasterise.
    Overflow {
        found: Vec<PixelId>,
        required: usize,
    },
    Degenerate,
}

fn segment_pixels(segment: &Segment, context: &SimulationContext, max_pixels: usize) -> SegmentPixels {
    let plane = segment.pixel_plane;
    let (Some(start), Some(end)) = (
        pixel_coordinates(context, plane, segment.x_start, segment.y_start),
        pixel_coordinates(context, plane, segment.x_end, segment.y_end),
    ) else {
        return SegmentPixels::Degenerate;
    };

    let [nx, ny] = context.layout().n_pixels;
    let (nx, ny) = (nx as i64, ny as i64);
    let span = (end.0 - start.0).abs().max((end.1 - start.1).abs());
    if span > 4 * (nx + ny) {
        return SegmentPixels::Overflow {
            found: Vec::new(),
            required: usize::try_from(span.saturating_add(1)).unwrap_or(usize::MAX),
        };
    }

    let settings = &context.detector().projection;
    let mut radius = settings.neighbor_radius as i64;
    if settings.diffusion_extent > 0.0 && segment.tran_diff.is_finite() {
        radius = radius.saturating_add(
            (settings.diffusion_extent * segment.tran_diff / context.layout().pixel_pitch).ceil()
                as i64,
        );
    }

    let inside = |(x, y): (i64, i64)| (0..nx).contains(&x) && (0..ny).contains(&y);
    let to_pixel = |(x, y): (i64, i64)| PixelId::new(x as u32, y as u32, plane as u32);

    let active: Vec<(i64, i64)> = bresenham(start, end).into_iter().filter(|c| inside(*c)).collect();
    let mut seen: HashSet<(i64, i64)> = active.iter().copied().collect();
    let mut pixels: Vec<PixelId> = active.iter().copied().map(to_pixel).collect();

    // rings are clipped to the plane and the search ends one pixel past the cap
    'rings: for &(cx, cy) in &active {
        if pixels.len() > max_pixels {
            break;
        }
        for y in cy.saturating_sub(radius).max(0)..=cy.saturating_add(radius).min(ny - 1) {
            for x in cx.saturating_sub(radius).max(0)..=cx.saturating_add(radius).min(nx - 1) {
                if seen.insert((x, y)) {
                    pixels.push(to_pixel((x, y)));
                    if pixels.len() > max_pixels {
                        break 'rings;
                    }
                }
            }
        }
    }

    if pixels.len() > max_pixels {
        SegmentPixels::Overflow {
            required: pixels.len(),
            found: pixels,
        }
    } else {
        SegmentPixels::Assigned(pixels)
    }
}

/// Assigns every segment of a drifted table its active and neighbouring
/// pixels.
pub fn project(
    table: &TrackTable,
    context: &SimulationContext,
    policy: OverflowPolicy,
) -> StageResult<ProjectionOutcome> {
    table.require(TrackStage::Drifted, SimStage::PixelProjection)?;
    let max_pixels = context.detector().projection.max_pixels;

    let per_segment: Vec<SegmentPixels> = table
        .segments()
        .par_iter()
        .map(|segment| segment_pixels(segment, context, max_pixels))
        .collect();

    let mut outcome = ProjectionOutcome::default();
    let mut lists = Vec::with_capacity(per_segment.len());
    for (index, pixels) in per_segment.into_iter().enumerate() {
        let (mut pixels, required) = match pixels {
            SegmentPixels::Assigned(pixels) => {
                lists.push(pixels);
                continue;
            }
            SegmentPixels::Degenerate => {
                outcome.degenerate.push(index);
                lists.push(Vec::new());
                continue;
            }
            SegmentPixels::Overflow { found, required } => (found, required),
        };

        outcome.overflows.push(PixelOverflow {
            segment: index,
            required,
        });
        match policy {
            OverflowPolicy::Skip => pixels.clear(),
            OverflowPolicy::Truncate => pixels.truncate(max_pixels),
            OverflowPolicy::Fail => {
                return Err(SimError::capacity_overflow(
                    "CAPACITY.PIXELS",
                    format!(
                        "segment {} needs more than {} pixels ({} found)",
                        index, max_pixels, required
                    ),
                ));
            }
        }
        lists.push(pixels);
    }

    if !outcome.overflows.is_empty() {
        tracing::warn!(
            overflows = outcome.overflows.len(),
            max_pixels,
            policy = %policy,
            "segments exceeded the pixel capacity"
        );
    }
    if !outcome.degenerate.is_empty() {
        tracing::warn!(
            segments = outcome.degenerate.len(),
            "segments with non-finite geometry were not projected"
        );
    }

    outcome.assignment = PixelAssignment::new(lists);
    Ok(outcome)
}
