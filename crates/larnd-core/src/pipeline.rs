//! Stage orchestration.
//!
//! [`SimulationPipeline`] owns the immutable run context, the field response
//! and the overflow policy, and pushes a track table through every stage in
//! order. Each stage runs inside its own `tracing` span.

use crate::common::SimulationContext;
use crate::domain::{
    ConfigResult, PixelId, Segment, SimResult, SimStage, StageResult, TrackTable,
};
use crate::modules::aggregation::{PixelWaveforms, sum_pixel_signals, time_intervals};
use crate::modules::drifting::drift;
use crate::modules::export::{ExportSummary, export_packets};
use crate::modules::induction::{FieldResponse, check_response_sampling, induce};
use crate::modules::pixels::{OverflowPolicy, PixelOverflow, project};
use crate::modules::quenching::quench;
use crate::modules::readout::{AdcPacket, readout};
use crate::modules::rng::RngStreamPool;
use crate::modules::serialization::read_json_file;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

#[derive(Deserialize)]
#[serde(untagged)]
enum SegmentInput {
    Wrapped { segments: Vec<Segment> },
    Bare(Vec<Segment>),
}

/// Loads segments from `{"segments": [...]}` or a bare JSON array and fills
/// derived fields the converter left empty.
pub fn load_segments(path: &Path) -> SimResult<Vec<Segment>> {
    let input: SegmentInput = read_json_file(path, "segment input")?;
    let mut segments = match input {
        SegmentInput::Wrapped { segments } | SegmentInput::Bare(segments) => segments,
    };
    segments.iter_mut().for_each(Segment::fill_derived);
    Ok(segments)
}

/// Counters a run accumulates for the operator.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct PipelineReport {
    pub segments: usize,
    pub overflows: Vec<PixelOverflow>,
    pub degenerate_segments: Vec<usize>,
    pub clipped_samples: usize,
    pub time_max: usize,
    pub pixels: usize,
    pub packets: usize,
    pub saturated_pixels: Vec<PixelId>,
    /// Set once the packets were written; its counts explain any gap between
    /// `packets` and the packets stored.
    pub export: Option<ExportSummary>,
}

/// Output of the stages up to and including signal aggregation.
#[derive(Debug, Clone)]
pub struct AnalogOutput {
    pub tracks: TrackTable,
    pub waveforms: PixelWaveforms,
    pub report: PipelineReport,
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub tracks: TrackTable,
    pub waveforms: PixelWaveforms,
    pub packets: Vec<AdcPacket>,
    pub report: PipelineReport,
}

fn in_stage<T>(stage: SimStage, run: impl FnOnce() -> T) -> T {
    let span = tracing::info_span!("stage", stage = %stage);
    let _entered = span.enter();
    run()
}

#[derive(Clone)]
pub struct SimulationPipeline {
    context: SimulationContext,
    response: Arc<dyn FieldResponse>,
    overflow: OverflowPolicy,
}

impl std::fmt::Debug for SimulationPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationPipeline")
            .field("context", &self.context)
            .field("overflow", &self.overflow)
            .finish_non_exhaustive()
    }
}

impl SimulationPipeline {
    pub fn new(
        context: SimulationContext,
        response: Arc<dyn FieldResponse>,
        overflow: OverflowPolicy,
    ) -> ConfigResult<Self> {
        check_response_sampling(response.as_ref(), &context)?;
        Ok(Self {
            context,
            response,
            overflow,
        })
    }

    /// Same response and policy under a different context.
    pub fn with_context(&self, context: SimulationContext) -> ConfigResult<Self> {
        Self::new(context, Arc::clone(&self.response), self.overflow)
    }

    pub fn context(&self) -> &SimulationContext {
        &self.context
    }

    pub fn overflow_policy(&self) -> OverflowPolicy {
        self.overflow
    }

    /// Quenching through aggregation, without electronics.
    pub fn run_analog(&self, table: TrackTable) -> StageResult<AnalogOutput> {
        let context = &self.context;
        let response = self.response.as_ref();
        let mut report = PipelineReport {
            segments: table.len(),
            ..PipelineReport::default()
        };

        let table = in_stage(SimStage::Quenching, || quench(table, context))?;
        let table = in_stage(SimStage::Drifting, || drift(table, context))?;
        let projection =
            in_stage(SimStage::PixelProjection, || project(&table, context, self.overflow))?;
        report.overflows = projection.overflows;
        report.degenerate_segments = projection.degenerate;

        let starts = in_stage(SimStage::SignalAggregation, || {
            time_intervals(&table, response, context)
        })?;
        report.time_max = starts.time_max();
        let tensor = in_stage(SimStage::CurrentInduction, || {
            induce(&table, &projection.assignment, &starts, response, context)
        })?;
        report.clipped_samples = tensor.clipped_samples();

        let waveforms = in_stage(SimStage::SignalAggregation, || {
            sum_pixel_signals(
                &tensor,
                &projection.assignment,
                &starts,
                &table.event_ids(),
                context,
            )
        })?;
        report.pixels = waveforms.len();

        Ok(AnalogOutput {
            tracks: table,
            waveforms,
            report,
        })
    }

    pub fn run(&self, table: TrackTable, pool: &RngStreamPool) -> StageResult<PipelineOutput> {
        let analog = self.run_analog(table)?;
        let outcome = in_stage(SimStage::ElectronicsReadout, || {
            readout(&analog.waveforms, &self.context, pool)
        });

        let mut report = analog.report;
        report.packets = outcome.packets.len();
        report.saturated_pixels = outcome.saturated_pixels;
        Ok(PipelineOutput {
            tracks: analog.tracks,
            waveforms: analog.waveforms,
            packets: outcome.packets,
            report,
        })
    }

    /// Full run ending with an atomic export to `path`.
    pub fn run_to_file(
        &self,
        table: TrackTable,
        pool: &RngStreamPool,
        path: &Path,
    ) -> SimResult<PipelineReport> {
        let output = self.run(table, pool)?;
        let summary = in_stage(SimStage::Export, || {
            export_packets(path, &output.packets, &output.tracks, &self.context, pool)
        })?;

        let mut report = output.report;
        report.export = Some(summary);
        tracing::info!(
            segments = report.segments,
            pixels = report.pixels,
            packets = report.packets,
            written = summary.written,
            overflows = report.overflows.len(),
            clipped = report.clipped_samples,
            "simulation finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::{SimulationPipeline, load_segments};
    use crate::common::{DetectorProperties, PixelLayout, SimulationContext};
    use crate::domain::{Segment, TrackTable};
    use crate::modules::induction::TabulatedResponse;
    use crate::modules::pixels::OverflowPolicy;
    use crate::modules::rng::RngStreamPool;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn pipeline() -> SimulationPipeline {
        let detector = DetectorProperties {
            tpc_borders: vec![[[0.0, 4.0], [0.0, 4.0], [0.0, 10.0]]],
            ..DetectorProperties::default()
        };
        let layout = PixelLayout {
            pixel_pitch: 0.4,
            n_pixels: [10, 10],
        };
        let context = SimulationContext::new(detector, layout).expect("valid context");
        SimulationPipeline::new(
            context,
            Arc::new(TabulatedResponse::delta(0.2, 0.1)),
            OverflowPolicy::Skip,
        )
        .expect("valid pipeline")
    }

    #[test]
    fn response_on_another_time_grid_is_rejected() {
        let context = pipeline().context().clone();
        let error = SimulationPipeline::new(
            context,
            Arc::new(TabulatedResponse::delta(0.2, 0.05)),
            OverflowPolicy::Skip,
        )
        .expect_err("sampling mismatch");
        assert_eq!(error.placeholder(), "INPUT.RESPONSE");
    }

    #[test]
    fn empty_table_runs_through_every_stage() {
        let output = pipeline()
            .run(TrackTable::new(Vec::new()), &RngStreamPool::new(0))
            .expect("empty run");
        assert!(output.packets.is_empty());
        assert_eq!(output.report.pixels, 0);
    }

    #[test]
    fn analog_run_reports_projection_counters() {
        let pipeline = pipeline();
        let mut broken = Segment::from_endpoints([1.0, 1.0, 2.0], [1.3, 1.0, 2.0], 1.0);
        broken.y_end = f64::NAN;
        let table = TrackTable::new(vec![
            Segment::from_endpoints([1.0, 1.0, 2.0], [1.3, 1.0, 2.0], 1.0),
            broken,
        ]);
        let analog = pipeline.run_analog(table).expect("analog run");
        assert_eq!(analog.report.segments, 2);
        assert_eq!(analog.report.degenerate_segments, vec![1]);
        assert!(analog.report.pixels > 0);
        assert!(analog.waveforms.total_charge(0.1) > 0.0);
    }

    #[test]
    fn segments_load_from_wrapped_or_bare_arrays() {
        let temp = TempDir::new().expect("tempdir should be created");
        let row = r#"{"x_start": 0.0, "y_start": 0.0, "z_start": 1.0,
                      "x_end": 0.0, "y_end": 2.0, "z_end": 1.0, "dE": 1.0}"#;
        let wrapped = temp.path().join("wrapped.json");
        let bare = temp.path().join("bare.json");
        fs::write(&wrapped, format!(r#"{{"segments": [{}]}}"#, row)).expect("write wrapped");
        fs::write(&bare, format!("[{}, {}]", row, row)).expect("write bare");

        let segments = load_segments(&wrapped).expect("wrapped input");
        assert_eq!(segments.len(), 1);
        assert!((segments[0].dx - 2.0).abs() < 1.0e-12);
        assert!((segments[0].dedx - 0.5).abs() < 1.0e-12);
        assert_eq!(load_segments(&bare).expect("bare input").len(), 2);
    }
}
