use super::CliError;
use anyhow::Context;
use larnd_core::common::SimulationContext;
use larnd_core::fit::{FitReport, ParameterSpec, load_parameter_list, parse_parameter_names};
use larnd_core::modules::export::ExportSettings;
use larnd_core::modules::induction::{FieldResponse, TabulatedResponse};
use larnd_core::modules::pixels::OverflowPolicy;
use larnd_core::pipeline::{PipelineReport, SimulationPipeline};
use std::fs;
use std::path::Path;
use std::sync::Arc;

pub(super) fn load_context(
    detector_path: &Path,
    layout_path: &Path,
    noiseless: bool,
    bad_channels: Option<&Path>,
) -> Result<SimulationContext, CliError> {
    let context =
        SimulationContext::from_paths(detector_path, layout_path).map_err(CliError::Compute)?;
    if !noiseless && bad_channels.is_none() {
        return Ok(context);
    }
    let mut detector = context.detector().clone();
    if noiseless {
        detector.electronics = detector.electronics.noiseless();
    }
    if let Some(path) = bad_channels {
        let channels = ExportSettings::load_bad_channels(path).map_err(CliError::Compute)?;
        detector.export.bad_channels.extend(channels);
    }
    context.with_detector(detector).map_err(CliError::Compute)
}

pub(super) fn parse_overflow(name: &str) -> Result<OverflowPolicy, CliError> {
    OverflowPolicy::from_name(name).ok_or_else(|| {
        CliError::Usage(format!(
            "Invalid overflow policy '{}'; expected skip, truncate or fail.",
            name
        ))
    })
}

pub(super) fn build_pipeline(
    context: SimulationContext,
    response_path: &Path,
    overflow: OverflowPolicy,
) -> Result<SimulationPipeline, CliError> {
    let response = TabulatedResponse::from_path(response_path).map_err(CliError::Compute)?;
    let response: Arc<dyn FieldResponse> = Arc::new(response);
    SimulationPipeline::new(context, response, overflow).map_err(CliError::Compute)
}

/// `--params` names a JSON parameter file when it exists, otherwise it is a
/// comma-separated list of names.
pub(super) fn resolve_parameters(value: &str) -> Result<Vec<ParameterSpec>, CliError> {
    let path = Path::new(value);
    let specs = if path.is_file() {
        load_parameter_list(path)
    } else {
        parse_parameter_names(value)
    };
    specs.map_err(CliError::Compute)
}

pub(super) fn ensure_output_dir(path: &Path) -> Result<(), CliError> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create output directory '{}'", path.display()))?;
    Ok(())
}

pub(super) fn render_simulation_summary(report: &PipelineReport) -> Result<String, CliError> {
    let json = serde_json::to_string_pretty(report).context("failed to render run report")?;
    Ok(json)
}

pub(super) fn render_fit_summary(report: &FitReport) -> String {
    let mut lines = Vec::new();
    let state = if report.stopped { "stopped" } else { "finished" };
    lines.push(format!(
        "Fit '{}' {} after {} iterations.",
        report.label, state, report.iterations
    ));
    for (parameter, value) in &report.final_values {
        lines.push(format!("  {:<10} {:.6e}", parameter.as_str(), value));
    }
    if let Some(loss) = report.losses.last() {
        lines.push(format!("  final loss {:.6e}", loss));
    }
    if let Some(path) = &report.checkpoint {
        lines.push(format!("Checkpoint: {}", path.display()));
    }
    lines.join("\n")
}
