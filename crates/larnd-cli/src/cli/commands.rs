use super::CliError;
use super::helpers::*;
use larnd_core::domain::TrackTable;
use larnd_core::fit::{FitConfig, FitDriver, InitMode, OptimizerKind, SchedulerKind, StopSignal};
use larnd_core::modules::pixels::OverflowPolicy;
use larnd_core::modules::rng::RngStreamPool;
use larnd_core::pipeline::load_segments;
use std::path::PathBuf;

#[derive(clap::Args)]
pub(super) struct SimulateArgs {
    /// Segment file (JSON)
    #[arg(long = "input_filename")]
    input_filename: PathBuf,

    /// Detector properties (JSON)
    #[arg(long = "detector_properties")]
    detector_properties: PathBuf,

    /// Pixel layout (JSON)
    #[arg(long = "pixel_layout")]
    pixel_layout: PathBuf,

    /// Packet file to write
    #[arg(long = "output_filename")]
    output_filename: PathBuf,

    /// Tabulated field response (JSON)
    #[arg(long)]
    response: PathBuf,

    /// Seed for the electronics noise streams
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Switch off every electronics noise source
    #[arg(long)]
    noiseless: bool,

    /// What to do with segments touching more pixels than allowed
    #[arg(long, default_value = "skip")]
    overflow: String,

    /// JSON array of channel ids to leave out of the packet file
    #[arg(long = "bad_channels")]
    bad_channels: Option<PathBuf>,
}

#[derive(clap::Args)]
pub(super) struct FitArgs {
    /// Parameter list file (JSON) or comma-separated parameter names
    #[arg(long)]
    params: String,

    /// Segment file (JSON)
    #[arg(long = "input_file")]
    input_file: PathBuf,

    /// Detector properties (JSON)
    #[arg(long = "detector_properties")]
    detector_properties: PathBuf,

    /// Pixel layout (JSON)
    #[arg(long = "pixel_layout")]
    pixel_layout: PathBuf,

    /// Tabulated field response (JSON)
    #[arg(long)]
    response: PathBuf,

    /// Task seed; array jobs take it from the task id
    #[arg(long, env = "SLURM_ARRAY_TASK_ID", default_value_t = 0)]
    seed: u64,

    #[arg(long, default_value_t = 100)]
    iterations: usize,

    /// sgd or adam
    #[arg(long, default_value = "sgd")]
    optimizer: String,

    /// constant, step or exponential
    #[arg(long, default_value = "constant")]
    scheduler: String,

    /// Learning rate for parameters without their own
    #[arg(long)]
    lr: Option<f64>,

    /// Decay factor of the step and exponential schedulers
    #[arg(long, default_value_t = 0.95)]
    gamma: f64,

    /// Iterations between step-scheduler decays
    #[arg(long = "step-size", default_value_t = 10)]
    step_size: usize,

    /// Segments per batch
    #[arg(long = "max-batch-len", default_value_t = 200)]
    max_batch_len: usize,

    /// Number of batches to keep
    #[arg(long = "max-nbatch")]
    max_nbatch: Option<usize>,

    /// Iterations between checkpoints
    #[arg(long = "save-freq", default_value_t = 5)]
    save_freq: usize,

    /// nominal, vary-init or preload
    #[arg(long, default_value = "nominal")]
    init: String,

    /// History or checkpoint file used by `--init preload`
    #[arg(long = "preload-file")]
    preload_file: Option<PathBuf>,

    #[arg(long = "out-label", default_value = "fit")]
    out_label: String,

    #[arg(long = "output-dir", default_value = ".")]
    output_dir: PathBuf,

    /// Stop before the next iteration once this file exists
    #[arg(long = "stop-file")]
    stop_file: Option<PathBuf>,

    /// Keep the reference charge free of electronics noise
    #[arg(long = "no-target-noise")]
    no_target_noise: bool,

    /// Add electronics noise to the simulated guess as well
    #[arg(long = "noise-guess")]
    noise_guess: bool,
}

impl FitArgs {
    fn into_config(self) -> Result<(FitConfig, Option<PathBuf>), CliError> {
        let parameters = resolve_parameters(&self.params)?;
        let mut config = FitConfig::new(parameters, self.seed);
        config.iterations = self.iterations;
        config.optimizer = OptimizerKind::from_name(&self.optimizer).map_err(CliError::Compute)?;
        config.scheduler = SchedulerKind::from_name(&self.scheduler).map_err(CliError::Compute)?;
        config.lr = self.lr;
        config.gamma = self.gamma;
        config.step_size = self.step_size;
        config.max_batch_len = self.max_batch_len;
        config.max_nbatch = self.max_nbatch;
        config.save_freq = self.save_freq;
        config.init = InitMode::from_name(&self.init, self.preload_file.as_deref())
            .map_err(CliError::Compute)?;
        config.out_label = self.out_label;
        config.output_dir = self.output_dir;
        config.noise_target = !self.no_target_noise;
        config.noise_guess = self.noise_guess;
        Ok((config, self.stop_file))
    }
}

pub(super) fn run_simulate_command(args: SimulateArgs) -> Result<i32, CliError> {
    let overflow = parse_overflow(&args.overflow)?;
    let context = load_context(
        &args.detector_properties,
        &args.pixel_layout,
        args.noiseless,
        args.bad_channels.as_deref(),
    )?;
    let pipeline = build_pipeline(context, &args.response, overflow)?;
    let segments = load_segments(&args.input_filename).map_err(CliError::Compute)?;
    if segments.is_empty() {
        tracing::warn!(path = %args.input_filename.display(), "input holds no segments");
    }

    let pool = RngStreamPool::new(args.seed);
    let report = pipeline
        .run_to_file(TrackTable::new(segments), &pool, &args.output_filename)
        .map_err(CliError::Compute)?;
    println!("{}", render_simulation_summary(&report)?);
    println!("Packets written to {}", args.output_filename.display());
    Ok(0)
}

pub(super) fn run_fit_command(args: FitArgs) -> Result<i32, CliError> {
    let detector_properties = args.detector_properties.clone();
    let pixel_layout = args.pixel_layout.clone();
    let response = args.response.clone();
    let input_file = args.input_file.clone();
    let (config, stop_file) = args.into_config()?;

    ensure_output_dir(&config.output_dir)?;
    let context = load_context(&detector_properties, &pixel_layout, false, None)?;
    let pipeline = build_pipeline(context, &response, OverflowPolicy::Skip)?;
    let segments = load_segments(&input_file).map_err(CliError::Compute)?;

    let stop = match stop_file {
        Some(path) => StopSignal::with_file(path),
        None => StopSignal::new(),
    };
    let mut driver = FitDriver::new(config, pipeline, &segments).map_err(CliError::Compute)?;
    let report = driver.run(&stop).map_err(CliError::Compute)?;
    println!("{}", render_fit_summary(&report));
    Ok(0)
}
