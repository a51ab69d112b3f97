//! Batch fit loop.
//!
//! Reference charge maps are simulated once from the task's tracks under
//! target parameters drawn from the seed. Every iteration then walks the
//! batches: for each event the analog pipeline runs at the current guess and
//! at `±fd_step` along every normalised coordinate, the central differences
//! of the loss give the gradient, and the optimiser takes one step per batch.
//! All probes of an event share their noise stream, so the differences see
//! the parameter change and not the noise.

use super::history::TrainingHistory;
use super::loss::{EmbeddedCharge, add_charge_noise, charge_loss, embed_waveforms};
use super::optim::{Optimizer, OptimizerKind, Scheduler, SchedulerKind};
use super::params::{FitParameter, ParameterSpec, ParameterVector};
use crate::domain::{ConfigResult, Segment, SimError, SimResult, TrackTable};
use crate::modules::rng::RngStreamPool;
use crate::pipeline::SimulationPipeline;
use rand::Rng;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const TARGET_SCOPE: u64 = 1;
const INIT_SCOPE: u64 = 2;
const TARGET_NOISE_SCOPE: u64 = 3;
const ITERATION_SCOPE: u64 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitMode {
    Nominal,
    /// Uniform draw inside each parameter's range.
    VaryInit,
    /// Continues a previous history or checkpoint file from its last values.
    Preload(PathBuf),
}

impl InitMode {
    pub fn from_name(name: &str, preload: Option<&Path>) -> ConfigResult<Self> {
        match (name, preload) {
            ("nominal", _) => Ok(Self::Nominal),
            ("vary-init", _) => Ok(Self::VaryInit),
            ("preload", Some(path)) => Ok(Self::Preload(path.to_path_buf())),
            ("preload", None) => Err(SimError::input_validation(
                "INPUT.FIT_INIT",
                "--init preload needs --preload-file",
            )),
            (other, _) => Err(SimError::input_validation(
                "INPUT.FIT_INIT",
                format!(
                    "unknown init mode '{}', expected nominal, vary-init or preload",
                    other
                ),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FitConfig {
    pub parameters: Vec<ParameterSpec>,
    pub iterations: usize,
    pub optimizer: OptimizerKind,
    /// Used for parameters without their own rate.
    pub lr: Option<f64>,
    pub scheduler: SchedulerKind,
    pub gamma: f64,
    pub step_size: usize,
    pub max_batch_len: usize,
    pub max_nbatch: Option<usize>,
    pub save_freq: usize,
    pub init: InitMode,
    pub seed: u64,
    pub out_label: String,
    pub output_dir: PathBuf,
    /// Finite-difference step in normalised units.
    pub fd_step: f64,
    pub loss_bin_ticks: usize,
    pub noise_target: bool,
    pub noise_guess: bool,
}

impl FitConfig {
    pub fn new(parameters: Vec<ParameterSpec>, seed: u64) -> Self {
        Self {
            parameters,
            iterations: 100,
            optimizer: OptimizerKind::Sgd,
            lr: None,
            scheduler: SchedulerKind::Constant,
            gamma: 0.95,
            step_size: 10,
            max_batch_len: 200,
            max_nbatch: None,
            save_freq: 5,
            init: InitMode::Nominal,
            seed,
            out_label: "fit".to_string(),
            output_dir: PathBuf::from("."),
            fd_step: 1.0e-2,
            loss_bin_ticks: 10,
            noise_target: true,
            noise_guess: false,
        }
    }

    /// `<out_label>_seed<seed>`, unique per array task.
    pub fn label(&self) -> String {
        format!("{}_seed{}", self.out_label, self.seed)
    }

    fn learning_rates(&self) -> ConfigResult<Vec<f64>> {
        self.parameters
            .iter()
            .map(|spec| {
                spec.lr.or(self.lr).ok_or_else(|| {
                    SimError::input_validation(
                        "INPUT.FIT_LR",
                        format!(
                            "no learning rate for '{}': pass --lr or give one in the parameter file",
                            spec.parameter
                        ),
                    )
                })
            })
            .collect()
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.parameters.is_empty() {
            return Err(SimError::input_validation(
                "INPUT.FIT_PARAMETER",
                "at least one parameter must be fitted",
            ));
        }
        if let Some(lr) = self.lr {
            if !(lr.is_finite() && lr > 0.0) {
                return Err(SimError::input_validation(
                    "INPUT.FIT_LR",
                    format!("--lr must be positive, got {}", lr),
                ));
            }
        }
        let counts = [
            ("--max-batch-len", self.max_batch_len),
            ("--save-freq", self.save_freq),
            ("--step-size", self.step_size),
            ("--loss-bin-ticks", self.loss_bin_ticks),
        ];
        for (flag, value) in counts {
            if value == 0 {
                return Err(SimError::input_validation(
                    "INPUT.FIT_CONFIG",
                    format!("{} must be at least 1", flag),
                ));
            }
        }
        if self.max_nbatch == Some(0) {
            return Err(SimError::input_validation(
                "INPUT.FIT_CONFIG",
                "--max-nbatch must be at least 1",
            ));
        }
        if !(self.gamma.is_finite() && self.gamma > 0.0) {
            return Err(SimError::input_validation(
                "INPUT.FIT_CONFIG",
                format!("--gamma must be positive, got {}", self.gamma),
            ));
        }
        if !(self.fd_step.is_finite() && self.fd_step > 0.0) {
            return Err(SimError::input_validation(
                "INPUT.FIT_CONFIG",
                format!("finite-difference step must be positive, got {}", self.fd_step),
            ));
        }
        Ok(())
    }
}

/// Cooperative stop request, checked between iterations.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
    file: Option<PathBuf>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also stop once `path` exists.
    pub fn with_file(path: PathBuf) -> Self {
        Self {
            flag: Arc::default(),
            file: Some(path),
        }
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.file.as_deref().is_some_and(Path::exists)
    }
}

/// Events of one batch, each a list of segments.
pub type Batch = Vec<Vec<Segment>>;

/// Groups segments with `dx > 0` by event and packs whole events into
/// batches of at most `max_batch_len` segments. An event longer than that
/// forms a batch of its own.
pub fn build_batches(
    segments: &[Segment],
    max_batch_len: usize,
    max_nbatch: Option<usize>,
) -> Vec<Batch> {
    let mut events: BTreeMap<u32, Vec<Segment>> = BTreeMap::new();
    for segment in segments.iter().filter(|segment| segment.dx > 0.0) {
        events.entry(segment.event_id).or_default().push(segment.clone());
    }

    let mut batches = Vec::new();
    let mut current: Batch = Vec::new();
    let mut current_len = 0;
    for (event_id, event) in events {
        if event.len() > max_batch_len {
            tracing::debug!(event_id, segments = event.len(), "event exceeds the batch length");
        }
        if !current.is_empty() && current_len + event.len() > max_batch_len {
            batches.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current_len += event.len();
        current.push(event);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    if let Some(limit) = max_nbatch {
        batches.truncate(limit);
    }
    batches
}

#[derive(Debug, Clone, PartialEq)]
pub struct FitReport {
    pub label: String,
    pub iterations: usize,
    pub stopped: bool,
    pub checkpoint: Option<PathBuf>,
    pub final_values: Vec<(FitParameter, f64)>,
    pub losses: Vec<f64>,
}

pub struct FitDriver {
    config: FitConfig,
    pipeline: SimulationPipeline,
    batches: Vec<Batch>,
    targets: Vec<Vec<EmbeddedCharge>>,
    guess: ParameterVector,
    optimizer: Optimizer,
    scheduler: Scheduler,
    history: TrainingHistory,
    pool: RngStreamPool,
}

impl FitDriver {
    /// Validates the configuration, draws the target parameters and
    /// simulates the reference charge of every event.
    pub fn new(
        config: FitConfig,
        pipeline: SimulationPipeline,
        segments: &[Segment],
    ) -> SimResult<Self> {
        config.validate()?;
        let rates = config.learning_rates()?;
        let batches = build_batches(segments, config.max_batch_len, config.max_nbatch);
        if batches.is_empty() {
            return Err(SimError::input_validation(
                "INPUT.FIT_EVENTS",
                "no segment with positive length to fit against",
            ));
        }

        let pool = RngStreamPool::new(config.seed);
        let parameters: Vec<FitParameter> =
            config.parameters.iter().map(|spec| spec.parameter).collect();
        let base = pipeline.context().detector().clone();

        let mut target_rng = pool.derive(TARGET_SCOPE).stream(0);
        let target_values = parameters
            .iter()
            .map(|parameter| {
                let range = parameter.range();
                target_rng.random_range(range.down..range.up) / range.nominal
            })
            .collect();
        let target = ParameterVector::new(parameters.clone(), target_values);
        let target_pipeline = pipeline
            .with_context(pipeline.context().with_detector(target.apply(&base))?)?;

        let (guess, previous) = match &config.init {
            InitMode::Nominal => (
                ParameterVector::from_detector(parameters.clone(), &base),
                None,
            ),
            InitMode::VaryInit => {
                let mut rng = pool.derive(INIT_SCOPE).stream(0);
                let values = parameters
                    .iter()
                    .map(|parameter| {
                        let range = parameter.range();
                        rng.random_range(range.down..range.up) / range.nominal
                    })
                    .collect();
                (ParameterVector::new(parameters.clone(), values), None)
            }
            InitMode::Preload(path) => {
                let previous = TrainingHistory::load(path)?;
                let values = parameters
                    .iter()
                    .map(|parameter| {
                        previous
                            .last_value(parameter.as_str())
                            .map(|value| value / parameter.range().nominal)
                            .ok_or_else(|| {
                                SimError::input_validation(
                                    "INPUT.FIT_PRELOAD",
                                    format!(
                                        "'{}' has no history for parameter '{}'",
                                        path.display(),
                                        parameter
                                    ),
                                )
                            })
                    })
                    .collect::<ConfigResult<Vec<f64>>>()?;
                (ParameterVector::new(parameters.clone(), values), Some(previous))
            }
        };

        let target_noise = pool.derive(TARGET_NOISE_SCOPE);
        let sigma = base.electronics.uncorrelated_noise_charge;
        let mut targets = Vec::with_capacity(batches.len());
        for (batch_index, batch) in batches.iter().enumerate() {
            let noise = target_noise.derive(batch_index as u64);
            let mut embedded = Vec::with_capacity(batch.len());
            for (event_index, event) in batch.iter().enumerate() {
                let analog = target_pipeline.run_analog(TrackTable::new(event.clone()))?;
                let mut charge = embed_waveforms(
                    &analog.waveforms,
                    target_pipeline.context(),
                    config.loss_bin_ticks,
                );
                if config.noise_target {
                    add_charge_noise(&mut charge, sigma, &mut noise.stream(event_index as u64));
                }
                embedded.push(charge);
            }
            targets.push(embedded);
        }

        // a preloaded history is continued: its trajectory, losses and
        // iteration count carry over and new checkpoints number on from it
        let resumed = previous.is_some();
        let mut history = previous.unwrap_or_default();
        history.label = config.label();
        history.seed = config.seed;
        for (index, parameter) in parameters.iter().enumerate() {
            let name = parameter.as_str().to_string();
            if !resumed {
                history.values.insert(name.clone(), vec![guess.physical(index)]);
            }
            history.targets.insert(name.clone(), target.physical(index));
            history.learning_rates.insert(name, rates[index]);
            tracing::info!(
                parameter = %parameter,
                target = target.physical(index),
                initial = guess.physical(index),
                "fit parameter"
            );
        }

        let scheduler = Scheduler {
            kind: config.scheduler,
            gamma: config.gamma,
            step_size: config.step_size,
        };
        let optimizer = Optimizer::new(config.optimizer, rates);
        tracing::info!(
            label = %config.label(),
            resumed_at = history.iterations,
            batches = batches.len(),
            events = batches.iter().map(Vec::len).sum::<usize>(),
            "fit initialised"
        );

        Ok(Self {
            config,
            pipeline,
            batches,
            targets,
            guess,
            optimizer,
            scheduler,
            history,
            pool,
        })
    }

    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    pub fn guess(&self) -> &ParameterVector {
        &self.guess
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    /// Loss of one event at `vector`; any failure to simulate yields NaN.
    fn event_loss(
        &self,
        vector: &ParameterVector,
        batch: usize,
        event: usize,
        noise: &RngStreamPool,
    ) -> f64 {
        let detector = vector.apply(self.pipeline.context().detector());
        let pipeline = match self
            .pipeline
            .context()
            .with_detector(detector)
            .and_then(|context| self.pipeline.with_context(context))
        {
            Ok(pipeline) => pipeline,
            Err(error) => {
                tracing::debug!(%error, "probe parameters rejected");
                return f64::NAN;
            }
        };

        let segments = self.batches[batch][event].clone();
        let analog = match pipeline.run_analog(TrackTable::new(segments)) {
            Ok(analog) => analog,
            Err(error) => {
                tracing::debug!(%error, "probe simulation failed");
                return f64::NAN;
            }
        };
        let mut output =
            embed_waveforms(&analog.waveforms, pipeline.context(), self.config.loss_bin_ticks);
        if self.config.noise_guess {
            let sigma = pipeline.context().detector().electronics.uncorrelated_noise_charge;
            add_charge_noise(&mut output, sigma, &mut noise.stream(event as u64));
        }
        charge_loss(&output, &self.targets[batch][event])
    }

    /// Loss and central-difference gradient for one event.
    fn event_gradient(&self, batch: usize, event: usize, noise: &RngStreamPool) -> (f64, Vec<f64>) {
        let h = self.config.fd_step;
        let mut probes = vec![self.guess.clone()];
        for index in 0..self.guess.len() {
            probes.push(self.guess.shifted(index, h));
            probes.push(self.guess.shifted(index, -h));
        }

        let losses: Vec<f64> = probes
            .par_iter()
            .map(|probe| self.event_loss(probe, batch, event, noise))
            .collect();
        let gradient = (0..self.guess.len())
            .map(|index| (losses[1 + 2 * index] - losses[2 + 2 * index]) / (2.0 * h))
            .collect();
        (losses[0], gradient)
    }

    /// One optimiser step on a batch; `None` when the step was skipped.
    fn batch_step(&mut self, iteration: usize, batch: usize, scale: f64) -> Option<f64> {
        let noise = self
            .pool
            .derive(ITERATION_SCOPE)
            .derive(iteration as u64)
            .derive(batch as u64);

        let mut losses = Vec::new();
        let mut gradient = vec![0.0; self.guess.len()];
        for event in 0..self.batches[batch].len() {
            let (loss, event_gradient) = self.event_gradient(batch, event, &noise);
            if !loss.is_finite() {
                tracing::debug!(iteration, batch, event, "dropping event with non-finite loss");
                continue;
            }
            losses.push(loss);
            gradient
                .iter_mut()
                .zip(event_gradient)
                .for_each(|(sum, value)| *sum += value);
        }

        if losses.is_empty() {
            tracing::warn!(iteration, batch, "no event produced a finite loss; step skipped");
            self.history.skipped_steps += 1;
            return None;
        }
        let count = losses.len() as f64;
        let loss = losses.iter().sum::<f64>() / count;
        gradient.iter_mut().for_each(|value| *value /= count);
        if !(loss.is_finite() && gradient.iter().all(|value| value.is_finite())) {
            tracing::warn!(iteration, batch, loss, "non-finite gradient; step skipped");
            self.history.skipped_steps += 1;
            return None;
        }

        self.optimizer
            .step(self.guess.values_mut(), &gradient, scale);
        self.guess.clamp_to_ranges();
        tracing::debug!(iteration, batch, loss, ?gradient, "optimiser step");
        Some(loss)
    }

    /// Runs until the iteration budget is spent or a stop is requested.
    pub fn run(&mut self, stop: &StopSignal) -> SimResult<FitReport> {
        let output_dir = self.config.output_dir.clone();
        let save_freq = self.config.save_freq;
        let mut last_saved: Option<usize> = None;
        let mut checkpoint = None;
        let mut stopped = false;
        let start = self.history.iterations;

        for iteration in start..start + self.config.iterations {
            if stop.is_requested() {
                tracing::info!(iteration, "stop requested");
                stopped = true;
                break;
            }
            let span = tracing::info_span!("fit_iteration", iteration);
            let _entered = span.enter();

            let scale = self.scheduler.factor(iteration);
            let batch_losses: Vec<f64> = (0..self.batches.len())
                .filter_map(|batch| self.batch_step(iteration, batch, scale))
                .collect();

            for (index, parameter) in self.guess.parameters().iter().enumerate() {
                if let Some(values) = self.history.values.get_mut(parameter.as_str()) {
                    values.push(self.guess.physical(index));
                }
            }
            if !batch_losses.is_empty() {
                let mean = batch_losses.iter().sum::<f64>() / batch_losses.len() as f64;
                self.history.losses.push(mean);
                tracing::info!(iteration, loss = mean, lr_scale = scale, "iteration finished");
            }
            self.history.iterations = iteration + 1;

            if self.history.iterations % save_freq == 0 {
                let path =
                    self.history
                        .save_checkpoint(&output_dir, self.history.iterations, last_saved)?;
                last_saved = Some(self.history.iterations);
                checkpoint = Some(path);
            }
        }

        if self.history.iterations > start && last_saved != Some(self.history.iterations) {
            let path =
                self.history
                    .save_checkpoint(&output_dir, self.history.iterations, last_saved)?;
            checkpoint = Some(path);
        }

        let final_values = self
            .guess
            .parameters()
            .iter()
            .enumerate()
            .map(|(index, parameter)| (*parameter, self.guess.physical(index)))
            .collect();
        Ok(FitReport {
            label: self.history.label.clone(),
            iterations: self.history.iterations,
            stopped,
            checkpoint,
            final_values,
            losses: self.history.losses.clone(),
        })
    }
}
