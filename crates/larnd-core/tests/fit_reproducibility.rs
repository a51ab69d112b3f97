use larnd_core::common::{DetectorProperties, PixelLayout, SimulationContext};
use larnd_core::domain::Segment;
use larnd_core::fit::{
    FitConfig, FitDriver, FitParameter, InitMode, OptimizerKind, ParameterSpec, StopSignal,
    TrainingHistory,
};
use larnd_core::modules::induction::{FieldResponse, TabulatedResponse};
use larnd_core::modules::pixels::{OverflowPolicy, ProjectionSettings};
use larnd_core::pipeline::SimulationPipeline;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn pipeline() -> SimulationPipeline {
    let detector = DetectorProperties {
        projection: ProjectionSettings {
            neighbor_radius: 0,
            ..ProjectionSettings::default()
        },
        sampled_points: 10,
        ..DetectorProperties::default()
    };
    let context =
        SimulationContext::new(detector, PixelLayout::default()).expect("valid context");
    let response: Arc<dyn FieldResponse> = Arc::new(TabulatedResponse::delta(
        context.layout().pixel_pitch,
        context.detector().time_sampling,
    ));
    SimulationPipeline::new(context, response, OverflowPolicy::Skip).expect("valid pipeline")
}

fn segments() -> Vec<Segment> {
    let mut segments = Vec::new();
    for (event, z) in [(0_u32, 4.0), (1, 9.0)] {
        let mut first = Segment::from_endpoints([1.0, 2.0, z], [1.6, 2.1, z + 0.5], 1.5);
        let mut second = Segment::from_endpoints([1.6, 2.1, z + 0.5], [2.2, 2.2, z + 1.0], 1.5);
        first.event_id = event;
        second.event_id = event;
        segments.push(first);
        segments.push(second);
    }
    segments
}

fn config(output_dir: &Path) -> FitConfig {
    let mut config = FitConfig::new(
        vec![ParameterSpec {
            parameter: FitParameter::Vdrift,
            lr: Some(0.05),
        }],
        7,
    );
    config.iterations = 3;
    config.optimizer = OptimizerKind::Adam;
    config.max_batch_len = 2;
    config.save_freq = 2;
    config.output_dir = output_dir.to_path_buf();
    config
}

#[test]
fn same_seed_gives_identical_trajectories() {
    let first_dir = TempDir::new().expect("tempdir should be created");
    let second_dir = TempDir::new().expect("tempdir should be created");

    let mut first = FitDriver::new(config(first_dir.path()), pipeline(), &segments())
        .expect("first driver");
    let mut second = FitDriver::new(config(second_dir.path()), pipeline(), &segments())
        .expect("second driver");
    assert_eq!(first.batches().len(), 2);

    let first_report = first.run(&StopSignal::new()).expect("first fit");
    let second_report = second.run(&StopSignal::new()).expect("second fit");
    assert_eq!(first_report.iterations, 3);
    assert!(!first_report.stopped);
    assert_eq!(first_report.losses.len(), 3);
    assert!(first_report.losses.iter().all(|loss| loss.is_finite()));
    assert_eq!(first_report.losses, second_report.losses);
    assert_eq!(first.history(), second.history());

    let vdrift = &first.history().values["vdrift"];
    assert_eq!(vdrift.len(), 4);
    let range = FitParameter::Vdrift.range();
    assert!(vdrift.iter().all(|value| *value >= range.down && *value <= range.up));
}

#[test]
fn only_the_latest_checkpoint_survives() {
    let temp = TempDir::new().expect("tempdir should be created");
    let mut driver =
        FitDriver::new(config(temp.path()), pipeline(), &segments()).expect("driver");
    let report = driver.run(&StopSignal::new()).expect("fit");

    let names: Vec<String> = fs::read_dir(temp.path())
        .expect("output dir")
        .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["history_fit_seed7_iter3.json".to_string()]);

    let checkpoint = report.checkpoint.expect("final checkpoint");
    let restored = TrainingHistory::load(&checkpoint).expect("checkpoint loads");
    assert_eq!(&restored, driver.history());
    assert_eq!(restored.iterations, 3);
}

#[test]
fn preload_resumes_from_the_last_recorded_value() {
    let temp = TempDir::new().expect("tempdir should be created");
    let mut driver =
        FitDriver::new(config(temp.path()), pipeline(), &segments()).expect("driver");
    let report = driver.run(&StopSignal::new()).expect("fit");
    let checkpoint = report.checkpoint.expect("final checkpoint");
    let first = driver.history().clone();
    let last = report.final_values[0].1;

    let mut resumed = config(temp.path());
    resumed.init = InitMode::Preload(checkpoint.clone());
    let mut driver = FitDriver::new(resumed, pipeline(), &segments()).expect("resumed driver");
    assert_eq!(driver.history().iterations, 3);
    assert_eq!(driver.history().losses, first.losses);
    let start = driver.guess().physical(0);
    assert!((start - last).abs() < 1.0e-12 * last);

    let report = driver.run(&StopSignal::new()).expect("resumed fit");
    assert_eq!(report.iterations, 6);
    let history = driver.history();
    assert_eq!(history.losses.len(), 6);
    assert_eq!(&history.losses[..3], &first.losses[..]);
    let vdrift = &history.values["vdrift"];
    assert_eq!(vdrift.len(), 7);
    assert_eq!(&vdrift[..4], &first.values["vdrift"][..]);

    let resumed_checkpoint = report.checkpoint.expect("resumed checkpoint");
    assert_eq!(
        resumed_checkpoint.file_name().and_then(|name| name.to_str()),
        Some("history_fit_seed7_iter6.json")
    );
    let untouched = TrainingHistory::load(&checkpoint).expect("original checkpoint survives");
    assert_eq!(untouched, first);
}

#[test]
fn requested_stop_ends_the_run_before_the_first_iteration() {
    let temp = TempDir::new().expect("tempdir should be created");
    let stop_file = temp.path().join("STOP");
    fs::write(&stop_file, "").expect("create stop file");

    let mut driver =
        FitDriver::new(config(temp.path()), pipeline(), &segments()).expect("driver");
    let report = driver
        .run(&StopSignal::with_file(stop_file))
        .expect("stopped fit");
    assert!(report.stopped);
    assert_eq!(report.iterations, 0);
    assert!(report.checkpoint.is_none());
}

#[test]
fn missing_learning_rate_is_rejected() {
    let temp = TempDir::new().expect("tempdir should be created");
    let mut config = config(temp.path());
    config.parameters[0].lr = None;
    let error = FitDriver::new(config, pipeline(), &segments())
        .err()
        .expect("no learning rate");
    assert_eq!(error.placeholder(), "INPUT.FIT_LR");
}

fn broken_event(event: u32) -> Vec<Segment> {
    let mut first = Segment::from_endpoints([1.0, 2.0, 6.0], [1.6, 2.1, 6.5], f64::NAN);
    let mut second = Segment::from_endpoints([1.6, 2.1, 6.5], [2.2, 2.2, 7.0], f64::NAN);
    first.event_id = event;
    second.event_id = event;
    vec![first, second]
}

#[test]
fn batches_without_a_finite_loss_skip_their_step() {
    let temp = TempDir::new().expect("tempdir should be created");
    let mut driver =
        FitDriver::new(config(temp.path()), pipeline(), &broken_event(0)).expect("driver");
    let initial = driver.guess().physical(0);

    let report = driver.run(&StopSignal::new()).expect("fit keeps going");
    assert!(!report.stopped);
    assert_eq!(report.iterations, 3);
    let history = driver.history();
    assert_eq!(history.skipped_steps, 3);
    assert!(history.losses.is_empty());
    assert!(history.values["vdrift"].iter().all(|value| *value == initial));
}

#[test]
fn a_broken_event_does_not_stall_the_healthy_batches() {
    let temp = TempDir::new().expect("tempdir should be created");
    let mut segments = segments();
    segments.extend(broken_event(5));
    let mut driver = FitDriver::new(config(temp.path()), pipeline(), &segments).expect("driver");
    assert_eq!(driver.batches().len(), 3);

    let report = driver.run(&StopSignal::new()).expect("fit");
    assert_eq!(report.iterations, 3);
    let history = driver.history();
    assert_eq!(history.skipped_steps, 3);
    assert_eq!(history.losses.len(), 3);
    assert!(history.losses.iter().all(|loss| loss.is_finite()));
}
