use larnd_core::modules::export::read_packet_file;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

const PITCH: f64 = 0.4434;

struct Inputs {
    segments: PathBuf,
    detector: PathBuf,
    layout: PathBuf,
    response: PathBuf,
}

fn write_inputs(root: &Path) -> Inputs {
    let inputs = Inputs {
        segments: root.join("segments.json"),
        detector: root.join("detector.json"),
        layout: root.join("layout.json"),
        response: root.join("response.json"),
    };
    let segments = r#"
    {
      "segments": [
        { "eventID": 0, "trackID": 1,
          "x_start": 1.0, "y_start": 2.0, "z_start": 4.0,
          "x_end": 2.5, "y_end": 2.2, "z_end": 4.5, "dE": 3.0 },
        { "eventID": 1, "trackID": 2,
          "x_start": -3.0, "y_start": 5.0, "z_start": 8.0,
          "x_end": -2.0, "y_end": 5.6, "z_end": 8.2, "dE": 2.0 }
      ]
    }
    "#;
    fs::write(&inputs.segments, segments).expect("write segments");
    fs::write(&inputs.detector, r#"{ "projection": { "neighbor_radius": 0 } }"#)
        .expect("write detector");
    fs::write(&inputs.layout, "{}").expect("write layout");
    fs::write(
        &inputs.response,
        format!(
            r#"{{ "bin_width": {}, "time_sampling": 0.1, "shape": [1, 1, 1], "values": [10.0] }}"#,
            PITCH
        ),
    )
    .expect("write response");
    inputs
}

fn larnd_sim(args: &[&str], envs: &[(&str, &str)]) -> Output {
    let binary_path = env!("CARGO_BIN_EXE_larnd-sim");
    let mut command = Command::new(binary_path);
    command.args(args).env_remove("SLURM_ARRAY_TASK_ID").env("RUST_LOG", "warn");
    for (key, value) in envs {
        command.env(key, value);
    }
    command.output().expect("larnd-sim should start")
}

fn path_str(path: &Path) -> &str {
    path.to_str().expect("utf-8 path")
}

#[test]
fn simulate_writes_a_packet_file() {
    let temp = TempDir::new().expect("tempdir should be created");
    let inputs = write_inputs(temp.path());
    let output_path = temp.path().join("out/packets.json");

    let output = larnd_sim(
        &[
            "simulate",
            "--input_filename",
            path_str(&inputs.segments),
            "--detector_properties",
            path_str(&inputs.detector),
            "--pixel_layout",
            path_str(&inputs.layout),
            "--response",
            path_str(&inputs.response),
            "--output_filename",
            path_str(&output_path),
            "--noiseless",
            "--seed",
            "5",
        ],
        &[],
    );
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let report: serde_json::Value = {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let json_end = stdout.rfind('}').expect("report on stdout");
        serde_json::from_str(&stdout[..=json_end]).expect("report is JSON")
    };
    assert_eq!(report["segments"], 2);

    let file = read_packet_file(&output_path).expect("packet file should load");
    assert!(!file.packets.is_empty());
    assert_eq!(report["export"]["written"], file.packets.len());
    assert_eq!(file.tracks.len(), 2);
    let events: Vec<u32> = file.packets.iter().map(|packet| packet.event_id).collect();
    assert!(events.contains(&0));
    assert!(events.contains(&1));
    assert_eq!(report["export"]["triggers"], 4);
}

#[test]
fn bad_channels_are_left_out_of_the_packet_file() {
    let temp = TempDir::new().expect("tempdir should be created");
    let inputs = write_inputs(temp.path());
    let simulate = |output: &Path, extra: &[&str]| {
        let mut args = vec![
            "simulate",
            "--input_filename",
            path_str(&inputs.segments),
            "--detector_properties",
            path_str(&inputs.detector),
            "--pixel_layout",
            path_str(&inputs.layout),
            "--response",
            path_str(&inputs.response),
            "--output_filename",
            path_str(output),
            "--noiseless",
        ];
        args.extend_from_slice(extra);
        larnd_sim(&args, &[])
    };

    let full_path = temp.path().join("full.json");
    assert!(simulate(&full_path, &[]).status.success());
    let full = read_packet_file(&full_path).expect("full packet file");
    let masked_channel = full.packets[0].channel_id;
    let expected_masked = full
        .packets
        .iter()
        .filter(|packet| packet.channel_id == masked_channel)
        .count();

    let bad_channels = temp.path().join("bad_channels.json");
    fs::write(&bad_channels, format!("[{}]", masked_channel)).expect("write bad channels");
    let masked_path = temp.path().join("masked.json");
    let output = simulate(&masked_path, &["--bad_channels", path_str(&bad_channels)]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let masked = read_packet_file(&masked_path).expect("masked packet file");
    assert_eq!(masked.packets.len(), full.packets.len() - expected_masked);
    assert!(masked.packets.iter().all(|packet| packet.channel_id != masked_channel));
}

#[test]
fn missing_detector_file_exits_with_input_error() {
    let temp = TempDir::new().expect("tempdir should be created");
    let inputs = write_inputs(temp.path());
    let missing = temp.path().join("missing.json");

    let output = larnd_sim(
        &[
            "simulate",
            "--input_filename",
            path_str(&inputs.segments),
            "--detector_properties",
            path_str(&missing),
            "--pixel_layout",
            path_str(&inputs.layout),
            "--response",
            path_str(&inputs.response),
            "--output_filename",
            path_str(&temp.path().join("packets.json")),
        ],
        &[],
    );
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("ERROR: [INPUT.READ]"), "stderr: {}", stderr);
    assert!(stderr.contains("FATAL EXIT CODE: 2"));
    assert!(!temp.path().join("packets.json").exists());
}

#[test]
fn unknown_overflow_policy_is_a_usage_error() {
    let temp = TempDir::new().expect("tempdir should be created");
    let inputs = write_inputs(temp.path());
    let output = larnd_sim(
        &[
            "simulate",
            "--input_filename",
            path_str(&inputs.segments),
            "--detector_properties",
            path_str(&inputs.detector),
            "--pixel_layout",
            path_str(&inputs.layout),
            "--response",
            path_str(&inputs.response),
            "--output_filename",
            path_str(&temp.path().join("packets.json")),
            "--overflow",
            "wrap",
        ],
        &[],
    );
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("[INPUT.CLI_USAGE]"));
}

#[test]
fn fit_takes_its_seed_from_the_array_task() {
    let temp = TempDir::new().expect("tempdir should be created");
    let inputs = write_inputs(temp.path());
    let output_dir = temp.path().join("fits");

    let output = larnd_sim(
        &[
            "fit",
            "--params",
            "vdrift",
            "--lr",
            "0.05",
            "--input_file",
            path_str(&inputs.segments),
            "--detector_properties",
            path_str(&inputs.detector),
            "--pixel_layout",
            path_str(&inputs.layout),
            "--response",
            path_str(&inputs.response),
            "--iterations",
            "2",
            "--save-freq",
            "1",
            "--out-label",
            "scan",
            "--output-dir",
            path_str(&output_dir),
        ],
        &[("SLURM_ARRAY_TASK_ID", "11")],
    );
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(String::from_utf8_lossy(&output.stdout).contains("Fit 'scan_seed11' finished"));

    let names: Vec<String> = fs::read_dir(&output_dir)
        .expect("output dir")
        .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["history_scan_seed11_iter2.json".to_string()]);
}

#[test]
fn fit_rejects_unknown_parameters() {
    let temp = TempDir::new().expect("tempdir should be created");
    let inputs = write_inputs(temp.path());
    let output = larnd_sim(
        &[
            "fit",
            "--params",
            "vdrift,colour",
            "--lr",
            "0.1",
            "--input_file",
            path_str(&inputs.segments),
            "--detector_properties",
            path_str(&inputs.detector),
            "--pixel_layout",
            path_str(&inputs.layout),
            "--response",
            path_str(&inputs.response),
        ],
        &[],
    );
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("[INPUT.FIT_PARAMETER]"));
}
