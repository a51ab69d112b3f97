use crate::domain::{SimError, SimResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Reads and parses a JSON configuration or data file.
///
/// Missing or malformed files are configuration errors; `what` names the
/// input in the diagnostic.
pub fn read_json_file<T: DeserializeOwned>(path: &Path, what: &str) -> SimResult<T> {
    let content = fs::read_to_string(path).map_err(|source| {
        SimError::input_validation(
            "INPUT.READ",
            format!("failed to read {} '{}': {}", what, path.display(), source),
        )
    })?;
    serde_json::from_str(&content).map_err(|source| {
        SimError::input_validation(
            "INPUT.PARSE",
            format!("failed to parse {} '{}': {}", what, path.display(), source),
        )
    })
}

/// Serializes `value` to a `.tmp` sibling of `path` and renames it into
/// place once the write has been flushed, so a failed or interrupted write
/// never leaves a partial file behind under the final name.
pub fn write_json_atomically<T: Serialize>(path: &Path, value: &T) -> SimResult<()> {
    write_atomically(path, |writer| {
        serde_json::to_writer(&mut *writer, value).map_err(std::io::Error::other)?;
        writer.write_all(b"\n")
    })
}

fn staging_path(path: &Path) -> SimResult<PathBuf> {
    let mut name = path
        .file_name()
        .ok_or_else(|| {
            SimError::io_system(
                "IO.OUTPUT_WRITE",
                format!("output path '{}' names no file", path.display()),
            )
        })?
        .to_os_string();
    name.push(".tmp");
    Ok(path.with_file_name(name))
}

fn write_atomically<F>(path: &Path, write: F) -> SimResult<()>
where
    F: FnOnce(&mut BufWriter<&mut File>) -> std::io::Result<()>,
{
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|source| {
        SimError::io_system(
            "IO.OUTPUT_DIRECTORY",
            format!(
                "failed to create output directory '{}': {}",
                parent.display(),
                source
            ),
        )
    })?;

    let io_error = |source: std::io::Error| {
        SimError::io_system(
            "IO.OUTPUT_WRITE",
            format!("failed to write '{}': {}", path.display(), source),
        )
    };

    let staging = staging_path(path)?;
    let written = File::create(&staging).and_then(|mut file| {
        {
            let mut writer = BufWriter::new(&mut file);
            write(&mut writer)?;
            writer.flush()?;
        }
        file.sync_all()
    });
    if let Err(source) = written.and_then(|()| fs::rename(&staging, path)) {
        let _ = fs::remove_file(&staging);
        return Err(io_error(source));
    }
    Ok(())
}

/// Serde adapter for `f64` fields that may legitimately hold NaN or
/// infinities. JSON has no literal for them, so they are written as `null`
/// and read back as NaN.
pub mod nullable_f64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}
