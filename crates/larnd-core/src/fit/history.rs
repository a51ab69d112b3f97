//! Training history and its on-disk checkpoints.

use crate::domain::{ConfigResult, SimResult};
use crate::modules::serialization::{read_json_file, write_json_atomically};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingHistory {
    pub label: String,
    pub seed: u64,
    /// Physical value of every fitted parameter, starting with the initial
    /// guess and appended after each iteration.
    pub values: BTreeMap<String, Vec<f64>>,
    pub targets: BTreeMap<String, f64>,
    pub learning_rates: BTreeMap<String, f64>,
    /// Mean batch loss per iteration that completed at least one step.
    pub losses: Vec<f64>,
    pub skipped_steps: usize,
    pub iterations: usize,
}

impl TrainingHistory {
    pub fn load(path: &Path) -> ConfigResult<Self> {
        read_json_file(path, "training history")
    }

    pub fn last_value(&self, parameter: &str) -> Option<f64> {
        self.values.get(parameter).and_then(|values| values.last()).copied()
    }

    pub fn checkpoint_path(directory: &Path, label: &str, iteration: usize) -> PathBuf {
        directory.join(format!("history_{}_iter{}.json", label, iteration))
    }

    /// Writes the checkpoint for `iteration` and removes the one for
    /// `previous`, in that order, so a valid checkpoint exists at all times.
    pub fn save_checkpoint(
        &self,
        directory: &Path,
        iteration: usize,
        previous: Option<usize>,
    ) -> SimResult<PathBuf> {
        let path = Self::checkpoint_path(directory, &self.label, iteration);
        write_json_atomically(&path, self)?;

        if let Some(previous) = previous.filter(|previous| *previous != iteration) {
            let stale = Self::checkpoint_path(directory, &self.label, previous);
            match fs::remove_file(&stale) {
                Ok(()) => {}
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => tracing::warn!(
                    path = %stale.display(),
                    %error,
                    "could not remove previous checkpoint"
                ),
            }
        }
        tracing::debug!(path = %path.display(), iteration, "saved checkpoint");
        Ok(path)
    }
}
