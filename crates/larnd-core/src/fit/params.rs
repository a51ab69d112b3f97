//! Fittable detector constants and their normalised vector.

use crate::common::DetectorProperties;
use crate::domain::{ConfigResult, SimError};
use crate::modules::serialization::read_json_file;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt::{Display, Formatter};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FitParameter {
    Vdrift,
    Lifetime,
    LongDiff,
    TranDiff,
    EField,
    BoxAlpha,
    BoxBeta,
    BirksAb,
    BirksKb,
}

/// Nominal value and the interval targets and random starts are drawn from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterRange {
    pub nominal: f64,
    pub down: f64,
    pub up: f64,
}

impl FitParameter {
    pub const ALL: [FitParameter; 9] = [
        Self::Vdrift,
        Self::Lifetime,
        Self::LongDiff,
        Self::TranDiff,
        Self::EField,
        Self::BoxAlpha,
        Self::BoxBeta,
        Self::BirksAb,
        Self::BirksKb,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Vdrift => "vdrift",
            Self::Lifetime => "lifetime",
            Self::LongDiff => "long_diff",
            Self::TranDiff => "tran_diff",
            Self::EField => "eField",
            Self::BoxAlpha => "box_alpha",
            Self::BoxBeta => "box_beta",
            Self::BirksAb => "birks_ab",
            Self::BirksKb => "birks_kb",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|parameter| parameter.as_str() == name)
    }

    pub const fn range(self) -> ParameterRange {
        let (nominal, down, up) = match self {
            Self::Vdrift => (0.1648, 0.1, 0.2),
            Self::Lifetime => (2.2e3, 10.0, 1.0e4),
            Self::LongDiff => (4.0e-6, 2.0e-6, 9.0e-6),
            Self::TranDiff => (8.8e-6, 4.0e-6, 14.0e-6),
            Self::EField => (0.5, 0.4, 0.6),
            Self::BoxAlpha => (0.93, 0.85, 0.95),
            Self::BoxBeta => (0.207, 0.18, 0.23),
            Self::BirksAb => (0.8, 0.78, 0.88),
            Self::BirksKb => (0.0486, 0.04, 0.07),
        };
        ParameterRange { nominal, down, up }
    }

    pub fn value(self, detector: &DetectorProperties) -> f64 {
        match self {
            Self::Vdrift => detector.vdrift,
            Self::Lifetime => detector.lifetime,
            Self::LongDiff => detector.long_diff,
            Self::TranDiff => detector.tran_diff,
            Self::EField => detector.e_field,
            Self::BoxAlpha => detector.box_alpha,
            Self::BoxBeta => detector.box_beta,
            Self::BirksAb => detector.birks_ab,
            Self::BirksKb => detector.birks_kb,
        }
    }

    pub fn set(self, detector: &mut DetectorProperties, value: f64) {
        let field = match self {
            Self::Vdrift => &mut detector.vdrift,
            Self::Lifetime => &mut detector.lifetime,
            Self::LongDiff => &mut detector.long_diff,
            Self::TranDiff => &mut detector.tran_diff,
            Self::EField => &mut detector.e_field,
            Self::BoxAlpha => &mut detector.box_alpha,
            Self::BoxBeta => &mut detector.box_beta,
            Self::BirksAb => &mut detector.birks_ab,
            Self::BirksKb => &mut detector.birks_kb,
        };
        *field = value;
    }
}

impl Display for FitParameter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

/// A parameter to fit and, optionally, its own learning rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterSpec {
    pub parameter: FitParameter,
    pub lr: Option<f64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ParameterListInput {
    Names(Vec<String>),
    Rates(BTreeMap<String, f64>),
}

/// Parses a comma-separated list of parameter names.
pub fn parse_parameter_names(text: &str) -> ConfigResult<Vec<ParameterSpec>> {
    let entries = text
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| (name.to_string(), None))
        .collect();
    build_specs(entries)
}

/// Reads a parameter list file: a JSON array of names or an object mapping
/// names to learning rates.
pub fn load_parameter_list(path: &Path) -> ConfigResult<Vec<ParameterSpec>> {
    let input: ParameterListInput = read_json_file(path, "parameter list")?;
    let entries = match input {
        ParameterListInput::Names(names) => names.into_iter().map(|name| (name, None)).collect(),
        ParameterListInput::Rates(rates) => rates
            .into_iter()
            .map(|(name, lr)| (name, Some(lr)))
            .collect(),
    };
    build_specs(entries)
}

fn build_specs(entries: Vec<(String, Option<f64>)>) -> ConfigResult<Vec<ParameterSpec>> {
    if entries.is_empty() {
        return Err(SimError::input_validation(
            "INPUT.FIT_PARAMETER",
            "at least one parameter must be fitted",
        ));
    }
    let mut seen = HashSet::new();
    let mut specs = Vec::with_capacity(entries.len());
    for (name, lr) in entries {
        let parameter = FitParameter::from_name(&name).ok_or_else(|| {
            let known: Vec<&str> = FitParameter::ALL.iter().map(|p| p.as_str()).collect();
            SimError::input_validation(
                "INPUT.FIT_PARAMETER",
                format!("unknown parameter '{}', expected one of {}", name, known.join(", ")),
            )
        })?;
        if !seen.insert(parameter) {
            return Err(SimError::input_validation(
                "INPUT.FIT_PARAMETER",
                format!("parameter '{}' is listed twice", name),
            ));
        }
        if let Some(rate) = lr {
            if !(rate.is_finite() && rate > 0.0) {
                return Err(SimError::input_validation(
                    "INPUT.FIT_LR",
                    format!("learning rate for '{}' must be positive, got {}", name, rate),
                ));
            }
        }
        specs.push(ParameterSpec { parameter, lr });
    }
    Ok(specs)
}

/// Current guess of the fitted parameters, each divided by its nominal
/// value so every coordinate lives near 1.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterVector {
    parameters: Vec<FitParameter>,
    values: Vec<f64>,
}

impl ParameterVector {
    pub fn new(parameters: Vec<FitParameter>, values: Vec<f64>) -> Self {
        Self { parameters, values }
    }

    /// Normalised values of `detector`.
    pub fn from_detector(parameters: Vec<FitParameter>, detector: &DetectorProperties) -> Self {
        let values = parameters
            .iter()
            .map(|parameter| parameter.value(detector) / parameter.range().nominal)
            .collect();
        Self { parameters, values }
    }

    pub fn parameters(&self) -> &[FitParameter] {
        &self.parameters
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn physical(&self, index: usize) -> f64 {
        self.values[index] * self.parameters[index].range().nominal
    }

    /// Copy of `base` with the fitted fields replaced.
    pub fn apply(&self, base: &DetectorProperties) -> DetectorProperties {
        let mut detector = base.clone();
        for index in 0..self.len() {
            self.parameters[index].set(&mut detector, self.physical(index));
        }
        detector
    }

    /// Copy with coordinate `index` moved by `delta`.
    pub fn shifted(&self, index: usize, delta: f64) -> Self {
        let mut shifted = self.clone();
        shifted.values[index] += delta;
        shifted
    }

    /// Pulls every coordinate back inside its range.
    pub fn clamp_to_ranges(&mut self) {
        for (value, parameter) in self.values.iter_mut().zip(&self.parameters) {
            let range = parameter.range();
            *value = value.clamp(range.down / range.nominal, range.up / range.nominal);
        }
    }
}
