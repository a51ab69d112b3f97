use crate::domain::{ConfigResult, SimError};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimizerKind {
    #[default]
    Sgd,
    Adam,
}

impl OptimizerKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sgd => "sgd",
            Self::Adam => "adam",
        }
    }

    pub fn from_name(name: &str) -> ConfigResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sgd" => Ok(Self::Sgd),
            "adam" => Ok(Self::Adam),
            other => Err(SimError::input_validation(
                "INPUT.FIT_OPTIMIZER",
                format!("unknown optimizer '{}', expected sgd or adam", other),
            )),
        }
    }
}

impl Display for OptimizerKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerKind {
    #[default]
    Constant,
    Step,
    Exponential,
}

impl SchedulerKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Constant => "constant",
            Self::Step => "step",
            Self::Exponential => "exponential",
        }
    }

    pub fn from_name(name: &str) -> ConfigResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "constant" => Ok(Self::Constant),
            "step" => Ok(Self::Step),
            "exponential" => Ok(Self::Exponential),
            other => Err(SimError::input_validation(
                "INPUT.FIT_SCHEDULER",
                format!(
                    "unknown scheduler '{}', expected constant, step or exponential",
                    other
                ),
            )),
        }
    }
}

impl Display for SchedulerKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

/// Learning-rate multiplier per iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scheduler {
    pub kind: SchedulerKind,
    pub gamma: f64,
    pub step_size: usize,
}

impl Scheduler {
    pub fn factor(&self, iteration: usize) -> f64 {
        match self.kind {
            SchedulerKind::Constant => 1.0,
            SchedulerKind::Step => self.gamma.powi((iteration / self.step_size.max(1)) as i32),
            SchedulerKind::Exponential => self.gamma.powi(iteration as i32),
        }
    }
}

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPSILON: f64 = 1.0e-8;

/// Gradient-descent update with one learning rate per coordinate.
#[derive(Debug, Clone, PartialEq)]
pub struct Optimizer {
    kind: OptimizerKind,
    rates: Vec<f64>,
    first_moment: Vec<f64>,
    second_moment: Vec<f64>,
    steps: i32,
}

impl Optimizer {
    pub fn new(kind: OptimizerKind, rates: Vec<f64>) -> Self {
        let n = rates.len();
        Self {
            kind,
            rates,
            first_moment: vec![0.0; n],
            second_moment: vec![0.0; n],
            steps: 0,
        }
    }

    pub fn kind(&self) -> OptimizerKind {
        self.kind
    }

    pub fn rates(&self) -> &[f64] {
        &self.rates
    }

    pub fn step(&mut self, values: &mut [f64], gradient: &[f64], scale: f64) {
        match self.kind {
            OptimizerKind::Sgd => {
                for ((value, grad), rate) in values.iter_mut().zip(gradient).zip(&self.rates) {
                    *value -= rate * scale * grad;
                }
            }
            OptimizerKind::Adam => {
                self.steps += 1;
                let correction1 = 1.0 - ADAM_BETA1.powi(self.steps);
                let correction2 = 1.0 - ADAM_BETA2.powi(self.steps);
                for index in 0..values.len().min(gradient.len()) {
                    let grad = gradient[index];
                    let m = &mut self.first_moment[index];
                    let v = &mut self.second_moment[index];
                    *m = ADAM_BETA1 * *m + (1.0 - ADAM_BETA1) * grad;
                    *v = ADAM_BETA2 * *v + (1.0 - ADAM_BETA2) * grad * grad;
                    let m_hat = *m / correction1;
                    let v_hat = *v / correction2;
                    values[index] -= self.rates[index] * scale * m_hat / (v_hat.sqrt() + ADAM_EPSILON);
                }
            }
        }
    }
}
