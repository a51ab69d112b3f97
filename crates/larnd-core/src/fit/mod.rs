//! Parameter fitting against simulated reference data.

pub mod driver;
pub mod history;
pub mod loss;
pub mod optim;
pub mod params;

pub use driver::{Batch, FitConfig, FitDriver, FitReport, InitMode, StopSignal, build_batches};
pub use history::TrainingHistory;
pub use loss::{EmbeddedCharge, charge_loss, embed_waveforms};
pub use optim::{Optimizer, OptimizerKind, Scheduler, SchedulerKind};
pub use params::{
    FitParameter, ParameterRange, ParameterSpec, ParameterVector, load_parameter_list,
    parse_parameter_names,
};
