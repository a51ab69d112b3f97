use crate::common::SimulationContext;
use crate::common::constants::W_ION;
use crate::domain::{SimStage, StageResult, TrackStage, TrackTable};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecombinationModel {
    #[default]
    Box,
    Birks,
}

impl RecombinationModel {
    /// Fraction of ionisation electrons escaping recombination for a stopping
    /// power `dedx` (MeV/cm).
    pub fn survival_fraction(self, dedx: f64, context: &SimulationContext) -> f64 {
        let detector = context.detector();
        let field_density = detector.e_field * detector.lar_density;
        match self {
            Self::Box => {
                let csi = detector.box_beta * dedx / field_density;
                let fraction = (detector.box_alpha + csi).ln() / csi;
                if fraction.is_nan() { 0.0 } else { fraction.max(0.0) }
            }
            Self::Birks => detector.birks_ab / (1.0 + detector.birks_kb * dedx / field_density),
        }
    }
}

/// Electrons surviving recombination for one deposit. Negative or NaN
/// energies yield NaN.
pub fn quenched_electrons(de: f64, dedx: f64, context: &SimulationContext) -> f64 {
    if de.is_nan() || de < 0.0 || dedx.is_nan() {
        return f64::NAN;
    }
    let model = context.detector().recombination;
    model.survival_fraction(dedx, context) * de / W_ION
}

/// Replaces each segment's electron count by the number of electrons that
/// survive recombination.
pub fn quench(mut table: TrackTable, context: &SimulationContext) -> StageResult<TrackTable> {
    table.require(TrackStage::Deposited, SimStage::Quenching)?;

    table.segments_mut().par_iter_mut().for_each(|segment| {
        segment.n_electrons = quenched_electrons(segment.de, segment.dedx, context);
    });

    tracing::debug!(
        segments = table.len(),
        model = ?context.detector().recombination,
        "quenched track table"
    );
    Ok(table.advance(TrackStage::Quenched))
}
