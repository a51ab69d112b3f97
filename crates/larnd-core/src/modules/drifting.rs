use crate::common::SimulationContext;
use crate::domain::{SimError, SimStage, StageResult, TrackStage, TrackTable};
use rayon::prelude::*;

/// Transports the surviving electrons of every segment to its anode.
///
/// Electron counts are attenuated by the lifetime, diffusion widths are set
/// from the drift time and the segment times are shifted to anode arrival
/// times. The table must already be quenched; a drifted table is rejected.
pub fn drift(mut table: TrackTable, context: &SimulationContext) -> StageResult<TrackTable> {
    table.require(TrackStage::Quenched, SimStage::Drifting)?;

    if let Some((index, segment)) = table
        .segments()
        .iter()
        .enumerate()
        .find(|(_, segment)| segment.pixel_plane >= context.n_planes())
    {
        return Err(SimError::input_validation(
            "INPUT.PIXEL_PLANE",
            format!(
                "segment {} refers to pixel plane {} but only {} planes are configured",
                index,
                segment.pixel_plane,
                context.n_planes()
            ),
        ));
    }

    let detector = context.detector();
    table.segments_mut().par_iter_mut().for_each(|segment| {
        let z_anode = detector.tpc_borders[segment.pixel_plane][2][0];
        let drift_time = |z: f64| (z - z_anode).abs() / detector.vdrift;

        let mid_time = drift_time(segment.z);
        segment.n_electrons *= (-mid_time / detector.lifetime).exp();
        segment.long_diff = (2.0 * detector.long_diff * mid_time).sqrt();
        segment.tran_diff = (2.0 * detector.tran_diff * mid_time).sqrt();

        segment.t += mid_time;
        segment.t_start += drift_time(segment.z_start);
        segment.t_end += drift_time(segment.z_end);
    });

    tracing::debug!(segments = table.len(), vdrift = detector.vdrift, "drifted track table");
    Ok(table.advance(TrackStage::Drifted))
}

#[cfg(test)]
mod tests {
    use super::drift;
    use crate::common::{DetectorProperties, PixelLayout, SimulationContext};
    use crate::domain::{Segment, SimErrorCategory, TrackStage, TrackTable};
    use crate::modules::quenching::quench;

    fn context() -> SimulationContext {
        SimulationContext::new(DetectorProperties::default(), PixelLayout::default())
            .expect("valid context")
    }

    #[test]
    fn drift_attenuates_charge_and_delays_arrival() {
        let context = context();
        let segment = Segment::from_endpoints([0.0, 0.0, 10.0], [1.0, 0.0, 12.0], 2.0);
        let quenched = quench(TrackTable::new(vec![segment]), &context).expect("quench");
        let before = quenched.segments()[0].clone();

        let drifted = drift(quenched, &context).expect("drift");
        let after = &drifted.segments()[0];
        let detector = context.detector();

        let mid_time = 11.0 / detector.vdrift;
        assert!((after.t - mid_time).abs() < 1.0e-9);
        assert!((after.t_start - 10.0 / detector.vdrift).abs() < 1.0e-9);
        assert!((after.t_end - 12.0 / detector.vdrift).abs() < 1.0e-9);
        assert!(after.n_electrons < before.n_electrons);
        let expected = before.n_electrons * (-mid_time / detector.lifetime).exp();
        assert!((after.n_electrons - expected).abs() < 1.0e-6);
        assert!(after.tran_diff > 0.0);
        assert!(after.long_diff > 0.0);
        assert_eq!(drifted.stage(), TrackStage::Drifted);
    }

    #[test]
    fn segment_on_anode_has_no_diffusion() {
        let context = context();
        let segment = Segment::from_endpoints([0.0, 0.0, 0.0], [1.0, 0.0, 0.0], 1.0);
        let table = quench(TrackTable::new(vec![segment]), &context).expect("quench");
        let drifted = drift(table, &context).expect("drift");
        assert_eq!(drifted.segments()[0].tran_diff, 0.0);
        assert_eq!(drifted.segments()[0].t, 0.0);
    }

    #[test]
    fn drifting_before_quenching_is_rejected() {
        let context = context();
        let segment = Segment::from_endpoints([0.0, 0.0, 5.0], [1.0, 0.0, 5.0], 1.0);
        let error = drift(TrackTable::new(vec![segment]), &context)
            .expect_err("unquenched table should be rejected");
        assert_eq!(error.placeholder(), "STAGE.ORDER");
    }

    #[test]
    fn drifting_twice_is_rejected() {
        let context = context();
        let segment = Segment::from_endpoints([0.0, 0.0, 5.0], [1.0, 0.0, 5.0], 1.0);
        let table = quench(TrackTable::new(vec![segment]), &context).expect("quench");
        let drifted = drift(table, &context).expect("first drift");
        let error = drift(drifted, &context).expect_err("second drift should fail");
        assert_eq!(error.category(), SimErrorCategory::InputValidationError);
    }

    #[test]
    fn unknown_plane_is_a_configuration_error() {
        let context = context();
        let mut segment = Segment::from_endpoints([0.0, 0.0, 5.0], [1.0, 0.0, 5.0], 1.0);
        segment.pixel_plane = 3;
        let table = quench(TrackTable::new(vec![segment]), &context).expect("quench");
        let error = drift(table, &context).expect_err("plane 3 does not exist");
        assert_eq!(error.placeholder(), "INPUT.PIXEL_PLANE");
    }
}
