//! Analog surrogate loss between two simulations.
//!
//! Waveforms are integrated into coarse `(channel, time bin)` charge cells
//! before comparison, so the loss varies smoothly enough under small
//! parameter changes for finite differences to be useful.

use crate::common::SimulationContext;
use crate::modules::aggregation::PixelWaveforms;
use crate::modules::pixels::encode_pixel;
use rand::Rng;
use rand::rngs::StdRng;
use rand_distr::StandardNormal;
use std::collections::BTreeMap;

/// Integrated charge per `(channel, time bin)`.
pub type EmbeddedCharge = BTreeMap<(u64, usize), f64>;

pub fn embed_waveforms(
    waveforms: &PixelWaveforms,
    context: &SimulationContext,
    bin_ticks: usize,
) -> EmbeddedCharge {
    let dt = context.detector().time_sampling;
    let bin_ticks = bin_ticks.max(1);
    let mut embedded = EmbeddedCharge::new();
    for signal in waveforms.signals() {
        let channel = encode_pixel(context, signal.pixel);
        for (tick, current) in signal.waveform.iter().enumerate() {
            if *current != 0.0 {
                *embedded.entry((channel, tick / bin_ticks)).or_insert(0.0) += current * dt;
            }
        }
    }
    embedded
}

/// Adds Gaussian charge noise of width `sigma` electrons to every cell.
pub fn add_charge_noise(embedded: &mut EmbeddedCharge, sigma: f64, rng: &mut StdRng) {
    if sigma == 0.0 {
        return;
    }
    for value in embedded.values_mut() {
        let z: f64 = rng.sample(StandardNormal);
        *value += z * sigma;
    }
}

/// Squared difference over the union of cells, relative to the target's
/// squared norm. Non-finite cells make the loss non-finite.
pub fn charge_loss(output: &EmbeddedCharge, target: &EmbeddedCharge) -> f64 {
    let mut difference = 0.0;
    for (cell, value) in output {
        let reference = target.get(cell).copied().unwrap_or(0.0);
        difference += (value - reference).powi(2);
    }
    for (cell, reference) in target {
        if !output.contains_key(cell) {
            difference += reference.powi(2);
        }
    }
    let norm: f64 = target.values().map(|value| value * value).sum();
    if norm > 0.0 { difference / norm } else { difference }
}

#[cfg(test)]
mod tests {
    use super::{EmbeddedCharge, add_charge_noise, charge_loss, embed_waveforms};
    use crate::common::{DetectorProperties, PixelLayout, SimulationContext};
    use crate::domain::PixelId;
    use crate::modules::aggregation::{PixelSignal, PixelWaveforms};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn identical_charge_maps_have_zero_loss() {
        let target: EmbeddedCharge = [((1, 0), 100.0), ((2, 3), 50.0)].into_iter().collect();
        assert_eq!(charge_loss(&target, &target), 0.0);

        let shifted: EmbeddedCharge = [((1, 1), 100.0), ((2, 3), 50.0)].into_iter().collect();
        // both misplaced cells count
        assert!((charge_loss(&shifted, &target) - 20_000.0 / 12_500.0).abs() < 1.0e-12);

        let broken: EmbeddedCharge = [((1, 0), f64::NAN)].into_iter().collect();
        assert!(charge_loss(&broken, &target).is_nan());
    }

    #[test]
    fn embedding_integrates_current_per_bin() {
        let context = SimulationContext::new(DetectorProperties::default(), PixelLayout::default())
            .expect("valid context");
        let mut waveform = vec![0.0; context.global_ticks()];
        waveform[3] = 10.0;
        waveform[7] = 20.0;
        waveform[12] = 5.0;
        let waveforms = PixelWaveforms::from_signals(
            vec![PixelSignal {
                event_id: 0,
                pixel: PixelId::new(2, 0, 0),
                waveform,
                contributions: Vec::new(),
            }],
            context.global_ticks(),
        );
        let embedded = embed_waveforms(&waveforms, &context, 10);
        assert_eq!(embedded.len(), 2);
        assert!((embedded[&(2, 0)] - 3.0).abs() < 1.0e-12);
        assert!((embedded[&(2, 1)] - 0.5).abs() < 1.0e-12);
    }

    #[test]
    fn noise_is_reproducible_for_a_stream() {
        let base: EmbeddedCharge = [((1, 0), 100.0), ((2, 3), 50.0)].into_iter().collect();
        let mut first = base.clone();
        let mut second = base.clone();
        add_charge_noise(&mut first, 500.0, &mut StdRng::seed_from_u64(3));
        add_charge_noise(&mut second, 500.0, &mut StdRng::seed_from_u64(3));
        assert_eq!(first, second);
        assert_ne!(first, base);
    }
}
