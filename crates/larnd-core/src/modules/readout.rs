//! Self-triggering front-end electronics.
//!
//! Each pixel integrates its induced current tick by tick. When the
//! integrated charge plus noise crosses the discriminator threshold, the
//! channel keeps integrating for the hold delay, re-checks the threshold,
//! digitises the charge, resets and stays busy for a few clock cycles.
//! Charges are in electrons and voltages in mV.

use super::aggregation::{PixelSignal, PixelWaveforms};
use super::pixels::encode_pixel;
use super::rng::RngStreamPool;
use crate::common::SimulationContext;
use crate::domain::{ConfigResult, PixelId, SimError};
use rand::Rng;
use rand::rngs::StdRng;
use rand_distr::StandardNormal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectronicsConfig {
    pub discrimination_threshold: f64,
    /// Clock cycles integrated after a crossing.
    pub adc_hold_delay: u32,
    pub adc_busy_delay: u32,
    pub reset_cycles: u32,
    /// µs
    pub clock_cycle: f64,
    /// mV per electron
    pub gain: f64,
    /// Front-end buffer rise time in µs; zero integrates the raw current.
    pub buffer_risetime: f64,
    pub v_cm: f64,
    pub v_ref: f64,
    pub v_pedestal: f64,
    pub adc_counts: u32,
    pub reset_noise_charge: f64,
    pub uncorrelated_noise_charge: f64,
    pub discriminator_noise: f64,
    pub max_adc_values: usize,
    /// Clock cycles between a crossing and the recorded timestamp.
    pub trigger_delay: u64,
}

impl Default for ElectronicsConfig {
    fn default() -> Self {
        Self {
            discrimination_threshold: 7.0e3,
            adc_hold_delay: 15,
            adc_busy_delay: 8,
            reset_cycles: 1,
            clock_cycle: 0.1,
            gain: 4.0e-3,
            buffer_risetime: 0.0,
            v_cm: 288.0,
            v_ref: 1300.0,
            v_pedestal: 580.0,
            adc_counts: 256,
            reset_noise_charge: 900.0,
            uncorrelated_noise_charge: 500.0,
            discriminator_noise: 650.0,
            max_adc_values: 10,
            trigger_delay: 2,
        }
    }
}

impl ElectronicsConfig {
    /// Same electronics with every noise source switched off.
    pub fn noiseless(self) -> Self {
        Self {
            reset_noise_charge: 0.0,
            uncorrelated_noise_charge: 0.0,
            discriminator_noise: 0.0,
            ..self
        }
    }

    pub fn is_noiseless(&self) -> bool {
        self.reset_noise_charge == 0.0
            && self.uncorrelated_noise_charge == 0.0
            && self.discriminator_noise == 0.0
    }

    pub(crate) fn validate(&self) -> ConfigResult<()> {
        if !(self.clock_cycle.is_finite() && self.clock_cycle > 0.0) {
            return Err(SimError::input_validation(
                "INPUT.ELECTRONICS",
                format!("electronics.clock_cycle must be positive, got {}", self.clock_cycle),
            ));
        }
        if !(self.v_ref > self.v_cm) {
            return Err(SimError::input_validation(
                "INPUT.ELECTRONICS",
                format!(
                    "electronics.v_ref ({}) must exceed v_cm ({})",
                    self.v_ref, self.v_cm
                ),
            ));
        }
        if self.adc_counts == 0 || self.max_adc_values == 0 {
            return Err(SimError::input_validation(
                "INPUT.ELECTRONICS",
                "electronics.adc_counts and max_adc_values must be at least 1",
            ));
        }
        let non_negative = [
            ("discrimination_threshold", self.discrimination_threshold),
            ("gain", self.gain),
            ("buffer_risetime", self.buffer_risetime),
            ("reset_noise_charge", self.reset_noise_charge),
            ("uncorrelated_noise_charge", self.uncorrelated_noise_charge),
            ("discriminator_noise", self.discriminator_noise),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(SimError::input_validation(
                    "INPUT.ELECTRONICS",
                    format!("electronics.{} must be non-negative, got {}", name, value),
                ));
            }
        }
        Ok(())
    }
}

/// ADC counts for an integrated charge, saturating at the top code.
pub fn digitize(charge: f64, config: &ElectronicsConfig) -> u32 {
    let volts = (charge * config.gain + config.v_pedestal - config.v_cm).max(0.0);
    let counts = (volts * config.adc_counts as f64 / (config.v_ref - config.v_cm)).round();
    counts.min((config.adc_counts - 1) as f64) as u32
}

/// One digitised sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdcPacket {
    pub event_id: u32,
    pub pixel: PixelId,
    pub adc: u32,
    /// Threshold crossing on the global tick grid.
    pub tick: usize,
    /// Clock cycles since the start of the time interval.
    pub timestamp: u64,
    /// Integrated charge before digitisation.
    pub charge: f64,
    pub segments: Vec<usize>,
    /// Share of the integrated truth charge per entry of `segments`.
    pub fractions: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReadoutOutcome {
    pub packets: Vec<AdcPacket>,
    /// Pixels that hit `max_adc_values` and dropped later triggers.
    pub saturated_pixels: Vec<PixelId>,
}

struct Noise {
    rng: StdRng,
}

impl Noise {
    fn draw(&mut self, scale: f64) -> f64 {
        if scale == 0.0 {
            return 0.0;
        }
        let z: f64 = self.rng.sample(StandardNormal);
        z * scale
    }
}

/// Integrates current through the optional first-order buffer and tracks the
/// truth charge per contributor.
struct ChargeCollector<'a> {
    signal: &'a PixelSignal,
    time_sampling: f64,
    decay: f64,
    buffered: f64,
    buffered_truth: Vec<f64>,
}

impl<'a> ChargeCollector<'a> {
    fn new(signal: &'a PixelSignal, time_sampling: f64, risetime: f64) -> Self {
        let decay = if risetime > 0.0 {
            (-time_sampling / risetime).exp()
        } else {
            0.0
        };
        Self {
            signal,
            time_sampling,
            decay,
            buffered: 0.0,
            buffered_truth: vec![0.0; signal.contributions.len()],
        }
    }

    fn reset(&mut self) {
        self.buffered = 0.0;
        self.buffered_truth.iter_mut().for_each(|value| *value = 0.0);
    }

    fn collect(&mut self, tick: usize, truth: &mut [f64]) -> f64 {
        let current = self.signal.waveform[tick];
        if self.decay == 0.0 {
            for (slot, contribution) in truth.iter_mut().zip(&self.signal.contributions) {
                *slot += contribution.at(tick) * self.time_sampling;
            }
            return current * self.time_sampling;
        }

        let weight = self.time_sampling * (1.0 - self.decay);
        self.buffered = current + self.decay * self.buffered;
        for ((slot, buffered), contribution) in truth
            .iter_mut()
            .zip(self.buffered_truth.iter_mut())
            .zip(&self.signal.contributions)
        {
            *buffered = contribution.at(tick) + self.decay * *buffered;
            *slot += *buffered * weight;
        }
        self.buffered * weight
    }
}

struct PixelReadout {
    packets: Vec<AdcPacket>,
    saturated: bool,
}

fn read_pixel(
    signal: &PixelSignal,
    config: &ElectronicsConfig,
    context: &SimulationContext,
    noise: &mut Noise,
) -> PixelReadout {
    let detector = context.detector();
    let dt = detector.time_sampling;
    let to_ticks = |cycles: f64| (cycles * config.clock_cycle / dt).round() as usize;
    let hold_ticks = to_ticks(3.0 + config.adc_hold_delay as f64);
    let reset_ticks = to_ticks(config.reset_cycles as f64);
    let busy_ticks = to_ticks(config.adc_busy_delay as f64);
    let retry_ticks = to_ticks(1.0);
    let threshold = config.discrimination_threshold;
    let n_ticks = signal.waveform.len();

    let mut collector = ChargeCollector::new(signal, dt, config.buffer_risetime);
    let mut truth = vec![0.0; signal.contributions.len()];
    let mut packets = Vec::new();
    let mut saturated = false;

    let mut q_sum = noise.draw(config.reset_noise_charge);
    let mut tick = 0;
    let mut busy: usize = 0;
    while tick < n_ticks || busy > 0 {
        if packets.len() >= config.max_adc_values {
            saturated = true;
            break;
        }

        if tick < n_ticks {
            q_sum += collector.collect(tick, &mut truth);
        }
        let q_noise = noise.draw(config.uncorrelated_noise_charge);
        let disc_noise = noise.draw(config.discriminator_noise);
        busy = busy.saturating_sub(1);

        if q_sum + q_noise >= threshold + disc_noise && busy == 0 {
            let crossing = tick;
            let integrate_end = tick + hold_ticks;
            tick += 1;
            while tick <= integrate_end && tick < n_ticks {
                q_sum += collector.collect(tick, &mut truth);
                tick += 1;
            }

            let charge = q_sum + noise.draw(config.uncorrelated_noise_charge);
            let disc_noise = noise.draw(config.discriminator_noise);
            if charge < threshold + disc_noise {
                tick += retry_ticks;
                q_sum = noise.draw(config.uncorrelated_noise_charge);
                truth.iter_mut().for_each(|value| *value = 0.0);
                collector.reset();
                continue;
            }

            let total: f64 = truth.iter().sum();
            let fractions = if total.is_finite() && total != 0.0 {
                truth.iter().map(|value| value / total).collect()
            } else {
                vec![0.0; truth.len()]
            };
            let time = detector.time_interval[0] + crossing as f64 * dt;
            packets.push(AdcPacket {
                event_id: signal.event_id,
                pixel: signal.pixel,
                adc: digitize(charge, config),
                tick: crossing,
                timestamp: (time / config.clock_cycle).floor().max(0.0) as u64 + config.trigger_delay,
                charge,
                segments: signal.contributors(),
                fractions,
            });

            tick += reset_ticks;
            busy = busy_ticks;
            q_sum = noise.draw(config.reset_noise_charge);
            truth.iter_mut().for_each(|value| *value = 0.0);
            collector.reset();
            continue;
        }

        tick += 1;
    }

    PixelReadout { packets, saturated }
}

/// Runs the trigger and digitisation model on every pixel.
///
/// Noise for a pixel comes from the stream of its encoded channel inside a
/// pool derived for its event, so the packets depend only on the seed and
/// the waveforms.
pub fn readout(
    waveforms: &PixelWaveforms,
    context: &SimulationContext,
    pool: &RngStreamPool,
) -> ReadoutOutcome {
    let config = &context.detector().electronics;

    let per_pixel: Vec<PixelReadout> = waveforms
        .signals()
        .par_iter()
        .map(|signal| {
            let mut noise = Noise {
                rng: pool
                    .derive(u64::from(signal.event_id))
                    .stream(encode_pixel(context, signal.pixel)),
            };
            read_pixel(signal, config, context, &mut noise)
        })
        .collect();

    let mut outcome = ReadoutOutcome::default();
    for (signal, pixel) in waveforms.signals().iter().zip(per_pixel) {
        if pixel.saturated {
            outcome.saturated_pixels.push(signal.pixel);
        }
        outcome.packets.extend(pixel.packets);
    }

    if !outcome.saturated_pixels.is_empty() {
        tracing::warn!(
            pixels = outcome.saturated_pixels.len(),
            max_adc_values = config.max_adc_values,
            "pixels produced more triggers than can be stored"
        );
    }
    tracing::debug!(
        pixels = waveforms.len(),
        packets = outcome.packets.len(),
        noiseless = config.is_noiseless(),
        "read out pixels"
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::{ElectronicsConfig, digitize, readout};
    use crate::common::{DetectorProperties, PixelLayout, SimulationContext};
    use crate::domain::PixelId;
    use crate::modules::aggregation::{Contribution, PixelSignal, PixelWaveforms};
    use crate::modules::rng::RngStreamPool;

    fn context(electronics: ElectronicsConfig) -> SimulationContext {
        let detector = DetectorProperties {
            electronics,
            ..DetectorProperties::default()
        };
        SimulationContext::new(detector, PixelLayout::default()).expect("valid context")
    }

    /// One pixel with `charge` electrons delivered in a single tick at each
    /// of `ticks`, split evenly between two segments.
    fn pulses(context: &SimulationContext, ticks: &[usize], charge: f64) -> PixelWaveforms {
        let global = context.global_ticks();
        let dt = context.detector().time_sampling;
        let mut waveform = vec![0.0; global];
        for &tick in ticks {
            waveform[tick] = charge / dt;
        }
        let half: Vec<f64> = waveform.iter().map(|value| value * 0.5).collect();
        let signal = PixelSignal {
            event_id: 0,
            pixel: PixelId::new(3, 4, 0),
            waveform,
            contributions: vec![
                Contribution {
                    segment: 0,
                    start: 0,
                    current: half.clone(),
                },
                Contribution {
                    segment: 5,
                    start: 0,
                    current: half,
                },
            ],
        };
        PixelWaveforms::from_signals(vec![signal], global)
    }

    #[test]
    fn digitize_follows_pedestal_and_saturates() {
        let config = ElectronicsConfig::default();
        // (580 - 288) mV * 256 / 1012 mV
        assert_eq!(digitize(0.0, &config), 74);
        assert_eq!(digitize(-1.0e6, &config), 0);
        assert_eq!(digitize(1.0e9, &config), 255);
        assert!(digitize(20_000.0, &config) > digitize(10_000.0, &config));
    }

    #[test]
    fn noiseless_pulse_gives_one_exact_packet() {
        let context = context(ElectronicsConfig::default().noiseless());
        let waveforms = pulses(&context, &[100], 20_000.0);
        let outcome = readout(&waveforms, &context, &RngStreamPool::new(1));

        assert_eq!(outcome.packets.len(), 1);
        let packet = &outcome.packets[0];
        assert_eq!(packet.tick, 100);
        assert!((packet.charge - 20_000.0).abs() < 1.0e-6);
        assert_eq!(packet.adc, digitize(packet.charge, &context.detector().electronics));
        assert_eq!(packet.segments, vec![0, 5]);
        assert!((packet.fractions[0] - 0.5).abs() < 1.0e-12);
        assert!(outcome.saturated_pixels.is_empty());
    }

    #[test]
    fn sub_threshold_charge_never_triggers_without_noise() {
        let context = context(ElectronicsConfig::default().noiseless());
        let waveforms = pulses(&context, &[100], 6_000.0);
        let outcome = readout(&waveforms, &context, &RngStreamPool::new(1));
        assert!(outcome.packets.is_empty());
    }

    #[test]
    fn separated_pulses_trigger_separately_until_the_cap() {
        let mut electronics = ElectronicsConfig::default().noiseless();
        let context = context(electronics.clone());
        let waveforms = pulses(&context, &[100, 400, 700], 20_000.0);
        let outcome = readout(&waveforms, &context, &RngStreamPool::new(1));
        let ticks: Vec<usize> = outcome.packets.iter().map(|packet| packet.tick).collect();
        assert_eq!(ticks, vec![100, 400, 700]);

        electronics.max_adc_values = 2;
        let capped = self::context(electronics);
        let outcome = readout(&waveforms, &capped, &RngStreamPool::new(1));
        assert_eq!(outcome.packets.len(), 2);
        assert_eq!(outcome.saturated_pixels, vec![PixelId::new(3, 4, 0)]);
    }

    #[test]
    fn noisy_readout_is_reproducible_for_a_seed() {
        let context = context(ElectronicsConfig::default());
        let waveforms = pulses(&context, &[100, 900], 40_000.0);
        let first = readout(&waveforms, &context, &RngStreamPool::new(11));
        let second = readout(&waveforms, &context, &RngStreamPool::new(11));
        assert_eq!(first, second);
        assert!(!first.packets.is_empty());

        let other = readout(&waveforms, &context, &RngStreamPool::new(12));
        let charges = |outcome: &super::ReadoutOutcome| -> Vec<u64> {
            outcome.packets.iter().map(|packet| packet.charge.to_bits()).collect()
        };
        assert_ne!(charges(&first), charges(&other));
    }

    #[test]
    fn each_event_draws_its_own_noise() {
        let context = context(ElectronicsConfig::default());
        let waveforms = pulses(&context, &[100], 40_000.0);
        let mut signals = waveforms.signals().to_vec();
        let mut repeat = signals[0].clone();
        repeat.event_id = 1;
        signals.push(repeat);
        let both = PixelWaveforms::from_signals(signals, waveforms.ticks());

        let outcome = readout(&both, &context, &RngStreamPool::new(11));
        let charge = |event: u32| -> Vec<u64> {
            outcome
                .packets
                .iter()
                .filter(|packet| packet.event_id == event)
                .map(|packet| packet.charge.to_bits())
                .collect()
        };
        assert!(!charge(0).is_empty());
        assert!(!charge(1).is_empty());
        assert_ne!(charge(0), charge(1));
    }

    #[test]
    fn buffer_risetime_spreads_charge_over_the_hold_window() {
        let electronics = ElectronicsConfig {
            buffer_risetime: 0.17,
            ..ElectronicsConfig::default().noiseless()
        };
        let context = context(electronics);
        let waveforms = pulses(&context, &[100], 30_000.0);
        let outcome = readout(&waveforms, &context, &RngStreamPool::new(1));
        assert_eq!(outcome.packets.len(), 1);
        let packet = &outcome.packets[0];
        assert_eq!(packet.tick, 100);
        // the buffered tail is cut at the end of the hold window
        assert!(packet.charge < 30_000.0);
        assert!(packet.charge > 29_000.0);
    }

    #[test]
    fn inverted_reference_voltages_are_rejected() {
        let electronics = ElectronicsConfig {
            v_ref: 100.0,
            ..ElectronicsConfig::default()
        };
        let detector = DetectorProperties {
            electronics,
            ..DetectorProperties::default()
        };
        let error = SimulationContext::new(detector, PixelLayout::default())
            .expect_err("v_ref below v_cm");
        assert_eq!(error.placeholder(), "INPUT.ELECTRONICS");
    }
}
