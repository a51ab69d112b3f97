//! Packet container written at the end of a simulation.
//!
//! A file holds these datasets and one attribute block:
//! `packets` (one record per digitised sample, in production order),
//! `mc_packets_assn` (per packet, the contributing segment indices padded
//! with -1 and their charge fractions padded with 0), `events` (the start
//! time given to every event), `markers` (trigger and timestamp-rollover
//! words placed between packets), `tracks` (the drifted segment table) and
//! `configs` (the drift parameters the file was made with).
//!
//! Events are spaced in time like a Poisson process. Timestamps on the wire
//! are 31-bit clock counts; when an event starts past the rollover a
//! rollover marker is written and the clock restarts from zero.

use super::pixels::encode_pixel;
use super::readout::{AdcPacket, digitize};
use super::rng::RngStreamPool;
use super::serialization::{nullable_f64, read_json_file, write_json_atomically};
use crate::common::SimulationContext;
use crate::domain::{ConfigResult, PixelId, Segment, SimError, SimResult, TrackStage, TrackTable};
use rand_distr::{Distribution, Exp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

pub const PACKET_FILE_FORMAT: &str = "larnd-packets/2";

/// Clock counts representable in a packet timestamp.
pub const TIMESTAMP_ROLLOVER: u64 = 1 << 31;

/// Mean gap between event starts in clock cycles, about 10 Hz at 10 MHz.
pub const EVENT_SPACING: f64 = 1.0e6;

/// Readout streams are derived per event id, which never reaches this label.
const EVENT_TIMING_SCOPE: u64 = u64::MAX;

/// Both IO groups see every external trigger.
const TRIGGER_IO_GROUPS: [u8; 2] = [1, 2];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    /// Mean clock cycles between consecutive event starts; zero starts every
    /// event at the same time.
    pub event_spacing: f64,
    /// Channel ids whose packets are never written.
    pub bad_channels: BTreeSet<u64>,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            event_spacing: EVENT_SPACING,
            bad_channels: BTreeSet::new(),
        }
    }
}

impl ExportSettings {
    pub(crate) fn validate(&self) -> ConfigResult<()> {
        if !(self.event_spacing.is_finite() && self.event_spacing >= 0.0) {
            return Err(SimError::input_validation(
                "INPUT.EXPORT",
                format!(
                    "export.event_spacing must be non-negative, got {}",
                    self.event_spacing
                ),
            ));
        }
        Ok(())
    }

    /// Reads a JSON array of channel ids to mask.
    pub fn load_bad_channels(path: &Path) -> ConfigResult<BTreeSet<u64>> {
        read_json_file(path, "bad channel list")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketRecord {
    pub channel_id: u64,
    pub pixel: PixelId,
    pub event_id: u32,
    pub dataword: u32,
    /// Clock cycles since the start of the event's time interval.
    pub timestamp: u64,
    /// Wire timestamp: event start plus `timestamp`, modulo the rollover.
    pub global_timestamp: u64,
    pub tick: usize,
    #[serde(with = "nullable_f64")]
    pub charge: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketAssociation {
    pub track_ids: Vec<i64>,
    pub fraction: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStart {
    pub event_id: u32,
    /// Clock cycles since the first event window opened, before rollover.
    pub t0: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    Trigger,
    Rollover,
}

/// Non-data word, placed on the wire just before `packets[position]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingMarker {
    pub kind: MarkerKind,
    pub position: usize,
    pub io_group: Option<u8>,
    pub event_id: Option<u32>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportConfigs {
    pub vdrift: f64,
    pub long_diff: f64,
    pub tran_diff: f64,
    pub lifetime: f64,
    pub drift_length: f64,
    pub time_sampling: f64,
    pub clock_cycle: f64,
}

impl ExportConfigs {
    pub fn from_context(context: &SimulationContext) -> Self {
        let detector = context.detector();
        Self {
            vdrift: detector.vdrift,
            long_diff: detector.long_diff,
            tran_diff: detector.tran_diff,
            lifetime: detector.lifetime,
            drift_length: detector.drift_length(),
            time_sampling: detector.time_sampling,
            clock_cycle: detector.electronics.clock_cycle,
        }
    }
}

/// What became of the readout packets handed to the exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ExportSummary {
    pub written: usize,
    /// Packets at or below the pedestal code; they carry no signal.
    pub below_pedestal: usize,
    /// Packets on a masked channel.
    pub masked: usize,
    pub triggers: usize,
    pub rollovers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketFile {
    pub format: String,
    pub configs: ExportConfigs,
    pub packets: Vec<PacketRecord>,
    pub mc_packets_assn: Vec<PacketAssociation>,
    pub events: Vec<EventStart>,
    pub markers: Vec<TimingMarker>,
    pub tracks_stage: TrackStage,
    pub tracks: Vec<Segment>,
}

/// Start times of the distinct events of `table`, in ascending event id,
/// spaced by exponential gaps of mean `spacing` clock cycles.
pub fn event_start_times(
    table: &TrackTable,
    spacing: f64,
    pool: &RngStreamPool,
) -> ConfigResult<Vec<EventStart>> {
    let events: BTreeSet<u32> = table.segments().iter().map(|segment| segment.event_id).collect();
    if spacing == 0.0 {
        return Ok(events
            .into_iter()
            .map(|event_id| EventStart { event_id, t0: 0 })
            .collect());
    }

    let gap = Exp::new(1.0 / spacing).map_err(|error| {
        SimError::input_validation(
            "INPUT.EXPORT",
            format!("cannot space events by {} clock cycles: {}", spacing, error),
        )
    })?;
    let mut rng = pool.derive(EVENT_TIMING_SCOPE).stream(0);
    let mut clock = 0_u64;
    Ok(events
        .into_iter()
        .map(|event_id| {
            clock = clock.saturating_add(gap.sample(&mut rng) as u64);
            EventStart { event_id, t0: clock }
        })
        .collect())
}

struct Rollover {
    base: u64,
}

impl Rollover {
    /// Event start on the wire clock, emitting one marker per rollover
    /// crossed since the previous event.
    fn advance(&mut self, t0: u64, position: usize, markers: &mut Vec<TimingMarker>) -> u64 {
        while t0.saturating_sub(self.base) >= TIMESTAMP_ROLLOVER {
            self.base += TIMESTAMP_ROLLOVER;
            markers.push(TimingMarker {
                kind: MarkerKind::Rollover,
                position,
                io_group: None,
                event_id: None,
                timestamp: TIMESTAMP_ROLLOVER,
            });
        }
        t0.saturating_sub(self.base)
    }
}

impl PacketFile {
    /// Lays out packets, their truth association and the timing words.
    ///
    /// Packets whose ADC does not exceed the pedestal code carry no signal
    /// and are left out, as are packets on a masked channel; both are
    /// counted in the summary. Every event that keeps at least one packet is
    /// announced by a trigger on each IO group before its first packet.
    pub fn build(
        packets: &[AdcPacket],
        table: &TrackTable,
        context: &SimulationContext,
        events: Vec<EventStart>,
    ) -> (Self, ExportSummary) {
        let electronics = &context.detector().electronics;
        let settings = &context.detector().export;
        let pedestal = digitize(0.0, electronics);
        let mut summary = ExportSummary::default();

        let mut kept: Vec<(&AdcPacket, u64)> = Vec::with_capacity(packets.len());
        for packet in packets {
            if packet.adc <= pedestal {
                summary.below_pedestal += 1;
                continue;
            }
            let channel = encode_pixel(context, packet.pixel);
            if settings.bad_channels.contains(&channel) {
                summary.masked += 1;
                continue;
            }
            kept.push((packet, channel));
        }
        let width = kept.iter().map(|(packet, _)| packet.segments.len()).max().unwrap_or(0);

        let mut records = Vec::with_capacity(kept.len());
        let mut associations = Vec::with_capacity(kept.len());
        let mut markers = Vec::new();
        let mut rollover = Rollover { base: 0 };
        let mut current: Option<(u32, u64)> = None;
        for (packet, channel_id) in kept {
            let wire_t0 = match current {
                Some((event, wire_t0)) if event == packet.event_id => wire_t0,
                _ => {
                    let t0 = events
                        .iter()
                        .find(|start| start.event_id == packet.event_id)
                        .map_or(0, |start| start.t0);
                    let wire_t0 = rollover.advance(t0, records.len(), &mut markers);
                    for io_group in TRIGGER_IO_GROUPS {
                        markers.push(TimingMarker {
                            kind: MarkerKind::Trigger,
                            position: records.len(),
                            io_group: Some(io_group),
                            event_id: Some(packet.event_id),
                            timestamp: wire_t0,
                        });
                    }
                    current = Some((packet.event_id, wire_t0));
                    wire_t0
                }
            };

            records.push(PacketRecord {
                channel_id,
                pixel: packet.pixel,
                event_id: packet.event_id,
                dataword: packet.adc,
                timestamp: packet.timestamp,
                global_timestamp: (packet.timestamp + wire_t0) % TIMESTAMP_ROLLOVER,
                tick: packet.tick,
                charge: packet.charge,
            });

            let mut track_ids: Vec<i64> =
                packet.segments.iter().map(|segment| *segment as i64).collect();
            track_ids.resize(width, -1);
            let mut fraction = packet.fractions.clone();
            fraction.resize(width, 0.0);
            associations.push(PacketAssociation {
                track_ids,
                fraction,
            });
        }

        summary.written = records.len();
        for marker in &markers {
            match marker.kind {
                MarkerKind::Trigger => summary.triggers += 1,
                MarkerKind::Rollover => summary.rollovers += 1,
            }
        }

        let file = Self {
            format: PACKET_FILE_FORMAT.to_string(),
            configs: ExportConfigs::from_context(context),
            packets: records,
            mc_packets_assn: associations,
            events,
            markers,
            tracks_stage: table.stage(),
            tracks: table.segments().to_vec(),
        };
        (file, summary)
    }

    /// Rebuilds the packets as the readout produced them.
    pub fn adc_packets(&self) -> Vec<AdcPacket> {
        self.packets
            .iter()
            .zip(&self.mc_packets_assn)
            .map(|(record, association)| {
                let (segments, fractions) = association
                    .track_ids
                    .iter()
                    .zip(&association.fraction)
                    .filter(|(track, _)| **track >= 0)
                    .map(|(track, fraction)| (*track as usize, *fraction))
                    .unzip();
                AdcPacket {
                    event_id: record.event_id,
                    pixel: record.pixel,
                    adc: record.dataword,
                    tick: record.tick,
                    timestamp: record.timestamp,
                    charge: record.charge,
                    segments,
                    fractions,
                }
            })
            .collect()
    }

    pub fn track_table(&self) -> TrackTable {
        TrackTable::with_stage(self.tracks.clone(), self.tracks_stage)
    }
}

/// Writes the packet container to `path` atomically.
///
/// The number of packets written can be smaller than the readout count:
/// pedestal-only and masked packets are dropped and counted in the returned
/// summary.
pub fn export_packets(
    path: &Path,
    packets: &[AdcPacket],
    table: &TrackTable,
    context: &SimulationContext,
    pool: &RngStreamPool,
) -> SimResult<ExportSummary> {
    let events = event_start_times(table, context.detector().export.event_spacing, pool)?;
    let (file, summary) = PacketFile::build(packets, table, context, events);
    write_json_atomically(path, &file)?;
    tracing::info!(
        path = %path.display(),
        packets = summary.written,
        below_pedestal = summary.below_pedestal,
        masked = summary.masked,
        triggers = summary.triggers,
        rollovers = summary.rollovers,
        tracks = file.tracks.len(),
        "wrote packet file"
    );
    Ok(summary)
}

pub fn read_packet_file(path: &Path) -> SimResult<PacketFile> {
    let file: PacketFile = read_json_file(path, "packet file")?;
    if file.format != PACKET_FILE_FORMAT {
        return Err(SimError::input_validation(
            "INPUT.PACKET_FORMAT",
            format!(
                "'{}' has format '{}' but '{}' was expected",
                path.display(),
                file.format,
                PACKET_FILE_FORMAT
            ),
        ));
    }
    if file.packets.len() != file.mc_packets_assn.len() {
        return Err(SimError::input_validation(
            "INPUT.PACKET_FORMAT",
            format!(
                "'{}' has {} packets but {} associations",
                path.display(),
                file.packets.len(),
                file.mc_packets_assn.len()
            ),
        ));
    }
    if let Some(marker) = file.markers.iter().find(|marker| marker.position > file.packets.len()) {
        return Err(SimError::input_validation(
            "INPUT.PACKET_FORMAT",
            format!(
                "'{}' places a marker at {} after the last of {} packets",
                path.display(),
                marker.position,
                file.packets.len()
            ),
        ));
    }
    Ok(file)
}
