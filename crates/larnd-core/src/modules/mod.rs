pub mod aggregation;
pub mod drifting;
pub mod export;
pub mod induction;
pub mod pixels;
pub mod quenching;
pub mod readout;
pub mod rng;
pub mod serialization;

pub use aggregation::{PixelSignal, PixelWaveforms, TrackStartIndex, sum_pixel_signals, time_intervals};
pub use drifting::drift;
pub use export::{
    ExportSettings, ExportSummary, PacketFile, event_start_times, export_packets, read_packet_file,
};
pub use induction::{FieldResponse, SignalTensor, TabulatedResponse, induce};
pub use pixels::{OverflowPolicy, PixelAssignment, ProjectionOutcome, project};
pub use quenching::{RecombinationModel, quench};
pub use readout::{AdcPacket, ElectronicsConfig, ReadoutOutcome, readout};
pub use rng::RngStreamPool;
