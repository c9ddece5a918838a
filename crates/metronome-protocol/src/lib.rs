pub mod config;
pub mod error;
pub mod packets;
pub mod ringbuf;

/// Protocol version carried in discovery/identity exchanges with external
/// collaborators (admin dashboards, bridges). Not otherwise interpreted by
/// the core.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default UDP port for RTP-MIDI realtime (clock/start/stop) datagrams.
pub const DEFAULT_MIDI_CLOCK_PORT: u16 = 5004;

/// Default pulses-per-quarter-note for MIDI clock scheduling.
pub const DEFAULT_PPQN: u16 = 24;

/// Size of the tap buffer owned by the BPM estimation engine.
pub const TAP_BUFFER_CAPACITY: usize = 64;

/// Size of the rolling window owned by the audio detection engine.
pub const ROLLING_WINDOW_CAPACITY: usize = 64;
