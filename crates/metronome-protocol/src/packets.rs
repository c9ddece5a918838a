/// RTP-MIDI realtime datagram framing for the output controller's MIDI
/// clock (§4.5). A minimal RTP header (no SSRC — this is a point-to-point
/// clock feed, not a full AppleMIDI session) followed by the RFC 6295
/// command section carrying exactly one MIDI system-realtime byte.
use serde::{Deserialize, Serialize};

/// RTP payload type used for MIDI command sections over RTP, per the
/// applicable realtime-over-RTP payload convention.
pub const RTP_PAYLOAD_TYPE: u8 = 97;
const RTP_VERSION: u8 = 2;

/// The three system-realtime messages the output controller emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RealtimeMessage {
    Clock = 0xF8,
    Start = 0xFA,
    Stop = 0xFC,
}

impl RealtimeMessage {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0xF8 => Some(Self::Clock),
            0xFA => Some(Self::Start),
            0xFC => Some(Self::Stop),
            _ => None,
        }
    }
}

/// A single RTP-MIDI realtime datagram: RTP header + one-byte MIDI command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiClockPacket {
    pub sequence: u16,
    /// Microsecond-tick timestamp, truncated to 32 bits per the wire format.
    pub timestamp_us: u32,
    pub message: RealtimeMessage,
}

impl MidiClockPacket {
    /// rtp flags(2) + sequence(2) + timestamp(4) + command length(1) + midi byte(1)
    pub const SIZE: usize = 10;

    pub fn serialize(&self, buf: &mut [u8; Self::SIZE]) {
        buf[0] = RTP_VERSION << 6;
        buf[1] = RTP_PAYLOAD_TYPE & 0x7F;
        buf[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp_us.to_be_bytes());
        // RFC 6295 short command section header: B=0 (short form), length=1.
        buf[8] = 0x01;
        buf[9] = self.message as u8;
    }

    pub fn deserialize(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        if (data[0] >> 6) != RTP_VERSION {
            return None;
        }
        if (data[1] & 0x7F) != RTP_PAYLOAD_TYPE {
            return None;
        }
        let sequence = u16::from_be_bytes([data[2], data[3]]);
        let timestamp_us = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let command_len = data[8] & 0x0F;
        if command_len != 1 {
            return None;
        }
        let message = RealtimeMessage::from_u8(data[9])?;

        Some(Self {
            sequence,
            timestamp_us,
            message,
        })
    }
}
