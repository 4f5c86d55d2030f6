use serde::{Deserialize, Serialize};

use crate::audio::{AdtsPacket, LocalizationResult, StreamControl, StreamerConfig};
use crate::node::ControlCommand;

/// Control message received from the sibling process.
#[derive(Deserialize, Debug, Clone)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub sample_rate: Option<u32>,
    pub channels: Option<u8>,
    pub bit_rate: Option<u32>,
    pub aot: Option<u8>,
}

impl ControlMessage {
    /// Missing codec fields fall back to `defaults`. Unknown types yield `None`.
    pub fn to_command(&self, defaults: &StreamerConfig) -> Option<ControlCommand> {
        let start = match self.msg_type.as_str() {
            "start" => true,
            "stop" => false,
            _ => return None,
        };
        Some(ControlCommand {
            start,
            sample_rate: self.sample_rate.unwrap_or(defaults.sample_rate),
            channels: self.channels.unwrap_or(defaults.channels),
            bit_rate: self.bit_rate.unwrap_or(defaults.bit_rate),
            aot: self.aot.unwrap_or(defaults.aot),
        })
    }
}

#[derive(Serialize, Debug)]
struct StreamControlEvent<'a> {
    #[serde(rename = "type")]
    msg_type: &'static str,
    frame_id: &'a str,
    timestamp: u64,
    state: &'static str,
    sample_rate: u32,
    channels: u8,
    bit_rate: u32,
    aot: u8,
}

#[derive(Serialize, Debug)]
struct SoundLocalizationEvent<'a> {
    #[serde(rename = "type")]
    msg_type: &'static str,
    frame_id: &'a str,
    timestamp: u64,
    azimuth: f32,
    elevation: f32,
    confidence: f32,
    loudness: [f32; 4],
}

const FRAME_ID: &str = "microphone";

pub fn stream_control_event(c: &StreamControl, timestamp: u64) -> serde_json::Result<String> {
    serde_json::to_string(&StreamControlEvent {
        msg_type: "stream_control",
        frame_id: FRAME_ID,
        timestamp,
        state: if c.is_start { "start" } else { "stop" },
        sample_rate: c.sample_rate,
        channels: c.channels,
        bit_rate: c.bit_rate,
        aot: c.aot,
    })
}

pub fn sound_localization_event(r: &LocalizationResult, timestamp: u64) -> serde_json::Result<String> {
    serde_json::to_string(&SoundLocalizationEvent {
        msg_type: "sound_localization",
        frame_id: FRAME_ID,
        timestamp,
        azimuth: r.azimuth,
        elevation: r.elevation,
        confidence: r.confidence,
        loudness: r.loudness,
    })
}

/// Bytes in front of the ADTS payload of a data datagram.
pub const DATA_HEADER_LEN: usize = 14;

/// Data datagram: big-endian `seq` (u32), `pts_ms` (u64), `frame_count`
/// (u16), then the ADTS bytes. Gaps in `seq` show dropped frames.
pub fn adts_datagram(p: &AdtsPacket) -> Vec<u8> {
    let mut buf = Vec::with_capacity(DATA_HEADER_LEN + p.payload.len());
    buf.extend_from_slice(&p.seq.to_be_bytes());
    buf.extend_from_slice(&p.pts_ms.to_be_bytes());
    buf.extend_from_slice(&p.frame_count.to_be_bytes());
    buf.extend_from_slice(&p.payload);
    buf
}
