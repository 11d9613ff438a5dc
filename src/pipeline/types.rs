//! Core types for the receiver graph

use bytes::Bytes;
use std::time::Instant;
use webrtc::rtp::packet::Packet;
use webrtc::util::Unmarshal;

/// Kind of media carried by a payload type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Application,
    Unknown,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video => write!(f, "video"),
            MediaKind::Application => write!(f, "application"),
            MediaKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// A classified RTP packet, as routed by the demultiplexer
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub payload_type: u8,
    pub payload: Bytes,
    pub marker: bool,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub received_at: Instant,
}

impl RtpPacket {
    /// Parse one transport data unit as an RTP packet.
    pub fn parse(mut data: Bytes) -> anyhow::Result<Self> {
        let packet = Packet::unmarshal(&mut data)?;
        Ok(Self::from(packet))
    }
}

impl From<Packet> for RtpPacket {
    fn from(packet: Packet) -> Self {
        Self {
            payload_type: packet.header.payload_type,
            payload: packet.payload,
            marker: packet.header.marker,
            sequence_number: packet.header.sequence_number,
            timestamp: packet.header.timestamp,
            ssrc: packet.header.ssrc,
            received_at: Instant::now(),
        }
    }
}

/// One H.264 NAL unit in Annex B form (start code included)
#[derive(Debug, Clone)]
pub struct NalUnit {
    pub data: Bytes,
    pub timestamp: u32,
    /// Last NAL of its access unit (RTP marker)
    pub end_of_au: bool,
}

impl NalUnit {
    pub fn nal_type(&self) -> Option<u8> {
        self.data.get(4).map(|header| header & 0x1F)
    }
}

/// A complete H.264 access unit (Annex B)
#[derive(Debug, Clone)]
pub struct AccessUnit {
    pub data: Bytes,
    pub timestamp: u32,
    pub is_keyframe: bool,
}

/// Decoded video frame with raw pixel data (packed YUV420p)
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: u32,
}

/// A reassembled application data buffer
#[derive(Debug, Clone, PartialEq)]
pub struct DataUnit {
    pub data: Bytes,
    pub timestamp: u32,
    /// Caps announced by the sender alongside this buffer, if any
    pub caps: Option<String>,
}
