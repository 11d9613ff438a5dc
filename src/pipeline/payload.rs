//! Payload type resolution
//!
//! Maps an RTP payload type to the format a branch needs to interpret it.
//! Consulted lazily by the demultiplexer, once per newly seen payload type.

use crate::pipeline::types::MediaKind;

/// RTP clock rate shared by both predefined formats.
const CLOCK_RATE_90K: u32 = 90_000;

/// Strongly typed description of one payload type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadFormat {
    pub payload_type: u8,
    pub kind: MediaKind,
    pub encoding_name: &'static str,
    pub clock_rate: u32,
}

impl PayloadFormat {
    /// Capability string in `application/x-rtp` form.
    pub fn caps(&self) -> String {
        format!(
            "application/x-rtp, encoding-name=(string){}, media=(string){}, clock-rate=(int){}",
            self.encoding_name, self.kind, self.clock_rate
        )
    }
}

pub trait PayloadTypeResolver: Send + Sync {
    /// `None` means the payload type is unmapped.
    fn resolve(&self, payload_type: u8) -> Option<PayloadFormat>;
}

/// Fixed table of known payload types.
#[derive(Debug, Clone)]
pub struct StaticPayloadMap {
    entries: Vec<PayloadFormat>,
}

impl StaticPayloadMap {
    pub fn new(entries: Vec<PayloadFormat>) -> Self {
        Self { entries }
    }
}

impl Default for StaticPayloadMap {
    /// 96 is H.264 video; 99 carries GStreamer-payloaded application buffers.
    fn default() -> Self {
        Self::new(vec![
            PayloadFormat {
                payload_type: 96,
                kind: MediaKind::Video,
                encoding_name: "H264",
                clock_rate: CLOCK_RATE_90K,
            },
            PayloadFormat {
                payload_type: 99,
                kind: MediaKind::Application,
                encoding_name: "X-GST",
                clock_rate: CLOCK_RATE_90K,
            },
        ])
    }
}

impl PayloadTypeResolver for StaticPayloadMap {
    fn resolve(&self, payload_type: u8) -> Option<PayloadFormat> {
        self.entries
            .iter()
            .find(|format| format.payload_type == payload_type)
            .cloned()
    }
}
