//! Depayloader for `X-GST` RTP streams
//!
//! Each packet starts with an 8 byte header:
//!
//! ```text
//!  0                   1                   2                   3
//! |C| CV  |D|0|0|0|     ETYPE     |              MBZ              |
//! |                          Frag_offset                          |
//! ```
//!
//! Fragments are concatenated until the RTP marker. A reassembled buffer
//! may be prefixed by a length-coded caps string (C set) or be an event
//! (ETYPE non-zero) rather than data.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::pipeline::types::{DataUnit, RtpPacket};

const HEADER_LEN: usize = 8;
const FLAG_CAPS: u8 = 0x80;

/// Largest buffer reassembled before the marker bit.
pub const MAX_BUFFER_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GstDepayError {
    #[error("payload shorter than the 8 byte header")]
    Truncated,
    #[error("fragment at offset {got}, expected {expected}")]
    FragmentGap { expected: u32, got: u32 },
    #[error("malformed length prefix")]
    BadLength,
    #[error("buffer of {size} bytes exceeds the reassembly limit")]
    Oversized { size: usize },
}

/// What a completed buffer turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum GstUnit {
    Data(DataUnit),
    /// Serialized event of the given type; not forwarded
    Event(u8),
}

#[derive(Debug, Default)]
pub struct GstDepayloader {
    buffer: BytesMut,
    /// Header byte 0 and ETYPE of the first fragment
    flags: u8,
    event_type: u8,
    /// Waiting for a fragment with offset 0
    resync: bool,
    last_caps: Option<String>,
}

impl GstDepayloader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps most recently announced by the sender.
    pub fn caps(&self) -> Option<&str> {
        self.last_caps.as_deref()
    }

    pub fn push(&mut self, packet: &RtpPacket) -> Result<Option<GstUnit>, GstDepayError> {
        let mut payload = packet.payload.clone();
        if payload.len() < HEADER_LEN {
            self.discard();
            return Err(GstDepayError::Truncated);
        }

        let flags = payload.get_u8();
        let event_type = payload.get_u8();
        payload.advance(2);
        let frag_offset = payload.get_u32();

        if self.resync {
            if frag_offset != 0 {
                return Ok(None);
            }
            self.resync = false;
        }

        let expected = self.buffer.len() as u32;
        if frag_offset != expected {
            self.discard();
            self.resync = frag_offset != 0;
            if self.resync {
                return Err(GstDepayError::FragmentGap {
                    expected,
                    got: frag_offset,
                });
            }
        }

        if frag_offset == 0 {
            self.flags = flags;
            self.event_type = event_type;
        }
        let size = self.buffer.len() + payload.len();
        if size > MAX_BUFFER_SIZE {
            self.discard();
            self.resync = true;
            return Err(GstDepayError::Oversized { size });
        }
        self.buffer.put(payload);

        if !packet.marker {
            return Ok(None);
        }

        let assembled = self.buffer.split().freeze();
        self.finish(assembled, packet.timestamp).map(Some)
    }

    fn finish(&mut self, mut assembled: Bytes, timestamp: u32) -> Result<GstUnit, GstDepayError> {
        if self.flags & FLAG_CAPS != 0 {
            let caps = read_prefixed(&mut assembled)?;
            let caps = String::from_utf8_lossy(&caps)
                .trim_end_matches('\0')
                .to_string();
            log::debug!("GstDepayloader: caps changed to {}", caps);
            self.last_caps = Some(caps);
        }

        if self.event_type != 0 {
            return Ok(GstUnit::Event(self.event_type));
        }

        Ok(GstUnit::Data(DataUnit {
            data: assembled,
            timestamp,
            caps: self.last_caps.clone(),
        }))
    }

    fn discard(&mut self) {
        self.buffer.clear();
        self.flags = 0;
        self.event_type = 0;
    }
}

/// Read a length-prefixed block: 7 bits per byte, high bit continues.
fn read_prefixed(data: &mut Bytes) -> Result<Bytes, GstDepayError> {
    let mut len: usize = 0;
    loop {
        if !data.has_remaining() || len > (usize::MAX >> 7) {
            return Err(GstDepayError::BadLength);
        }
        let b = data.get_u8();
        len = (len << 7) | usize::from(b & 0x7F);
        if b & 0x80 == 0 {
            break;
        }
    }
    if len > data.len() {
        return Err(GstDepayError::BadLength);
    }
    Ok(data.split_to(len))
}
