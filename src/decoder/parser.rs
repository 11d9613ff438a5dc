use bytes::{BufMut, BytesMut};

use crate::pipeline::types::{AccessUnit, NalUnit};

const NAL_IDR: u8 = 5;
const NAL_SPS: u8 = 7;

/// Groups NAL units into access units.
///
/// An access unit ends on the RTP marker bit or when a NAL with a new
/// timestamp arrives. Nothing is emitted until the first unit that carries
/// an IDR slice or an SPS, so the decoder always starts from a keyframe.
#[derive(Debug, Default)]
pub struct AccessUnitParser {
    buffer: BytesMut,
    timestamp: Option<u32>,
    keyframe: bool,
    seen_keyframe: bool,
    discarded: u64,
}

impl AccessUnitParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, nal: NalUnit) -> Vec<AccessUnit> {
        let mut complete = Vec::new();

        if self.timestamp.is_some_and(|ts| ts != nal.timestamp) {
            // previous unit lost its marker packet
            complete.extend(self.flush());
        }

        self.timestamp = Some(nal.timestamp);
        if matches!(nal.nal_type(), Some(NAL_IDR) | Some(NAL_SPS)) {
            self.keyframe = true;
        }
        self.buffer.put_slice(&nal.data);

        if nal.end_of_au {
            complete.extend(self.flush());
        }
        complete
    }

    /// Emit whatever is buffered as a (possibly truncated) access unit.
    pub fn flush(&mut self) -> Option<AccessUnit> {
        let timestamp = self.timestamp.take()?;
        let data = self.buffer.split().freeze();
        let is_keyframe = std::mem::take(&mut self.keyframe);

        if data.is_empty() {
            return None;
        }
        if !self.seen_keyframe && !is_keyframe {
            self.discarded += 1;
            return None;
        }
        if is_keyframe && !self.seen_keyframe {
            log::info!("AccessUnitParser: first keyframe at ts {}", timestamp);
        }
        self.seen_keyframe = true;

        Some(AccessUnit {
            data,
            timestamp,
            is_keyframe,
        })
    }

    /// Units dropped while waiting for the first keyframe since the last call.
    pub fn take_discarded(&mut self) -> u64 {
        std::mem::take(&mut self.discarded)
    }
}
