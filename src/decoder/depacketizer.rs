use bytes::{BufMut, Bytes, BytesMut};

/// Annex B start code prepended to every NAL unit.
pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

const NAL_STAP_A: u8 = 24;
const NAL_FU_A: u8 = 28;

/// Largest NAL unit reassembled from FU-A fragments.
pub const MAX_FRAGMENT_SIZE: usize = 4 * 1024 * 1024;

/// Extracts H.264 NAL units from RTP payloads (RFC 6184).
///
/// Handles single NAL unit packets, STAP-A aggregates and FU-A fragments.
/// Every returned NAL unit is in Annex B form.
#[derive(Debug, Default)]
pub struct H264Depayloader {
    fragment: BytesMut,
    in_fua_fragment: bool,
    last_sequence: Option<u16>,
}

impl H264Depayloader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard any partially reassembled fragment.
    pub fn reset(&mut self) {
        self.fragment.clear();
        self.in_fua_fragment = false;
        self.last_sequence = None;
    }

    /// Feed one RTP payload with its sequence number.
    ///
    /// Returns the NAL units completed by this payload (possibly none).
    pub fn push(&mut self, payload: &[u8], sequence_number: u16) -> Vec<Bytes> {
        let gap = self
            .last_sequence
            .is_some_and(|last| last.wrapping_add(1) != sequence_number);
        self.last_sequence = Some(sequence_number);

        if gap && self.in_fua_fragment {
            log::warn!(
                "H264Depayloader: sequence gap before {}, dropping partial fragment",
                sequence_number
            );
            self.fragment.clear();
            self.in_fua_fragment = false;
        }

        let Some(&indicator) = payload.first() else {
            return Vec::new();
        };

        match indicator & 0x1F {
            // Single NAL unit (types 1-23)
            1..=23 => vec![annex_b(payload)],
            NAL_STAP_A => {
                let mut nals = Vec::new();
                let mut offset = 1;
                while offset + 2 <= payload.len() {
                    let nalu_len =
                        u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
                    offset += 2;
                    if nalu_len == 0 || offset + nalu_len > payload.len() {
                        break;
                    }
                    nals.push(annex_b(&payload[offset..offset + nalu_len]));
                    offset += nalu_len;
                }
                nals
            }
            NAL_FU_A => self.push_fragment(payload).into_iter().collect(),
            _ => Vec::new(),
        }
    }

    fn push_fragment(&mut self, payload: &[u8]) -> Option<Bytes> {
        if payload.len() < 2 {
            return None;
        }
        let fu_indicator = payload[0];
        let fu_header = payload[1];
        let start = (fu_header & 0x80) != 0;
        let end = (fu_header & 0x40) != 0;

        if start {
            if self.in_fua_fragment {
                log::warn!("FU-A: new start while previous fragment incomplete, discarding buffer");
                self.fragment.clear();
            }
            self.in_fua_fragment = true;
            // NRI from the indicator, type from the FU header
            self.fragment.put_slice(&START_CODE);
            self.fragment.put_u8((fu_indicator & 0xE0) | (fu_header & 0x1F));
        } else if !self.in_fua_fragment {
            // middle/end without a start
            return None;
        }

        if self.fragment.len() + payload.len() - 2 > MAX_FRAGMENT_SIZE {
            log::warn!(
                "FU-A: fragment exceeds {} bytes without an end, discarding buffer",
                MAX_FRAGMENT_SIZE
            );
            self.fragment.clear();
            self.in_fua_fragment = false;
            return None;
        }
        self.fragment.put_slice(&payload[2..]);

        if end {
            self.in_fua_fragment = false;
            Some(self.fragment.split().freeze())
        } else {
            None
        }
    }
}

fn annex_b(nal: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(START_CODE.len() + nal.len());
    out.put_slice(&START_CODE);
    out.put_slice(nal);
    out.freeze()
}
