//! Depayloading, parsing and decoding
//!
//! Pure, synchronous elements used by the branch stages: H.264 NAL
//! extraction and access unit assembly, FFmpeg decoding and `X-GST`
//! buffer reassembly.

mod depacketizer;
mod ffmpeg;
mod gst;
mod parser;

use crate::pipeline::types::{AccessUnit, VideoFrame};

pub use depacketizer::{H264Depayloader, START_CODE};
pub use ffmpeg::FfmpegDecoder;
pub use gst::{GstDepayError, GstDepayloader, GstUnit};
pub use parser::AccessUnitParser;

/// A video decoder usable by the decode stage.
pub trait VideoDecode: Send {
    /// `Ok(None)` means the decoder needs more input before it can emit a frame.
    fn decode(&mut self, unit: &AccessUnit) -> anyhow::Result<Option<VideoFrame>>;

    fn name(&self) -> &'static str;
}
