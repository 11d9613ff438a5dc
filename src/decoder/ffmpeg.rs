use ac_ffmpeg::codec::Decoder;
use ac_ffmpeg::codec::video::{VideoDecoder, VideoFrame as RawFrame};
use ac_ffmpeg::packet::PacketMut;
use ac_ffmpeg::time::{TimeBase, Timestamp};
use anyhow::{Result, anyhow, bail};

use super::VideoDecode;
use crate::pipeline::types::{AccessUnit, VideoFrame};

/// RTP video clock
fn time_base() -> TimeBase {
    TimeBase::new(1, 90_000)
}

/// H.264 decoder backed by FFmpeg's software decoder.
///
/// Access units are submitted with their RTP timestamp as pts; decoded
/// frames come out as packed YUV420p with stride padding stripped.
pub struct FfmpegDecoder {
    decoder: VideoDecoder,
    /// Unwrapped RTP timestamp, keeps pts monotonic across the 32-bit wrap
    last_rtp: Option<u32>,
    pts: i64,
}

// The codec context is only ever touched from the decode stage's task.
unsafe impl Send for FfmpegDecoder {}

impl FfmpegDecoder {
    pub fn new() -> Result<Self> {
        let decoder = VideoDecoder::builder("h264")
            .map_err(|e| anyhow!("h264 decoder not available: {}", e))?
            .time_base(time_base())
            .build()
            .map_err(|e| anyhow!("failed to open h264 decoder: {}", e))?;

        Ok(Self {
            decoder,
            last_rtp: None,
            pts: 0,
        })
    }

    fn pts_for(&mut self, rtp_timestamp: u32) -> Timestamp {
        if let Some(last) = self.last_rtp {
            self.pts += i64::from(rtp_timestamp.wrapping_sub(last) as i32);
        }
        self.last_rtp = Some(rtp_timestamp);
        Timestamp::new(self.pts, time_base())
    }
}

impl VideoDecode for FfmpegDecoder {
    fn decode(&mut self, unit: &AccessUnit) -> Result<Option<VideoFrame>> {
        let pts = self.pts_for(unit.timestamp);
        let packet = PacketMut::from(&unit.data[..]).with_pts(pts).freeze();

        if self.decoder.try_push(packet).is_err() {
            bail!("decoder rejected access unit at ts {}", unit.timestamp);
        }

        let decoded = self
            .decoder
            .take()
            .map_err(|e| anyhow!("failed to take decoded frame: {}", e))?;
        match decoded {
            Some(frame) => Ok(Some(pack_frame(&frame, unit.timestamp))),
            None => Ok(None),
        }
    }

    fn name(&self) -> &'static str {
        "ffmpeg-h264"
    }
}

fn pack_frame(frame: &RawFrame, timestamp: u32) -> VideoFrame {
    let width = frame.width();
    let height = frame.height();
    let (chroma_w, chroma_h) = chroma_size(width, height);
    let planes = frame.planes();

    let mut data = vec![0u8; width * height + chroma_w * chroma_h * 2];
    let (luma, chroma) = data.split_at_mut(width * height);
    let (u, v) = chroma.split_at_mut(chroma_w * chroma_h);

    copy_plane(luma, planes[0].data(), planes[0].line_size(), width, height);
    copy_plane(u, planes[1].data(), planes[1].line_size(), chroma_w, chroma_h);
    copy_plane(v, planes[2].data(), planes[2].line_size(), chroma_w, chroma_h);

    VideoFrame {
        data,
        width: width as u32,
        height: height as u32,
        timestamp,
    }
}

/// Chroma plane dimensions of a YUV420p frame; odd sizes round up.
fn chroma_size(width: usize, height: usize) -> (usize, usize) {
    (width.div_ceil(2), height.div_ceil(2))
}

/// Copy a padded plane into a contiguous buffer.
#[inline]
fn copy_plane(dst: &mut [u8], src: &[u8], stride: usize, width: usize, height: usize) {
    if stride == width && src.len() >= width * height {
        dst.copy_from_slice(&src[..width * height]);
        return;
    }

    for (row, out) in dst.chunks_exact_mut(width).take(height).enumerate() {
        let start = row * stride;
        let Some(line) = src.get(start..start + width) else {
            break;
        };
        out.copy_from_slice(line);
    }
}
