//! Stage registry
//!
//! The closed set of processing elements a branch can be built from. A
//! factory that fails means the element is unavailable, which makes the
//! branch construction fail.

use anyhow::Result;
use std::sync::Arc;

use super::sink::{DataSink, FileFrameSink, FrameSink, HexDumpSink, LogFrameSink};
use crate::config::ReceiverConfig;
use crate::decoder::{FfmpegDecoder, VideoDecode};
use crate::pipeline::payload::PayloadFormat;

/// Capacity of the channels between the stages of one branch.
pub const STAGE_CHANNEL_CAPACITY: usize = 64;

pub type DecoderFactory = Arc<dyn Fn() -> Result<Box<dyn VideoDecode>> + Send + Sync>;
pub type FrameSinkFactory =
    Arc<dyn Fn(&PayloadFormat) -> Result<Box<dyn FrameSink>> + Send + Sync>;
pub type DataSinkFactory = Arc<dyn Fn(&PayloadFormat) -> Result<Box<dyn DataSink>> + Send + Sync>;

#[derive(Clone)]
pub struct StageRegistry {
    decoder: DecoderFactory,
    frame_sink: FrameSinkFactory,
    data_sink: DataSinkFactory,
    stage_capacity: usize,
}

impl StageRegistry {
    /// FFmpeg decoding, frames logged or written to `video_output`, data hex-dumped.
    pub fn from_config(config: &ReceiverConfig) -> Self {
        let frame_sink: FrameSinkFactory = match &config.video_output {
            Some(path) => {
                let path = path.clone();
                Arc::new(move |_: &PayloadFormat| -> Result<Box<dyn FrameSink>> {
                    Ok(Box::new(FileFrameSink::create(&path)?))
                })
            }
            None => Arc::new(|_: &PayloadFormat| -> Result<Box<dyn FrameSink>> {
                Ok(Box::new(LogFrameSink::new()))
            }),
        };

        Self {
            decoder: Arc::new(|| -> Result<Box<dyn VideoDecode>> {
                Ok(Box::new(FfmpegDecoder::new()?))
            }),
            frame_sink,
            data_sink: Arc::new(|_: &PayloadFormat| -> Result<Box<dyn DataSink>> {
                Ok(Box::new(HexDumpSink::stdout()))
            }),
            stage_capacity: STAGE_CHANNEL_CAPACITY,
        }
    }

    pub fn with_decoder<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn VideoDecode>> + Send + Sync + 'static,
    {
        self.decoder = Arc::new(factory);
        self
    }

    pub fn with_frame_sink<F>(mut self, factory: F) -> Self
    where
        F: Fn(&PayloadFormat) -> Result<Box<dyn FrameSink>> + Send + Sync + 'static,
    {
        self.frame_sink = Arc::new(factory);
        self
    }

    pub fn with_data_sink<F>(mut self, factory: F) -> Self
    where
        F: Fn(&PayloadFormat) -> Result<Box<dyn DataSink>> + Send + Sync + 'static,
    {
        self.data_sink = Arc::new(factory);
        self
    }

    pub fn decoder(&self) -> Result<Box<dyn VideoDecode>> {
        (self.decoder)()
    }

    pub fn frame_sink(&self, format: &PayloadFormat) -> Result<Box<dyn FrameSink>> {
        (self.frame_sink)(format)
    }

    pub fn data_sink(&self, format: &PayloadFormat) -> Result<Box<dyn DataSink>> {
        (self.data_sink)(format)
    }

    pub fn stage_capacity(&self) -> usize {
        self.stage_capacity
    }
}
