//! Video branch stages
//!
//! queue → H.264 depayload → access unit parse → decode → frame sink

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::sink::FrameSink;
use crate::decoder::{AccessUnitParser, H264Depayloader, VideoDecode};
use crate::pipeline::health::BranchHealth;
use crate::pipeline::stage::{PipelineStage, wired};
use crate::pipeline::types::{AccessUnit, NalUnit, RtpPacket, VideoFrame};

/// Consecutive decode failures before waiting for a keyframe again.
const MAX_CONSECUTIVE_FAILURES: u32 = 10;

/// Extracts NAL units from H.264 RTP packets.
pub struct H264DepayStage {
    input_rx: Option<mpsc::Receiver<RtpPacket>>,
    output_tx: Option<mpsc::Sender<NalUnit>>,
}

impl H264DepayStage {
    pub fn new() -> Self {
        Self {
            input_rx: None,
            output_tx: None,
        }
    }

    pub fn set_input(&mut self, rx: mpsc::Receiver<RtpPacket>) {
        self.input_rx = Some(rx);
    }

    pub fn take_output(&mut self, capacity: usize) -> mpsc::Receiver<NalUnit> {
        let (tx, rx) = mpsc::channel(capacity);
        self.output_tx = Some(tx);
        rx
    }
}

#[async_trait]
impl PipelineStage for H264DepayStage {
    async fn run(&mut self) -> Result<()> {
        let mut input_rx = wired(&mut self.input_rx, "input")?;
        let output_tx = wired(&mut self.output_tx, "output")?;
        let mut depayloader = H264Depayloader::new();

        info!("H264DepayStage: started");

        'packets: while let Some(packet) = input_rx.recv().await {
            let nals = depayloader.push(&packet.payload, packet.sequence_number);
            let last = nals.len().saturating_sub(1);

            for (i, data) in nals.into_iter().enumerate() {
                let nal = NalUnit {
                    data,
                    timestamp: packet.timestamp,
                    end_of_au: packet.marker && i == last,
                };
                if output_tx.send(nal).await.is_err() {
                    break 'packets;
                }
            }
        }

        info!("H264DepayStage: finished");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "h264-depay"
    }
}

/// Groups NAL units into access units, starting at the first keyframe.
pub struct H264ParseStage {
    health: Arc<BranchHealth>,
    input_rx: Option<mpsc::Receiver<NalUnit>>,
    output_tx: Option<mpsc::Sender<AccessUnit>>,
}

impl H264ParseStage {
    pub fn new(health: Arc<BranchHealth>) -> Self {
        Self {
            health,
            input_rx: None,
            output_tx: None,
        }
    }

    pub fn set_input(&mut self, rx: mpsc::Receiver<NalUnit>) {
        self.input_rx = Some(rx);
    }

    pub fn take_output(&mut self, capacity: usize) -> mpsc::Receiver<AccessUnit> {
        let (tx, rx) = mpsc::channel(capacity);
        self.output_tx = Some(tx);
        rx
    }

    fn account(&self, parser: &mut AccessUnitParser) {
        for _ in 0..parser.take_discarded() {
            self.health.record_drop();
        }
    }
}

#[async_trait]
impl PipelineStage for H264ParseStage {
    async fn run(&mut self) -> Result<()> {
        let mut input_rx = wired(&mut self.input_rx, "input")?;
        let output_tx = wired(&mut self.output_tx, "output")?;
        let mut parser = AccessUnitParser::new();

        info!("H264ParseStage: started");

        'nals: while let Some(nal) = input_rx.recv().await {
            let units = parser.push(nal);
            self.account(&mut parser);

            for unit in units {
                self.health.record_unit();
                if output_tx.send(unit).await.is_err() {
                    break 'nals;
                }
            }
        }

        if let Some(unit) = parser.flush() {
            self.health.record_unit();
            let _ = output_tx.send(unit).await;
        }
        self.account(&mut parser);

        info!("H264ParseStage: finished");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "h264-parse"
    }
}

/// Decodes access units into raw frames.
pub struct DecodeStage {
    decoder: Box<dyn VideoDecode>,
    health: Arc<BranchHealth>,
    input_rx: Option<mpsc::Receiver<AccessUnit>>,
    output_tx: Option<mpsc::Sender<VideoFrame>>,
}

impl DecodeStage {
    pub fn new(decoder: Box<dyn VideoDecode>, health: Arc<BranchHealth>) -> Self {
        Self {
            decoder,
            health,
            input_rx: None,
            output_tx: None,
        }
    }

    pub fn set_input(&mut self, rx: mpsc::Receiver<AccessUnit>) {
        self.input_rx = Some(rx);
    }

    pub fn take_output(&mut self, capacity: usize) -> mpsc::Receiver<VideoFrame> {
        let (tx, rx) = mpsc::channel(capacity);
        self.output_tx = Some(tx);
        rx
    }
}

#[async_trait]
impl PipelineStage for DecodeStage {
    async fn run(&mut self) -> Result<()> {
        let mut input_rx = wired(&mut self.input_rx, "input")?;
        let output_tx = wired(&mut self.output_tx, "output")?;

        let mut consecutive_failures: u32 = 0;
        let mut waiting_for_keyframe = false;
        let mut decoded_frames = 0u64;

        info!("DecodeStage: started ({})", self.decoder.name());

        while let Some(unit) = input_rx.recv().await {
            if waiting_for_keyframe {
                if !unit.is_keyframe {
                    self.health.record_drop();
                    continue;
                }
                info!("DecodeStage: resuming at keyframe ts {}", unit.timestamp);
                waiting_for_keyframe = false;
            }

            match self.decoder.decode(&unit) {
                Ok(Some(frame)) => {
                    consecutive_failures = 0;
                    decoded_frames += 1;
                    if output_tx.send(frame).await.is_err() {
                        info!("DecodeStage: output channel closed");
                        break;
                    }
                }
                Ok(None) => {
                    consecutive_failures = 0;
                    debug!("DecodeStage: decoder buffering at ts {}", unit.timestamp);
                }
                Err(e) => {
                    consecutive_failures += 1;
                    self.health.record_decode_failure();
                    debug!("DecodeStage: {}", e);

                    if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        warn!(
                            "DecodeStage: {} consecutive failures, waiting for next keyframe",
                            MAX_CONSECUTIVE_FAILURES
                        );
                        consecutive_failures = 0;
                        waiting_for_keyframe = true;
                    }
                }
            }
        }

        info!("DecodeStage: finished ({} decoded frames)", decoded_frames);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "decode"
    }
}

/// Hands decoded frames to the branch's frame sink.
pub struct FrameSinkStage {
    sink: Box<dyn FrameSink>,
    health: Arc<BranchHealth>,
    input_rx: Option<mpsc::Receiver<VideoFrame>>,
}

impl FrameSinkStage {
    pub fn new(sink: Box<dyn FrameSink>, health: Arc<BranchHealth>) -> Self {
        Self {
            sink,
            health,
            input_rx: None,
        }
    }

    pub fn set_input(&mut self, rx: mpsc::Receiver<VideoFrame>) {
        self.input_rx = Some(rx);
    }
}

#[async_trait]
impl PipelineStage for FrameSinkStage {
    async fn run(&mut self) -> Result<()> {
        let mut input_rx = wired(&mut self.input_rx, "input")?;

        info!("FrameSinkStage: started ({})", self.sink.name());

        while let Some(frame) = input_rx.recv().await {
            self.sink.render(frame).await?;
            self.health.record_rendered();
        }

        info!("FrameSinkStage: finished");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "video-sink"
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.sink.finish().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{FailingDecoder, PassthroughDecoder, rtp_at};
    use bytes::Bytes;

    #[tokio::test]
    async fn test_depay_marks_end_of_access_unit() {
        let (tx, rx) = mpsc::channel(8);
        let mut stage = H264DepayStage::new();
        stage.set_input(rx);
        let mut out = stage.take_output(8);

        // STAP-A with SPS + PPS, then an IDR carrying the marker
        tx.send(rtp_at(96, 1, 900, false, &[24, 0, 2, 0x67, 1, 0, 2, 0x68, 2]))
            .await
            .unwrap();
        tx.send(rtp_at(96, 2, 900, true, &[0x65, 0xAA])).await.unwrap();
        drop(tx);

        stage.run().await.unwrap();

        let nals: Vec<NalUnit> = std::iter::from_fn(|| out.try_recv().ok()).collect();
        assert_eq!(nals.len(), 3);
        assert_eq!(
            nals.iter().map(|n| n.end_of_au).collect::<Vec<_>>(),
            vec![false, false, true]
        );
        assert_eq!(nals[2].nal_type(), Some(5));
    }

    #[tokio::test]
    async fn test_parse_drops_until_keyframe() {
        let health = Arc::new(BranchHealth::new());
        let (tx, rx) = mpsc::channel(8);
        let mut stage = H264ParseStage::new(health.clone());
        stage.set_input(rx);
        let mut out = stage.take_output(8);

        let nal = |nal_type: u8, ts: u32| NalUnit {
            data: Bytes::from(vec![0, 0, 0, 1, 0x60 | nal_type]),
            timestamp: ts,
            end_of_au: true,
        };
        tx.send(nal(1, 1)).await.unwrap();
        tx.send(nal(5, 2)).await.unwrap();
        tx.send(nal(1, 3)).await.unwrap();
        drop(tx);

        stage.run().await.unwrap();

        assert!(out.recv().await.unwrap().is_keyframe);
        assert_eq!(out.recv().await.unwrap().timestamp, 3);
        let summary = health.summary();
        assert_eq!(summary.units_assembled, 2);
        assert_eq!(summary.units_dropped, 1);
    }

    fn unit(ts: u32, is_keyframe: bool) -> AccessUnit {
        AccessUnit {
            data: Bytes::from_static(&[0, 0, 0, 1, 0x65]),
            timestamp: ts,
            is_keyframe,
        }
    }

    #[tokio::test]
    async fn test_decode_passes_frames() {
        let health = Arc::new(BranchHealth::new());
        let (tx, rx) = mpsc::channel(8);
        let mut stage = DecodeStage::new(Box::new(PassthroughDecoder), health.clone());
        stage.set_input(rx);
        let mut out = stage.take_output(8);

        tx.send(unit(10, true)).await.unwrap();
        tx.send(unit(20, false)).await.unwrap();
        drop(tx);
        stage.run().await.unwrap();

        assert_eq!(out.recv().await.unwrap().timestamp, 10);
        assert_eq!(out.recv().await.unwrap().timestamp, 20);
        assert_eq!(health.summary().decode_failures, 0);
    }

    #[tokio::test]
    async fn test_decode_failures_rearm_keyframe_wait() {
        let health = Arc::new(BranchHealth::new());
        let (tx, rx) = mpsc::channel(32);
        let mut stage = DecodeStage::new(Box::new(FailingDecoder), health.clone());
        stage.set_input(rx);
        let _out = stage.take_output(8);

        for ts in 0..MAX_CONSECUTIVE_FAILURES {
            tx.send(unit(ts, false)).await.unwrap();
        }
        // skipped without reaching the decoder
        tx.send(unit(100, false)).await.unwrap();
        tx.send(unit(101, false)).await.unwrap();
        drop(tx);
        stage.run().await.unwrap();

        let summary = health.summary();
        assert_eq!(summary.decode_failures, MAX_CONSECUTIVE_FAILURES as u64);
        assert_eq!(summary.units_dropped, 2);
    }
}
