//! Test doubles shared by the pipeline tests

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::util::Marshal;

use crate::config::{ReceiverConfig, SrtUri};
use crate::decoder::VideoDecode;
use crate::identity::StreamIdentity;
use crate::pipeline::branch::{DataSink, FrameSink, StageRegistry};
use crate::pipeline::types::{AccessUnit, DataUnit, RtpPacket, VideoFrame};
use crate::transport::{TransportError, TransportSource};

pub fn rtp_at(payload_type: u8, seq: u16, timestamp: u32, marker: bool, payload: &[u8]) -> RtpPacket {
    RtpPacket {
        payload_type,
        payload: Bytes::copy_from_slice(payload),
        marker,
        sequence_number: seq,
        timestamp,
        ssrc: 0x1234,
        received_at: Instant::now(),
    }
}

pub fn rtp(payload_type: u8, seq: u16, marker: bool, payload: &[u8]) -> RtpPacket {
    rtp_at(payload_type, seq, u32::from(seq) * 3000, marker, payload)
}

/// Same packet as [`rtp`], serialized for the wire.
pub fn rtp_bytes(payload_type: u8, seq: u16, marker: bool, payload: &[u8]) -> Bytes {
    Packet {
        header: Header {
            version: 2,
            marker,
            payload_type,
            sequence_number: seq,
            timestamp: u32::from(seq) * 3000,
            ssrc: 0x1234,
            ..Default::default()
        },
        payload: Bytes::copy_from_slice(payload),
    }
    .marshal()
    .unwrap()
}

pub fn test_config() -> ReceiverConfig {
    ReceiverConfig::new(
        SrtUri::parse("srt://127.0.0.1:7001").unwrap(),
        StreamIdentity::default(),
    )
}

/// Poll `condition` for up to two seconds.
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// In-memory transport that replays a fixed list of data units.
pub struct ScriptedSource {
    units: VecDeque<Bytes>,
    fail_connect: bool,
    /// Resolved once the units are exhausted: `Ok` ends the stream, `Err` fails it
    finish: Option<oneshot::Receiver<Result<(), String>>>,
}

impl ScriptedSource {
    /// Replays `units`, then reports end-of-stream.
    pub fn new(units: Vec<Bytes>) -> Self {
        Self {
            units: units.into(),
            fail_connect: false,
            finish: None,
        }
    }

    /// Replays `units`, then waits for the returned sender to decide how the stream ends.
    pub fn held(units: Vec<Bytes>) -> (Self, oneshot::Sender<Result<(), String>>) {
        let (tx, rx) = oneshot::channel();
        let mut source = Self::new(units);
        source.finish = Some(rx);
        (source, tx)
    }

    pub fn failing_connect() -> Self {
        Self {
            units: VecDeque::new(),
            fail_connect: true,
            finish: None,
        }
    }
}

#[async_trait]
impl TransportSource for ScriptedSource {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.fail_connect {
            return Err(TransportError::Connect {
                endpoint: self.describe(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        if let Some(unit) = self.units.pop_front() {
            return Ok(Some(unit));
        }
        match self.finish.take() {
            Some(finish) => match finish.await {
                Ok(Err(reason)) => Err(TransportError::Receive(reason)),
                Ok(Ok(())) | Err(_) => Ok(None),
            },
            None => Ok(None),
        }
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

/// Emits every access unit as a 2x2 frame carrying the unit's bytes.
pub struct PassthroughDecoder;

impl VideoDecode for PassthroughDecoder {
    fn decode(&mut self, unit: &AccessUnit) -> Result<Option<VideoFrame>> {
        Ok(Some(VideoFrame {
            data: unit.data.to_vec(),
            width: 2,
            height: 2,
            timestamp: unit.timestamp,
        }))
    }

    fn name(&self) -> &'static str {
        "passthrough"
    }
}

pub struct FailingDecoder;

impl VideoDecode for FailingDecoder {
    fn decode(&mut self, unit: &AccessUnit) -> Result<Option<VideoFrame>> {
        anyhow::bail!("corrupt access unit at ts {}", unit.timestamp)
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

pub struct BrokenDataSink;

#[async_trait]
impl DataSink for BrokenDataSink {
    async fn consume(&mut self, _unit: DataUnit) -> Result<()> {
        anyhow::bail!("sink rejected data")
    }

    fn name(&self) -> &'static str {
        "broken"
    }
}

struct RecordingFrameSink(Arc<Mutex<Vec<VideoFrame>>>);

#[async_trait]
impl FrameSink for RecordingFrameSink {
    async fn render(&mut self, frame: VideoFrame) -> Result<()> {
        self.0.lock().unwrap().push(frame);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording-video"
    }
}

struct RecordingDataSink(Arc<Mutex<Vec<DataUnit>>>);

#[async_trait]
impl DataSink for RecordingDataSink {
    async fn consume(&mut self, unit: DataUnit) -> Result<()> {
        self.0.lock().unwrap().push(unit);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording-data"
    }
}

/// Collects everything that reaches the sinks of a registry it built.
#[derive(Clone, Default)]
pub struct Recorder {
    frames: Arc<Mutex<Vec<VideoFrame>>>,
    units: Arc<Mutex<Vec<DataUnit>>>,
    decoders: Arc<AtomicUsize>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> StageRegistry {
        let frames = self.frames.clone();
        let units = self.units.clone();
        let decoders = self.decoders.clone();

        StageRegistry::from_config(&test_config())
            .with_decoder(move || {
                decoders.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(PassthroughDecoder))
            })
            .with_frame_sink(move |_| Ok(Box::new(RecordingFrameSink(frames.clone()))))
            .with_data_sink(move |_| Ok(Box::new(RecordingDataSink(units.clone()))))
    }

    pub fn frames(&self) -> Vec<VideoFrame> {
        self.frames.lock().unwrap().clone()
    }

    pub fn units(&self) -> Vec<DataUnit> {
        self.units.lock().unwrap().clone()
    }

    pub fn decoders_built(&self) -> usize {
        self.decoders.load(Ordering::SeqCst)
    }
}
