//! Application data branch stages
//!
//! queue → generic depayload → data sink

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::sink::DataSink;
use crate::decoder::{GstDepayloader, GstUnit};
use crate::pipeline::health::BranchHealth;
use crate::pipeline::stage::{PipelineStage, wired};
use crate::pipeline::types::{DataUnit, RtpPacket};

/// Reassembles `X-GST` payloads into data units.
pub struct GstDepayStage {
    health: Arc<BranchHealth>,
    input_rx: Option<mpsc::Receiver<RtpPacket>>,
    output_tx: Option<mpsc::Sender<DataUnit>>,
}

impl GstDepayStage {
    pub fn new(health: Arc<BranchHealth>) -> Self {
        Self {
            health,
            input_rx: None,
            output_tx: None,
        }
    }

    pub fn set_input(&mut self, rx: mpsc::Receiver<RtpPacket>) {
        self.input_rx = Some(rx);
    }

    pub fn take_output(&mut self, capacity: usize) -> mpsc::Receiver<DataUnit> {
        let (tx, rx) = mpsc::channel(capacity);
        self.output_tx = Some(tx);
        rx
    }
}

#[async_trait]
impl PipelineStage for GstDepayStage {
    async fn run(&mut self) -> Result<()> {
        let mut input_rx = wired(&mut self.input_rx, "input")?;
        let output_tx = wired(&mut self.output_tx, "output")?;
        let mut depayloader = GstDepayloader::new();

        info!("GstDepayStage: started");

        while let Some(packet) = input_rx.recv().await {
            match depayloader.push(&packet) {
                Ok(Some(GstUnit::Data(unit))) => {
                    self.health.record_unit();
                    if output_tx.send(unit).await.is_err() {
                        info!("GstDepayStage: output channel closed");
                        break;
                    }
                }
                Ok(Some(GstUnit::Event(event_type))) => {
                    debug!("GstDepayStage: skipping serialized event type {}", event_type);
                }
                Ok(None) => {}
                Err(e) => {
                    self.health.record_drop();
                    warn!("GstDepayStage: seq {}: {}", packet.sequence_number, e);
                }
            }
        }

        info!("GstDepayStage: finished");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "gst-depay"
    }
}

/// Hands data units to the branch's data sink.
pub struct DataSinkStage {
    sink: Box<dyn DataSink>,
    health: Arc<BranchHealth>,
    input_rx: Option<mpsc::Receiver<DataUnit>>,
}

impl DataSinkStage {
    pub fn new(sink: Box<dyn DataSink>, health: Arc<BranchHealth>) -> Self {
        Self {
            sink,
            health,
            input_rx: None,
        }
    }

    pub fn set_input(&mut self, rx: mpsc::Receiver<DataUnit>) {
        self.input_rx = Some(rx);
    }
}

#[async_trait]
impl PipelineStage for DataSinkStage {
    async fn run(&mut self) -> Result<()> {
        let mut input_rx = wired(&mut self.input_rx, "input")?;

        info!("DataSinkStage: started ({})", self.sink.name());

        while let Some(unit) = input_rx.recv().await {
            self.sink.consume(unit).await?;
            self.health.record_rendered();
        }

        info!("DataSinkStage: finished");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "data-sink"
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.sink.finish().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::rtp_at;

    #[tokio::test]
    async fn test_depay_counts_broken_fragments() {
        let health = Arc::new(BranchHealth::new());
        let (tx, rx) = mpsc::channel(8);
        let mut stage = GstDepayStage::new(health.clone());
        stage.set_input(rx);
        let mut out = stage.take_output(8);

        tx.send(rtp_at(99, 1, 5, true, &[0, 0, 0, 0, 0, 0, 0, 0, b'o', b'k']))
            .await
            .unwrap();
        // header cut short
        tx.send(rtp_at(99, 2, 6, true, &[0, 0, 0])).await.unwrap();
        drop(tx);
        stage.run().await.unwrap();

        let unit = out.recv().await.unwrap();
        assert_eq!(&unit.data[..], b"ok");
        assert_eq!(unit.timestamp, 5);
        assert!(out.recv().await.is_none());

        let summary = health.summary();
        assert_eq!(summary.units_assembled, 1);
        assert_eq!(summary.units_dropped, 1);
    }
}
