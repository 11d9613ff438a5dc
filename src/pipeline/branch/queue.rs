//! Queue stage
//!
//! Head of every branch: drains the demux port and decouples the
//! branch's processing from the demultiplexer's delivery.

use anyhow::Result;
use async_trait::async_trait;
use log::info;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::pipeline::health::BranchHealth;
use crate::pipeline::stage::{PipelineStage, wired};
use crate::pipeline::types::RtpPacket;

pub struct QueueStage {
    payload_type: u8,
    health: Arc<BranchHealth>,
    input_rx: Option<mpsc::Receiver<RtpPacket>>,
    output_tx: Option<mpsc::Sender<RtpPacket>>,
}

impl QueueStage {
    pub fn new(payload_type: u8, health: Arc<BranchHealth>) -> Self {
        Self {
            payload_type,
            health,
            input_rx: None,
            output_tx: None,
        }
    }

    /// Set the input channel (the demux port queue)
    pub fn set_input(&mut self, rx: mpsc::Receiver<RtpPacket>) {
        self.input_rx = Some(rx);
    }

    pub fn take_output(&mut self, capacity: usize) -> mpsc::Receiver<RtpPacket> {
        let (tx, rx) = mpsc::channel(capacity);
        self.output_tx = Some(tx);
        rx
    }
}

#[async_trait]
impl PipelineStage for QueueStage {
    async fn run(&mut self) -> Result<()> {
        let mut input_rx = wired(&mut self.input_rx, "input")?;
        let output_tx = wired(&mut self.output_tx, "output")?;

        info!("QueueStage: started for pt {}", self.payload_type);

        while let Some(packet) = input_rx.recv().await {
            self.health.record_packet(packet.payload.len());
            if output_tx.send(packet).await.is_err() {
                info!("QueueStage: output channel closed");
                break;
            }
        }

        info!("QueueStage: finished for pt {}", self.payload_type);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "queue"
    }
}
