//! Per-payload-type processing branches
//!
//! A branch is built from the [`StageRegistry`] when its demux port is
//! created, linked to the port's queue and activated. Activated stages
//! wait until the graph is playing before they touch any data, and stop
//! as soon as the graph is torn down.

mod application;
mod attach;
mod queue;
mod registry;
mod sink;
mod video;

use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::pipeline::bus::{Bus, GraphError};
use crate::pipeline::health::{BranchHealth, HealthSummary};
use crate::pipeline::payload::PayloadFormat;
use crate::pipeline::stage::PipelineStage;
use crate::pipeline::state::GraphState;
use crate::pipeline::types::{MediaKind, RtpPacket};

pub use application::{DataSinkStage, GstDepayStage};
pub use attach::Attacher;
pub use queue::QueueStage;
pub use registry::{
    DataSinkFactory, DecoderFactory, FrameSinkFactory, STAGE_CHANNEL_CAPACITY, StageRegistry,
};
pub use sink::{DataSink, FileFrameSink, FrameSink, HexDumpSink, LogFrameSink, hex_dump};
pub use video::{DecodeStage, FrameSinkStage, H264DepayStage, H264ParseStage};

/// What every branch task needs from the graph.
#[derive(Debug, Clone)]
pub struct GraphContext {
    state: watch::Receiver<GraphState>,
    cancel: CancellationToken,
    bus: Bus,
}

impl GraphContext {
    pub fn new(state: watch::Receiver<GraphState>, cancel: CancellationToken, bus: Bus) -> Self {
        Self { state, cancel, bus }
    }

    pub fn state(&self) -> GraphState {
        *self.state.borrow()
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Blocks while the graph is stopped. `false` if it never plays.
    async fn wait_until_playing(&mut self) -> bool {
        tokio::select! {
            state = self.state.wait_for(|s| *s != GraphState::Stopped) => {
                state.map(|s| s.is_playing()).unwrap_or(false)
            }
            _ = self.cancel.cancelled() => false,
        }
    }
}

/// Final accounting of one branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchReport {
    pub payload_type: u8,
    pub kind: MediaKind,
    pub health: HealthSummary,
}

pub struct Branch {
    payload_type: u8,
    kind: MediaKind,
    health: Arc<BranchHealth>,
    stages: Vec<Box<dyn PipelineStage>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Branch {
    /// Build the stage chain for `format`, fed from `queue`.
    ///
    /// Every element is obtained from the registry before anything is
    /// wired, so a missing element leaves no half-built branch behind.
    pub fn build(
        format: &PayloadFormat,
        registry: &StageRegistry,
        queue: mpsc::Receiver<RtpPacket>,
    ) -> Result<Self, GraphError> {
        let payload_type = format.payload_type;
        let capacity = registry.stage_capacity();
        let health = Arc::new(BranchHealth::new());
        let unavailable = |stage: &'static str, reason: String| GraphError::Construction {
            payload_type,
            kind: format.kind,
            stage,
            reason,
        };

        let mut head = QueueStage::new(payload_type, health.clone());
        head.set_input(queue);

        let stages: Vec<Box<dyn PipelineStage>> = match format.kind {
            MediaKind::Video => {
                let decoder = registry
                    .decoder()
                    .map_err(|e| unavailable("decode", format!("{:#}", e)))?;
                let sink = registry
                    .frame_sink(format)
                    .map_err(|e| unavailable("video-sink", format!("{:#}", e)))?;

                let mut depay = H264DepayStage::new();
                depay.set_input(head.take_output(capacity));
                let mut parse = H264ParseStage::new(health.clone());
                parse.set_input(depay.take_output(capacity));
                let mut decode = DecodeStage::new(decoder, health.clone());
                decode.set_input(parse.take_output(capacity));
                let mut render = FrameSinkStage::new(sink, health.clone());
                render.set_input(decode.take_output(capacity));

                vec![
                    Box::new(head),
                    Box::new(depay),
                    Box::new(parse),
                    Box::new(decode),
                    Box::new(render),
                ]
            }
            MediaKind::Application => {
                let sink = registry
                    .data_sink(format)
                    .map_err(|e| unavailable("data-sink", format!("{:#}", e)))?;

                let mut depay = GstDepayStage::new(health.clone());
                depay.set_input(head.take_output(capacity));
                let mut consume = DataSinkStage::new(sink, health.clone());
                consume.set_input(depay.take_output(capacity));

                vec![Box::new(head), Box::new(depay), Box::new(consume)]
            }
            MediaKind::Unknown => {
                return Err(unavailable(
                    "depay",
                    format!("no depayloader for encoding {}", format.encoding_name),
                ));
            }
        };

        debug!(
            "Branch: built {} branch for pt {} ({} stages)",
            format.kind,
            payload_type,
            stages.len()
        );

        Ok(Self {
            payload_type,
            kind: format.kind,
            health,
            stages,
            tasks: Vec::new(),
        })
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn health(&self) -> &Arc<BranchHealth> {
        &self.health
    }

    pub fn is_active(&self) -> bool {
        self.stages.is_empty() && !self.tasks.is_empty()
    }

    /// Spawn one task per stage. The tasks follow the graph state from
    /// here on: they idle while it is stopped and never run once it is
    /// terminated.
    pub fn activate(&mut self, ctx: &GraphContext) {
        for stage in self.stages.drain(..) {
            self.tasks
                .push(spawn_stage(stage, self.payload_type, ctx.clone()));
        }
    }

    /// Wait for every stage task and report the branch's counters.
    pub async fn join(self) -> BranchReport {
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Branch: stage task for pt {} panicked: {}", self.payload_type, e);
            }
        }

        let report = BranchReport {
            payload_type: self.payload_type,
            kind: self.kind,
            health: self.health.summary(),
        };
        info!(
            "Branch: {} pt {}: {}",
            report.kind, report.payload_type, report.health
        );
        report
    }
}

fn spawn_stage(
    mut stage: Box<dyn PipelineStage>,
    payload_type: u8,
    mut ctx: GraphContext,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if !ctx.wait_until_playing().await {
            debug!("{}: graph did not play, stage never started", stage.name());
            return;
        }

        let result = tokio::select! {
            result = stage.run() => result,
            _ = ctx.cancel.cancelled() => Ok(()),
        };

        if let Err(e) = result {
            error!("{} for pt {} failed: {:#}", stage.name(), payload_type, e);
            ctx.bus.post_error(GraphError::Stage {
                payload_type,
                stage: stage.name(),
                reason: format!("{:#}", e),
            });
        }

        if let Err(e) = stage.shutdown().await {
            warn!("{} for pt {}: shutdown failed: {:#}", stage.name(), payload_type, e);
        }
    })
}
