//! Graph supervisor
//!
//! Owns the graph state. Assembles the demultiplexer and the attachment
//! handler, moves the graph to Playing, then blocks on the bus until the
//! first terminal condition and tears everything down.

use log::{debug, error, info, warn};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::ReceiverConfig;
use crate::pipeline::branch::{Attacher, BranchReport, GraphContext, StageRegistry};
use crate::pipeline::bus::{Bus, GraphError, GraphMessage};
use crate::pipeline::demux::Demuxer;
use crate::pipeline::payload::{PayloadTypeResolver, StaticPayloadMap};
use crate::pipeline::state::GraphState;
use crate::transport::TransportSource;

/// Why the graph stopped.
#[derive(Debug)]
pub enum Termination {
    EndOfStream,
    Error(GraphError),
    Interrupted,
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Termination::EndOfStream => write!(f, "end of stream"),
            Termination::Error(e) => write!(f, "error: {}", e),
            Termination::Interrupted => write!(f, "interrupted"),
        }
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub termination: Termination,
    /// Linked branches, in attach order
    pub branches: Vec<BranchReport>,
    /// Payload types seen without a mapping
    pub unmapped: Vec<u8>,
}

pub struct Supervisor {
    config: ReceiverConfig,
    registry: StageRegistry,
    resolver: Arc<dyn PayloadTypeResolver>,
    state: watch::Sender<GraphState>,
    interrupt: CancellationToken,
}

impl Supervisor {
    pub fn new(config: ReceiverConfig) -> Self {
        let registry = StageRegistry::from_config(&config);
        let (state, _) = watch::channel(GraphState::Stopped);
        Self {
            config,
            registry,
            resolver: Arc::new(StaticPayloadMap::default()),
            state,
            interrupt: CancellationToken::new(),
        }
    }

    pub fn with_registry(mut self, registry: StageRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn PayloadTypeResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Cancelling this token is a terminal condition (Ctrl-C).
    pub fn interrupt_handle(&self) -> CancellationToken {
        self.interrupt.clone()
    }

    pub fn state(&self) -> GraphState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<GraphState> {
        self.state.subscribe()
    }

    fn transition(&self, target: GraphState) -> bool {
        self.state.send_if_modified(|current| {
            if !current.can_transition_to(&target) {
                debug!("Graph: ignoring {} -> {}", current, target);
                return false;
            }
            info!("Graph: {} -> {}", current, target);
            *current = target;
            true
        })
    }

    /// Run the graph on `source` until end-of-stream, a fatal error or an
    /// interrupt.
    ///
    /// End-of-stream is only reported once every linked branch has drained
    /// its queues; errors and interrupts tear the graph down at once.
    pub async fn run(self, source: Box<dyn TransportSource>) -> RunReport {
        if self.interrupt.is_cancelled() {
            info!("Terminated: {} before start", Termination::Interrupted);
            return RunReport {
                termination: Termination::Interrupted,
                branches: Vec::new(),
                unmapped: Vec::new(),
            };
        }

        let (bus, mut bus_rx) = Bus::channel();
        let graph_cancel = CancellationToken::new();

        let (demuxer, attach_rx) =
            Demuxer::new(self.resolver.clone(), self.config.queue_capacity, bus.clone());
        let demuxer = Arc::new(demuxer);

        let ctx = GraphContext::new(self.state.subscribe(), graph_cancel.clone(), bus.clone());
        let attacher = Attacher::new(Arc::new(self.registry.clone()), ctx);
        let branch_task = {
            let bus = bus.clone();
            let cancel = graph_cancel.clone();
            tokio::spawn(async move {
                // ends once the demultiplexer is closed or the graph is cancelled
                let linked = attacher.run(attach_rx).await;
                let mut reports = Vec::with_capacity(linked.len());
                for branch in linked {
                    reports.push(branch.join().await);
                }
                if !cancel.is_cancelled() {
                    debug!("Graph: every branch drained");
                    bus.post(GraphMessage::EndOfStream);
                }
                reports
            })
        };

        self.transition(GraphState::Playing);
        info!("Graph: receiving from {}", source.describe());

        let source_task = {
            let demuxer = demuxer.clone();
            let cancel = graph_cancel.clone();
            tokio::spawn(async move { demuxer.run_source(source, cancel).await })
        };

        let mut unmapped = Vec::new();
        let termination = loop {
            tokio::select! {
                message = bus_rx.recv() => match message {
                    Some(GraphMessage::EndOfStream) | None => break Termination::EndOfStream,
                    Some(GraphMessage::Error(e)) => break Termination::Error(e),
                    Some(GraphMessage::PayloadTypeUnmapped(payload_type)) => {
                        unmapped.push(payload_type);
                    }
                    Some(GraphMessage::BranchLinked { payload_type, kind }) => {
                        debug!("Graph: {} branch for pt {} is linked", kind, payload_type);
                    }
                },
                _ = self.interrupt.cancelled() => break Termination::Interrupted,
            }
        };

        match &termination {
            Termination::Error(e) => error!("Terminated: {}", e),
            other => info!("Terminated: {}", other),
        }
        self.transition(GraphState::Terminated);
        graph_cancel.cancel();
        demuxer.close();

        if let Err(e) = source_task.await {
            warn!("Graph: source task panicked: {}", e);
        }
        let branches = branch_task.await.unwrap_or_else(|e| {
            warn!("Graph: branch task panicked: {}", e);
            Vec::new()
        });

        let stats = demuxer.stats();
        info!(
            "Graph: demux routed {} packets, {} unmapped, {} invalid units",
            stats.packets_routed.load(Ordering::Relaxed),
            stats.packets_unmapped.load(Ordering::Relaxed),
            stats.invalid_units.load(Ordering::Relaxed),
        );

        RunReport {
            termination,
            branches,
            unmapped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{Recorder, ScriptedSource, eventually, rtp_bytes, test_config};
    use crate::pipeline::payload::PayloadFormat;
    use crate::pipeline::types::MediaKind;
    use crate::transport::TransportError;
    use bytes::Bytes;

    fn supervisor(recorder: &Recorder) -> Supervisor {
        Supervisor::new(test_config()).with_registry(recorder.registry())
    }

    fn gst(data: &[u8]) -> Vec<u8> {
        let mut payload = vec![0u8; 8];
        payload.extend_from_slice(data);
        payload
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_two_branches_in_first_seen_order() {
        let recorder = Recorder::new();
        let supervisor = supervisor(&recorder);
        let state = supervisor.subscribe_state();

        let source = ScriptedSource::new(vec![
            rtp_bytes(99, 1, true, &gst(b"first")),
            rtp_bytes(96, 2, true, &[0x67, 0x42]),
            rtp_bytes(96, 3, true, &[0x65, 0x88]),
            rtp_bytes(100, 4, true, b"??"),
            rtp_bytes(99, 5, true, &gst(b"second")),
            rtp_bytes(96, 6, true, &[0x41, 0x9A]),
            rtp_bytes(100, 7, true, b"??"),
        ]);
        let report = supervisor.run(Box::new(source)).await;
        assert!(matches!(report.termination, Termination::EndOfStream));
        assert_eq!(report.unmapped, vec![100]);

        let order: Vec<(u8, MediaKind)> = report
            .branches
            .iter()
            .map(|b| (b.payload_type, b.kind))
            .collect();
        assert_eq!(order, vec![(99, MediaKind::Application), (96, MediaKind::Video)]);
        assert_eq!(report.branches[0].health.packets_received, 2);
        assert_eq!(report.branches[1].health.packets_received, 3);

        let data: Vec<Bytes> = recorder.units().into_iter().map(|u| u.data).collect();
        assert_eq!(data, vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]);
        let timestamps: Vec<u32> = recorder.frames().iter().map(|f| f.timestamp).collect();
        assert_eq!(timestamps, vec![6000, 9000, 18000]);

        assert!(state.borrow().is_terminated());
        assert_eq!(recorder.decoders_built(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_end_of_stream_drains_every_branch() {
        let recorder = Recorder::new();
        let supervisor = supervisor(&recorder);

        let sent: u16 = 5000;
        let mut units = Vec::with_capacity(usize::from(sent) * 2);
        for seq in 0..sent {
            units.push(rtp_bytes(99, seq, true, &gst(&seq.to_be_bytes())));
            units.push(rtp_bytes(96, seq, true, &[0x65, 0x01]));
        }

        let report = supervisor.run(Box::new(ScriptedSource::new(units))).await;

        assert!(matches!(report.termination, Termination::EndOfStream));
        let consumed: Vec<Bytes> = recorder.units().into_iter().map(|u| u.data).collect();
        assert_eq!(consumed.len(), usize::from(sent));
        // order is kept end to end
        for (seq, data) in consumed.iter().enumerate() {
            assert_eq!(data.as_ref(), (seq as u16).to_be_bytes().as_slice());
        }
        assert_eq!(recorder.frames().len(), usize::from(sent));

        let received: Vec<u64> = report
            .branches
            .iter()
            .map(|b| b.health.packets_received)
            .collect();
        assert_eq!(received, vec![u64::from(sent), u64::from(sent)]);
    }

    #[tokio::test]
    async fn test_custom_resolver_decides_branches() {
        let recorder = Recorder::new();
        let resolver = StaticPayloadMap::new(vec![PayloadFormat {
            payload_type: 97,
            kind: MediaKind::Video,
            encoding_name: "H264",
            clock_rate: 90_000,
        }]);
        let supervisor = supervisor(&recorder).with_resolver(Arc::new(resolver));

        let source = ScriptedSource::new(vec![
            rtp_bytes(96, 1, true, &[0x65, 0x01]),
            rtp_bytes(97, 2, true, &[0x65, 0x02]),
        ]);
        let report = supervisor.run(Box::new(source)).await;

        assert!(matches!(report.termination, Termination::EndOfStream));
        assert_eq!(report.unmapped, vec![96]);
        assert_eq!(report.branches.len(), 1);
        assert_eq!(report.branches[0].payload_type, 97);
        assert_eq!(recorder.frames().len(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_terminates() {
        let recorder = Recorder::new();
        let supervisor = supervisor(&recorder);
        let state = supervisor.subscribe_state();

        let report = supervisor.run(Box::new(ScriptedSource::failing_connect())).await;

        assert!(matches!(
            report.termination,
            Termination::Error(GraphError::Transport(TransportError::Connect { .. }))
        ));
        assert!(report.branches.is_empty());
        assert!(state.borrow().is_terminated());
    }

    #[tokio::test]
    async fn test_receive_error_stops_every_branch() {
        let recorder = Recorder::new();
        let supervisor = supervisor(&recorder);

        let (source, finish) = ScriptedSource::held(vec![
            rtp_bytes(96, 1, true, &[0x65, 1]),
            rtp_bytes(99, 2, true, &gst(b"x")),
        ]);
        let run = tokio::spawn(supervisor.run(Box::new(source)));

        assert!(eventually(|| recorder.units().len() == 1 && recorder.frames().len() == 1).await);
        finish.send(Err("connection reset".to_string())).unwrap();

        let report = run.await.unwrap();
        assert!(matches!(
            report.termination,
            Termination::Error(GraphError::Transport(TransportError::Receive(_)))
        ));
        assert_eq!(report.branches.len(), 2);
        // nothing reaches a sink after teardown
        assert_eq!(recorder.frames().len(), 1);
        assert_eq!(recorder.units().len(), 1);
    }

    #[tokio::test]
    async fn test_construction_failure_terminates_graph() {
        let recorder = Recorder::new();
        let registry = recorder
            .registry()
            .with_data_sink(|_| anyhow::bail!("no data sink available"));
        let supervisor = Supervisor::new(test_config()).with_registry(registry);

        let (source, _finish) = ScriptedSource::held(vec![rtp_bytes(99, 1, true, &gst(b"x"))]);
        let report = supervisor.run(Box::new(source)).await;

        match report.termination {
            Termination::Error(GraphError::Construction {
                payload_type: 99,
                kind: MediaKind::Application,
                stage,
                ..
            }) => assert_eq!(stage, "data-sink"),
            other => panic!("unexpected termination {}", other),
        }
        assert!(report.branches.is_empty());
    }

    #[tokio::test]
    async fn test_interrupt_terminates() {
        let recorder = Recorder::new();
        let supervisor = supervisor(&recorder);
        let interrupt = supervisor.interrupt_handle();

        let (source, _finish) = ScriptedSource::held(vec![rtp_bytes(96, 1, true, &[0x65])]);
        let run = tokio::spawn(supervisor.run(Box::new(source)));

        assert!(eventually(|| recorder.frames().len() == 1).await);
        interrupt.cancel();

        let report = run.await.unwrap();
        assert!(matches!(report.termination, Termination::Interrupted));
        assert_eq!(report.branches.len(), 1);
    }

    #[tokio::test]
    async fn test_interrupt_before_start_never_plays() {
        let supervisor = supervisor(&Recorder::new());
        let state = supervisor.subscribe_state();
        supervisor.interrupt_handle().cancel();

        let report = supervisor.run(Box::new(ScriptedSource::new(Vec::new()))).await;
        assert!(matches!(report.termination, Termination::Interrupted));
        assert!(report.branches.is_empty());
        assert_eq!(*state.borrow(), GraphState::Stopped);
    }

    #[tokio::test]
    async fn test_end_of_stream_without_packets() {
        let supervisor = supervisor(&Recorder::new());
        let report = supervisor.run(Box::new(ScriptedSource::new(Vec::new()))).await;
        assert!(matches!(report.termination, Termination::EndOfStream));
        assert!(report.branches.is_empty());
        assert!(report.unmapped.is_empty());
    }
}
