//! Payload-type demultiplexer
//!
//! Routes every RTP packet to the output port of its payload type. A port
//! is created the first time its payload type is observed; creation runs
//! behind a per-id gate so concurrent first packets of the same id produce
//! exactly one port and exactly one attach event.
//!
//! Each port queues packets until a branch is linked to it, so nothing is
//! lost between port creation and branch activation. Closing the
//! demultiplexer releases every port sender and the attach channel, so
//! linked branches see the end of their input once their queues drain.

use bytes::Bytes;
use log::{debug, info, trace, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OnceCell, mpsc};
use tokio_util::sync::CancellationToken;

use crate::pipeline::bus::{Bus, GraphError, GraphMessage};
use crate::pipeline::payload::{PayloadFormat, PayloadTypeResolver};
use crate::pipeline::types::RtpPacket;
use crate::transport::TransportSource;

/// Raised once per created port, in order of first observation.
#[derive(Debug)]
pub struct AttachEvent {
    pub payload_type: u8,
    pub port: Arc<DemuxPort>,
}

pub type AttachReceiver = mpsc::UnboundedReceiver<AttachEvent>;

/// One output of the demultiplexer.
#[derive(Debug)]
pub struct DemuxPort {
    format: PayloadFormat,
    sender: mpsc::Sender<RtpPacket>,
    /// Holds the queue's consuming end until a branch takes it
    link: AsyncMutex<Option<mpsc::Receiver<RtpPacket>>>,
}

impl DemuxPort {
    fn new(format: PayloadFormat, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            format,
            sender,
            link: AsyncMutex::new(Some(receiver)),
        }
    }

    pub fn payload_type(&self) -> u8 {
        self.format.payload_type
    }

    pub fn format(&self) -> &PayloadFormat {
        &self.format
    }

    /// Splice a consumer onto this port.
    ///
    /// `attach` runs with the port gate held and receives the queue of every
    /// packet routed here so far. Returns `None` if the port is already
    /// linked, in which case `attach` is not called.
    pub async fn link<T, E>(
        &self,
        attach: impl FnOnce(mpsc::Receiver<RtpPacket>) -> Result<T, E>,
    ) -> Option<Result<T, E>> {
        let mut gate = self.link.lock().await;
        let queue = gate.take()?;
        Some(attach(queue))
    }

    pub async fn is_linked(&self) -> bool {
        self.link.lock().await.is_none()
    }

    async fn deliver(&self, packet: RtpPacket) -> bool {
        self.sender.send(packet).await.is_ok()
    }
}

#[derive(Debug, Clone)]
enum PortSlot {
    /// Unmapped payload type; its packets are dropped
    Rejected,
    Port(Arc<DemuxPort>),
}

/// Counters kept by the demultiplexer.
#[derive(Debug, Default)]
pub struct DemuxStats {
    pub packets_routed: AtomicU64,
    pub packets_unmapped: AtomicU64,
    pub invalid_units: AtomicU64,
}

pub struct Demuxer {
    resolver: Arc<dyn PayloadTypeResolver>,
    queue_capacity: usize,
    ports: Mutex<HashMap<u8, Arc<OnceCell<PortSlot>>>>,
    attach_tx: Mutex<Option<mpsc::UnboundedSender<AttachEvent>>>,
    bus: Bus,
    closed: AtomicBool,
    stats: DemuxStats,
}

impl Demuxer {
    pub fn new(
        resolver: Arc<dyn PayloadTypeResolver>,
        queue_capacity: usize,
        bus: Bus,
    ) -> (Self, AttachReceiver) {
        let (attach_tx, attach_rx) = mpsc::unbounded_channel();
        let demuxer = Self {
            resolver,
            queue_capacity,
            ports: Mutex::new(HashMap::new()),
            attach_tx: Mutex::new(Some(attach_tx)),
            bus,
            closed: AtomicBool::new(false),
            stats: DemuxStats::default(),
        };
        (demuxer, attach_rx)
    }

    pub fn stats(&self) -> &DemuxStats {
        &self.stats
    }

    /// Payload types that currently have a port, ascending.
    pub fn port_ids(&self) -> Vec<u8> {
        let cells: Vec<_> = self
            .ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(pt, cell)| (*pt, cell.clone()))
            .collect();

        let mut ids: Vec<u8> = cells
            .into_iter()
            .filter(|(_, cell)| matches!(cell.get(), Some(PortSlot::Port(_))))
            .map(|(pt, _)| pt)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Route one data unit. Units that are not valid RTP are dropped.
    pub async fn push_unit(&self, data: Bytes) -> Result<(), GraphError> {
        match RtpPacket::parse(data) {
            Ok(packet) => self.push(packet).await,
            Err(e) => {
                self.stats.invalid_units.fetch_add(1, Ordering::Relaxed);
                debug!("Demuxer: dropping invalid data unit: {}", e);
                Ok(())
            }
        }
    }

    /// Route one packet to the port of its payload type, creating it on
    /// first sight. Safe to call from several tasks at once.
    pub async fn push(&self, packet: RtpPacket) -> Result<(), GraphError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }

        match self.slot(packet.payload_type).await? {
            PortSlot::Rejected => {
                self.stats.packets_unmapped.fetch_add(1, Ordering::Relaxed);
            }
            PortSlot::Port(port) => {
                let payload_type = packet.payload_type;
                if port.deliver(packet).await {
                    self.stats.packets_routed.fetch_add(1, Ordering::Relaxed);
                } else {
                    trace!("Demuxer: port {} closed, dropping packet", payload_type);
                }
            }
        }
        Ok(())
    }

    /// Release every port and the attach channel; queued packets stay with
    /// their ports, later pushes are ignored.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.attach_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    async fn slot(&self, payload_type: u8) -> Result<PortSlot, GraphError> {
        let gate = self
            .ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(payload_type)
            .or_default()
            .clone();

        gate.get_or_try_init(|| async { self.create_port(payload_type) })
            .await
            .cloned()
    }

    fn create_port(&self, payload_type: u8) -> Result<PortSlot, GraphError> {
        let Some(format) = self.resolver.resolve(payload_type) else {
            warn!(
                "Demuxer: no mapping for payload type {}, its packets will be dropped",
                payload_type
            );
            self.bus.post(GraphMessage::PayloadTypeUnmapped(payload_type));
            return Ok(PortSlot::Rejected);
        };

        info!("Demuxer: new payload type pt: {} ({})", payload_type, format.caps());
        let port = Arc::new(DemuxPort::new(format, self.queue_capacity));

        let event = AttachEvent {
            payload_type,
            port: port.clone(),
        };
        let sent = match self
            .attach_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        };
        if !sent {
            return Err(GraphError::PortCreation {
                payload_type,
                reason: "no attachment handler".to_string(),
            });
        }

        Ok(PortSlot::Port(port))
    }

    /// Pull data units from `source` until end-of-stream, error or
    /// cancellation.
    ///
    /// End-of-stream closes the demultiplexer so the branches can drain;
    /// errors are posted to the bus.
    pub async fn run_source(&self, mut source: Box<dyn TransportSource>, cancel: CancellationToken) {
        let endpoint = source.describe();
        let outcome = tokio::select! {
            outcome = self.pump(source.as_mut()) => outcome,
            _ = cancel.cancelled() => {
                debug!("Demuxer: cancelled while reading {}", endpoint);
                return;
            }
        };

        match outcome {
            Ok(()) => {
                info!("Demuxer: end of stream from {}, draining branches", endpoint);
                self.close();
            }
            Err(e) => {
                warn!("Demuxer: {}", e);
                self.bus.post_error(e);
            }
        }
    }

    async fn pump(&self, source: &mut dyn TransportSource) -> Result<(), GraphError> {
        source.connect().await?;
        while let Some(unit) = source.recv().await? {
            self.push_unit(unit).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::payload::StaticPayloadMap;
    use crate::pipeline::testing::{ScriptedSource, rtp, rtp_bytes};
    use crate::transport::TransportError;

    fn demuxer(capacity: usize) -> (Arc<Demuxer>, AttachReceiver, crate::pipeline::bus::BusReceiver) {
        let (bus, bus_rx) = Bus::channel();
        let (demuxer, attach_rx) =
            Demuxer::new(Arc::new(StaticPayloadMap::default()), capacity, bus);
        (Arc::new(demuxer), attach_rx, bus_rx)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_packets_attach_once() {
        let (demuxer, mut attach_rx, _bus_rx) = demuxer(4096);

        let mut tasks = Vec::new();
        for worker in 0..8u16 {
            let demuxer = demuxer.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..100u16 {
                    let pt = if i % 2 == 0 { 96 } else { 99 };
                    demuxer.push(rtp(pt, worker * 100 + i, true, b"x")).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut attached = Vec::new();
        while let Ok(event) = attach_rx.try_recv() {
            attached.push(event.payload_type);
        }
        attached.sort_unstable();
        assert_eq!(attached, vec![96, 99]);
        assert_eq!(demuxer.port_ids(), vec![96, 99]);
        assert_eq!(demuxer.stats().packets_routed.load(Ordering::Relaxed), 800);
    }

    #[tokio::test]
    async fn test_port_queues_until_linked() {
        let (demuxer, mut attach_rx, _bus_rx) = demuxer(16);

        for seq in 0..5 {
            demuxer.push(rtp(96, seq, false, b"v")).await.unwrap();
        }
        let event = attach_rx.recv().await.unwrap();
        assert_eq!(event.payload_type, 96);
        assert!(!event.port.is_linked().await);

        let mut queue = event
            .port
            .link(|queue| Ok::<_, ()>(queue))
            .await
            .unwrap()
            .unwrap();
        assert!(event.port.is_linked().await);

        for seq in 0..5 {
            assert_eq!(queue.recv().await.unwrap().sequence_number, seq);
        }

        // second link attempt is a no-op
        let again = event.port.link(|_| Ok::<_, ()>(())).await;
        assert!(again.is_none());
        assert!(attach_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unmapped_type_is_isolated() {
        let (demuxer, mut attach_rx, mut bus_rx) = demuxer(16);

        demuxer.push(rtp(100, 1, true, b"?")).await.unwrap();
        demuxer.push(rtp(96, 2, true, b"v")).await.unwrap();
        demuxer.push(rtp(100, 3, true, b"?")).await.unwrap();

        match bus_rx.try_recv() {
            Ok(GraphMessage::PayloadTypeUnmapped(100)) => {}
            other => panic!("unexpected bus message {:?}", other),
        }
        // reported once only
        assert!(bus_rx.try_recv().is_err());

        assert_eq!(attach_rx.recv().await.unwrap().payload_type, 96);
        assert!(attach_rx.try_recv().is_err());
        assert_eq!(demuxer.stats().packets_unmapped.load(Ordering::Relaxed), 2);
        assert_eq!(demuxer.port_ids(), vec![96]);
    }

    #[tokio::test]
    async fn test_port_creation_fails_without_handler() {
        let (demuxer, attach_rx, _bus_rx) = demuxer(16);
        drop(attach_rx);

        let result = demuxer.push(rtp(99, 1, true, b"d")).await;
        assert!(matches!(
            result,
            Err(GraphError::PortCreation { payload_type: 99, .. })
        ));
    }

    #[tokio::test]
    async fn test_closed_demuxer_ignores_packets() {
        let (demuxer, mut attach_rx, _bus_rx) = demuxer(16);
        demuxer.close();
        demuxer.push(rtp(96, 1, true, b"v")).await.unwrap();
        assert!(attach_rx.try_recv().is_err());
        assert!(demuxer.port_ids().is_empty());
    }

    #[tokio::test]
    async fn test_run_source_end_of_stream_closes_ports() {
        let (demuxer, mut attach_rx, mut bus_rx) = demuxer(16);
        let source = ScriptedSource::new(vec![
            rtp_bytes(96, 1, true, b"a"),
            Bytes::from_static(b"junk"),
            rtp_bytes(99, 2, true, b"b"),
        ]);

        demuxer
            .run_source(Box::new(source), CancellationToken::new())
            .await;

        // nothing terminal yet: the branches still have to drain
        assert!(bus_rx.try_recv().is_err());
        assert!(demuxer.port_ids().is_empty());

        let event = attach_rx.recv().await.unwrap();
        assert_eq!(event.payload_type, 96);
        let mut queue = event
            .port
            .link(|queue| Ok::<_, ()>(queue))
            .await
            .unwrap()
            .unwrap();
        drop(event);
        assert_eq!(queue.recv().await.unwrap().payload.as_ref(), b"a");
        assert!(queue.recv().await.is_none());

        assert_eq!(attach_rx.recv().await.unwrap().payload_type, 99);
        assert!(attach_rx.recv().await.is_none());
        assert_eq!(demuxer.stats().invalid_units.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_run_source_posts_connect_error() {
        let (demuxer, _attach_rx, mut bus_rx) = demuxer(16);
        let source = ScriptedSource::failing_connect();

        demuxer
            .run_source(Box::new(source), CancellationToken::new())
            .await;

        assert!(matches!(
            bus_rx.recv().await,
            Some(GraphMessage::Error(GraphError::Transport(
                TransportError::Connect { .. }
            )))
        ));
    }
}
