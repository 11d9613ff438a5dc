//! Graph bus
//!
//! Every component posts what it observes here; only the supervisor reads
//! the bus and decides whether a message ends the run.

use tokio::sync::mpsc;

use crate::pipeline::types::MediaKind;
use crate::transport::TransportError;

/// Fatal graph-level failures.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Failed to create demux port for pt {payload_type}: {reason}")]
    PortCreation { payload_type: u8, reason: String },

    #[error("Failed to build {kind} branch for pt {payload_type} (stage '{stage}'): {reason}")]
    Construction {
        payload_type: u8,
        kind: MediaKind,
        stage: &'static str,
        reason: String,
    },

    #[error("Stage '{stage}' for pt {payload_type} failed: {reason}")]
    Stage {
        payload_type: u8,
        stage: &'static str,
        reason: String,
    },
}

#[derive(Debug)]
pub enum GraphMessage {
    /// The transport is exhausted and every linked branch has drained
    EndOfStream,
    /// Something fatal happened; the graph must terminate
    Error(GraphError),
    /// A payload type without a mapping was seen (first time only)
    PayloadTypeUnmapped(u8),
    /// A branch was spliced onto its demux port
    BranchLinked { payload_type: u8, kind: MediaKind },
}

pub type BusReceiver = mpsc::UnboundedReceiver<GraphMessage>;

/// Posting side of the bus; cheap to clone, never blocks.
#[derive(Debug, Clone)]
pub struct Bus {
    tx: mpsc::UnboundedSender<GraphMessage>,
}

impl Bus {
    pub fn channel() -> (Bus, BusReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Bus { tx }, rx)
    }

    pub fn post(&self, message: GraphMessage) {
        // the supervisor is gone once the graph is torn down
        let _ = self.tx.send(message);
    }

    pub fn post_error(&self, error: impl Into<GraphError>) {
        self.post(GraphMessage::Error(error.into()));
    }
}
