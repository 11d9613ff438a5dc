//! Attachment handler
//!
//! Consumes the demultiplexer's attach events in arrival order and
//! splices a freshly built branch onto each new port.

use log::{debug, error, info};
use std::sync::Arc;

use super::{Branch, GraphContext, StageRegistry};
use crate::pipeline::bus::{GraphError, GraphMessage};
use crate::pipeline::demux::{AttachEvent, AttachReceiver};

pub struct Attacher {
    registry: Arc<StageRegistry>,
    ctx: GraphContext,
}

impl Attacher {
    pub fn new(registry: Arc<StageRegistry>, ctx: GraphContext) -> Self {
        Self { registry, ctx }
    }

    /// Build, link and activate the branch for one port.
    ///
    /// `Ok(None)` if the port was already linked or the graph is already
    /// terminated.
    pub async fn attach(&self, event: AttachEvent) -> Result<Option<Branch>, GraphError> {
        if self.ctx.state().is_terminated() {
            debug!("Attacher: graph terminated, ignoring pt {}", event.payload_type);
            return Ok(None);
        }

        let AttachEvent { payload_type, port } = event;
        let format = port.format().clone();

        let linked = port
            .link(|queue| {
                let mut branch = Branch::build(&format, &self.registry, queue)?;
                branch.activate(&self.ctx);
                Ok::<_, GraphError>(branch)
            })
            .await;
        // the port's sender must only live in the demultiplexer from here on
        drop(port);

        match linked {
            None => {
                debug!("Attacher: pt {} already linked", payload_type);
                Ok(None)
            }
            Some(Ok(branch)) => {
                info!("Attacher: linking done for {} pt {}", format.kind, payload_type);
                self.ctx.bus().post(GraphMessage::BranchLinked {
                    payload_type,
                    kind: format.kind,
                });
                Ok(Some(branch))
            }
            Some(Err(e)) => Err(e),
        }
    }

    /// Handle attach events until the graph is torn down, then return every
    /// branch linked so far in attach order.
    pub async fn run(self, mut events: AttachReceiver) -> Vec<Branch> {
        let cancel = self.ctx.cancel_token().clone();
        let mut branches = Vec::new();

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match self.attach(event).await {
                Ok(Some(branch)) => branches.push(branch),
                Ok(None) => {}
                Err(e) => {
                    error!("Attacher: {}", e);
                    self.ctx.bus().post_error(e);
                }
            }
        }

        debug!("Attacher: stopped with {} branches", branches.len());
        branches
    }
}
