//! Pipeline stage trait
//!
//! Every processing element of a branch is a `PipelineStage` running in its
//! own task; stages talk to each other over bounded `mpsc` channels.

use anyhow::Result;
use async_trait::async_trait;

/// Trait for pipeline stages that process media data
#[async_trait]
pub trait PipelineStage: Send {
    /// Run the stage until its input closes
    async fn run(&mut self) -> Result<()>;

    /// Get the name of this stage for logging
    fn name(&self) -> &'static str;

    /// Release whatever the stage holds after `run` returned or was cancelled
    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Take a channel end that the stage was wired with, or fail the stage.
pub(crate) fn wired<T>(slot: &mut Option<T>, what: &str) -> Result<T> {
    slot.take()
        .ok_or_else(|| anyhow::anyhow!("No {} channel", what))
}
