//! Receiver graph
//!
//! SRT transport feeds a payload-type demultiplexer; every payload type gets
//! its own branch, built on the fly the first time the type is seen:
//!
//! ```text
//! transport ─▶ demux ─┬─▶ [pt 96] queue ▶ h264 depay ▶ parse ▶ decode ▶ video sink
//!                     └─▶ [pt 99] queue ▶ gst depay ▶ data sink
//! ```
//!
//! - Each stage runs in its own task and implements [`PipelineStage`]
//! - Stages are chained with bounded `mpsc` channels
//! - Components report to the [`Supervisor`] over a single bus; it owns the
//!   [`GraphState`] and drives teardown

pub mod branch;
pub mod bus;
pub mod demux;
pub mod health;
pub mod payload;
pub mod stage;
pub mod state;
pub mod supervisor;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use bus::{Bus, GraphError, GraphMessage};
pub use health::{BranchHealth, HealthSummary};
pub use payload::{PayloadFormat, PayloadTypeResolver, StaticPayloadMap};
pub use stage::PipelineStage;
pub use state::GraphState;
pub use supervisor::{RunReport, Supervisor, Termination};
pub use types::MediaKind;
