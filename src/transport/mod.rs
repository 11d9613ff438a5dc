//! Transport layer
//!
//! The receiver only needs an ordered sequence of opaque data units and two
//! terminal conditions (end-of-stream, error). SRT specifics live in [`srt`].

pub mod srt;

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use crate::config::{ReceiverConfig, SrtUri};

pub use srt::SrtSource;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("Receive error: {0}")]
    Receive(String),

    #[error("Transport used before connect")]
    NotConnected,
}

/// What the transport needs to open a connection.
#[derive(Debug, Clone)]
pub struct ConnectionDescriptor {
    pub uri: SrtUri,
    pub stream_id: Option<String>,
    pub connect_timeout: Option<Duration>,
}

impl ConnectionDescriptor {
    pub fn from_config(config: &ReceiverConfig) -> Self {
        Self {
            uri: config.uri.clone(),
            stream_id: config.identity.stream_id(),
            connect_timeout: config.connect_timeout,
        }
    }
}

/// A sequential source of data units.
#[async_trait]
pub trait TransportSource: Send {
    /// Opens the connection. Called once, after the graph starts playing.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Next data unit in arrival order; `Ok(None)` is end-of-stream.
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError>;

    /// Endpoint description for logging.
    fn describe(&self) -> String;
}
