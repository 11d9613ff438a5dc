//! SRT transport source
//!
//! Connects with srt-tokio in caller or listener mode and yields every SRT
//! message as one data unit (one RTP packet per message on the wire).

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use log::{debug, info};
use srt_tokio::SrtSocket;

use super::{ConnectionDescriptor, TransportError, TransportSource};
use crate::config::SrtMode;

pub struct SrtSource {
    descriptor: ConnectionDescriptor,
    socket: Option<SrtSocket>,
    units_received: u64,
    bytes_received: u64,
}

impl SrtSource {
    pub fn new(descriptor: ConnectionDescriptor) -> Self {
        Self {
            descriptor,
            socket: None,
            units_received: 0,
            bytes_received: 0,
        }
    }

    async fn open(&self) -> Result<SrtSocket, TransportError> {
        let uri = &self.descriptor.uri;
        let endpoint = uri.authority();

        let mut builder = SrtSocket::builder();
        if let Some(latency) = uri.latency() {
            builder = builder.latency(latency);
        }

        let result = match uri.mode() {
            SrtMode::Caller => {
                builder
                    .call(endpoint.as_str(), self.descriptor.stream_id.as_deref())
                    .await
            }
            SrtMode::Listener => builder.listen_on(endpoint.as_str()).await,
        };

        result.map_err(|e| TransportError::Connect {
            endpoint,
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl TransportSource for SrtSource {
    async fn connect(&mut self) -> Result<(), TransportError> {
        info!(
            "SrtSource: connecting to {} ({:?}, stream id: {:?})",
            self.descriptor.uri,
            self.descriptor.uri.mode(),
            self.descriptor.stream_id
        );

        let socket = match self.descriptor.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, self.open())
                .await
                .map_err(|_| TransportError::Timeout(limit))??,
            None => self.open().await?,
        };

        info!("SrtSource: connected to {}", self.descriptor.uri);
        self.socket = Some(socket);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        let socket = self.socket.as_mut().ok_or(TransportError::NotConnected)?;

        match socket.next().await {
            Some(Ok((_, data))) => {
                self.units_received += 1;
                self.bytes_received += data.len() as u64;
                Ok(Some(data))
            }
            Some(Err(e)) => Err(TransportError::Receive(e.to_string())),
            None => {
                debug!(
                    "SrtSource: peer closed ({} units, {} bytes)",
                    self.units_received, self.bytes_received
                );
                self.socket = None;
                Ok(None)
            }
        }
    }

    fn describe(&self) -> String {
        self.descriptor.uri.to_string()
    }
}
