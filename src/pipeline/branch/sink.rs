//! Branch sinks
//!
//! Terminal consumers of a branch: decoded video frames go to a
//! [`FrameSink`], reassembled application buffers to a [`DataSink`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::pipeline::types::{DataUnit, VideoFrame};

#[async_trait]
pub trait FrameSink: Send {
    async fn render(&mut self, frame: VideoFrame) -> Result<()>;

    /// Called once after the last frame.
    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

#[async_trait]
pub trait DataSink: Send {
    async fn consume(&mut self, unit: DataUnit) -> Result<()>;

    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

/// Logs resolution changes and a running frame count.
#[derive(Debug, Default)]
pub struct LogFrameSink {
    resolution: Option<(u32, u32)>,
    frames: u64,
}

impl LogFrameSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FrameSink for LogFrameSink {
    async fn render(&mut self, frame: VideoFrame) -> Result<()> {
        self.frames += 1;
        if self.resolution != Some((frame.width, frame.height)) {
            info!(
                "LogFrameSink: video {}x{} (ts {})",
                frame.width, frame.height, frame.timestamp
            );
            self.resolution = Some((frame.width, frame.height));
        }
        debug!("LogFrameSink: frame {} ts {}", self.frames, frame.timestamp);
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        info!("LogFrameSink: {} frames rendered", self.frames);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log-video-sink"
    }
}

/// Appends raw packed YUV420p frames to a file.
pub struct FileFrameSink {
    path: PathBuf,
    file: tokio::fs::File,
    frames: u64,
}

impl FileFrameSink {
    /// Opens (truncates) `path` synchronously so it can run inside a stage factory.
    pub fn create(path: &Path) -> Result<Self> {
        let file = std::fs::File::create(path)
            .with_context(|| format!("cannot create {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: tokio::fs::File::from_std(file),
            frames: 0,
        })
    }
}

#[async_trait]
impl FrameSink for FileFrameSink {
    async fn render(&mut self, frame: VideoFrame) -> Result<()> {
        if self.frames == 0 {
            info!(
                "FileFrameSink: writing {}x{} yuv420p to {}",
                frame.width,
                frame.height,
                self.path.display()
            );
        }
        self.file
            .write_all(&frame.data)
            .await
            .with_context(|| format!("write to {} failed", self.path.display()))?;
        self.frames += 1;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.file.flush().await?;
        info!(
            "FileFrameSink: {} frames written to {}",
            self.frames,
            self.path.display()
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file-video-sink"
    }
}

/// Dumps every data unit as hex, then discards it.
pub struct HexDumpSink {
    out: Box<dyn AsyncWrite + Send + Unpin>,
}

impl HexDumpSink {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }

    pub fn new(out: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self { out: Box::new(out) }
    }
}

#[async_trait]
impl DataSink for HexDumpSink {
    async fn consume(&mut self, unit: DataUnit) -> Result<()> {
        info!(
            "HexDumpSink: {} bytes, ts {}{}",
            unit.data.len(),
            unit.timestamp,
            unit.caps
                .as_deref()
                .map(|caps| format!(", caps {}", caps))
                .unwrap_or_default()
        );
        self.out.write_all(hex_dump(&unit.data).as_bytes()).await?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.out.flush().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "hexdump-data-sink"
    }
}

/// `offset: hex bytes  ascii`, 16 bytes per line.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 5);
    for (line, chunk) in data.chunks(16).enumerate() {
        let mut hex = String::with_capacity(48);
        for byte in chunk {
            let _ = write!(hex, "{:02x} ", byte);
        }
        let ascii: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        let _ = writeln!(out, "{:08x}: {:<48} {}", line * 16, hex, ascii);
    }
    out
}
