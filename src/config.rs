use crate::identity::StreamIdentity;
use crate::pipeline::supervisor::Termination;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Default depth of the buffering queue at the head of every branch.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Invalid SRT uri: {0}")]
    InvalidUri(String),

    #[error("Invalid SRT uri {uri}: {reason}")]
    MalformedUri { uri: String, reason: String },

    #[error("{0}")]
    Usage(String),
}

/// SRT connection role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrtMode {
    Caller,
    Listener,
}

/// A parsed `srt://host:port[?mode=..&latency=..]` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrtUri {
    raw: String,
    host: String,
    port: u16,
    mode: SrtMode,
    latency: Option<Duration>,
}

impl SrtUri {
    pub fn parse(uri: &str) -> Result<Self, StartupError> {
        if !uri.starts_with("srt://") {
            return Err(StartupError::InvalidUri(uri.to_string()));
        }

        let malformed = |reason: &str| StartupError::MalformedUri {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(uri).map_err(|e| malformed(&e.to_string()))?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| malformed("missing host"))?
            .to_string();
        let port = url.port().ok_or_else(|| malformed("missing port"))?;

        let mut mode = SrtMode::Caller;
        let mut latency = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "mode" => {
                    mode = match value.as_ref() {
                        "caller" => SrtMode::Caller,
                        "listener" => SrtMode::Listener,
                        other => return Err(malformed(&format!("unsupported mode '{}'", other))),
                    }
                }
                "latency" => {
                    let ms: u64 = value
                        .parse()
                        .map_err(|_| malformed(&format!("invalid latency '{}'", value)))?;
                    latency = Some(Duration::from_millis(ms));
                }
                other => log::debug!("ignoring SRT uri parameter '{}'", other),
            }
        }

        Ok(Self {
            raw: uri.to_string(),
            host,
            port,
            mode,
            latency,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn mode(&self) -> SrtMode {
        self.mode
    }

    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    /// `host:port`, as handed to the socket layer.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for SrtUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// How runtime termination maps onto the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitPolicy {
    /// End-of-stream and errors both exit 0 after teardown.
    #[default]
    Conflate,
    /// Errors exit 1; end-of-stream and interrupts exit 0.
    Distinguish,
}

impl ExitPolicy {
    pub fn exit_code(&self, termination: &Termination) -> i32 {
        match (self, termination) {
            (ExitPolicy::Distinguish, Termination::Error(_)) => 1,
            _ => 0,
        }
    }
}

/// Startup configuration handed to the supervisor.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub uri: SrtUri,
    pub identity: StreamIdentity,
    pub exit_policy: ExitPolicy,
    pub queue_capacity: usize,
    pub connect_timeout: Option<Duration>,
    pub video_output: Option<PathBuf>,
}

impl ReceiverConfig {
    pub fn new(uri: SrtUri, identity: StreamIdentity) -> Self {
        Self {
            uri,
            identity,
            exit_policy: ExitPolicy::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            connect_timeout: None,
            video_output: None,
        }
    }
}

/// Returns a version as specified in Cargo.toml
pub fn app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}
