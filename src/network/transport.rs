//! Transport adapters
//!
//! A transport opens a byte channel to the device and hands back its two
//! halves. The read half is owned by the connection's read loop, the write
//! half sits behind the connection's write lock.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::serial::{SerialOptions, SerialTransport};
use crate::protocol::{Framing, DEFAULT_PORT};

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out opening {0}")]
    Timeout(String),

    #[error("Invalid transport configuration: {0}")]
    InvalidConfig(String),

    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Read half of an open transport
pub type TransportReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of an open transport
pub type TransportWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An open byte channel
pub struct TransportStream {
    pub reader: TransportReader,
    pub writer: TransportWriter,
}

impl TransportStream {
    pub fn new(reader: TransportReader, writer: TransportWriter) -> Self {
        Self { reader, writer }
    }

    /// Split any bidirectional stream into boxed halves
    pub fn from_io<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        Self::new(Box::new(reader), Box::new(writer))
    }
}

impl fmt::Debug for TransportStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportStream").finish_non_exhaustive()
    }
}

/// Byte channel to a device.
///
/// `open` may be called again after the previous stream failed, which is how
/// reconnection works.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a fresh byte channel
    async fn open(&self) -> TransportResult<TransportStream>;

    /// Human-readable endpoint, used in logs
    fn endpoint(&self) -> String;

    /// Framing the device expects on this kind of link
    fn default_framing(&self) -> Framing;
}

/// TCP transport
#[derive(Debug, Clone)]
pub struct TcpTransport {
    host: String,
    port: u16,
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(host: impl Into<String>, port: u16, connect_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&self) -> TransportResult<TransportStream> {
        let stream = match tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(TransportError::Io(e)),
            Err(_) => return Err(TransportError::Timeout(self.endpoint())),
        };

        // Frames are small; don't let Nagle hold them back
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        Ok(TransportStream::new(Box::new(reader), Box::new(writer)))
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn default_framing(&self) -> Framing {
        Framing::LengthPrefixed
    }
}

/// Transport selection as found in configuration files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    Tcp {
        host: String,
        #[serde(default = "default_port")]
        port: u16,
        /// Overrides the transport's default framing
        #[serde(default, skip_serializing_if = "Option::is_none")]
        framing: Option<Framing>,
    },
    Serial {
        device: String,
        #[serde(flatten)]
        options: SerialOptions,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        framing: Option<Framing>,
    },
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Tcp {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            framing: None,
        }
    }
}

impl TransportConfig {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
            framing: None,
        }
    }

    pub fn serial(device: impl Into<String>, options: SerialOptions) -> Self {
        Self::Serial {
            device: device.into(),
            options,
            framing: None,
        }
    }

    /// Replace the framing override
    pub fn with_framing(mut self, framing: Framing) -> Self {
        match &mut self {
            Self::Tcp { framing: f, .. } | Self::Serial { framing: f, .. } => *f = Some(framing),
        }
        self
    }

    /// Framing override, if any
    pub fn framing(&self) -> Option<Framing> {
        match self {
            Self::Tcp { framing, .. } | Self::Serial { framing, .. } => *framing,
        }
    }

    /// Build the transport adapter for this configuration
    pub fn build(&self, connect_timeout: Duration) -> TransportResult<Arc<dyn Transport>> {
        match self {
            Self::Tcp { host, port, .. } => {
                if host.is_empty() {
                    return Err(TransportError::InvalidConfig("empty host name".to_string()));
                }
                Ok(Arc::new(TcpTransport::new(host.clone(), *port, connect_timeout)))
            }
            Self::Serial {
                device, options, ..
            } => {
                if device.is_empty() {
                    return Err(TransportError::InvalidConfig("empty device path".to_string()));
                }
                options.validate()?;
                Ok(Arc::new(SerialTransport::new(device.clone(), options.clone())))
            }
        }
    }
}
