use crate::config::TransportConfig;
use std::io;
use std::time::Duration;
use thiserror::Error;

pub mod exec;
pub mod serial;
pub mod stream;
pub mod tls;
pub mod udp;

pub use exec::ExecTarget;
pub use serial::{SerialLink, SerialTarget};
pub use stream::{Channel, Connector, Recovery, StreamTarget, TcpConnector, TcpTarget};
#[cfg(unix)]
pub use stream::{UnixConnector, UnixTarget};
pub use tls::{TlsConnector, TlsTarget};
pub use udp::{Datagram, UdpTarget};

/// How long socket-based transports wait for the initial connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Socket timeouts must be non-zero; shorter per-probe timeouts are raised to this.
pub(crate) const MIN_TIMEOUT: Duration = Duration::from_millis(1);

/// Errors a transport cannot fold into a crashed/survived answer.
///
/// Construction failures always surface here. During `send`, only conditions the
/// variant treats as fatal (a subprocess that cannot be respawned, a Unix
/// connection that is already gone) are reported as errors.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Could not establish the initial connection.
    #[error("Failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },

    /// TLS configuration or handshake failed while constructing the transport.
    #[error("TLS setup for {target} failed: {reason}")]
    Tls { target: String, reason: String },

    /// The target program could not be started.
    #[error("Failed to spawn command {program:?}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// A subprocess transport was configured without a program to run.
    #[error("Subprocess transport needs at least a program path")]
    EmptyCommand,

    /// The serial device could not be opened.
    #[error("Failed to open serial device {device}: {source}")]
    Serial {
        device: String,
        #[source]
        source: serialport::Error,
    },

    /// The connection was lost earlier and this transport does not reconnect.
    #[error("Connection to {target} was lost and is not recoverable")]
    Disconnected { target: String },

    #[error("Transport I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0} transport is not supported on this platform")]
    Unsupported(&'static str),
}

/// A crash oracle over some channel to the target.
///
/// `send` delivers one payload and reports whether the target is judged to have
/// survived it within `timeout`. Implementations never block past that bound (plus
/// a fixed settle delay for subprocess and serial targets).
///
/// Instances are not synchronized: one run owns one transport and sends on it
/// sequentially.
pub trait Transport {
    /// Short name of the variant, used in log lines.
    fn name(&self) -> &'static str;

    /// Returns `Ok(true)` if the target survived `payload`, `Ok(false)` if it crashed
    /// or no liveness signal arrived before `timeout`.
    fn send(&mut self, payload: &[u8], timeout: Duration) -> Result<bool, TransportError>;

    /// Releases everything the transport owns. Safe to call more than once.
    fn close(&mut self);
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn send(&mut self, payload: &[u8], timeout: Duration) -> Result<bool, TransportError> {
        (**self).send(payload, timeout)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Builds the single transport variant selected by `config`.
pub fn open(config: &TransportConfig) -> Result<Box<dyn Transport>, TransportError> {
    let transport: Box<dyn Transport> = match config {
        TransportConfig::Exec { argv } => Box::new(ExecTarget::spawn(argv.clone())?),
        TransportConfig::Unix { path } => open_unix(path)?,
        TransportConfig::Tcp { addr } => Box::new(TcpTarget::tcp(addr.clone())?),
        TransportConfig::Udp { addr } => Box::new(UdpTarget::connect(addr)?),
        TransportConfig::Tls { addr, insecure } => {
            Box::new(TlsTarget::tls(addr.clone(), *insecure)?)
        }
        TransportConfig::Serial {
            device,
            baud,
            require_echo,
        } => Box::new(SerialTarget::open(device, *baud, *require_echo)?),
    };
    tracing::info!("Transport ready: {} ({})", transport.name(), config);
    Ok(transport)
}

#[cfg(unix)]
fn open_unix(path: &std::path::Path) -> Result<Box<dyn Transport>, TransportError> {
    Ok(Box::new(UnixTarget::unix(path)?))
}

#[cfg(not(unix))]
fn open_unix(_path: &std::path::Path) -> Result<Box<dyn Transport>, TransportError> {
    Err(TransportError::Unsupported("Unix socket"))
}

/// Read timeouts surface as `WouldBlock` on Unix and `TimedOut` on Windows.
pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
