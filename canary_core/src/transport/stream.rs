use super::{CONNECT_TIMEOUT, MIN_TIMEOUT, Transport, TransportError, is_timeout};
use crate::config::Endpoint;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// A connected byte stream to the target.
pub trait Channel: Read + Write {
    /// Bounds both the liveness read and the payload write.
    fn set_timeouts(&mut self, timeout: Duration) -> io::Result<()>;

    /// Discards reply bytes left over from earlier payloads without blocking.
    ///
    /// Returns the number of bytes dropped, or `UnexpectedEof` if the peer has
    /// already closed the connection.
    fn discard_stale(&mut self) -> io::Result<usize> {
        Ok(0)
    }

    /// Best-effort orderly shutdown.
    fn shutdown(&mut self) {}
}

/// Upper bound on stale bytes dropped before a payload.
pub(super) const MAX_STALE_BYTES: usize = 1 << 16;

pub(super) fn drain_nonblocking<R: Read>(reader: &mut R) -> io::Result<usize> {
    let mut buf = [0u8; 512];
    let mut total = 0;
    while total < MAX_STALE_BYTES {
        match reader.read(&mut buf) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

/// Opens fresh channels to the target, initially and on reconnect.
pub trait Connector {
    type Channel: Channel;

    /// Human-readable target address for logs and errors.
    fn target(&self) -> String;

    fn connect(&self) -> Result<Self::Channel, TransportError>;
}

/// What a stream transport does after the connection breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Report the failed send as a crash and reopen the connection for the next one.
    Reconnect,
    /// Report the failed send as a crash; every later send fails.
    Fatal,
}

/// Outcome of one payload exchange on a channel.
#[derive(Debug)]
enum Exchange {
    Alive,
    TimedOut,
    Broken(io::Error),
}

/// Byte-stream crash oracle: write the payload, then wait for a single reply byte.
///
/// Any reply byte means the target is alive, whatever its content. A read timeout
/// is a crash. A broken connection is also a crash, followed by the configured
/// [`Recovery`].
pub struct StreamTarget<C: Connector> {
    connector: C,
    channel: Option<C::Channel>,
    recovery: Recovery,
    lost: bool,
    closed: bool,
    reconnects: u64,
    name: &'static str,
}

impl<C: Connector> StreamTarget<C> {
    /// Connects immediately; a failure here is fatal.
    pub fn connect(
        connector: C,
        recovery: Recovery,
        name: &'static str,
    ) -> Result<Self, TransportError> {
        let channel = connector.connect()?;
        Ok(Self {
            connector,
            channel: Some(channel),
            recovery,
            lost: false,
            closed: false,
            reconnects: 0,
            name,
        })
    }

    /// Number of successful reconnects after the initial connection.
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    /// Replaces the current channel with a fresh one. Never fails: if the target is
    /// unreachable the transport is left disconnected and the next send retries.
    pub fn reconnect(&mut self) -> bool {
        if let Some(mut old) = self.channel.take() {
            old.shutdown();
        }
        match self.connector.connect() {
            Ok(channel) => {
                self.channel = Some(channel);
                self.reconnects += 1;
                debug!("Reconnected to {} (#{})", self.connector.target(), self.reconnects);
                true
            }
            Err(e) => {
                warn!("Reconnect to {} failed: {e}", self.connector.target());
                false
            }
        }
    }

    /// Drops stale reply bytes so they cannot be credited to the next payload. A
    /// connection found closed here died on an earlier payload; it is handled per
    /// the recovery policy before anything is sent.
    fn discard_stale(&mut self) -> bool {
        let Some(channel) = self.channel.as_mut() else {
            return false;
        };
        match channel.discard_stale() {
            Ok(0) => true,
            Ok(n) => {
                trace!("Discarded {n} stale reply bytes");
                true
            }
            Err(e) => {
                debug!("Connection to {} closed between payloads: {e}", self.connector.target());
                self.on_broken();
                self.channel.is_some()
            }
        }
    }

    fn on_broken(&mut self) {
        match self.recovery {
            Recovery::Reconnect => {
                self.reconnect();
            }
            Recovery::Fatal => {
                if let Some(mut channel) = self.channel.take() {
                    channel.shutdown();
                }
                self.lost = true;
            }
        }
    }

    fn exchange(channel: &mut C::Channel, payload: &[u8], timeout: Duration) -> Exchange {
        if let Err(e) = channel.set_timeouts(timeout.max(MIN_TIMEOUT)) {
            return Exchange::Broken(e);
        }
        if let Err(e) = channel.write_all(payload).and_then(|_| channel.flush()) {
            return if is_timeout(&e) {
                Exchange::TimedOut
            } else {
                Exchange::Broken(e)
            };
        }
        let mut reply = [0u8; 1];
        match channel.read(&mut reply) {
            Ok(0) => Exchange::Broken(io::Error::from(io::ErrorKind::UnexpectedEof)),
            Ok(_) => Exchange::Alive,
            Err(e) if is_timeout(&e) => Exchange::TimedOut,
            Err(e) => Exchange::Broken(e),
        }
    }
}

impl<C: Connector> Transport for StreamTarget<C> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn send(&mut self, payload: &[u8], timeout: Duration) -> Result<bool, TransportError> {
        if self.closed {
            return Err(TransportError::Disconnected {
                target: self.connector.target(),
            });
        }
        if self.channel.is_none() {
            if self.lost || self.recovery == Recovery::Fatal {
                return Err(TransportError::Disconnected {
                    target: self.connector.target(),
                });
            }
            if !self.reconnect() {
                return Ok(false);
            }
        }
        if !self.discard_stale() {
            return Ok(false);
        }
        let Some(channel) = self.channel.as_mut() else {
            return Ok(false);
        };

        match Self::exchange(channel, payload, timeout) {
            Exchange::Alive => Ok(true),
            Exchange::TimedOut => {
                trace!("No reply within {timeout:?}");
                Ok(false)
            }
            Exchange::Broken(e) => {
                trace!("Connection to {} broke: {e}", self.connector.target());
                self.on_broken();
                Ok(false)
            }
        }
    }

    /// Releases the connection. Later sends fail instead of reconnecting.
    fn close(&mut self) {
        self.closed = true;
        if let Some(mut channel) = self.channel.take() {
            channel.shutdown();
        }
    }
}

impl<C: Connector> Drop for StreamTarget<C> {
    fn drop(&mut self) {
        self.close();
    }
}

impl Channel for TcpStream {
    fn set_timeouts(&mut self, timeout: Duration) -> io::Result<()> {
        self.set_read_timeout(Some(timeout))?;
        self.set_write_timeout(Some(timeout))
    }

    fn discard_stale(&mut self) -> io::Result<usize> {
        self.set_nonblocking(true)?;
        let drained = drain_nonblocking(self);
        self.set_nonblocking(false)?;
        drained
    }

    fn shutdown(&mut self) {
        let _ = TcpStream::shutdown(self, Shutdown::Both);
    }
}

/// Plain TCP connections to `host:port`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    endpoint: Endpoint,
}

impl TcpConnector {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub(crate) fn open_stream(&self) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in (self.endpoint.host.as_str(), self.endpoint.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
        }))
    }
}

impl Connector for TcpConnector {
    type Channel = TcpStream;

    fn target(&self) -> String {
        self.endpoint.to_string()
    }

    fn connect(&self) -> Result<TcpStream, TransportError> {
        self.open_stream().map_err(|source| TransportError::Connect {
            target: self.target(),
            source,
        })
    }
}

pub type TcpTarget = StreamTarget<TcpConnector>;

impl StreamTarget<TcpConnector> {
    /// TCP target that reconnects after a reset or closed connection.
    pub fn tcp(endpoint: Endpoint) -> Result<Self, TransportError> {
        StreamTarget::connect(TcpConnector::new(endpoint), Recovery::Reconnect, "tcp")
    }
}

#[cfg(unix)]
mod unix {
    use super::*;
    use std::os::unix::net::UnixStream;
    use std::path::{Path, PathBuf};

    impl Channel for UnixStream {
        fn set_timeouts(&mut self, timeout: Duration) -> io::Result<()> {
            self.set_read_timeout(Some(timeout))?;
            self.set_write_timeout(Some(timeout))
        }

        fn discard_stale(&mut self) -> io::Result<usize> {
            self.set_nonblocking(true)?;
            let drained = drain_nonblocking(self);
            self.set_nonblocking(false)?;
            drained
        }

        fn shutdown(&mut self) {
            let _ = UnixStream::shutdown(self, Shutdown::Both);
        }
    }

    /// Unix-domain stream socket at a filesystem path.
    #[derive(Debug, Clone)]
    pub struct UnixConnector {
        path: PathBuf,
    }

    impl UnixConnector {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }
    }

    impl Connector for UnixConnector {
        type Channel = UnixStream;

        fn target(&self) -> String {
            self.path.display().to_string()
        }

        fn connect(&self) -> Result<UnixStream, TransportError> {
            UnixStream::connect(&self.path).map_err(|source| TransportError::Connect {
                target: self.target(),
                source,
            })
        }
    }

    pub type UnixTarget = StreamTarget<UnixConnector>;

    impl StreamTarget<UnixConnector> {
        /// Unix socket target. A lost connection is not reopened.
        pub fn unix(path: &Path) -> Result<Self, TransportError> {
            StreamTarget::connect(UnixConnector::new(path), Recovery::Fatal, "unix")
        }
    }
}

#[cfg(unix)]
pub use unix::{UnixConnector, UnixTarget};
