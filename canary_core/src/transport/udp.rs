use super::{MIN_TIMEOUT, Transport, TransportError, is_timeout};
use crate::config::Endpoint;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;
use tracing::{debug, trace};

/// Upper bound on datagrams discarded before one send.
const MAX_DRAIN: usize = 1024;

/// A datagram socket already associated with the target.
pub trait Datagram {
    fn send(&mut self, payload: &[u8]) -> io::Result<usize>;

    /// Non-blocking receive: `Ok(None)` when nothing is queued.
    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;

    /// Blocking receive bounded by `timeout`.
    fn recv_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    fn shutdown(&mut self) {}
}

impl Datagram for UdpSocket {
    fn send(&mut self, payload: &[u8]) -> io::Result<usize> {
        UdpSocket::send(self, payload)
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        self.set_nonblocking(true)?;
        let received = match self.recv(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        };
        self.set_nonblocking(false)?;
        received
    }

    fn recv_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.set_read_timeout(Some(timeout))?;
        self.recv(buf)
    }
}

/// Datagram crash oracle: one reply datagram within the timeout means alive.
///
/// Replies that arrive late for an earlier payload stay queued on the socket, so
/// they are drained before every send and cannot be credited to the wrong payload.
pub struct UdpTarget<D: Datagram = UdpSocket> {
    socket: Option<D>,
    target: String,
}

impl UdpTarget<UdpSocket> {
    /// Binds an ephemeral local port and associates it with `endpoint`.
    pub fn connect(endpoint: &Endpoint) -> Result<Self, TransportError> {
        let connect_err = |source: io::Error| TransportError::Connect {
            target: endpoint.to_string(),
            source,
        };
        let peer = (endpoint.host.as_str(), endpoint.port)
            .to_socket_addrs()
            .map_err(connect_err)?
            .next()
            .ok_or_else(|| {
                connect_err(io::Error::new(
                    io::ErrorKind::NotFound,
                    "host resolved to no addresses",
                ))
            })?;
        let local: SocketAddr = if peer.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).map_err(connect_err)?;
        socket.connect(peer).map_err(connect_err)?;
        Ok(Self::with_socket(socket, endpoint.to_string()))
    }
}

impl<D: Datagram> UdpTarget<D> {
    pub fn with_socket(socket: D, target: String) -> Self {
        Self {
            socket: Some(socket),
            target,
        }
    }

    /// Discards every queued datagram, including queued ICMP errors reported as
    /// receive failures. Returns how many were dropped.
    pub fn drain(&mut self) -> usize {
        let Some(socket) = self.socket.as_mut() else {
            return 0;
        };
        let mut buf = [0u8; 1];
        let mut drained = 0;
        while drained < MAX_DRAIN {
            match socket.try_recv(&mut buf) {
                Ok(Some(_)) => drained += 1,
                Ok(None) => break,
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => drained += 1,
                Err(e) => {
                    trace!("Drain stopped on error: {e}");
                    break;
                }
            }
        }
        if drained > 0 {
            debug!("Drained {drained} stale datagram(s) from {}", self.target);
        }
        drained
    }
}

impl<D: Datagram> Transport for UdpTarget<D> {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn send(&mut self, payload: &[u8], timeout: Duration) -> Result<bool, TransportError> {
        self.drain();
        let Some(socket) = self.socket.as_mut() else {
            return Err(TransportError::Disconnected {
                target: self.target.clone(),
            });
        };
        if let Err(e) = socket.send(payload) {
            trace!("Datagram send to {} failed: {e}", self.target);
            return Ok(false);
        }
        let mut reply = [0u8; 1];
        match socket.recv_timeout(&mut reply, timeout.max(MIN_TIMEOUT)) {
            Ok(_) => Ok(true),
            Err(e) if is_timeout(&e) => Ok(false),
            Err(e) => {
                trace!("No reply datagram from {}: {e}", self.target);
                Ok(false)
            }
        }
    }

    fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            socket.shutdown();
        }
    }
}

impl<D: Datagram> Drop for UdpTarget<D> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::thread;

    /// Socket whose receive queue is scripted; `send` optionally enqueues a reply.
    struct FakeSocket {
        queue: VecDeque<u8>,
        reply_to_sends: bool,
        sent: Vec<Vec<u8>>,
    }

    impl Datagram for FakeSocket {
        fn send(&mut self, payload: &[u8]) -> io::Result<usize> {
            self.sent.push(payload.to_vec());
            if self.reply_to_sends {
                self.queue.push_back(payload[0]);
            }
            Ok(payload.len())
        }

        fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
            Ok(self.queue.pop_front().map(|b| {
                buf[0] = b;
                1
            }))
        }

        fn recv_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
            match self.queue.pop_front() {
                Some(b) => {
                    buf[0] = b;
                    Ok(1)
                }
                None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            }
        }
    }

    #[test]
    fn stale_datagrams_are_drained_before_sending() {
        let socket = FakeSocket {
            queue: VecDeque::from(vec![1, 2, 3]),
            reply_to_sends: false,
            sent: vec![],
        };
        let mut target = UdpTarget::with_socket(socket, "fake".into());

        // Without the drain, the three stale replies would read as "alive".
        assert!(!target.send(b"x", Duration::from_millis(10)).unwrap());
        assert_eq!(target.socket.as_ref().unwrap().sent, vec![b"x".to_vec()]);
    }

    #[test]
    fn reply_datagram_means_alive() {
        let socket = FakeSocket {
            queue: VecDeque::new(),
            reply_to_sends: true,
            sent: vec![],
        };
        let mut target = UdpTarget::with_socket(socket, "fake".into());
        assert!(target.send(b"ping", Duration::from_millis(10)).unwrap());
        assert_eq!(target.drain(), 0);
    }

    #[test]
    fn send_after_close_is_an_error() {
        let socket = FakeSocket {
            queue: VecDeque::new(),
            reply_to_sends: true,
            sent: vec![],
        };
        let mut target = UdpTarget::with_socket(socket, "fake".into());
        target.close();
        assert!(matches!(
            target.send(b"x", Duration::from_millis(10)),
            Err(TransportError::Disconnected { .. })
        ));
    }

    #[test]
    fn loopback_echo_and_silence() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();

        // Echo payloads unless they start with 'X'.
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 256];
            for _ in 0..2 {
                let (n, from) = server.recv_from(&mut buf).unwrap();
                if buf[0] != b'X' {
                    server.send_to(&buf[..n], from).unwrap();
                }
            }
        });

        let mut target = UdpTarget::connect(&Endpoint::new("127.0.0.1", port)).unwrap();
        assert!(target.send(b"hello", Duration::from_millis(500)).unwrap());
        assert!(!target.send(b"XXXX", Duration::from_millis(100)).unwrap());
        handle.join().unwrap();
    }
}
