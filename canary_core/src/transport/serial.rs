use super::{Transport, TransportError};
use serialport::{ClearBuffer, SerialPort};
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::trace;

/// Read/write timeout applied to the port itself; liveness uses the settle window.
const PORT_TIMEOUT: Duration = Duration::from_millis(50);

/// The operations the serial transport needs from a port.
pub trait SerialLink: Read + Write {
    /// Bytes waiting in the receive buffer. Fails once the device is gone.
    fn pending(&mut self) -> io::Result<u32>;

    /// Drops anything waiting in the receive buffer.
    fn discard_input(&mut self) -> io::Result<()>;
}

impl SerialLink for Box<dyn SerialPort> {
    fn pending(&mut self) -> io::Result<u32> {
        self.bytes_to_read().map_err(io::Error::from)
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

/// Serial-line crash oracle.
///
/// Serial targets give no crash signal of their own. By default the target is
/// considered alive if the port still answers after the settle window (a weak
/// signal); with `require_echo` it must also have sent bytes back.
pub struct SerialTarget<L: SerialLink = Box<dyn SerialPort>> {
    link: Option<L>,
    device: String,
    require_echo: bool,
}

impl SerialTarget<Box<dyn SerialPort>> {
    pub fn open(device: &str, baud: u32, require_echo: bool) -> Result<Self, TransportError> {
        let port = serialport::new(device, baud)
            .timeout(PORT_TIMEOUT)
            .open()
            .map_err(|source| TransportError::Serial {
                device: device.to_string(),
                source,
            })?;
        Ok(Self::with_link(port, device.to_string(), require_echo))
    }
}

impl<L: SerialLink> SerialTarget<L> {
    pub fn with_link(link: L, device: String, require_echo: bool) -> Self {
        Self {
            link: Some(link),
            device,
            require_echo,
        }
    }
}

impl<L: SerialLink> Transport for SerialTarget<L> {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn send(&mut self, payload: &[u8], timeout: Duration) -> Result<bool, TransportError> {
        let Some(link) = self.link.as_mut() else {
            return Err(TransportError::Disconnected {
                target: self.device.clone(),
            });
        };

        // Stale echo from an earlier payload must not count for this one.
        if let Err(e) = link.discard_input() {
            trace!("Could not clear {} input: {e}", self.device);
            return Ok(false);
        }
        if let Err(e) = link.write_all(payload).and_then(|_| link.flush()) {
            trace!("Write to {} failed: {e}", self.device);
            return Ok(false);
        }
        std::thread::sleep(timeout);

        match link.pending() {
            Ok(0) => Ok(!self.require_echo),
            Ok(n) => {
                let mut buf = vec![0u8; n as usize];
                if let Err(e) = link.read(&mut buf) {
                    trace!("Reading echo from {} failed: {e}", self.device);
                }
                Ok(true)
            }
            Err(e) => {
                trace!("{} stopped answering: {e}", self.device);
                Ok(false)
            }
        }
    }

    fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            let _ = link.flush();
        }
    }
}

impl<L: SerialLink> Drop for SerialTarget<L> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeLink {
        rx: Vec<u8>,
        echo: bool,
        gone: bool,
        written: Vec<u8>,
    }

    impl Read for FakeLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.rx.len());
            buf[..n].copy_from_slice(&self.rx[..n]);
            self.rx.drain(..n);
            Ok(n)
        }
    }

    impl Write for FakeLink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.gone {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            self.written.extend_from_slice(buf);
            if self.echo {
                self.rx.extend_from_slice(buf);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SerialLink for FakeLink {
        fn pending(&mut self) -> io::Result<u32> {
            if self.gone {
                return Err(io::Error::from(io::ErrorKind::NotConnected));
            }
            Ok(self.rx.len() as u32)
        }

        fn discard_input(&mut self) -> io::Result<()> {
            self.rx.clear();
            Ok(())
        }
    }

    const SETTLE: Duration = Duration::from_millis(1);

    #[test]
    fn open_port_counts_as_alive_by_default() {
        let mut target = SerialTarget::with_link(FakeLink::default(), "fake".into(), false);
        assert!(target.send(b"AAAA", SETTLE).unwrap());
    }

    #[test]
    fn require_echo_needs_bytes_back() {
        let mut silent = SerialTarget::with_link(FakeLink::default(), "fake".into(), true);
        assert!(!silent.send(b"AAAA", SETTLE).unwrap());

        let echoing = FakeLink {
            echo: true,
            ..Default::default()
        };
        let mut target = SerialTarget::with_link(echoing, "fake".into(), true);
        assert!(target.send(b"AAAA", SETTLE).unwrap());
        assert!(target.send(b"BBBB", SETTLE).unwrap());
    }

    #[test]
    fn stale_input_is_discarded_before_each_payload() {
        let link = FakeLink {
            rx: b"old banner".to_vec(),
            ..Default::default()
        };
        let mut target = SerialTarget::with_link(link, "fake".into(), true);
        assert!(!target.send(b"AAAA", SETTLE).unwrap());
    }

    #[test]
    fn vanished_device_is_a_crash() {
        let link = FakeLink {
            gone: true,
            ..Default::default()
        };
        let mut target = SerialTarget::with_link(link, "fake".into(), false);
        assert!(!target.send(b"AAAA", SETTLE).unwrap());
    }

    #[test]
    fn missing_device_is_fatal_at_construction() {
        match SerialTarget::open("/dev/this-serial-device-does-not-exist", 115_200, false) {
            Err(TransportError::Serial { device, .. }) => {
                assert!(device.contains("does-not-exist"));
            }
            Err(e) => panic!("Expected Serial error, got {e:?}"),
            Ok(_) => panic!("Opening a missing device must fail"),
        }
    }
}
