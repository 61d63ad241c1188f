use super::stream::{
    Channel, Connector, MAX_STALE_BYTES, Recovery, StreamTarget, TcpConnector, drain_nonblocking,
};
use super::{CONNECT_TIMEOUT, TransportError};
use crate::config::Endpoint;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme,
    StreamOwned,
};
use std::io;
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::time::Duration;

/// A client TLS session over TCP.
pub type TlsStream = StreamOwned<ClientConnection, TcpStream>;

impl Channel for TlsStream {
    fn set_timeouts(&mut self, timeout: Duration) -> io::Result<()> {
        self.sock.set_read_timeout(Some(timeout))?;
        self.sock.set_write_timeout(Some(timeout))
    }

    fn discard_stale(&mut self) -> io::Result<usize> {
        self.sock.set_nonblocking(true)?;
        let drained = drain_records(&mut self.conn, &mut self.sock);
        self.sock.set_nonblocking(false)?;
        drained
    }

    fn shutdown(&mut self) {
        self.conn.send_close_notify();
        let _ = self.conn.complete_io(&mut self.sock);
        let _ = self.sock.shutdown(Shutdown::Both);
    }
}

/// Feeds every record already waiting on the socket through the session and drops
/// the plaintext, including bytes rustls buffered during an earlier read.
fn drain_records(conn: &mut ClientConnection, sock: &mut TcpStream) -> io::Result<usize> {
    let mut total = 0;
    loop {
        total += drain_nonblocking(&mut conn.reader())?;
        if total >= MAX_STALE_BYTES {
            return Ok(total);
        }
        match conn.read_tls(sock) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            Ok(_) => {
                conn.process_new_packets()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Opens TCP connections and completes a TLS handshake on each.
pub struct TlsConnector {
    tcp: TcpConnector,
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
}

impl TlsConnector {
    /// With `insecure`, any server certificate is accepted; otherwise it must chain
    /// to the bundled web PKI roots and match the host name.
    pub fn new(endpoint: Endpoint, insecure: bool) -> Result<Self, TransportError> {
        let target = endpoint.to_string();
        let tls_err = |reason: String| TransportError::Tls {
            target: target.clone(),
            reason,
        };

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| tls_err(e.to_string()))?;
        let config = if insecure {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
                .with_no_client_auth()
        } else {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        };

        let server_name = ServerName::try_from(endpoint.host.clone())
            .map_err(|e| tls_err(format!("invalid server name: {e}")))?;

        Ok(Self {
            tcp: TcpConnector::new(endpoint),
            config: Arc::new(config),
            server_name,
        })
    }
}

impl Connector for TlsConnector {
    type Channel = TlsStream;

    fn target(&self) -> String {
        self.tcp.target()
    }

    fn connect(&self) -> Result<TlsStream, TransportError> {
        let sock = self.tcp.connect()?;
        let tls_err = |reason: String| TransportError::Tls {
            target: self.target(),
            reason,
        };

        sock.set_read_timeout(Some(CONNECT_TIMEOUT))
            .and_then(|_| sock.set_write_timeout(Some(CONNECT_TIMEOUT)))
            .map_err(|e| tls_err(e.to_string()))?;
        let conn = ClientConnection::new(Arc::clone(&self.config), self.server_name.clone())
            .map_err(|e| tls_err(e.to_string()))?;

        let mut stream = StreamOwned::new(conn, sock);
        while stream.conn.is_handshaking() {
            stream
                .conn
                .complete_io(&mut stream.sock)
                .map_err(|e| tls_err(format!("handshake failed: {e}")))?;
        }
        Ok(stream)
    }
}

pub type TlsTarget = StreamTarget<TlsConnector>;

impl StreamTarget<TlsConnector> {
    /// TLS target with TCP liveness semantics. Handshake failures here are fatal;
    /// TLS errors on later sends count as crashes.
    pub fn tls(endpoint: Endpoint, insecure: bool) -> Result<Self, TransportError> {
        let connector = TlsConnector::new(endpoint, insecure)?;
        StreamTarget::connect(connector, Recovery::Reconnect, "tls")
    }
}

/// Certificate verifier for self-signed targets. Signatures are still checked so
/// the handshake itself stays well-formed.
#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
