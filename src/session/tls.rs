//! rustls-backed sessions.
//!
//! One [`TlsClient`] is built per run and hands out a fresh
//! [`RustlsSession`] per connection attempt. Two choices matter here:
//!
//! - **No resumption.** `Resumption::disabled()` guarantees nothing is cached
//!   between reconnects; every recycled peer pays for a full handshake, which
//!   is exactly the load this engine exists to generate.
//! - **No certificate verification.** The engine talks to whatever the
//!   operator pointed it at, self-signed or otherwise; counting handshakes
//!   does not require trusting the peer. Do not reuse this client config for
//!   anything that moves real data.
//!
//! "Renegotiation" is expressed as a TLS 1.3 key refresh
//! (`refresh_traffic_keys`): rustls deliberately omits classic TLS
//! renegotiation, and the key-update exchange is the modern way to force the
//! remote through fresh key schedule work on a live session.

use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;

use mio::net::TcpStream;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::Resumption;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, SignatureScheme};

use super::{ReadOutcome, Session, SessionError, Step};

/// Per-run factory for TLS sessions.
pub struct TlsClient {
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
}

impl TlsClient {
    /// Builds the client for the given server name (SNI / certificate host).
    pub fn new(host: &str) -> Result<Self, SessionError> {
        let provider = rustls::crypto::ring::default_provider();
        let mut config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert::new(provider)))
            .with_no_client_auth();
        // A recycled peer must never resume: the whole point is a full
        // handshake on every reconnect.
        config.resumption = Resumption::disabled();

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| SessionError::ServerName(host.to_string()))?;

        Ok(Self {
            config: Arc::new(config),
            server_name,
        })
    }

    /// Opens a fresh session for one connection attempt.
    pub fn open(&self) -> Result<RustlsSession, SessionError> {
        let conn = ClientConnection::new(Arc::clone(&self.config), self.server_name.clone())?;
        Ok(RustlsSession { conn })
    }
}

/// One rustls connection adapted to the non-blocking [`Session`] steps.
pub struct RustlsSession {
    conn: ClientConnection,
}

impl RustlsSession {
    /// Flushes pending TLS records to the socket. Returns true if the socket
    /// blocked before everything was written.
    fn flush(&mut self, sock: &mut TcpStream) -> Result<bool, SessionError> {
        while self.conn.wants_write() {
            match self.conn.write_tls(sock) {
                Ok(0) => return Err(SessionError::Closed),
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(true),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(SessionError::Io(e)),
            }
        }
        Ok(false)
    }

    /// Pulls one batch of TLS records off the socket and processes them.
    fn fill(&mut self, sock: &mut TcpStream) -> Result<Fill, SessionError> {
        match self.conn.read_tls(sock) {
            Ok(0) => Ok(Fill::Eof),
            Ok(_) => {
                self.conn.process_new_packets()?;
                Ok(Fill::Progress)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(Fill::Blocked),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(Fill::Progress),
            Err(e) => Err(SessionError::Io(e)),
        }
    }

    /// Drives handshake traffic until it completes or the socket blocks.
    fn drive(&mut self, sock: &mut TcpStream) -> Result<Step, SessionError> {
        loop {
            if self.flush(sock)? {
                return Ok(Step::WantWrite);
            }
            if !self.conn.is_handshaking() && !self.conn.wants_write() {
                return Ok(Step::Done);
            }
            match self.fill(sock)? {
                Fill::Progress => {}
                Fill::Blocked => return Ok(Step::WantRead),
                Fill::Eof => return Err(SessionError::Closed),
            }
        }
    }
}

enum Fill {
    Progress,
    Blocked,
    Eof,
}

impl Session for RustlsSession {
    fn connect(&mut self, sock: &mut TcpStream) -> Result<Step, SessionError> {
        self.drive(sock)
    }

    fn renegotiate(&mut self) -> Result<(), SessionError> {
        self.conn.refresh_traffic_keys()?;
        Ok(())
    }

    fn handshake(&mut self, sock: &mut TcpStream) -> Result<Step, SessionError> {
        self.drive(sock)
    }

    fn drain(&mut self, sock: &mut TcpStream) -> Result<(), SessionError> {
        // Pull whatever TLS records are waiting, then discard any plaintext
        // they produced.
        loop {
            match self.fill(sock)? {
                Fill::Progress => {}
                Fill::Blocked => break,
                Fill::Eof => return Err(SessionError::Closed),
            }
        }
        let mut sink = [0u8; 1024];
        loop {
            match self.conn.reader().read(&mut sink) {
                Ok(0) => return Err(SessionError::Closed),
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(SessionError::Io(e)),
            }
        }
        Ok(())
    }

    fn write(&mut self, sock: &mut TcpStream, data: &[u8]) -> Result<Step, SessionError> {
        // The rustls writer buffers unconditionally; blocking only happens
        // when flushing the produced records.
        self.conn
            .writer()
            .write_all(data)
            .map_err(SessionError::Io)?;
        if self.flush(sock)? {
            Ok(Step::WantWrite)
        } else {
            Ok(Step::Done)
        }
    }

    fn read(&mut self, sock: &mut TcpStream, buf: &mut [u8]) -> Result<ReadOutcome, SessionError> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(0) => return Ok(ReadOutcome::Closed),
                Ok(n) => return Ok(ReadOutcome::Data(n)),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(SessionError::Io(e)),
            }
            match self.fill(sock)? {
                Fill::Progress => {}
                Fill::Blocked => return Ok(ReadOutcome::WouldBlock),
                Fill::Eof => return Ok(ReadOutcome::Closed),
            }
        }
    }
}

/// Certificate verifier that accepts everything. See the module docs for why
/// that is acceptable here and nowhere else.
#[derive(Debug)]
struct AcceptAnyCert {
    provider: CryptoProvider,
}

impl AcceptAnyCert {
    fn new(provider: CryptoProvider) -> Self {
        Self { provider }
    }
}

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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_builds_for_hostname() {
        let client = TlsClient::new("example.com").unwrap();
        assert!(client.open().is_ok());
    }

    #[test]
    fn test_client_builds_for_ip() {
        let client = TlsClient::new("127.0.0.1").unwrap();
        assert!(client.open().is_ok());
    }

    #[test]
    fn test_renegotiate_before_handshake_fails() {
        let client = TlsClient::new("example.com").unwrap();
        let mut session = client.open().unwrap();
        // Key refresh on a connection that has never handshaked is an error,
        // which the probe peer maps to its bootstrap-fatal policy.
        assert!(session.renegotiate().is_err());
    }
}
