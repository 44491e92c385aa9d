//! TLS Session Seam
//!
//! The peer state machines never touch rustls directly. They drive a
//! [`Session`], a non-blocking, step-at-a-time view of a TLS connection
//! whose every operation either finishes, or reports which readiness it is
//! waiting on ([`Step::WantRead`] / [`Step::WantWrite`]) so the caller can
//! flip its multiplexer interest and come back later.
//!
//! The real implementation lives in [`tls`], backed by rustls. Tests drive
//! the state machines with scripted sessions instead, which is the point of
//! the seam: handshake policy is testable without ever opening a TLS
//! connection.

pub mod tls;

use mio::net::TcpStream;
use thiserror::Error;

pub use tls::TlsClient;

/// Outcome of one non-blocking session step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The operation finished.
    Done,
    /// Blocked until the socket is readable.
    WantRead,
    /// Blocked until the socket is writable.
    WantWrite,
}

/// Outcome of a non-blocking application-data read.
#[derive(Debug)]
pub enum ReadOutcome {
    /// Decrypted bytes were copied into the caller's buffer.
    Data(usize),
    /// Nothing available; wait for readability.
    WouldBlock,
    /// The remote closed the session.
    Closed,
}

/// Session-level failures. None of these are would-block conditions; those
/// surface as [`Step`] / [`ReadOutcome`] values instead.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("I/O error inside the session: {0}")]
    Io(#[from] std::io::Error),

    /// The remote closed the connection mid-operation.
    #[error("session closed by the remote")]
    Closed,

    /// Invalid server name in the run configuration.
    #[error("invalid server name {0:?}")]
    ServerName(String),
}

/// One TLS connection driven in single steps that never block.
pub trait Session {
    /// Drives the initial handshake one step further.
    fn connect(&mut self, sock: &mut TcpStream) -> Result<Step, SessionError>;

    /// Queues a fresh key-refresh handshake on an established session.
    fn renegotiate(&mut self) -> Result<(), SessionError>;

    /// Drives the queued handshake to completion.
    fn handshake(&mut self, sock: &mut TcpStream) -> Result<Step, SessionError>;

    /// Reads and discards any application data the remote pushed at us.
    fn drain(&mut self, sock: &mut TcpStream) -> Result<(), SessionError>;

    /// Writes application bytes through the session.
    fn write(&mut self, sock: &mut TcpStream, data: &[u8]) -> Result<Step, SessionError>;

    /// Reads decrypted application bytes into `buf`.
    fn read(&mut self, sock: &mut TcpStream, buf: &mut [u8]) -> Result<ReadOutcome, SessionError>;
}
