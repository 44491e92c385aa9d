//! Peer State Machines
//!
//! A peer is one managed connection slot. Two machines share the same driver
//! seam: [`request::RequestPeer`] cycles GET requests and counts framed
//! responses, [`probe::ProbePeer`] cycles TLS handshakes and key refreshes.
//! The engine and pool only ever talk to the [`Driver`] trait, so the loop,
//! slow start, statistics and dispatch are written once.
//!
//! Every driver call performs at most one non-blocking I/O attempt per ready
//! socket and must never block; a would-block result flips the registered
//! multiplexer interest and the peer waits for the next event. Recycling a
//! peer always deregisters the socket before dropping it.

pub mod probe;
pub mod request;

use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mio::net::TcpStream;
use thiserror::Error;

use crate::config::ConfigError;
use crate::http::ParseError;
use crate::poller::{Poller, PollerError, Readiness};
use crate::session::{SessionError, TlsClient};
use crate::stats::RunStats;

pub use probe::ProbePeer;
pub use request::RequestPeer;

/// Shared read buffer size. A single read that fills this exactly is treated
/// as overflow; see [`EngineError::BufferOverflow`].
pub const READ_BUF_SIZE: usize = 16 * 1024;

/// Give up on an unfinished connect or handshake after this long.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Immutable per-run dialing material, shared by every peer.
pub struct Target {
    pub addr: SocketAddr,
    /// Server name used for SNI on the TLS paths.
    pub host: String,
    /// Prebuilt request bytes (request/response variant only).
    pub request: Bytes,
    /// TLS session factory; `None` for plain `http://` targets.
    pub tls: Option<Arc<TlsClient>>,
    /// Stop initiating new attempts once this many have been made.
    pub attempt_limit: Option<u64>,
}

/// Mutable loop-owned resources threaded through every driver call.
pub struct StepCx<'a> {
    pub poller: &'a mut Poller,
    pub stats: &'a mut RunStats,
    /// Shared read scratch; peers never keep read bytes across steps.
    pub scratch: &'a mut [u8],
    /// Set by a peer when its first TCP connect completes, telling the pool
    /// to admit the next slot (slow start).
    pub admit: bool,
}

/// Fatal run failures. Everything recoverable is absorbed inside the peers;
/// an `Err` from any driver call tears the whole run down.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Poller(#[from] PollerError),

    #[error("peer #{id}: response stream cannot be resynchronized: {source}")]
    Parse {
        id: usize,
        #[source]
        source: ParseError,
    },

    #[error("peer #{id}: a single read filled the {READ_BUF_SIZE}-byte buffer with no message boundary")]
    BufferOverflow { id: usize },

    #[error("peer #{id}: socket error on an established connection: {source}")]
    Socket { id: usize, source: io::Error },

    /// The very first connect of the run failed outright.
    #[error("cannot reach {addr}: {source}")]
    Bootstrap { addr: SocketAddr, source: io::Error },

    /// The first-ever handshake failed; the target does not speak TLS.
    #[error("target does not answer TLS: {source}")]
    NotTls { source: SessionError },

    /// Key refresh failed before a single one ever succeeded.
    #[error("target never completed a TLS key refresh: {source}")]
    RenegotiationUnsupported { source: SessionError },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("TLS client setup failed: {0}")]
    TlsSetup(#[from] SessionError),

    #[error("invalid engine wiring: {0}")]
    Wiring(&'static str),
}

/// One peer slot, driven by the pool and the event loop.
pub trait Driver: Default {
    /// Noun used in the periodic report line ("Responses", "Handshakes").
    const COUNT_LABEL: &'static str;
    /// Rate unit used in the report line ("r/s", "h/s").
    const RATE_UNIT: &'static str;

    /// Dials the target and registers the socket. Called once per admission
    /// and again via [`Driver::advance`] after every recycle.
    fn activate(
        &mut self,
        id: usize,
        target: &Target,
        cx: &mut StepCx<'_>,
    ) -> Result<(), EngineError>;

    /// Whether this slot currently owns a socket.
    fn is_active(&self) -> bool;

    /// Whether the TCP connection is established (reported as "Conn" in the
    /// statistics line).
    fn is_established(&self) -> bool;

    /// Whether the peer asked to be stepped at the top of the next loop
    /// iteration, without waiting for a readiness event.
    fn wants_advance(&self) -> bool;

    /// Runs the deferred step requested by [`Driver::wants_advance`].
    fn advance(
        &mut self,
        id: usize,
        target: &Target,
        cx: &mut StepCx<'_>,
    ) -> Result<(), EngineError>;

    /// Handles one readiness event for this peer's socket.
    fn on_ready(
        &mut self,
        id: usize,
        target: &Target,
        ready: Readiness,
        cx: &mut StepCx<'_>,
    ) -> Result<(), EngineError>;

    /// Recycles the peer if its connect/handshake has been pending longer
    /// than [`CONNECT_TIMEOUT`].
    fn check_deadline(
        &mut self,
        id: usize,
        now: Instant,
        cx: &mut StepCx<'_>,
    ) -> Result<(), EngineError>;

    /// Releases the socket at run end. Best-effort; never fails.
    fn shutdown(&mut self, cx: &mut StepCx<'_>);
}

/// Starts a non-blocking connect toward the target.
pub(crate) fn dial(addr: SocketAddr) -> io::Result<TcpStream> {
    TcpStream::connect(addr)
}

/// Reconciles the desired interest against what is currently registered,
/// touching the multiplexer only on a change.
pub(crate) fn set_interest(
    sock: &mut TcpStream,
    id: usize,
    current: &mut Option<mio::Interest>,
    want: mio::Interest,
    cx: &mut StepCx<'_>,
) -> Result<(), EngineError> {
    if *current != Some(want) {
        cx.poller.reregister(sock, id, want)?;
        *current = Some(want);
    }
    Ok(())
}

/// Checks whether a non-blocking connect has finished after a writable
/// event. `Ok(false)` means still in progress.
pub(crate) fn connect_finished(sock: &TcpStream) -> io::Result<bool> {
    if let Some(e) = sock.take_error()? {
        return Err(e);
    }
    match sock.peer_addr() {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotConnected => Ok(false),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(false),
        Err(e) => Err(e),
    }
}
