//! Handshake/Renegotiation Peer
//!
//! Drives one connection through `Connecting → TlsConnecting → Handshaking ⇄
//! DummyWrite`: connect, complete a full TLS handshake, then force the remote
//! through key-refresh handshakes back to back for as long as the connection
//! lives. Every 50th completion detours through a one-byte dummy write as a
//! liveness probe against servers that silently drop idle sessions.
//!
//! The session handle is dropped on every disconnect, and the TLS client is
//! built with resumption disabled, so a recycled peer always pays for a full
//! handshake again.
//!
//! Bootstrap policy: the run aborts if the target refuses the very first
//! connect, never completes a single handshake, or never completes a single
//! key refresh. Once each of those has succeeded once process-wide, the same
//! failure becomes a counted error and a reconnect.

use std::io;
use std::mem;
use std::time::Instant;

use mio::net::TcpStream;
use mio::Interest;
use tracing::{debug, trace};

use crate::poller::Readiness;
use crate::session::{Session, SessionError, Step};

use super::{
    connect_finished, dial, set_interest, Driver, EngineError, StepCx, Target, CONNECT_TIMEOUT,
};

/// Every Nth completed renegotiation routes through a dummy write.
const DUMMY_WRITE_INTERVAL: u64 = 50;

/// The single sentinel byte of a dummy write.
const DUMMY_BYTE: [u8; 1] = [0];

enum State {
    Idle,
    /// Non-blocking connect in flight.
    Connecting { sock: TcpStream, since: Instant },
    /// Initial TLS handshake in flight.
    TlsConnecting {
        sock: TcpStream,
        session: Box<dyn Session>,
        since: Instant,
    },
    /// Established; cycling key-refresh handshakes.
    Handshaking {
        sock: TcpStream,
        session: Box<dyn Session>,
    },
    /// Liveness probe between renegotiations.
    DummyWrite {
        sock: TcpStream,
        session: Box<dyn Session>,
    },
}

/// One handshake/renegotiation connection slot.
pub struct ProbePeer {
    state: State,
    /// Completed renegotiations on the current connection.
    renegotiations: u64,
    interest: Option<Interest>,
    want_next: bool,
}

impl Default for ProbePeer {
    fn default() -> Self {
        Self {
            state: State::Idle,
            renegotiations: 0,
            interest: None,
            want_next: false,
        }
    }
}

impl ProbePeer {
    /// Drops the session and socket and marks the slot for redial.
    fn disconnect(&mut self, mut sock: TcpStream, cx: &mut StepCx<'_>) -> Result<(), EngineError> {
        cx.poller.deregister(&mut sock)?;
        self.renegotiations = 0;
        self.interest = None;
        self.state = State::Idle;
        self.want_next = true;
        Ok(())
    }

    fn recycle(&mut self, cx: &mut StepCx<'_>) -> Result<(), EngineError> {
        match mem::replace(&mut self.state, State::Idle) {
            State::Idle => Ok(()),
            State::Connecting { sock, .. }
            | State::TlsConnecting { sock, .. }
            | State::Handshaking { sock, .. }
            | State::DummyWrite { sock, .. } => self.disconnect(sock, cx),
        }
    }

    fn connect_failed(
        &mut self,
        id: usize,
        target: &Target,
        source: io::Error,
        cx: &mut StepCx<'_>,
    ) -> Result<(), EngineError> {
        if cx.stats.tcp_connects == 0 {
            return Err(EngineError::Bootstrap {
                addr: target.addr,
                source,
            });
        }
        debug!(peer = id, error = %source, "Connect failed, retrying");
        cx.stats.record_error();
        self.recycle(cx)
    }

    /// Initial handshake failed. Fatal until one has ever succeeded.
    fn handshake_failed(
        &mut self,
        id: usize,
        sock: TcpStream,
        source: SessionError,
        cx: &mut StepCx<'_>,
    ) -> Result<(), EngineError> {
        if cx.stats.tls_connects == 0 {
            return Err(EngineError::NotTls { source });
        }
        debug!(peer = id, error = %source, "Handshake failed, reconnecting");
        cx.stats.record_error();
        self.disconnect(sock, cx)
    }

    /// Renegotiation failed. Fatal until one has ever completed.
    fn renegotiation_failed(
        &mut self,
        id: usize,
        sock: TcpStream,
        source: SessionError,
        cx: &mut StepCx<'_>,
    ) -> Result<(), EngineError> {
        if cx.stats.completions == 0 {
            return Err(EngineError::RenegotiationUnsupported { source });
        }
        debug!(peer = id, error = %source, "Renegotiation failed, reconnecting");
        cx.stats.record_error();
        self.disconnect(sock, cx)
    }

    fn on_connecting(
        &mut self,
        id: usize,
        target: &Target,
        ready: Readiness,
        cx: &mut StepCx<'_>,
    ) -> Result<(), EngineError> {
        let State::Connecting { mut sock, since } = mem::replace(&mut self.state, State::Idle)
        else {
            return Ok(());
        };

        if ready.error || ready.hangup {
            let source = sock.take_error().ok().flatten().unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused")
            });
            self.state = State::Connecting { sock, since };
            return self.connect_failed(id, target, source, cx);
        }

        match connect_finished(&sock) {
            Ok(false) => {
                self.state = State::Connecting { sock, since };
                Ok(())
            }
            Err(source) => {
                self.state = State::Connecting { sock, since };
                self.connect_failed(id, target, source, cx)
            }
            Ok(true) => {
                trace!(peer = id, "TCP connect complete");
                cx.stats.record_tcp_connect();
                cx.admit = true;
                let Some(tls) = target.tls.as_deref() else {
                    return Err(EngineError::Wiring("probe target has no TLS client"));
                };
                let mut session: Box<dyn Session> = Box::new(tls.open()?);
                match session.connect(&mut sock) {
                    Ok(Step::Done) => self.established(id, sock, session, cx),
                    Ok(step) => {
                        self.park(id, sock, session, step, true, cx)
                    }
                    Err(source) => self.handshake_failed(id, sock, source, cx),
                }
            }
        }
    }

    /// Stores the peer in a waiting state with the interest the session
    /// asked for. `initial` selects TlsConnecting vs Handshaking.
    fn park(
        &mut self,
        id: usize,
        mut sock: TcpStream,
        session: Box<dyn Session>,
        step: Step,
        initial: bool,
        cx: &mut StepCx<'_>,
    ) -> Result<(), EngineError> {
        let want = match step {
            Step::WantWrite => Interest::WRITABLE,
            _ => Interest::READABLE,
        };
        set_interest(&mut sock, id, &mut self.interest, want, cx)?;
        self.state = if initial {
            State::TlsConnecting {
                sock,
                session,
                since: Instant::now(),
            }
        } else {
            State::Handshaking { sock, session }
        };
        Ok(())
    }

    /// Initial handshake done: start the renegotiation cycle.
    fn established(
        &mut self,
        id: usize,
        sock: TcpStream,
        session: Box<dyn Session>,
        cx: &mut StepCx<'_>,
    ) -> Result<(), EngineError> {
        trace!(peer = id, "TLS handshake complete");
        cx.stats.record_tls_connect();
        self.renegotiations = 0;
        self.renegotiate(id, sock, session, cx)
    }

    /// Queues a key refresh and drives it as far as the socket allows.
    fn renegotiate(
        &mut self,
        id: usize,
        sock: TcpStream,
        mut session: Box<dyn Session>,
        cx: &mut StepCx<'_>,
    ) -> Result<(), EngineError> {
        if let Err(source) = session.renegotiate() {
            return self.renegotiation_failed(id, sock, source, cx);
        }
        cx.stats.record_attempt();
        self.drive(id, sock, session, cx)
    }

    /// Steps the in-flight handshake, looping straight into the next
    /// renegotiation on completion until the socket blocks.
    fn drive(
        &mut self,
        id: usize,
        mut sock: TcpStream,
        mut session: Box<dyn Session>,
        cx: &mut StepCx<'_>,
    ) -> Result<(), EngineError> {
        loop {
            match session.handshake(&mut sock) {
                Ok(Step::Done) => {
                    cx.stats.record_completions(1);
                    self.renegotiations += 1;
                    trace!(peer = id, count = self.renegotiations, "Key refresh complete");
                    if self.renegotiations % DUMMY_WRITE_INTERVAL == 0 {
                        return self.dummy_write(id, sock, session, cx);
                    }
                    if let Err(source) = session.renegotiate() {
                        return self.renegotiation_failed(id, sock, source, cx);
                    }
                    cx.stats.record_attempt();
                }
                Ok(step) => return self.park(id, sock, session, step, false, cx),
                Err(source) => return self.renegotiation_failed(id, sock, source, cx),
            }
        }
    }

    /// Writes the one-byte liveness probe, then resumes renegotiating.
    fn dummy_write(
        &mut self,
        id: usize,
        mut sock: TcpStream,
        mut session: Box<dyn Session>,
        cx: &mut StepCx<'_>,
    ) -> Result<(), EngineError> {
        match session.write(&mut sock, &DUMMY_BYTE) {
            Ok(Step::Done) => {
                trace!(peer = id, "Dummy write complete");
                self.renegotiate(id, sock, session, cx)
            }
            Ok(step) => {
                let want = match step {
                    Step::WantWrite => Interest::WRITABLE,
                    _ => Interest::READABLE,
                };
                set_interest(&mut sock, id, &mut self.interest, want, cx)?;
                self.state = State::DummyWrite { sock, session };
                Ok(())
            }
            Err(source) => {
                debug!(peer = id, error = %source, "Dummy write failed, reconnecting");
                cx.stats.record_error();
                self.disconnect(sock, cx)
            }
        }
    }

    fn on_tls_connecting(
        &mut self,
        id: usize,
        ready: Readiness,
        cx: &mut StepCx<'_>,
    ) -> Result<(), EngineError> {
        let State::TlsConnecting {
            mut sock,
            mut session,
            since,
        } = mem::replace(&mut self.state, State::Idle)
        else {
            return Ok(());
        };

        if ready.error {
            let source = take_socket_error(&sock);
            return self.handshake_failed(id, sock, SessionError::Io(source), cx);
        }

        match session.connect(&mut sock) {
            Ok(Step::Done) => self.established(id, sock, session, cx),
            Ok(step) => {
                let want = match step {
                    Step::WantWrite => Interest::WRITABLE,
                    _ => Interest::READABLE,
                };
                set_interest(&mut sock, id, &mut self.interest, want, cx)?;
                self.state = State::TlsConnecting {
                    sock,
                    session,
                    since,
                };
                Ok(())
            }
            Err(source) => self.handshake_failed(id, sock, source, cx),
        }
    }

    fn on_handshaking(
        &mut self,
        id: usize,
        ready: Readiness,
        cx: &mut StepCx<'_>,
    ) -> Result<(), EngineError> {
        let State::Handshaking {
            mut sock,
            mut session,
        } = mem::replace(&mut self.state, State::Idle)
        else {
            return Ok(());
        };

        if ready.error {
            let source = take_socket_error(&sock);
            return self.renegotiation_failed(id, sock, SessionError::Io(source), cx);
        }

        // Some servers push application data between handshakes; discard it
        // before stepping so decrypted bytes never pile up in the session.
        if let Err(source) = session.drain(&mut sock) {
            return self.renegotiation_failed(id, sock, source, cx);
        }

        self.drive(id, sock, session, cx)
    }

    fn on_dummy_write(
        &mut self,
        id: usize,
        ready: Readiness,
        cx: &mut StepCx<'_>,
    ) -> Result<(), EngineError> {
        let State::DummyWrite { sock, session } = mem::replace(&mut self.state, State::Idle)
        else {
            return Ok(());
        };

        if ready.error || ready.hangup {
            debug!(peer = id, "Connection lost during dummy write, reconnecting");
            cx.stats.record_error();
            return self.disconnect(sock, cx);
        }

        self.dummy_write(id, sock, session, cx)
    }
}

/// Pulls the pending SO_ERROR off a socket that reported an error event.
fn take_socket_error(sock: &TcpStream) -> io::Error {
    match sock.take_error() {
        Ok(Some(e)) => e,
        Ok(None) => io::Error::other("socket reported an error event"),
        Err(e) => e,
    }
}

impl Driver for ProbePeer {
    const COUNT_LABEL: &'static str = "Handshakes";
    const RATE_UNIT: &'static str = "h/s";

    fn activate(
        &mut self,
        id: usize,
        target: &Target,
        cx: &mut StepCx<'_>,
    ) -> Result<(), EngineError> {
        match dial(target.addr) {
            Ok(mut sock) => {
                cx.poller.register(&mut sock, id, Interest::WRITABLE)?;
                self.interest = Some(Interest::WRITABLE);
                self.state = State::Connecting {
                    sock,
                    since: Instant::now(),
                };
                Ok(())
            }
            Err(source) => self.connect_failed(id, target, source, cx),
        }
    }

    fn is_active(&self) -> bool {
        !matches!(self.state, State::Idle)
    }

    fn is_established(&self) -> bool {
        matches!(
            self.state,
            State::TlsConnecting { .. } | State::Handshaking { .. } | State::DummyWrite { .. }
        )
    }

    fn wants_advance(&self) -> bool {
        self.want_next
    }

    fn advance(
        &mut self,
        id: usize,
        target: &Target,
        cx: &mut StepCx<'_>,
    ) -> Result<(), EngineError> {
        self.want_next = false;
        match self.state {
            State::Idle => self.activate(id, target, cx),
            _ => Ok(()),
        }
    }

    fn on_ready(
        &mut self,
        id: usize,
        target: &Target,
        ready: Readiness,
        cx: &mut StepCx<'_>,
    ) -> Result<(), EngineError> {
        match self.state {
            State::Idle => Ok(()),
            State::Connecting { .. } => self.on_connecting(id, target, ready, cx),
            State::TlsConnecting { .. } => self.on_tls_connecting(id, ready, cx),
            State::Handshaking { .. } => self.on_handshaking(id, ready, cx),
            State::DummyWrite { .. } => self.on_dummy_write(id, ready, cx),
        }
    }

    fn check_deadline(
        &mut self,
        id: usize,
        now: Instant,
        cx: &mut StepCx<'_>,
    ) -> Result<(), EngineError> {
        let since = match &self.state {
            State::Connecting { since, .. } | State::TlsConnecting { since, .. } => *since,
            _ => return Ok(()),
        };
        if now.duration_since(since) >= CONNECT_TIMEOUT {
            debug!(peer = id, "Connect timed out, retrying");
            cx.stats.record_error();
            self.recycle(cx)?;
        }
        Ok(())
    }

    fn shutdown(&mut self, cx: &mut StepCx<'_>) {
        if let State::Connecting { mut sock, .. }
        | State::TlsConnecting { mut sock, .. }
        | State::Handshaking { mut sock, .. }
        | State::DummyWrite { mut sock, .. } = mem::replace(&mut self.state, State::Idle)
        {
            let _ = cx.poller.deregister(&mut sock);
        }
    }
}
