//! Request/Response Peer
//!
//! Drives one connection through `Connecting → [Handshaking] → Ready ⇄
//! Awaiting`: connect, optionally handshake TLS (for `https://` targets),
//! send the prebuilt request, then count framed responses off the wire until
//! the remote hangs up, at which point the slot recycles and reconnects.
//!
//! A request is only sent while nothing is outstanding (`pending == 0`) and
//! the run's attempt budget has room. A hangup rolls the in-flight attempts
//! back out of the statistics before reconnecting, so the final totals only
//! reflect requests the target actually answered.

use std::io::{self, Read, Write};
use std::mem;
use std::time::Instant;

use mio::net::TcpStream;
use mio::Interest;
use tracing::{debug, trace};

use crate::http::{scan_responses, TransferMode};
use crate::session::{ReadOutcome, Session, SessionError, Step};

use super::{
    connect_finished, dial, set_interest, Driver, EngineError, StepCx, Target, CONNECT_TIMEOUT,
};

enum State {
    /// No socket; waiting to be (re)activated.
    Idle,
    /// Non-blocking connect in flight.
    Connecting { sock: TcpStream, since: Instant },
    /// TLS handshake in flight (`https://` targets only).
    Handshaking {
        sock: TcpStream,
        session: Box<dyn Session>,
        since: Instant,
    },
    /// Established, nothing outstanding; may send.
    Ready {
        sock: TcpStream,
        session: Option<Box<dyn Session>>,
    },
    /// Request sent; counting response bytes.
    Awaiting {
        sock: TcpStream,
        session: Option<Box<dyn Session>>,
    },
}

/// One request/response connection slot.
pub struct RequestPeer {
    state: State,
    /// Requests sent but not yet answered. Never negative by construction;
    /// only completed responses decrement it.
    pending: u32,
    /// Body framing carried across reads.
    mode: TransferMode,
    /// Bytes of the request already written (plain-TCP partial sends).
    sent: usize,
    /// TLS records queued in the session but not yet flushed.
    needs_flush: bool,
    interest: Option<Interest>,
    want_next: bool,
}

impl Default for RequestPeer {
    fn default() -> Self {
        Self {
            state: State::Idle,
            pending: 0,
            mode: TransferMode::Unknown,
            sent: 0,
            needs_flush: false,
            interest: None,
            want_next: false,
        }
    }
}

impl RequestPeer {
    /// Tears the connection down and marks the slot for redial. Rolls the
    /// unanswered attempts back out of the totals.
    fn disconnect(&mut self, mut sock: TcpStream, cx: &mut StepCx<'_>) -> Result<(), EngineError> {
        cx.poller.deregister(&mut sock)?;
        cx.stats.roll_back(self.pending);
        self.pending = 0;
        self.mode = TransferMode::Unknown;
        self.sent = 0;
        self.needs_flush = false;
        self.interest = None;
        self.state = State::Idle;
        self.want_next = true;
        Ok(())
    }

    /// Recycles from whatever state currently holds the socket.
    fn recycle(&mut self, cx: &mut StepCx<'_>) -> Result<(), EngineError> {
        match mem::replace(&mut self.state, State::Idle) {
            State::Idle => Ok(()),
            State::Connecting { sock, .. }
            | State::Handshaking { sock, .. }
            | State::Ready { sock, .. }
            | State::Awaiting { sock, .. } => self.disconnect(sock, cx),
        }
    }

    /// Remote closed on us: count the error, roll back, reconnect.
    fn hangup(
        &mut self,
        id: usize,
        sock: TcpStream,
        cx: &mut StepCx<'_>,
    ) -> Result<(), EngineError> {
        debug!(peer = id, rolled_back = self.pending, "Remote hung up, reconnecting");
        cx.stats.record_error();
        self.disconnect(sock, cx)
    }

    /// A connect that failed outright. Fatal only for the very first one of
    /// the whole run.
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

    fn attempts_exhausted(target: &Target, cx: &StepCx<'_>) -> bool {
        target
            .attempt_limit
            .is_some_and(|limit| cx.stats.attempts >= limit)
    }

    fn on_connecting(
        &mut self,
        id: usize,
        target: &Target,
        ready: crate::poller::Readiness,
        cx: &mut StepCx<'_>,
    ) -> Result<(), EngineError> {
        let State::Connecting { mut sock, since } = mem::replace(&mut self.state, State::Idle)
        else {
            return Ok(());
        };

        if ready.error || ready.hangup {
            let source = sock
                .take_error()
                .ok()
                .flatten()
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"));
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
                match &target.tls {
                    None => {
                        self.state = State::Ready {
                            sock,
                            session: None,
                        };
                        self.try_send(id, target, cx)
                    }
                    Some(tls) => {
                        let mut session: Box<dyn Session> = Box::new(tls.open()?);
                        match session.connect(&mut sock) {
                            Ok(Step::Done) => {
                                cx.stats.record_tls_connect();
                                self.state = State::Ready {
                                    sock,
                                    session: Some(session),
                                };
                                self.try_send(id, target, cx)
                            }
                            Ok(step) => {
                                let want = match step {
                                    Step::WantWrite => Interest::WRITABLE,
                                    _ => Interest::READABLE,
                                };
                                set_interest(&mut sock, id, &mut self.interest, want, cx)?;
                                self.state = State::Handshaking {
                                    sock,
                                    session,
                                    since: Instant::now(),
                                };
                                Ok(())
                            }
                            Err(source) => self.handshake_failed(id, sock, source, cx),
                        }
                    }
                }
            }
        }
    }

    /// A failed initial TLS handshake. Fatal until one has ever succeeded.
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

    fn on_handshaking(
        &mut self,
        id: usize,
        target: &Target,
        ready: crate::poller::Readiness,
        cx: &mut StepCx<'_>,
    ) -> Result<(), EngineError> {
        let State::Handshaking {
            mut sock,
            mut session,
            since,
        } = mem::replace(&mut self.state, State::Idle)
        else {
            return Ok(());
        };

        if ready.error {
            let source = socket_error(&sock);
            return Err(EngineError::Socket { id, source });
        }

        match session.connect(&mut sock) {
            Ok(Step::Done) => {
                trace!(peer = id, "TLS handshake complete");
                cx.stats.record_tls_connect();
                self.state = State::Ready {
                    sock,
                    session: Some(session),
                };
                self.try_send(id, target, cx)
            }
            Ok(step) => {
                let want = match step {
                    Step::WantWrite => Interest::WRITABLE,
                    _ => Interest::READABLE,
                };
                set_interest(&mut sock, id, &mut self.interest, want, cx)?;
                self.state = State::Handshaking {
                    sock,
                    session,
                    since,
                };
                Ok(())
            }
            Err(source) => self.handshake_failed(id, sock, source, cx),
        }
    }

    /// Sends (or continues sending) the request if the gate allows it:
    /// nothing outstanding and budget left.
    fn try_send(
        &mut self,
        id: usize,
        target: &Target,
        cx: &mut StepCx<'_>,
    ) -> Result<(), EngineError> {
        let (mut sock, mut session) = match mem::replace(&mut self.state, State::Idle) {
            State::Ready { sock, session } => (sock, session),
            other => {
                self.state = other;
                return Ok(());
            }
        };

        if self.sent == 0 && Self::attempts_exhausted(target, cx) {
            // Budget spent. Park readable so a hangup still gets noticed.
            set_interest(&mut sock, id, &mut self.interest, Interest::READABLE, cx)?;
            self.state = State::Ready { sock, session };
            return Ok(());
        }

        match &mut session {
            None => loop {
                match sock.write(&target.request[self.sent..]) {
                    Ok(0) => {
                        return self.hangup(id, sock, cx);
                    }
                    Ok(n) => {
                        self.sent += n;
                        if self.sent == target.request.len() {
                            self.sent = 0;
                            self.pending += 1;
                            cx.stats.record_attempt();
                            trace!(peer = id, "Request sent");
                            set_interest(&mut sock, id, &mut self.interest, Interest::READABLE, cx)?;
                            self.state = State::Awaiting { sock, session };
                            return Ok(());
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        set_interest(&mut sock, id, &mut self.interest, Interest::WRITABLE, cx)?;
                        self.state = State::Ready { sock, session };
                        return Ok(());
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        debug!(peer = id, error = %e, "Write failed, reconnecting");
                        cx.stats.record_error();
                        return self.disconnect(sock, cx);
                    }
                }
            },
            Some(session_ref) => match session_ref.write(&mut sock, &target.request) {
                Ok(step) => {
                    self.pending += 1;
                    cx.stats.record_attempt();
                    trace!(peer = id, "Request sent");
                    let want = if matches!(step, Step::WantWrite) {
                        self.needs_flush = true;
                        Interest::READABLE | Interest::WRITABLE
                    } else {
                        self.needs_flush = false;
                        Interest::READABLE
                    };
                    set_interest(&mut sock, id, &mut self.interest, want, cx)?;
                    self.state = State::Awaiting { sock, session };
                    Ok(())
                }
                Err(e) => {
                    debug!(peer = id, error = %e, "TLS write failed, reconnecting");
                    cx.stats.record_error();
                    self.disconnect(sock, cx)
                }
            },
        }
    }

    fn on_awaiting(
        &mut self,
        id: usize,
        target: &Target,
        ready: crate::poller::Readiness,
        cx: &mut StepCx<'_>,
    ) -> Result<(), EngineError> {
        let (mut sock, mut session) = match mem::replace(&mut self.state, State::Idle) {
            State::Awaiting { sock, session } => (sock, session),
            other => {
                self.state = other;
                return Ok(());
            }
        };

        if ready.error {
            let source = socket_error(&sock);
            return Err(EngineError::Socket { id, source });
        }

        if ready.writable && self.needs_flush {
            if let Some(session_ref) = &mut session {
                match session_ref.write(&mut sock, &[]) {
                    Ok(Step::Done) => {
                        self.needs_flush = false;
                        set_interest(&mut sock, id, &mut self.interest, Interest::READABLE, cx)?;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(peer = id, error = %e, "TLS flush failed, reconnecting");
                        cx.stats.record_error();
                        return self.disconnect(sock, cx);
                    }
                }
            }
        }

        if !(ready.readable || ready.hangup) {
            self.state = State::Awaiting { sock, session };
            return Ok(());
        }

        // Edge-triggered contract: read until the socket would block.
        loop {
            let read = match &mut session {
                None => match sock.read(cx.scratch) {
                    Ok(0) => ReadOutcome::Closed,
                    Ok(n) => ReadOutcome::Data(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => ReadOutcome::WouldBlock,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!(peer = id, error = %e, "Read failed, reconnecting");
                        cx.stats.record_error();
                        return self.disconnect(sock, cx);
                    }
                },
                Some(session_ref) => match session_ref.read(&mut sock, cx.scratch) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        debug!(peer = id, error = %e, "TLS read failed, reconnecting");
                        cx.stats.record_error();
                        return self.disconnect(sock, cx);
                    }
                },
            };

            match read {
                ReadOutcome::WouldBlock => break,
                ReadOutcome::Closed => return self.hangup(id, sock, cx),
                ReadOutcome::Data(n) => {
                    if n == cx.scratch.len() {
                        return Err(EngineError::BufferOverflow { id });
                    }
                    let scan = scan_responses(&cx.scratch[..n], self.mode)
                        .map_err(|source| EngineError::Parse { id, source })?;
                    self.mode = scan.mode;
                    if scan.completed > 0 {
                        self.pending = self.pending.saturating_sub(scan.completed);
                        cx.stats.record_completions(scan.completed);
                        trace!(peer = id, completed = scan.completed, "Responses counted");
                    }
                }
            }
        }

        if self.pending == 0 {
            // Answered in full; queue the next request for the loop top.
            self.want_next = true;
            self.state = State::Ready { sock, session };
        } else {
            self.state = State::Awaiting { sock, session };
        }
        Ok(())
    }
}

/// Pulls the pending SO_ERROR off a socket that reported an error event.
fn socket_error(sock: &TcpStream) -> io::Error {
    match sock.take_error() {
        Ok(Some(e)) => e,
        Ok(None) => io::Error::other("socket reported an error event"),
        Err(e) => e,
    }
}

impl Driver for RequestPeer {
    const COUNT_LABEL: &'static str = "Responses";
    const RATE_UNIT: &'static str = "r/s";

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
            State::Handshaking { .. } | State::Ready { .. } | State::Awaiting { .. }
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
            State::Ready { .. } => self.try_send(id, target, cx),
            _ => Ok(()),
        }
    }

    fn on_ready(
        &mut self,
        id: usize,
        target: &Target,
        ready: crate::poller::Readiness,
        cx: &mut StepCx<'_>,
    ) -> Result<(), EngineError> {
        match self.state {
            State::Idle => Ok(()),
            State::Connecting { .. } => self.on_connecting(id, target, ready, cx),
            State::Handshaking { .. } => self.on_handshaking(id, target, ready, cx),
            State::Ready { .. } => {
                if ready.hangup {
                    let (sock, _session) = match mem::replace(&mut self.state, State::Idle) {
                        State::Ready { sock, session } => (sock, session),
                        other => {
                            self.state = other;
                            return Ok(());
                        }
                    };
                    self.hangup(id, sock, cx)
                } else if ready.error {
                    Err(EngineError::Socket {
                        id,
                        source: match &self.state {
                            State::Ready { sock, .. } => socket_error(sock),
                            _ => io::Error::other("socket reported an error event"),
                        },
                    })
                } else {
                    self.try_send(id, target, cx)
                }
            }
            State::Awaiting { .. } => self.on_awaiting(id, target, ready, cx),
        }
    }

    fn check_deadline(
        &mut self,
        id: usize,
        now: Instant,
        cx: &mut StepCx<'_>,
    ) -> Result<(), EngineError> {
        let since = match &self.state {
            State::Connecting { since, .. } | State::Handshaking { since, .. } => *since,
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
        | State::Handshaking { mut sock, .. }
        | State::Ready { mut sock, .. }
        | State::Awaiting { mut sock, .. } = mem::replace(&mut self.state, State::Idle)
        {
            let _ = cx.poller.deregister(&mut sock);
        }
    }
}
