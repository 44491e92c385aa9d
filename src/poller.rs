//! Readiness Multiplexer
//!
//! Thin wrapper around `mio::Poll` that ties each registered socket to a peer
//! slot index (the `mio::Token`) and flattens mio's event flags into a small
//! [`Readiness`] value the state machines can match on.
//!
//! mio's epoll/kqueue backends deliver edge-triggered notifications: once a
//! socket is reported ready, it is not reported again until an I/O attempt on
//! it returns `WouldBlock`. The peer state machines are written around that
//! contract.
//!
//! ## Descriptor reuse discipline
//!
//! A socket must be deregistered here *before* its descriptor is closed.
//! Closing first can leave a stale registration that delivers events against
//! whatever descriptor the OS hands out next. `Poller` only provides the
//! primitives; the ordering lives in the peers' disconnect paths.

use std::io::ErrorKind;
use std::time::Duration;

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use thiserror::Error;
use tracing::trace;

/// Default capacity of the event buffer handed to the OS per wait.
const EVENT_CAPACITY: usize = 64;

/// Flattened readiness state for one peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// Remote closed its write half (RDHUP-style).
    pub hangup: bool,
    /// Error condition reported alongside readiness.
    pub error: bool,
}

/// Errors from the multiplexer. All of them are fatal to the run.
#[derive(Debug, Error)]
pub enum PollerError {
    #[error("failed to create the poll instance: {0}")]
    Create(std::io::Error),

    #[error("failed to register peer #{id}: {source}")]
    Register { id: usize, source: std::io::Error },

    #[error("failed to reregister peer #{id}: {source}")]
    Reregister { id: usize, source: std::io::Error },

    #[error("failed to deregister a socket: {0}")]
    Deregister(std::io::Error),

    #[error("wait failed: {0}")]
    Wait(std::io::Error),
}

/// Wraps the platform readiness mechanism behind register/modify/wait.
pub struct Poller {
    poll: Poll,
    events: Events,
}

impl Poller {
    pub fn new() -> Result<Self, PollerError> {
        Ok(Self {
            poll: Poll::new().map_err(PollerError::Create)?,
            events: Events::with_capacity(EVENT_CAPACITY),
        })
    }

    /// Registers a socket under the given peer slot index.
    pub fn register(
        &mut self,
        stream: &mut TcpStream,
        id: usize,
        interest: Interest,
    ) -> Result<(), PollerError> {
        self.poll
            .registry()
            .register(stream, Token(id), interest)
            .map_err(|source| PollerError::Register { id, source })
    }

    /// Changes the registered interest for an already-registered socket.
    pub fn reregister(
        &mut self,
        stream: &mut TcpStream,
        id: usize,
        interest: Interest,
    ) -> Result<(), PollerError> {
        trace!(peer = id, ?interest, "Reregistering interest");
        self.poll
            .registry()
            .reregister(stream, Token(id), interest)
            .map_err(|source| PollerError::Reregister { id, source })
    }

    /// Removes a socket from the multiplexer. Must happen before the socket
    /// is closed.
    pub fn deregister(&mut self, stream: &mut TcpStream) -> Result<(), PollerError> {
        self.poll
            .registry()
            .deregister(stream)
            .map_err(PollerError::Deregister)
    }

    /// Blocks up to `timeout` and returns the ready peers.
    ///
    /// An interrupted wait returns an empty set so the caller's loop simply
    /// comes back around; every other failure is fatal.
    pub fn wait(&mut self, timeout: Duration) -> Result<Vec<(usize, Readiness)>, PollerError> {
        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            if e.kind() == ErrorKind::Interrupted {
                trace!("Wait interrupted, resuming the loop");
                return Ok(Vec::new());
            }
            return Err(PollerError::Wait(e));
        }

        let mut ready = Vec::with_capacity(self.events.iter().count());
        for event in self.events.iter() {
            let Token(id) = event.token();
            ready.push((
                id,
                Readiness {
                    readable: event.is_readable(),
                    writable: event.is_writable(),
                    hangup: event.is_read_closed(),
                    error: event.is_error(),
                },
            ));
        }
        Ok(ready)
    }
}
