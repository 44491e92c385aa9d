//! Connection Pool
//!
//! Owns the fixed array of peer slots and the slow-start admission policy:
//! slots are dialed one at a time, each admission gated on an earlier peer
//! completing its first TCP connect, so a run at high concurrency never
//! bursts hundreds of simultaneous connects at the target. Peers signal a
//! completed connect through [`StepCx::admit`]; the pool consumes the flag
//! and dials the next slot.
//!
//! Slots are allocated once and recycled forever; the slot index doubles as
//! the multiplexer token for the slot's current socket.

use std::time::Instant;

use tracing::debug;

use crate::peer::{Driver, EngineError, StepCx, Target};
use crate::poller::Readiness;

pub struct Pool<D: Driver> {
    peers: Vec<D>,
    /// Slots dialed so far; only ever grows, up to the configured
    /// concurrency.
    admitted: usize,
}

impl<D: Driver> Pool<D> {
    pub fn new(concurrency: usize) -> Self {
        Self {
            peers: (0..concurrency).map(|_| D::default()).collect(),
            admitted: 0,
        }
    }

    /// Dials the first slot. The rest follow through slow start.
    pub fn start(&mut self, target: &Target, cx: &mut StepCx<'_>) -> Result<(), EngineError> {
        self.admitted = 1;
        self.peers[0].activate(0, target, cx)
    }

    /// Dials the next slot if any remain unadmitted.
    fn admit_next(&mut self, target: &Target, cx: &mut StepCx<'_>) -> Result<(), EngineError> {
        if self.admitted < self.peers.len() {
            let id = self.admitted;
            self.admitted += 1;
            debug!(peer = id, admitted = self.admitted, "Admitting next peer");
            self.peers[id].activate(id, target, cx)?;
        }
        Ok(())
    }

    /// Consumes a pending admit signal, if a peer raised one.
    fn reap_admit(&mut self, target: &Target, cx: &mut StepCx<'_>) -> Result<(), EngineError> {
        if cx.admit {
            cx.admit = false;
            self.admit_next(target, cx)?;
        }
        Ok(())
    }

    /// Runs the deferred step of every peer that asked for one.
    pub fn advance_all(&mut self, target: &Target, cx: &mut StepCx<'_>) -> Result<(), EngineError> {
        for id in 0..self.admitted {
            if self.peers[id].wants_advance() {
                self.peers[id].advance(id, target, cx)?;
                self.reap_admit(target, cx)?;
            }
        }
        Ok(())
    }

    /// Routes one readiness event to its peer. Events for slots that were
    /// recycled since the wait are dropped.
    pub fn dispatch(
        &mut self,
        id: usize,
        target: &Target,
        ready: Readiness,
        cx: &mut StepCx<'_>,
    ) -> Result<(), EngineError> {
        if id >= self.peers.len() {
            return Ok(());
        }
        self.peers[id].on_ready(id, target, ready, cx)?;
        self.reap_admit(target, cx)
    }

    /// Recycles peers stuck in connect/handshake past the timeout.
    pub fn check_deadlines(&mut self, now: Instant, cx: &mut StepCx<'_>) -> Result<(), EngineError> {
        for id in 0..self.admitted {
            self.peers[id].check_deadline(id, now, cx)?;
        }
        Ok(())
    }

    /// Established connections, for the statistics line.
    pub fn established(&self) -> usize {
        self.peers.iter().filter(|p| p.is_established()).count()
    }

    /// Releases every socket at run end.
    pub fn shutdown(&mut self, cx: &mut StepCx<'_>) {
        for peer in &mut self.peers {
            peer.shutdown(cx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::Poller;
    use crate::stats::RunStats;
    use bytes::Bytes;

    /// Driver stub that records activations and treats every readiness event
    /// as a completed first connect.
    #[derive(Default)]
    struct MockDriver {
        activated: bool,
        connected: bool,
    }

    impl Driver for MockDriver {
        const COUNT_LABEL: &'static str = "Mocks";
        const RATE_UNIT: &'static str = "m/s";

        fn activate(
            &mut self,
            _id: usize,
            _target: &Target,
            _cx: &mut StepCx<'_>,
        ) -> Result<(), EngineError> {
            self.activated = true;
            Ok(())
        }

        fn is_active(&self) -> bool {
            self.activated
        }

        fn is_established(&self) -> bool {
            self.connected
        }

        fn wants_advance(&self) -> bool {
            false
        }

        fn advance(
            &mut self,
            _id: usize,
            _target: &Target,
            _cx: &mut StepCx<'_>,
        ) -> Result<(), EngineError> {
            Ok(())
        }

        fn on_ready(
            &mut self,
            _id: usize,
            _target: &Target,
            _ready: Readiness,
            cx: &mut StepCx<'_>,
        ) -> Result<(), EngineError> {
            if !self.connected {
                self.connected = true;
                cx.admit = true;
            }
            Ok(())
        }

        fn check_deadline(
            &mut self,
            _id: usize,
            _now: Instant,
            _cx: &mut StepCx<'_>,
        ) -> Result<(), EngineError> {
            Ok(())
        }

        fn shutdown(&mut self, _cx: &mut StepCx<'_>) {
            self.activated = false;
        }
    }

    fn target() -> Target {
        Target {
            addr: "127.0.0.1:1".parse().unwrap(),
            host: "t".to_string(),
            request: Bytes::new(),
            tls: None,
            attempt_limit: None,
        }
    }

    #[test]
    fn test_slow_start_admits_one_peer_per_connect() {
        let tgt = target();
        let mut poller = Poller::new().unwrap();
        let mut stats = RunStats::new();
        let mut scratch = vec![0u8; 16];
        let mut pool: Pool<MockDriver> = Pool::new(5);

        let mut cx = StepCx {
            poller: &mut poller,
            stats: &mut stats,
            scratch: &mut scratch,
            admit: false,
        };
        pool.start(&tgt, &mut cx).unwrap();
        let dialed = |pool: &Pool<MockDriver>| pool.peers.iter().filter(|p| p.activated).count();
        assert_eq!(dialed(&pool), 1);

        // Each first connect admits exactly one more slot.
        for expected in 2..=5 {
            let connecting = expected - 2;
            pool.dispatch(connecting, &tgt, Readiness::default(), &mut cx)
                .unwrap();
            assert_eq!(dialed(&pool), expected);
        }

        // A fifth connect has nobody left to admit.
        pool.dispatch(4, &tgt, Readiness::default(), &mut cx).unwrap();
        assert_eq!(dialed(&pool), 5);

        // Reconnects of already-counted peers admit nothing either.
        pool.peers[0].connected = false;
        pool.dispatch(0, &tgt, Readiness::default(), &mut cx).unwrap();
        assert_eq!(dialed(&pool), 5);
    }

    #[test]
    fn test_stale_token_is_ignored() {
        let tgt = target();
        let mut poller = Poller::new().unwrap();
        let mut stats = RunStats::new();
        let mut scratch = vec![0u8; 16];
        let mut pool: Pool<MockDriver> = Pool::new(2);

        let mut cx = StepCx {
            poller: &mut poller,
            stats: &mut stats,
            scratch: &mut scratch,
            admit: false,
        };
        pool.start(&tgt, &mut cx).unwrap();
        pool.dispatch(99, &tgt, Readiness::default(), &mut cx)
            .unwrap();
        assert_eq!(pool.established(), 0);
    }

    #[test]
    fn test_established_counts_connected_peers() {
        let mut pool: Pool<MockDriver> = Pool::new(3);
        pool.peers[0].connected = true;
        pool.peers[2].connected = true;
        assert_eq!(pool.established(), 2);
    }
}
