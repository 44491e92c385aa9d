//! Statistics Aggregator
//!
//! One [`RunStats`] value owned by the engine and mutated only from the loop
//! thread, so there are no atomics and no locks. Attempts are counted when an
//! operation is initiated and *rolled back* when a hangup discards in-flight
//! work, so the final attempts/completions pair reflects only operations the
//! target actually saw through to a response.
//!
//! Rates are derived per epoch: roughly once a second the engine asks for a
//! report line, which also resets the epoch baseline.

use std::time::Instant;

/// Process-wide counters for one run.
#[derive(Debug)]
pub struct RunStats {
    /// Requests sent / renegotiations initiated.
    pub attempts: u64,
    /// Responses counted / renegotiations completed.
    pub completions: u64,
    /// Peer-recoverable failures.
    pub errors: u64,
    /// Successful TCP connects (including reconnects).
    pub tcp_connects: u64,
    /// Successful initial TLS handshakes.
    pub tls_connects: u64,
    epoch_start: Instant,
    epoch_completions: u64,
}

impl RunStats {
    pub fn new() -> Self {
        Self {
            attempts: 0,
            completions: 0,
            errors: 0,
            tcp_connects: 0,
            tls_connects: 0,
            epoch_start: Instant::now(),
            epoch_completions: 0,
        }
    }

    /// Records one initiated operation.
    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Records completed operations.
    pub fn record_completions(&mut self, n: u32) {
        self.completions += u64::from(n);
    }

    /// Records a peer-recoverable failure.
    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    pub fn record_tcp_connect(&mut self) {
        self.tcp_connects += 1;
    }

    pub fn record_tls_connect(&mut self) {
        self.tls_connects += 1;
    }

    /// Rolls back attempts whose responses were lost to a hangup.
    pub fn roll_back(&mut self, n: u32) {
        self.attempts = self.attempts.saturating_sub(u64::from(n));
    }

    /// Seconds elapsed in the current epoch.
    pub fn epoch_elapsed(&self, now: Instant) -> f64 {
        now.duration_since(self.epoch_start).as_secs_f64()
    }

    /// Whether the periodic report line should be flushed. Nothing is
    /// reported until the first TCP connect has succeeded.
    pub fn epoch_due(&self, now: Instant) -> bool {
        self.tcp_connects > 0 && self.epoch_elapsed(now) >= 1.0
    }

    /// Formats the periodic report line and starts a new epoch.
    ///
    /// `label`/`unit` name what a completion is for the running variant:
    /// `("Responses", "r/s")` or `("Handshakes", "h/s")`.
    pub fn epoch_line(
        &mut self,
        now: Instant,
        established: usize,
        label: &str,
        unit: &str,
    ) -> String {
        let delta = self.completions - self.epoch_completions;
        let secs = self.epoch_elapsed(now);
        let rate = if secs > 0.0 { delta as f64 / secs } else { 0.0 };
        let line = format!(
            "{label} {} [{rate:.2} {unit}], {established} Conn, {} Err",
            self.completions, self.errors
        );
        self.epoch_start = now;
        self.epoch_completions = self.completions;
        line
    }

    /// Snapshot for the end-of-run summary.
    pub fn summary(&self) -> Summary {
        Summary {
            attempts: self.attempts,
            completions: self.completions,
            errors: self.errors,
            tcp_connects: self.tcp_connects,
            tls_connects: self.tls_connects,
        }
    }
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Final counters reported when the run ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub attempts: u64,
    pub completions: u64,
    pub errors: u64,
    pub tcp_connects: u64,
    pub tls_connects: u64,
}
