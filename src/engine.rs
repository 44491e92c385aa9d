//! Event Loop
//!
//! Single-threaded driver for one run: wait on the multiplexer, hand ready
//! events to the pool, flush the statistics line roughly once a second, and
//! terminate when the completion limit is reached or the shutdown flag is
//! raised. No step in the loop blocks except the bounded wait itself, which
//! doubles as the statistics timer.
//!
//! Loop order per iteration:
//!
//! 1. check termination (shutdown flag, completion limit)
//! 2. run the deferred steps peers queued last iteration
//! 3. bounded wait for readiness
//! 4. flush the statistics epoch if due
//! 5. sweep connect timeouts
//! 6. dispatch every ready event
//!
//! Fatal errors propagate out of the loop; cleanup (socket release, final
//! summary) still runs on the way down in `main`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::{Protocol, RunConfig};
use crate::http::build_request;
use crate::peer::{Driver, EngineError, StepCx, Target, READ_BUF_SIZE};
use crate::pool::Pool;
use crate::poller::Poller;
use crate::session::TlsClient;
use crate::stats::{RunStats, Summary};

/// Bound on the multiplexer wait; also the statistics flush cadence.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// One run of the engine, generic over the peer variant.
pub struct Engine<D: Driver> {
    config: RunConfig,
    target: Target,
    pool: Pool<D>,
    poller: Poller,
    stats: RunStats,
    scratch: Vec<u8>,
}

impl<D: Driver> Engine<D> {
    /// Resolves the target and prepares the pool. No sockets are opened yet.
    pub fn new(config: RunConfig) -> Result<Self, EngineError> {
        let addr = config.endpoint.resolve()?;
        let tls = match config.endpoint.protocol {
            Protocol::Http => None,
            Protocol::Https | Protocol::Tls => {
                Some(Arc::new(TlsClient::new(&config.endpoint.host)?))
            }
        };
        let target = Target {
            addr,
            host: config.endpoint.host.clone(),
            request: build_request(&config.endpoint, &config.headers),
            tls,
            attempt_limit: config.request_limit,
        };
        info!(
            endpoint = %format!("{}:{}", config.endpoint.host, config.endpoint.port),
            addr = %addr,
            concurrency = config.concurrency,
            "Engine ready"
        );
        Ok(Self {
            pool: Pool::new(config.concurrency),
            poller: Poller::new()?,
            stats: RunStats::new(),
            scratch: vec![0u8; READ_BUF_SIZE],
            target,
            config,
        })
    }

    /// Runs until the completion limit is reached, `shutdown` is raised, or
    /// a fatal error occurs. Returns the final counters.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<Summary, EngineError> {
        {
            let mut cx = StepCx {
                poller: &mut self.poller,
                stats: &mut self.stats,
                scratch: &mut self.scratch,
                admit: false,
            };
            self.pool.start(&self.target, &mut cx)?;
        }

        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("Interrupted, shutting down");
                break;
            }
            if let Some(limit) = self.config.request_limit {
                if self.stats.completions >= limit {
                    debug!(limit, "Completion limit reached");
                    break;
                }
            }

            {
                let mut cx = StepCx {
                    poller: &mut self.poller,
                    stats: &mut self.stats,
                    scratch: &mut self.scratch,
                    admit: false,
                };
                self.pool.advance_all(&self.target, &mut cx)?;
            }

            let ready = self.poller.wait(POLL_TIMEOUT)?;
            let now = Instant::now();

            if self.stats.epoch_due(now) {
                let line = self.stats.epoch_line(
                    now,
                    self.pool.established(),
                    D::COUNT_LABEL,
                    D::RATE_UNIT,
                );
                println!("{line}");
            }

            let mut cx = StepCx {
                poller: &mut self.poller,
                stats: &mut self.stats,
                scratch: &mut self.scratch,
                admit: false,
            };
            self.pool.check_deadlines(now, &mut cx)?;
            for (id, readiness) in ready {
                self.pool.dispatch(id, &self.target, readiness, &mut cx)?;
            }
        }

        let mut cx = StepCx {
            poller: &mut self.poller,
            stats: &mut self.stats,
            scratch: &mut self.scratch,
            admit: false,
        };
        self.pool.shutdown(&mut cx);
        Ok(self.stats.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::RequestPeer;
    use std::net::TcpListener;

    fn config(target: &str) -> RunConfig {
        RunConfig::new(target, Some(1), Some(1), Vec::new(), false, false).unwrap()
    }

    #[test]
    fn test_preraised_shutdown_stops_before_any_attempt() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let cfg = config(&format!("http://127.0.0.1:{}/", addr.port()));
        let mut engine: Engine<RequestPeer> = Engine::new(cfg).unwrap();

        let shutdown = AtomicBool::new(true);
        let summary = engine.run(&shutdown).unwrap();
        assert_eq!(summary.attempts, 0);
        assert_eq!(summary.completions, 0);
    }

    #[test]
    fn test_unresolvable_host_is_a_config_error() {
        let cfg = config("http://host.invalid./");
        assert!(matches!(
            Engine::<RequestPeer>::new(cfg),
            Err(EngineError::Config(_))
        ));
    }

    use crate::peer::ProbePeer;
    use std::io::{Read, Write};

    /// Keep-alive HTTP server: answers every request on an accepted
    /// connection until the client goes away, then accepts the next.
    fn http_server(listener: TcpListener) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            for conn in listener.incoming() {
                let Ok(mut conn) = conn else { return };
                let mut buf = [0u8; 2048];
                loop {
                    match conn.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            if conn
                                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                }
            }
        })
    }

    #[test]
    fn test_request_limit_bounds_the_run_exactly() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = http_server(listener);

        let cfg = RunConfig::new(
            &format!("http://127.0.0.1:{}/", addr.port()),
            Some(1),
            Some(3),
            Vec::new(),
            false,
            false,
        )
        .unwrap();
        let mut engine: Engine<RequestPeer> = Engine::new(cfg).unwrap();
        let summary = engine.run(&AtomicBool::new(false)).unwrap();

        assert_eq!(summary.attempts, 3);
        assert_eq!(summary.completions, 3);
        assert_eq!(summary.errors, 0);
    }

    #[test]
    fn test_reconnects_across_a_server_that_closes_per_request() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            // Two accepted connections, one response each, both closed
            // right after the response.
            for _ in 0..2 {
                let (mut conn, _) = listener.accept().unwrap();
                let mut buf = [0u8; 2048];
                let _ = conn.read(&mut buf).unwrap();
                conn.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                    .unwrap();
            }
        });

        let cfg = RunConfig::new(
            &format!("http://127.0.0.1:{}/", addr.port()),
            Some(1),
            Some(2),
            Vec::new(),
            false,
            false,
        )
        .unwrap();
        let mut engine: Engine<RequestPeer> = Engine::new(cfg).unwrap();
        let summary = engine.run(&AtomicBool::new(false)).unwrap();

        // Whatever was lost to the hangup got rolled back; the totals only
        // reflect answered requests.
        assert_eq!(summary.completions, 2);
        assert_eq!(summary.attempts, 2);
        server.join().unwrap();
    }

    #[test]
    fn test_chunked_responses_are_counted() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 2048];
            let _ = conn.read(&mut buf).unwrap();
            conn.write_all(
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n",
            )
            .unwrap();
            // Terminal marker held back to force a mid-body read boundary.
            std::thread::sleep(Duration::from_millis(50));
            conn.write_all(b"0\r\n\r\n").unwrap();
            let _ = conn.read(&mut buf);
        });

        let cfg = RunConfig::new(
            &format!("http://127.0.0.1:{}/", addr.port()),
            Some(1),
            Some(1),
            Vec::new(),
            false,
            false,
        )
        .unwrap();
        let mut engine: Engine<RequestPeer> = Engine::new(cfg).unwrap();
        let summary = engine.run(&AtomicBool::new(false)).unwrap();

        assert_eq!(summary.completions, 1);
        server.join().unwrap();
    }

    #[test]
    fn test_probe_against_non_tls_server_aborts() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 2048];
            let _ = conn.read(&mut buf);
            // Anything but a ServerHello.
            let _ = conn.write_all(b"220 smtp.example ESMTP\r\n");
        });

        let cfg = RunConfig::new(
            &format!("tls://127.0.0.1:{}", addr.port()),
            Some(1),
            None,
            Vec::new(),
            true,
            true,
        )
        .unwrap();
        let mut engine: Engine<ProbePeer> = Engine::new(cfg).unwrap();
        let err = engine.run(&AtomicBool::new(false)).unwrap_err();
        assert!(matches!(err, EngineError::NotTls { .. }));
        server.join().unwrap();
    }
}
