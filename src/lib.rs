//! # SurgePool - A Connection-Churn Load Engine
//!
//! SurgePool opens and sustains a large number of concurrent TCP/TLS
//! connections against a single endpoint and drives each one as fast as
//! non-blocking I/O allows. It exists to answer one question: how much
//! connection and handshake churn can a server actually take?
//!
//! ## Features
//!
//! - **Two probe variants**: HTTP request/response cycling (`http://`,
//!   `https://`) and TLS handshake/key-refresh cycling (`tls://`)
//! - **Single-threaded**: one event loop over epoll/kqueue via mio, no
//!   worker threads, no locks
//! - **Slow start**: peers are dialed one at a time as earlier peers
//!   connect, never as one burst
//! - **Honest numbers**: requests lost to a hangup are rolled back out of
//!   the totals, so attempts vs. completions reflects what the target saw
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            SurgePool                             │
//! │                                                                  │
//! │  ┌────────────┐   wait()    ┌─────────────┐   events             │
//! │  │   Event    │────────────>│  Readiness  │──────────┐           │
//! │  │   Loop     │<────────────│ Multiplexer │          │           │
//! │  └─────┬──────┘             └─────────────┘          ▼           │
//! │        │ advance/dispatch                    ┌──────────────┐    │
//! │        ▼                                     │  Connection  │    │
//! │  ┌──────────────────────────────────────┐    │     Pool     │    │
//! │  │            Peer Slots                │<───│ (slow start) │    │
//! │  │  ┌────────┐ ┌────────┐ ┌────────┐    │    └──────────────┘    │
//! │  │  │Request │ │Request │ │ Probe  │    │                        │
//! │  │  │ Peer   │ │ Peer   │ │ Peer   │... │    ┌──────────────┐    │
//! │  │  └───┬────┘ └────────┘ └───┬────┘    │───>│  Statistics  │    │
//! │  └──────┼─────────────────────┼─────────┘    │  Aggregator  │    │
//! │         ▼                     ▼              └──────────────┘    │
//! │  ┌────────────┐        ┌────────────┐                            │
//! │  │  Response  │        │    TLS     │                            │
//! │  │   Parser   │        │  Session   │                            │
//! │  └────────────┘        └────────────┘                            │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use surgepool::config::RunConfig;
//! use surgepool::engine::Engine;
//! use surgepool::peer::RequestPeer;
//! use std::sync::atomic::AtomicBool;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = RunConfig::new(
//!         "http://127.0.0.1:8080/",
//!         Some(8),        // concurrency
//!         Some(10_000),   // stop after this many responses
//!         Vec::new(),     // extra header lines
//!         false,
//!         false,
//!     )?;
//!
//!     let shutdown = AtomicBool::new(false);
//!     let mut engine: Engine<RequestPeer> = Engine::new(config)?;
//!     let summary = engine.run(&shutdown)?;
//!     println!("{} of {} answered", summary.completions, summary.attempts);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`config`]: target parsing and the validated run configuration
//! - [`poller`]: readiness multiplexer over mio
//! - [`http`]: request building and response-stream counting
//! - [`session`]: non-blocking TLS session seam over rustls
//! - [`peer`]: the two per-connection state machines
//! - [`pool`]: fixed peer-slot pool with slow-start admission
//! - [`stats`]: run counters and the per-second report line
//! - [`engine`]: the event loop tying everything together
//!
//! ## Design Highlights
//!
//! ### One step, never block
//!
//! Every peer reacts to a readiness event with non-blocking I/O only; a
//! would-block result flips the registered interest and the peer waits.
//! One congested peer can never stall the loop for the others.
//!
//! ### Bootstrap failures are loud
//!
//! If the very first connect, handshake, or key refresh of a run fails,
//! the process aborts with a diagnostic instead of producing a zero-rate
//! statistics stream against a target that was never going to answer.
//! Once a thing has worked once, the same failure becomes a counted error
//! and a reconnect.
//!
//! ### Honest accounting
//!
//! A hangup rolls the peer's unanswered attempts back out of the totals
//! before reconnecting. The final summary compares attempts the target
//! answered against attempts sent, not wishful sends.

pub mod config;
pub mod engine;
pub mod http;
pub mod peer;
pub mod pool;
pub mod poller;
pub mod session;
pub mod stats;

// Re-export commonly used types for convenience
pub use config::{Protocol, RunConfig};
pub use engine::Engine;
pub use peer::{EngineError, ProbePeer, RequestPeer};
pub use stats::Summary;

/// Version of SurgePool
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
