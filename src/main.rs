//! SurgePool - A Connection-Churn Load Engine
//!
//! Entry point: parses the command line into a validated run configuration,
//! installs the SIGINT flag, and hands off to the engine variant matching
//! the target scheme.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use surgepool::config::{Protocol, RunConfig};
use surgepool::engine::Engine;
use surgepool::peer::{ProbePeer, RequestPeer};
use surgepool::stats::Summary;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Raised by the SIGINT handler; the event loop checks it once per
/// iteration.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn install_sigint() {
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
    }
}

/// Raw command-line options before validation.
struct CliArgs {
    target: Option<String>,
    concurrency: Option<usize>,
    requests: Option<u64>,
    headers: Vec<String>,
    accept: bool,
    skip_delay: bool,
}

impl CliArgs {
    /// Parse options from command-line arguments
    fn from_args() -> Self {
        let mut cli = CliArgs {
            target: None,
            concurrency: None,
            requests: None,
            headers: Vec::new(),
            accept: false,
            skip_delay: false,
        };
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--concurrency" | "-c" => {
                    cli.concurrency = Some(value_of(&args, &mut i, "--concurrency"));
                }
                "--requests" | "-n" => {
                    cli.requests = Some(value_of(&args, &mut i, "--requests"));
                }
                "--header" | "-H" => {
                    if i + 1 < args.len() {
                        cli.headers.push(args[i + 1].clone());
                        i += 2;
                    } else {
                        eprintln!("Error: --header requires a value");
                        std::process::exit(1);
                    }
                }
                "--accept" => {
                    cli.accept = true;
                    i += 1;
                }
                "--skip-delay" => {
                    cli.skip_delay = true;
                    i += 1;
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("SurgePool version {}", surgepool::VERSION);
                    std::process::exit(0);
                }
                arg if !arg.starts_with('-') && cli.target.is_none() => {
                    cli.target = Some(arg.to_string());
                    i += 1;
                }
                _ => {
                    eprintln!("Unknown argument: {}", args[i]);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        cli
    }
}

/// Consumes and parses the value following an option, exiting loudly when it
/// is missing or malformed.
fn value_of<T: std::str::FromStr>(args: &[String], i: &mut usize, name: &str) -> T {
    if *i + 1 >= args.len() {
        eprintln!("Error: {name} requires a value");
        std::process::exit(1);
    }
    let value = args[*i + 1].parse().unwrap_or_else(|_| {
        eprintln!("Error: invalid value for {name}: {}", args[*i + 1]);
        std::process::exit(1);
    });
    *i += 2;
    value
}

fn print_help() {
    println!(
        r#"
SurgePool - A Connection-Churn Load Engine

USAGE:
    surgepool [OPTIONS] <TARGET>

TARGET:
    http://host[:port]/path     HTTP request/response cycling  (port 80)
    https://host[:port]/path    HTTPS request/response cycling (port 443)
    tls://host[:port]           TLS handshake/key-refresh probe (port 443)

OPTIONS:
    -c, --concurrency <N>    Simultaneous connections
                             (default: 1 for http/https, 400 for tls)
    -n, --requests <N>       Stop after N completed operations
    -H, --header <LINE>      Extra header line appended to every request
                             (repeatable)
        --accept             Confirm you are authorized to load-test the
                             target (required for tls://)
        --skip-delay         Skip the 15-second warm-up pause (tls://)
    -v, --version            Print version information
        --help               Print this help message

EXAMPLES:
    surgepool -n 1000 http://127.0.0.1:8080/
    surgepool -c 8 -H "Accept: */*" https://staging.example.com/health
    surgepool --accept -c 400 tls://staging.example.com

Only point this at servers you own or are authorized to test. A run at
default tls:// concurrency is enough to degrade a production box.
"#
    );
}

/// Interactive pause before the handshake probe starts, giving the operator
/// a window to abort. Returns false when the operator did.
fn warm_up() -> anyhow::Result<bool> {
    print!("Starting in 15 seconds (Ctrl+C to abort, --skip-delay to skip)");
    std::io::stdout().flush()?;
    for _ in 0..15 {
        if SHUTDOWN.load(Ordering::Relaxed) {
            println!(" aborted.");
            return Ok(false);
        }
        std::thread::sleep(Duration::from_secs(1));
        print!(".");
        std::io::stdout().flush()?;
    }
    println!();
    Ok(true)
}

fn print_summary(summary: &Summary, label: &str) {
    println!(
        "Done. {} of {} {} completed, {} connects, {} errors.",
        summary.completions, summary.attempts, label, summary.tcp_connects, summary.errors
    );
}

fn main() -> anyhow::Result<()> {
    let cli = CliArgs::from_args();

    let _subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let Some(target) = cli.target else {
        eprintln!("Error: no target given");
        print_help();
        std::process::exit(1);
    };

    let config = RunConfig::new(
        &target,
        cli.concurrency,
        cli.requests,
        cli.headers,
        cli.accept,
        cli.skip_delay,
    )
    .context("invalid run configuration")?;

    if config.endpoint.protocol == Protocol::Tls && !config.accepted {
        eprintln!(
            "The tls:// probe drives sustained handshake load that can degrade or\n\
             take down the target. Run it only against servers you own or are\n\
             explicitly authorized to test, and pass --accept to confirm."
        );
        std::process::exit(1);
    }

    install_sigint();

    if config.endpoint.protocol == Protocol::Tls && !config.skip_delay && !warm_up()? {
        return Ok(());
    }

    match config.endpoint.protocol {
        Protocol::Http | Protocol::Https => {
            let mut engine: Engine<RequestPeer> =
                Engine::new(config).context("engine setup failed")?;
            let summary = engine.run(&SHUTDOWN).context("run failed")?;
            print_summary(&summary, "requests");
        }
        Protocol::Tls => {
            let mut engine: Engine<ProbePeer> =
                Engine::new(config).context("engine setup failed")?;
            let summary = engine.run(&SHUTDOWN).context("run failed")?;
            print_summary(&summary, "key refreshes");
        }
    }

    Ok(())
}
