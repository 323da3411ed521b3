//! Echo load-test client binary entry point.
//!
//! # Usage
//!
//! ```bash
//! # Ten sessions against a local server, three connects per batch,
//! # half a second between batches, stop after 30 seconds
//! cargo run -p echokit-client -- \
//!   --host 127.0.0.1 --port 7777 \
//!   --sessions 10 --batch-size 3 --batch-interval 500 --time 30
//! ```

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use echokit_core::Executor;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod driver;
mod session;

use session::{ClientConfig, ClientSession};

/// Echo load-test client
///
/// Opens batches of connections against an echo server and keeps a block
/// of payload bouncing on each until the test duration elapses.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server host name or address
    #[arg(long, env = "ECHO_CLIENT_HOST")]
    host: String,

    /// Server TCP port
    #[arg(long, env = "ECHO_CLIENT_PORT")]
    port: u16,

    /// One runtime per worker thread instead of one shared runtime
    #[arg(long, action = clap::ArgAction::Set, default_value_t = cfg!(not(windows)))]
    demux_per_work_thread: bool,

    /// Worker threads (defaults to the CPU count)
    #[arg(long)]
    threads: Option<usize>,

    /// Total sessions to run
    #[arg(long, default_value_t = 10_000)]
    sessions: usize,

    /// Connections initiated per batch
    #[arg(long, default_value_t = 100)]
    batch_size: usize,

    /// Milliseconds between batches (0 = no pause)
    #[arg(long, default_value_t = 0)]
    batch_interval: u64,

    /// Per-session buffer size in bytes; half of it is payload
    #[arg(long, default_value_t = 4096)]
    buffer: usize,

    /// Connect attempts per session (0 = keep trying)
    #[arg(long, default_value_t = 0)]
    connect_attempts: usize,

    /// SO_RCVBUF for client sockets (omit for the OS default)
    #[arg(long)]
    sock_recv_buffer: Option<usize>,

    /// SO_SNDBUF for client sockets (omit for the OS default)
    #[arg(long)]
    sock_send_buffer: Option<usize>,

    /// TCP_NODELAY for client sockets (omit for the OS default)
    #[arg(long, action = clap::ArgAction::Set)]
    no_delay: Option<bool>,

    /// Test duration in seconds
    #[arg(long, default_value_t = 600)]
    time: u64,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();
    match run_client(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!("unexpected error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

fn run_client(args: Args) -> anyhow::Result<()> {
    let threads = args.threads.unwrap_or_else(num_cpus::get).max(1);
    if args.buffer == 0 {
        anyhow::bail!("buffer must be at least 1 byte");
    }
    if args.sessions == 0 {
        anyhow::bail!("at least one session is required");
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %args.host,
        port = args.port,
        threads,
        demux_per_work_thread = args.demux_per_work_thread,
        sessions = args.sessions,
        batch_size = args.batch_size,
        batch_interval_ms = args.batch_interval,
        buffer = args.buffer,
        connect_attempts = args.connect_attempts,
        time_secs = args.time,
        "echo load test starting"
    );

    // The control runtime paces batches and waits for completions; the
    // session runtimes carry the echo traffic.
    let control_runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("control")
        .enable_all()
        .build()?;
    let session_runtimes: Vec<tokio::runtime::Runtime> = if args.demux_per_work_thread {
        (0..threads)
            .map(|i| {
                tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(1)
                    .thread_name(format!("session-{i}"))
                    .enable_all()
                    .build()
            })
            .collect::<Result<_, _>>()?
    } else {
        vec![tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name("session")
            .enable_all()
            .build()?]
    };
    let session_executors: Vec<Executor> = session_runtimes
        .iter()
        .map(|runtime| Executor::new(runtime.handle().clone()))
        .collect();

    let endpoints: Vec<SocketAddr> = control_runtime
        .block_on(tokio::net::lookup_host((args.host.as_str(), args.port)))?
        .collect();
    if endpoints.is_empty() {
        anyhow::bail!("host {} resolved to no addresses", args.host);
    }
    let endpoints = Arc::new(endpoints);

    let config = ClientConfig {
        buffer_size: args.buffer,
        max_connect_attempts: args.connect_attempts,
        socket_recv_buffer_size: args.sock_recv_buffer,
        socket_send_buffer_size: args.sock_send_buffer,
        no_delay: args.no_delay,
    };
    let sessions: Vec<Arc<ClientSession>> = (0..args.sessions)
        .map(|i| {
            let executor = &session_executors[i % session_executors.len()];
            Arc::new(ClientSession::new(executor, &config))
        })
        .collect();

    let totals = control_runtime.block_on(driver::run_load(
        sessions,
        endpoints,
        args.batch_size,
        Duration::from_millis(args.batch_interval),
        Duration::from_secs(args.time),
    ));

    info!("waiting for work threads to stop");
    for runtime in session_runtimes {
        runtime.shutdown_timeout(Duration::from_secs(5));
    }
    control_runtime.shutdown_timeout(Duration::from_secs(5));
    for executor in &session_executors {
        executor.release_stored_handlers();
    }

    totals.print();
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
