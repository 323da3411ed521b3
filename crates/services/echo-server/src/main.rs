//! Echo server binary entry point.
//!
//! # Usage
//!
//! ```bash
//! # Listen on port 7777 with the defaults
//! cargo run -p echokit-server -- --port 7777
//!
//! # Cap concurrency and close idle sessions after 30 seconds
//! cargo run -p echokit-server -- \
//!   --port 7777 \
//!   --max-sessions 512 \
//!   --inactivity-timeout 30
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use echokit_core::{Executor, ServerError};
use echokit_server::config::{ExecConfig, ManagerConfig, SessionConfig};
use echokit_server::factory::{RoundRobinSessionFactory, SessionFactory, SimpleSessionFactory};
use echokit_server::SessionManager;
use parking_lot::{Condvar, Mutex};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// TCP echo server
///
/// Mirrors every byte a client sends back to it, with a capped number of
/// concurrent sessions and orderly shutdown on Ctrl+C.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port for incoming connections
    #[arg(long, env = "ECHO_SERVER_PORT")]
    port: u16,

    /// Worker threads of the session manager's runtime
    #[arg(long, default_value_t = 1)]
    session_manager_threads: usize,

    /// Worker threads running session I/O (defaults to the CPU count)
    #[arg(long)]
    session_threads: Option<usize>,

    /// One runtime per session thread instead of one shared runtime
    #[arg(long, action = clap::ArgAction::Set, default_value_t = cfg!(not(windows)))]
    demux_per_work_thread: bool,

    /// Seconds an operator stop may take before the process gives up
    #[arg(long, default_value_t = 60)]
    stop_timeout: u64,

    /// Maximum simultaneously active sessions
    #[arg(long, default_value_t = 10_000)]
    max_sessions: usize,

    /// Maximum pooled inactive sessions
    #[arg(long, default_value_t = 100)]
    recycled_sessions: usize,

    /// TCP listen backlog
    #[arg(long, default_value_t = 6)]
    listen_backlog: i32,

    /// Session buffer size in bytes
    #[arg(long, default_value_t = 4096)]
    buffer: usize,

    /// Seconds without successful I/O before a session is closed
    /// (omit for no timeout)
    #[arg(long)]
    inactivity_timeout: Option<u64>,

    /// Maximum bytes moved by a single transfer
    #[arg(long, default_value_t = 4096)]
    max_transfer: usize,

    /// SO_RCVBUF for session sockets (omit for the OS default)
    #[arg(long)]
    sock_recv_buffer: Option<usize>,

    /// SO_SNDBUF for session sockets (omit for the OS default)
    #[arg(long)]
    sock_send_buffer: Option<usize>,

    /// TCP_NODELAY for session sockets (omit for the OS default)
    #[arg(long, action = clap::ArgAction::Set)]
    sock_no_delay: Option<bool>,

    /// Additionally print the final stats as one JSON line
    #[arg(long)]
    stats_json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Starting,
    Working,
    Stopping,
    Stopped,
}

struct PhaseState {
    phase: Phase,
    user_initiated_stop: bool,
}

/// Coordination cell between the manager's callbacks and the main thread.
struct Lifecycle {
    state: Mutex<PhaseState>,
    changed: Condvar,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: Mutex::new(PhaseState {
                phase: Phase::Starting,
                user_initiated_stop: false,
            }),
            changed: Condvar::new(),
        }
    }

    fn wait_until_stopping(&self) {
        let mut state = self.state.lock();
        while !matches!(state.phase, Phase::Stopping | Phase::Stopped) {
            self.changed.wait(&mut state);
        }
    }

    /// Returns whether the server reached the stopped phase in time.
    fn wait_until_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.phase != Phase::Stopped {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return state.phase == Phase::Stopped;
            }
        }
        true
    }

    fn user_initiated_stop(&self) -> bool {
        self.state.lock().user_initiated_stop
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();
    match run_server(args) {
        Ok(code) => code,
        Err(error) => {
            error!("unexpected error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

fn run_server(args: Args) -> anyhow::Result<ExitCode> {
    let session_threads = args.session_threads.unwrap_or_else(num_cpus::get).max(1);

    let exec_config = ExecConfig {
        session_manager_threads: args.session_manager_threads,
        session_threads,
        demux_per_work_thread: args.demux_per_work_thread,
        stop_timeout: Duration::from_secs(args.stop_timeout),
    };
    let session_config = SessionConfig {
        buffer_size: args.buffer,
        max_transfer_size: args.max_transfer,
        socket_recv_buffer_size: args.sock_recv_buffer,
        socket_send_buffer_size: args.sock_send_buffer,
        no_delay: args.sock_no_delay,
        inactivity_timeout: args.inactivity_timeout.map(Duration::from_secs),
    };
    let mut manager_config = ManagerConfig::new(
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), args.port),
        session_config,
    );
    manager_config.listen_backlog = args.listen_backlog;
    manager_config.max_sessions = args.max_sessions;
    manager_config.recycled_sessions = args.recycled_sessions;

    exec_config.validate()?;
    manager_config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        cpus = num_cpus::get(),
        port = args.port,
        session_manager_threads = exec_config.session_manager_threads,
        session_threads = exec_config.session_threads,
        demux_per_work_thread = exec_config.demux_per_work_thread,
        stop_timeout_secs = args.stop_timeout,
        max_sessions = manager_config.max_sessions,
        recycled_sessions = manager_config.recycled_sessions,
        listen_backlog = manager_config.listen_backlog,
        buffer = manager_config.session.buffer_size,
        max_transfer = manager_config.session.max_transfer_size,
        inactivity_timeout_secs = args.inactivity_timeout,
        sock_recv_buffer = args.sock_recv_buffer,
        sock_send_buffer = args.sock_send_buffer,
        sock_no_delay = args.sock_no_delay,
        "echo server starting"
    );

    // One runtime for the manager, one or many for session I/O.
    let manager_runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(exec_config.session_manager_threads)
        .thread_name("session-manager")
        .enable_all()
        .build()?;
    let session_runtimes: Vec<tokio::runtime::Runtime> = if exec_config.demux_per_work_thread {
        (0..exec_config.session_threads)
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
            .worker_threads(exec_config.session_threads)
            .thread_name("session")
            .enable_all()
            .build()?]
    };

    let manager_executor = Executor::new(manager_runtime.handle().clone());
    let session_executors: Vec<Executor> = session_runtimes
        .iter()
        .map(|runtime| Executor::new(runtime.handle().clone()))
        .collect();

    let factory: Arc<dyn SessionFactory> = if exec_config.demux_per_work_thread {
        Arc::new(RoundRobinSessionFactory::new(
            session_executors.clone(),
            manager_config.recycled_sessions,
        ))
    } else {
        Arc::new(SimpleSessionFactory::new(
            session_executors[0].clone(),
            manager_config.recycled_sessions,
        ))
    };

    let manager = SessionManager::new(&manager_executor, factory, manager_config);
    let lifecycle = Arc::new(Lifecycle::new());

    info!("server is starting");
    manager.start({
        let lifecycle = Arc::clone(&lifecycle);
        let manager = manager.clone();
        move |result| on_server_start(&lifecycle, &manager, result)
    });

    ctrlc::set_handler({
        let lifecycle = Arc::clone(&lifecycle);
        let manager = manager.clone();
        move || on_exit_request(&lifecycle, &manager)
    })?;
    info!("press Ctrl+C to exit");

    lifecycle.wait_until_stopping();
    let mut failed = false;
    if !lifecycle.wait_until_stopped(exec_config.stop_timeout) {
        error!(
            stop_timeout_secs = args.stop_timeout,
            "stop timeout expired, terminating server"
        );
        failed = true;
    }
    if !failed && !lifecycle.user_initiated_stop() {
        failed = true;
    }

    info!("waiting for work threads to stop");
    for runtime in session_runtimes {
        runtime.shutdown_timeout(Duration::from_secs(5));
    }
    manager_runtime.shutdown_timeout(Duration::from_secs(5));
    for executor in &session_executors {
        executor.release_stored_handlers();
    }
    manager_executor.release_stored_handlers();
    info!("work threads have stopped");

    let stats = manager.stats();
    println!("{stats}");
    if args.stats_json {
        println!("{}", serde_json::to_string(&stats)?);
    }

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn on_server_start(
    lifecycle: &Arc<Lifecycle>,
    manager: &SessionManager,
    result: Result<(), ServerError>,
) {
    let mut state = lifecycle.state.lock();
    if state.phase != Phase::Starting {
        return;
    }
    match result {
        Err(error) => {
            error!(%error, "server cannot start");
            state.phase = Phase::Stopped;
            lifecycle.changed.notify_all();
        }
        Ok(()) => {
            info!("server has started");
            state.phase = Phase::Working;
            lifecycle.changed.notify_all();
            manager.wait({
                let lifecycle = Arc::clone(lifecycle);
                let manager = manager.clone();
                move |error| on_server_wait(&lifecycle, &manager, error)
            });
        }
    }
}

fn on_server_wait(lifecycle: &Arc<Lifecycle>, manager: &SessionManager, error: ServerError) {
    let mut state = lifecycle.state.lock();
    if state.phase != Phase::Working {
        return;
    }
    warn!(%error, "server can no longer continue");
    manager.stop({
        let lifecycle = Arc::clone(lifecycle);
        move |result| on_server_stop(&lifecycle, result)
    });
    state.phase = Phase::Stopping;
    state.user_initiated_stop = false;
    lifecycle.changed.notify_all();
}

fn on_server_stop(lifecycle: &Arc<Lifecycle>, _result: Result<(), ServerError>) {
    let mut state = lifecycle.state.lock();
    info!("server has stopped");
    state.phase = Phase::Stopped;
    lifecycle.changed.notify_all();
}

fn on_exit_request(lifecycle: &Arc<Lifecycle>, manager: &SessionManager) {
    info!("application exit request detected");
    let mut state = lifecycle.state.lock();
    match state.phase {
        Phase::Stopped => {
            info!("server has already stopped");
        }
        Phase::Stopping => {
            warn!("server is already stopping, terminating");
            state.phase = Phase::Stopped;
            lifecycle.changed.notify_all();
        }
        Phase::Starting | Phase::Working => {
            manager.stop({
                let lifecycle = Arc::clone(lifecycle);
                move |result| on_server_stop(&lifecycle, result)
            });
            state.phase = Phase::Stopping;
            state.user_initiated_stop = true;
            lifecycle.changed.notify_all();
            info!("server is stopping, press Ctrl+C again to terminate");
        }
    }
}

fn init_tracing() {
    // EnvFilter honours RUST_LOG; default to info.
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
