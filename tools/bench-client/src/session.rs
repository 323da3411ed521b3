//! Per-connection load-generator state machine.
//!
//! A client session connects, then plays echo ping-pong with the server:
//! the cyclic buffer starts half full of payload, writes drain it, reads
//! refill it with whatever the server mirrored back. The machine uses the
//! same strand-and-readiness discipline as the server's sessions, but with
//! flag-based sub-state instead of full sub-machines: connect, read and
//! write each track one in-flight operation.

use std::io::{self, IoSlice, IoSliceMut};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use echokit_core::{CyclicBuffer, Executor, HandlerSlot, SaturatingCounter, ServerError, Strand};
use parking_lot::Mutex;
use tokio::net::TcpStream;

/// Configuration for one client session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Size of the echo buffer; half of it is primed as payload.
    pub buffer_size: usize,

    /// Connect retry budget over all endpoints; 0 retries forever.
    pub max_connect_attempts: usize,

    /// SO_RCVBUF for the socket.
    pub socket_recv_buffer_size: Option<usize>,

    /// SO_SNDBUF for the socket.
    pub socket_send_buffer_size: Option<usize>,

    /// TCP_NODELAY; `None` leaves the OS default.
    pub no_delay: Option<bool>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            buffer_size: 4096,
            max_connect_attempts: 0,
            socket_recv_buffer_size: None,
            socket_send_buffer_size: None,
            no_delay: None,
        }
    }
}

/// Byte totals observed by one session.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionTotals {
    pub bytes_written: SaturatingCounter,
    pub bytes_read: SaturatingCounter,
}

struct State {
    socket: Option<Arc<TcpStream>>,
    buffer: CyclicBuffer,
    bytes_written: SaturatingCounter,
    bytes_read: SaturatingCounter,
    connected: bool,
    connect_in_progress: bool,
    read_in_progress: bool,
    write_in_progress: bool,
    stopped: bool,
}

struct Shared {
    executor: Executor,
    strand: Strand,
    max_connect_attempts: usize,
    socket_recv_buffer_size: Option<usize>,
    socket_send_buffer_size: Option<usize>,
    no_delay: Option<bool>,
    state: Mutex<State>,
    run_handler: HandlerSlot<Result<(), ServerError>>,
    stop_handler: HandlerSlot<()>,
}

type ConnectHandler = Box<dyn FnOnce(Result<(), ServerError>) + Send>;

/// One echo load-generator connection.
pub struct ClientSession {
    shared: Arc<Shared>,
}

impl ClientSession {
    pub fn new(executor: &Executor, config: &ClientConfig) -> Self {
        let mut buffer = CyclicBuffer::new(config.buffer_size);
        prime_echo_payload(&mut buffer);
        let shared = Arc::new(Shared {
            executor: executor.clone(),
            strand: executor.strand(),
            max_connect_attempts: config.max_connect_attempts,
            socket_recv_buffer_size: config.socket_recv_buffer_size,
            socket_send_buffer_size: config.socket_send_buffer_size,
            no_delay: config.no_delay,
            state: Mutex::new(State {
                socket: None,
                buffer,
                bytes_written: SaturatingCounter::new(),
                bytes_read: SaturatingCounter::new(),
                connected: false,
                connect_in_progress: false,
                read_in_progress: false,
                write_in_progress: false,
                stopped: false,
            }),
            run_handler: HandlerSlot::new(executor),
            stop_handler: HandlerSlot::new(executor),
        });
        Self { shared }
    }

    /// Connect to the first reachable endpoint, retrying per the
    /// configured attempt budget.
    pub fn connect<H>(&self, endpoints: Arc<Vec<SocketAddr>>, handler: H)
    where
        H: FnOnce(Result<(), ServerError>) + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        self.shared
            .strand
            .post(move || Shared::do_connect(&shared, endpoints, Box::new(handler)));
    }

    /// Begin the echo loop; `handler` fires when the session can no
    /// longer make progress.
    pub fn run<H>(&self, handler: H)
    where
        H: FnOnce(Result<(), ServerError>) + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        self.shared
            .strand
            .post(move || Shared::do_run(&shared, handler));
    }

    /// Tear the session down; `handler` fires once nothing is in flight.
    pub fn stop<H>(&self, handler: H)
    where
        H: FnOnce(()) + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        self.shared
            .strand
            .post(move || Shared::do_stop(&shared, handler));
    }

    pub fn totals(&self) -> SessionTotals {
        let st = self.shared.state.lock();
        SessionTotals {
            bytes_written: st.bytes_written,
            bytes_read: st.bytes_read,
        }
    }
}

/// Fill the front half of the buffer with the fixed probe byte.
pub fn prime_echo_payload(buffer: &mut CyclicBuffer) {
    let payload_len = buffer.capacity() / 2;
    let value = (buffer.capacity() % 128) as u8;
    let (first, second) = buffer.prepared(payload_len);
    for byte in first.iter_mut() {
        *byte = value;
    }
    for byte in second.iter_mut() {
        *byte = value;
    }
    buffer.commit(payload_len);
}

impl Shared {
    fn do_connect(shared: &Arc<Shared>, endpoints: Arc<Vec<SocketAddr>>, handler: ConnectHandler) {
        let mut st = shared.state.lock();
        if st.stopped {
            drop(st);
            shared
                .executor
                .post(move || handler(Err(ServerError::OperationAborted)));
            return;
        }
        if st.connect_in_progress || st.read_in_progress || st.write_in_progress {
            drop(st);
            shared
                .executor
                .post(move || handler(Err(ServerError::InvalidState)));
            return;
        }
        if endpoints.is_empty() {
            drop(st);
            shared.executor.post(move || {
                handler(Err(ServerError::io(io::ErrorKind::AddrNotAvailable.into())))
            });
            return;
        }
        Shared::start_connect(shared, &mut st, endpoints, 0, 0, handler);
    }

    fn start_connect(
        shared: &Arc<Shared>,
        st: &mut State,
        endpoints: Arc<Vec<SocketAddr>>,
        attempt: usize,
        endpoint_index: usize,
        handler: ConnectHandler,
    ) {
        st.connect_in_progress = true;
        let addr = endpoints[endpoint_index];
        let shared = Arc::clone(shared);
        let executor = shared.executor.clone();
        executor.spawn(async move {
            let result = TcpStream::connect(addr).await;
            let strand = shared.strand.clone();
            strand.post(move || {
                Shared::handle_connect(&shared, endpoints, attempt, endpoint_index, result, handler)
            });
        });
    }

    fn handle_connect(
        shared: &Arc<Shared>,
        endpoints: Arc<Vec<SocketAddr>>,
        attempt: usize,
        endpoint_index: usize,
        result: io::Result<TcpStream>,
        handler: ConnectHandler,
    ) {
        let mut st = shared.state.lock();
        st.connect_in_progress = false;

        if st.stopped {
            drop(st);
            shared
                .executor
                .post(move || handler(Err(ServerError::OperationAborted)));
            Shared::complete_stop_if_idle(shared);
            return;
        }

        let socket = match result {
            Err(error) => {
                // Walk the remaining endpoints, then burn an attempt and
                // start over from the first one.
                if endpoint_index + 1 < endpoints.len() {
                    Shared::start_connect(
                        shared,
                        &mut st,
                        endpoints,
                        attempt,
                        endpoint_index + 1,
                        handler,
                    );
                    return;
                }
                let next_attempt = attempt + 1;
                if shared.max_connect_attempts != 0
                    && next_attempt >= shared.max_connect_attempts
                {
                    drop(st);
                    shared
                        .executor
                        .post(move || handler(Err(ServerError::io(error))));
                    return;
                }
                Shared::start_connect(shared, &mut st, endpoints, next_attempt, 0, handler);
                return;
            }
            Ok(socket) => socket,
        };

        if let Err(error) = shared.apply_socket_options(&socket) {
            drop(socket);
            drop(st);
            shared.executor.post(move || handler(Err(error)));
            return;
        }

        st.socket = Some(Arc::new(socket));
        st.connected = true;
        drop(st);
        shared.executor.post(move || handler(Ok(())));
    }

    fn apply_socket_options(&self, socket: &TcpStream) -> Result<(), ServerError> {
        let sock = socket2::SockRef::from(socket);
        sock.set_linger(Some(Duration::from_secs(0)))?;
        if let Some(size) = self.socket_recv_buffer_size {
            sock.set_recv_buffer_size(size)?;
        }
        if let Some(size) = self.socket_send_buffer_size {
            sock.set_send_buffer_size(size)?;
        }
        if let Some(no_delay) = self.no_delay {
            socket.set_nodelay(no_delay)?;
        }
        Ok(())
    }

    fn do_run<H>(shared: &Arc<Shared>, handler: H)
    where
        H: FnOnce(Result<(), ServerError>) + Send + 'static,
    {
        let mut st = shared.state.lock();
        if st.stopped || !st.connected {
            drop(st);
            shared
                .executor
                .post(move || handler(Err(ServerError::OperationAborted)));
            return;
        }
        Shared::start_write_some(shared, &mut st);
        Shared::start_read_some(shared, &mut st);
        drop(st);
        shared.run_handler.store(handler);
    }

    fn do_stop<H>(shared: &Arc<Shared>, handler: H)
    where
        H: FnOnce(()) + Send + 'static,
    {
        let mut st = shared.state.lock();
        if st.stopped && !st.connect_in_progress && !st.read_in_progress && !st.write_in_progress {
            drop(st);
            shared.executor.post(move || handler(()));
            return;
        }

        shared.stop_handler.store(handler);
        if st.connected {
            let _ = Shared::shutdown_socket(&st);
        }
        Shared::enter_stopped(shared, &mut st, None);
    }

    // --- echo loop -------------------------------------------------------

    fn start_read_some(shared: &Arc<Shared>, st: &mut State) {
        if st.read_in_progress || st.buffer.unfilled() == 0 {
            return;
        }
        let socket = match st.socket.clone() {
            Some(socket) => socket,
            None => return,
        };
        st.read_in_progress = true;
        Shared::spawn_read_wait(shared, socket);
    }

    fn spawn_read_wait(shared: &Arc<Shared>, socket: Arc<TcpStream>) {
        let shared = Arc::clone(shared);
        let executor = shared.executor.clone();
        executor.spawn(async move {
            let ready = socket.readable().await;
            let strand = shared.strand.clone();
            strand.post(move || Shared::on_read_ready(&shared, socket, ready.err()));
        });
    }

    fn on_read_ready(shared: &Arc<Shared>, socket: Arc<TcpStream>, ready_error: Option<io::Error>) {
        let mut st = shared.state.lock();
        if st.stopped {
            st.read_in_progress = false;
            Shared::complete_run(shared, &mut st, None);
            Shared::complete_stop(shared, &st);
            return;
        }

        if let Some(error) = ready_error {
            st.read_in_progress = false;
            Shared::enter_stopped(shared, &mut st, Some(ServerError::io(error)));
            return;
        }

        let outcome = {
            let (first, second) = st.buffer.prepared(usize::MAX);
            let mut slices = [IoSliceMut::new(first), IoSliceMut::new(second)];
            socket.try_read_vectored(&mut slices)
        };
        match outcome {
            Ok(0) => {
                st.read_in_progress = false;
                let _ = Shared::shutdown_socket(&st);
                Shared::enter_stopped(shared, &mut st, None);
            }
            Ok(n) => {
                st.read_in_progress = false;
                st.bytes_read.add(n as u64);
                st.buffer.commit(n);
                if !st.write_in_progress {
                    Shared::start_write_some(shared, &mut st);
                }
                Shared::start_read_some(shared, &mut st);
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                Shared::spawn_read_wait(shared, socket);
            }
            Err(error) => {
                st.read_in_progress = false;
                Shared::enter_stopped(shared, &mut st, Some(ServerError::io(error)));
            }
        }
    }

    fn start_write_some(shared: &Arc<Shared>, st: &mut State) {
        if st.write_in_progress || st.buffer.filled() == 0 {
            return;
        }
        let socket = match st.socket.clone() {
            Some(socket) => socket,
            None => return,
        };
        st.write_in_progress = true;
        Shared::spawn_write_wait(shared, socket);
    }

    fn spawn_write_wait(shared: &Arc<Shared>, socket: Arc<TcpStream>) {
        let shared = Arc::clone(shared);
        let executor = shared.executor.clone();
        executor.spawn(async move {
            let ready = socket.writable().await;
            let strand = shared.strand.clone();
            strand.post(move || Shared::on_write_ready(&shared, socket, ready.err()));
        });
    }

    fn on_write_ready(
        shared: &Arc<Shared>,
        socket: Arc<TcpStream>,
        ready_error: Option<io::Error>,
    ) {
        let mut st = shared.state.lock();
        if st.stopped {
            st.write_in_progress = false;
            Shared::complete_run(shared, &mut st, None);
            Shared::complete_stop(shared, &st);
            return;
        }

        if let Some(error) = ready_error {
            st.write_in_progress = false;
            Shared::enter_stopped(shared, &mut st, Some(ServerError::io(error)));
            return;
        }

        let outcome = {
            let (first, second) = st.buffer.data(usize::MAX);
            let slices = [IoSlice::new(first), IoSlice::new(second)];
            socket.try_write_vectored(&slices)
        };
        match outcome {
            Ok(0) => {
                st.write_in_progress = false;
                Shared::enter_stopped(
                    shared,
                    &mut st,
                    Some(ServerError::io(io::ErrorKind::WriteZero.into())),
                );
            }
            Ok(n) => {
                st.write_in_progress = false;
                st.bytes_written.add(n as u64);
                st.buffer.consume(n);
                if !st.read_in_progress {
                    Shared::start_read_some(shared, &mut st);
                }
                Shared::start_write_some(shared, &mut st);
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                Shared::spawn_write_wait(shared, socket);
            }
            Err(error) => {
                st.write_in_progress = false;
                Shared::enter_stopped(shared, &mut st, Some(ServerError::io(error)));
            }
        }
    }

    // --- teardown --------------------------------------------------------

    fn enter_stopped(shared: &Arc<Shared>, st: &mut State, error: Option<ServerError>) {
        if let Some(socket) = st.socket.take() {
            let _ = socket2::SockRef::from(socket.as_ref()).shutdown(Shutdown::Both);
        }
        st.connected = false;
        st.stopped = true;
        Shared::complete_run(shared, st, error);
        Shared::complete_stop(shared, st);
    }

    fn complete_run(shared: &Arc<Shared>, st: &mut State, error: Option<ServerError>) {
        if !st.read_in_progress && !st.write_in_progress && shared.run_handler.has_target() {
            let result = match error {
                Some(error) => Err(error),
                None => Ok(()),
            };
            let _ = shared.run_handler.post(result);
        }
    }

    fn complete_stop(shared: &Arc<Shared>, st: &State) {
        if !st.connect_in_progress
            && !st.read_in_progress
            && !st.write_in_progress
            && shared.stop_handler.has_target()
        {
            let _ = shared.stop_handler.post(());
        }
    }

    fn complete_stop_if_idle(shared: &Arc<Shared>) {
        let st = shared.state.lock();
        Shared::complete_stop(shared, &st);
    }

    fn shutdown_socket(st: &State) -> io::Result<()> {
        match &st.socket {
            Some(socket) => socket2::SockRef::from(socket.as_ref()).shutdown(Shutdown::Write),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    #[test]
    fn priming_fills_half_the_buffer_with_the_probe_byte() {
        let mut buffer = CyclicBuffer::new(300);
        prime_echo_payload(&mut buffer);
        assert_eq!(buffer.filled(), 150);
        let (first, second) = buffer.data(usize::MAX);
        assert!(second.is_empty());
        assert!(first.iter().all(|&b| b == (300 % 128) as u8));
    }

    async fn spawn_echo_listener() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = socket.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        addr
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn session_plays_echo_ping_pong() {
        let addr = spawn_echo_listener().await;
        let executor = Executor::current();
        let config = ClientConfig {
            buffer_size: 64,
            ..ClientConfig::default()
        };
        let session = Arc::new(ClientSession::new(&executor, &config));

        let (tx, rx) = oneshot::channel();
        session.connect(Arc::new(vec![addr]), move |result| {
            let _ = tx.send(result);
        });
        rx.await.unwrap().unwrap();

        session.run(|_result| {});

        // Half the buffer circulates; wait until it has gone around a few
        // times.
        let mut rounds = 0;
        while session.totals().bytes_read.value() < 32 * 4 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            rounds += 1;
            assert!(rounds < 300, "echo loop made no progress");
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        session.stop(move |()| {
            let _ = stop_tx.send(());
        });
        stop_rx.await.unwrap();

        let totals = session.totals();
        assert!(totals.bytes_written.value() >= 32);
        assert!(totals.bytes_read.value() >= 32 * 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn connect_gives_up_after_the_attempt_budget() {
        // A listener that is immediately dropped leaves a port that
        // refuses connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let executor = Executor::current();
        let config = ClientConfig {
            max_connect_attempts: 2,
            ..ClientConfig::default()
        };
        let session = ClientSession::new(&executor, &config);

        let (tx, rx) = oneshot::channel();
        session.connect(Arc::new(vec![addr]), move |result| {
            let _ = tx.send(result);
        });
        assert!(matches!(rx.await.unwrap(), Err(ServerError::Io(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn run_before_connect_is_aborted() {
        let executor = Executor::current();
        let session = ClientSession::new(&executor, &ClientConfig::default());
        let (tx, rx) = oneshot::channel();
        session.run(move |result| {
            let _ = tx.send(result);
        });
        assert_eq!(rx.await.unwrap(), Err(ServerError::OperationAborted));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stop_without_activity_completes_immediately() {
        let executor = Executor::current();
        let session = ClientSession::new(&executor, &ClientConfig::default());
        let (tx, rx) = oneshot::channel();
        session.stop(move |()| {
            let _ = tx.send(());
        });
        rx.await.unwrap();
    }
}
