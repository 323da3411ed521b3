//! Per-connection echo state machine.
//!
//! A session mirrors bytes on a single TCP connection: whatever the peer
//! sends is written back in order. The machine is a plain struct driven by
//! short steps on its strand; socket readiness and timer waits are helper
//! tasks whose completions post the next step back to the strand, so no
//! step ever blocks and no state is touched concurrently.
//!
//! Externally a session moves `ready → work → stop → stopped`, going
//! straight to `stopped` on a failed start. Internally four sub-machines
//! cooperate: the gross phase (`work → shutdown → stop → stopped`), the
//! read and write loops (`wait ↔ in_progress`, then `stopped`), and the
//! inactivity timer (`ready ↔ in_progress`, then `stopped`).

use std::io::{self, IoSlice, IoSliceMut};
use std::net::Shutdown;
use std::sync::Arc;
use std::time::Duration;

use echokit_core::{CyclicBuffer, Executor, HandlerSlot, ServerError, Strand};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::config::SessionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExternState {
    Ready,
    Work,
    Stop,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InternState {
    Work,
    Shutdown,
    Stop,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IoState {
    Wait,
    InProgress,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Ready,
    InProgress,
    Stopped,
}

/// What a read step produced once the socket signalled readiness.
enum ReadOutcome {
    Done(usize),
    Eof,
    Error(io::Error),
}

struct State {
    socket: Option<Arc<TcpStream>>,
    buffer: CyclicBuffer,

    extern_state: ExternState,
    intern_state: InternState,
    read_state: IoState,
    write_state: IoState,
    timer_state: TimerState,

    /// The in-flight timer wait no longer counts; its completion is a
    /// transitional no-op.
    timer_wait_cancelled: bool,
    /// The timer should be running (I/O is in flight).
    timer_turned: bool,
    timer_cancel: Option<Arc<Notify>>,

    pending_operations: usize,
    wait_error: Option<ServerError>,
}

struct Shared {
    executor: Executor,
    strand: Strand,
    home: usize,

    max_transfer_size: usize,
    socket_recv_buffer_size: Option<usize>,
    socket_send_buffer_size: Option<usize>,
    no_delay: Option<bool>,
    inactivity_timeout: Option<Duration>,

    state: Mutex<State>,
    wait_handler: HandlerSlot<ServerError>,
    stop_handler: HandlerSlot<Result<(), ServerError>>,
}

/// A single echo session.
///
/// Created by a [`crate::factory::SessionFactory`]; driven through
/// `start`, `wait` and `stop`; reusable after `reset` once it reached the
/// terminal state.
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    pub(crate) fn new(executor: &Executor, config: &SessionConfig, home: usize) -> Self {
        let shared = Arc::new(Shared {
            executor: executor.clone(),
            strand: executor.strand(),
            home,
            max_transfer_size: config.max_transfer_size,
            socket_recv_buffer_size: config.socket_recv_buffer_size,
            socket_send_buffer_size: config.socket_send_buffer_size,
            no_delay: config.no_delay,
            inactivity_timeout: config.inactivity_timeout,
            state: Mutex::new(State {
                socket: None,
                buffer: CyclicBuffer::new(config.buffer_size),
                extern_state: ExternState::Ready,
                intern_state: InternState::Work,
                read_state: IoState::Wait,
                write_state: IoState::Wait,
                timer_state: TimerState::Ready,
                timer_wait_cancelled: false,
                timer_turned: false,
                timer_cancel: None,
                pending_operations: 0,
                wait_error: None,
            }),
            wait_handler: HandlerSlot::new(executor),
            stop_handler: HandlerSlot::new(executor),
        });
        Self { shared }
    }

    /// Which executor pool this session was created against.
    pub(crate) fn home(&self) -> usize {
        self.shared.home
    }

    /// Make the session reusable after it reached the terminal state.
    pub fn reset(&self) {
        let mut st = self.shared.state.lock();
        if let Some(socket) = st.socket.take() {
            let _ = socket2::SockRef::from(socket.as_ref()).shutdown(Shutdown::Both);
        }
        st.buffer.reset();
        st.extern_state = ExternState::Ready;
        st.intern_state = InternState::Work;
        st.read_state = IoState::Wait;
        st.write_state = IoState::Wait;
        st.timer_state = TimerState::Ready;
        st.timer_wait_cancelled = false;
        st.timer_turned = false;
        st.timer_cancel = None;
        st.pending_operations = 0;
        st.wait_error = None;
    }

    /// Bind an accepted connection and begin echoing.
    ///
    /// `handler` reports the outcome of the start itself: the socket-option
    /// errors that skip the work phase, `OperationAborted` after a stop, or
    /// `InvalidState` while already working.
    pub fn start<H>(&self, socket: TcpStream, handler: H)
    where
        H: FnOnce(Result<(), ServerError>) + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        self.shared
            .strand
            .post(move || Shared::do_start(&shared, socket, handler));
    }

    /// Park a callback that fires once, when the session first can no
    /// longer do useful work.
    pub fn wait<H>(&self, handler: H)
    where
        H: FnOnce(ServerError) + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        self.shared
            .strand
            .post(move || Shared::do_wait(&shared, handler));
    }

    /// Tear the session down; `handler` fires when teardown completes.
    pub fn stop<H>(&self, handler: H)
    where
        H: FnOnce(Result<(), ServerError>) + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        self.shared
            .strand
            .post(move || Shared::do_stop(&shared, handler));
    }
}

impl Shared {
    fn do_start<H>(shared: &Arc<Shared>, socket: TcpStream, handler: H)
    where
        H: FnOnce(Result<(), ServerError>) + Send + 'static,
    {
        let mut st = shared.state.lock();
        match st.extern_state {
            ExternState::Ready => {}
            ExternState::Stop | ExternState::Stopped => {
                drop(st);
                shared
                    .executor
                    .post(move || handler(Err(ServerError::OperationAborted)));
                return;
            }
            ExternState::Work => {
                drop(st);
                shared
                    .executor
                    .post(move || handler(Err(ServerError::InvalidState)));
                return;
            }
        }

        if let Err(error) = shared.apply_socket_options(&socket) {
            tracing::debug!(%error, "session start failed while applying socket options");
            st.extern_state = ExternState::Stopped;
            st.intern_state = InternState::Stopped;
            st.read_state = IoState::Stopped;
            st.write_state = IoState::Stopped;
            st.timer_state = TimerState::Stopped;
            drop(st);
            drop(socket);
            shared.executor.post(move || handler(Err(error)));
            return;
        }

        st.socket = Some(Arc::new(socket));
        st.extern_state = ExternState::Work;
        Shared::continue_work(shared, &mut st);
        drop(st);
        shared.executor.post(move || handler(Ok(())));
    }

    fn do_wait<H>(shared: &Arc<Shared>, handler: H)
    where
        H: FnOnce(ServerError) + Send + 'static,
    {
        let st = shared.state.lock();
        if st.extern_state != ExternState::Work || shared.wait_handler.has_target() {
            drop(st);
            shared
                .executor
                .post(move || handler(ServerError::InvalidState));
            return;
        }
        if st.intern_state != InternState::Work {
            // The stop already happened; report the latched reason now.
            let error = st.wait_error.clone().unwrap_or(ServerError::OutOfWork);
            drop(st);
            shared.executor.post(move || handler(error));
            return;
        }
        drop(st);
        shared.wait_handler.store(handler);
    }

    fn do_stop<H>(shared: &Arc<Shared>, handler: H)
    where
        H: FnOnce(Result<(), ServerError>) + Send + 'static,
    {
        let mut st = shared.state.lock();
        if matches!(st.extern_state, ExternState::Stop | ExternState::Stopped) {
            drop(st);
            shared
                .executor
                .post(move || handler(Err(ServerError::InvalidState)));
            return;
        }

        st.extern_state = ExternState::Stop;
        Shared::complete_extern_wait(shared, &mut st, Some(ServerError::OperationAborted));

        if st.intern_state == InternState::Work {
            Shared::start_shutdown(shared, &mut st, ServerError::OperationAborted);
        }

        if st.intern_state == InternState::Stopped {
            st.extern_state = ExternState::Stopped;
            drop(st);
            shared.executor.post(move || handler(Ok(())));
            return;
        }

        drop(st);
        shared.stop_handler.store(handler);
    }

    fn apply_socket_options(&self, socket: &TcpStream) -> Result<(), ServerError> {
        let sock = socket2::SockRef::from(socket);

        // Abortive close: a session that is torn down resets the peer
        // instead of lingering in TIME_WAIT.
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

    // --- work phase ------------------------------------------------------

    fn continue_work(shared: &Arc<Shared>, st: &mut State) {
        debug_assert_eq!(st.intern_state, InternState::Work);

        if st.read_state == IoState::Stopped {
            // Peer sent EOF: drain and shut down our side.
            Shared::start_shutdown(shared, st, ServerError::OutOfWork);
            return;
        }

        if st.read_state == IoState::Wait && st.buffer.unfilled() > 0 {
            Shared::start_socket_read(shared, st);
        }
        if st.write_state == IoState::Wait && st.buffer.filled() > 0 {
            Shared::start_socket_write(shared, st);
        }
        Shared::continue_timer_wait(shared, st);
    }

    // --- read loop -------------------------------------------------------

    fn start_socket_read(shared: &Arc<Shared>, st: &mut State) {
        let socket = match st.socket.clone() {
            Some(socket) => socket,
            None => return,
        };
        st.read_state = IoState::InProgress;
        st.pending_operations += 1;
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
        debug_assert_eq!(st.read_state, IoState::InProgress);

        if st.intern_state == InternState::Stop {
            // Late completion during teardown: consumed silently.
            st.pending_operations -= 1;
            st.read_state = IoState::Stopped;
            Shared::continue_stop(shared, &mut st);
            return;
        }

        if let Some(error) = ready_error {
            Shared::finish_read(shared, &mut st, ReadOutcome::Error(error));
            return;
        }

        // In shutdown the whole prepared region drains the peer; in work
        // the transfer is clipped.
        let max = if st.intern_state == InternState::Shutdown {
            usize::MAX
        } else {
            shared.max_transfer_size
        };

        let outcome = {
            let (first, second) = st.buffer.prepared(max);
            let mut slices = [IoSliceMut::new(first), IoSliceMut::new(second)];
            match socket.try_read_vectored(&mut slices) {
                Ok(0) => ReadOutcome::Eof,
                Ok(n) => ReadOutcome::Done(n),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    // Spurious wakeup: stay in progress and wait again.
                    Shared::spawn_read_wait(shared, socket);
                    return;
                }
                Err(error) => ReadOutcome::Error(error),
            }
        };
        Shared::finish_read(shared, &mut st, outcome);
    }

    fn finish_read(shared: &Arc<Shared>, st: &mut State, outcome: ReadOutcome) {
        st.pending_operations -= 1;
        st.read_state = IoState::Wait;
        Shared::cancel_timer_wait(st);

        match outcome {
            ReadOutcome::Error(error) => {
                st.read_state = IoState::Stopped;
                Shared::start_stop(shared, st, Some(ServerError::io(error)));
                return;
            }
            ReadOutcome::Eof => {
                st.read_state = IoState::Stopped;
            }
            ReadOutcome::Done(n) => {
                st.buffer.commit(n);
            }
        }

        match st.intern_state {
            InternState::Work => Shared::continue_work(shared, st),
            InternState::Shutdown => Shared::continue_shutdown(shared, st),
            InternState::Stop | InternState::Stopped => unreachable!("read completion after stop"),
        }
    }

    // --- write loop ------------------------------------------------------

    fn start_socket_write(shared: &Arc<Shared>, st: &mut State) {
        let socket = match st.socket.clone() {
            Some(socket) => socket,
            None => return,
        };
        st.write_state = IoState::InProgress;
        st.pending_operations += 1;
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
        debug_assert_eq!(st.write_state, IoState::InProgress);

        if st.intern_state == InternState::Stop {
            st.pending_operations -= 1;
            st.write_state = IoState::Stopped;
            Shared::continue_stop(shared, &mut st);
            return;
        }

        if let Some(error) = ready_error {
            Shared::finish_write(shared, &mut st, Err(error));
            return;
        }

        let result = {
            let (first, second) = st.buffer.data(shared.max_transfer_size);
            let slices = [IoSlice::new(first), IoSlice::new(second)];
            match socket.try_write_vectored(&slices) {
                Ok(0) => Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => Ok(n),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    Shared::spawn_write_wait(shared, socket);
                    return;
                }
                Err(error) => Err(error),
            }
        };
        Shared::finish_write(shared, &mut st, result);
    }

    fn finish_write(shared: &Arc<Shared>, st: &mut State, result: Result<usize, io::Error>) {
        st.pending_operations -= 1;
        st.write_state = IoState::Wait;
        Shared::cancel_timer_wait(st);

        match result {
            Err(error) => {
                st.write_state = IoState::Stopped;
                Shared::start_stop(shared, st, Some(ServerError::io(error)));
                return;
            }
            Ok(n) => {
                st.buffer.consume(n);
            }
        }

        match st.intern_state {
            InternState::Work => Shared::continue_work(shared, st),
            InternState::Shutdown => Shared::continue_shutdown(shared, st),
            InternState::Stop | InternState::Stopped => unreachable!("write completion after stop"),
        }
    }

    // --- inactivity timer ------------------------------------------------

    fn continue_timer_wait(shared: &Arc<Shared>, st: &mut State) {
        let Some(timeout) = shared.inactivity_timeout else {
            return;
        };
        let has_io_activity =
            st.read_state == IoState::InProgress || st.write_state == IoState::InProgress;
        if has_io_activity && !st.timer_turned {
            // Refresh the expiry: the current wait, if any, is forgotten
            // and a new full interval starts.
            st.timer_wait_cancelled = true;
            st.timer_turned = true;
            if st.timer_state == TimerState::Ready {
                Shared::start_timer_wait(shared, st, timeout);
            }
        }
    }

    fn start_timer_wait(shared: &Arc<Shared>, st: &mut State, timeout: Duration) {
        debug_assert_eq!(st.timer_state, TimerState::Ready);

        let cancel = Arc::new(Notify::new());
        st.timer_cancel = Some(Arc::clone(&cancel));
        st.timer_state = TimerState::InProgress;
        st.timer_wait_cancelled = false;
        st.pending_operations += 1;

        let shared = Arc::clone(shared);
        let executor = shared.executor.clone();
        executor.spawn(async move {
            let fired = tokio::select! {
                _ = tokio::time::sleep(timeout) => true,
                _ = cancel.notified() => false,
            };
            let strand = shared.strand.clone();
            strand.post(move || Shared::on_timer(&shared, fired));
        });
    }

    fn cancel_timer_wait(st: &mut State) {
        if !st.timer_wait_cancelled && st.timer_state == TimerState::InProgress {
            if let Some(cancel) = st.timer_cancel.take() {
                cancel.notify_one();
            }
        }
        st.timer_wait_cancelled = true;
        st.timer_turned = false;
    }

    fn on_timer(shared: &Arc<Shared>, fired: bool) {
        let mut st = shared.state.lock();
        debug_assert_eq!(st.timer_state, TimerState::InProgress);

        if st.intern_state == InternState::Stop {
            st.pending_operations -= 1;
            st.timer_state = TimerState::Stopped;
            Shared::continue_stop(shared, &mut st);
            return;
        }

        st.pending_operations -= 1;
        st.timer_state = TimerState::Ready;

        if st.timer_wait_cancelled || !fired {
            // Cancelled wait: transitional no-op; restart if still turned.
            if st.timer_turned {
                if let Some(timeout) = shared.inactivity_timeout {
                    Shared::start_timer_wait(shared, &mut st, timeout);
                }
            }
            return;
        }

        st.timer_state = TimerState::Stopped;
        Shared::start_stop(shared, &mut st, Some(ServerError::InactivityTimeout));
    }

    // --- shutdown phase --------------------------------------------------

    fn start_shutdown(shared: &Arc<Shared>, st: &mut State, error: ServerError) {
        debug_assert_eq!(st.intern_state, InternState::Work);
        st.intern_state = InternState::Shutdown;
        if st.extern_state == ExternState::Work {
            Shared::complete_extern_wait(shared, st, Some(error));
        }
        Shared::continue_shutdown(shared, st);
    }

    fn continue_shutdown(shared: &Arc<Shared>, st: &mut State) {
        debug_assert_eq!(st.intern_state, InternState::Shutdown);
        match st.read_state {
            IoState::Wait => Shared::continue_shutdown_at_read_wait(shared, st),
            IoState::InProgress => Shared::continue_shutdown_at_read_in_progress(shared, st),
            IoState::Stopped => Shared::continue_shutdown_at_read_stopped(shared, st),
        }
    }

    fn continue_shutdown_at_read_wait(shared: &Arc<Shared>, st: &mut State) {
        if st.write_state == IoState::Wait {
            if let Err(error) = Shared::shutdown_socket(st) {
                Shared::start_stop(shared, st, Some(ServerError::io(error)));
                return;
            }
            st.write_state = IoState::Stopped;
        }

        if st.write_state == IoState::Stopped {
            // Nothing will be echoed any more; the whole buffer can take
            // the remaining inbound bytes.
            st.buffer.reset();
            Shared::start_socket_read(shared, st);
        } else if st.buffer.unfilled() > 0 {
            // Write still in flight; keep draining what fits.
            Shared::start_socket_read(shared, st);
        }

        Shared::continue_timer_wait(shared, st);
    }

    fn continue_shutdown_at_read_in_progress(shared: &Arc<Shared>, st: &mut State) {
        if st.write_state == IoState::Wait {
            if let Err(error) = Shared::shutdown_socket(st) {
                Shared::start_stop(shared, st, Some(ServerError::io(error)));
                return;
            }
            st.write_state = IoState::Stopped;
        }
        Shared::continue_timer_wait(shared, st);
    }

    fn continue_shutdown_at_read_stopped(shared: &Arc<Shared>, st: &mut State) {
        if st.write_state == IoState::Wait {
            // The read side is already done, a shutdown error is moot.
            let _ = Shared::shutdown_socket(st);
            st.write_state = IoState::Stopped;
        }

        if st.write_state == IoState::Stopped {
            Shared::start_stop(shared, st, None);
            return;
        }

        Shared::continue_timer_wait(shared, st);
    }

    // --- stop phase ------------------------------------------------------

    fn start_stop(shared: &Arc<Shared>, st: &mut State, error: Option<ServerError>) {
        debug_assert!(matches!(
            st.intern_state,
            InternState::Work | InternState::Shutdown
        ));
        st.intern_state = InternState::Stop;

        // Closing converts in-flight reads and writes into completions
        // delivered through the usual path; close errors are discarded.
        if let Some(socket) = st.socket.take() {
            let _ = socket2::SockRef::from(socket.as_ref()).shutdown(Shutdown::Both);
        }
        Shared::cancel_timer_wait(st);

        if st.read_state == IoState::Wait {
            st.read_state = IoState::Stopped;
        }
        if st.write_state == IoState::Wait {
            st.write_state = IoState::Stopped;
        }
        if st.timer_state == TimerState::Ready {
            st.timer_state = TimerState::Stopped;
        }

        if st.extern_state == ExternState::Work {
            Shared::complete_extern_wait(shared, st, error);
        }

        Shared::continue_stop(shared, st);
    }

    fn continue_stop(shared: &Arc<Shared>, st: &mut State) {
        debug_assert_eq!(st.intern_state, InternState::Stop);
        if st.pending_operations == 0 {
            debug_assert_eq!(st.read_state, IoState::Stopped);
            debug_assert_eq!(st.write_state, IoState::Stopped);
            debug_assert_eq!(st.timer_state, TimerState::Stopped);

            st.intern_state = InternState::Stopped;
            if st.extern_state == ExternState::Stop {
                st.extern_state = ExternState::Stopped;
                if shared.stop_handler.has_target() {
                    let _ = shared.stop_handler.post(Ok(()));
                }
            }
        }
    }

    // --- completion plumbing --------------------------------------------

    /// Latch the first wait error and fire a parked wait handler.
    fn complete_extern_wait(shared: &Arc<Shared>, st: &mut State, error: Option<ServerError>) {
        if st.wait_error.is_none() {
            st.wait_error = error;
        }
        if shared.wait_handler.has_target() {
            let error = st.wait_error.clone().unwrap_or(ServerError::OutOfWork);
            let _ = shared.wait_handler.post(error);
        }
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
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn started_session(config: &SessionConfig, server_side: TcpStream) -> Session {
        let executor = Executor::current();
        let session = Session::new(&executor, config, 0);
        let (tx, _rx) = oneshot::channel();
        session.start(server_side, move |result| {
            let _ = tx.send(result);
        });
        session
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn echoes_bytes_back_in_order() {
        let (mut client, server_side) = socket_pair().await;
        let session = started_session(&SessionConfig::default(), server_side);

        client.write_all(b"hello echo").await.unwrap();
        let mut read_back = [0u8; 10];
        client.read_exact(&mut read_back).await.unwrap();
        assert_eq!(&read_back, b"hello echo");

        // Stop drains the peer side; closing the client lets it finish.
        drop(client);
        let (tx, rx) = oneshot::channel();
        session.stop(move |result| {
            let _ = tx.send(result);
        });
        rx.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn peer_half_close_surfaces_out_of_work() {
        let (mut client, server_side) = socket_pair().await;
        let session = started_session(&SessionConfig::default(), server_side);

        let (wait_tx, wait_rx) = oneshot::channel();
        session.wait(move |error| {
            let _ = wait_tx.send(error);
        });

        client.write_all(b"bye").await.unwrap();
        let mut read_back = [0u8; 3];
        client.read_exact(&mut read_back).await.unwrap();
        client.shutdown().await.unwrap();

        assert_eq!(wait_rx.await.unwrap(), ServerError::OutOfWork);

        // The session shut its write side down after draining.
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let (tx, rx) = oneshot::channel();
        session.stop(move |result| {
            let _ = tx.send(result);
        });
        rx.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn silence_trips_the_inactivity_timer() {
        let (client, server_side) = socket_pair().await;
        let config = SessionConfig {
            inactivity_timeout: Some(Duration::from_millis(100)),
            ..SessionConfig::default()
        };
        let session = started_session(&config, server_side);

        let (wait_tx, wait_rx) = oneshot::channel();
        session.wait(move |error| {
            let _ = wait_tx.send(error);
        });

        assert_eq!(wait_rx.await.unwrap(), ServerError::InactivityTimeout);
        drop(client);

        let (tx, rx) = oneshot::channel();
        session.stop(move |result| {
            let _ = tx.send(result);
        });
        rx.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn steady_traffic_keeps_the_timer_quiet() {
        let (mut client, server_side) = socket_pair().await;
        let config = SessionConfig {
            inactivity_timeout: Some(Duration::from_millis(200)),
            ..SessionConfig::default()
        };
        let session = started_session(&config, server_side);

        let (wait_tx, mut wait_rx) = oneshot::channel();
        session.wait(move |error| {
            let _ = wait_tx.send(error);
        });

        // Keep echoing well past the timeout.
        for _ in 0..8 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            client.write_all(b"x").await.unwrap();
            let mut one = [0u8; 1];
            client.read_exact(&mut one).await.unwrap();
            assert!(wait_rx.try_recv().is_err(), "session stopped under traffic");
        }

        // Stop first so the parked wait reports the abort, then close the
        // client so the drain finds EOF.
        let (tx, rx) = oneshot::channel();
        session.stop(move |result| {
            let _ = tx.send(result);
        });
        drop(client);
        rx.await.unwrap().unwrap();
        assert_eq!(wait_rx.await.unwrap(), ServerError::OperationAborted);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn wait_outside_work_reports_invalid_state() {
        let executor = Executor::current();
        let session = Session::new(&executor, &SessionConfig::default(), 0);

        let (tx, rx) = oneshot::channel();
        session.wait(move |error| {
            let _ = tx.send(error);
        });
        assert_eq!(rx.await.unwrap(), ServerError::InvalidState);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn double_wait_reports_invalid_state() {
        let (client, server_side) = socket_pair().await;
        let session = started_session(&SessionConfig::default(), server_side);

        let (first_tx, _first_rx) = oneshot::channel();
        session.wait(move |error| {
            let _ = first_tx.send(error);
        });
        let (second_tx, second_rx) = oneshot::channel();
        session.wait(move |error| {
            let _ = second_tx.send(error);
        });
        assert_eq!(second_rx.await.unwrap(), ServerError::InvalidState);

        drop(client);
        let (tx, rx) = oneshot::channel();
        session.stop(move |result| {
            let _ = tx.send(result);
        });
        rx.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn start_after_stop_reports_operation_aborted() {
        let (client, server_side) = socket_pair().await;
        let session = started_session(&SessionConfig::default(), server_side);

        drop(client);
        let (stop_tx, stop_rx) = oneshot::channel();
        session.stop(move |result| {
            let _ = stop_tx.send(result);
        });
        stop_rx.await.unwrap().unwrap();

        let (late_client, late_server) = socket_pair().await;
        let (tx, rx) = oneshot::channel();
        session.start(late_server, move |result| {
            let _ = tx.send(result);
        });
        assert_eq!(rx.await.unwrap(), Err(ServerError::OperationAborted));
        drop(late_client);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn double_stop_reports_invalid_state() {
        let (client, server_side) = socket_pair().await;
        let session = started_session(&SessionConfig::default(), server_side);

        drop(client);
        let (first_tx, first_rx) = oneshot::channel();
        session.stop(move |result| {
            let _ = first_tx.send(result);
        });
        first_rx.await.unwrap().unwrap();

        let (second_tx, second_rx) = oneshot::channel();
        session.stop(move |result| {
            let _ = second_tx.send(result);
        });
        assert_eq!(second_rx.await.unwrap(), Err(ServerError::InvalidState));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reset_makes_a_stopped_session_reusable() {
        let (mut client, server_side) = socket_pair().await;
        let session = started_session(&SessionConfig::default(), server_side);

        client.write_all(b"a").await.unwrap();
        let mut one = [0u8; 1];
        client.read_exact(&mut one).await.unwrap();

        drop(client);
        let (stop_tx, stop_rx) = oneshot::channel();
        session.stop(move |result| {
            let _ = stop_tx.send(result);
        });
        stop_rx.await.unwrap().unwrap();
        session.reset();

        let (mut second_client, second_server) = socket_pair().await;
        let (start_tx, start_rx) = oneshot::channel();
        session.start(second_server, move |result| {
            let _ = start_tx.send(result);
        });
        start_rx.await.unwrap().unwrap();

        second_client.write_all(b"again").await.unwrap();
        let mut read_back = [0u8; 5];
        second_client.read_exact(&mut read_back).await.unwrap();
        assert_eq!(&read_back, b"again");

        drop(second_client);
        let (tx, rx) = oneshot::channel();
        session.stop(move |result| {
            let _ = tx.send(result);
        });
        rx.await.unwrap().unwrap();
    }
}
