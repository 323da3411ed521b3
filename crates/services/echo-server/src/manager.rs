//! Accept loop, admission control and session lifecycle.
//!
//! The manager owns the listening endpoint and a pool of session wrappers
//! kept in a slab; continuations carry the wrapper's slab key and
//! re-resolve it on the manager's strand, so a completion that arrives
//! after its wrapper moved on simply observes the new state instead of
//! keeping anything alive.
//!
//! One accept is outstanding at a time. When the active-session cap is
//! reached the acceptor is closed and reopened once headroom returns, so
//! back-pressure is visible to peers instead of silently queueing.

use std::net::SocketAddr;
use std::sync::Arc;

use echokit_core::{Executor, HandlerSlot, ServerError, Strand};
use parking_lot::Mutex;
use slab::Slab;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use crate::config::ManagerConfig;
use crate::factory::SharedSessionFactory;
use crate::session::Session;
use crate::stats::{ManagerStats, StatsCollector};

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
    Stop,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptState {
    Ready,
    InProgress,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WrapperState {
    Ready,
    Starting,
    Working,
    Stopping,
    Stopped,
}

/// Per-session book-keeping owned by the manager.
struct SessionWrapper {
    session: Option<Session>,
    state: WrapperState,
    pending_operations: usize,
    /// Connection held between accept completion and session start.
    accepted: Option<(TcpStream, SocketAddr)>,
    remote: Option<SocketAddr>,
    /// Position in the active list while the wrapper is in it.
    active_pos: usize,
}

impl SessionWrapper {
    fn new(session: Session) -> Self {
        Self {
            session: Some(session),
            state: WrapperState::Ready,
            pending_operations: 0,
            accepted: None,
            remote: None,
            active_pos: 0,
        }
    }

    fn attach(&mut self, session: Session) {
        self.session = Some(session);
        self.state = WrapperState::Ready;
        self.pending_operations = 0;
        self.accepted = None;
        self.remote = None;
    }
}

struct ManagerState {
    extern_state: ExternState,
    intern_state: InternState,
    accept_state: AcceptState,
    pending_operations: usize,

    acceptor: Option<Arc<TcpListener>>,
    accept_cancel: Option<Arc<Notify>>,
    /// Endpoint actually bound; keeps an OS-assigned port stable across
    /// back-pressure close/reopen cycles.
    bound_addr: Option<SocketAddr>,

    wrappers: Slab<SessionWrapper>,
    active: Vec<usize>,
    recycled: Vec<usize>,
    /// Wrappers currently in the stopping state.
    stopping: usize,

    wait_error: Option<ServerError>,
}

struct ManagerShared {
    executor: Executor,
    strand: Strand,
    factory: SharedSessionFactory,
    config: ManagerConfig,
    stats: StatsCollector,
    state: Mutex<ManagerState>,
    wait_handler: HandlerSlot<ServerError>,
    stop_handler: HandlerSlot<Result<(), ServerError>>,
}

/// The echo server's session manager.
///
/// Cloning yields another handle to the same manager.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<ManagerShared>,
}

impl SessionManager {
    pub fn new(executor: &Executor, factory: SharedSessionFactory, config: ManagerConfig) -> Self {
        let shared = Arc::new(ManagerShared {
            executor: executor.clone(),
            strand: executor.strand(),
            factory,
            config,
            stats: StatsCollector::new(),
            state: Mutex::new(ManagerState {
                extern_state: ExternState::Ready,
                intern_state: InternState::Work,
                accept_state: AcceptState::Ready,
                pending_operations: 0,
                acceptor: None,
                accept_cancel: None,
                bound_addr: None,
                wrappers: Slab::new(),
                active: Vec::new(),
                recycled: Vec::new(),
                stopping: 0,
                wait_error: None,
            }),
            wait_handler: HandlerSlot::new(executor),
            stop_handler: HandlerSlot::new(executor),
        });
        Self { shared }
    }

    /// Open the acceptor and begin admitting connections.
    pub fn start<H>(&self, handler: H)
    where
        H: FnOnce(Result<(), ServerError>) + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        self.shared
            .strand
            .post(move || ManagerShared::do_start(&shared, handler));
    }

    /// Park a callback that fires once, when the manager runs out of work
    /// or an operator stop begins.
    pub fn wait<H>(&self, handler: H)
    where
        H: FnOnce(ServerError) + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        self.shared
            .strand
            .post(move || ManagerShared::do_wait(&shared, handler));
    }

    /// Close the acceptor and stop every active session; `handler` fires
    /// when nothing remains in flight.
    pub fn stop<H>(&self, handler: H)
    where
        H: FnOnce(Result<(), ServerError>) + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        self.shared
            .strand
            .post(move || ManagerShared::do_stop(&shared, handler));
    }

    pub fn stats(&self) -> ManagerStats {
        self.shared.stats.snapshot()
    }

    /// The endpoint the acceptor is (or was) bound to.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.shared.state.lock().bound_addr
    }
}

impl ManagerShared {
    // --- external operations --------------------------------------------

    fn do_start<H>(shared: &Arc<ManagerShared>, handler: H)
    where
        H: FnOnce(Result<(), ServerError>) + Send + 'static,
    {
        let mut st = shared.state.lock();
        if st.extern_state != ExternState::Ready {
            drop(st);
            shared
                .executor
                .post(move || handler(Err(ServerError::InvalidState)));
            return;
        }

        st.extern_state = ExternState::Work;
        ManagerShared::continue_work(shared, &mut st);

        if st.intern_state == InternState::Stopped {
            st.extern_state = ExternState::Stopped;
            let error = st.wait_error.clone().unwrap_or(ServerError::OutOfWork);
            drop(st);
            shared.executor.post(move || handler(Err(error)));
            return;
        }

        if let Some(addr) = st.bound_addr {
            tracing::info!(%addr, "session manager accepting connections");
        }
        drop(st);
        shared.executor.post(move || handler(Ok(())));
    }

    fn do_wait<H>(shared: &Arc<ManagerShared>, handler: H)
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
            let error = st.wait_error.clone().unwrap_or(ServerError::OutOfWork);
            drop(st);
            shared.executor.post(move || handler(error));
            return;
        }
        drop(st);
        shared.wait_handler.store(handler);
    }

    fn do_stop<H>(shared: &Arc<ManagerShared>, handler: H)
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
        ManagerShared::complete_extern_wait(shared, &mut st, Some(ServerError::OperationAborted));

        if st.intern_state == InternState::Work {
            ManagerShared::start_stop(shared, &mut st, Some(ServerError::OperationAborted));
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

    // --- admission -------------------------------------------------------

    fn out_of_work(st: &ManagerState) -> bool {
        st.active.is_empty() && st.accept_state == AcceptState::Stopped
    }

    fn continue_work(shared: &Arc<ManagerShared>, st: &mut ManagerState) {
        debug_assert_eq!(st.intern_state, InternState::Work);

        if ManagerShared::out_of_work(st) {
            ManagerShared::start_stop(shared, st, Some(ServerError::OutOfWork));
            return;
        }

        if st.accept_state != AcceptState::Ready {
            return;
        }

        if st.active.len() >= shared.config.max_sessions {
            // Back-pressure: stop listening until headroom returns.
            if st.acceptor.is_some() {
                tracing::debug!(
                    max_sessions = shared.config.max_sessions,
                    "session cap reached, closing acceptor"
                );
                ManagerShared::close_acceptor(st);
            }
            return;
        }

        if st.acceptor.is_none() {
            if let Err(error) = ManagerShared::open_acceptor(shared, st) {
                tracing::warn!(%error, "failed to open acceptor");
                st.accept_state = AcceptState::Stopped;
                if ManagerShared::out_of_work(st) {
                    ManagerShared::start_stop(shared, st, Some(error));
                }
                return;
            }
        }

        match ManagerShared::obtain_wrapper(shared, st) {
            Ok(key) => ManagerShared::start_accept(shared, st, key),
            Err(error) => {
                if !st.active.is_empty() {
                    // Admission pauses; a finishing session retries it.
                    return;
                }
                tracing::warn!(%error, "cannot create a session and none are active");
                st.accept_state = AcceptState::Stopped;
                if ManagerShared::out_of_work(st) {
                    ManagerShared::start_stop(shared, st, Some(error));
                }
            }
        }
    }

    fn open_acceptor(shared: &Arc<ManagerShared>, st: &mut ManagerState) -> Result<(), ServerError> {
        let addr = st.bound_addr.unwrap_or(shared.config.listen_addr);
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(shared.config.listen_backlog)?;
        socket.set_nonblocking(true)?;
        let listener = TcpListener::from_std(socket.into())?;
        st.bound_addr = Some(listener.local_addr()?);
        st.acceptor = Some(Arc::new(listener));
        Ok(())
    }

    fn close_acceptor(st: &mut ManagerState) {
        st.acceptor = None;
        if let Some(cancel) = st.accept_cancel.take() {
            cancel.notify_one();
        }
    }

    fn obtain_wrapper(shared: &Arc<ManagerShared>, st: &mut ManagerState) -> Result<usize, ServerError> {
        let session = shared.factory.create(&shared.config.session)?;
        let key = if let Some(key) = st.recycled.pop() {
            st.wrappers[key].attach(session);
            key
        } else {
            st.wrappers.insert(SessionWrapper::new(session))
        };
        shared.stats.set_recycled_session_count(st.recycled.len());
        Ok(key)
    }

    fn start_accept(shared: &Arc<ManagerShared>, st: &mut ManagerState, key: usize) {
        let listener = match st.acceptor.clone() {
            Some(listener) => listener,
            None => {
                st.accept_state = AcceptState::Stopped;
                return;
            }
        };
        let cancel = Arc::new(Notify::new());
        st.accept_cancel = Some(Arc::clone(&cancel));
        st.accept_state = AcceptState::InProgress;
        st.pending_operations += 1;

        let shared = Arc::clone(shared);
        let executor = shared.executor.clone();
        executor.spawn(async move {
            let outcome = tokio::select! {
                result = listener.accept() => result.map_err(ServerError::io),
                _ = cancel.notified() => Err(ServerError::OperationAborted),
            };
            drop(listener);
            let strand = shared.strand.clone();
            strand.post(move || ManagerShared::handle_accept(&shared, key, outcome));
        });
    }

    fn handle_accept(
        shared: &Arc<ManagerShared>,
        key: usize,
        outcome: Result<(TcpStream, SocketAddr), ServerError>,
    ) {
        let mut st = shared.state.lock();
        debug_assert_eq!(st.accept_state, AcceptState::InProgress);
        st.accept_cancel = None;
        st.pending_operations -= 1;
        shared.stats.session_accepted(outcome.is_ok());

        match st.intern_state {
            InternState::Work => match outcome {
                Err(error) => {
                    if error != ServerError::OperationAborted {
                        tracing::warn!(%error, "accept failed");
                    }
                    st.accept_state = AcceptState::Stopped;
                    ManagerShared::recycle(shared, &mut st, key);
                    ManagerShared::continue_work(shared, &mut st);
                }
                Ok((socket, remote)) => {
                    st.accept_state = AcceptState::Ready;
                    if st.active.len() >= shared.config.max_sessions {
                        // Raced with concurrent admissions; treat as an
                        // immediately aborted session.
                        shared.stats.session_stopped(&ServerError::OperationAborted);
                        drop(socket);
                        ManagerShared::recycle(shared, &mut st, key);
                        ManagerShared::continue_work(shared, &mut st);
                        return;
                    }
                    tracing::debug!(%remote, "connection accepted");
                    let wrapper = &mut st.wrappers[key];
                    wrapper.accepted = Some((socket, remote));
                    wrapper.remote = Some(remote);
                    ManagerShared::add_to_active(shared, &mut st, key);
                    ManagerShared::start_session_start(shared, &mut st, key);
                    ManagerShared::continue_work(shared, &mut st);
                }
            },
            InternState::Stop => {
                st.accept_state = AcceptState::Stopped;
                if outcome.is_ok() {
                    // Accepted, but the manager is stopping: drop it.
                    shared.stats.session_stopped(&ServerError::OperationAborted);
                }
                ManagerShared::recycle(shared, &mut st, key);
                ManagerShared::continue_stop(shared, &mut st);
            }
            InternState::Stopped => unreachable!("accept completion after stop finished"),
        }
    }

    // --- session operations ---------------------------------------------

    fn start_session_start(shared: &Arc<ManagerShared>, st: &mut ManagerState, key: usize) {
        let shared_for_handler = Arc::clone(shared);
        let handler = shared
            .strand
            .wrap(move |result| ManagerShared::handle_session_start(&shared_for_handler, key, result));

        let wrapper = &mut st.wrappers[key];
        let (socket, _remote) = match wrapper.accepted.take() {
            Some(accepted) => accepted,
            None => return,
        };
        let session = match wrapper.session.as_ref() {
            Some(session) => session,
            None => return,
        };
        wrapper.state = WrapperState::Starting;
        wrapper.pending_operations += 1;
        session.start(socket, handler);
        st.pending_operations += 1;
    }

    fn start_session_wait(shared: &Arc<ManagerShared>, st: &mut ManagerState, key: usize) {
        let shared_for_handler = Arc::clone(shared);
        let handler = shared
            .strand
            .wrap(move |error| ManagerShared::handle_session_wait(&shared_for_handler, key, error));

        let wrapper = &mut st.wrappers[key];
        let session = match wrapper.session.as_ref() {
            Some(session) => session,
            None => return,
        };
        wrapper.pending_operations += 1;
        session.wait(handler);
        st.pending_operations += 1;
    }

    fn start_session_stop(shared: &Arc<ManagerShared>, st: &mut ManagerState, key: usize) {
        let shared_for_handler = Arc::clone(shared);
        let handler = shared
            .strand
            .wrap(move |result| ManagerShared::handle_session_stop(&shared_for_handler, key, result));

        let wrapper = &mut st.wrappers[key];
        let session = match wrapper.session.as_ref() {
            Some(session) => session,
            None => return,
        };
        wrapper.state = WrapperState::Stopping;
        wrapper.pending_operations += 1;
        session.stop(handler);
        st.pending_operations += 1;
        st.stopping += 1;
    }

    fn handle_session_start(
        shared: &Arc<ManagerShared>,
        key: usize,
        result: Result<(), ServerError>,
    ) {
        let mut st = shared.state.lock();
        st.pending_operations -= 1;
        st.wrappers[key].pending_operations -= 1;

        if st.wrappers[key].state != WrapperState::Starting {
            // A stop overtook the start; the session counts as shut down.
            shared.stats.session_stopped(&ServerError::OperationAborted);
            ManagerShared::recycle(shared, &mut st, key);
            ManagerShared::continue_after_completion(shared, &mut st);
            return;
        }

        match st.intern_state {
            InternState::Work => {
                if let Err(error) = result {
                    tracing::debug!(%error, "session failed to start");
                    shared.stats.session_stopped(&error);
                    st.wrappers[key].state = WrapperState::Stopped;
                    ManagerShared::remove_from_active(shared, &mut st, key);
                    ManagerShared::recycle(shared, &mut st, key);
                    ManagerShared::continue_work(shared, &mut st);
                    return;
                }
                st.wrappers[key].state = WrapperState::Working;
                ManagerShared::start_session_wait(shared, &mut st, key);
                ManagerShared::continue_work(shared, &mut st);
            }
            InternState::Stop => {
                if let Err(error) = result {
                    shared.stats.session_stopped(&error);
                    st.wrappers[key].state = WrapperState::Stopped;
                    ManagerShared::remove_from_active(shared, &mut st, key);
                    ManagerShared::recycle(shared, &mut st, key);
                    ManagerShared::continue_stop(shared, &mut st);
                    return;
                }
                // Started into a stopping manager: shut it down at once.
                shared.stats.session_stopped(&ServerError::OperationAborted);
                ManagerShared::start_session_stop(shared, &mut st, key);
                ManagerShared::continue_stop(shared, &mut st);
            }
            InternState::Stopped => unreachable!("session start completion after stop finished"),
        }
    }

    fn handle_session_wait(shared: &Arc<ManagerShared>, key: usize, error: ServerError) {
        let mut st = shared.state.lock();
        st.pending_operations -= 1;
        st.wrappers[key].pending_operations -= 1;

        if st.wrappers[key].state != WrapperState::Working {
            // The manager already stopped this session itself.
            shared.stats.session_stopped(&ServerError::OperationAborted);
            ManagerShared::recycle(shared, &mut st, key);
            ManagerShared::continue_after_completion(shared, &mut st);
            return;
        }

        if let Some(remote) = st.wrappers[key].remote {
            tracing::debug!(%remote, %error, "session finished");
        }
        shared.stats.session_stopped(&error);
        ManagerShared::start_session_stop(shared, &mut st, key);
        ManagerShared::continue_after_completion(shared, &mut st);
    }

    fn handle_session_stop(
        shared: &Arc<ManagerShared>,
        key: usize,
        result: Result<(), ServerError>,
    ) {
        let mut st = shared.state.lock();
        st.pending_operations -= 1;
        st.wrappers[key].pending_operations -= 1;

        if st.wrappers[key].state != WrapperState::Stopping {
            ManagerShared::recycle(shared, &mut st, key);
            ManagerShared::continue_after_completion(shared, &mut st);
            return;
        }

        // Double stops are prevented by the wrapper state machine.
        debug_assert!(result.is_ok(), "session stop failed: {result:?}");
        st.stopping -= 1;
        st.wrappers[key].state = WrapperState::Stopped;
        ManagerShared::remove_from_active(shared, &mut st, key);
        ManagerShared::recycle(shared, &mut st, key);

        if st.intern_state == InternState::Stop {
            ManagerShared::pump_session_stops(shared, &mut st);
        }
        ManagerShared::continue_after_completion(shared, &mut st);
    }

    fn continue_after_completion(shared: &Arc<ManagerShared>, st: &mut ManagerState) {
        match st.intern_state {
            InternState::Work => ManagerShared::continue_work(shared, st),
            InternState::Stop => ManagerShared::continue_stop(shared, st),
            InternState::Stopped => unreachable!("completion after stop finished"),
        }
    }

    // --- stop ------------------------------------------------------------

    fn start_stop(shared: &Arc<ManagerShared>, st: &mut ManagerState, error: Option<ServerError>) {
        debug_assert_eq!(st.intern_state, InternState::Work);
        st.intern_state = InternState::Stop;

        if st.acceptor.is_some() {
            ManagerShared::close_acceptor(st);
        }
        if st.accept_state == AcceptState::Ready {
            st.accept_state = AcceptState::Stopped;
        }

        ManagerShared::pump_session_stops(shared, st);

        if st.extern_state == ExternState::Work {
            ManagerShared::complete_extern_wait(shared, st, error);
        }

        ManagerShared::continue_stop(shared, st);
    }

    /// Send stop to active sessions that are not stopping yet, bounded by
    /// the configured stopping cap; called again as stops complete.
    fn pump_session_stops(shared: &Arc<ManagerShared>, st: &mut ManagerState) {
        let cap = shared.config.max_stopping_sessions;
        let candidates: Vec<usize> = st.active.clone();
        for key in candidates {
            if st.stopping >= cap {
                break;
            }
            if matches!(
                st.wrappers[key].state,
                WrapperState::Starting | WrapperState::Working
            ) {
                ManagerShared::start_session_stop(shared, st, key);
            }
        }
    }

    fn continue_stop(shared: &Arc<ManagerShared>, st: &mut ManagerState) {
        debug_assert_eq!(st.intern_state, InternState::Stop);
        if st.pending_operations == 0 {
            debug_assert_eq!(st.accept_state, AcceptState::Stopped);
            debug_assert!(st.active.is_empty(), "active sessions remain");

            st.intern_state = InternState::Stopped;
            tracing::info!("session manager stopped");
            if st.extern_state == ExternState::Stop {
                st.extern_state = ExternState::Stopped;
                if shared.stop_handler.has_target() {
                    let _ = shared.stop_handler.post(Ok(()));
                }
            }
        }
    }

    // --- lists and recycling --------------------------------------------

    fn add_to_active(shared: &Arc<ManagerShared>, st: &mut ManagerState, key: usize) {
        st.wrappers[key].active_pos = st.active.len();
        st.active.push(key);
        shared.stats.set_active_session_count(st.active.len());
    }

    fn remove_from_active(shared: &Arc<ManagerShared>, st: &mut ManagerState, key: usize) {
        let pos = st.wrappers[key].active_pos;
        debug_assert_eq!(st.active[pos], key);
        st.active.swap_remove(pos);
        if pos < st.active.len() {
            let moved = st.active[pos];
            st.wrappers[moved].active_pos = pos;
        }
        shared.stats.set_active_session_count(st.active.len());
    }

    /// Return the wrapper's session to the factory and pool the wrapper,
    /// unless operations are still pending on it.
    fn recycle(shared: &Arc<ManagerShared>, st: &mut ManagerState, key: usize) {
        if st.wrappers[key].pending_operations > 0 {
            return;
        }

        if let Some(session) = st.wrappers[key].session.take() {
            session.reset();
            shared.factory.release(session);
        }

        if st.recycled.len() < shared.config.recycled_sessions {
            let wrapper = &mut st.wrappers[key];
            wrapper.state = WrapperState::Ready;
            wrapper.accepted = None;
            wrapper.remote = None;
            st.recycled.push(key);
        } else {
            st.wrappers.remove(key);
        }
        shared.stats.set_recycled_session_count(st.recycled.len());
    }

    // --- completion plumbing --------------------------------------------

    fn complete_extern_wait(
        shared: &Arc<ManagerShared>,
        st: &mut ManagerState,
        error: Option<ServerError>,
    ) {
        if st.wait_error.is_none() {
            st.wait_error = error;
        }
        if shared.wait_handler.has_target() {
            let error = st.wait_error.clone().unwrap_or(ServerError::OutOfWork);
            let _ = shared.wait_handler.post(error);
        }
    }
}
