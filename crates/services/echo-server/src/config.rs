//! Server configuration types.

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration applied to every managed session.
///
/// Socket options are tri-state: `None` leaves the OS default in place.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Size of the per-session cyclic buffer in bytes.
    pub buffer_size: usize,

    /// Maximum bytes moved by a single read or write operation.
    pub max_transfer_size: usize,

    /// SO_RCVBUF for the session socket.
    pub socket_recv_buffer_size: Option<usize>,

    /// SO_SNDBUF for the session socket.
    pub socket_send_buffer_size: Option<usize>,

    /// TCP_NODELAY for the session socket.
    pub no_delay: Option<bool>,

    /// Close sessions with no successful I/O for this long. `None`
    /// disables the timer entirely.
    pub inactivity_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 4096,
            max_transfer_size: 4096,
            socket_recv_buffer_size: None,
            socket_send_buffer_size: None,
            no_delay: None,
            inactivity_timeout: None,
        }
    }
}

impl SessionConfig {
    /// Check the numeric bounds the CLI also enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::new("buffer_size must be at least 1"));
        }
        if self.max_transfer_size == 0 {
            return Err(ConfigError::new("max_transfer_size must be at least 1"));
        }
        Ok(())
    }
}

/// Configuration for one session manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Endpoint to listen on. Port 0 asks the OS for a free port.
    pub listen_addr: SocketAddr,

    /// TCP listen backlog.
    pub listen_backlog: i32,

    /// Maximum simultaneously active sessions.
    pub max_sessions: usize,

    /// Maximum recycled session wrappers kept for reuse.
    pub recycled_sessions: usize,

    /// Maximum sessions put into the stopping state at once while the
    /// manager itself is stopping.
    pub max_stopping_sessions: usize,

    /// Configuration handed to every managed session.
    pub session: SessionConfig,
}

impl ManagerConfig {
    pub fn new(listen_addr: SocketAddr, session: SessionConfig) -> Self {
        Self {
            listen_addr,
            listen_backlog: 6,
            max_sessions: 10_000,
            recycled_sessions: 100,
            max_stopping_sessions: usize::MAX,
            session,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sessions == 0 {
            return Err(ConfigError::new("max_sessions must be at least 1"));
        }
        if self.max_stopping_sessions == 0 {
            return Err(ConfigError::new("max_stopping_sessions must be at least 1"));
        }
        if self.listen_backlog < 0 {
            return Err(ConfigError::new("listen_backlog must not be negative"));
        }
        self.session.validate()
    }
}

/// How the server lays out its runtimes.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// Worker threads of the session manager's runtime.
    pub session_manager_threads: usize,

    /// Worker threads running session I/O.
    pub session_threads: usize,

    /// One single-threaded runtime per session thread instead of one
    /// shared runtime.
    pub demux_per_work_thread: bool,

    /// How long an operator-requested stop may take before the process
    /// gives up and exits with a failure code.
    pub stop_timeout: Duration,
}

impl ExecConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_manager_threads == 0 {
            return Err(ConfigError::new("session_manager_threads must be at least 1"));
        }
        if self.session_threads == 0 {
            return Err(ConfigError::new("session_threads must be at least 1"));
        }
        Ok(())
    }
}

/// A configuration value outside its allowed range.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid configuration: {message}")]
pub struct ConfigError {
    message: &'static str,
}

impl ConfigError {
    fn new(message: &'static str) -> Self {
        Self { message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_config() -> ManagerConfig {
        ManagerConfig::new("127.0.0.1:0".parse().unwrap(), SessionConfig::default())
    }

    #[test]
    fn defaults_pass_validation() {
        manager_config().validate().unwrap();
        ExecConfig {
            session_manager_threads: 1,
            session_threads: 2,
            demux_per_work_thread: true,
            stop_timeout: Duration::from_secs(60),
        }
        .validate()
        .unwrap();
    }

    #[test]
    fn zero_sized_buffer_is_rejected() {
        let mut config = manager_config();
        config.session.buffer_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_max_sessions_is_rejected() {
        let mut config = manager_config();
        config.max_sessions = 0;
        assert!(config.validate().is_err());
    }
}
