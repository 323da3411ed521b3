//! Error category shared by the echo state machines.

use std::io;
use std::sync::Arc;

/// Errors surfaced by the session and session-manager state machines.
///
/// Everything that is not one of the named conditions passes through as the
/// underlying transport error. The `Io` payload is reference counted because
/// a latched wait error may be cloned into a handler that is parked later.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServerError {
    /// Operation attempted in the wrong external phase.
    #[error("operation attempted in an invalid state")]
    InvalidState,

    /// Operation cancelled by a stop request.
    #[error("operation aborted")]
    OperationAborted,

    /// No successful I/O within the configured inactivity timeout.
    #[error("inactivity timeout expired")]
    InactivityTimeout,

    /// The peer is gone or nothing useful remains to do.
    #[error("out of work")]
    OutOfWork,

    /// A new session could not be allocated.
    #[error("not enough memory to create a session")]
    NoMemory,

    /// `post` was called on an empty handler slot.
    #[error("no handler stored")]
    BadHandlerCall,

    /// Transport or OS-level error, passed through unchanged.
    #[error("i/o error: {0}")]
    Io(Arc<io::Error>),
}

impl ServerError {
    /// Wrap a transport error.
    pub fn io(error: io::Error) -> Self {
        ServerError::Io(Arc::new(error))
    }
}

impl From<io::Error> for ServerError {
    fn from(error: io::Error) -> Self {
        ServerError::io(error)
    }
}

impl PartialEq for ServerError {
    fn eq(&self, other: &Self) -> bool {
        use ServerError::*;
        match (self, other) {
            (InvalidState, InvalidState)
            | (OperationAborted, OperationAborted)
            | (InactivityTimeout, InactivityTimeout)
            | (OutOfWork, OutOfWork)
            | (NoMemory, NoMemory)
            | (BadHandlerCall, BadHandlerCall) => true,
            (Io(a), Io(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}

impl Eq for ServerError {}
