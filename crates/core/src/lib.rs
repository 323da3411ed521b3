//! Shared building blocks for the echokit servers and clients.
//!
//! This crate carries the pieces that both the echo server and the
//! load-test client are built from:
//!
//! - [`error::ServerError`]: the error category shared by every state
//!   machine in the workspace.
//! - [`counter::SaturatingCounter`]: monotonic counters that saturate
//!   instead of wrapping, for operator-facing statistics.
//! - [`buffer::CyclicBuffer`]: the fixed-capacity ring the echo loop
//!   reads into and writes out of.
//! - [`executor::Executor`] and [`executor::Strand`]: a thin contract over
//!   a tokio runtime plus a FIFO serialiser for state-machine steps.
//! - [`slot::HandlerSlot`]: single-occupancy storage that parks a
//!   completion callback until its state machine fires it.

pub mod buffer;
pub mod counter;
pub mod error;
pub mod executor;
pub mod slot;

pub use buffer::CyclicBuffer;
pub use counter::SaturatingCounter;
pub use error::ServerError;
pub use executor::{Executor, Strand};
pub use slot::HandlerSlot;
