//! The stream transport: a control region both processes map, plus a
//! rotating set of data-buffer regions exclusively owned by one side at a
//! time. Two counting semaphores (futex words in the control region) carry
//! all wakeups.
//!
//! [`StreamWriter`] is the producer half: it appends command-log records
//! into the current data buffer, rotating to the next buffer (or blocking)
//! on exhaustion. [`StreamReader`] is the consumer half: it drains records
//! in exact append order, recycles buffers, and parks in `Stopped` or
//! `Paused` per the protocol state machine.

mod control_region;
mod reader;
mod writer;

pub use control_region::ControlRegion;
pub use reader::{NextEvent, StreamReader};
pub use writer::{AppendStatus, ConnectionHandles, StreamWriter};

use std::time::Duration;

use plume_protocol::{ControlError, RecordDecodeError};
use plume_shmem::ShmemError;

/// Transport-level failures. `Failed` and `Closed` are sticky for the
/// connection; shmem errors during setup are surfaced to the caller and
/// treated as recoverable there.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Shmem(#[from] ShmemError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("malformed record: {0}")]
    Decode(#[from] RecordDecodeError),

    #[error("record exceeds data buffer capacity")]
    RecordTooLarge,

    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// The connection is permanently failed (reader or writer state).
    #[error("connection failed")]
    Failed,

    /// The connection was closed by either side.
    #[error("connection closed")]
    Closed,
}

/// Connection parameters shared by both sides.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Capacity of each data buffer.
    pub buffer_bytes: usize,
    /// Buffers created up front. Must be at least 2 for rotation.
    pub initial_buffers: usize,
    /// Greedy-drain iterations before the reader considers waiting.
    pub spin_budget: u32,
    /// Bounded timeout for semaphore waits; a timed-out reader resolves to
    /// `Stopped`, a timed-out writer re-checks and re-arms.
    pub wait_timeout: Duration,
    /// Spare buffers kept mapped on the consumer side; mappings above this
    /// are released when the translator goes idle.
    pub max_spare_buffers: usize,
    /// Records the consumer processes per batch before cooperatively
    /// yielding (ignored while draining toward a checkpoint).
    pub batch_records: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            buffer_bytes: 256 * 1024,
            initial_buffers: 2,
            spin_budget: 64,
            wait_timeout: Duration::from_millis(100),
            max_spare_buffers: 4,
            batch_records: 128,
        }
    }
}
