//! Wire contract of the plume transport.
//!
//! Two halves, both with fixed versioned layouts since the producer and
//! consumer processes read them without negotiation:
//! - [`control`]: the control-region block holding the shared counters,
//!   state words and semaphore words.
//! - [`record`]: the tagged, self-delimiting command-log records appended
//!   into data buffers.

pub mod control;
pub mod record;

pub use control::{
    ControlBlock, ControlError, ReaderState, WriterState, CONTROL_BYTES, CONTROL_MAGIC,
    CONTROL_VERSION,
};
pub use record::{
    decode_record, encode_record, encode_record_into, DrawOp, LockMode, Record, RecordDecodeError,
    SurfaceDesc, SurfaceFormat, SurfaceRecord, SurfaceUsage, TransportRecord, MAX_RECORD_BYTES,
};

/// Producer-assigned surface id, unique per connection.
pub type OwnerId = u32;
