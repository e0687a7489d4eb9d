//! Control-region layout.
//!
//! The control region is the only memory both processes mutate concurrently,
//! so its layout is ABI: field offsets and widths must never change without
//! bumping [`CONTROL_VERSION`]. Everything in it is accessed through atomics.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

/// `b"PLUM"` as a little-endian `u32`.
pub const CONTROL_MAGIC: u32 = u32::from_le_bytes(*b"PLUM");

/// Control-region ABI version.
pub const CONTROL_VERSION: u32 = 1;

/// Consumer-side drain state. Initial value is `Processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReaderState {
    Processing = 0,
    AboutToWait = 1,
    Waiting = 2,
    Paused = 3,
    Stopped = 4,
    Failed = 5,
}

impl ReaderState {
    pub fn from_u8(v: u8) -> Option<ReaderState> {
        Some(match v {
            0 => ReaderState::Processing,
            1 => ReaderState::AboutToWait,
            2 => ReaderState::Waiting,
            3 => ReaderState::Paused,
            4 => ReaderState::Stopped,
            5 => ReaderState::Failed,
            _ => return None,
        })
    }
}

/// Producer-side state, mirroring the reader's wait dance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WriterState {
    Processing = 0,
    AboutToWait = 1,
    Waiting = 2,
    Failed = 3,
}

impl WriterState {
    pub fn from_u8(v: u8) -> Option<WriterState> {
        Some(match v {
            0 => WriterState::Processing,
            1 => WriterState::AboutToWait,
            2 => WriterState::Waiting,
            3 => WriterState::Failed,
            _ => return None,
        })
    }
}

/// The fixed structure at offset 0 of the control region.
///
/// Overlaid onto the shared mapping by both sides; never constructed by
/// value outside of tests. `event_count` is incremented only by the
/// producer, `processed_count` only by the consumer. The semaphore words
/// are the futex words of the two counting semaphores.
#[repr(C)]
pub struct ControlBlock {
    pub magic: AtomicU32,
    pub version: AtomicU32,
    pub event_count: AtomicU64,
    pub processed_count: AtomicU64,
    pub reader_state: AtomicU8,
    pub writer_state: AtomicU8,
    /// Set once at teardown; every blocking wait re-checks it.
    pub closed: AtomicU8,
    _pad: [u8; 5],
    pub reader_sem: AtomicU32,
    pub writer_sem: AtomicU32,
}

/// Size of the control block in bytes. The control region must be at least
/// this large.
pub const CONTROL_BYTES: usize = std::mem::size_of::<ControlBlock>();

const _: () = assert!(std::mem::size_of::<ControlBlock>() == 40);
const _: () = assert!(std::mem::align_of::<ControlBlock>() == 8);

impl ControlBlock {
    /// Overlay the block onto a mapped control region.
    ///
    /// # Safety
    ///
    /// `ptr` must point at a live mapping of at least [`CONTROL_BYTES`]
    /// bytes, 8-byte aligned (mmap guarantees page alignment), valid for the
    /// lifetime of the returned reference.
    pub unsafe fn from_ptr<'a>(ptr: *mut u8) -> &'a ControlBlock {
        debug_assert!(ptr as usize % std::mem::align_of::<ControlBlock>() == 0);
        &*(ptr as *const ControlBlock)
    }

    /// Producer-side one-time initialization of a fresh control region.
    pub fn init(&self) {
        self.event_count.store(0, Ordering::Relaxed);
        self.processed_count.store(0, Ordering::Relaxed);
        self.reader_state
            .store(ReaderState::Processing as u8, Ordering::Relaxed);
        self.writer_state
            .store(WriterState::Processing as u8, Ordering::Relaxed);
        self.closed.store(0, Ordering::Relaxed);
        self.reader_sem.store(0, Ordering::Relaxed);
        self.writer_sem.store(0, Ordering::Relaxed);
        self.version.store(CONTROL_VERSION, Ordering::Relaxed);
        // Magic last: a consumer that sees it can rely on the rest.
        self.magic.store(CONTROL_MAGIC, Ordering::Release);
    }

    /// Consumer-side validation before first use.
    pub fn validate(&self) -> Result<(), ControlError> {
        let magic = self.magic.load(Ordering::Acquire);
        if magic != CONTROL_MAGIC {
            return Err(ControlError::BadMagic(magic));
        }
        let version = self.version.load(Ordering::Relaxed);
        if version != CONTROL_VERSION {
            return Err(ControlError::VersionMismatch(version));
        }
        Ok(())
    }

    pub fn reader_state(&self) -> Option<ReaderState> {
        ReaderState::from_u8(self.reader_state.load(Ordering::SeqCst))
    }

    pub fn writer_state(&self) -> Option<WriterState> {
        WriterState::from_u8(self.writer_state.load(Ordering::SeqCst))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) != 0
    }

    /// Events appended but not yet processed.
    pub fn pending(&self) -> u64 {
        let events = self.event_count.load(Ordering::SeqCst);
        let processed = self.processed_count.load(Ordering::SeqCst);
        events.saturating_sub(processed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("control region magic mismatch: 0x{0:08x}")]
    BadMagic(u32),
    #[error("control region version mismatch: {0}")]
    VersionMismatch(u32),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::MaybeUninit;

    fn fresh_block() -> Box<ControlBlock> {
        // Overlay semantics: the shared region arrives zeroed, init() runs
        // on top of whatever is there.
        let block = unsafe { MaybeUninit::<ControlBlock>::zeroed().assume_init() };
        let block = Box::new(block);
        block.init();
        block
    }

    #[test]
    fn init_then_validate() {
        let block = fresh_block();
        block.validate().unwrap();
        assert_eq!(block.reader_state(), Some(ReaderState::Processing));
        assert_eq!(block.writer_state(), Some(WriterState::Processing));
        assert!(!block.is_closed());
        assert_eq!(block.pending(), 0);
    }

    #[test]
    fn validate_rejects_garbage() {
        let block = fresh_block();
        block.magic.store(0xdead_beef, Ordering::SeqCst);
        assert!(matches!(block.validate(), Err(ControlError::BadMagic(_))));
    }

    #[test]
    fn validate_rejects_future_version() {
        let block = fresh_block();
        block.version.store(CONTROL_VERSION + 1, Ordering::SeqCst);
        assert!(matches!(
            block.validate(),
            Err(ControlError::VersionMismatch(_))
        ));
    }

    #[test]
    fn state_encodings_round_trip() {
        for v in 0..=5u8 {
            assert_eq!(ReaderState::from_u8(v).map(|s| s as u8), Some(v));
        }
        assert_eq!(ReaderState::from_u8(6), None);
        for v in 0..=3u8 {
            assert_eq!(WriterState::from_u8(v).map(|s| s as u8), Some(v));
        }
        assert_eq!(WriterState::from_u8(4), None);
    }

    #[test]
    fn pending_counts_unprocessed_events() {
        let block = fresh_block();
        block.event_count.store(10, Ordering::SeqCst);
        block.processed_count.store(4, Ordering::SeqCst);
        assert_eq!(block.pending(), 6);
    }
}
