use std::sync::atomic::Ordering;

use plume_protocol::{ControlBlock, ReaderState, WriterState, CONTROL_BYTES};
use plume_shmem::{sem, Mapping, Region};

use crate::TransportError;

/// Both sides' view of the shared control region.
///
/// Owns the region handle and a writable mapping for the lifetime of the
/// connection; the [`ControlBlock`] overlay is re-derived per access so no
/// self-referential borrow is held.
pub struct ControlRegion {
    region: Region,
    map: Mapping,
}

impl ControlRegion {
    /// Producer side: create and initialize a fresh control region.
    pub fn create() -> Result<ControlRegion, TransportError> {
        let size = CONTROL_BYTES.max(plume_shmem::allocation_granularity()) as u64;
        let region = Region::create(size)?;
        let map = region.map()?;
        let this = ControlRegion { region, map };
        this.block().init();
        Ok(this)
    }

    /// Consumer side: map and validate a received control region.
    pub fn open(region: Region) -> Result<ControlRegion, TransportError> {
        if (region.size() as usize) < CONTROL_BYTES {
            return Err(TransportError::Protocol("control region too small"));
        }
        let map = region.map()?;
        let this = ControlRegion { region, map };
        this.block().validate()?;
        Ok(this)
    }

    /// Duplicate the region handle for the peer process.
    pub fn share(&self) -> Result<Region, TransportError> {
        Ok(self.region.try_clone()?)
    }

    pub fn block(&self) -> &ControlBlock {
        // SAFETY: map is a live writable mapping of at least CONTROL_BYTES,
        // page-aligned, held for as long as self.
        unsafe { ControlBlock::from_ptr(self.map.as_ptr()) }
    }

    /// Wake the reader if (and only if) it is exactly `Waiting`.
    ///
    /// A reader in `AboutToWait` is mid-decision and re-checks the event
    /// count itself; forcing it would race its own transition.
    pub fn signal_reader(&self) {
        let block = self.block();
        if block
            .reader_state
            .compare_exchange(
                ReaderState::Waiting as u8,
                ReaderState::Processing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            sem::post(&block.reader_sem);
        }
    }

    /// Wake the writer if (and only if) it is exactly `Waiting`. Same
    /// AboutToWait rule as [`signal_reader`](Self::signal_reader).
    pub fn signal_writer(&self) {
        let block = self.block();
        if block
            .writer_state
            .compare_exchange(
                WriterState::Waiting as u8,
                WriterState::Processing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            sem::post(&block.writer_sem);
        }
    }

    /// Idempotent teardown: set the closed flag first, then wake both sides
    /// so any blocking wait re-checks it.
    pub fn close(&self) {
        let block = self.block();
        block.closed.store(1, Ordering::SeqCst);
        sem::post(&block.reader_sem);
        sem::post(&block.writer_sem);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_open_validates() {
        let control = ControlRegion::create().unwrap();
        let peer = ControlRegion::open(control.share().unwrap()).unwrap();
        assert_eq!(peer.block().pending(), 0);
        assert!(!peer.block().is_closed());
    }

    #[test]
    fn signal_reader_only_when_waiting() {
        let control = ControlRegion::create().unwrap();
        let block = control.block();

        // Processing: no wake, no semaphore count.
        control.signal_reader();
        assert!(!sem::try_acquire(&block.reader_sem));
        assert_eq!(block.reader_state(), Some(ReaderState::Processing));

        // AboutToWait: left alone.
        block
            .reader_state
            .store(ReaderState::AboutToWait as u8, Ordering::SeqCst);
        control.signal_reader();
        assert!(!sem::try_acquire(&block.reader_sem));
        assert_eq!(block.reader_state(), Some(ReaderState::AboutToWait));

        // Waiting: exactly one post, state moves to Processing.
        block
            .reader_state
            .store(ReaderState::Waiting as u8, Ordering::SeqCst);
        control.signal_reader();
        assert_eq!(block.reader_state(), Some(ReaderState::Processing));
        assert!(sem::try_acquire(&block.reader_sem));
        assert!(!sem::try_acquire(&block.reader_sem));
    }

    #[test]
    fn close_is_idempotent_and_wakes_both() {
        let control = ControlRegion::create().unwrap();
        control.close();
        control.close();
        let block = control.block();
        assert!(block.is_closed());
        assert!(sem::try_acquire(&block.reader_sem));
        assert!(sem::try_acquire(&block.writer_sem));
    }
}
