use std::collections::VecDeque;
use std::sync::atomic::Ordering;

use plume_protocol::{
    decode_record, ReaderState, Record, TransportRecord, MAX_RECORD_BYTES,
};
use plume_shmem::{sem, Mapping, Region, ShmemError};

use crate::{ConnectionConfig, ConnectionHandles, ControlRegion, TransportError};

/// Outcome of one [`StreamReader::next_event`] call.
#[derive(Debug)]
pub enum NextEvent {
    /// A record for the caller to dispatch; call
    /// [`StreamReader::finish_record`] once it has been handled.
    Record(Record),
    /// The reader parked in `Stopped`; the producer restarts it on its next
    /// append.
    Stopped,
    /// A `Pause` record parked the reader in `Paused`.
    Paused,
    /// The connection was closed.
    Closed,
}

struct ConsumerBuffer {
    region: Region,
    /// Mapped lazily and released again when the buffer goes dormant.
    map: Option<Mapping>,
    offset: usize,
}

impl ConsumerBuffer {
    fn new(region: Region) -> ConsumerBuffer {
        ConsumerBuffer {
            region,
            map: None,
            offset: 0,
        }
    }

    fn mapped(&mut self) -> Result<&Mapping, ShmemError> {
        if self.map.is_none() {
            self.map = Some(self.region.map()?);
        }
        Ok(self.map.as_ref().expect("mapping just created"))
    }
}

/// Consumer half of the stream transport.
///
/// Drains records in exact append order. Buffers rotate through a spare
/// FIFO: a `NextBuffer` record recycles the current buffer to the back of
/// the queue and advances to the front.
pub struct StreamReader {
    control: ControlRegion,
    current: ConsumerBuffer,
    spares: VecDeque<ConsumerBuffer>,
    config: ConnectionConfig,
    failed: bool,
    fail_reported: bool,
}

impl StreamReader {
    pub fn open(
        handles: ConnectionHandles,
        config: ConnectionConfig,
    ) -> Result<StreamReader, TransportError> {
        let control = ControlRegion::open(handles.control)?;
        let mut buffers = handles.data_buffers.into_iter().map(ConsumerBuffer::new);
        let current = buffers
            .next()
            .ok_or(TransportError::Protocol("connection has no data buffers"))?;
        let spares: VecDeque<_> = buffers.collect();
        if spares.is_empty() {
            return Err(TransportError::Protocol(
                "rotation needs at least two data buffers",
            ));
        }
        Ok(StreamReader {
            control,
            current,
            spares,
            config,
            failed: false,
            fail_reported: false,
        })
    }

    /// Drain one event per the protocol state machine.
    ///
    /// `must_block` suppresses the Stopped shortcut (used while draining
    /// toward a checkpoint); a timed-out wait still resolves to `Stopped`
    /// so a stalled producer cannot wedge the consumer forever. `flush` is
    /// the side-channel flush hook invoked once before any wait decision.
    pub fn next_event(
        &mut self,
        must_block: bool,
        flush: &mut dyn FnMut(),
    ) -> Result<NextEvent, TransportError> {
        if self.failed {
            return Err(TransportError::Failed);
        }
        let mut spins = self.config.spin_budget;
        loop {
            let block = self.control.block();
            if block.is_closed() {
                tracing::debug!("peer closed the connection");
                return Ok(NextEvent::Closed);
            }
            let state = block.reader_state.load(Ordering::SeqCst);
            if state == ReaderState::Failed as u8 {
                self.failed = true;
                return Err(TransportError::Failed);
            }
            if state == ReaderState::Paused as u8 {
                return Ok(NextEvent::Paused);
            }
            if state == ReaderState::Stopped as u8 {
                // Re-entered after a stop the producer has not noticed yet.
                let _ = block.reader_state.compare_exchange(
                    ReaderState::Stopped as u8,
                    ReaderState::Processing as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
            }

            if block.pending() > 0 {
                match self.read_record()? {
                    Some(event) => return Ok(event),
                    // Transport-tier record handled internally; keep going.
                    None => {
                        spins = self.config.spin_budget;
                        continue;
                    }
                }
            }

            if spins > 0 {
                spins -= 1;
                std::hint::spin_loop();
                continue;
            }

            flush();
            block
                .reader_state
                .store(ReaderState::AboutToWait as u8, Ordering::SeqCst);
            if block.pending() > 0 {
                block
                    .reader_state
                    .store(ReaderState::Processing as u8, Ordering::SeqCst);
                spins = self.config.spin_budget;
                continue;
            }

            if !must_block {
                block
                    .reader_state
                    .store(ReaderState::Stopped as u8, Ordering::SeqCst);
                return Ok(NextEvent::Stopped);
            }

            block
                .reader_state
                .store(ReaderState::Waiting as u8, Ordering::SeqCst);
            if sem::acquire_timeout(&block.reader_sem, self.config.wait_timeout) {
                // The producer moved us to Processing before posting.
                spins = self.config.spin_budget;
                continue;
            }
            // Timed out. A single CAS resolves the race against a concurrent
            // signal: success means a genuine stop; failure means a signal
            // arrived (state is already Processing and an event is pending),
            // so consume the semaphore count it posted and keep draining.
            if block
                .reader_state
                .compare_exchange(
                    ReaderState::Waiting as u8,
                    ReaderState::Stopped as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                return Ok(NextEvent::Stopped);
            }
            sem::try_acquire(&block.reader_sem);
            spins = self.config.spin_budget;
        }
    }

    /// Mark the record most recently returned by [`next_event`] as fully
    /// handled.
    ///
    /// [`next_event`]: Self::next_event
    pub fn finish_record(&self) {
        self.control
            .block()
            .processed_count
            .fetch_add(1, Ordering::SeqCst);
    }

    /// Processed-record count, i.e. the current checkpoint position.
    pub fn processed_count(&self) -> u64 {
        self.control.block().processed_count.load(Ordering::SeqCst)
    }

    /// Events appended but not yet processed.
    pub fn pending(&self) -> u64 {
        self.control.block().pending()
    }

    /// Accept a buffer added by the producer. Legal only while parked in
    /// `Paused`; the new buffer is used next, matching the producer's
    /// insertion point.
    pub fn add_buffer(&mut self, region: Region) -> Result<(), TransportError> {
        let state = self.control.block().reader_state.load(Ordering::SeqCst);
        if state != ReaderState::Paused as u8 {
            self.fail_connection("add_buffer while not paused");
            return Err(TransportError::Protocol("add_buffer while not paused"));
        }
        if region.size() as usize != self.config.buffer_bytes {
            self.fail_connection("added buffer has wrong size");
            return Err(TransportError::Protocol("added buffer has wrong size"));
        }
        self.spares.push_front(ConsumerBuffer::new(region));
        Ok(())
    }

    /// Discard the current buffer without recycling it (failure path) and
    /// advance to the next in rotation.
    pub fn return_without_recycle(&mut self) -> Result<(), TransportError> {
        self.control.signal_writer();
        let next = self
            .spares
            .pop_front()
            .ok_or(TransportError::Protocol("buffer rotation underflow"))?;
        self.current = next;
        self.current.offset = 0;
        Ok(())
    }

    /// Release mappings of spare buffers beyond the configured cap. Handles
    /// are kept; a buffer re-entering rotation is remapped lazily.
    pub fn release_dormant(&mut self) {
        for spare in self.spares.iter_mut().skip(self.config.max_spare_buffers) {
            spare.map = None;
        }
    }

    /// Permanently fail the connection (malformed record, protocol
    /// violation). Reported once.
    pub fn fail_connection(&mut self, reason: &'static str) {
        if self.failed {
            return;
        }
        self.failed = true;
        if !self.fail_reported {
            self.fail_reported = true;
            tracing::error!("transport failed: {reason}");
        }
        let block = self.control.block();
        block
            .reader_state
            .store(ReaderState::Failed as u8, Ordering::SeqCst);
        // Wake a writer blocked on the semaphore so it observes the failure.
        sem::post(&block.writer_sem);
    }

    /// Read and frame-check one record at the current offset. Transport-tier
    /// records consumed by the stream layer itself return `None`.
    fn read_record(&mut self) -> Result<Option<NextEvent>, TransportError> {
        let capacity = self.config.buffer_bytes;
        let offset = self.current.offset;
        if offset + 4 > capacity {
            self.fail_connection("record length prefix out of bounds");
            return Err(TransportError::Failed);
        }
        let map = self.current.mapped()?;
        let mut len_bytes = [0u8; 4];
        map.read_at(offset, &mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_RECORD_BYTES || offset + 4 + len > capacity {
            self.fail_connection("record length out of bounds");
            return Err(TransportError::Failed);
        }
        let mut payload = vec![0u8; len];
        map.read_at(offset + 4, &mut payload)?;

        let record = match decode_record(&payload) {
            Ok(record) => record,
            Err(err) => {
                self.fail_connection("malformed record");
                return Err(TransportError::Decode(err));
            }
        };
        self.current.offset = offset + 4 + len;

        match record {
            Record::Transport(TransportRecord::NextBuffer) => {
                self.finish_record();
                self.return_with_recycle()?;
                Ok(None)
            }
            Record::Transport(TransportRecord::Checkpoint) => {
                self.finish_record();
                self.control.signal_writer();
                Ok(None)
            }
            Record::Transport(TransportRecord::Pause) => {
                self.finish_record();
                self.control
                    .block()
                    .reader_state
                    .store(ReaderState::Paused as u8, Ordering::SeqCst);
                Ok(Some(NextEvent::Paused))
            }
            other => Ok(Some(NextEvent::Record(other))),
        }
    }

    /// Recycle the current buffer to the back of the spare FIFO and advance
    /// to the front.
    fn return_with_recycle(&mut self) -> Result<(), TransportError> {
        self.control.signal_writer();
        let next = self
            .spares
            .pop_front()
            .ok_or(TransportError::Protocol("buffer rotation underflow"))?;
        let mut recycled = std::mem::replace(&mut self.current, next);
        recycled.offset = 0;
        self.spares.push_back(recycled);
        self.current.offset = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AppendStatus, StreamWriter};
    use plume_protocol::SurfaceRecord;

    fn pair(config: ConnectionConfig) -> (StreamWriter, StreamReader) {
        let (writer, handles) = StreamWriter::create(config.clone()).unwrap();
        let reader = StreamReader::open(handles, config).unwrap();
        (writer, reader)
    }

    fn no_flush() -> impl FnMut() {
        || {}
    }

    #[test]
    fn records_arrive_in_append_order() {
        let (mut writer, mut reader) = pair(ConnectionConfig::default());
        for owner in 1..=3u32 {
            writer
                .append(&Record::Surface(SurfaceRecord::Unlock { owner }))
                .unwrap();
        }
        let mut flush = no_flush();
        for owner in 1..=3u32 {
            match reader.next_event(false, &mut flush).unwrap() {
                NextEvent::Record(Record::Surface(SurfaceRecord::Unlock { owner: got })) => {
                    assert_eq!(got, owner);
                    reader.finish_record();
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(reader.processed_count(), 3);
    }

    #[test]
    fn idle_reader_parks_in_stopped() {
        let (_writer, mut reader) = pair(ConnectionConfig::default());
        let mut flush = no_flush();
        assert!(matches!(
            reader.next_event(false, &mut flush).unwrap(),
            NextEvent::Stopped
        ));
    }

    #[test]
    fn stopped_reader_is_restarted_by_append() {
        let (mut writer, mut reader) = pair(ConnectionConfig::default());
        let mut flush = no_flush();
        assert!(matches!(
            reader.next_event(false, &mut flush).unwrap(),
            NextEvent::Stopped
        ));
        let status = writer
            .append(&Record::Surface(SurfaceRecord::Unlock { owner: 9 }))
            .unwrap();
        assert_eq!(status, AppendStatus::ReaderStopped);
        match reader.next_event(false, &mut flush).unwrap() {
            NextEvent::Record(Record::Surface(SurfaceRecord::Unlock { owner })) => {
                assert_eq!(owner, 9);
                reader.finish_record();
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn pause_record_parks_reader() {
        let (mut writer, mut reader) = pair(ConnectionConfig::default());
        writer
            .append(&Record::Transport(TransportRecord::Pause))
            .unwrap();
        let mut flush = no_flush();
        assert!(matches!(
            reader.next_event(false, &mut flush).unwrap(),
            NextEvent::Paused
        ));
        // Parked: subsequent calls do not drain.
        writer.restart().unwrap();
        assert!(matches!(
            reader.next_event(false, &mut flush).unwrap(),
            NextEvent::Stopped
        ));
    }

    #[test]
    fn add_buffer_requires_pause() {
        let (_writer, mut reader) = pair(ConnectionConfig::default());
        let region = Region::create_mutable_or_read_only(256 * 1024).unwrap();
        let handle = region.clone_read_only().unwrap();
        assert!(matches!(
            reader.add_buffer(handle),
            Err(TransportError::Protocol(_))
        ));
        let mut flush = no_flush();
        assert!(matches!(reader.next_event(false, &mut flush), Err(TransportError::Failed)));
    }

    #[test]
    fn malformed_record_fails_permanently() {
        let config = ConnectionConfig::default();
        let control = ControlRegion::create().unwrap();
        let buffers: Vec<_> = (0..2)
            .map(|_| Region::create_mutable_or_read_only(config.buffer_bytes as u64).unwrap())
            .collect();
        // Forge a record with an unknown tag in the first buffer.
        let map = buffers[0].map().unwrap();
        map.write_at(0, &2u32.to_le_bytes()).unwrap();
        map.write_at(4, &0x7fffu16.to_le_bytes()).unwrap();

        let handles = ConnectionHandles {
            control: control.share().unwrap(),
            data_buffers: buffers.iter().map(|b| b.clone_read_only().unwrap()).collect(),
        };
        let mut reader = StreamReader::open(handles, config).unwrap();
        control.block().event_count.fetch_add(1, Ordering::SeqCst);

        let mut flush = no_flush();
        assert!(matches!(
            reader.next_event(false, &mut flush),
            Err(TransportError::Decode(_))
        ));
        // Sticky: the connection never recovers.
        assert!(matches!(
            reader.next_event(false, &mut flush),
            Err(TransportError::Failed)
        ));
        assert_eq!(
            control.block().reader_state.load(Ordering::SeqCst),
            ReaderState::Failed as u8
        );
    }

    #[test]
    fn closed_connection_reports_closed() {
        let (writer, mut reader) = pair(ConnectionConfig::default());
        writer.close();
        let mut flush = no_flush();
        assert!(matches!(
            reader.next_event(false, &mut flush).unwrap(),
            NextEvent::Closed
        ));
    }

    #[test]
    fn rotation_delivers_the_triggering_record() {
        let config = ConnectionConfig {
            buffer_bytes: 64,
            ..ConnectionConfig::default()
        };
        let (mut writer, mut reader) = pair(config);
        // Five Unlock records fill a 64-byte buffer; the sixth forces a
        // rotation and must still arrive intact after it.
        for owner in 0..6u32 {
            writer
                .append(&Record::Surface(SurfaceRecord::Unlock { owner }))
                .unwrap();
        }
        let mut flush = no_flush();
        for owner in 0..6u32 {
            match reader.next_event(false, &mut flush).unwrap() {
                NextEvent::Record(Record::Surface(SurfaceRecord::Unlock { owner: got })) => {
                    assert_eq!(got, owner);
                    reader.finish_record();
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        // Six records plus the NextBuffer terminator.
        assert_eq!(reader.processed_count(), 7);
        assert_eq!(reader.pending(), 0);
    }

    #[test]
    fn buffers_rotate_through_the_spare_fifo() {
        let config = ConnectionConfig {
            buffer_bytes: 64,
            initial_buffers: 3,
            ..ConnectionConfig::default()
        };
        let (mut writer, mut reader) = pair(config);
        // Unlock encodes to 6 bytes (+4 length prefix); a 64-byte buffer
        // with the NextBuffer reserve holds five records.
        let total = 23u32;
        let mut flush = no_flush();
        let mut seen = Vec::new();
        for owner in 0..total {
            writer
                .append(&Record::Surface(SurfaceRecord::Unlock { owner }))
                .unwrap();
            // Drain as we go so rotated buffers come back to the pool.
            loop {
                match reader.next_event(false, &mut flush).unwrap() {
                    NextEvent::Record(Record::Surface(SurfaceRecord::Unlock { owner })) => {
                        seen.push(owner);
                        reader.finish_record();
                    }
                    NextEvent::Stopped => break,
                    other => panic!("unexpected event: {other:?}"),
                }
            }
        }
        assert_eq!(seen, (0..total).collect::<Vec<_>>());
        assert_eq!(reader.pending(), 0);
    }
}
