use std::sync::atomic::Ordering;

use plume_protocol::{
    encode_record_into, ReaderState, Record, TransportRecord, WriterState, MAX_RECORD_BYTES,
};
use plume_shmem::{sem, Mapping, Region};

use crate::{ControlRegion, ConnectionConfig, TransportError};

/// Byte cost of the length-prefixed `NextBuffer` record every buffer keeps
/// room for, so rotation is always possible.
const NEXT_BUFFER_RESERVE: usize = 4 + 2;

/// Region handles to hand to the consumer process when establishing a
/// connection. Data buffers are read-only duplicates, in rotation order.
pub struct ConnectionHandles {
    pub control: Region,
    pub data_buffers: Vec<Region>,
}

/// Result of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendStatus {
    Appended,
    /// The record was appended, but the reader had parked in `Stopped` and
    /// was moved back to `Processing`; the caller must get the consumer
    /// side scheduled again.
    ReaderStopped,
}

struct ProducerBuffer {
    map: Mapping,
    /// Event index of this buffer's final `NextBuffer` record. The buffer
    /// is reusable once `processed_count` reaches it. Zero means the buffer
    /// has never been rotated out of.
    drained_at: u64,
}

impl ProducerBuffer {
    fn create(bytes: usize) -> Result<(ProducerBuffer, Region), TransportError> {
        let region = Region::create_mutable_or_read_only(bytes as u64)?;
        let peer = region.clone_read_only()?;
        // The mapping keeps the memory alive; the region handle itself is
        // not needed once the peer duplicate exists.
        let map = region.map()?;
        Ok((ProducerBuffer { map, drained_at: 0 }, peer))
    }
}

/// Producer half of the stream transport.
///
/// Single-owner: `&mut self` on every mutating operation enforces the
/// no-re-entry rule. Appends only ever touch the current buffer; ownership
/// of a buffer logically transfers to the consumer when its final
/// `NextBuffer` record is published.
pub struct StreamWriter {
    control: ControlRegion,
    buffers: Vec<ProducerBuffer>,
    current: usize,
    offset: usize,
    config: ConnectionConfig,
    scratch: Vec<u8>,
    failed: bool,
}

impl StreamWriter {
    pub fn create(
        config: ConnectionConfig,
    ) -> Result<(StreamWriter, ConnectionHandles), TransportError> {
        if config.initial_buffers < 2 {
            return Err(TransportError::Protocol(
                "rotation needs at least two data buffers",
            ));
        }
        if config.buffer_bytes <= NEXT_BUFFER_RESERVE {
            return Err(TransportError::Protocol("data buffer too small"));
        }
        let control = ControlRegion::create()?;
        let control_handle = control.share()?;

        let mut buffers = Vec::with_capacity(config.initial_buffers);
        let mut peer_buffers = Vec::with_capacity(config.initial_buffers);
        for _ in 0..config.initial_buffers {
            let (buffer, peer) = ProducerBuffer::create(config.buffer_bytes)?;
            buffers.push(buffer);
            peer_buffers.push(peer);
        }

        Ok((
            StreamWriter {
                control,
                buffers,
                current: 0,
                offset: 0,
                config,
                scratch: Vec::new(),
                failed: false,
            },
            ConnectionHandles {
                control: control_handle,
                data_buffers: peer_buffers,
            },
        ))
    }

    /// Append one record, rotating (and possibly blocking) if the current
    /// buffer cannot hold it.
    pub fn append(&mut self, record: &Record) -> Result<AppendStatus, TransportError> {
        self.check_live()?;

        let mut status = AppendStatus::Appended;
        let block = self.control.block();
        if block.reader_state.load(Ordering::SeqCst) == ReaderState::Stopped as u8 {
            // Restart a parked reader; the caller schedules the consumer.
            if block
                .reader_state
                .compare_exchange(
                    ReaderState::Stopped as u8,
                    ReaderState::Processing as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                status = AppendStatus::ReaderStopped;
            }
        }

        self.scratch.clear();
        encode_record_into(record, &mut self.scratch);
        if self.scratch.len() > MAX_RECORD_BYTES
            || 4 + self.scratch.len() > self.config.buffer_bytes - NEXT_BUFFER_RESERVE
        {
            return Err(TransportError::RecordTooLarge);
        }

        if self.offset + 4 + self.scratch.len()
            > self.config.buffer_bytes - NEXT_BUFFER_RESERVE
        {
            self.advance_buffer()?;
        }

        let buffer = &self.buffers[self.current];
        buffer
            .map
            .write_at(self.offset, &(self.scratch.len() as u32).to_le_bytes())?;
        buffer.map.write_at(self.offset + 4, &self.scratch)?;
        self.offset += 4 + self.scratch.len();

        self.publish_event();
        Ok(status)
    }

    /// Append a checkpoint record; returns the target processed count the
    /// producer can wait on.
    pub fn create_checkpoint(&mut self) -> Result<(u64, AppendStatus), TransportError> {
        let status = self.append(&Record::Transport(TransportRecord::Checkpoint))?;
        let target = self.control.block().event_count.load(Ordering::SeqCst);
        Ok((target, status))
    }

    /// Poll until the consumer has processed up to `target` or `timeout`
    /// elapses.
    pub fn wait_for_checkpoint(&self, target: u64, timeout: std::time::Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let block = self.control.block();
            if block.processed_count.load(Ordering::SeqCst) >= target {
                return true;
            }
            if block.is_closed() || self.failed {
                return false;
            }
            if std::time::Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    /// Grow the rotation by one buffer, inserted so it is used next. Legal
    /// only while the reader is parked in `Paused`; any other timing is a
    /// protocol error that fails the connection.
    pub fn add_buffer(&mut self) -> Result<Region, TransportError> {
        self.check_live()?;
        if self.control.block().reader_state.load(Ordering::SeqCst) != ReaderState::Paused as u8 {
            self.fail_connection("add_buffer while reader not paused");
            return Err(TransportError::Protocol("add_buffer while reader not paused"));
        }
        let (buffer, peer) = ProducerBuffer::create(self.config.buffer_bytes)?;
        self.buffers.insert(self.current + 1, buffer);
        Ok(peer)
    }

    /// Move the reader from `Paused` back to `Processing`. The caller gets
    /// the consumer side scheduled again (as after
    /// [`AppendStatus::ReaderStopped`]).
    pub fn restart(&self) -> Result<(), TransportError> {
        let block = self.control.block();
        block
            .reader_state
            .compare_exchange(
                ReaderState::Paused as u8,
                ReaderState::Processing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| TransportError::Protocol("restart while reader not paused"))?;
        Ok(())
    }

    /// Idempotent teardown; wakes both sides.
    pub fn close(&self) {
        self.control.close();
    }

    pub fn is_failed(&self) -> bool {
        self.failed
            || self.control.block().reader_state.load(Ordering::SeqCst)
                == ReaderState::Failed as u8
    }

    /// Events appended so far.
    pub fn event_count(&self) -> u64 {
        self.control.block().event_count.load(Ordering::SeqCst)
    }

    fn check_live(&mut self) -> Result<(), TransportError> {
        if self.failed {
            return Err(TransportError::Failed);
        }
        let block = self.control.block();
        if block.is_closed() {
            return Err(TransportError::Closed);
        }
        if block.reader_state.load(Ordering::SeqCst) == ReaderState::Failed as u8 {
            self.failed = true;
            return Err(TransportError::Failed);
        }
        Ok(())
    }

    /// Publish the record just written: bump the event count (release), then
    /// wake the reader if it is exactly `Waiting`.
    fn publish_event(&self) {
        self.control
            .block()
            .event_count
            .fetch_add(1, Ordering::SeqCst);
        self.control.signal_reader();
    }

    /// Terminate the current buffer with a `NextBuffer` record and move to
    /// the next buffer in rotation, blocking until the consumer has drained
    /// it.
    fn advance_buffer(&mut self) -> Result<(), TransportError> {
        // The terminator gets its own buffer: scratch still holds the
        // caller's record, which is written after the rotation.
        let mut terminator = Vec::new();
        encode_record_into(
            &Record::Transport(TransportRecord::NextBuffer),
            &mut terminator,
        );
        let buffer = &self.buffers[self.current];
        buffer
            .map
            .write_at(self.offset, &(terminator.len() as u32).to_le_bytes())?;
        buffer.map.write_at(self.offset + 4, &terminator)?;
        self.publish_event();

        let stamp = self.control.block().event_count.load(Ordering::SeqCst);
        self.buffers[self.current].drained_at = stamp;

        let next = (self.current + 1) % self.buffers.len();
        let target = self.buffers[next].drained_at;
        if target != 0 {
            self.wait_for_drained(target)?;
        }
        self.current = next;
        self.offset = 0;
        Ok(())
    }

    /// The writer-side wait dance: spin, then AboutToWait with a re-check,
    /// then Waiting on the writer semaphore with a bounded timeout. A
    /// timeout is not a failure for the writer; it re-arms and keeps
    /// waiting until the buffer is drained, the connection closes, or the
    /// reader fails.
    fn wait_for_drained(&mut self, target: u64) -> Result<(), TransportError> {
        let mut spins = self.config.spin_budget;
        loop {
            let block = self.control.block();
            if block.is_closed() {
                return Err(TransportError::Closed);
            }
            if block.reader_state.load(Ordering::SeqCst) == ReaderState::Failed as u8 {
                self.failed = true;
                return Err(TransportError::Failed);
            }
            if block.processed_count.load(Ordering::SeqCst) >= target {
                block
                    .writer_state
                    .store(WriterState::Processing as u8, Ordering::SeqCst);
                return Ok(());
            }
            if spins > 0 {
                spins -= 1;
                std::hint::spin_loop();
                continue;
            }

            block
                .writer_state
                .store(WriterState::AboutToWait as u8, Ordering::SeqCst);
            if block.processed_count.load(Ordering::SeqCst) >= target {
                block
                    .writer_state
                    .store(WriterState::Processing as u8, Ordering::SeqCst);
                return Ok(());
            }

            block
                .writer_state
                .store(WriterState::Waiting as u8, Ordering::SeqCst);
            if sem::acquire_timeout(&block.writer_sem, self.config.wait_timeout) {
                // The consumer moved us to Processing before posting.
                spins = self.config.spin_budget;
                continue;
            }
            // Timed out. Resolve the race against a concurrent signal with a
            // single CAS; if it fails a signal arrived and its post must be
            // consumed so counts stay balanced.
            if block
                .writer_state
                .compare_exchange(
                    WriterState::Waiting as u8,
                    WriterState::Processing as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_err()
            {
                sem::try_acquire(&block.writer_sem);
            }
            spins = self.config.spin_budget;
        }
    }

    fn fail_connection(&mut self, reason: &'static str) {
        if self.failed {
            return;
        }
        self.failed = true;
        tracing::error!("transport failed: {reason}");
        let block = self.control.block();
        block
            .writer_state
            .store(WriterState::Failed as u8, Ordering::SeqCst);
        block
            .reader_state
            .store(ReaderState::Failed as u8, Ordering::SeqCst);
        sem::post(&block.reader_sem);
        sem::post(&block.writer_sem);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plume_protocol::SurfaceRecord;

    fn small_config() -> ConnectionConfig {
        ConnectionConfig {
            buffer_bytes: 64,
            ..ConnectionConfig::default()
        }
    }

    #[test]
    fn create_hands_out_rotation_handles() {
        let (writer, handles) = StreamWriter::create(ConnectionConfig::default()).unwrap();
        assert_eq!(handles.data_buffers.len(), 2);
        assert_eq!(writer.event_count(), 0);
        for region in &handles.data_buffers {
            assert_eq!(region.size(), 256 * 1024);
        }
    }

    #[test]
    fn single_buffer_config_is_rejected() {
        let config = ConnectionConfig {
            initial_buffers: 1,
            ..ConnectionConfig::default()
        };
        assert!(matches!(
            StreamWriter::create(config),
            Err(TransportError::Protocol(_))
        ));
    }

    #[test]
    fn append_publishes_events() {
        let (mut writer, _handles) = StreamWriter::create(small_config()).unwrap();
        writer
            .append(&Record::Surface(SurfaceRecord::Unlock { owner: 1 }))
            .unwrap();
        assert_eq!(writer.event_count(), 1);
    }

    #[test]
    fn oversized_record_is_rejected_up_front() {
        // Buffers too small to ever hold an AwaitToken record.
        let config = ConnectionConfig {
            buffer_bytes: NEXT_BUFFER_RESERVE + 4,
            ..ConnectionConfig::default()
        };
        let (mut writer, _handles) = StreamWriter::create(config).unwrap();
        assert!(matches!(
            writer.append(&Record::Transport(TransportRecord::AwaitToken { token: 1 })),
            Err(TransportError::RecordTooLarge)
        ));
        assert_eq!(writer.event_count(), 0);
    }

    #[test]
    fn add_buffer_without_pause_fails_connection() {
        let (mut writer, _handles) = StreamWriter::create(small_config()).unwrap();
        assert!(matches!(
            writer.add_buffer(),
            Err(TransportError::Protocol(_))
        ));
        assert!(writer.is_failed());
        assert!(matches!(
            writer.append(&Record::Transport(TransportRecord::Pause)),
            Err(TransportError::Failed)
        ));
    }

    #[test]
    fn append_after_close_is_rejected() {
        let (mut writer, _handles) = StreamWriter::create(small_config()).unwrap();
        writer.close();
        assert!(matches!(
            writer.append(&Record::Transport(TransportRecord::Pause)),
            Err(TransportError::Closed)
        ));
    }
}
