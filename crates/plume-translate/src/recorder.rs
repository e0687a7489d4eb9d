//! Producer-facing surface of the transport.
//!
//! The enclosing application holds one `Recorder` per connection and a
//! single boolean switch: while the recorder is active, operations are
//! streamed; after an unexplained transport failure it deactivates itself
//! and the application falls back to the non-streamed path process-wide.

use std::time::Duration;

use plume_protocol::{OwnerId, Record, TransportRecord};
use plume_shmem::{Cursor, Region};
use plume_stream::{
    AppendStatus, ConnectionConfig, ConnectionHandles, StreamWriter, TransportError,
};

use crate::translator::TranslateError;

/// Hook fired whenever the consumer side needs to be scheduled again
/// (reader restarted from `Stopped` or `Paused`).
pub type ResumeHook = Box<dyn FnMut() + Send>;

pub struct Recorder {
    config: ConnectionConfig,
    writer: Option<StreamWriter>,
    active: bool,
    next_token: u64,
    resume_hook: Option<ResumeHook>,
    /// Producer-side handle to the readback region the translator writes
    /// lost-surface reports into.
    readback: Option<Region>,
    /// Producer-side cursor over the pixel-source region blit payloads are
    /// staged in.
    pixel_cursor: Option<Cursor>,
}

impl Recorder {
    pub fn new(config: ConnectionConfig) -> Recorder {
        Recorder {
            config,
            writer: None,
            active: true,
            next_token: 0,
            resume_hook: None,
            readback: None,
            pixel_cursor: None,
        }
    }

    pub fn set_resume_hook(&mut self, hook: ResumeHook) {
        self.resume_hook = Some(hook);
    }

    /// Establish the connection if none exists. Returns the handles to
    /// deliver to the consumer process on first call, `None` when already
    /// connected.
    pub fn ensure_connection(&mut self) -> Result<Option<ConnectionHandles>, TranslateError> {
        if !self.active {
            return Err(TranslateError::Protocol("accelerated path is disabled"));
        }
        if self.writer.is_some() {
            return Ok(None);
        }
        match StreamWriter::create(self.config.clone()) {
            Ok((writer, handles)) => {
                self.writer = Some(writer);
                Ok(Some(handles))
            }
            Err(TransportError::Shmem(err)) => {
                // Mandatory setup could not allocate; behave like a
                // transport failure.
                self.deactivate("connection setup exhausted shared memory");
                Err(TranslateError::Shmem(err))
            }
            Err(err) => {
                self.deactivate("connection setup failed");
                Err(err.into())
            }
        }
    }

    /// Append one record to the stream.
    pub fn record_event(&mut self, record: &Record) -> Result<(), TranslateError> {
        let writer = self.live_writer()?;
        match writer.append(record) {
            Ok(AppendStatus::Appended) => Ok(()),
            Ok(AppendStatus::ReaderStopped) => {
                self.fire_resume_hook();
                Ok(())
            }
            Err(err) => Err(self.handle_transport_error(err)),
        }
    }

    /// Append a checkpoint; the returned token is a processed-count target.
    pub fn create_checkpoint(&mut self) -> Result<u64, TranslateError> {
        let writer = self.live_writer()?;
        match writer.create_checkpoint() {
            Ok((target, status)) => {
                if status == AppendStatus::ReaderStopped {
                    self.fire_resume_hook();
                }
                Ok(target)
            }
            Err(err) => Err(self.handle_transport_error(err)),
        }
    }

    /// Block until the consumer drains up to `target` or `timeout` elapses.
    pub fn wait_for_checkpoint(&self, target: u64, timeout: Duration) -> bool {
        match &self.writer {
            Some(writer) => writer.wait_for_checkpoint(target, timeout),
            None => false,
        }
    }

    /// Append an await-token record; returns the token to resolve out of
    /// band on the consumer side. Tokens increase monotonically.
    pub fn await_token(&mut self) -> Result<u64, TranslateError> {
        self.next_token += 1;
        let token = self.next_token;
        self.record_event(&Record::Transport(TransportRecord::AwaitToken { token }))?;
        Ok(token)
    }

    /// Park the consumer for out-of-band reconfiguration (buffer adds).
    pub fn pause(&mut self) -> Result<(), TranslateError> {
        self.record_event(&Record::Transport(TransportRecord::Pause))
    }

    /// Resume a paused consumer.
    pub fn restart(&mut self) -> Result<(), TranslateError> {
        let writer = self.live_writer()?;
        writer.restart()?;
        self.fire_resume_hook();
        Ok(())
    }

    /// Grow the buffer rotation; legal only while paused. The returned
    /// region handle is delivered to the consumer as an add-buffer task.
    pub fn add_buffer(&mut self) -> Result<Region, TranslateError> {
        let writer = self.live_writer()?;
        match writer.add_buffer() {
            Ok(region) => Ok(region),
            Err(err) => Err(self.handle_transport_error(err)),
        }
    }

    /// Create the readback region the translator reports into. Returns the
    /// handle to deliver as a set-readback-buffer task.
    pub fn create_readback_buffer(&mut self, bytes: u64) -> Result<Region, TranslateError> {
        let region = Region::create(bytes).map_err(TranslateError::Shmem)?;
        let peer = region.try_clone().map_err(TranslateError::Shmem)?;
        self.readback = Some(region);
        Ok(peer)
    }

    /// Lost-surface ids the translator has reported so far.
    pub fn read_lost_surfaces(&self) -> Result<Vec<OwnerId>, TranslateError> {
        let region = match &self.readback {
            Some(region) => region,
            None => return Ok(Vec::new()),
        };
        let map = region.map().map_err(TranslateError::Shmem)?;
        let mut count_bytes = [0u8; 4];
        map.read_at(0, &mut count_bytes).map_err(TranslateError::Shmem)?;
        // The count comes out of shared memory; clamp it to what the region
        // can hold before trusting it for an allocation.
        let max_ids = (region.size().saturating_sub(4) / 4) as usize;
        let count = (u32::from_le_bytes(count_bytes) as usize).min(max_ids);
        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            let mut id_bytes = [0u8; 4];
            map.read_at(4 + i * 4, &mut id_bytes)
                .map_err(TranslateError::Shmem)?;
            ids.push(u32::from_le_bytes(id_bytes));
        }
        Ok(ids)
    }

    /// Create the pixel-source region blit payloads are staged in. Returns
    /// the read-only handle to deliver as a set-pixel-source task.
    pub fn create_pixel_source(&mut self, bytes: u64) -> Result<Region, TranslateError> {
        let region = Region::create_mutable_or_read_only(bytes).map_err(TranslateError::Shmem)?;
        let peer = region.clone_read_only().map_err(TranslateError::Shmem)?;
        self.pixel_cursor = Some(Cursor::new(region));
        Ok(peer)
    }

    /// Stage blit payload bytes at `offset` in the pixel-source region.
    pub fn write_pixels(&mut self, offset: u64, bytes: &[u8]) -> Result<(), TranslateError> {
        let cursor = self
            .pixel_cursor
            .as_mut()
            .ok_or(TranslateError::Protocol("no pixel source region"))?;
        cursor.seek(offset);
        cursor.write(bytes).map_err(TranslateError::Shmem)
    }

    /// Whether the accelerated path is still in use.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Idempotent teardown of the producer side.
    pub fn close(&mut self) {
        if let Some(writer) = &self.writer {
            writer.close();
        }
    }

    fn live_writer(&mut self) -> Result<&mut StreamWriter, TranslateError> {
        if !self.active {
            return Err(TranslateError::Protocol("accelerated path is disabled"));
        }
        self.writer
            .as_mut()
            .ok_or(TranslateError::Protocol("no connection established"))
    }

    fn fire_resume_hook(&mut self) {
        if let Some(hook) = self.resume_hook.as_mut() {
            hook();
        }
    }

    fn handle_transport_error(&mut self, err: TransportError) -> TranslateError {
        match &err {
            TransportError::Closed => {
                tracing::debug!("peer closed the connection");
                self.active = false;
            }
            TransportError::Shmem(_) => {
                // Recoverable for the caller; the connection stays up.
            }
            _ => self.deactivate("transport failure"),
        }
        err.into()
    }

    fn deactivate(&mut self, reason: &'static str) {
        if !self.active {
            return;
        }
        self.active = false;
        tracing::error!("disabling accelerated path: {reason}");
        if let Some(writer) = &self.writer {
            writer.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_connection_hands_out_handles_once() {
        let mut recorder = Recorder::new(ConnectionConfig::default());
        let handles = recorder.ensure_connection().unwrap();
        assert!(handles.is_some());
        assert!(recorder.ensure_connection().unwrap().is_none());
        assert!(recorder.is_active());
    }

    #[test]
    fn recording_without_connection_is_an_error() {
        let mut recorder = Recorder::new(ConnectionConfig::default());
        assert!(matches!(
            recorder.record_event(&Record::Transport(TransportRecord::Pause)),
            Err(TranslateError::Protocol(_))
        ));
    }

    #[test]
    fn await_tokens_increase_monotonically() {
        let mut recorder = Recorder::new(ConnectionConfig::default());
        recorder.ensure_connection().unwrap();
        let a = recorder.await_token().unwrap();
        // Consumer-side resolution is out of scope here; tokens just keep
        // counting up.
        let b = recorder.await_token().unwrap();
        assert!(b > a);
    }

    #[test]
    fn protocol_violation_deactivates_the_recorder() {
        let mut recorder = Recorder::new(ConnectionConfig::default());
        recorder.ensure_connection().unwrap();
        // add_buffer without a paused reader is a protocol violation.
        assert!(recorder.add_buffer().is_err());
        assert!(!recorder.is_active());
        assert!(matches!(
            recorder.ensure_connection(),
            Err(TranslateError::Protocol(_))
        ));
    }

    #[test]
    fn lost_surface_report_round_trips_through_the_region() {
        let mut recorder = Recorder::new(ConnectionConfig::default());
        let peer = recorder.create_readback_buffer(4096).unwrap();
        // Simulate the translator's report format.
        let map = peer.map().unwrap();
        map.write_at(0, &2u32.to_le_bytes()).unwrap();
        map.write_at(4, &7u32.to_le_bytes()).unwrap();
        map.write_at(8, &9u32.to_le_bytes()).unwrap();
        assert_eq!(recorder.read_lost_surfaces().unwrap(), vec![7, 9]);
    }

    #[test]
    fn corrupt_lost_count_is_clamped_to_the_region() {
        let mut recorder = Recorder::new(ConnectionConfig::default());
        let peer = recorder.create_readback_buffer(4096).unwrap();
        let map = peer.map().unwrap();
        map.write_at(0, &u32::MAX.to_le_bytes()).unwrap();
        // At most (4096 - 4) / 4 ids fit; no multi-gigabyte allocation.
        let ids = recorder.read_lost_surfaces().unwrap();
        assert_eq!(ids.len(), (4096 - 4) / 4);
        assert!(ids.iter().all(|&id| id == 0));
    }
}
