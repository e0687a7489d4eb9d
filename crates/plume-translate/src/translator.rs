//! Consumer-side translation: drain the stream, dispatch records to the
//! executor, keep the resource table consistent, and survive device loss.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use plume_protocol::{DrawOp, OwnerId, Record, SurfaceRecord, TransportRecord};
use plume_shmem::{Cursor, Region};
use plume_stream::{ConnectionConfig, ConnectionHandles, NextEvent, StreamReader, TransportError};

use crate::executor::{CommandExecutor, ExecutorError};
use crate::recovery::{ContextRegistry, SharedContext};
use crate::resources::{ResourceTable, TableOp};

/// Wall-clock budget for one cooperative drain pass.
const BATCH_TIME_BUDGET: Duration = Duration::from_millis(4);

#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Shmem(#[from] plume_shmem::ShmemError),

    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// A second thread re-entered a drain already in progress.
    #[error("translator drain re-entered")]
    ReEntry,
}

/// The consumer-side state machine.
///
/// Single strong owner of every per-connection resource: entries in the
/// resource table refer back to the translator only by owner id, and the
/// teardown pass destroys every live entry before the translator itself
/// drops, so no reference cycle survives.
pub struct Translator<E: CommandExecutor> {
    reader: StreamReader,
    exec: E,
    resources: ResourceTable,
    config: ConnectionConfig,
    registry: Arc<ContextRegistry>,
    context: Arc<SharedContext>,
    /// Producer-provided region for out-of-band data back to the producer
    /// (lost-surface reports, surface readbacks).
    readback: Option<Cursor>,
    /// Source region for `BlitPixels` payloads.
    pixel_source: Option<Cursor>,
    /// Last-known contents per surface, refreshed on unlock; what rehoming
    /// copies from after device loss.
    snapshot_cache: HashMap<OwnerId, Vec<u8>>,
    /// Pending await token, if translation is suspended.
    awaiting: Option<u64>,
    /// Highest token observed so far.
    last_token: u64,
    /// Surfaces that could not be rehomed, not yet reported.
    lost_surfaces: Vec<OwnerId>,
    draining: bool,
    torn_down: bool,
}

impl<E: CommandExecutor> Translator<E> {
    pub fn new(
        handles: ConnectionHandles,
        config: ConnectionConfig,
        exec: E,
        registry: Arc<ContextRegistry>,
    ) -> Result<Translator<E>, TranslateError> {
        let reader = StreamReader::open(handles, config.clone())?;
        let context = registry.acquire();
        Ok(Translator {
            reader,
            exec,
            resources: ResourceTable::new(),
            config,
            registry,
            context,
            readback: None,
            pixel_source: None,
            snapshot_cache: HashMap::new(),
            awaiting: None,
            last_token: 0,
            lost_surfaces: Vec::new(),
            draining: false,
            torn_down: false,
        })
    }

    /// One cooperative drain pass. Returns true if another pass is needed
    /// (budget exhausted with work remaining).
    pub fn drain_stream(&mut self) -> Result<bool, TranslateError> {
        if self.draining {
            debug_assert!(false, "translator drain re-entered");
            return Err(TranslateError::ReEntry);
        }
        self.draining = true;
        let result = self.drain_inner();
        self.draining = false;
        result
    }

    fn drain_inner(&mut self) -> Result<bool, TranslateError> {
        if self.awaiting.is_some() {
            // Suspended on an await token; nothing to do until it resolves.
            return Ok(false);
        }
        let started = Instant::now();
        let mut executed = 0u64;
        loop {
            if executed >= self.config.batch_records || started.elapsed() > BATCH_TIME_BUDGET {
                return Ok(true);
            }
            let event = {
                let mut flush =
                    || flush_lost_report(&mut self.readback, &mut self.lost_surfaces);
                self.reader.next_event(false, &mut flush)?
            };
            match event {
                NextEvent::Record(Record::Transport(TransportRecord::AwaitToken { token })) => {
                    if token <= self.last_token {
                        debug_assert!(false, "await token did not increase");
                        self.reader.fail_connection("await token did not increase");
                        return Err(TranslateError::Protocol("await token did not increase"));
                    }
                    self.awaiting = Some(token);
                    // The await record is finished only once its token is
                    // observed.
                    return Ok(false);
                }
                NextEvent::Record(Record::Transport(_)) => {
                    // NextBuffer/Checkpoint/Pause are consumed by the stream
                    // layer and never surface here.
                    self.reader.fail_connection("unexpected transport record");
                    return Err(TranslateError::Protocol("unexpected transport record"));
                }
                NextEvent::Record(Record::Surface(record)) => {
                    if let Err(err) = self.execute(record) {
                        // The record was consumed but cannot be finished;
                        // the stream is unrecoverable past this point.
                        self.reader.fail_connection("record execution failed");
                        return Err(err);
                    }
                    self.reader.finish_record();
                    executed += 1;
                }
                NextEvent::Paused | NextEvent::Stopped => return Ok(false),
                NextEvent::Closed => {
                    self.teardown();
                    return Ok(false);
                }
            }
        }
    }

    /// Drain without yielding until `target` records have been processed
    /// (checkpoint forcing), the connection pauses, closes, or the wait
    /// times out into a stop.
    pub fn drain_to_checkpoint(&mut self, target: u64) -> Result<(), TranslateError> {
        while self.reader.processed_count() < target {
            if self.awaiting.is_some() {
                // An await token blocks the stream; the producer's
                // checkpoint wait times out instead of wedging here.
                return Ok(());
            }
            let event = {
                let mut flush =
                    || flush_lost_report(&mut self.readback, &mut self.lost_surfaces);
                self.reader.next_event(true, &mut flush)?
            };
            match event {
                NextEvent::Record(Record::Transport(TransportRecord::AwaitToken { token })) => {
                    if token <= self.last_token {
                        debug_assert!(false, "await token did not increase");
                        self.reader.fail_connection("await token did not increase");
                        return Err(TranslateError::Protocol("await token did not increase"));
                    }
                    self.awaiting = Some(token);
                }
                NextEvent::Record(Record::Transport(_)) => {
                    self.reader.fail_connection("unexpected transport record");
                    return Err(TranslateError::Protocol("unexpected transport record"));
                }
                NextEvent::Record(Record::Surface(record)) => {
                    if let Err(err) = self.execute(record) {
                        self.reader.fail_connection("record execution failed");
                        return Err(err);
                    }
                    self.reader.finish_record();
                }
                NextEvent::Stopped => {}
                NextEvent::Paused => return Ok(()),
                NextEvent::Closed => {
                    self.teardown();
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Resolve an out-of-band token observation. Returns true if a drain
    /// pass should be scheduled.
    pub fn observe_token(&mut self, token: u64) -> bool {
        match self.awaiting {
            Some(awaited) if awaited == token => {
                self.awaiting = None;
                self.last_token = token;
                self.reader.finish_record();
                true
            }
            _ if token <= self.last_token => {
                // Idempotent: a repeat observation is a logged no-op.
                tracing::debug!(token, "await token already resolved");
                false
            }
            _ => {
                debug_assert!(false, "token observed with no pending await");
                tracing::error!(token, "await token observed with no pending await");
                false
            }
        }
    }

    fn execute(&mut self, record: SurfaceRecord) -> Result<(), TranslateError> {
        match record {
            SurfaceRecord::Create { owner, desc } => {
                if self.resources.contains(owner) {
                    return Err(self.protocol_error("duplicate surface create"));
                }
                self.with_recovery(owner, |exec| exec.create_surface(owner, &desc))?;
                self.resources
                    .create(owner, desc)
                    .map_err(|_| TranslateError::Protocol("duplicate surface create"))?;
            }
            SurfaceRecord::Lock { owner, mode } => {
                if self.resources.lock(owner, mode).is_err() {
                    return Err(self.protocol_error("invalid surface lock"));
                }
                if !self.exec.lock(owner, mode) {
                    tracing::warn!(owner, "executor refused surface lock");
                }
            }
            SurfaceRecord::Unlock { owner } => {
                let op = match self.resources.unlock(owner) {
                    Ok(op) => op,
                    Err(_) => return Err(self.protocol_error("invalid surface unlock")),
                };
                self.exec.unlock(owner);
                match op {
                    TableOp::Destroy => {
                        self.exec.destroy(owner);
                        self.snapshot_cache.remove(&owner);
                    }
                    TableOp::None => {
                        // Contents changed while locked; refresh the rehoming
                        // snapshot.
                        if let Some(pixels) = self.exec.snapshot(owner) {
                            self.snapshot_cache.insert(owner, pixels);
                        }
                    }
                }
            }
            SurfaceRecord::Draw { owner, op } => {
                if !self.resources.contains(owner) {
                    return Err(self.protocol_error("draw on unknown surface"));
                }
                let pixels = match op {
                    DrawOp::BlitPixels {
                        width,
                        height,
                        pixels_offset,
                        pixels_len,
                        ..
                    } => Some(self.read_blit_source(width, height, pixels_offset, pixels_len)?),
                    _ => None,
                };
                self.with_recovery(owner, |exec| exec.draw(owner, &op, pixels.as_deref()))?;
            }
            SurfaceRecord::Present { owner, output } => {
                if !self.resources.contains(owner) {
                    return Err(self.protocol_error("present of unknown surface"));
                }
                if !self.exec.present(owner, output) {
                    if self.exec.device_lost() {
                        self.recover_device_loss();
                    } else {
                        tracing::warn!(owner, output, "presentation failed");
                    }
                }
            }
            SurfaceRecord::Destroy { owner } => {
                let op = match self.resources.destroy(owner) {
                    Ok(op) => op,
                    Err(_) => return Err(self.protocol_error("invalid surface destroy")),
                };
                if op == TableOp::Destroy {
                    self.exec.destroy(owner);
                    self.snapshot_cache.remove(&owner);
                }
            }
        }
        Ok(())
    }

    fn read_blit_source(
        &mut self,
        width: u32,
        height: u32,
        offset: u64,
        len: u32,
    ) -> Result<Vec<u8>, TranslateError> {
        let expected = width
            .checked_mul(height)
            .and_then(|px| px.checked_mul(4))
            .filter(|&bytes| bytes == len);
        if expected.is_none() {
            return Err(self.protocol_error("blit length does not match rectangle"));
        }
        let cursor = match self.pixel_source.as_mut() {
            Some(cursor) => cursor,
            None => {
                return Err(self.protocol_error("blit without a pixel source region"));
            }
        };
        cursor.seek(offset);
        let mut pixels = vec![0u8; len as usize];
        cursor.read(&mut pixels)?;
        Ok(pixels)
    }

    /// Run an executor call, rehoming and retrying once on device loss. A
    /// retry that misses its surface means the surface could not be rehomed
    /// and has already been reported lost.
    fn with_recovery(
        &mut self,
        owner: OwnerId,
        mut f: impl FnMut(&mut E) -> Result<(), ExecutorError>,
    ) -> Result<(), TranslateError> {
        match f(&mut self.exec) {
            Err(ExecutorError::DeviceLost) => {
                self.recover_device_loss();
                match f(&mut self.exec) {
                    Err(ExecutorError::UnknownSurface(_)) => {
                        tracing::debug!(owner, "operation dropped for lost surface");
                        Ok(())
                    }
                    other => other.map_err(TranslateError::from),
                }
            }
            other => other.map_err(TranslateError::from),
        }
    }

    /// Best-effort rehoming after device loss. Never fatal to the
    /// connection: surfaces with a cached snapshot are recreated on a fresh
    /// context generation and their contents restored, the rest are
    /// reported lost by id.
    fn recover_device_loss(&mut self) {
        tracing::warn!(
            generation = self.context.generation(),
            "execution device lost; rehoming surfaces"
        );
        self.registry.invalidate();
        self.context = self.registry.acquire();
        self.exec.reset_device();

        for owner in self.resources.owners() {
            let desc = match self.resources.get(owner) {
                Some(entry) => entry.desc,
                None => continue,
            };
            let rehomed = match self.snapshot_cache.get(&owner) {
                Some(pixels) => self.exec.restore(owner, &desc, pixels).is_ok(),
                None => false,
            };
            if !rehomed {
                tracing::warn!(owner, "surface lost with no fallback copy");
                self.resources.remove(owner);
                self.snapshot_cache.remove(&owner);
                self.lost_surfaces.push(owner);
            }
        }
        flush_lost_report(&mut self.readback, &mut self.lost_surfaces);
    }

    /// Teardown pass: unlock and destroy every live entry, drop the
    /// out-of-band regions. Idempotent; also run on drop.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        for owner in self.resources.drain_all() {
            self.exec.unlock(owner);
            self.exec.destroy(owner);
        }
        self.snapshot_cache.clear();
        self.readback = None;
        self.pixel_source = None;
    }

    pub fn set_readback_buffer(&mut self, region: Region) {
        self.readback = Some(Cursor::new(region));
    }

    pub fn set_pixel_source(&mut self, region: Region) {
        self.pixel_source = Some(Cursor::new(region));
    }

    pub fn add_buffer(&mut self, region: Region) -> Result<(), TranslateError> {
        Ok(self.reader.add_buffer(region)?)
    }

    pub fn release_dormant_buffers(&mut self) {
        self.reader.release_dormant();
    }

    /// Drop caches held purely for opportunistic reuse. Surfaces whose
    /// snapshot is dropped here cannot be rehomed after a later device
    /// loss; they will be reported lost instead.
    pub fn clear_caches(&mut self) {
        self.snapshot_cache.clear();
    }

    pub fn is_awaiting(&self) -> bool {
        self.awaiting.is_some()
    }

    pub fn processed_count(&self) -> u64 {
        self.reader.processed_count()
    }

    pub fn executor(&self) -> &E {
        &self.exec
    }

    pub fn executor_mut(&mut self) -> &mut E {
        &mut self.exec
    }

    pub fn resources(&self) -> &ResourceTable {
        &self.resources
    }

    pub fn context_generation(&self) -> u64 {
        self.context.generation()
    }

    /// Lost-surface ids not yet flushed to the readback region.
    pub fn take_lost_surfaces(&mut self) -> Vec<OwnerId> {
        std::mem::take(&mut self.lost_surfaces)
    }

    fn protocol_error(&mut self, reason: &'static str) -> TranslateError {
        self.reader.fail_connection(reason);
        TranslateError::Protocol(reason)
    }
}

impl<E: CommandExecutor> Drop for Translator<E> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Write `[count, id...]` (little-endian u32s) at the start of the readback
/// region. Invoked as the reader's side-channel flush hook and after
/// rehoming.
fn flush_lost_report(readback: &mut Option<Cursor>, lost: &mut Vec<OwnerId>) {
    if lost.is_empty() {
        return;
    }
    let cursor = match readback.as_mut() {
        Some(cursor) => cursor,
        // No readback region yet; keep accumulating.
        None => return,
    };
    let mut report = Vec::with_capacity(4 + lost.len() * 4);
    report.extend_from_slice(&(lost.len() as u32).to_le_bytes());
    for owner in lost.iter() {
        report.extend_from_slice(&owner.to_le_bytes());
    }
    cursor.seek(0);
    if let Err(err) = cursor.write(&report) {
        tracing::warn!("failed to write lost-surface report: {err}");
        return;
    }
    lost.clear();
}

/// A queued unit of consumer-side work. Drained strictly in order by one
/// worker; recursion is expressed by pushing a drain task back to the
/// front instead of re-entering the translator.
#[derive(Debug)]
pub enum TranslateTask {
    DrainStream,
    AddBuffer(Region),
    SetReadbackBuffer(Region),
    SetPixelSource(Region),
    ClearCaches,
    ReleaseDormantBuffers,
    ObserveToken(u64),
}

/// Single-owner task queue around a [`Translator`].
pub struct TranslatorWorker<E: CommandExecutor> {
    translator: Translator<E>,
    queue: VecDeque<TranslateTask>,
}

impl<E: CommandExecutor> TranslatorWorker<E> {
    pub fn new(translator: Translator<E>) -> TranslatorWorker<E> {
        TranslatorWorker {
            translator,
            queue: VecDeque::new(),
        }
    }

    pub fn push(&mut self, task: TranslateTask) {
        self.queue.push_back(task);
    }

    /// Drain the task queue in order. A handler returning true requeues a
    /// drain pass at the front.
    pub fn run_until_idle(&mut self) -> Result<(), TranslateError> {
        while let Some(task) = self.queue.pop_front() {
            if self.handle(task)? {
                self.queue.push_front(TranslateTask::DrainStream);
            }
        }
        Ok(())
    }

    fn handle(&mut self, task: TranslateTask) -> Result<bool, TranslateError> {
        match task {
            TranslateTask::DrainStream => self.translator.drain_stream(),
            TranslateTask::AddBuffer(region) => {
                self.translator.add_buffer(region)?;
                Ok(false)
            }
            TranslateTask::SetReadbackBuffer(region) => {
                self.translator.set_readback_buffer(region);
                Ok(false)
            }
            TranslateTask::SetPixelSource(region) => {
                self.translator.set_pixel_source(region);
                Ok(false)
            }
            TranslateTask::ClearCaches => {
                self.translator.clear_caches();
                Ok(false)
            }
            TranslateTask::ReleaseDormantBuffers => {
                self.translator.release_dormant_buffers();
                Ok(false)
            }
            TranslateTask::ObserveToken(token) => Ok(self.translator.observe_token(token)),
        }
    }

    pub fn translator(&self) -> &Translator<E> {
        &self.translator
    }

    pub fn translator_mut(&mut self) -> &mut Translator<E> {
        &mut self.translator
    }
}
