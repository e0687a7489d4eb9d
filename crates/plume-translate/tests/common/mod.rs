use plume_protocol::{DrawOp, LockMode, OwnerId, SurfaceDesc, SurfaceFormat, SurfaceUsage};
use plume_translate::{CommandExecutor, ExecutorError};

/// One observed executor call, in dispatch order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create(OwnerId),
    Lock(OwnerId),
    Unlock(OwnerId),
    Draw(OwnerId),
    Present(OwnerId, u32),
    Destroy(OwnerId),
}

/// Executor double that records every call it observes.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    pub calls: Vec<Call>,
}

impl CommandExecutor for RecordingExecutor {
    fn create_surface(&mut self, owner: OwnerId, _desc: &SurfaceDesc) -> Result<(), ExecutorError> {
        self.calls.push(Call::Create(owner));
        Ok(())
    }

    fn lock(&mut self, owner: OwnerId, _mode: LockMode) -> bool {
        self.calls.push(Call::Lock(owner));
        true
    }

    fn unlock(&mut self, owner: OwnerId) {
        self.calls.push(Call::Unlock(owner));
    }

    fn draw(
        &mut self,
        owner: OwnerId,
        _op: &DrawOp,
        _pixels: Option<&[u8]>,
    ) -> Result<(), ExecutorError> {
        self.calls.push(Call::Draw(owner));
        Ok(())
    }

    fn present(&mut self, owner: OwnerId, output: u32) -> bool {
        self.calls.push(Call::Present(owner, output));
        true
    }

    fn destroy(&mut self, owner: OwnerId) {
        self.calls.push(Call::Destroy(owner));
    }

    fn snapshot(&mut self, _owner: OwnerId) -> Option<Vec<u8>> {
        None
    }

    fn restore(
        &mut self,
        owner: OwnerId,
        _desc: &SurfaceDesc,
        _pixels: &[u8],
    ) -> Result<(), ExecutorError> {
        self.calls.push(Call::Create(owner));
        Ok(())
    }

    fn device_lost(&self) -> bool {
        false
    }

    fn reset_device(&mut self) {}
}

pub fn desc(width: u32, height: u32) -> SurfaceDesc {
    SurfaceDesc {
        width,
        height,
        format: SurfaceFormat::Bgra8,
        usage: SurfaceUsage::DISPLAY,
    }
}
