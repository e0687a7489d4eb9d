//! The boundary between translation and actual rasterization.
//!
//! The translator never inspects pixel contents itself (except to copy
//! between a lost surface and its fallback); everything visual goes through
//! [`CommandExecutor`]. Production embeds a hardware-backed implementation;
//! [`SoftwareExecutor`] is the in-memory fallback and the reference for the
//! expected semantics.

use std::collections::HashMap;

use plume_protocol::{DrawOp, LockMode, OwnerId, SurfaceDesc};

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The execution device was lost; the translator attempts rehoming.
    #[error("execution device lost")]
    DeviceLost,

    /// Surface storage could not be allocated.
    #[error("surface allocation failed")]
    Exhausted,

    /// The operation referenced an owner id the executor does not know.
    #[error("unknown surface {0}")]
    UnknownSurface(OwnerId),

    /// Blit source bytes missing or shorter than the blit rectangle.
    #[error("invalid blit source")]
    InvalidBlit,
}

/// Consumer-side execution backend.
///
/// One instance per connection. Implementations must tolerate calls in
/// exactly append order and nothing else; the translator guarantees a
/// surface is created before it is locked, drawn to, presented or
/// destroyed.
pub trait CommandExecutor: Send {
    fn create_surface(&mut self, owner: OwnerId, desc: &SurfaceDesc) -> Result<(), ExecutorError>;

    /// Returns false if the lock cannot be granted.
    fn lock(&mut self, owner: OwnerId, mode: LockMode) -> bool;

    fn unlock(&mut self, owner: OwnerId);

    /// `pixels` carries the blit source bytes for [`DrawOp::BlitPixels`],
    /// `None` for the other operations.
    fn draw(&mut self, owner: OwnerId, op: &DrawOp, pixels: Option<&[u8]>)
        -> Result<(), ExecutorError>;

    /// Returns false if presentation failed (commonly device loss).
    fn present(&mut self, owner: OwnerId, output: u32) -> bool;

    fn destroy(&mut self, owner: OwnerId);

    /// Last-known surface contents, if the backend can produce them.
    fn snapshot(&mut self, owner: OwnerId) -> Option<Vec<u8>>;

    /// Recreate a surface from a snapshot after rehoming.
    fn restore(
        &mut self,
        owner: OwnerId,
        desc: &SurfaceDesc,
        pixels: &[u8],
    ) -> Result<(), ExecutorError>;

    /// Poll for device loss detected outside an explicit error return.
    fn device_lost(&self) -> bool;

    /// Bind to a freshly (re)created execution context after device loss.
    fn reset_device(&mut self);
}

/// Discards every operation. Used when the accelerated path is configured
/// off but the protocol must still be drained.
#[derive(Debug, Default)]
pub struct NullExecutor;

impl CommandExecutor for NullExecutor {
    fn create_surface(&mut self, _owner: OwnerId, _desc: &SurfaceDesc) -> Result<(), ExecutorError> {
        Ok(())
    }

    fn lock(&mut self, _owner: OwnerId, _mode: LockMode) -> bool {
        true
    }

    fn unlock(&mut self, _owner: OwnerId) {}

    fn draw(
        &mut self,
        _owner: OwnerId,
        _op: &DrawOp,
        _pixels: Option<&[u8]>,
    ) -> Result<(), ExecutorError> {
        Ok(())
    }

    fn present(&mut self, _owner: OwnerId, _output: u32) -> bool {
        true
    }

    fn destroy(&mut self, _owner: OwnerId) {}

    fn snapshot(&mut self, _owner: OwnerId) -> Option<Vec<u8>> {
        None
    }

    fn restore(
        &mut self,
        _owner: OwnerId,
        _desc: &SurfaceDesc,
        _pixels: &[u8],
    ) -> Result<(), ExecutorError> {
        Ok(())
    }

    fn device_lost(&self) -> bool {
        false
    }

    fn reset_device(&mut self) {}
}

struct SoftSurface {
    desc: SurfaceDesc,
    /// 4 bytes per pixel, row-major.
    pixels: Vec<u8>,
    locked: bool,
}

/// In-memory software rasterizer.
///
/// Also the test double for device loss: [`SoftwareExecutor::inject_device_loss`]
/// drops every surface's storage the way a real context loss would.
#[derive(Default)]
pub struct SoftwareExecutor {
    surfaces: HashMap<OwnerId, SoftSurface>,
    lost: bool,
    presented: Vec<(OwnerId, u32)>,
}

impl SoftwareExecutor {
    pub fn new() -> SoftwareExecutor {
        SoftwareExecutor::default()
    }

    /// Simulate a context loss: surfaces lose their backing storage.
    pub fn inject_device_loss(&mut self) {
        self.lost = true;
        self.surfaces.clear();
    }

    pub fn surface_count(&self) -> usize {
        self.surfaces.len()
    }

    /// Pixel readback for tests and lost-surface copying.
    pub fn pixels(&self, owner: OwnerId) -> Option<&[u8]> {
        self.surfaces.get(&owner).map(|s| s.pixels.as_slice())
    }

    pub fn presented(&self) -> &[(OwnerId, u32)] {
        &self.presented
    }

    fn surface_mut(&mut self, owner: OwnerId) -> Result<&mut SoftSurface, ExecutorError> {
        self.surfaces
            .get_mut(&owner)
            .ok_or(ExecutorError::UnknownSurface(owner))
    }
}

fn put_pixel(surface: &mut SoftSurface, x: i32, y: i32, color: u32) {
    if x < 0 || y < 0 || x as u32 >= surface.desc.width || y as u32 >= surface.desc.height {
        return;
    }
    let idx = (y as usize * surface.desc.width as usize + x as usize) * 4;
    surface.pixels[idx..idx + 4].copy_from_slice(&color.to_le_bytes());
}

impl CommandExecutor for SoftwareExecutor {
    fn create_surface(&mut self, owner: OwnerId, desc: &SurfaceDesc) -> Result<(), ExecutorError> {
        if self.lost {
            return Err(ExecutorError::DeviceLost);
        }
        let bytes = desc
            .width
            .checked_mul(desc.height)
            .and_then(|px| px.checked_mul(4))
            .ok_or(ExecutorError::Exhausted)? as usize;
        self.surfaces.insert(
            owner,
            SoftSurface {
                desc: *desc,
                pixels: vec![0u8; bytes],
                locked: false,
            },
        );
        Ok(())
    }

    fn lock(&mut self, owner: OwnerId, _mode: LockMode) -> bool {
        match self.surfaces.get_mut(&owner) {
            Some(surface) if !surface.locked => {
                surface.locked = true;
                true
            }
            _ => false,
        }
    }

    fn unlock(&mut self, owner: OwnerId) {
        if let Some(surface) = self.surfaces.get_mut(&owner) {
            surface.locked = false;
        }
    }

    fn draw(
        &mut self,
        owner: OwnerId,
        op: &DrawOp,
        pixels: Option<&[u8]>,
    ) -> Result<(), ExecutorError> {
        if self.lost {
            return Err(ExecutorError::DeviceLost);
        }
        let surface = self.surface_mut(owner)?;
        match *op {
            DrawOp::FillRect {
                x,
                y,
                width,
                height,
                color,
            } => {
                for dy in 0..height as i32 {
                    for dx in 0..width as i32 {
                        put_pixel(surface, x + dx, y + dy, color);
                    }
                }
            }
            DrawOp::StrokeLine {
                x0,
                y0,
                x1,
                y1,
                color,
                thickness: _,
            } => {
                // Bresenham, single-pixel thickness.
                let (mut x, mut y) = (x0, y0);
                let dx = (x1 - x0).abs();
                let dy = -(y1 - y0).abs();
                let sx = if x0 < x1 { 1 } else { -1 };
                let sy = if y0 < y1 { 1 } else { -1 };
                let mut err = dx + dy;
                loop {
                    put_pixel(surface, x, y, color);
                    if x == x1 && y == y1 {
                        break;
                    }
                    let e2 = 2 * err;
                    if e2 >= dy {
                        err += dy;
                        x += sx;
                    }
                    if e2 <= dx {
                        err += dx;
                        y += sy;
                    }
                }
            }
            DrawOp::BlitPixels {
                x,
                y,
                width,
                height,
                ..
            } => {
                let src = pixels.ok_or(ExecutorError::InvalidBlit)?;
                let row_bytes = width as usize * 4;
                if src.len() < height as usize * row_bytes {
                    return Err(ExecutorError::InvalidBlit);
                }
                for dy in 0..height as usize {
                    let row = &src[dy * row_bytes..(dy + 1) * row_bytes];
                    for dx in 0..width as usize {
                        let color = u32::from_le_bytes([
                            row[dx * 4],
                            row[dx * 4 + 1],
                            row[dx * 4 + 2],
                            row[dx * 4 + 3],
                        ]);
                        put_pixel(surface, x + dx as i32, y + dy as i32, color);
                    }
                }
            }
        }
        Ok(())
    }

    fn present(&mut self, owner: OwnerId, output: u32) -> bool {
        if self.lost || !self.surfaces.contains_key(&owner) {
            return false;
        }
        self.presented.push((owner, output));
        true
    }

    fn destroy(&mut self, owner: OwnerId) {
        self.surfaces.remove(&owner);
    }

    fn snapshot(&mut self, owner: OwnerId) -> Option<Vec<u8>> {
        self.surfaces.get(&owner).map(|s| s.pixels.clone())
    }

    fn restore(
        &mut self,
        owner: OwnerId,
        desc: &SurfaceDesc,
        pixels: &[u8],
    ) -> Result<(), ExecutorError> {
        if self.lost {
            return Err(ExecutorError::DeviceLost);
        }
        self.create_surface(owner, desc)?;
        let surface = self.surface_mut(owner)?;
        let len = surface.pixels.len().min(pixels.len());
        surface.pixels[..len].copy_from_slice(&pixels[..len]);
        Ok(())
    }

    fn device_lost(&self) -> bool {
        self.lost
    }

    fn reset_device(&mut self) {
        self.lost = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plume_protocol::{SurfaceFormat, SurfaceUsage};

    fn desc(w: u32, h: u32) -> SurfaceDesc {
        SurfaceDesc {
            width: w,
            height: h,
            format: SurfaceFormat::Bgra8,
            usage: SurfaceUsage::DISPLAY,
        }
    }

    #[test]
    fn fill_rect_writes_pixels() {
        let mut exec = SoftwareExecutor::new();
        exec.create_surface(1, &desc(4, 4)).unwrap();
        exec.draw(
            1,
            &DrawOp::FillRect {
                x: 1,
                y: 1,
                width: 2,
                height: 2,
                color: 0xff00_00ff,
            },
            None,
        )
        .unwrap();
        let pixels = exec.pixels(1).unwrap();
        // (0,0) untouched, (1,1) filled.
        assert_eq!(&pixels[0..4], &[0, 0, 0, 0]);
        let idx = (1 * 4 + 1) * 4;
        assert_eq!(&pixels[idx..idx + 4], &0xff00_00ffu32.to_le_bytes());
    }

    #[test]
    fn double_lock_is_refused() {
        let mut exec = SoftwareExecutor::new();
        exec.create_surface(1, &desc(2, 2)).unwrap();
        assert!(exec.lock(1, LockMode::ReadWrite));
        assert!(!exec.lock(1, LockMode::ReadOnly));
        exec.unlock(1);
        assert!(exec.lock(1, LockMode::ReadOnly));
    }

    #[test]
    fn device_loss_drops_surfaces_until_reset() {
        let mut exec = SoftwareExecutor::new();
        exec.create_surface(1, &desc(2, 2)).unwrap();
        exec.inject_device_loss();
        assert!(exec.device_lost());
        assert_eq!(exec.surface_count(), 0);
        assert!(matches!(
            exec.create_surface(2, &desc(2, 2)),
            Err(ExecutorError::DeviceLost)
        ));
        exec.reset_device();
        exec.create_surface(2, &desc(2, 2)).unwrap();
    }

    #[test]
    fn snapshot_then_restore_round_trips() {
        let mut exec = SoftwareExecutor::new();
        let d = desc(2, 2);
        exec.create_surface(1, &d).unwrap();
        exec.draw(
            1,
            &DrawOp::FillRect {
                x: 0,
                y: 0,
                width: 2,
                height: 2,
                color: 0x1234_5678,
            },
            None,
        )
        .unwrap();
        let snap = exec.snapshot(1).unwrap();
        exec.destroy(1);
        exec.restore(1, &d, &snap).unwrap();
        assert_eq!(exec.pixels(1).unwrap(), snap.as_slice());
    }
}
