// GPU module - Backend seam for the presentation pipeline
//
// This module provides:
// - The three-level backend abstraction (backend → factory → device)
// - Lockable GPU resources with an RAII lock guard
// - Device capability profiles, present parameters and device status
// - A wgpu backend and an in-memory headless backend
//
// Every GPU object is an owned value; dropping it releases the underlying
// handle exactly once. Devices and factories additionally expose `release`,
// which reports objects that are still referenced elsewhere.

pub mod headless;
pub mod wgpu_backend;

pub use headless::{HeadlessBackend, HeadlessProbe};
pub use wgpu_backend::WgpuBackend;

use crate::geometry::Viewport;
use thiserror::Error;

/// Default pixel-stage program: samples the index texture and resolves it
/// through the palette texture
pub const PALETTE_PROGRAM: &[u8] = include_bytes!("shaders/palette.wgsl");

/// Errors reported by a GPU backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    #[error("graphics API unavailable: {0}")]
    Unavailable(String),
    #[error("device creation failed for {profile:?}: {reason}")]
    DeviceCreation {
        profile: DeviceProfile,
        reason: String,
    },
    #[error("failed to create {resource}: {reason}")]
    ResourceCreation {
        resource: &'static str,
        reason: String,
    },
    #[error("failed to bind {0}")]
    Binding(&'static str),
    #[error("resource is already locked")]
    AlreadyLocked,
    #[error("lock rectangle out of bounds")]
    LockOutOfBounds,
    #[error("lock failed: {0}")]
    Lock(String),
    #[error("device reset failed: {0}")]
    Reset(String),
    #[error("draw failed: {0}")]
    Draw(String),
    #[error("present failed: {0}")]
    Present(String),
    #[error("device lost")]
    DeviceLost,
    #[error("{0} outstanding references at release")]
    OutstandingReferences(u32),
}

/// Device capability profiles, most capable first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceProfile {
    /// Hardware vertex processing on a pure device
    HardwarePure,
    /// Hardware vertex processing
    Hardware,
    /// Mixed hardware and software vertex processing
    Mixed,
    /// Software vertex processing
    Software,
}

impl DeviceProfile {
    /// Order in which profiles are attempted
    pub const ATTEMPT_ORDER: [DeviceProfile; 4] = [
        DeviceProfile::HardwarePure,
        DeviceProfile::Hardware,
        DeviceProfile::Mixed,
        DeviceProfile::Software,
    ];
}

/// Back-buffer pixel format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackBufferFormat {
    /// 32-bit, 8 bits per channel, unused alpha
    X8R8G8B8,
}

/// Present (swap chain) configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentParams {
    /// Present into a window
    pub windowed: bool,
    /// Back-buffer width; 0 = window client area
    pub back_buffer_width: u32,
    /// Back-buffer height; 0 = window client area
    pub back_buffer_height: u32,
    /// Back-buffer format
    pub format: BackBufferFormat,
    /// Wait for vertical blank before presenting
    pub vsync: bool,
}

impl PresentParams {
    /// Build present parameters for an output size
    ///
    /// Windowed sessions leave the back-buffer size to the window.
    pub fn new(windowed: bool, vsync: bool, output_size: (u32, u32)) -> Self {
        let (width, height) = if windowed { (0, 0) } else { output_size };
        Self {
            windowed,
            back_buffer_width: width,
            back_buffer_height: height,
            format: BackBufferFormat::X8R8G8B8,
            vsync,
        }
    }
}

/// Texel formats used by the presentation textures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureFormat {
    /// 8-bit single channel (palette indices)
    L8,
    /// 32-bit B, G, R, X
    X8R8G8B8,
}

impl TextureFormat {
    /// Bytes per texel
    pub fn bytes_per_texel(self) -> usize {
        match self {
            TextureFormat::L8 => 1,
            TextureFormat::X8R8G8B8 => 4,
        }
    }
}

/// Rectangle in texels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    /// Rectangle anchored at the origin
    pub fn from_size(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }
}

/// Device health as reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// Device can render and present
    Ok,
    /// Device is lost and cannot be reset yet
    Lost,
    /// Device is lost and can be reset now
    NotReset,
    /// Device is gone for good; only recreation helps
    Removed,
}

/// CPU view of a locked resource
pub struct Mapped<'a> {
    /// Locked bytes, starting at the top-left of the locked rectangle
    pub bits: &'a mut [u8],
    /// Distance between rows in bytes
    pub pitch: usize,
}

/// A GPU resource that can be locked for CPU writes
pub trait Lockable {
    /// Lock `rect` (or the whole resource) for writing
    fn lock(&mut self, rect: Option<Rect>) -> Result<(), GpuError>;

    /// Bytes of the current lock, `None` when not locked
    fn mapped(&mut self) -> Option<Mapped<'_>>;

    /// Release the current lock and upload what was written
    fn unlock(&mut self);
}

/// Scoped lock; unlocks when dropped
pub struct LockGuard<'a, L: Lockable + ?Sized> {
    resource: &'a mut L,
}

impl<'a, L: Lockable + ?Sized> LockGuard<'a, L> {
    /// Lock `resource`
    ///
    /// # Arguments
    /// * `resource` - Resource to lock
    /// * `rect` - Region to lock, `None` for the whole resource
    ///
    /// # Returns
    /// A guard that unlocks on drop, or the lock error (nothing to unlock)
    pub fn new(resource: &'a mut L, rect: Option<Rect>) -> Result<Self, GpuError> {
        resource.lock(rect)?;
        Ok(Self { resource })
    }

    /// Locked bytes and pitch
    pub fn mapped(&mut self) -> Result<Mapped<'_>, GpuError> {
        self.resource
            .mapped()
            .ok_or_else(|| GpuError::Lock("resource not mapped".to_string()))
    }
}

impl<L: Lockable + ?Sized> Drop for LockGuard<'_, L> {
    fn drop(&mut self) {
        self.resource.unlock();
    }
}

/// Entry point of a graphics API; lives across sessions
pub trait GpuBackend {
    type Factory: GpuFactory;

    /// Create the device-creation factory
    fn create_factory(&mut self) -> Result<Self::Factory, GpuError>;
}

/// Creates devices
pub trait GpuFactory {
    type Device: GpuDevice;

    /// Create a device using one capability profile
    fn create_device(
        &mut self,
        profile: DeviceProfile,
        params: &PresentParams,
    ) -> Result<Self::Device, GpuError>;

    /// Release the factory
    ///
    /// Fails when the factory is still referenced elsewhere; it is dropped
    /// regardless.
    fn release(self) -> Result<(), GpuError>;
}

/// A rendering device and the presentation operations the frame loop needs
pub trait GpuDevice {
    type VertexBuffer: Lockable;
    type Texture: Lockable;
    type PixelProgram;

    /// Create a vertex buffer of `size` bytes
    fn create_vertex_buffer(&mut self, size: usize) -> Result<Self::VertexBuffer, GpuError>;

    /// Create a 2D texture
    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Result<Self::Texture, GpuError>;

    /// Create a pixel-stage program from a compiled blob
    fn create_pixel_program(&mut self, blob: &[u8]) -> Result<Self::PixelProgram, GpuError>;

    /// Select the pre-transformed position + texcoord vertex format
    fn set_vertex_format(&mut self) -> Result<(), GpuError>;

    /// Bind `buffer` as stream 0 with `stride` bytes per vertex
    fn set_stream_source(
        &mut self,
        buffer: &Self::VertexBuffer,
        stride: usize,
    ) -> Result<(), GpuError>;

    /// Bind `texture` to a texture stage
    fn set_texture(&mut self, stage: u32, texture: &Self::Texture) -> Result<(), GpuError>;

    /// Bind the pixel-stage program
    fn set_pixel_program(&mut self, program: &Self::PixelProgram) -> Result<(), GpuError>;

    /// Restrict rendering to `viewport`
    fn set_viewport(&mut self, viewport: Viewport) -> Result<(), GpuError>;

    /// Offset added to vertex positions so texel centers land on pixel centers
    fn pixel_center_bias(&self) -> f32;

    /// Current device health
    fn test_cooperative_level(&mut self) -> DeviceStatus;

    /// Reset the swap chain with new present parameters
    fn reset(&mut self, params: &PresentParams) -> Result<(), GpuError>;

    /// Draw `primitive_count` triangles of the bound strip
    fn draw_triangle_strip(&mut self, primitive_count: u32) -> Result<(), GpuError>;

    /// Present the back buffer
    fn present(&mut self) -> Result<(), GpuError>;

    /// Release the device
    ///
    /// Fails when the device is still referenced elsewhere; it is dropped
    /// regardless.
    fn release(self) -> Result<(), GpuError>;
}

/// Device type produced by a backend
pub type DeviceOf<B> = <<B as GpuBackend>::Factory as GpuFactory>::Device;

#[cfg(test)]
mod tests {
    use super::*;

    struct Buffer {
        data: Vec<u8>,
        locked: bool,
        unlocks: u32,
    }

    impl Lockable for Buffer {
        fn lock(&mut self, _rect: Option<Rect>) -> Result<(), GpuError> {
            if self.locked {
                return Err(GpuError::AlreadyLocked);
            }
            self.locked = true;
            Ok(())
        }

        fn mapped(&mut self) -> Option<Mapped<'_>> {
            if !self.locked {
                return None;
            }
            let pitch = self.data.len();
            Some(Mapped {
                bits: &mut self.data,
                pitch,
            })
        }

        fn unlock(&mut self) {
            self.locked = false;
            self.unlocks += 1;
        }
    }

    #[test]
    fn test_lock_guard_unlocks_on_drop() {
        let mut buffer = Buffer {
            data: vec![0; 8],
            locked: false,
            unlocks: 0,
        };

        {
            let mut guard = LockGuard::new(&mut buffer, None).unwrap();
            guard.mapped().unwrap().bits[0] = 0xAB;
        }

        assert!(!buffer.locked);
        assert_eq!(buffer.unlocks, 1);
        assert_eq!(buffer.data[0], 0xAB);
    }

    #[test]
    fn test_failed_lock_does_not_unlock() {
        let mut buffer = Buffer {
            data: vec![0; 8],
            locked: true,
            unlocks: 0,
        };

        assert!(matches!(
            LockGuard::new(&mut buffer, None),
            Err(GpuError::AlreadyLocked)
        ));
        assert_eq!(buffer.unlocks, 0);
    }

    #[test]
    fn test_present_params() {
        let windowed = PresentParams::new(true, false, (1280, 720));
        assert_eq!((windowed.back_buffer_width, windowed.back_buffer_height), (0, 0));

        let fullscreen = PresentParams::new(false, true, (1280, 720));
        assert_eq!(
            (fullscreen.back_buffer_width, fullscreen.back_buffer_height),
            (1280, 720)
        );
        assert!(fullscreen.vsync);
    }

    #[test]
    fn test_texture_format_sizes() {
        assert_eq!(TextureFormat::L8.bytes_per_texel(), 1);
        assert_eq!(TextureFormat::X8R8G8B8.bytes_per_texel(), 4);
    }
}
