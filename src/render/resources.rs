// Resource set - GPU objects owned by an active device session
//
// Field order is release order: vertex buffer, source texture, palette
// texture, program. Dropping the set releases each of them exactly once.

use crate::geometry::{
    compute_quad, texture_size_for, CutsceneScale, ScaleState, Viewport, QUAD_BYTES,
};
use crate::gpu::{GpuDevice, GpuError, LockGuard, Rect, TextureFormat};
use crate::shared::{FrameData, Palette, PALETTE_BYTES, PALETTE_ENTRIES};

/// Texture stage sampled for palette indices
pub const SOURCE_STAGE: u32 = 0;

/// Texture stage sampled for palette colors
pub const PALETTE_STAGE: u32 = 1;

/// Primitives in the presentation strip
pub const QUAD_PRIMITIVES: u32 = 2;

/// GPU objects needed to present one framebuffer
pub struct ResourceSet<D: GpuDevice> {
    vertex_buffer: D::VertexBuffer,
    source_texture: D::Texture,
    palette_texture: D::Texture,
    program: D::PixelProgram,
    texture_size: (u32, u32),
    scale: ScaleState,
}

impl<D: GpuDevice> ResourceSet<D> {
    /// Allocate every resource for a logical framebuffer size
    ///
    /// # Arguments
    /// * `device` - Device to allocate on
    /// * `logical` - Logical framebuffer size (width, height)
    /// * `program` - Compiled pixel-stage program
    ///
    /// # Returns
    /// The full set, or the first allocation error (nothing is leaked)
    pub fn allocate(device: &mut D, logical: (u32, u32), program: &[u8]) -> Result<Self, GpuError> {
        let texture_size = texture_size_for(logical.0, logical.1);
        let scale = ScaleState::new(logical, texture_size);

        let vertex_buffer = device.create_vertex_buffer(QUAD_BYTES)?;
        let source_texture = device.create_texture(texture_size.0, texture_size.1, TextureFormat::L8)?;
        let palette_texture =
            device.create_texture(PALETTE_ENTRIES as u32, 1, TextureFormat::X8R8G8B8)?;
        let program = device.create_pixel_program(program)?;

        Ok(Self {
            vertex_buffer,
            source_texture,
            palette_texture,
            program,
            texture_size,
            scale,
        })
    }

    /// Side lengths of the source texture
    pub fn texture_size(&self) -> (u32, u32) {
        self.texture_size
    }

    /// Base scale of the logical framebuffer inside the source texture
    pub fn scale(&self) -> ScaleState {
        self.scale
    }

    /// Bind every resource and the viewport on `device`
    pub fn bind(&self, device: &mut D, viewport: Viewport) -> Result<(), GpuError> {
        device.set_vertex_format()?;
        device.set_stream_source(&self.vertex_buffer, crate::geometry::Vertex::STRIDE)?;
        device.set_texture(SOURCE_STAGE, &self.source_texture)?;
        device.set_texture(PALETTE_STAGE, &self.palette_texture)?;
        device.set_pixel_program(&self.program)?;
        device.set_viewport(viewport)
    }

    /// Recompute the quad and write it into the vertex buffer
    ///
    /// # Arguments
    /// * `viewport` - Output rectangle
    /// * `cutscene` - Cutscene scaling, when a cutscene is playing
    /// * `pixel_center_bias` - Position offset reported by the device
    pub fn write_quad(
        &mut self,
        viewport: Viewport,
        cutscene: Option<&CutsceneScale>,
        pixel_center_bias: f32,
    ) -> Result<(), GpuError> {
        let quad = compute_quad(viewport, self.scale, cutscene, pixel_center_bias);
        let bytes: &[u8] = bytemuck::cast_slice(&quad);

        let mut guard = LockGuard::new(&mut self.vertex_buffer, None)?;
        let mapped = guard.mapped()?;
        let dst = mapped
            .bits
            .get_mut(..QUAD_BYTES)
            .ok_or_else(|| GpuError::Lock("vertex buffer too small".to_string()))?;
        dst.copy_from_slice(bytes);
        Ok(())
    }

    /// Copy the framebuffer into the source texture, row by row
    pub fn upload_surface(&mut self, frame: &FrameData) -> Result<(), GpuError> {
        let (width, height) = (frame.width as usize, frame.height as usize);
        if width == 0 || height == 0 {
            return Ok(());
        }

        let rect = Rect::from_size(frame.width, frame.height);
        let mut guard = LockGuard::new(&mut self.source_texture, Some(rect))?;
        let mapped = guard.mapped()?;

        for (y, src) in frame.surface.chunks_exact(width).take(height).enumerate() {
            let start = y * mapped.pitch;
            let dst = mapped
                .bits
                .get_mut(start..start + width)
                .ok_or(GpuError::LockOutOfBounds)?;
            dst.copy_from_slice(src);
        }
        Ok(())
    }

    /// Copy all 256 palette entries into the palette texture
    pub fn upload_palette(&mut self, palette: &Palette) -> Result<(), GpuError> {
        let rect = Rect::from_size(PALETTE_ENTRIES as u32, 1);
        let mut guard = LockGuard::new(&mut self.palette_texture, Some(rect))?;
        let mapped = guard.mapped()?;
        let dst = mapped
            .bits
            .get_mut(..PALETTE_BYTES)
            .ok_or(GpuError::LockOutOfBounds)?;
        dst.copy_from_slice(palette);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{
        DeviceProfile, GpuBackend, GpuFactory, HeadlessBackend, HeadlessProbe, PresentParams,
        PALETTE_PROGRAM,
    };
    use crate::gpu::headless::HeadlessDevice;
    use crate::shared::palette_from_rgb;

    fn device(probe: &HeadlessProbe) -> HeadlessDevice {
        let mut factory = HeadlessBackend::new(probe.clone()).create_factory().unwrap();
        factory
            .create_device(DeviceProfile::Hardware, &PresentParams::new(true, false, (640, 480)))
            .unwrap()
    }

    #[test]
    fn test_allocate_sizes() {
        let probe = HeadlessProbe::new();
        let mut device = device(&probe);
        let set = ResourceSet::allocate(&mut device, (640, 480), PALETTE_PROGRAM).unwrap();

        assert_eq!(set.texture_size(), (1024, 1024));
        assert_eq!(set.scale(), ScaleState::new((640, 480), (1024, 1024)));

        let palette = probe.palette_texture().unwrap();
        assert_eq!((palette.width, palette.height), (256, 1));
        let source = probe.source_texture().unwrap();
        assert_eq!((source.width, source.height), (1024, 1024));
    }

    #[test]
    fn test_allocate_failure_leaks_nothing() {
        let probe = HeadlessProbe::new();
        let mut device = device(&probe);
        let before = probe.live_objects();

        probe.set_failing_resource(Some("palette texture"));
        assert!(ResourceSet::allocate(&mut device, (640, 480), PALETTE_PROGRAM).is_err());
        assert_eq!(probe.live_objects(), before);
    }

    #[test]
    fn test_upload_honors_pitch() {
        let probe = HeadlessProbe::new();
        let mut device = device(&probe);
        let mut set = ResourceSet::allocate(&mut device, (3, 2), PALETTE_PROGRAM).unwrap();

        let mut frame = FrameData::new(3, 2);
        frame.surface.copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        set.upload_surface(&frame).unwrap();

        let texture = probe.source_texture().unwrap();
        assert_eq!(&texture.row(0)[..3], &[1, 2, 3]);
        assert_eq!(&texture.row(1)[..3], &[4, 5, 6]);
    }

    #[test]
    fn test_upload_palette() {
        let probe = HeadlessProbe::new();
        let mut device = device(&probe);
        let mut set = ResourceSet::allocate(&mut device, (4, 4), PALETTE_PROGRAM).unwrap();

        set.upload_palette(&palette_from_rgb(&[0x0000FF, 0x00FF00])).unwrap();

        let texture = probe.palette_texture().unwrap();
        assert_eq!(&texture.row(0)[..8], &[0xFF, 0, 0, 0, 0, 0xFF, 0, 0]);
    }

    #[test]
    fn test_write_quad_skips_on_lock_failure() {
        let probe = HeadlessProbe::new();
        let mut device = device(&probe);
        let mut set = ResourceSet::allocate(&mut device, (640, 480), PALETTE_PROGRAM).unwrap();

        probe.set_fail_locks(true);
        assert!(set.write_quad(Viewport::new(0, 0, 640, 480), None, 0.0).is_err());
        assert_eq!(probe.vertex_uploads(), 0);

        probe.set_fail_locks(false);
        set.write_quad(Viewport::new(0, 0, 640, 480), None, 0.0).unwrap();
        assert_eq!(probe.vertex_uploads(), 1);
        assert_eq!(probe.vertices().unwrap()[3].x, 640.0);
    }
}
