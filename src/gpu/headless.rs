// Headless backend - In-memory GPU backend
//
// Implements the backend traits on plain memory so the presenter can run
// without a display. A shared `HeadlessProbe` scripts device behavior
// (failing profiles, lost devices, failing resets, failing locks) and records
// what happened (uploads, bindings, draws, presents, live objects).

use super::{
    DeviceProfile, DeviceStatus, GpuBackend, GpuDevice, GpuError, GpuFactory, Lockable, Mapped,
    PresentParams, Rect, TextureFormat,
};
use crate::geometry::{Vertex, Viewport, HALF_PIXEL_BIAS, QUAD_VERTEX_COUNT};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Extra bytes at the end of every headless texture row
///
/// Keeps the texture pitch different from the row width so copies must
/// honor the pitch.
pub const ROW_PADDING: usize = 16;

/// Contents of a texture as last uploaded
#[derive(Debug, Clone, PartialEq)]
pub struct TextureSnapshot {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub pitch: usize,
    pub data: Vec<u8>,
    /// Texture has not been released yet
    pub live: bool,
}

impl TextureSnapshot {
    /// Texels of row `y`, without padding
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.pitch;
        let len = self.width as usize * self.format.bytes_per_texel();
        &self.data[start..start + len]
    }
}

#[derive(Debug)]
struct ProbeState {
    // Scripted behavior
    fail_factory: bool,
    failing_profiles: HashSet<DeviceProfile>,
    failing_resource: Option<&'static str>,
    fail_bindings: bool,
    fail_locks: bool,
    fail_resets: bool,
    status: DeviceStatus,
    outstanding_device_refs: u32,
    outstanding_factory_refs: u32,
    pixel_center_bias: f32,

    // Observations
    factories_created: u32,
    device_attempts: Vec<DeviceProfile>,
    devices_created: u32,
    device_releases: u32,
    live_objects: i64,
    reset_attempts: u32,
    resets: u32,
    draws: u32,
    presents: u32,
    vertex_uploads: u32,
    vertices: Option<[Vertex; QUAD_VERTEX_COUNT]>,
    viewport: Option<Viewport>,
    back_buffer: Option<PresentParams>,
    textures: Vec<TextureSnapshot>,
}

impl Default for ProbeState {
    fn default() -> Self {
        Self {
            fail_factory: false,
            failing_profiles: HashSet::new(),
            failing_resource: None,
            fail_bindings: false,
            fail_locks: false,
            fail_resets: false,
            status: DeviceStatus::Ok,
            outstanding_device_refs: 0,
            outstanding_factory_refs: 0,
            pixel_center_bias: HALF_PIXEL_BIAS,
            factories_created: 0,
            device_attempts: Vec::new(),
            devices_created: 0,
            device_releases: 0,
            live_objects: 0,
            reset_attempts: 0,
            resets: 0,
            draws: 0,
            presents: 0,
            vertex_uploads: 0,
            vertices: None,
            viewport: None,
            back_buffer: None,
            textures: Vec::new(),
        }
    }
}

/// Handle for scripting and observing the headless backend
#[derive(Debug, Clone, Default)]
pub struct HeadlessProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl HeadlessProbe {
    /// Create a probe for a healthy backend
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ProbeState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Make factory creation fail (graphics API unavailable)
    pub fn set_fail_factory(&self, fail: bool) {
        self.state().fail_factory = fail;
    }

    /// Make device creation fail for `profile`
    pub fn fail_profile(&self, profile: DeviceProfile) {
        self.state().failing_profiles.insert(profile);
    }

    /// Make device creation fail for every profile
    pub fn fail_all_profiles(&self) {
        self.state()
            .failing_profiles
            .extend(DeviceProfile::ATTEMPT_ORDER);
    }

    /// Let every profile succeed again
    pub fn clear_failing_profiles(&self) {
        self.state().failing_profiles.clear();
    }

    /// Make creation of one resource kind fail
    ///
    /// Kinds: "vertex buffer", "source texture", "palette texture", "pixel program".
    pub fn set_failing_resource(&self, resource: Option<&'static str>) {
        self.state().failing_resource = resource;
    }

    /// Make every state binding fail
    pub fn set_fail_bindings(&self, fail: bool) {
        self.state().fail_bindings = fail;
    }

    /// Make every resource lock fail
    pub fn set_fail_locks(&self, fail: bool) {
        self.state().fail_locks = fail;
    }

    /// Make device resets fail
    pub fn set_fail_resets(&self, fail: bool) {
        self.state().fail_resets = fail;
    }

    /// Status reported by `test_cooperative_level`
    pub fn set_status(&self, status: DeviceStatus) {
        self.state().status = status;
    }

    /// References still held on the device when it is released
    pub fn set_outstanding_device_refs(&self, refs: u32) {
        self.state().outstanding_device_refs = refs;
    }

    /// References still held on the factory when it is released
    pub fn set_outstanding_factory_refs(&self, refs: u32) {
        self.state().outstanding_factory_refs = refs;
    }

    /// Pixel-center bias reported by devices
    pub fn set_pixel_center_bias(&self, bias: f32) {
        self.state().pixel_center_bias = bias;
    }

    /// Factories created so far
    pub fn factories_created(&self) -> u32 {
        self.state().factories_created
    }

    /// Every profile attempted, in order
    pub fn device_attempts(&self) -> Vec<DeviceProfile> {
        self.state().device_attempts.clone()
    }

    /// Devices created so far
    pub fn devices_created(&self) -> u32 {
        self.state().devices_created
    }

    /// Device releases so far
    pub fn device_releases(&self) -> u32 {
        self.state().device_releases
    }

    /// GPU objects currently alive (factories, devices, resources)
    pub fn live_objects(&self) -> i64 {
        self.state().live_objects
    }

    /// Reset attempts so far
    pub fn reset_attempts(&self) -> u32 {
        self.state().reset_attempts
    }

    /// Successful resets so far
    pub fn resets(&self) -> u32 {
        self.state().resets
    }

    /// Draw calls so far
    pub fn draws(&self) -> u32 {
        self.state().draws
    }

    /// Presents so far
    pub fn presents(&self) -> u32 {
        self.state().presents
    }

    /// Vertex buffer uploads so far
    pub fn vertex_uploads(&self) -> u32 {
        self.state().vertex_uploads
    }

    /// Quad vertices as last uploaded
    pub fn vertices(&self) -> Option<[Vertex; QUAD_VERTEX_COUNT]> {
        self.state().vertices
    }

    /// Viewport last set on a device
    pub fn viewport(&self) -> Option<Viewport> {
        self.state().viewport
    }

    /// Present parameters of the current swap chain
    pub fn back_buffer(&self) -> Option<PresentParams> {
        self.state().back_buffer
    }

    /// Most recently created texture of `format`
    pub fn latest_texture(&self, format: TextureFormat) -> Option<TextureSnapshot> {
        self.state()
            .textures
            .iter()
            .rev()
            .find(|t| t.format == format)
            .cloned()
    }

    /// Most recently created source (index) texture
    pub fn source_texture(&self) -> Option<TextureSnapshot> {
        self.latest_texture(TextureFormat::L8)
    }

    /// Most recently created palette texture
    pub fn palette_texture(&self) -> Option<TextureSnapshot> {
        self.latest_texture(TextureFormat::X8R8G8B8)
    }

    fn object_created(&self) {
        self.state().live_objects += 1;
    }

    fn object_dropped(&self) {
        self.state().live_objects -= 1;
    }

    fn check_resource(&self, resource: &'static str) -> Result<(), GpuError> {
        if self.state().failing_resource == Some(resource) {
            return Err(GpuError::ResourceCreation {
                resource,
                reason: "scripted failure".to_string(),
            });
        }
        Ok(())
    }

    fn check_binding(&self, what: &'static str) -> Result<(), GpuError> {
        if self.state().fail_bindings {
            return Err(GpuError::Binding(what));
        }
        Ok(())
    }
}

/// Headless graphics API entry point
#[derive(Debug, Clone, Default)]
pub struct HeadlessBackend {
    probe: HeadlessProbe,
}

impl HeadlessBackend {
    /// Create a backend observed through `probe`
    pub fn new(probe: HeadlessProbe) -> Self {
        Self { probe }
    }

    /// Probe shared with every object this backend creates
    pub fn probe(&self) -> &HeadlessProbe {
        &self.probe
    }
}

impl GpuBackend for HeadlessBackend {
    type Factory = HeadlessFactory;

    fn create_factory(&mut self) -> Result<HeadlessFactory, GpuError> {
        {
            let mut state = self.probe.state();
            if state.fail_factory {
                return Err(GpuError::Unavailable("headless API disabled".to_string()));
            }
            state.factories_created += 1;
        }
        self.probe.object_created();
        Ok(HeadlessFactory {
            probe: self.probe.clone(),
        })
    }
}

/// Headless device factory
#[derive(Debug)]
pub struct HeadlessFactory {
    probe: HeadlessProbe,
}

impl GpuFactory for HeadlessFactory {
    type Device = HeadlessDevice;

    fn create_device(
        &mut self,
        profile: DeviceProfile,
        params: &PresentParams,
    ) -> Result<HeadlessDevice, GpuError> {
        {
            let mut state = self.probe.state();
            state.device_attempts.push(profile);
            if state.failing_profiles.contains(&profile) {
                return Err(GpuError::DeviceCreation {
                    profile,
                    reason: "scripted failure".to_string(),
                });
            }
            state.devices_created += 1;
            state.back_buffer = Some(*params);
        }
        self.probe.object_created();
        Ok(HeadlessDevice {
            probe: self.probe.clone(),
            profile,
            next_id: 0,
            bindings: Bindings::default(),
        })
    }

    fn release(self) -> Result<(), GpuError> {
        let refs = self.probe.state().outstanding_factory_refs;
        if refs > 0 {
            return Err(GpuError::OutstandingReferences(refs));
        }
        Ok(())
    }
}

impl Drop for HeadlessFactory {
    fn drop(&mut self) {
        self.probe.object_dropped();
    }
}

#[derive(Debug, Default)]
struct Bindings {
    vertex_format: bool,
    stream: Option<u64>,
    textures: [Option<u64>; 2],
    program: Option<u64>,
    viewport: Option<Viewport>,
}

impl Bindings {
    fn complete(&self) -> bool {
        self.vertex_format
            && self.stream.is_some()
            && self.textures.iter().all(Option::is_some)
            && self.program.is_some()
            && self.viewport.is_some()
    }
}

/// Headless rendering device
#[derive(Debug)]
pub struct HeadlessDevice {
    probe: HeadlessProbe,
    profile: DeviceProfile,
    next_id: u64,
    bindings: Bindings,
}

impl HeadlessDevice {
    /// Profile this device was created with
    pub fn profile(&self) -> DeviceProfile {
        self.profile
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

impl GpuDevice for HeadlessDevice {
    type VertexBuffer = HeadlessVertexBuffer;
    type Texture = HeadlessTexture;
    type PixelProgram = HeadlessProgram;

    fn create_vertex_buffer(&mut self, size: usize) -> Result<HeadlessVertexBuffer, GpuError> {
        self.probe.check_resource("vertex buffer")?;
        self.probe.object_created();
        Ok(HeadlessVertexBuffer {
            id: self.allocate_id(),
            probe: self.probe.clone(),
            data: vec![0; size],
            locked: false,
        })
    }

    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Result<HeadlessTexture, GpuError> {
        let kind = match format {
            TextureFormat::L8 => "source texture",
            TextureFormat::X8R8G8B8 => "palette texture",
        };
        self.probe.check_resource(kind)?;

        let pitch = width as usize * format.bytes_per_texel() + ROW_PADDING;
        let data = vec![0; pitch * height as usize];
        let slot = {
            let mut state = self.probe.state();
            state.textures.push(TextureSnapshot {
                width,
                height,
                format,
                pitch,
                data: data.clone(),
                live: true,
            });
            state.textures.len() - 1
        };
        self.probe.object_created();

        Ok(HeadlessTexture {
            id: self.allocate_id(),
            probe: self.probe.clone(),
            slot,
            width,
            height,
            format,
            pitch,
            data,
            locked: None,
        })
    }

    fn create_pixel_program(&mut self, blob: &[u8]) -> Result<HeadlessProgram, GpuError> {
        self.probe.check_resource("pixel program")?;
        if blob.is_empty() {
            return Err(GpuError::ResourceCreation {
                resource: "pixel program",
                reason: "empty program blob".to_string(),
            });
        }
        self.probe.object_created();
        Ok(HeadlessProgram {
            id: self.allocate_id(),
            probe: self.probe.clone(),
        })
    }

    fn set_vertex_format(&mut self) -> Result<(), GpuError> {
        self.probe.check_binding("vertex format")?;
        self.bindings.vertex_format = true;
        Ok(())
    }

    fn set_stream_source(
        &mut self,
        buffer: &HeadlessVertexBuffer,
        stride: usize,
    ) -> Result<(), GpuError> {
        self.probe.check_binding("stream source")?;
        if stride == 0 || buffer.data.len() % stride != 0 {
            return Err(GpuError::Binding("stream source"));
        }
        self.bindings.stream = Some(buffer.id);
        Ok(())
    }

    fn set_texture(&mut self, stage: u32, texture: &HeadlessTexture) -> Result<(), GpuError> {
        self.probe.check_binding("texture")?;
        let slot = self
            .bindings
            .textures
            .get_mut(stage as usize)
            .ok_or(GpuError::Binding("texture stage"))?;
        *slot = Some(texture.id);
        Ok(())
    }

    fn set_pixel_program(&mut self, program: &HeadlessProgram) -> Result<(), GpuError> {
        self.probe.check_binding("pixel program")?;
        self.bindings.program = Some(program.id);
        Ok(())
    }

    fn set_viewport(&mut self, viewport: Viewport) -> Result<(), GpuError> {
        self.probe.check_binding("viewport")?;
        self.bindings.viewport = Some(viewport);
        self.probe.state().viewport = Some(viewport);
        Ok(())
    }

    fn pixel_center_bias(&self) -> f32 {
        self.probe.state().pixel_center_bias
    }

    fn test_cooperative_level(&mut self) -> DeviceStatus {
        self.probe.state().status
    }

    fn reset(&mut self, params: &PresentParams) -> Result<(), GpuError> {
        let mut state = self.probe.state();
        state.reset_attempts += 1;
        if state.fail_resets {
            return Err(GpuError::Reset("scripted failure".to_string()));
        }
        state.resets += 1;
        state.status = DeviceStatus::Ok;
        state.back_buffer = Some(*params);
        drop(state);

        // Resetting the swap chain drops every binding
        self.bindings = Bindings::default();
        Ok(())
    }

    fn draw_triangle_strip(&mut self, primitive_count: u32) -> Result<(), GpuError> {
        if !self.bindings.complete() {
            return Err(GpuError::Draw("pipeline state incomplete".to_string()));
        }
        if primitive_count != 2 {
            return Err(GpuError::Draw(format!(
                "expected 2 primitives, got {}",
                primitive_count
            )));
        }
        self.probe.state().draws += 1;
        Ok(())
    }

    fn present(&mut self) -> Result<(), GpuError> {
        let mut state = self.probe.state();
        if state.status != DeviceStatus::Ok {
            return Err(GpuError::DeviceLost);
        }
        state.presents += 1;
        Ok(())
    }

    fn release(self) -> Result<(), GpuError> {
        let refs = {
            let mut state = self.probe.state();
            state.device_releases += 1;
            state.outstanding_device_refs
        };
        if refs > 0 {
            return Err(GpuError::OutstandingReferences(refs));
        }
        Ok(())
    }
}

impl Drop for HeadlessDevice {
    fn drop(&mut self) {
        self.probe.object_dropped();
    }
}

/// Headless vertex buffer
#[derive(Debug)]
pub struct HeadlessVertexBuffer {
    id: u64,
    probe: HeadlessProbe,
    data: Vec<u8>,
    locked: bool,
}

impl Lockable for HeadlessVertexBuffer {
    fn lock(&mut self, _rect: Option<Rect>) -> Result<(), GpuError> {
        if self.probe.state().fail_locks {
            return Err(GpuError::Lock("scripted failure".to_string()));
        }
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
        if !self.locked {
            return;
        }
        self.locked = false;

        let mut state = self.probe.state();
        state.vertex_uploads += 1;
        if let Ok(vertices) = bytemuck::try_pod_read_unaligned(&self.data) {
            state.vertices = Some(vertices);
        }
    }
}

impl Drop for HeadlessVertexBuffer {
    fn drop(&mut self) {
        self.probe.object_dropped();
    }
}

/// Headless texture with a padded row pitch
#[derive(Debug)]
pub struct HeadlessTexture {
    id: u64,
    probe: HeadlessProbe,
    slot: usize,
    width: u32,
    height: u32,
    format: TextureFormat,
    pitch: usize,
    data: Vec<u8>,
    locked: Option<Rect>,
}

impl Lockable for HeadlessTexture {
    fn lock(&mut self, rect: Option<Rect>) -> Result<(), GpuError> {
        if self.probe.state().fail_locks {
            return Err(GpuError::Lock("scripted failure".to_string()));
        }
        if self.locked.is_some() {
            return Err(GpuError::AlreadyLocked);
        }
        let rect = rect.unwrap_or(Rect::from_size(self.width, self.height));
        if rect.x + rect.width > self.width || rect.y + rect.height > self.height {
            return Err(GpuError::LockOutOfBounds);
        }
        self.locked = Some(rect);
        Ok(())
    }

    fn mapped(&mut self) -> Option<Mapped<'_>> {
        let rect = self.locked?;
        let start = rect.y as usize * self.pitch + rect.x as usize * self.format.bytes_per_texel();
        Some(Mapped {
            bits: &mut self.data[start..],
            pitch: self.pitch,
        })
    }

    fn unlock(&mut self) {
        if self.locked.take().is_none() {
            return;
        }
        let mut state = self.probe.state();
        if let Some(snapshot) = state.textures.get_mut(self.slot) {
            snapshot.data.copy_from_slice(&self.data);
        }
    }
}

impl Drop for HeadlessTexture {
    fn drop(&mut self) {
        {
            let mut state = self.probe.state();
            if let Some(snapshot) = state.textures.get_mut(self.slot) {
                snapshot.live = false;
            }
        }
        self.probe.object_dropped();
    }
}

/// Headless pixel-stage program
#[derive(Debug)]
pub struct HeadlessProgram {
    id: u64,
    probe: HeadlessProbe,
}

impl Drop for HeadlessProgram {
    fn drop(&mut self) {
        self.probe.object_dropped();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::LockGuard;

    fn device(probe: &HeadlessProbe) -> HeadlessDevice {
        let mut backend = HeadlessBackend::new(probe.clone());
        let mut factory = backend.create_factory().unwrap();
        let params = PresentParams::new(true, false, (640, 480));
        let device = factory
            .create_device(DeviceProfile::HardwarePure, &params)
            .unwrap();
        factory.release().unwrap();
        device
    }

    #[test]
    fn test_failing_profile() {
        let probe = HeadlessProbe::new();
        probe.fail_profile(DeviceProfile::HardwarePure);

        let mut factory = HeadlessBackend::new(probe.clone()).create_factory().unwrap();
        let params = PresentParams::new(true, false, (640, 480));

        assert!(factory
            .create_device(DeviceProfile::HardwarePure, &params)
            .is_err());
        assert!(factory.create_device(DeviceProfile::Hardware, &params).is_ok());
        assert_eq!(
            probe.device_attempts(),
            vec![DeviceProfile::HardwarePure, DeviceProfile::Hardware]
        );
    }

    #[test]
    fn test_live_object_tracking() {
        let probe = HeadlessProbe::new();
        {
            let mut device = device(&probe);
            let _texture = device.create_texture(4, 4, TextureFormat::L8).unwrap();
            assert_eq!(probe.live_objects(), 2);
        }
        assert_eq!(probe.live_objects(), 0);
    }

    #[test]
    fn test_texture_pitch_and_upload() {
        let probe = HeadlessProbe::new();
        let mut device = device(&probe);
        let mut texture = device.create_texture(4, 2, TextureFormat::L8).unwrap();

        {
            let mut guard = LockGuard::new(&mut texture, Some(Rect::from_size(4, 2))).unwrap();
            let mapped = guard.mapped().unwrap();
            assert_eq!(mapped.pitch, 4 + ROW_PADDING);
            mapped.bits[..4].copy_from_slice(&[1, 2, 3, 4]);
            mapped.bits[mapped.pitch..mapped.pitch + 4].copy_from_slice(&[5, 6, 7, 8]);
        }

        let snapshot = probe.source_texture().unwrap();
        assert_eq!(snapshot.row(0), &[1, 2, 3, 4]);
        assert_eq!(snapshot.row(1), &[5, 6, 7, 8]);
    }

    #[test]
    fn test_lock_out_of_bounds() {
        let probe = HeadlessProbe::new();
        let mut device = device(&probe);
        let mut texture = device.create_texture(4, 4, TextureFormat::L8).unwrap();
        assert!(matches!(
            texture.lock(Some(Rect::from_size(5, 4))),
            Err(GpuError::LockOutOfBounds)
        ));
    }

    #[test]
    fn test_draw_requires_complete_state() {
        let probe = HeadlessProbe::new();
        let mut device = device(&probe);
        assert!(device.draw_triangle_strip(2).is_err());
        assert_eq!(probe.draws(), 0);
    }

    #[test]
    fn test_release_reports_outstanding_refs() {
        let probe = HeadlessProbe::new();
        probe.set_outstanding_device_refs(1);
        let device = device(&probe);
        assert_eq!(device.release(), Err(GpuError::OutstandingReferences(1)));
        assert_eq!(probe.live_objects(), 0);
    }

    #[test]
    fn test_reset_restores_status() {
        let probe = HeadlessProbe::new();
        let mut device = device(&probe);
        probe.set_status(DeviceStatus::NotReset);
        assert_eq!(device.test_cooperative_level(), DeviceStatus::NotReset);

        let params = PresentParams::new(true, false, (800, 600));
        device.reset(&params).unwrap();
        assert_eq!(device.test_cooperative_level(), DeviceStatus::Ok);
        assert_eq!(probe.resets(), 1);
    }
}
