// Device session - Owns the factory, the device and its resource set
//
// A session is either fully active (factory, device and every resource
// present) or fully released. `create` always starts from the released state
// and rolls back on any failure, so a partial session is never observable.

use super::resources::{ResourceSet, QUAD_PRIMITIVES};
use crate::geometry::ScaleState;
use crate::gpu::{
    DeviceOf, DeviceProfile, DeviceStatus, GpuBackend, GpuDevice, GpuError, GpuFactory,
    PresentParams, PALETTE_PROGRAM,
};
use crate::shared::{DisplaySettings, FrameData, Palette, SharedState};
use std::borrow::Cow;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors raised while creating, resetting or releasing a session
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("graphics API unavailable: {0}")]
    Unavailable(GpuError),
    #[error("no device profile could be created: {0}")]
    NoDevice(GpuError),
    #[error("resource allocation failed: {0}")]
    Resources(GpuError),
    #[error("device state setup failed: {0}")]
    DeviceState(GpuError),
    #[error("device reset failed: {0}")]
    Reset(GpuError),
    #[error("session is not active")]
    Inactive,
    #[error("teardown incomplete: {0}")]
    Teardown(GpuError),
}

struct ActiveDevice<D: GpuDevice> {
    // Resources are declared first so they drop before the device
    resources: ResourceSet<D>,
    device: D,
    profile: DeviceProfile,
}

/// Device session driven by the frame loop
///
/// Confined to the presenter thread; nothing in it needs to be `Sync`.
pub struct DeviceSession<B: GpuBackend> {
    backend: B,
    shared: Arc<SharedState>,
    program: Cow<'static, [u8]>,
    factory: Option<B::Factory>,
    active: Option<ActiveDevice<DeviceOf<B>>>,
    settings: DisplaySettings,
    params: PresentParams,
    geometry_updates: u64,
}

impl<B: GpuBackend> DeviceSession<B> {
    /// Create a released session using the default palette program
    ///
    /// # Arguments
    /// * `backend` - Graphics API entry point
    /// * `shared` - State shared with the producer and the window
    pub fn new(backend: B, shared: Arc<SharedState>) -> Self {
        Self::with_program(backend, shared, PALETTE_PROGRAM)
    }

    /// Create a released session using a custom pixel-stage program blob
    pub fn with_program(
        backend: B,
        shared: Arc<SharedState>,
        program: impl Into<Cow<'static, [u8]>>,
    ) -> Self {
        let settings = shared.settings();
        let params = PresentParams::new(settings.windowed, settings.vsync, settings.output_size);
        Self {
            backend,
            shared,
            program: program.into(),
            factory: None,
            active: None,
            settings,
            params,
            geometry_updates: 0,
        }
    }

    /// Create the device and its resources
    ///
    /// Releases any previous session first. Device profiles are tried from
    /// most to least capable; the first one that succeeds is kept. On any
    /// failure everything created so far is released again.
    ///
    /// A previous session that reports outstanding references does not stop
    /// recreation: its objects have been dropped regardless.
    ///
    /// The new textures start out blank, so the shared surface and palette
    /// are marked dirty to be copied again on the next frame.
    pub fn create(&mut self) -> Result<(), SessionError> {
        if let Err(e) = self.release() {
            warn!(error = %e, "previous session did not release cleanly");
        }

        self.settings = self.shared.settings();
        self.params = PresentParams::new(
            self.settings.windowed,
            self.settings.vsync,
            self.settings.output_size,
        );

        let mut factory = self
            .backend
            .create_factory()
            .map_err(SessionError::Unavailable)?;

        let (mut device, profile) = match Self::create_device(&mut factory, &self.params) {
            Ok(created) => created,
            Err(e) => {
                release_factory(factory);
                return Err(e);
            }
        };

        let resources = match ResourceSet::allocate(
            &mut device,
            self.settings.logical_size,
            &self.program,
        ) {
            Ok(resources) => resources,
            Err(e) => {
                release_device(device);
                release_factory(factory);
                return Err(SessionError::Resources(e));
            }
        };

        self.factory = Some(factory);
        self.active = Some(ActiveDevice {
            resources,
            device,
            profile,
        });

        let in_cutscene = self.shared.in_cutscene.load(Ordering::SeqCst);
        self.update_vertices(in_cutscene);

        if let Err(e) = self.apply_device_state() {
            if let Err(release_err) = self.release() {
                warn!(error = %release_err, "rollback after failed setup was incomplete");
            }
            return Err(e);
        }

        info!(
            ?profile,
            logical = ?self.settings.logical_size,
            output = ?self.settings.output_size,
            windowed = self.settings.windowed,
            "device session created"
        );

        self.shared.surface_updated.store(true, Ordering::SeqCst);
        self.shared.palette_updated.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn create_device(
        factory: &mut B::Factory,
        params: &PresentParams,
    ) -> Result<(DeviceOf<B>, DeviceProfile), SessionError> {
        let mut last_error = GpuError::Unavailable("no device profiles".to_string());

        for profile in DeviceProfile::ATTEMPT_ORDER {
            match factory.create_device(profile, params) {
                Ok(device) => return Ok((device, profile)),
                Err(e) => {
                    debug!(?profile, error = %e, "device profile rejected");
                    last_error = e;
                }
            }
        }

        Err(SessionError::NoDevice(last_error))
    }

    /// Bind the vertex format, stream, textures, program and viewport
    pub fn apply_device_state(&mut self) -> Result<(), SessionError> {
        let active = self.active.as_mut().ok_or(SessionError::Inactive)?;
        active
            .resources
            .bind(&mut active.device, self.settings.viewport)
            .map_err(SessionError::DeviceState)
    }

    /// Reset a lost-but-resettable device and restore its state
    ///
    /// Resources survive a reset; only the swap chain and bindings are redone.
    pub fn reset(&mut self) -> Result<(), SessionError> {
        let active = self.active.as_mut().ok_or(SessionError::Inactive)?;

        let current = self.shared.settings();
        self.params = PresentParams::new(current.windowed, current.vsync, current.output_size);
        active
            .device
            .reset(&self.params)
            .map_err(SessionError::Reset)?;

        self.apply_device_state()
    }

    /// Release resources, device and factory, in that order
    ///
    /// Safe to call on a released session. Everything is dropped even when
    /// the device or factory reports outstanding references; the first such
    /// report is returned.
    pub fn release(&mut self) -> Result<(), SessionError> {
        let mut result = Ok(());

        if let Some(ActiveDevice {
            resources, device, ..
        }) = self.active.take()
        {
            drop(resources);
            if let Err(e) = device.release() {
                warn!(error = %e, "device release incomplete");
                result = Err(SessionError::Teardown(e));
            }
        }

        if let Some(factory) = self.factory.take() {
            if let Err(e) = factory.release() {
                warn!(error = %e, "factory release incomplete");
                if result.is_ok() {
                    result = Err(SessionError::Teardown(e));
                }
            }
        }

        result
    }

    /// Recompute the quad for normal or cutscene scaling and upload it
    ///
    /// A failed vertex buffer lock skips the update.
    pub fn update_vertices(&mut self, in_cutscene: bool) {
        let Some(active) = self.active.as_mut() else {
            return;
        };

        let cutscene = self.settings.cutscene_scale();
        let bias = active.device.pixel_center_bias();
        self.geometry_updates += 1;

        if let Err(e) = active.resources.write_quad(
            self.settings.viewport,
            in_cutscene.then_some(&cutscene),
            bias,
        ) {
            debug!(error = %e, "vertex update skipped");
        }
    }

    /// Copy the framebuffer into the source texture
    pub fn upload_surface(&mut self, frame: &FrameData) -> Result<(), GpuError> {
        let active = self.active.as_mut().ok_or(GpuError::DeviceLost)?;
        active.resources.upload_surface(frame)
    }

    /// Copy the palette into the palette texture
    pub fn upload_palette(&mut self, palette: &Palette) -> Result<(), GpuError> {
        let active = self.active.as_mut().ok_or(GpuError::DeviceLost)?;
        active.resources.upload_palette(palette)
    }

    /// Current device health, `None` when released
    pub fn device_status(&mut self) -> Option<DeviceStatus> {
        self.active
            .as_mut()
            .map(|active| active.device.test_cooperative_level())
    }

    /// Draw the quad and present it
    pub fn draw_and_present(&mut self) -> Result<(), GpuError> {
        let active = self.active.as_mut().ok_or(GpuError::DeviceLost)?;
        active.device.draw_triangle_strip(QUAD_PRIMITIVES)?;
        active.device.present()
    }

    /// Whether the device and its resources exist
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Profile of the active device
    pub fn profile(&self) -> Option<DeviceProfile> {
        self.active.as_ref().map(|active| active.profile)
    }

    /// Base scale of the active resource set
    pub fn scale(&self) -> Option<ScaleState> {
        self.active.as_ref().map(|active| active.resources.scale())
    }

    /// Source texture size of the active resource set
    pub fn texture_size(&self) -> Option<(u32, u32)> {
        self.active.as_ref().map(|active| active.resources.texture_size())
    }

    /// Present parameters of the last create or reset
    pub fn params(&self) -> &PresentParams {
        &self.params
    }

    /// Display settings captured at the last create
    pub fn settings(&self) -> &DisplaySettings {
        &self.settings
    }

    /// Number of quad recomputations so far
    pub fn geometry_updates(&self) -> u64 {
        self.geometry_updates
    }

    /// Shared state this session presents from
    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// Graphics API entry point
    pub fn backend(&self) -> &B {
        &self.backend
    }
}

impl<B: GpuBackend> Drop for DeviceSession<B> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "session dropped with outstanding references");
        }
    }
}

fn release_device<D: GpuDevice>(device: D) {
    if let Err(e) = device.release() {
        warn!(error = %e, "device release incomplete");
    }
}

fn release_factory<F: GpuFactory>(factory: F) {
    if let Err(e) = factory.release() {
        warn!(error = %e, "factory release incomplete");
    }
}
